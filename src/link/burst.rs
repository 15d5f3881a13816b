//! Burst engine: the deterministic full-state sync sent to a new peer.
//!
//! The order is fixed because later stages depend on earlier ones
//! existing on the receiving side: version, then the server tree, then
//! users (who need their servers), then channels (which need their users),
//! then network bans, then the end-of-burst marker. Receivers handle every
//! entry idempotently — a slow burst can race live relayed traffic
//! describing the same objects, so an already-known name is skipped, not
//! an error.

use tracing::debug;

use super::message::Message;
use super::registry::{Channel, User, XLineCategory};
use super::server::ServerState;
use super::session::SessionHandle;

/// Longest member list carried on one FJOIN line before it is continued
/// on the next.
const FJOIN_LINE_LIMIT: usize = 448;

/// Seam for opaque per-object state owned by external subsystems. During
/// a burst each registered user and channel is offered to the
/// implementation, which returns key/value pairs to ship as METADATA;
/// inbound METADATA is handed back through [`MetadataSync::absorb`].
pub trait MetadataSync: Send + Sync {
    fn user_metadata(&self, user: &User) -> Vec<(String, String)> {
        let _ = user;
        Vec::new()
    }

    fn channel_metadata(&self, channel: &Channel) -> Vec<(String, String)> {
        let _ = channel;
        Vec::new()
    }

    fn absorb(&self, target: &str, key: &str, value: &str) {
        let _ = (target, key, value);
    }
}

/// Default implementation with no extension state.
#[derive(Debug, Default)]
pub struct NoMetadata;

impl MetadataSync for NoMetadata {}

/// Send the full burst sequence to a freshly authenticated peer.
pub fn send_burst(st: &ServerState, peer: &str, handle: &SessionHandle) {
    let local = st.local_name().to_owned();
    st.oper_notice(format!("Bursting to {peer}."));

    handle.send(Message::new("BURST", vec![]));
    handle.send(Message::with_source(
        &local,
        "VERSION",
        vec![st.version().to_owned()],
    ));

    send_servers(st, peer, handle, &local, 1);
    send_users(st, handle);
    send_channels(st, handle, &local);
    send_xlines(st, handle, &local);

    handle.send(Message::new("ENDBURST", vec![]));
    st.oper_notice(format!("Finished bursting to {peer}."));
}

/// Recursively describe the tree under `from`, skipping the peer being
/// bursted. Hop counts are relative: only their monotonic increase with
/// distance matters, since every receiver renormalizes against itself.
fn send_servers(st: &ServerState, peer: &str, handle: &SessionHandle, from: &str, hops: u32) {
    let Some(node) = st.tree.find(from) else { return };
    for child in node.children() {
        if child.eq_ignore_ascii_case(peer) {
            continue;
        }
        let Some(child_node) = st.tree.find(child) else {
            continue;
        };
        handle.send(Message::with_source(
            &node.name,
            "SERVER",
            vec![
                child_node.name.clone(),
                "*".into(),
                hops.to_string(),
                child_node.description.clone(),
            ],
        ));
        handle.send(Message::with_source(
            &child_node.name,
            "VERSION",
            vec![child_node.version.clone()],
        ));
        send_servers(st, peer, handle, child, hops + 1);
    }
}

/// Every fully-registered user: the eight-field introduction, an
/// OPERTYPE frame for operators, then any extension metadata.
fn send_users(st: &ServerState, handle: &SessionHandle) {
    for user in st.users.iter() {
        handle.send(Message::with_source(
            &user.server,
            "NICK",
            vec![
                user.signon.to_string(),
                user.nick.clone(),
                user.host.clone(),
                user.display_host.clone(),
                user.ident.clone(),
                format!("+{}", user.modes),
                user.ip.clone(),
                user.realname.clone(),
            ],
        ));
        if user.is_oper() {
            let class = user.oper_type.clone().unwrap_or_else(|| "oper".into());
            handle.send(Message::with_source(&user.nick, "OPERTYPE", vec![class]));
        }
        for (key, value) in st.metadata.user_metadata(user) {
            handle.send(Message::with_source(
                st.local_name(),
                "METADATA",
                vec![user.nick.clone(), key, value],
            ));
        }
    }
    debug!(users = st.users.len(), "burst: users sent");
}

/// Batched membership for one channel, continued across lines whenever the
/// member list outgrows the line limit.
fn send_members(channel: &Channel, handle: &SessionHandle, local: &str) {
    let header_params = |channel: &Channel| {
        vec![channel.name.clone(), channel.ts.to_string()]
    };
    let mut params = header_params(channel);
    let mut used = 0usize;
    for (nick, rank) in channel.members() {
        let token = format!("{}{}", rank.sigil(), nick);
        used += token.len() + 1;
        params.push(token);
        if used > FJOIN_LINE_LIMIT {
            handle.send(Message::with_source(local, "FJOIN", std::mem::take(&mut params)));
            params = header_params(channel);
            used = 0;
        }
    }
    if params.len() > 2 {
        handle.send(Message::with_source(local, "FJOIN", params));
    }
}

/// Channels: membership, modes, topic, bans, extension metadata.
fn send_channels(st: &ServerState, handle: &SessionHandle, local: &str) {
    for channel in st.channels.iter() {
        send_members(channel, handle, local);

        if !channel.modes.is_empty() || channel.key.is_some() {
            let mut params = vec![channel.name.clone(), format!("+{}", channel.modes)];
            if let Some(key) = &channel.key {
                params.push(key.clone());
            }
            handle.send(Message::with_source(local, "FMODE", params));
        }
        if let Some(topic) = &channel.topic {
            handle.send(Message::with_source(
                local,
                "FTOPIC",
                vec![
                    channel.name.clone(),
                    topic.set_at.to_string(),
                    topic.set_by.clone(),
                    topic.text.clone(),
                ],
            ));
        }
        for ban in &channel.bans {
            handle.send(Message::with_source(
                local,
                "FMODE",
                vec![channel.name.clone(), "+b".into(), ban.mask.clone()],
            ));
        }
        for (key, value) in st.metadata.channel_metadata(channel) {
            handle.send(Message::with_source(
                local,
                "METADATA",
                vec![channel.name.clone(), key, value],
            ));
        }
    }
    debug!(channels = st.channels.len(), "burst: channels sent");
}

/// Network bans, category by category, original set-time preserved so the
/// receiver reconstructs the same absolute expiry.
fn send_xlines(st: &ServerState, handle: &SessionHandle, local: &str) {
    for category in XLineCategory::ALL {
        for line in st.xlines.by_category(category) {
            handle.send(Message::with_source(
                local,
                "ADDLINE",
                vec![
                    category.tag().to_owned(),
                    line.mask.clone(),
                    line.source.clone(),
                    line.set_time.to_string(),
                    line.duration.to_string(),
                    line.reason.clone(),
                ],
            ));
        }
    }
}
