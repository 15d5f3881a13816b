//! Propagation hooks for local state changes.
//!
//! The client-facing layer calls these when something happens on THIS
//! server: a user registers, joins a channel, opers up, sets a ban. Each
//! hook applies the mutation to the shared registries and announces it to
//! the network through the router. Changes originating from remote
//! servers arrive through the command interpreter instead, which is why
//! every hook ignores users not homed here — that is what keeps relayed
//! traffic from echoing forever.

use tracing::debug;

use super::registry::{MemberRank, Topic, User, XLine};
use super::router;
use super::server::{now_secs, ServerState};

fn is_local(st: &ServerState, user: &User) -> bool {
    st.tree.is_root(&user.server)
}

/// A user finished registering locally: introduce them network-wide with
/// the full eight-field form.
pub fn user_connected(st: &mut ServerState, user: User) -> bool {
    if !st.tree.is_root(&user.server) {
        return false;
    }
    let params = vec![
        user.signon.to_string(),
        user.nick.clone(),
        user.host.clone(),
        user.display_host.clone(),
        user.ident.clone(),
        format!("+{}", user.modes),
        user.ip.clone(),
        user.realname.clone(),
    ];
    if st.users.insert(user).is_err() {
        return false;
    }
    let local = st.local_name().to_owned();
    router::one_to_many(&st.tree, &local, "NICK", params);
    if let Some(root) = st.tree.find_mut(&local) {
        root.user_count += 1;
    }
    true
}

/// A local user quit.
pub fn user_quit(st: &mut ServerState, nick: &str, reason: &str) {
    let Some(user) = st.users.find(nick) else { return };
    if !is_local(st, user) {
        return;
    }
    let nick = user.nick.clone();
    router::one_to_many(&st.tree, &nick, "QUIT", vec![reason.to_owned()]);
    st.users.remove(&nick);
    st.channels.part_all(&nick);
    let local = st.local_name().to_owned();
    if let Some(root) = st.tree.find_mut(&local) {
        root.user_count = root.user_count.saturating_sub(1);
    }
}

/// A local user changed nick.
pub fn nick_changed(st: &mut ServerState, old: &str, new: &str) {
    let Some(user) = st.users.find(old) else { return };
    if !is_local(st, user) {
        return;
    }
    if st.users.rename(old, new).is_err() {
        debug!(%old, %new, "local nick change collided, not propagating");
        return;
    }
    st.channels.rename_member(old, new);
    router::one_to_many(&st.tree, old, "NICK", vec![new.to_owned()]);
}

/// A local user joined a channel. The first member establishes the
/// channel's timestamp network-wide with a forced join; later members
/// ride a plain JOIN (with the key when one is set).
pub fn user_joined(st: &mut ServerState, nick: &str, channel: &str) {
    let Some(user) = st.users.find(nick) else { return };
    if !is_local(st, user) {
        return;
    }
    let nick = user.nick.clone();
    let existing = st.channels.find(channel).map(|c| (c.ts, c.key.clone()));
    match existing {
        None => {
            let ts = now_secs();
            let chan = st.channels.get_or_create(channel, ts);
            chan.join(&nick, MemberRank::Op);
            let local = st.local_name().to_owned();
            router::one_to_many(
                &st.tree,
                &local,
                "FJOIN",
                vec![channel.to_owned(), ts.to_string(), format!("@{nick}")],
            );
        }
        Some((ts, key)) => {
            st.channels
                .get_or_create(channel, ts)
                .join(&nick, MemberRank::Normal);
            let mut params = vec![channel.to_owned()];
            if let Some(key) = key {
                params.push(key);
            }
            router::one_to_many(&st.tree, &nick, "JOIN", params);
        }
    }
}

/// A local user left a channel.
pub fn user_parted(st: &mut ServerState, nick: &str, channel: &str, reason: &str) {
    let Some(user) = st.users.find(nick) else { return };
    if !is_local(st, user) {
        return;
    }
    let nick = user.nick.clone();
    if let Some(chan) = st.channels.find_mut(channel) {
        chan.part(&nick);
    }
    router::one_to_many(
        &st.tree,
        &nick,
        "PART",
        vec![channel.to_owned(), reason.to_owned()],
    );
}

/// A local operator kicked someone.
pub fn user_kicked(st: &mut ServerState, source: &str, victim: &str, channel: &str, reason: &str) {
    let Some(user) = st.users.find(source) else { return };
    if !is_local(st, user) {
        return;
    }
    if let Some(chan) = st.channels.find_mut(channel) {
        chan.part(victim);
    }
    router::one_to_many(
        &st.tree,
        source,
        "KICK",
        vec![channel.to_owned(), victim.to_owned(), reason.to_owned()],
    );
}

/// A local user set a channel topic.
pub fn topic_changed(st: &mut ServerState, nick: &str, channel: &str, topic: &str) {
    let Some(user) = st.users.find(nick) else { return };
    if !is_local(st, user) {
        return;
    }
    let nick = user.nick.clone();
    if let Some(chan) = st.channels.find_mut(channel) {
        chan.topic = Some(Topic {
            text: topic.to_owned(),
            set_by: nick.clone(),
            set_at: now_secs(),
        });
    }
    router::one_to_many(
        &st.tree,
        &nick,
        "TOPIC",
        vec![channel.to_owned(), topic.to_owned()],
    );
}

/// A local mode change (user or channel target).
pub fn mode_changed(st: &mut ServerState, nick: &str, target: &str, modes: Vec<String>) {
    let Some(user) = st.users.find(nick) else { return };
    if !is_local(st, user) {
        return;
    }
    let nick = user.nick.clone();
    if target.starts_with('#') {
        if let Some(chan) = st.channels.find_mut(target) {
            chan.apply_modes(&nick, now_secs(), &modes);
        }
    }
    let mut params = vec![target.to_owned()];
    params.extend(modes);
    router::one_to_many(&st.tree, &nick, "MODE", params);
}

/// A local user gained operator status. The wire has no direct `+o`;
/// OPERTYPE is what makes the mode change on the far side.
pub fn user_opered(st: &mut ServerState, nick: &str, class: &str) {
    let Some(user) = st.users.find_mut(nick) else { return };
    let nick = user.nick.clone();
    let server = user.server.clone();
    user.oper_type = Some(class.to_owned());
    if !user.modes.contains('o') {
        user.modes.push('o');
    }
    if !st.tree.is_root(&server) {
        return;
    }
    router::one_to_many(&st.tree, &nick, "OPERTYPE", vec![class.to_owned()]);
}

/// A local user's displayed host changed.
pub fn host_changed(st: &mut ServerState, nick: &str, host: &str) {
    let Some(user) = st.users.find_mut(nick) else { return };
    let local = st.tree.is_root(&user.server);
    let nick = user.nick.clone();
    user.display_host = host.to_owned();
    if local {
        router::one_to_many(&st.tree, &nick, "FHOST", vec![host.to_owned()]);
    }
}

/// A local user's real name changed.
pub fn name_changed(st: &mut ServerState, nick: &str, realname: &str) {
    let Some(user) = st.users.find_mut(nick) else { return };
    let local = st.tree.is_root(&user.server);
    let nick = user.nick.clone();
    user.realname = realname.to_owned();
    if local {
        router::one_to_many(&st.tree, &nick, "FNAME", vec![realname.to_owned()]);
    }
}

/// A local operator killed a user (possibly remote).
pub fn user_killed(st: &mut ServerState, source: &str, victim: &str, reason: &str) {
    let Some(user) = st.users.find(source) else { return };
    if !is_local(st, user) {
        return;
    }
    let source = user.nick.clone();
    router::one_to_many(
        &st.tree,
        &source,
        "KILL",
        vec![victim.to_owned(), reason.to_owned()],
    );
    if let Some(victim_user) = st.users.remove(victim) {
        st.channels.part_all(victim);
        if let Some(node) = st.tree.find_mut(&victim_user.server) {
            node.user_count = node.user_count.saturating_sub(1);
        }
    }
}

/// A local user invited someone.
pub fn user_invited(st: &mut ServerState, source: &str, nick: &str, channel: &str) {
    let Some(user) = st.users.find(source) else { return };
    if !is_local(st, user) {
        return;
    }
    let source = user.nick.clone();
    router::one_to_many(
        &st.tree,
        &source,
        "INVITE",
        vec![nick.to_owned(), channel.to_owned()],
    );
}

/// A local operator sent a WALLOPS.
pub fn wallops(st: &mut ServerState, source: &str, text: &str) {
    let Some(user) = st.users.find(source) else { return };
    if !is_local(st, user) {
        return;
    }
    let source = user.nick.clone();
    router::one_to_many(&st.tree, &source, "WALLOPS", vec![text.to_owned()]);
}

/// A network ban was set locally: record it and propagate with the
/// original set-time so every server computes the same absolute expiry.
pub fn xline_added(st: &mut ServerState, line: XLine) {
    let params = vec![
        line.category.tag().to_owned(),
        line.mask.clone(),
        line.source.clone(),
        line.set_time.to_string(),
        line.duration.to_string(),
        line.reason.clone(),
    ];
    st.xlines.add(line);
    let local = st.local_name().to_owned();
    router::one_to_many(&st.tree, &local, "ADDLINE", params);
}

/// Kick off a remote-idle round trip for a WHOIS on a remote user. The
/// answer comes back as [`super::server::LinkEvent::WhoisIdle`].
pub fn whois_idle_request(st: &ServerState, requester: &str, target: &str) -> bool {
    let Some(user) = st.users.find(target) else {
        return false;
    };
    if st.tree.is_root(&user.server) {
        return false; // local target, nothing to ask the network
    }
    router::one_to_one(
        &st.tree,
        requester,
        "IDLE",
        vec![user.nick.clone()],
        &user.server.clone(),
    )
}
