//! Fan-out primitives for routing protocol lines across the tree.
//!
//! Every primitive writes only to direct children of the local root; the
//! tree's route precomputation makes any destination reachable through
//! exactly one of them. The local root is never a write target, an
//! unroutable destination is a silent no-op (the network may be
//! mid-convergence), and a failed write is left to the owning connection
//! to treat as a link fault.

use tracing::trace;

use super::message::Message;
use super::registry::{ChannelRegistry, UserRegistry};
use super::tree::ServerTree;

/// Send one line toward a single destination server. Returns whether a
/// route existed; an unknown destination is not an error.
pub fn one_to_one(
    tree: &ServerTree,
    source: &str,
    command: &str,
    params: Vec<String>,
    target: &str,
) -> bool {
    let Some(route) = tree.route_for(target) else {
        trace!(%target, %command, "no route, dropping");
        return false;
    };
    if let Some(handle) = &route.handle {
        handle.send(Message::with_source(source, command, params));
    }
    true
}

/// Send one line to every directly-linked peer.
pub fn one_to_many(tree: &ServerTree, source: &str, command: &str, params: Vec<String>) {
    let msg = Message::with_source(source, command, params);
    for peer in tree.local_peers() {
        if let Some(handle) = &peer.handle {
            handle.send(msg.clone());
        }
    }
}

/// Send one line to every directly-linked peer except the one that leads
/// back to `omit` — traffic must never echo down its arrival path.
pub fn one_to_all_but_sender(
    tree: &ServerTree,
    source: &str,
    command: &str,
    params: Vec<String>,
    omit: &str,
) {
    let msg = Message::with_source(source, command, params);
    send_all_but(tree, &msg, omit);
}

fn send_all_but(tree: &ServerTree, msg: &Message, omit: &str) {
    let omit_route = tree.route_for(omit).map(|r| r.name.clone());
    for peer in tree.local_peers() {
        if peer.name.eq_ignore_ascii_case(omit) {
            continue;
        }
        if let Some(route) = &omit_route {
            if peer.name.eq_ignore_ascii_case(route) {
                continue;
            }
        }
        if let Some(handle) = &peer.handle {
            handle.send(msg.clone());
        }
    }
}

/// Forward an already-assembled user line, pruning where the target allows.
///
/// A PRIVMSG/NOTICE to a single nick is routed one-to-one toward that
/// user's home server. One to a channel goes only to the direct peers with
/// at least one reachable member behind them. Anything else (mass targets,
/// unknown commands from trusted origins) floods to all-but-sender.
pub fn one_to_all_but_sender_raw(
    tree: &ServerTree,
    users: &UserRegistry,
    channels: &ChannelRegistry,
    msg: &Message,
    omit: &str,
) {
    if msg.command == "PRIVMSG" || msg.command == "NOTICE" {
        if let Some(target) = msg.params.first() {
            if target.starts_with('#') {
                if let Some(channel) = channels.find(target) {
                    let source = msg.prefix.clone().unwrap_or_default();
                    let omit_route = tree.route_for(omit).map(|r| r.name.clone());
                    for peer in peers_for_channel(tree, users, channel.members().map(|(n, _)| n.as_str())) {
                        if peer.eq_ignore_ascii_case(omit) {
                            continue;
                        }
                        if let Some(route) = &omit_route {
                            if peer.eq_ignore_ascii_case(route) {
                                continue;
                            }
                        }
                        one_to_one(
                            tree,
                            &source,
                            &msg.command,
                            msg.params.clone(),
                            &peer,
                        );
                    }
                    return;
                }
            } else if !target.starts_with('$') {
                if let (Some(user), Some(source)) = (users.find(target), msg.prefix.as_deref()) {
                    one_to_one(tree, source, &msg.command, msg.params.clone(), &user.server);
                    return;
                }
            }
        }
    }
    send_all_but(tree, msg, omit);
}

/// The distinct direct peers that can reach at least one of `members`.
fn peers_for_channel<'a>(
    tree: &ServerTree,
    users: &UserRegistry,
    members: impl Iterator<Item = &'a str>,
) -> Vec<String> {
    let mut peers: Vec<String> = Vec::new();
    for nick in members {
        let Some(user) = users.find(nick) else { continue };
        let Some(route) = tree.route_for(&user.server) else {
            continue;
        };
        if !peers.iter().any(|p| p.eq_ignore_ascii_case(&route.name)) {
            peers.push(route.name.clone());
        }
    }
    peers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::registry::{MemberRank, User};
    use crate::link::session::{SessionCommand, SessionHandle};
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    struct Net {
        tree: ServerTree,
        users: UserRegistry,
        channels: ChannelRegistry,
        taps: Vec<(String, mpsc::UnboundedReceiver<SessionCommand>)>,
    }

    /// alpha (root) with direct peers beta and delta; gamma hangs off beta.
    fn network() -> Net {
        let mut tree = ServerTree::new("alpha.tarn.test", "root", "tarn-0.1");
        let mut taps = Vec::new();
        for (id, peer) in ["beta.tarn.test", "delta.tarn.test"].iter().enumerate() {
            let (tx, rx) = mpsc::unbounded_channel();
            tree.insert_child(
                "alpha.tarn.test",
                peer,
                peer,
                Some(SessionHandle::new(id as u64 + 1, tx)),
            )
            .unwrap();
            taps.push((peer.to_string(), rx));
        }
        tree.insert_child("beta.tarn.test", "gamma.tarn.test", "gamma", None)
            .unwrap();
        Net {
            tree,
            users: UserRegistry::new(),
            channels: ChannelRegistry::new(),
            taps,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionCommand>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            if let SessionCommand::Line(msg) = cmd {
                out.push(msg);
            }
        }
        out
    }

    fn add_user(net: &mut Net, nick: &str, server: &str) {
        net.users
            .insert(User {
                nick: nick.into(),
                ident: nick.into(),
                host: "h".into(),
                display_host: "h".into(),
                ip: "10.0.0.9".into(),
                signon: 1,
                modes: String::new(),
                realname: nick.into(),
                server: server.into(),
                oper_type: None,
                idle_since: 1,
            })
            .unwrap();
    }

    #[test]
    fn one_to_one_follows_the_route() {
        let mut net = network();
        // gamma is reached through beta.
        assert!(one_to_one(
            &net.tree,
            "alpha.tarn.test",
            "PING",
            vec!["gamma.tarn.test".into()],
            "gamma.tarn.test",
        ));
        let beta = drain(&mut net.taps[0].1);
        assert_eq!(beta.len(), 1);
        assert_eq!(beta[0].command, "PING");
        assert!(drain(&mut net.taps[1].1).is_empty());
    }

    #[test]
    fn one_to_one_unknown_target_is_silent() {
        let mut net = network();
        assert!(!one_to_one(
            &net.tree,
            "alpha.tarn.test",
            "PING",
            vec![],
            "missing.tarn.test",
        ));
        assert!(drain(&mut net.taps[0].1).is_empty());
        assert!(drain(&mut net.taps[1].1).is_empty());
    }

    #[test]
    fn one_to_many_reaches_every_direct_peer() {
        let mut net = network();
        one_to_many(&net.tree, "alpha.tarn.test", "VERSION", vec!["v".into()]);
        assert_eq!(drain(&mut net.taps[0].1).len(), 1);
        assert_eq!(drain(&mut net.taps[1].1).len(), 1);
    }

    #[test]
    fn all_but_sender_omits_the_arrival_path() {
        let mut net = network();
        // Omitting gamma must skip beta (its route), not just gamma itself.
        one_to_all_but_sender(
            &net.tree,
            "gamma.tarn.test",
            "VERSION",
            vec!["v".into()],
            "gamma.tarn.test",
        );
        assert!(drain(&mut net.taps[0].1).is_empty());
        assert_eq!(drain(&mut net.taps[1].1).len(), 1);
    }

    #[test]
    fn channel_message_goes_only_where_members_are() {
        let mut net = network();
        add_user(&mut net, "ana", "gamma.tarn.test");
        add_user(&mut net, "bee", "alpha.tarn.test");
        let chan = net.channels.get_or_create("#test", 1);
        chan.join("ana", MemberRank::Normal);
        chan.join("bee", MemberRank::Normal);

        let msg = Message::with_source("bee", "PRIVMSG", vec!["#test".into(), "hi".into()]);
        one_to_all_but_sender_raw(&net.tree, &net.users, &net.channels, &msg, "alpha.tarn.test");

        // Exactly one copy toward beta (gamma's route); none toward delta.
        assert_eq!(drain(&mut net.taps[0].1).len(), 1);
        assert!(drain(&mut net.taps[1].1).is_empty());
    }

    #[test]
    fn nick_message_routes_one_to_one() {
        let mut net = network();
        add_user(&mut net, "ana", "gamma.tarn.test");
        let msg = Message::with_source("bee", "PRIVMSG", vec!["ana".into(), "hi".into()]);
        one_to_all_but_sender_raw(&net.tree, &net.users, &net.channels, &msg, "alpha.tarn.test");
        assert_eq!(drain(&mut net.taps[0].1).len(), 1);
        assert!(drain(&mut net.taps[1].1).is_empty());
    }

    #[test]
    fn unknown_command_floods_all_but_sender() {
        let mut net = network();
        let msg = Message::with_source("ana", "SAMODE", vec!["#x".into(), "+o".into()]);
        one_to_all_but_sender_raw(&net.tree, &net.users, &net.channels, &msg, "beta.tarn.test");
        assert!(drain(&mut net.taps[0].1).is_empty());
        assert_eq!(drain(&mut net.taps[1].1).len(), 1);
    }
}
