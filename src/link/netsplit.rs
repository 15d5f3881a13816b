//! Netsplit engine: consistent teardown of a lost subtree.
//!
//! A squit first walks the doomed subtree collecting every affected user
//! (without removing anything), then applies all removals in one batch,
//! then detaches the subtree from the topology, and finally tells the rest
//! of the network. Collect-then-apply keeps the walk from invalidating the
//! structures it is iterating.

use tracing::info;

use super::router;
use super::server::{LinkEvent, ServerState};

/// Outcome of a completed squit, for notices and the local client layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitSummary {
    pub lost_servers: usize,
    pub lost_users: usize,
    /// (nick, composite quit reason) for every removed user.
    pub removed_users: Vec<(String, String)>,
}

/// Remove `target` and its whole subtree from the network.
///
/// No-op for the local root and for unknown names. Every user homed in the
/// subtree quits with a composite reason: the chain of server names from
/// the split point down to their home server, then the squit reason — so
/// the reason always names both the split point and the home server.
pub fn squit(st: &mut ServerState, target: &str, reason: &str) -> Option<SplitSummary> {
    if st.tree.is_root(target) || !st.tree.contains(target) {
        info!(%target, "squit for root or unknown server, ignoring");
        return None;
    }

    let parent = st
        .tree
        .find(target)
        .and_then(|n| n.parent())
        .unwrap_or(st.tree.root_name())
        .to_owned();

    // Tell the surviving network first, before the topology forgets how
    // the split point was reached.
    router::one_to_all_but_sender(
        &st.tree,
        &parent,
        "SQUIT",
        vec![target.to_owned(), reason.to_owned()],
        target,
    );

    // Walk the subtree, collecting (server, name-chain) pairs.
    let mut chains: Vec<(String, Vec<String>)> = Vec::new();
    collect_chains(st, target, &mut Vec::new(), &mut chains);

    // Collect affected users with their composite reasons.
    let mut removed_users = Vec::new();
    for (server, chain) in &chains {
        for user in st.users.iter().filter(|u| u.server.eq_ignore_ascii_case(server)) {
            let composite = format!("{} {}", chain.join(" "), reason);
            removed_users.push((user.nick.clone(), composite));
        }
    }

    // Apply all removals in one batch.
    for (nick, _) in &removed_users {
        st.users.remove(nick);
        st.channels.part_all(nick);
    }
    let lost_servers = st.tree.remove_subtree(target).len();

    let summary = SplitSummary {
        lost_servers,
        lost_users: removed_users.len(),
        removed_users,
    };

    if st.tree.is_root(&parent) {
        st.oper_notice(format!("Server {target} split: {reason}"));
    } else {
        st.oper_notice(format!(
            "Server {target} split from server {parent} with reason: {reason}"
        ));
    }
    st.oper_notice(format!(
        "Netsplit complete, lost {} users on {} servers.",
        summary.lost_users, summary.lost_servers
    ));
    st.emit(LinkEvent::NetSplit {
        server: target.to_owned(),
        removed: summary.removed_users.clone(),
    });
    info!(
        %target,
        lost_users = summary.lost_users,
        lost_servers = summary.lost_servers,
        "netsplit complete"
    );
    Some(summary)
}

fn collect_chains(
    st: &ServerState,
    name: &str,
    path: &mut Vec<String>,
    out: &mut Vec<(String, Vec<String>)>,
) {
    let Some(node) = st.tree.find(name) else { return };
    path.push(node.name.clone());
    for child in node.children().to_vec() {
        collect_chains(st, &child, path, out);
    }
    out.push((node.name.clone(), path.clone()));
    path.pop();
}
