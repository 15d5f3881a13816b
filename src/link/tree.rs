//! Topology store: the spanning tree of known servers.
//!
//! The network is held two ways at once. A flat, name-indexed map owns
//! every node for O(1) lookups, and each node carries its parent, route,
//! and children as name identifiers, giving the recursive view used by
//! bursts and netsplits. The map and the identifier links always agree:
//! both are only mutated together through [`ServerTree::insert_child`] and
//! [`ServerTree::remove_subtree`].
//!
//! A node's *route* is the direct child of the local root through which it
//! is reached. Routes are computed once, at insertion: the tree only grows
//! by leaf-append and shrinks by whole-subtree removal, so a route can
//! never change while its node exists.

use std::collections::HashMap;

use tracing::debug;

use super::session::SessionHandle;

fn lower(s: &str) -> String {
    s.to_ascii_lowercase()
}

/// Case-insensitive wildcard match supporting `*` and `?`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(pattern: &[u8], text: &[u8]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], text) || (!text.is_empty() && inner(pattern, &text[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&pattern[1..], &text[1..]),
            (Some(a), Some(b)) if a.eq_ignore_ascii_case(b) => inner(&pattern[1..], &text[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

/// One server in the tree.
#[derive(Debug)]
pub struct ServerNode {
    pub name: String,
    pub description: String,
    /// Last version string learned for this server; empty until it tells us.
    pub version: String,
    /// Users homed on this server.
    pub user_count: u32,
    /// Epoch seconds after which this (directly-linked) server is pinged.
    pub next_ping: u64,
    /// Whether the previous ping got its pong.
    pub ping_answered: bool,
    /// Parent name; `None` only for the local root.
    parent: Option<String>,
    /// Route name; `None` only for the local root.
    route: Option<String>,
    /// Child names, in attach order.
    children: Vec<String>,
    /// Write handle for directly-linked peers; remote nodes have none.
    pub handle: Option<SessionHandle>,
}

impl ServerNode {
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    pub fn children(&self) -> &[String] {
        &self.children
    }

    pub fn is_directly_linked(&self) -> bool {
        self.handle.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("server {0} already exists on the network")]
    DuplicateName(String),
    #[error("unknown parent server {0}")]
    UnknownParent(String),
}

#[derive(Debug)]
pub struct ServerTree {
    /// Lowercased name → node; owns every node including the root.
    nodes: HashMap<String, ServerNode>,
    root: String,
}

impl ServerTree {
    /// Create the tree with the local server as its root.
    pub fn new(name: &str, description: &str, version: &str) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            lower(name),
            ServerNode {
                name: name.to_owned(),
                description: description.to_owned(),
                version: version.to_owned(),
                user_count: 0,
                next_ping: 0,
                ping_answered: true,
                parent: None,
                route: None,
                children: Vec::new(),
                handle: None,
            },
        );
        ServerTree {
            nodes,
            root: name.to_owned(),
        }
    }

    pub fn root_name(&self) -> &str {
        &self.root
    }

    pub fn is_root(&self, name: &str) -> bool {
        self.root.eq_ignore_ascii_case(name)
    }

    /// Exact lookup, O(1) on the index.
    pub fn find(&self, name: &str) -> Option<&ServerNode> {
        self.nodes.get(&lower(name))
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut ServerNode> {
        self.nodes.get_mut(&lower(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(&lower(name))
    }

    /// First node whose name matches the glob pattern. The tie-break among
    /// several matches is the index iteration order — implementation
    /// defined, callers must not rely on which match wins.
    pub fn find_glob(&self, pattern: &str) -> Option<&ServerNode> {
        self.nodes
            .values()
            .find(|node| glob_match(pattern, &node.name))
    }

    /// The direct child of root through which `name` is reached. `None`
    /// for the root itself and for unknown names.
    pub fn route_for(&self, name: &str) -> Option<&ServerNode> {
        let route = self.find(name)?.route()?.to_owned();
        self.nodes.get(&lower(&route))
    }

    /// Attach a new server as a leaf under `parent`.
    ///
    /// The route is fixed here and never recomputed: a child of root routes
    /// through itself, anything deeper inherits its parent's route.
    pub fn insert_child(
        &mut self,
        parent: &str,
        name: &str,
        description: &str,
        handle: Option<SessionHandle>,
    ) -> Result<(), TreeError> {
        if self.contains(name) {
            return Err(TreeError::DuplicateName(name.to_owned()));
        }
        let route = if self.is_root(parent) {
            name.to_owned()
        } else {
            self.find(parent)
                .and_then(|p| p.route())
                .ok_or_else(|| TreeError::UnknownParent(parent.to_owned()))?
                .to_owned()
        };
        let parent_node = self
            .find_mut(parent)
            .ok_or_else(|| TreeError::UnknownParent(parent.to_owned()))?;
        parent_node.children.push(name.to_owned());
        let parent_name = parent_node.name.clone();

        self.nodes.insert(
            lower(name),
            ServerNode {
                name: name.to_owned(),
                description: description.to_owned(),
                version: String::new(),
                user_count: 0,
                next_ping: 0,
                ping_answered: true,
                parent: Some(parent_name),
                route: Some(route),
                children: Vec::new(),
                handle,
            },
        );
        Ok(())
    }

    /// Detach `name` and everything below it. Returns the removed names in
    /// post-order (children before parents). Removing the root or an
    /// unknown name removes nothing.
    pub fn remove_subtree(&mut self, name: &str) -> Vec<String> {
        if self.is_root(name) || !self.contains(name) {
            return Vec::new();
        }

        let mut removed = Vec::new();
        self.collect_post_order(name, &mut removed);
        for victim in &removed {
            self.nodes.remove(&lower(victim));
            debug!(server = %victim, "removed from topology");
        }

        // Detach from the surviving parent's child list.
        let target_key = lower(name);
        for node in self.nodes.values_mut() {
            node.children.retain(|c| lower(c) != target_key);
        }
        removed
    }

    fn collect_post_order(&self, name: &str, out: &mut Vec<String>) {
        let Some(node) = self.find(name) else { return };
        for child in &node.children {
            self.collect_post_order(child, out);
        }
        out.push(node.name.clone());
    }

    /// Directly-linked peers: the direct children of root.
    pub fn local_peers(&self) -> impl Iterator<Item = &ServerNode> {
        self.find(&self.root)
            .map(|r| r.children.as_slice())
            .unwrap_or(&[])
            .iter()
            .filter_map(|name| self.find(name))
    }

    /// Every known server, the root included.
    pub fn iter(&self) -> impl Iterator<Item = &ServerNode> {
        self.nodes.values()
    }

    /// Total servers on the network.
    pub fn count_all(&self) -> usize {
        self.nodes.len()
    }

    /// Directly-linked servers.
    pub fn count_local(&self) -> usize {
        self.find(&self.root).map(|r| r.children.len()).unwrap_or(0)
    }
}
