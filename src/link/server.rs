//! Shared server state, listeners, and the periodic maintenance tick.
//!
//! All link-layer state lives behind one `Arc<RwLock<ServerState>>`:
//! the topology tree, the registries, the runtime link list, and the
//! event channel the client-facing layer subscribes to. Connection tasks
//! take the lock per frame; the tick task takes it once per interval for
//! ping checks, autoconnects, and x-line expiry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::burst::{MetadataSync, NoMetadata};
use super::config::{ConfigError, LinkBlock, LinkConfig, PING_INTERVAL_SECS};
use super::netsplit;
use super::registry::{ChannelRegistry, UserRegistry, XLineRegistry};
use super::session::{self, SessionHandle};
use super::tree::ServerTree;

/// Version string announced to peers and carried in bursts.
pub const SERVER_VERSION: &str = concat!("tarn-", env!("CARGO_PKG_VERSION"));

/// Seconds since the epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Events surfaced to the embedding (client-facing) layer.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Something operators should see.
    OperNotice(String),
    /// Answer to a remote-idle round trip, for WHOIS display.
    WhoisIdle {
        requester: String,
        nick: String,
        signon: u64,
        idle: u64,
    },
    /// A subtree split; every removed user with their quit reason.
    NetSplit {
        server: String,
        removed: Vec<(String, String)>,
    },
}

/// Runtime entry for one configured link: the block plus its next
/// autoconnect attempt time.
#[derive(Debug, Clone)]
pub struct LinkEntry {
    pub block: LinkBlock,
    pub next_attempt: u64,
}

/// Everything the link layer knows, owned behind one lock.
pub struct ServerState {
    pub config: LinkConfig,
    /// Path the config came from; rehash reloads it.
    pub config_path: Option<PathBuf>,
    /// Runtime link registry; replaced atomically on rehash.
    pub links: Vec<LinkEntry>,
    pub tree: ServerTree,
    pub users: UserRegistry,
    pub channels: ChannelRegistry,
    pub xlines: XLineRegistry,
    /// Opaque extension-state seam used by bursts and METADATA.
    pub metadata: Arc<dyn MetadataSync>,
    /// Set by a remote REHASH; honored on the next tick.
    pub rehash_pending: bool,
    events: broadcast::Sender<LinkEvent>,
    listeners: HashMap<String, JoinHandle<()>>,
    next_session_id: u64,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("server", &self.config.server_name)
            .field("servers", &self.tree.count_all())
            .field("users", &self.users.len())
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

impl ServerState {
    pub fn new(config: LinkConfig) -> Self {
        Self::with_metadata(config, Arc::new(NoMetadata))
    }

    pub fn with_metadata(config: LinkConfig, metadata: Arc<dyn MetadataSync>) -> Self {
        let (events, _) = broadcast::channel(512);
        let now = now_secs();
        let links = config
            .links
            .iter()
            .map(|block| LinkEntry {
                next_attempt: now + block.autoconnect_secs,
                block: block.clone(),
            })
            .collect();
        let tree = ServerTree::new(&config.server_name, &config.description, SERVER_VERSION);
        ServerState {
            config,
            config_path: None,
            links,
            tree,
            users: UserRegistry::new(),
            channels: ChannelRegistry::new(),
            xlines: XLineRegistry::new(),
            metadata,
            rehash_pending: false,
            events,
            listeners: HashMap::new(),
            next_session_id: 0,
        }
    }

    pub fn local_name(&self) -> &str {
        &self.config.server_name
    }

    pub fn version(&self) -> &str {
        SERVER_VERSION
    }

    pub fn capab_string(&self) -> String {
        self.config.capab_string()
    }

    /// Subscribe to link-layer events (notices, WHOIS replies, splits).
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    /// Log and broadcast an operator notice.
    pub fn oper_notice(&self, text: impl Into<String>) {
        let text = text.into();
        info!(target: "tarn::opers", "{text}");
        let _ = self.events.send(LinkEvent::OperNotice(text));
    }

    pub fn next_session_id(&mut self) -> u64 {
        self.next_session_id += 1;
        self.next_session_id
    }
}

/// Shared, task-safe server state.
pub type SharedState = Arc<RwLock<ServerState>>;

/// Bind listeners and spawn the accept and tick tasks. Returns the shared
/// state for embedding plus the bound addresses; the daemon keeps running
/// until the tasks are dropped.
pub async fn start(
    config: LinkConfig,
    config_path: Option<PathBuf>,
) -> Result<(SharedState, Vec<std::net::SocketAddr>), Box<dyn std::error::Error + Send + Sync>> {
    let binds = config.binds.clone();
    let state: SharedState = Arc::new(RwLock::new(ServerState::new(config)));
    state.write().await.config_path = config_path;

    // Bind everything first so port conflicts fail fast.
    let mut listeners = Vec::with_capacity(binds.len());
    let mut bound = Vec::with_capacity(binds.len());
    for addr in &binds {
        let listener = TcpListener::bind(addr).await?;
        bound.push(listener.local_addr()?);
        info!(%addr, "accepting server links");
        listeners.push((addr.clone(), listener));
    }
    {
        let mut st = state.write().await;
        for (addr, listener) in listeners {
            let task = tokio::spawn(accept_loop(listener, Arc::clone(&state)));
            st.listeners.insert(addr, task);
        }
    }

    tokio::spawn(tick_loop(Arc::clone(&state)));

    Ok((state, bound))
}

/// Run the daemon until the process ends.
pub async fn run(
    config: LinkConfig,
    config_path: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (_state, _addrs) = start(config, config_path).await?;
    // Listener and tick tasks carry the daemon; park this future.
    std::future::pending::<()>().await;
    Ok(())
}

async fn accept_loop(listener: TcpListener, state: SharedState) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    session::accept(stream, addr, state).await;
                });
            }
            Err(e) => {
                warn!("accept failed: {e}");
            }
        }
    }
}

/// Interval between maintenance passes.
const TICK_SECS: u64 = 5;

async fn tick_loop(state: SharedState) {
    let mut interval = tokio::time::interval(Duration::from_secs(TICK_SECS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        tick(&state).await;
    }
}

/// One maintenance pass: expire x-lines, ping quiet peers and split the
/// unresponsive, dial due autoconnects, honor a pending rehash.
pub async fn tick(state: &SharedState) {
    let now = now_secs();

    enum PingAction {
        Ping(String, SessionHandle),
        Split(String, SessionHandle),
    }

    let (actions, dials, rehash_due) = {
        let mut st = state.write().await;
        st.xlines.expire(now);

        let mut actions = Vec::new();
        for peer in st.tree.local_peers() {
            let Some(handle) = peer.handle.clone() else { continue };
            if now < peer.next_ping {
                continue;
            }
            if peer.ping_answered {
                actions.push(PingAction::Ping(peer.name.clone(), handle));
            } else {
                actions.push(PingAction::Split(peer.name.clone(), handle));
            }
        }

        let mut dials = Vec::new();
        for entry in &mut st.links {
            if entry.block.autoconnect_secs == 0 || now < entry.next_attempt {
                continue;
            }
            entry.next_attempt = now + entry.block.autoconnect_secs;
            dials.push(entry.block.clone());
        }

        let rehash_due = st.rehash_pending;
        st.rehash_pending = false;
        (actions, dials, rehash_due)
    };

    for action in actions {
        let mut st = state.write().await;
        match action {
            PingAction::Ping(name, handle) => {
                let local = st.local_name().to_owned();
                handle.send(super::message::Message::with_source(
                    &local,
                    "PING",
                    vec![name.clone()],
                ));
                if let Some(node) = st.tree.find_mut(&name) {
                    node.next_ping = now + PING_INTERVAL_SECS;
                    node.ping_answered = false;
                }
            }
            PingAction::Split(name, handle) => {
                st.oper_notice(format!("Server {name} pinged out"));
                netsplit::squit(&mut st, &name, "ping timeout");
                handle.shutdown();
            }
        }
    }

    for block in dials {
        let exists = {
            let st = state.read().await;
            st.tree.contains(&block.name)
        };
        if exists {
            // An established node suppresses the duplicate dial.
            continue;
        }
        {
            let st = state.read().await;
            st.oper_notice(format!(
                "AUTOCONNECT: auto-connecting server {} ({}s until next attempt)",
                block.name, block.autoconnect_secs
            ));
        }
        let state = Arc::clone(state);
        tokio::spawn(async move {
            session::connect(block, state).await;
        });
    }

    if rehash_due {
        if let Err(e) = rehash(state).await {
            let st = state.read().await;
            st.oper_notice(format!("Rehash failed: {e}"));
        }
    }
}

/// Reload the config file: swap the link list atomically and re-evaluate
/// listener bindings. Already-linked connections are left untouched, and
/// the server identity is pinned at startup.
pub async fn rehash(state: &SharedState) -> Result<(), ConfigError> {
    let path = { state.read().await.config_path.clone() };
    let Some(path) = path else {
        return Ok(()); // embedded states carry their config in memory
    };
    let mut new_config = LinkConfig::load(&path)?;

    let to_close: Vec<String>;
    let to_open: Vec<String>;
    {
        let mut st = state.write().await;
        if !new_config
            .server_name
            .eq_ignore_ascii_case(st.local_name())
        {
            warn!(
                old = %st.local_name(),
                new = %new_config.server_name,
                "server_name change ignored on rehash"
            );
            new_config.server_name = st.local_name().to_owned();
        }

        let now = now_secs();
        st.links = new_config
            .links
            .iter()
            .map(|block| LinkEntry {
                next_attempt: now + block.autoconnect_secs,
                block: block.clone(),
            })
            .collect();

        to_close = st
            .listeners
            .keys()
            .filter(|addr| !new_config.binds.contains(*addr))
            .cloned()
            .collect();
        to_open = new_config
            .binds
            .iter()
            .filter(|addr| !st.listeners.contains_key(*addr))
            .cloned()
            .collect();
        for addr in &to_close {
            if let Some(task) = st.listeners.remove(addr) {
                task.abort();
                info!(%addr, "listener dropped on rehash");
            }
        }
        st.config = new_config;
    }

    for addr in to_open {
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                let task = tokio::spawn(accept_loop(listener, Arc::clone(state)));
                let mut st = state.write().await;
                info!(%addr, "listener added on rehash");
                st.listeners.insert(addr, task);
            }
            Err(e) => {
                let st = state.read().await;
                st.oper_notice(format!("Rehash: failed to bind {addr}: {e}"));
            }
        }
    }

    let st = state.read().await;
    st.oper_notice("Link configuration reloaded.");
    Ok(())
}
