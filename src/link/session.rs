//! Per-peer connection task: the link state machine and the command
//! interpreter.
//!
//! Every server link, dialed or accepted, runs as one task that owns the
//! framed transport. Outbound lines arrive over an unbounded channel (the
//! [`SessionHandle`] held by the topology store and the router), inbound
//! frames are dispatched against the current link state. A handshake
//! violation always answers with a textual `ERROR` frame before closing —
//! never a silent drop — and a transport close on a `Linked` connection is
//! always routed through the netsplit engine.

use std::net::SocketAddr;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::burst;
use super::cipher::LinkCipher;
use super::codec::{CodecError, LinkCodec};
use super::command::{IdleRound, LinkCommand};
use super::config::{LinkBlock, PING_INTERVAL_SECS};
use super::message::Message;
use super::netsplit;
use super::registry::{MemberRank, User};
use super::router;
use super::server::{now_secs, LinkEvent, ServerState, SharedState};
use super::tree::glob_match;

type LinkFramed = Framed<TcpStream, LinkCodec>;

/// States of one link. `Listening` belongs to the bound listener socket
/// itself, which only ever accepts; a connection spawned from it starts in
/// `AwaitingPeerHello`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Listening,
    Connecting,
    AwaitingPeerHello,
    AwaitingBurstStart,
    Linked,
}

/// Instructions for a running session task.
#[derive(Debug)]
pub enum SessionCommand {
    /// Write one line to the peer.
    Line(Message),
    /// Flush nothing further and drop the connection.
    Shutdown,
}

/// Write handle for one session, held by the owning tree node and cloned
/// wherever lines must be queued. Send failures are deliberately ignored:
/// a dead task is already tearing the link down.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: u64,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn new(id: u64, tx: mpsc::UnboundedSender<SessionCommand>) -> Self {
        SessionHandle { id, tx }
    }

    pub fn send(&self, msg: Message) {
        let _ = self.tx.send(SessionCommand::Line(msg));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(SessionCommand::Shutdown);
    }
}

/// Why a session is being terminated. Every variant except a peer-sent
/// `ERROR` is answered with an `ERROR` frame of its own before the close.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{0}")]
    ProtocolViolation(String),
    #[error("{0}")]
    AuthenticationFailure(String),
    #[error("CAPAB mismatch; my capabilities: '{ours}'")]
    CapabilityMismatch { ours: String, theirs: String },
    #[error("{0}")]
    EncryptionPolicy(String),
    #[error(transparent)]
    Transport(#[from] CodecError),
}

/// Handler verdict, consumed by the session loop.
enum Flow {
    Continue,
    Close,
}

struct Session {
    id: u64,
    addr: SocketAddr,
    shared: SharedState,
    handle: SessionHandle,
    link_state: LinkState,
    /// Set when we dialed out: the block we are authenticating against.
    dialed: Option<LinkBlock>,
    /// Identity claimed by an inbound peer, unconfirmed until burst start.
    inbound_name: Option<String>,
    inbound_desc: Option<String>,
    /// Name under which this link's node was registered in the tree.
    registered_name: Option<String>,
    /// True between link-up and the peer's end-of-burst marker.
    bursting: bool,
    cipher_active: bool,
}

/// Run an accepted (inbound) server connection.
pub async fn accept(stream: TcpStream, addr: SocketAddr, shared: SharedState) {
    let (id, rx, session) = Session::new(addr, shared, None, LinkState::AwaitingPeerHello).await;
    debug!(%addr, id, "accepted server connection");
    session.run(stream, rx).await;
}

/// Dial a configured peer and run the resulting connection.
pub async fn connect(block: LinkBlock, shared: SharedState) {
    let addr_text = block.dial_addr();
    let stream = match TcpStream::connect(&addr_text).await {
        Ok(stream) => stream,
        Err(e) => {
            let st = shared.read().await;
            st.oper_notice(format!("CONNECT: connection to {} failed: {e}", block.name));
            return;
        }
    };
    let addr = stream.peer_addr().unwrap_or_else(|_| {
        // Connected but no peer address; synthesize from config.
        addr_text.parse().unwrap_or_else(|_| ([0, 0, 0, 0], 0).into())
    });
    {
        let st = shared.read().await;
        st.oper_notice(format!(
            "Connection to {}[{addr}] established.",
            block.name
        ));
    }
    let (id, rx, session) =
        Session::new(addr, shared, Some(block), LinkState::Connecting).await;
    debug!(%addr, id, "dialed server connection");
    session.run(stream, rx).await;
}

impl Session {
    async fn new(
        addr: SocketAddr,
        shared: SharedState,
        dialed: Option<LinkBlock>,
        link_state: LinkState,
    ) -> (u64, mpsc::UnboundedReceiver<SessionCommand>, Session) {
        let id = shared.write().await.next_session_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle::new(id, tx);
        (
            id,
            rx,
            Session {
                id,
                addr,
                shared,
                handle,
                link_state,
                dialed,
                inbound_name: None,
                inbound_desc: None,
                registered_name: None,
                bursting: false,
                cipher_active: false,
            },
        )
    }

    /// Best current name for the peer, for logs and notices.
    fn peer_name(&self) -> String {
        self.registered_name
            .clone()
            .or_else(|| self.inbound_name.clone())
            .or_else(|| self.dialed.as_ref().map(|b| b.name.clone()))
            .unwrap_or_else(|| self.addr.to_string())
    }

    async fn run(mut self, stream: TcpStream, mut rx: mpsc::UnboundedReceiver<SessionCommand>) {
        let mut framed = Framed::new(stream, LinkCodec::new());

        if self.open_handshake(&mut framed).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(SessionCommand::Line(msg)) => {
                        if let Err(e) = framed.send(msg).await {
                            warn!(peer = %self.peer_name(), "write failed: {e}");
                            break;
                        }
                    }
                    Some(SessionCommand::Shutdown) | None => break,
                },
                frame = framed.next() => match frame {
                    Some(Ok(msg)) => match self.on_frame(&mut framed, msg).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close) => break,
                        Err(e) => {
                            self.fail(&mut framed, e).await;
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        warn!(peer = %self.peer_name(), "transport fault: {e}");
                        break;
                    }
                    None => break,
                },
            }
        }

        self.teardown().await;
    }

    /// Send the opening frames: CAPAB from both sides, and on the dialing
    /// side cipher negotiation (when configured) followed by our hello.
    async fn open_handshake(&mut self, framed: &mut LinkFramed) -> Result<(), ()> {
        let (capab, local, description, secret) = {
            let st = self.shared.read().await;
            (
                st.capab_string(),
                st.local_name().to_owned(),
                st.config.description.clone(),
                self.dialed.as_ref().map(|b| b.send_secret.clone()),
            )
        };

        if framed
            .send(Message::new("CAPAB", vec![capab]))
            .await
            .is_err()
        {
            return Err(());
        }

        let Some(block) = self.dialed.clone() else {
            return Ok(()); // inbound: wait for the peer's hello
        };

        if let Some(key) = &block.cipher_key {
            match LinkCipher::new(key.as_bytes()) {
                Ok(cipher) => {
                    let bits = cipher.key_bits();
                    if framed
                        .send(Message::new("CIPHER", vec![local.clone()]))
                        .await
                        .is_err()
                    {
                        return Err(());
                    }
                    framed.codec_mut().enable_cipher(cipher);
                    self.cipher_active = true;
                    let st = self.shared.read().await;
                    st.oper_notice(format!(
                        "CIPHER: initialized {bits}-bit link cipher to {}",
                        block.name
                    ));
                }
                Err(e) => {
                    // Invalid key length: refuse the link, never fall back
                    // to plaintext.
                    {
                        let st = self.shared.read().await;
                        st.oper_notice(format!(
                            "CIPHER: refusing link to {}: {e}",
                            block.name
                        ));
                    }
                    let _ = framed
                        .send(Message::new("ERROR", vec![e.to_string()]))
                        .await;
                    return Err(());
                }
            }
        }

        if framed
            .send(Message::new(
                "SERVER",
                vec![
                    local,
                    secret.unwrap_or_default(),
                    "0".into(),
                    description,
                ],
            ))
            .await
            .is_err()
        {
            return Err(());
        }
        self.link_state = LinkState::AwaitingPeerHello;
        Ok(())
    }

    async fn on_frame(
        &mut self,
        framed: &mut LinkFramed,
        msg: Message,
    ) -> Result<Flow, SessionError> {
        let cmd = match LinkCommand::parse(&msg) {
            Ok(cmd) => cmd,
            Err(e) => {
                // Once linked, a malformed known command is dropped rather
                // than splitting the network over it.
                if self.link_state == LinkState::Linked {
                    warn!(peer = %self.peer_name(), "ignoring malformed command: {e}");
                    return Ok(Flow::Continue);
                }
                return Err(SessionError::ProtocolViolation(e.to_string()));
            }
        };

        // Cipher negotiation is acted on regardless of handshake phase, as
        // long as the link is not already ciphered.
        if let LinkCommand::Cipher { server } = &cmd {
            return self.enable_peer_cipher(framed, server).await;
        }

        match self.link_state {
            LinkState::Listening => Err(SessionError::ProtocolViolation(
                "listening socket cannot carry traffic".into(),
            )),
            LinkState::Connecting | LinkState::AwaitingPeerHello if self.dialed.is_some() => {
                self.awaiting_hello_outbound(cmd).await
            }
            LinkState::AwaitingPeerHello => self.awaiting_hello_inbound(cmd).await,
            LinkState::Connecting => Err(SessionError::ProtocolViolation(
                "unexpected traffic while connecting".into(),
            )),
            LinkState::AwaitingBurstStart => self.awaiting_burst_start(cmd).await,
            LinkState::Linked => {
                let shared = self.shared.clone();
                let mut st = shared.write().await;
                self.linked(&mut st, msg.prefix.clone(), cmd)
            }
        }
    }

    async fn enable_peer_cipher(
        &mut self,
        framed: &mut LinkFramed,
        server: &str,
    ) -> Result<Flow, SessionError> {
        let st = self.shared.read().await;
        if self.cipher_active {
            st.oper_notice(format!(
                "CIPHER: {server} tried to enable an already-ciphered link"
            ));
            return Ok(Flow::Continue);
        }
        let Some(key) = st
            .config
            .find_link(server)
            .and_then(|b| b.cipher_key.clone())
        else {
            return Err(SessionError::EncryptionPolicy(format!(
                "no cipher key configured for {server}"
            )));
        };
        let cipher = LinkCipher::new(key.as_bytes())
            .map_err(|e| SessionError::EncryptionPolicy(e.to_string()))?;
        let bits = cipher.key_bits();
        framed.codec_mut().enable_cipher(cipher);
        self.cipher_active = true;
        st.oper_notice(format!(
            "CIPHER: initialized {bits}-bit link cipher with {server}"
        ));
        Ok(Flow::Continue)
    }

    fn check_capab(&self, st: &ServerState, theirs: &str) -> Result<Flow, SessionError> {
        let ours = st.capab_string();
        if theirs != ours {
            st.oper_notice(format!(
                "Server '{}' does not carry the same capability set, cannot link!",
                self.peer_name()
            ));
            st.oper_notice(format!("Our capability set: '{ours}'"));
            st.oper_notice(format!("Their capability set: '{theirs}'"));
            return Err(SessionError::CapabilityMismatch {
                ours,
                theirs: theirs.to_owned(),
            });
        }
        Ok(Flow::Continue)
    }

    /// Inbound side: the peer dials us and leads with its hello.
    async fn awaiting_hello_inbound(&mut self, cmd: LinkCommand) -> Result<Flow, SessionError> {
        let shared = self.shared.clone();
        let st = shared.read().await;
        match cmd {
            LinkCommand::Capab { caps } => self.check_capab(&st, &caps),
            LinkCommand::Error { message } => Ok(self.peer_error(&st, &message)),
            LinkCommand::ServerIntro {
                name,
                secret,
                hops,
                description,
            } => {
                self.verify_hello(&st, &name, &secret, hops)?;
                st.oper_notice(format!(
                    "Verified incoming server connection from {name}[{}] ({description})",
                    self.addr
                ));
                self.inbound_name = Some(name);
                self.inbound_desc = Some(description);

                // Reply with our own hello; their burst-start confirms.
                let block_secret = st
                    .config
                    .find_link(self.inbound_name.as_deref().unwrap_or_default())
                    .map(|b| b.send_secret.clone())
                    .unwrap_or_default();
                self.handle.send(Message::new(
                    "SERVER",
                    vec![
                        st.local_name().to_owned(),
                        block_secret,
                        "0".into(),
                        st.config.description.clone(),
                    ],
                ));
                self.link_state = LinkState::AwaitingBurstStart;
                Ok(Flow::Continue)
            }
            LinkCommand::Relay(msg) if msg.command == "USER" => Err(
                SessionError::ProtocolViolation(
                    "Client connections to this port are prohibited".into(),
                ),
            ),
            _ => Err(SessionError::ProtocolViolation(
                "Invalid command in negotiation phase".into(),
            )),
        }
    }

    /// Outbound side: we already sent our hello; the peer's confirming
    /// hello completes authentication and we burst first.
    async fn awaiting_hello_outbound(&mut self, cmd: LinkCommand) -> Result<Flow, SessionError> {
        let shared = self.shared.clone();
        let mut st = shared.write().await;
        match cmd {
            LinkCommand::Capab { caps } => self.check_capab(&st, &caps),
            LinkCommand::Error { message } => Ok(self.peer_error(&st, &message)),
            LinkCommand::ServerIntro {
                name,
                secret,
                hops,
                description,
            } => {
                self.verify_hello(&st, &name, &secret, hops)?;
                self.establish(&mut st, &name, &description);
                Ok(Flow::Continue)
            }
            _ => Err(SessionError::ProtocolViolation(
                "Invalid command in negotiation phase".into(),
            )),
        }
    }

    /// Inbound side, hello exchanged: the peer's burst-start marker seals
    /// the link.
    async fn awaiting_burst_start(&mut self, cmd: LinkCommand) -> Result<Flow, SessionError> {
        let shared = self.shared.clone();
        let mut st = shared.write().await;
        match cmd {
            LinkCommand::Burst => {
                let name = self.inbound_name.clone().unwrap_or_default();
                let desc = self.inbound_desc.clone().unwrap_or_default();
                self.establish(&mut st, &name, &desc);
                self.bursting = true;
                Ok(Flow::Continue)
            }
            LinkCommand::Capab { caps } => self.check_capab(&st, &caps),
            LinkCommand::Error { message } => Ok(self.peer_error(&st, &message)),
            // A repeated hello here is already answered; ignore it.
            LinkCommand::ServerIntro { .. } => Ok(Flow::Continue),
            _ => Err(SessionError::ProtocolViolation(
                "Invalid command in negotiation phase".into(),
            )),
        }
    }

    /// Shared hello validation: direct links only, matching secret, and a
    /// name nobody on the network holds yet.
    fn verify_hello(
        &self,
        st: &ServerState,
        name: &str,
        secret: &str,
        hops: u32,
    ) -> Result<(), SessionError> {
        if hops != 0 {
            st.oper_notice(format!(
                "Server connection from {name} denied, server is too far away for authentication"
            ));
            return Err(SessionError::AuthenticationFailure(
                "Server too far away for authentication".into(),
            ));
        }
        let Some(block) = st.config.find_link(name) else {
            st.oper_notice(format!(
                "Server connection from {name} denied, invalid link credentials"
            ));
            return Err(SessionError::AuthenticationFailure(
                "Invalid credentials".into(),
            ));
        };
        if block.recv_secret != secret {
            st.oper_notice(format!(
                "Server connection from {name} denied, invalid link credentials"
            ));
            return Err(SessionError::AuthenticationFailure(
                "Invalid credentials".into(),
            ));
        }
        if let Some(existing) = st.tree.find(name) {
            let holder = existing
                .parent()
                .unwrap_or(st.tree.root_name())
                .to_owned();
            st.oper_notice(format!(
                "Server connection from {name} denied, already exists on server {holder}"
            ));
            return Err(SessionError::AuthenticationFailure(format!(
                "Server {name} already exists on server {holder}"
            )));
        }
        if block.cipher_key.is_some() && !self.cipher_active {
            st.oper_notice(format!(
                "Server connection from {name} denied, link requires a cipher"
            ));
            return Err(SessionError::EncryptionPolicy(
                "This link requires encryption to be enabled; plaintext connection refused"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Create the peer's node under root, announce it to everyone else,
    /// and send our burst. The caller flips any side-specific flags.
    fn establish(&mut self, st: &mut ServerState, name: &str, description: &str) {
        let root = st.tree.root_name().to_owned();
        if st
            .tree
            .insert_child(&root, name, description, Some(self.handle.clone()))
            .is_err()
        {
            // verify_hello already rejected duplicates; losing this race
            // would mean two sessions finishing the same hello at once.
            warn!(peer = %name, "node appeared during handshake, dropping link");
            self.handle.shutdown();
            return;
        }
        if let Some(node) = st.tree.find_mut(name) {
            node.next_ping = now_secs() + PING_INTERVAL_SECS;
            node.ping_answered = true;
        }
        self.registered_name = Some(name.to_owned());
        self.link_state = LinkState::Linked;

        router::one_to_all_but_sender(
            &st.tree,
            &root,
            "SERVER",
            vec![
                name.to_owned(),
                "*".into(),
                "1".into(),
                description.to_owned(),
            ],
            name,
        );
        info!(peer = %name, "link established");
        burst::send_burst(st, name, &self.handle);
    }

    fn peer_error(&self, st: &ServerState, message: &str) -> Flow {
        st.oper_notice(format!("ERROR from {}: {message}", self.peer_name()));
        Flow::Close
    }

    // ── Linked state ─────────────────────────────────────────────

    /// Verify that a prefixed command routes back through this connection,
    /// and refresh the route's ping state while at it. Returns the name
    /// the source resolves to, or `None` when the frame must be dropped.
    fn verify_direction(&self, st: &mut ServerState, prefix: &str) -> Option<String> {
        let direction = st
            .users
            .find(prefix)
            .map(|u| u.server.clone())
            .unwrap_or_else(|| prefix.to_owned());

        let route = st
            .tree
            .route_for(&direction)
            .map(|r| (r.name.clone(), r.handle.as_ref().map(|h| h.id)));
        match route {
            Some((route_name, Some(id))) if id == self.id => {
                if let Some(node) = st.tree.find_mut(&route_name) {
                    node.next_ping = now_secs() + PING_INTERVAL_SECS;
                    node.ping_answered = true;
                }
                Some(direction)
            }
            Some(_) => {
                debug!(
                    peer = %self.peer_name(),
                    source = %prefix,
                    "fake direction, dropping frame"
                );
                None
            }
            None => {
                debug!(peer = %self.peer_name(), source = %prefix, "unknown source, dropping frame");
                None
            }
        }
    }

    fn linked(
        &mut self,
        st: &mut ServerState,
        prefix: Option<String>,
        cmd: LinkCommand,
    ) -> Result<Flow, SessionError> {
        // Source verification applies to every prefixed command.
        let source_server = match &prefix {
            Some(prefix) => match self.verify_direction(st, prefix) {
                Some(server) => Some(server),
                None => return Ok(Flow::Continue),
            },
            None => None,
        };
        let source = prefix.clone().unwrap_or_else(|| self.peer_name());
        let local = st.local_name().to_owned();

        match cmd {
            LinkCommand::ServerIntro {
                name,
                hops,
                description,
                ..
            } => {
                // Relayed third-party introduction.
                let Some(parent) = prefix else {
                    return Err(SessionError::ProtocolViolation(
                        "introduced remote server from unknown server".into(),
                    ));
                };
                if st.tree.contains(&name) {
                    // A slow burst can race live traffic; duplicates are
                    // skipped, not fatal.
                    debug!(server = %name, "duplicate introduction, skipping");
                    return Ok(Flow::Continue);
                }
                if st
                    .tree
                    .insert_child(&parent, &name, &description, None)
                    .is_err()
                {
                    return Err(SessionError::ProtocolViolation(format!(
                        "introduced remote server from unknown server {parent}"
                    )));
                }
                st.oper_notice(format!(
                    "Server {parent} introduced server {name} ({description})"
                ));
                router::one_to_all_but_sender(
                    &st.tree,
                    &parent,
                    "SERVER",
                    vec![
                        name,
                        "*".into(),
                        (hops + 1).to_string(),
                        description,
                    ],
                    &parent,
                );
                Ok(Flow::Continue)
            }

            LinkCommand::Squit { server, reason } => {
                netsplit::squit(st, &server, &reason);
                Ok(Flow::Continue)
            }

            LinkCommand::Introduce {
                signon,
                nick,
                host,
                display_host,
                ident,
                modes,
                ip,
                realname,
            } => {
                let Some(server) = source_server else {
                    return Ok(Flow::Continue);
                };
                if let Some(existing) = st.users.find(&nick) {
                    if existing.signon == signon
                        && existing.server.eq_ignore_ascii_case(&server)
                    {
                        // Burst replay of a user we already learned.
                        return Ok(Flow::Continue);
                    }
                    debug!(%nick, "nick collision, killing introduced user");
                    self.handle.send(Message::with_source(
                        &local,
                        "KILL",
                        vec![nick, "Nickname collision".into()],
                    ));
                    return Ok(Flow::Continue);
                }
                let user = User {
                    nick: nick.clone(),
                    ident: ident.clone(),
                    host: host.clone(),
                    display_host: display_host.clone(),
                    ip: ip.clone(),
                    signon,
                    modes: modes.clone(),
                    realname: realname.clone(),
                    server: server.clone(),
                    oper_type: None,
                    idle_since: signon,
                };
                if !self.bursting {
                    st.oper_notice(format!(
                        "Client connecting at {server}: {}",
                        user.hostmask()
                    ));
                }
                let _ = st.users.insert(user);
                if let Some(node) = st.tree.find_mut(&server) {
                    node.user_count += 1;
                }
                router::one_to_all_but_sender(
                    &st.tree,
                    &source,
                    "NICK",
                    vec![
                        signon.to_string(),
                        nick,
                        host,
                        display_host,
                        ident,
                        format!("+{modes}"),
                        ip,
                        realname,
                    ],
                    &source,
                );
                Ok(Flow::Continue)
            }

            LinkCommand::NickChange { new_nick } => {
                let Some(server) = source_server else {
                    return Ok(Flow::Continue);
                };
                if st.users.rename(&source, &new_nick).is_ok() {
                    st.channels.rename_member(&source, &new_nick);
                    router::one_to_all_but_sender(
                        &st.tree,
                        &source,
                        "NICK",
                        vec![new_nick],
                        &server,
                    );
                } else {
                    warn!(old = %source, new = %new_nick, "nick change collision, dropping");
                }
                Ok(Flow::Continue)
            }

            LinkCommand::ForceJoin {
                channel,
                ts,
                members,
            } => {
                // Forward before applying, so any mode bounce we emit is
                // seen after the join itself everywhere.
                let mut params = vec![channel.clone(), ts.to_string()];
                params.extend(members.iter().cloned());
                router::one_to_all_but_sender(&st.tree, &source, "FJOIN", params, &source);

                let ours_newer = st
                    .channels
                    .find(&channel)
                    .map(|c| c.ts >= ts)
                    .unwrap_or(true);
                st.channels.get_or_create(&channel, ts);
                let mut bounce_modes = String::new();
                let mut bounce_nicks = Vec::new();
                for token in &members {
                    let (rank, nick) = MemberRank::split_token(token);
                    if !st.users.contains(nick) {
                        continue;
                    }
                    let chan = st.channels.get_or_create(&channel, ts);
                    chan.join(nick, MemberRank::Normal);
                    if let Some(mode) = rank.mode_char() {
                        if ours_newer {
                            chan.set_rank(nick, rank);
                        } else {
                            bounce_modes.push(mode);
                            bounce_nicks.push(nick.to_owned());
                        }
                    }
                }
                if !bounce_nicks.is_empty() {
                    // Their channel is older than ours: reverse the ranks
                    // they asserted, network-wide.
                    let mut params = vec![channel, format!("-{bounce_modes}")];
                    params.extend(bounce_nicks);
                    router::one_to_many(&st.tree, &local, "FMODE", params);
                }
                Ok(Flow::Continue)
            }

            LinkCommand::ForceMode { target, modes } => {
                self.apply_modes(st, &source, &target, &modes);
                let mut params = vec![target];
                params.extend(modes);
                router::one_to_all_but_sender(&st.tree, &source, "FMODE", params, &source);
                Ok(Flow::Continue)
            }

            LinkCommand::Mode { target, modes } => {
                self.apply_modes(st, &source, &target, &modes);
                let mut params = vec![target];
                params.extend(modes);
                let omit = self.peer_name();
                router::one_to_all_but_sender(&st.tree, &source, "MODE", params, &omit);
                Ok(Flow::Continue)
            }

            LinkCommand::ForceTopic {
                channel,
                ts,
                set_by,
                topic,
            } => {
                if let Some(chan) = st.channels.find_mut(&channel) {
                    let newer = chan
                        .topic
                        .as_ref()
                        .map(|t| ts >= t.set_at)
                        .unwrap_or(true);
                    if newer {
                        chan.topic = Some(super::registry::Topic {
                            text: topic.clone(),
                            set_by: set_by.clone(),
                            set_at: ts,
                        });
                    }
                }
                router::one_to_all_but_sender(
                    &st.tree,
                    &source,
                    "FTOPIC",
                    vec![channel, ts.to_string(), set_by, topic],
                    &source,
                );
                Ok(Flow::Continue)
            }

            LinkCommand::ForceHost { host } => {
                let Some(server) = source_server else {
                    return Ok(Flow::Continue);
                };
                if let Some(user) = st.users.find_mut(&source) {
                    user.display_host = host.clone();
                }
                router::one_to_all_but_sender(
                    &st.tree,
                    &source,
                    "FHOST",
                    vec![host],
                    &server,
                );
                Ok(Flow::Continue)
            }

            LinkCommand::ForceName { realname } => {
                let Some(server) = source_server else {
                    return Ok(Flow::Continue);
                };
                if let Some(user) = st.users.find_mut(&source) {
                    user.realname = realname.clone();
                }
                router::one_to_all_but_sender(
                    &st.tree,
                    &source,
                    "FNAME",
                    vec![realname],
                    &server,
                );
                Ok(Flow::Continue)
            }

            LinkCommand::OperType { class } => {
                let Some(server) = source_server else {
                    return Ok(Flow::Continue);
                };
                if let Some(user) = st.users.find_mut(&source) {
                    user.oper_type = Some(class.clone());
                    if !user.modes.contains('o') {
                        user.modes.push('o');
                    }
                }
                router::one_to_all_but_sender(
                    &st.tree,
                    &source,
                    "OPERTYPE",
                    vec![class],
                    &server,
                );
                Ok(Flow::Continue)
            }

            LinkCommand::Kill { nick, mut reason } => {
                let Some(server) = source_server else {
                    return Ok(Flow::Continue);
                };
                if st.users.contains(&nick) {
                    if !reason.starts_with('[') {
                        reason = format!("[{server}] Killed ({reason})");
                    }
                    router::one_to_all_but_sender(
                        &st.tree,
                        &source,
                        "KILL",
                        vec![nick.clone(), reason],
                        &server,
                    );
                    self.drop_user(st, &nick);
                }
                Ok(Flow::Continue)
            }

            LinkCommand::Metadata { target, key, value } => {
                let known = st.users.contains(&target)
                    || st.channels.find(&target).is_some();
                if known {
                    st.metadata.absorb(&target, &key, &value);
                }
                router::one_to_all_but_sender(
                    &st.tree,
                    &source,
                    "METADATA",
                    vec![target, key, value],
                    &source,
                );
                Ok(Flow::Continue)
            }

            LinkCommand::AddLine {
                category,
                raw_category,
                mask,
                source: line_source,
                set_time,
                duration,
                reason,
            } => {
                match category {
                    Some(category) => st.xlines.add(super::registry::XLine {
                        category,
                        mask: mask.clone(),
                        source: line_source.clone(),
                        set_time,
                        duration,
                        reason: reason.clone(),
                    }),
                    None => st.oper_notice(format!(
                        "Invalid x-line category '{raw_category}' from {source}, ignored"
                    )),
                }
                router::one_to_all_but_sender(
                    &st.tree,
                    &source,
                    "ADDLINE",
                    vec![
                        raw_category,
                        mask,
                        line_source,
                        set_time.to_string(),
                        duration.to_string(),
                        reason,
                    ],
                    &source,
                );
                Ok(Flow::Continue)
            }

            LinkCommand::Version { version } => {
                if let Some(node) = st.tree.find_mut(&source) {
                    node.version = version.clone();
                }
                router::one_to_all_but_sender(
                    &st.tree,
                    &source,
                    "VERSION",
                    vec![version],
                    &source,
                );
                Ok(Flow::Continue)
            }

            LinkCommand::Ping { token } => {
                self.handle
                    .send(Message::with_source(&local, "PONG", vec![token]));
                Ok(Flow::Continue)
            }

            LinkCommand::Pong { .. } => {
                // verify_direction already refreshed the route; make the
                // answer explicit for the named server too.
                if let Some(node) = st.tree.find_mut(&source) {
                    node.ping_answered = true;
                }
                Ok(Flow::Continue)
            }

            LinkCommand::Idle(round) => {
                self.remote_idle(st, &source, round);
                Ok(Flow::Continue)
            }

            LinkCommand::ForceNick { nick, new_nick, ts } => {
                if st.users.rename(&nick, &new_nick).is_ok() {
                    st.channels.rename_member(&nick, &new_nick);
                    if let Some(user) = st.users.find_mut(&new_nick) {
                        user.signon = ts;
                    }
                }
                router::one_to_all_but_sender(
                    &st.tree,
                    &source,
                    "SVSNICK",
                    vec![nick, new_nick, ts.to_string()],
                    &source,
                );
                Ok(Flow::Continue)
            }

            LinkCommand::ServiceJoin { nick, channel } => {
                if st.users.contains(&nick) {
                    st.channels
                        .get_or_create(&channel, now_secs())
                        .join(&nick, MemberRank::Normal);
                }
                router::one_to_all_but_sender(
                    &st.tree,
                    &source,
                    "SVSJOIN",
                    vec![nick, channel],
                    &source,
                );
                Ok(Flow::Continue)
            }

            LinkCommand::Rehash { mask } => {
                if glob_match(&mask, &local) {
                    st.oper_notice(format!(
                        "Remote rehash initiated from server {source}."
                    ));
                    st.rehash_pending = true;
                }
                router::one_to_all_but_sender(
                    &st.tree,
                    &source,
                    "REHASH",
                    vec![mask],
                    &source,
                );
                Ok(Flow::Continue)
            }

            // The peer's own burst bracketing.
            LinkCommand::Burst => {
                self.bursting = true;
                Ok(Flow::Continue)
            }
            LinkCommand::EndBurst => {
                self.bursting = false;
                debug!(peer = %self.peer_name(), "end of burst");
                Ok(Flow::Continue)
            }

            LinkCommand::Error { message } => Ok(self.peer_error(st, &message)),
            LinkCommand::Capab { .. } => Ok(Flow::Continue),
            LinkCommand::Cipher { .. } => Ok(Flow::Continue), // handled earlier

            LinkCommand::Quit { reason } => {
                let Some(server) = source_server else {
                    return Ok(Flow::Continue);
                };
                self.drop_user(st, &source);
                router::one_to_all_but_sender(
                    &st.tree,
                    &source,
                    "QUIT",
                    vec![reason],
                    &server,
                );
                Ok(Flow::Continue)
            }

            LinkCommand::Join { channels } => {
                for name in channels.split(',').filter(|c| !c.is_empty()) {
                    let ts = st
                        .channels
                        .find(name)
                        .map(|c| c.ts)
                        .unwrap_or_else(now_secs);
                    st.channels
                        .get_or_create(name, ts)
                        .join(&source, MemberRank::Normal);
                }
                let omit = self.peer_name();
                router::one_to_all_but_sender(
                    &st.tree,
                    &source,
                    "JOIN",
                    vec![channels],
                    &omit,
                );
                Ok(Flow::Continue)
            }

            LinkCommand::Part { channel, reason } => {
                if let Some(chan) = st.channels.find_mut(&channel) {
                    chan.part(&source);
                }
                let omit = self.peer_name();
                router::one_to_all_but_sender(
                    &st.tree,
                    &source,
                    "PART",
                    vec![channel, reason],
                    &omit,
                );
                Ok(Flow::Continue)
            }

            LinkCommand::Topic { channel, topic } => {
                if let Some(chan) = st.channels.find_mut(&channel) {
                    chan.topic = Some(super::registry::Topic {
                        text: topic.clone(),
                        set_by: source.clone(),
                        set_at: now_secs(),
                    });
                }
                let omit = self.peer_name();
                router::one_to_all_but_sender(
                    &st.tree,
                    &source,
                    "TOPIC",
                    vec![channel, topic],
                    &omit,
                );
                Ok(Flow::Continue)
            }

            LinkCommand::Kick {
                channel,
                nick,
                reason,
            } => {
                if let Some(chan) = st.channels.find_mut(&channel) {
                    chan.part(&nick);
                }
                let omit = self.peer_name();
                router::one_to_all_but_sender(
                    &st.tree,
                    &source,
                    "KICK",
                    vec![channel, nick, reason],
                    &omit,
                );
                Ok(Flow::Continue)
            }

            LinkCommand::Invite { nick, channel } => {
                let omit = self.peer_name();
                router::one_to_all_but_sender(
                    &st.tree,
                    &source,
                    "INVITE",
                    vec![nick, channel],
                    &omit,
                );
                Ok(Flow::Continue)
            }

            LinkCommand::Wallops { text } => {
                let omit = self.peer_name();
                router::one_to_all_but_sender(
                    &st.tree,
                    &source,
                    "WALLOPS",
                    vec![text],
                    &omit,
                );
                Ok(Flow::Continue)
            }

            LinkCommand::Privmsg { target, text } => {
                let msg = Message {
                    prefix: prefix.clone(),
                    command: "PRIVMSG".into(),
                    params: vec![target, text],
                };
                let omit = self.peer_name();
                router::one_to_all_but_sender_raw(
                    &st.tree,
                    &st.users,
                    &st.channels,
                    &msg,
                    &omit,
                );
                Ok(Flow::Continue)
            }

            LinkCommand::Notice { target, text } => {
                let msg = Message {
                    prefix: prefix.clone(),
                    command: "NOTICE".into(),
                    params: vec![target, text],
                };
                let omit = self.peer_name();
                router::one_to_all_but_sender_raw(
                    &st.tree,
                    &st.users,
                    &st.channels,
                    &msg,
                    &omit,
                );
                Ok(Flow::Continue)
            }

            LinkCommand::Relay(msg) => {
                // Only traffic with a verified origin is forwarded.
                if source_server.is_none() {
                    debug!(command = %msg.command, "relay without source, dropping");
                    return Ok(Flow::Continue);
                }
                let omit = self.peer_name();
                router::one_to_all_but_sender_raw(
                    &st.tree,
                    &st.users,
                    &st.channels,
                    &msg,
                    &omit,
                );
                Ok(Flow::Continue)
            }
        }
    }

    fn apply_modes(&self, st: &mut ServerState, source: &str, target: &str, modes: &[String]) {
        if target.starts_with('#') {
            if let Some(chan) = st.channels.find_mut(target) {
                chan.apply_modes(source, now_secs(), modes);
            }
        } else if let Some(user) = st.users.find_mut(target) {
            let Some(spec) = modes.first() else { return };
            let mut adding = true;
            for c in spec.chars() {
                match c {
                    '+' => adding = true,
                    '-' => adding = false,
                    letter => {
                        if adding {
                            if !user.modes.contains(letter) {
                                user.modes.push(letter);
                            }
                        } else {
                            user.modes.retain(|m| m != letter);
                        }
                    }
                }
            }
        }
    }

    fn drop_user(&self, st: &mut ServerState, nick: &str) {
        if let Some(user) = st.users.remove(nick) {
            st.channels.part_all(nick);
            if let Some(node) = st.tree.find_mut(&user.server) {
                node.user_count = node.user_count.saturating_sub(1);
            }
        }
    }

    /// The remote-idle round trip behind cross-server WHOIS. An unknown
    /// target or unroutable hop is a routing miss: silently dropped, the
    /// network may still be converging.
    fn remote_idle(&self, st: &mut ServerState, source: &str, round: IdleRound) {
        match round {
            IdleRound::Request { nick } => {
                let Some(target) = st.users.find(&nick) else { return };
                if st.tree.is_root(&target.server) {
                    let signon = target.signon;
                    let idle = now_secs().saturating_sub(target.idle_since);
                    let target_nick = target.nick.clone();
                    let Some(requester) = st.users.find(source) else {
                        return;
                    };
                    let back_to = requester.server.clone();
                    router::one_to_one(
                        &st.tree,
                        &target_nick,
                        "IDLE",
                        vec![source.to_owned(), signon.to_string(), idle.to_string()],
                        &back_to,
                    );
                } else {
                    let server = target.server.clone();
                    router::one_to_one(&st.tree, source, "IDLE", vec![nick], &server);
                }
            }
            IdleRound::Reply {
                requester,
                signon,
                idle,
            } => {
                let Some(user) = st.users.find(&requester) else { return };
                if st.tree.is_root(&user.server) {
                    st.emit(LinkEvent::WhoisIdle {
                        requester,
                        nick: source.to_owned(),
                        signon,
                        idle,
                    });
                } else {
                    let server = user.server.clone();
                    router::one_to_one(
                        &st.tree,
                        source,
                        "IDLE",
                        vec![requester, signon.to_string(), idle.to_string()],
                        &server,
                    );
                }
            }
        }
    }

    // ── Failure + teardown ───────────────────────────────────────

    async fn fail(&self, framed: &mut LinkFramed, error: SessionError) {
        {
            let st = self.shared.read().await;
            match &error {
                SessionError::AuthenticationFailure(_)
                | SessionError::CapabilityMismatch { .. }
                | SessionError::EncryptionPolicy(_) => {
                    st.oper_notice(format!(
                        "Link with {} refused: {error}",
                        self.peer_name()
                    ));
                }
                _ => {}
            }
        }
        warn!(peer = %self.peer_name(), "closing link: {error}");
        let _ = framed
            .send(Message::new("ERROR", vec![error.to_string()]))
            .await;
    }

    /// A closed transport on a linked connection is a netsplit; anything
    /// earlier just goes away.
    async fn teardown(&self) {
        let Some(name) = &self.registered_name else {
            debug!(peer = %self.peer_name(), "connection closed before linking");
            return;
        };
        let mut st = self.shared.write().await;
        let owned = st
            .tree
            .find(name)
            .and_then(|n| n.handle.as_ref())
            .map(|h| h.id == self.id)
            .unwrap_or(false);
        if owned {
            st.oper_notice(format!("Server {name}[{}] closed the connection.", self.addr));
            netsplit::squit(&mut st, name, "connection closed");
        }
    }
}
