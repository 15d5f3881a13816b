//! Integration tests for the server-linking core: handshake over real TCP,
//! burst application, routing, netsplit teardown, and the failure paths
//! that must close a link before any state is exchanged.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::RwLock;

use tarn::link::cipher::LinkCipher;
use tarn::link::config::{LinkBlock, LinkConfig};
use tarn::link::hooks;
use tarn::link::message::Message;
use tarn::link::netsplit;
use tarn::link::registry::{MemberRank, User, XLine, XLineCategory};
use tarn::link::router;
use tarn::link::server::{self, LinkEvent, ServerState, SharedState};
use tarn::link::session::{self, SessionHandle};

fn config_for(name: &str, links: Vec<LinkBlock>) -> LinkConfig {
    LinkConfig {
        server_name: name.to_owned(),
        description: format!("{name} test server"),
        binds: vec!["127.0.0.1:0".to_owned()],
        capabilities: Vec::new(),
        links,
    }
}

fn link_block(name: &str, port: u16, send: &str, recv: &str) -> LinkBlock {
    LinkBlock {
        name: name.to_owned(),
        address: "127.0.0.1".to_owned(),
        port,
        send_secret: send.to_owned(),
        recv_secret: recv.to_owned(),
        autoconnect_secs: 0,
        cipher_key: None,
    }
}

fn test_user(nick: &str, server: &str) -> User {
    User {
        nick: nick.to_owned(),
        ident: nick.to_owned(),
        host: "host.example".to_owned(),
        display_host: "cloak.example".to_owned(),
        ip: "10.0.0.1".to_owned(),
        signon: 1_136_214_245,
        modes: "i".to_owned(),
        realname: nick.to_uppercase(),
        server: server.to_owned(),
        oper_type: None,
        idle_since: 1_136_214_245,
    }
}

/// Poll an async condition until it holds or the deadline passes.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Start alpha listening and beta dialing it; returns both states after
/// the dial has been spawned.
async fn linked_pair(
    alpha_extra_cipher: Option<&str>,
) -> (SharedState, SharedState) {
    let mut alpha_block_for_beta =
        link_block("beta.tarn.test", 0, "alpha-out", "beta-in");
    alpha_block_for_beta.cipher_key = alpha_extra_cipher.map(str::to_owned);
    let (alpha, alpha_addrs) = server::start(
        config_for("alpha.tarn.test", vec![alpha_block_for_beta]),
        None,
    )
    .await
    .unwrap();

    let mut beta_block_for_alpha = link_block(
        "alpha.tarn.test",
        alpha_addrs[0].port(),
        "beta-in",
        "alpha-out",
    );
    beta_block_for_alpha.cipher_key = alpha_extra_cipher.map(str::to_owned);
    let (beta, _beta_addrs) = server::start(
        config_for("beta.tarn.test", vec![beta_block_for_alpha.clone()]),
        None,
    )
    .await
    .unwrap();

    tokio::spawn(session::connect(beta_block_for_alpha, Arc::clone(&beta)));
    (alpha, beta)
}

async fn is_linked(state: &SharedState, peer: &str) -> bool {
    let st = state.read().await;
    st.tree
        .find(peer)
        .map(|n| n.is_directly_linked())
        .unwrap_or(false)
}

// ── Scenario A: direct link reaches Linked ───────────────────────────

#[tokio::test]
async fn direct_link_authenticates_and_routes() {
    let (alpha, beta) = linked_pair(None).await;

    assert!(eventually(|| is_linked(&alpha, "beta.tarn.test")).await);
    assert!(eventually(|| is_linked(&beta, "alpha.tarn.test")).await);

    let st = alpha.read().await;
    let node = st.tree.find("beta.tarn.test").unwrap();
    assert_eq!(node.parent(), Some("alpha.tarn.test"));
    assert_eq!(
        st.tree.route_for("beta.tarn.test").unwrap().name,
        "beta.tarn.test"
    );
}

// ── Scenario B: relayed introduction routes through the relayer ──────

#[tokio::test]
async fn relayed_server_routes_through_its_introducer() {
    let (alpha, beta) = linked_pair(None).await;
    assert!(eventually(|| is_linked(&alpha, "beta.tarn.test")).await);

    // Beta introduces a third server hanging off itself.
    {
        let st = beta.read().await;
        let handle = st
            .tree
            .find("alpha.tarn.test")
            .and_then(|n| n.handle.clone())
            .unwrap();
        handle.send(Message::with_source(
            "beta.tarn.test",
            "SERVER",
            vec![
                "gamma.tarn.test".into(),
                "*".into(),
                "1".into(),
                "gamma".into(),
            ],
        ));
    }

    assert!(
        eventually(|| async {
            alpha.read().await.tree.contains("gamma.tarn.test")
        })
        .await
    );
    let st = alpha.read().await;
    assert_eq!(
        st.tree.route_for("gamma.tarn.test").unwrap().name,
        "beta.tarn.test"
    );
    assert_eq!(
        st.tree.find("gamma.tarn.test").unwrap().parent(),
        Some("beta.tarn.test")
    );
}

// ── Scenario C: link loss tears down the whole subtree ───────────────

#[tokio::test]
async fn link_loss_splits_subtree_and_users() {
    let (alpha, beta) = linked_pair(None).await;
    assert!(eventually(|| is_linked(&alpha, "beta.tarn.test")).await);

    let mut events = alpha.read().await.subscribe();

    // Introduce gamma behind beta, plus a user homed on it.
    {
        let st = beta.read().await;
        let handle = st
            .tree
            .find("alpha.tarn.test")
            .and_then(|n| n.handle.clone())
            .unwrap();
        handle.send(Message::with_source(
            "beta.tarn.test",
            "SERVER",
            vec![
                "gamma.tarn.test".into(),
                "*".into(),
                "1".into(),
                "gamma".into(),
            ],
        ));
        handle.send(Message::with_source(
            "gamma.tarn.test",
            "NICK",
            vec![
                "100".into(),
                "gia".into(),
                "host.example".into(),
                "cloak.example".into(),
                "gia".into(),
                "+i".into(),
                "10.0.0.7".into(),
                "Gia".into(),
            ],
        ));
    }
    assert!(
        eventually(|| async { alpha.read().await.users.contains("gia") }).await
    );

    // Sever the link from beta's side.
    {
        let st = beta.read().await;
        st.tree
            .find("alpha.tarn.test")
            .and_then(|n| n.handle.clone())
            .unwrap()
            .shutdown();
    }

    assert!(
        eventually(|| async {
            let st = alpha.read().await;
            !st.tree.contains("beta.tarn.test")
                && !st.tree.contains("gamma.tarn.test")
                && !st.users.contains("gia")
        })
        .await
    );

    // The split event carries a composite reason naming both servers.
    let mut split_reason = None;
    while let Ok(event) = events.try_recv() {
        if let LinkEvent::NetSplit { server, removed } = event {
            assert_eq!(server, "beta.tarn.test");
            split_reason = removed
                .iter()
                .find(|(nick, _)| nick == "gia")
                .map(|(_, reason)| reason.clone());
        }
    }
    let reason = split_reason.expect("netsplit event with gia");
    assert!(reason.contains("beta.tarn.test"));
    assert!(reason.contains("gamma.tarn.test"));
    assert!(reason.contains("connection closed"));
}

// ── Scenario D: channel traffic is pruned to member-bearing routes ───

#[tokio::test]
async fn channel_message_written_once_to_the_right_peer() {
    // State-level: alpha with direct peers beta and gamma; #test members
    // are only reachable via beta.
    let mut st = ServerState::new(config_for("alpha.tarn.test", vec![]));
    let (beta_tx, mut beta_rx) = tokio::sync::mpsc::unbounded_channel();
    let (gamma_tx, mut gamma_rx) = tokio::sync::mpsc::unbounded_channel();
    st.tree
        .insert_child(
            "alpha.tarn.test",
            "beta.tarn.test",
            "beta",
            Some(SessionHandle::new(1, beta_tx)),
        )
        .unwrap();
    st.tree
        .insert_child(
            "alpha.tarn.test",
            "gamma.tarn.test",
            "gamma",
            Some(SessionHandle::new(2, gamma_tx)),
        )
        .unwrap();
    st.users.insert(test_user("bee", "beta.tarn.test")).unwrap();
    st.users.insert(test_user("ana", "alpha.tarn.test")).unwrap();
    st.channels.get_or_create("#test", 1).join("bee", MemberRank::Normal);
    st.channels.get_or_create("#test", 1).join("ana", MemberRank::Normal);

    let msg = Message::with_source("ana", "PRIVMSG", vec!["#test".into(), "hi".into()]);
    router::one_to_all_but_sender_raw(&st.tree, &st.users, &st.channels, &msg, "alpha.tarn.test");

    let mut beta_count = 0;
    while let Ok(cmd) = beta_rx.try_recv() {
        if matches!(cmd, tarn::link::session::SessionCommand::Line(_)) {
            beta_count += 1;
        }
    }
    assert_eq!(beta_count, 1);
    assert!(gamma_rx.try_recv().is_err());
}

// ── Burst application end to end ─────────────────────────────────────

#[tokio::test]
async fn burst_transfers_users_channels_and_bans() {
    // Seed alpha before the link comes up.
    let mut alpha_block = link_block("beta.tarn.test", 0, "alpha-out", "beta-in");
    alpha_block.autoconnect_secs = 0;
    let (alpha, alpha_addrs) = server::start(
        config_for("alpha.tarn.test", vec![alpha_block]),
        None,
    )
    .await
    .unwrap();
    {
        let mut st = alpha.write().await;
        assert!(hooks::user_connected(&mut st, test_user("ana", "alpha.tarn.test")));
        hooks::user_opered(&mut st, "ana", "netadmin");
        hooks::user_joined(&mut st, "ana", "#tarn");
        hooks::topic_changed(&mut st, "ana", "#tarn", "welcome");
        hooks::xline_added(
            &mut st,
            XLine {
                category: XLineCategory::Global,
                mask: "*@bad.example".into(),
                source: "ana".into(),
                set_time: 4242,
                duration: 0,
                reason: "spam".into(),
            },
        );
    }

    let beta_block = link_block(
        "alpha.tarn.test",
        alpha_addrs[0].port(),
        "beta-in",
        "alpha-out",
    );
    let (beta, _) = server::start(
        config_for("beta.tarn.test", vec![beta_block.clone()]),
        None,
    )
    .await
    .unwrap();
    tokio::spawn(session::connect(beta_block, Arc::clone(&beta)));

    assert!(
        eventually(|| async {
            let st = beta.read().await;
            st.users.contains("ana") && st.channels.find("#tarn").is_some()
        })
        .await
    );

    let st = beta.read().await;
    let ana = st.users.find("ana").unwrap();
    assert!(ana.is_oper());
    assert_eq!(ana.oper_type.as_deref(), Some("netadmin"));
    assert_eq!(ana.server, "alpha.tarn.test");

    let chan = st.channels.find("#tarn").unwrap();
    assert_eq!(chan.rank_of("ana"), Some(MemberRank::Op));
    assert_eq!(chan.topic.as_ref().unwrap().text, "welcome");

    let line = st.xlines.iter().next().unwrap();
    assert_eq!(line.set_time, 4242);
    assert_eq!(line.mask, "*@bad.example");
}

// ── Live propagation after the burst ─────────────────────────────────

#[tokio::test]
async fn live_user_introduction_crosses_the_link() {
    let (alpha, beta) = linked_pair(None).await;
    assert!(eventually(|| is_linked(&beta, "alpha.tarn.test")).await);

    {
        let mut st = alpha.write().await;
        assert!(hooks::user_connected(&mut st, test_user("cay", "alpha.tarn.test")));
    }
    assert!(
        eventually(|| async { beta.read().await.users.contains("cay") }).await
    );
    let st = beta.read().await;
    assert_eq!(st.users.find("cay").unwrap().server, "alpha.tarn.test");
    assert_eq!(
        st.tree.find("alpha.tarn.test").unwrap().user_count,
        1
    );
}

// ── Failure paths close before any burst ─────────────────────────────

/// A raw probe client speaking just enough of the protocol to trip the
/// failure paths.
async fn probe(
    addr: std::net::SocketAddr,
    lines: Vec<String>,
) -> Vec<String> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    for line in lines {
        write_half
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }
    let mut seen = Vec::new();
    let mut reader = BufReader::new(read_half).lines();
    while let Ok(Ok(Some(line))) =
        tokio::time::timeout(Duration::from_secs(2), reader.next_line()).await
    {
        seen.push(line);
    }
    seen
}

#[tokio::test]
async fn capability_mismatch_closes_before_burst() {
    let (_, addrs) = server::start(
        config_for(
            "alpha.tarn.test",
            vec![link_block("beta.tarn.test", 0, "alpha-out", "beta-in")],
        ),
        None,
    )
    .await
    .unwrap();

    let seen = probe(addrs[0], vec!["CAPAB :WRONG,SET".into()]).await;
    assert!(seen.iter().any(|l| l.starts_with("ERROR")));
    assert!(!seen.iter().any(|l| l.contains("BURST")));
}

#[tokio::test]
async fn wrong_secret_is_refused() {
    let config = config_for(
        "alpha.tarn.test",
        vec![link_block("beta.tarn.test", 0, "alpha-out", "beta-in")],
    );
    let capab = config.capab_string();
    let (_, addrs) = server::start(config, None).await.unwrap();

    let seen = probe(
        addrs[0],
        vec![
            format!("CAPAB :{capab}"),
            "SERVER beta.tarn.test wrong-secret 0 :imposter".into(),
        ],
    )
    .await;
    assert!(seen.iter().any(|l| l.contains("Invalid credentials")));
    assert!(!seen.iter().any(|l| l.contains("BURST")));
}

#[tokio::test]
async fn nonzero_hop_count_is_refused() {
    let config = config_for(
        "alpha.tarn.test",
        vec![link_block("beta.tarn.test", 0, "alpha-out", "beta-in")],
    );
    let capab = config.capab_string();
    let (_, addrs) = server::start(config, None).await.unwrap();

    let seen = probe(
        addrs[0],
        vec![
            format!("CAPAB :{capab}"),
            "SERVER beta.tarn.test beta-in 2 :too far".into(),
        ],
    )
    .await;
    assert!(seen.iter().any(|l| l.contains("too far away")));
}

#[tokio::test]
async fn configured_cipher_refuses_plaintext_hello() {
    let mut block = link_block("beta.tarn.test", 0, "alpha-out", "beta-in");
    block.cipher_key = Some("0123456789abcdef".into());
    let config = config_for("alpha.tarn.test", vec![block]);
    let capab = config.capab_string();
    let (_, addrs) = server::start(config, None).await.unwrap();

    let seen = probe(
        addrs[0],
        vec![
            format!("CAPAB :{capab}"),
            "SERVER beta.tarn.test beta-in 0 :plaintext".into(),
        ],
    )
    .await;
    assert!(seen
        .iter()
        .any(|l| l.contains("requires encryption") || l.contains("plaintext")));
}

// ── Ciphered links ───────────────────────────────────────────────────

#[tokio::test]
async fn ciphered_link_reaches_linked() {
    let (alpha, beta) = linked_pair(Some("0123456789abcdef")).await;
    assert!(eventually(|| is_linked(&alpha, "beta.tarn.test")).await);
    assert!(eventually(|| is_linked(&beta, "alpha.tarn.test")).await);
}

#[tokio::test]
async fn cipher_round_trip_all_key_lengths() {
    for len in [16usize, 24, 32] {
        let cipher = LinkCipher::new(&vec![0x5a; len]).unwrap();
        let line = ":alpha.tarn.test FJOIN #tarn 10 :@ana +bee";
        assert_eq!(cipher.open(&cipher.seal(line).unwrap()).unwrap(), line);
    }
}

// ── Netsplit engine invariants (in-process) ──────────────────────────

#[tokio::test]
async fn squit_batch_matches_spec_shape() {
    let mut st = ServerState::new(config_for("alpha.tarn.test", vec![]));
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    st.tree
        .insert_child(
            "alpha.tarn.test",
            "beta.tarn.test",
            "beta",
            Some(SessionHandle::new(1, tx)),
        )
        .unwrap();
    st.tree
        .insert_child("beta.tarn.test", "gamma.tarn.test", "gamma", None)
        .unwrap();
    st.users.insert(test_user("bee", "beta.tarn.test")).unwrap();
    st.users.insert(test_user("gia", "gamma.tarn.test")).unwrap();
    st.users.insert(test_user("ana", "alpha.tarn.test")).unwrap();

    let summary = netsplit::squit(&mut st, "beta.tarn.test", "connection closed").unwrap();
    assert_eq!(summary.lost_servers, 2);
    assert_eq!(summary.lost_users, 2);
    assert!(st.users.contains("ana"));
    assert!(st.tree.find_glob("beta.*").is_none());
    assert!(st.tree.find_glob("gamma.*").is_none());
}

// ── Shared state + embedding surface ─────────────────────────────────

#[tokio::test]
async fn embedded_state_can_be_driven_without_listeners() {
    // The lib surface the client layer uses: a bare shared state.
    let state: SharedState = Arc::new(RwLock::new(ServerState::new(config_for(
        "solo.tarn.test",
        vec![],
    ))));
    let mut st = state.write().await;
    assert!(hooks::user_connected(&mut st, test_user("ana", "solo.tarn.test")));
    hooks::user_joined(&mut st, "ana", "#tarn");
    assert_eq!(st.channels.find("#tarn").unwrap().member_count(), 1);
    assert_eq!(st.tree.count_all(), 1);
    assert_eq!(st.tree.count_local(), 0);
}
