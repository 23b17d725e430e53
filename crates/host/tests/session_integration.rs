//! End-to-end tests for the shared-terminal session.
//!
//! Each test binds a real session on 127.0.0.1 with an in-memory terminal
//! source and drives it with the bundled viewer or a raw framed client.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use host::io::{recv_payload, send_payload, OpContext, Tracker};
use host::pty::{ChannelFeed, ChannelSource};
use host::session::SessionConfig;
use host::{Connection, DicewareAuthority, HostError, Session, Viewer, ViewerEvent};
use protocol::{
    AuthMessage, Content, ErrorCode, Header, InfoMessage, InfoType, ShrinkKind, TerminalContent,
};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    session: Session,
    feed: ChannelFeed,
}

fn test_config(max_clients: usize) -> SessionConfig {
    SessionConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        owner: "operator".to_string(),
        max_clients,
        rotation_interval: Duration::from_secs(3600),
        auth_timeout: Duration::from_secs(5),
        kick_timeout: Duration::from_secs(2),
        shutdown_timeout: Duration::from_secs(10),
        ..SessionConfig::default()
    }
}

async fn start_with(config: SessionConfig) -> Harness {
    let (source, feed) = ChannelSource::new();
    let session = Session::bind(
        config,
        Arc::new(DicewareAuthority::new(3, 4)),
        Arc::new(source),
        None,
    )
    .await
    .unwrap();
    Harness { session, feed }
}

async fn start(max_clients: usize) -> Harness {
    start_with(test_config(max_clients)).await
}

async fn join(session: &Session, name: &str) -> Viewer {
    let mut viewer = Viewer::connect(session.local_addr(), name, ShrinkKind::None)
        .await
        .unwrap();
    viewer
        .authenticate(&session.current_passphrase(), WAIT)
        .await
        .unwrap();
    viewer
}

async fn next_output(viewer: &mut Viewer) -> Vec<u8> {
    match viewer.next_event(Some(WAIT)).await.unwrap() {
        ViewerEvent::Output(bytes) => bytes,
        other => panic!("expected output, got {:?}", other),
    }
}

/// Polls `check` until it holds or `WAIT` passes.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// A client speaking the wire protocol directly.
struct RawClient {
    conn: Connection,
    tracker: Arc<Tracker>,
}

impl RawClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            conn: Connection::from_tcp(stream),
            tracker: Tracker::new(),
        }
    }

    fn ctx() -> OpContext {
        OpContext::with_timeout(CancellationToken::new(), WAIT)
    }

    async fn recv(&self) -> Content {
        recv_payload(&Self::ctx(), &self.conn, &self.tracker)
            .await
            .unwrap()
            .content
    }

    async fn send(&self, header: Header, content: Content) {
        send_payload(&Self::ctx(), &self.conn, &self.tracker, header, content)
            .await
            .unwrap();
    }

    async fn login(&self, name: &str, passphrase: &str) {
        assert_eq!(self.recv().await, Content::Auth(AuthMessage::Request));
        self.send(
            Header::Auth,
            Content::Auth(AuthMessage::response(name, passphrase)),
        )
        .await;
        match self.recv().await {
            Content::Info(info) => assert_eq!(info.info_type, InfoType::AuthSuccess),
            other => panic!("expected AUTH_SUCCESS, got {:?}", other),
        }
    }
}

// =============================================================================
// Admission
// =============================================================================

#[tokio::test]
async fn test_correct_passphrase_registers_once() {
    let h = start(5).await;
    let _alice = join(&h.session, "alice").await;

    let list = h.session.client_list().await;
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].name, "alice");
    assert!(list[0].addr.starts_with("127.0.0.1:"));
    assert_eq!(h.session.client_count().await, 2);
    assert_eq!(h.session.client_count_label().await, "2/5");

    h.session.end().await;
}

#[tokio::test]
async fn test_server_full_rejects_extra_connection() {
    let h = start(2).await;
    let _alice = join(&h.session, "alice").await;

    let mut bob = Viewer::connect(h.session.local_addr(), "bob", ShrinkKind::None)
        .await
        .unwrap();
    let err = bob
        .authenticate(&h.session.current_passphrase(), WAIT)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        HostError::Rejected {
            code: ErrorCode::ServerFull,
            ..
        }
    ));
    assert_eq!(h.session.client_count().await, 2);
    assert_eq!(h.session.client_list().await.len(), 1);

    h.session.end().await;
}

#[tokio::test]
async fn test_full_session_closes_connection_after_refusal() {
    let h = start(2).await;
    let _alice = join(&h.session, "alice").await;

    let raw = RawClient::connect(h.session.local_addr()).await;
    match raw.recv().await {
        Content::Error(err) => assert_eq!(err.code, ErrorCode::ServerFull),
        other => panic!("expected SERVER_FULL, got {:?}", other),
    }
    let after = recv_payload(&RawClient::ctx(), &raw.conn, &raw.tracker).await;
    assert!(matches!(after, Err(e) if e.is_closed()));

    h.session.end().await;
}

#[tokio::test]
async fn test_simultaneous_connections_never_exceed_capacity() {
    let h = start(3).await;
    let addr = h.session.local_addr();
    let passphrase = h.session.current_passphrase();

    let sampler = {
        let session = h.session.clone();
        tokio::spawn(async move {
            let mut peak = 0;
            for _ in 0..100 {
                peak = peak.max(session.client_count().await);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            peak
        })
    };

    let mut attempts = tokio::task::JoinSet::new();
    for i in 0..6 {
        let passphrase = passphrase.clone();
        attempts.spawn(async move {
            let raw = RawClient::connect(addr).await;
            let first = raw.recv().await;
            let outcome = match first {
                Content::Auth(AuthMessage::Request) => {
                    raw.send(
                        Header::Auth,
                        Content::Auth(AuthMessage::response(format!("viewer-{}", i), passphrase)),
                    )
                    .await;
                    raw.recv().await
                }
                other => other,
            };
            (raw, outcome)
        });
    }

    let mut admitted = 0;
    let mut refused = 0;
    let mut clients = Vec::new();
    while let Some(joined) = attempts.join_next().await {
        let (raw, outcome) = joined.unwrap();
        match outcome {
            Content::Info(info) if info.info_type == InfoType::AuthSuccess => admitted += 1,
            Content::Error(err) if err.code == ErrorCode::ServerFull => refused += 1,
            other => panic!("unexpected admission outcome {:?}", other),
        }
        clients.push(raw);
    }

    assert_eq!(admitted, 2);
    assert_eq!(refused, 4);
    assert_eq!(h.session.client_count().await, 3);
    assert!(sampler.await.unwrap() <= 3);

    h.session.end().await;
}

#[tokio::test]
async fn test_wrong_passphrases_leave_registry_unchanged() {
    let h = start(5).await;
    let _alice = join(&h.session, "alice").await;
    let before = h.session.client_list().await;

    let mut eve = Viewer::connect(h.session.local_addr(), "eve", ShrinkKind::None)
        .await
        .unwrap();
    let err = eve.authenticate("not the passphrase", WAIT).await.unwrap_err();

    assert!(matches!(
        err,
        HostError::Rejected {
            code: ErrorCode::AuthFailed,
            ..
        }
    ));
    assert_eq!(h.session.client_list().await, before);
    assert_eq!(h.session.client_count().await, 2);

    h.session.end().await;
}

#[tokio::test]
async fn test_early_exit_during_handshake() {
    let h = start(5).await;
    let raw = RawClient::connect(h.session.local_addr()).await;

    assert_eq!(raw.recv().await, Content::Auth(AuthMessage::Request));
    raw.send(
        Header::Info,
        Content::Info(InfoMessage::new(InfoType::Shutdown, "never mind")),
    )
    .await;

    match raw.recv().await {
        Content::Error(err) => assert_eq!(err.code, ErrorCode::AuthFailed),
        other => panic!("expected AUTH_FAILED, got {:?}", other),
    }
    assert_eq!(h.session.client_count().await, 1);

    h.session.end().await;
}

// =============================================================================
// Broadcast
// =============================================================================

#[tokio::test]
async fn test_terminal_chunk_keeps_length_and_checksum() {
    let h = start(5).await;
    let raw = RawClient::connect(h.session.local_addr()).await;
    raw.login("alice", &h.session.current_passphrase()).await;

    let chunk: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    let expected = TerminalContent::new("reference", chunk.clone()).checksum;
    assert!(h.feed.send(chunk.clone()));

    match raw.recv().await {
        Content::Terminal(content) => {
            assert_eq!(content.length, 1024);
            assert_eq!(content.checksum, expected);
            assert_eq!(content.data, chunk);
            content.verify().unwrap();
        }
        other => panic!("expected terminal data, got {:?}", other),
    }

    h.session.end().await;
}

#[tokio::test]
async fn test_broadcast_reaches_every_viewer_in_order() {
    let h = start(5).await;
    let mut alice = join(&h.session, "alice").await;
    let mut bob = join(&h.session, "bob").await;

    for line in ["one\r\n", "two\r\n", "three\r\n"] {
        assert!(h.feed.send(line));
    }

    for viewer in [&mut alice, &mut bob] {
        assert_eq!(next_output(viewer).await, b"one\r\n");
        assert_eq!(next_output(viewer).await, b"two\r\n");
        assert_eq!(next_output(viewer).await, b"three\r\n");
    }

    h.session.end().await;
}

#[tokio::test]
async fn test_output_burst_larger_than_queue_reaches_reading_viewer() {
    let mut config = test_config(5);
    config.pipeline.queue_depth = 16;
    let h = start_with(config).await;
    let mut alice = join(&h.session, "alice").await;

    for i in 0..64 {
        assert!(h.feed.send(format!("{:04}{}", i, "b".repeat(1020))));
    }
    for i in 0..64 {
        let chunk = next_output(&mut alice).await;
        assert_eq!(chunk.len(), 1024);
        assert!(chunk.starts_with(format!("{:04}", i).as_bytes()));
    }
    assert_eq!(h.session.client_count().await, 2);

    h.session.end().await;
}

#[tokio::test]
async fn test_lz4_session_round_trips_output() {
    let mut config = test_config(5);
    config.pipeline.shrink = ShrinkKind::Lz4;
    let h = start_with(config).await;

    let mut alice = Viewer::connect(h.session.local_addr(), "alice", ShrinkKind::Lz4)
        .await
        .unwrap();
    alice
        .authenticate(&h.session.current_passphrase(), WAIT)
        .await
        .unwrap();

    let screen = b"\x1b[2J\x1b[H$ top\r\n".repeat(64);
    assert!(h.feed.send(screen.clone()));
    assert_eq!(next_output(&mut alice).await, screen);

    h.session.end().await;
}

// =============================================================================
// Leaving and liveness
// =============================================================================

#[tokio::test]
async fn test_client_leave_is_acknowledged_and_unregistered() {
    let h = start(5).await;
    let mut alice = join(&h.session, "alice").await;
    assert_eq!(h.session.client_count().await, 2);

    assert!(alice.leave(WAIT).await.unwrap());

    let session = h.session.clone();
    assert!(eventually(|| {
        let session = session.clone();
        async move { session.client_count().await == 1 }
    })
    .await);
    assert!(eventually(|| {
        let session = session.clone();
        async move { session.pipeline().consumer_count().await == 0 }
    })
    .await);

    h.session.end().await;
}

#[tokio::test]
async fn test_silent_client_is_dropped() {
    let mut config = test_config(5);
    config.heartbeat_interval = Duration::from_millis(150);
    let h = start_with(config).await;

    let quiet = RawClient::connect(h.session.local_addr()).await;
    quiet.login("quiet", &h.session.current_passphrase()).await;

    let chatty = join(&h.session, "chatty").await;
    let _heartbeat = chatty.spawn_heartbeat(Duration::from_millis(50));

    let session = h.session.clone();
    assert!(eventually(|| {
        let session = session.clone();
        async move { session.client_count().await == 2 }
    })
    .await);

    let names: Vec<String> = h
        .session
        .client_list()
        .await
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(names, vec!["chatty".to_string()]);

    h.session.end().await;
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_end_notifies_viewers_and_stops_everything() {
    let h = start(5).await;
    let mut alice = join(&h.session, "alice").await;
    let mut bob = join(&h.session, "bob").await;
    let addr = h.session.local_addr();

    let report = h.session.end().await;
    assert_eq!(report.notified, 2);
    assert!(report.quiesced);

    for viewer in [&mut alice, &mut bob] {
        match viewer.next_event(Some(WAIT)).await.unwrap() {
            ViewerEvent::Ended(_) => {}
            other => panic!("expected shutdown notice, got {:?}", other),
        }
    }

    let tracker = h.session.tracker();
    assert_eq!(tracker.reads(), 0);
    assert_eq!(tracker.writes(), 0);
    assert_eq!(h.session.client_count().await, 1);
    assert!(TcpStream::connect(addr).await.is_err());

    h.feed.send("after the end");
    for viewer in [&mut alice, &mut bob] {
        let next = viewer.next_event(Some(Duration::from_millis(500))).await;
        assert!(!matches!(next, Ok(ViewerEvent::Output(_))));
    }
}

#[tokio::test]
async fn test_end_with_idle_viewer_is_prompt() {
    let h = start(5).await;
    let _alice = join(&h.session, "alice").await;

    let began = tokio::time::Instant::now();
    let report = h.session.end().await;
    let took = began.elapsed();

    assert!(report.quiesced);
    assert_eq!(report.notified, 1);
    assert!(took < Duration::from_secs(2), "end took {:?}", took);
}

#[tokio::test]
async fn test_end_twice_returns_same_report() {
    let h = start(5).await;
    let _alice = join(&h.session, "alice").await;

    let first = h.session.end().await;
    let second = h.session.end().await;
    assert_eq!(first, second);
    assert_eq!(first.notified, 1);
}

#[tokio::test]
async fn test_shell_exit_ends_session() {
    let Harness { session, feed } = start(5).await;
    let mut alice = join(&session, "alice").await;

    drop(feed);
    let report = tokio::time::timeout(WAIT, session.run(CancellationToken::new()))
        .await
        .unwrap();
    assert_eq!(report.notified, 1);

    match alice.next_event(Some(WAIT)).await.unwrap() {
        ViewerEvent::Ended(_) => {}
        other => panic!("expected shutdown notice, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_token_ends_session() {
    let h = start(5).await;
    let cancel = CancellationToken::new();

    let session = h.session.clone();
    let run = tokio::spawn({
        let cancel = cancel.clone();
        async move { session.run(cancel).await }
    });

    cancel.cancel();
    let report = tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
    assert_eq!(report.notified, 0);
}
