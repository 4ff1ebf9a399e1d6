//! End-to-end shard lifecycle scenarios against a scripted transport.
//!
//! The mock transport plays the server side of the gateway: each
//! `connect` from the shard hands the test a [`ServerEnd`] that reads
//! the shard's outbound frames and pushes inbound events.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::time::timeout;

use murmur_gateway::{
    GatewayPacket, Shard, ShardConfig, ShardError, ShardEvents, ShardHooks, ShardState, Transport,
    TransportConnection, TransportEvent, TransportSink,
};

const WAIT: Duration = Duration::from_secs(5);

// ── Mock transport ───────────────────────────────────────────

/// Frame captured from the shard's write half.
#[derive(Debug)]
enum Sent {
    Frame(GatewayPacket),
    Close { code: u16 },
}

/// Server side of one mock connection.
struct ServerEnd {
    url: String,
    sent: mpsc::UnboundedReceiver<Sent>,
    events: mpsc::Sender<TransportEvent>,
}

impl ServerEnd {
    async fn next_sent(&mut self) -> Sent {
        timeout(WAIT, self.sent.recv())
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("shard dropped the connection")
    }

    async fn next_frame(&mut self) -> GatewayPacket {
        match self.next_sent().await {
            Sent::Frame(packet) => packet,
            Sent::Close { code } => panic!("expected a frame, got close {code}"),
        }
    }

    async fn next_close(&mut self) -> u16 {
        match self.next_sent().await {
            Sent::Close { code } => code,
            Sent::Frame(packet) => panic!("expected a close, got op {}", packet.op),
        }
    }

    async fn push(&self, payload: serde_json::Value) {
        self.events
            .send(TransportEvent::Text(payload.to_string()))
            .await
            .expect("shard reader gone");
    }

    async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .events
            .send(TransportEvent::Closed {
                code,
                reason: reason.to_string(),
            })
            .await;
    }

    async fn hello(&self, heartbeat_interval_ms: u64) {
        self.push(json!({"op": 10, "d": {"heartbeat_interval": heartbeat_interval_ms}}))
            .await;
    }

    async fn ready(&self, session_id: &str, resume_url: &str, sequence: u64) {
        self.push(json!({
            "op": 0,
            "s": sequence,
            "t": "READY",
            "d": {"session_id": session_id, "resume_gateway_url": resume_url},
        }))
        .await;
    }

    async fn resumed(&self, sequence: u64) {
        self.push(json!({"op": 0, "s": sequence, "t": "RESUMED", "d": null}))
            .await;
    }
}

struct MockSink {
    tx: mpsc::UnboundedSender<Sent>,
}

#[async_trait]
impl TransportSink for MockSink {
    async fn send(&mut self, text: String) -> Result<(), ShardError> {
        let packet = serde_json::from_str(&text)?;
        let _ = self.tx.send(Sent::Frame(packet));
        Ok(())
    }

    async fn close(&mut self, code: u16, _reason: &str) -> Result<(), ShardError> {
        let _ = self.tx.send(Sent::Close { code });
        Ok(())
    }
}

/// Transport that queues every connection for the test to accept.
///
/// When gated, `connect` blocks until the test releases a permit; that
/// makes "the shard is between connections" a deterministic window.
#[derive(Clone)]
struct MockTransport {
    pending: Arc<Mutex<VecDeque<ServerEnd>>>,
    gated: Arc<AtomicBool>,
    permits: Arc<Semaphore>,
}

impl MockTransport {
    fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(VecDeque::new())),
            gated: Arc::new(AtomicBool::new(false)),
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    fn gate(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        self.permits.add_permits(1);
    }

    async fn accept(&self) -> ServerEnd {
        timeout(WAIT, async {
            loop {
                if let Some(end) = self.pending.lock().await.pop_front() {
                    return end;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for a connection")
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, url: &str) -> Result<TransportConnection, ShardError> {
        if self.gated.load(Ordering::SeqCst) {
            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| ShardError::Shutdown)?;
            permit.forget();
        }
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(64);
        self.pending.lock().await.push_back(ServerEnd {
            url: url.to_string(),
            sent: sent_rx,
            events: event_tx,
        });
        Ok(TransportConnection {
            sink: Box::new(MockSink { tx: sent_tx }),
            events: event_rx,
        })
    }
}

// ── Event recorder ───────────────────────────────────────────

#[derive(Default)]
struct RecordedEvents {
    log: StdMutex<Vec<String>>,
}

impl RecordedEvents {
    fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

impl ShardEvents for RecordedEvents {
    fn connecting(&self, _: u32) {
        self.record("connecting".into());
    }
    fn connected(&self, _: u32) {
        self.record("connected".into());
    }
    fn identifying(&self, _: u32) {
        self.record("identifying".into());
    }
    fn identified(&self, _: u32) {
        self.record("identified".into());
    }
    fn disconnected(&self, _: u32, code: u16) {
        self.record(format!("disconnected:{code}"));
    }
    fn hello(&self, _: u32, interval: u64) {
        self.record(format!("hello:{interval}"));
    }
    fn invalid_session(&self, _: u32, resumable: bool) {
        self.record(format!("invalid_session:{resumable}"));
    }
    fn requested_reconnect(&self, _: u32) {
        self.record("requested_reconnect".into());
    }
    fn resumed(&self, _: u32) {
        self.record("resumed".into());
    }
}

// ── Helpers ──────────────────────────────────────────────────

fn test_config() -> ShardConfig {
    ShardConfig {
        token: "T".into(),
        intents: 513,
        ..ShardConfig::default()
    }
}

fn test_shard(
    transport: &MockTransport,
    events: &Arc<RecordedEvents>,
    config: ShardConfig,
) -> Shard {
    Shard::with_hooks(
        0,
        config,
        ShardHooks {
            transport: Arc::new(transport.clone()),
            events: Arc::clone(events) as Arc<dyn ShardEvents>,
            ..ShardHooks::default()
        },
    )
}

async fn wait_for_state(shard: &Shard, target: ShardState) {
    timeout(WAIT, async {
        while shard.state().await != target {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("state never reached {target:?}"));
}

async fn wait_for_sequence(shard: &Shard, sequence: u64) {
    timeout(WAIT, async {
        while shard.previous_sequence().await != Some(sequence) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sequence never observed");
}

/// Run a full cold identify and return the established server end.
///
/// `heartbeat_interval_ms` is normally large so beats never interleave
/// with the frames under test.
async fn establish(
    transport: &MockTransport,
    shard: &Shard,
    heartbeat_interval_ms: u64,
) -> ServerEnd {
    let task = tokio::spawn({
        let shard = shard.clone();
        async move { shard.identify().await }
    });

    let mut server = transport.accept().await;
    let identify = server.next_frame().await;
    assert_eq!(identify.op, 2);

    server.hello(heartbeat_interval_ms).await;
    server.ready("S", "wss://r", 1).await;

    task.await.unwrap().unwrap();
    assert_eq!(shard.state().await, ShardState::Connected);
    server
}

// ── Scenarios ────────────────────────────────────────────────

#[tokio::test]
async fn cold_identify_reaches_connected() {
    let transport = MockTransport::new();
    let events = Arc::new(RecordedEvents::default());
    let shard = test_shard(&transport, &events, test_config());

    let task = tokio::spawn({
        let shard = shard.clone();
        async move { shard.identify().await }
    });

    let mut server = transport.accept().await;
    assert!(
        server.url.starts_with("wss://gateway.discord.gg"),
        "unexpected url {}",
        server.url
    );
    assert!(server.url.contains("v=10"));
    assert!(server.url.contains("encoding=json"));

    let identify = server.next_frame().await;
    assert_eq!(identify.op, 2);
    let d = identify.d.unwrap();
    assert_eq!(d["token"], "Bot T");
    assert_eq!(d["intents"], 513);
    assert_eq!(d["shard"], json!([0, 1]));

    server.hello(41_250).await;
    server.ready("S", "wss://r", 1).await;

    task.await.unwrap().unwrap();
    assert_eq!(shard.state().await, ShardState::Connected);
    assert_eq!(shard.session_id().await.as_deref(), Some("S"));
    assert_eq!(shard.resume_gateway_url().await.as_deref(), Some("wss://r"));
    assert_eq!(shard.previous_sequence().await, Some(1));

    let log = events.entries();
    assert!(log.contains(&"identifying".to_string()));
    assert!(log.contains(&"identified".to_string()));
    assert!(log.contains(&"hello:41250".to_string()));

    shard.shutdown().await;
}

#[tokio::test]
async fn transient_close_resumes_and_drains_offline_senders() {
    let transport = MockTransport::new();
    let events = Arc::new(RecordedEvents::default());
    let shard = test_shard(&transport, &events, test_config());
    let mut server = establish(&transport, &shard, 600_000).await;

    server
        .push(json!({"op": 0, "s": 42, "t": "GUILD_CREATE", "d": {}}))
        .await;
    wait_for_sequence(&shard, 42).await;

    // Hold the next connect open so the outage window is observable.
    transport.gate();
    server.close(4000, "unknown error").await;
    wait_for_state(&shard, ShardState::Resuming).await;
    assert!(!shard.is_open().await);

    // Senders parked during the outage: lows in order, one high.
    let status = |label: &str| murmur_gateway::StatusUpdate {
        activities: vec![],
        status: label.to_string(),
    };
    let mut senders = Vec::new();
    for label in ["low-1", "low-2"] {
        let shard = shard.clone();
        let update = status(label);
        senders.push(tokio::spawn(async move {
            shard.edit_shard_status(update).await
        }));
        tokio::task::yield_now().await;
    }
    {
        let shard = shard.clone();
        let update = status("high");
        senders.push(tokio::spawn(async move {
            shard.send(&murmur_gateway::protocol::build_presence_update(&update), true).await
        }));
        tokio::task::yield_now().await;
    }

    transport.release();
    let mut server2 = transport.accept().await;
    assert!(
        server2.url.starts_with("wss://r"),
        "resume should target the resume endpoint, got {}",
        server2.url
    );

    let resume = server2.next_frame().await;
    assert_eq!(resume.op, 6);
    let d = resume.d.unwrap();
    assert_eq!(d["token"], "Bot T");
    assert_eq!(d["session_id"], "S");
    assert_eq!(d["seq"], 42);

    server2.resumed(43).await;
    wait_for_state(&shard, ShardState::Connected).await;

    // Drained in priority order: the high sender overtakes the lows.
    let mut statuses = Vec::new();
    for _ in 0..3 {
        let frame = server2.next_frame().await;
        assert_eq!(frame.op, 3);
        statuses.push(frame.d.unwrap()["status"].as_str().unwrap().to_string());
    }
    assert_eq!(statuses, vec!["high", "low-1", "low-2"]);

    for sender in senders {
        sender.await.unwrap().unwrap();
    }
    assert!(events.entries().contains(&"disconnected:4000".to_string()));
    assert!(events.entries().contains(&"resumed".to_string()));

    shard.shutdown().await;
}

#[tokio::test]
async fn non_resumable_invalid_session_reidentifies_after_backoff() {
    let transport = MockTransport::new();
    let events = Arc::new(RecordedEvents::default());
    let shard = test_shard(&transport, &events, test_config());

    let first = tokio::spawn({
        let shard = shard.clone();
        async move { shard.identify().await }
    });

    let mut server = transport.accept().await;
    let identify = server.next_frame().await;
    assert_eq!(identify.op, 2);
    server.hello(600_000).await;

    let invalidated_at = tokio::time::Instant::now();
    server.push(json!({"op": 9, "d": false})).await;

    // The first attempt resolves through the invalid-session waiter,
    // not through READY.
    timeout(Duration::from_secs(10), first)
        .await
        .expect("first identify never resolved")
        .unwrap()
        .unwrap();
    let waited = invalidated_at.elapsed();
    assert!(
        waited >= Duration::from_millis(900),
        "backoff too short: {waited:?}"
    );

    // The old socket is torn down tagged as re-identifying, then a
    // fresh identify goes out on a new connection.
    assert_eq!(server.next_close().await, 3066);
    let mut server2 = transport.accept().await;
    let identify2 = server2.next_frame().await;
    assert_eq!(identify2.op, 2);
    assert_eq!(identify2.d.unwrap()["token"], "Bot T");

    let log = events.entries();
    assert!(log.contains(&"invalid_session:false".to_string()));
    assert!(
        !log.contains(&"identified".to_string()),
        "READY never arrived, identified must not fire"
    );

    shard.shutdown().await;
}

#[tokio::test]
async fn missing_acks_zombie_the_connection_and_reidentify() {
    let transport = MockTransport::new();
    let events = Arc::new(RecordedEvents::default());
    let shard = test_shard(&transport, &events, test_config());

    let first = tokio::spawn({
        let shard = shard.clone();
        async move { shard.identify().await }
    });

    let mut server = transport.accept().await;
    let identify = server.next_frame().await;
    assert_eq!(identify.op, 2);

    // Short interval, then total silence: no acks ever arrive.
    server.hello(100).await;

    let beat = server.next_frame().await;
    assert_eq!(beat.op, 1, "jittered first beat");

    // The first unacknowledged steady tick closes the socket as
    // zombied. Exactly one beat went out before that.
    assert_eq!(server.next_close().await, 3010);

    let mut server2 = transport.accept().await;
    let identify2 = server2.next_frame().await;
    assert_eq!(identify2.op, 2);

    // The superseded first attempt observes cancellation.
    assert!(matches!(
        first.await.unwrap(),
        Err(ShardError::Shutdown)
    ));
    assert!(events.entries().contains(&"disconnected:3010".to_string()));

    shard.shutdown().await;
}

#[tokio::test]
async fn burst_sends_respect_bucket_and_priority() {
    let transport = MockTransport::new();
    let events = Arc::new(RecordedEvents::default());
    // safe = 12 − ceil(400 / 100000) × 2 = 10 tokens per 400ms tick;
    // the huge heartbeat interval keeps beats out of the frame stream.
    let config = ShardConfig {
        max_requests_per_interval: 12,
        rate_limit_refill_interval: Duration::from_millis(400),
        ..test_config()
    };
    let shard = test_shard(&transport, &events, config);
    let mut server = establish(&transport, &shard, 100_000).await;

    let status = |label: String| murmur_gateway::StatusUpdate {
        activities: vec![],
        status: label,
    };

    let mut senders = Vec::new();
    for index in 1..=20 {
        let shard = shard.clone();
        let update = status(format!("low-{index}"));
        senders.push(tokio::spawn(async move {
            shard.edit_shard_status(update).await
        }));
        tokio::task::yield_now().await;
    }

    // The first safe-rate batch goes out immediately.
    for index in 1..=10 {
        let frame = server.next_frame().await;
        assert_eq!(frame.d.unwrap()["status"], format!("low-{index}"));
    }

    // A high-priority sender joins the queue and overtakes every
    // pending low.
    {
        let shard = shard.clone();
        let update = status("high".into());
        senders.push(tokio::spawn(async move {
            shard
                .send(&murmur_gateway::protocol::build_presence_update(&update), true)
                .await
        }));
        tokio::task::yield_now().await;
    }

    let mut after_refill = Vec::new();
    for _ in 0..10 {
        let frame = server.next_frame().await;
        after_refill.push(frame.d.unwrap()["status"].as_str().unwrap().to_string());
    }
    assert_eq!(after_refill[0], "high");
    for (position, index) in (11..=19).enumerate() {
        assert_eq!(after_refill[position + 1], format!("low-{index}"));
    }

    // The last low rides the tick after that.
    let frame = server.next_frame().await;
    assert_eq!(frame.d.unwrap()["status"], "low-20");

    for sender in senders {
        sender.await.unwrap().unwrap();
    }
    shard.shutdown().await;
}

#[tokio::test]
async fn fatal_close_fails_identify_and_goes_offline() {
    let transport = MockTransport::new();
    let events = Arc::new(RecordedEvents::default());
    let shard = test_shard(&transport, &events, test_config());

    let task = tokio::spawn({
        let shard = shard.clone();
        async move { shard.identify().await }
    });

    let mut server = transport.accept().await;
    let identify = server.next_frame().await;
    assert_eq!(identify.op, 2);

    server.close(4014, "Disallowed intents").await;

    match task.await.unwrap() {
        Err(ShardError::Fatal { code, reason }) => {
            assert_eq!(code, 4014);
            assert_eq!(reason, "Disallowed intents");
        }
        other => panic!("expected fatal error, got {other:?}"),
    }
    wait_for_state(&shard, ShardState::Offline).await;
    assert!(shard.session_id().await.is_none());
    assert!(events.entries().contains(&"disconnected:4014".to_string()));
}

#[tokio::test]
async fn server_requested_reconnect_resumes() {
    let transport = MockTransport::new();
    let events = Arc::new(RecordedEvents::default());
    let shard = test_shard(&transport, &events, test_config());
    let mut server = establish(&transport, &shard, 600_000).await;

    server.push(json!({"op": 7, "d": null})).await;

    // The shard tears the old socket down ahead of the resume.
    assert_eq!(server.next_close().await, 3024);

    let mut server2 = transport.accept().await;
    let resume = server2.next_frame().await;
    assert_eq!(resume.op, 6);
    assert_eq!(resume.d.unwrap()["session_id"], "S");

    server2.resumed(2).await;
    wait_for_state(&shard, ShardState::Connected).await;
    assert!(events.entries().contains(&"requested_reconnect".to_string()));

    shard.shutdown().await;
}

#[tokio::test]
async fn server_heartbeat_request_is_echoed_with_sequence() {
    let transport = MockTransport::new();
    let events = Arc::new(RecordedEvents::default());
    let shard = test_shard(&transport, &events, test_config());
    let mut server = establish(&transport, &shard, 600_000).await;

    server
        .push(json!({"op": 0, "s": 42, "t": "GUILD_CREATE", "d": {}}))
        .await;
    wait_for_sequence(&shard, 42).await;

    server.push(json!({"op": 1, "d": null})).await;
    let beat = server.next_frame().await;
    assert_eq!(beat.op, 1);
    assert_eq!(beat.d, Some(json!(42)));

    shard.shutdown().await;
}

#[tokio::test]
async fn testing_close_goes_offline_without_reconnect() {
    let transport = MockTransport::new();
    let events = Arc::new(RecordedEvents::default());
    let shard = test_shard(&transport, &events, test_config());
    let server = establish(&transport, &shard, 600_000).await;

    server.close(3064, "testing finished").await;
    wait_for_state(&shard, ShardState::Offline).await;

    // No reconnect attempt and no disconnected callback.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(transport.pending.lock().await.is_empty());
    assert!(
        !events
            .entries()
            .iter()
            .any(|entry| entry.starts_with("disconnected")),
        "testing closes are silent"
    );
}

#[tokio::test]
async fn shutdown_wakes_parked_senders() {
    let transport = MockTransport::new();
    let events = Arc::new(RecordedEvents::default());
    let shard = test_shard(&transport, &events, test_config());

    // Never connected: sends park offline immediately.
    let parked = tokio::spawn({
        let shard = shard.clone();
        async move {
            shard
                .edit_shard_status(murmur_gateway::StatusUpdate::default())
                .await
        }
    });
    tokio::task::yield_now().await;
    assert!(!parked.is_finished());

    shard.shutdown().await;
    assert!(matches!(parked.await.unwrap(), Err(ShardError::Shutdown)));
    assert_eq!(shard.state().await, ShardState::Offline);
}
