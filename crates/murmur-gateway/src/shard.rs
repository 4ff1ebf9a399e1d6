//! Shard state machine and packet handler.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::bucket::{LeakyBucket, safe_requests};
use crate::compress::Inflater;
use crate::config::{PRIMARY_GATEWAY, ShardConfig};
use crate::error::ShardError;
use crate::events::{NoopEvents, ShardEvents};
use crate::heart::{self, Heart};
use crate::protocol::{
    CloseBehavior, CloseCode, GatewayPacket, GuildMembersChunk, Hello, OpCode, Ready, StatusUpdate,
    build_heartbeat, build_identify, build_resume,
};
use crate::queue::OfflineQueue;
use crate::transport::{Transport, TransportEvent, TransportSink, WebSocketTransport};

/// Synthetic close code for a stream that ended without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

/// Lifecycle state of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    /// No socket, nothing in flight.
    Offline,
    /// Opening a socket.
    Connecting,
    /// Socket open, session not yet established.
    Unidentified,
    /// Identify handshake in flight.
    Identifying,
    /// Session established, event stream live.
    Connected,
    /// Resume handshake in flight.
    Resuming,
    /// Socket gone after a deliberate close; next step already chosen.
    Disconnected,
}

/// Cluster-level gate on identify transmissions.
///
/// The gateway limits how often identifies may be sent across all
/// shards; a multi-shard manager implements this to serialize them.
/// The shard itself does not enforce any identify rate.
#[async_trait]
pub trait IdentifyQueue: Send + Sync {
    /// Resolves when this shard may transmit its identify payload.
    async fn wait_for_permit(&self, shard_id: u32);
}

/// Identify gate that admits immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedIdentify;

#[async_trait]
impl IdentifyQueue for UnlimitedIdentify {
    async fn wait_for_permit(&self, _shard_id: u32) {}
}

/// Presence factory invoked once per identify.
pub type PresenceFn = Arc<dyn Fn() -> Option<StatusUpdate> + Send + Sync>;

/// Pure transform applied to every packet before the `message`
/// callback (e.g. a key-casing normalization). Identity by default.
pub type MessageTransform = Arc<dyn Fn(GatewayPacket) -> GatewayPacket + Send + Sync>;

/// Pluggable collaborators of a [`Shard`].
#[derive(Clone)]
pub struct ShardHooks {
    /// Socket factory; defaults to the tokio-tungstenite transport.
    pub transport: Arc<dyn Transport>,
    /// Lifecycle callbacks; default ignores everything.
    pub events: Arc<dyn ShardEvents>,
    /// Identify permit gate; default admits immediately.
    pub identify_queue: Arc<dyn IdentifyQueue>,
    /// Optional presence factory for identify payloads.
    pub make_presence: Option<PresenceFn>,
    /// Optional decompressor for binary frames.
    pub inflater: Option<Arc<dyn Inflater>>,
    /// Optional transform applied before the `message` callback.
    pub message_transform: Option<MessageTransform>,
}

impl Default for ShardHooks {
    fn default() -> Self {
        Self {
            transport: Arc::new(WebSocketTransport),
            events: Arc::new(NoopEvents),
            identify_queue: Arc::new(UnlimitedIdentify),
            make_presence: None,
            inflater: None,
            message_transform: None,
        }
    }
}

// ── Internal state ───────────────────────────────────────────

/// Session continuity data carried across reconnects.
#[derive(Default)]
pub(crate) struct Session {
    pub(crate) session_id: Option<String>,
    pub(crate) resume_gateway_url: Option<String>,
    pub(crate) sequence: Option<u64>,
}

/// Outcome delivered through a named rendezvous point.
enum Settle {
    /// The awaited event arrived.
    Done,
    /// A fatal close failed the attempt.
    Fatal { code: u16, reason: String },
}

/// Named one-shot rendezvous points, one per gateway event the state
/// machine waits on. Each is settable once per attempt; registering
/// again replaces (and thereby cancels) a stale waiter.
#[derive(Default)]
struct Resolvers {
    ready: Option<oneshot::Sender<Settle>>,
    resumed: Option<oneshot::Sender<Settle>>,
    invalid_session: Option<oneshot::Sender<Settle>>,
}

impl Resolvers {
    fn settle_ready(&mut self) {
        if let Some(tx) = self.ready.take() {
            let _ = tx.send(Settle::Done);
        }
    }

    fn settle_resumed(&mut self) {
        if let Some(tx) = self.resumed.take() {
            let _ = tx.send(Settle::Done);
        }
    }

    fn settle_invalid_session(&mut self) {
        if let Some(tx) = self.invalid_session.take() {
            let _ = tx.send(Settle::Done);
        }
    }

    fn fail_all(&mut self, code: u16, reason: &str) {
        for tx in [
            self.ready.take(),
            self.resumed.take(),
            self.invalid_session.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = tx.send(Settle::Fatal {
                code,
                reason: reason.to_string(),
            });
        }
    }

    /// Drop every sender; parked waiters observe cancellation.
    fn clear(&mut self) {
        self.ready = None;
        self.resumed = None;
        self.invalid_session = None;
    }
}

/// In-flight request-members accumulation, keyed by nonce.
pub(crate) struct PendingMembers {
    pub(crate) members: Vec<serde_json::Value>,
    pub(crate) tx: oneshot::Sender<Vec<serde_json::Value>>,
}

/// The write half of the current connection, tagged with its epoch so
/// callbacks from replaced connections can be told apart.
struct Socket {
    sink: Box<dyn TransportSink>,
    epoch: u64,
}

struct ShardInner {
    id: u32,
    config: ShardConfig,
    hooks: ShardHooks,
    state: Mutex<ShardState>,
    session: Mutex<Session>,
    heart: Mutex<Heart>,
    bucket: LeakyBucket,
    offline: OfflineQueue,
    resolves: Mutex<Resolvers>,
    members: Mutex<HashMap<String, PendingMembers>>,
    socket: Mutex<Option<Socket>>,
    /// Connection generation; bumped on install and teardown so events
    /// from a replaced socket are ignored.
    epoch: AtomicU64,
    /// Monotonic identify counter; a superseded attempt abandons
    /// itself at its next checkpoint.
    identify_attempt: AtomicU64,
}

// ── Shard ────────────────────────────────────────────────────

/// A single gateway connection.
///
/// The handle is cheap to clone; every clone drives the same
/// underlying connection, so the reader task, the heartbeat timers and
/// any number of caller tasks share one shard.
#[derive(Clone)]
pub struct Shard {
    inner: Arc<ShardInner>,
}

impl Shard {
    /// Create a shard with the default hooks (real `WebSocket`
    /// transport, no event sink, unlimited identifies).
    #[must_use]
    pub fn new(id: u32, config: ShardConfig) -> Self {
        Self::with_hooks(id, config, ShardHooks::default())
    }

    /// Create a shard with explicit collaborators.
    #[must_use]
    pub fn with_hooks(id: u32, config: ShardConfig, hooks: ShardHooks) -> Self {
        let bucket = LeakyBucket::new(
            config.max_requests_per_interval,
            config.max_requests_per_interval,
            config.rate_limit_refill_interval,
        );
        Self {
            inner: Arc::new(ShardInner {
                id,
                config,
                hooks,
                state: Mutex::new(ShardState::Offline),
                session: Mutex::new(Session::default()),
                heart: Mutex::new(Heart::new()),
                bucket,
                offline: OfflineQueue::new(),
                resolves: Mutex::new(Resolvers::default()),
                members: Mutex::new(HashMap::new()),
                socket: Mutex::new(None),
                epoch: AtomicU64::new(0),
                identify_attempt: AtomicU64::new(0),
            }),
        }
    }

    /// Shard ID.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Connection configuration.
    #[must_use]
    pub fn config(&self) -> &ShardConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ShardState {
        *self.inner.state.lock().await
    }

    /// Whether a socket is currently open.
    pub async fn is_open(&self) -> bool {
        self.inner.socket.lock().await.is_some()
    }

    /// Session ID from the last `READY`, if any.
    pub async fn session_id(&self) -> Option<String> {
        self.inner.session.lock().await.session_id.clone()
    }

    /// Resume endpoint from the last `READY`, if any.
    pub async fn resume_gateway_url(&self) -> Option<String> {
        self.inner.session.lock().await.resume_gateway_url.clone()
    }

    /// Last non-null sequence number seen on this session.
    pub async fn previous_sequence(&self) -> Option<u64> {
        self.inner.session.lock().await.sequence
    }

    /// Round-trip time measured on the last heartbeat, if any.
    pub async fn heartbeat_rtt(&self) -> Option<Duration> {
        self.inner.heart.lock().await.rtt
    }

    pub(crate) fn heart(&self) -> &Mutex<Heart> {
        &self.inner.heart
    }

    pub(crate) fn members(&self) -> &Mutex<HashMap<String, PendingMembers>> {
        &self.inner.members
    }

    pub(crate) async fn set_state(&self, next: ShardState) {
        let mut state = self.inner.state.lock().await;
        if *state != next {
            trace!(shard_id = self.inner.id, from = ?*state, to = ?next, "state transition");
            *state = next;
        }
    }

    // ── Connecting ───────────────────────────────────────────

    /// Open a socket to the gateway.
    ///
    /// Resolves once the socket is open. Does not identify; callers
    /// normally reach this through [`identify`](Self::identify) or
    /// [`resume`](Self::resume).
    ///
    /// # Errors
    ///
    /// Transport errors from the socket dial.
    pub async fn connect(&self) -> Result<(), ShardError> {
        let state = self.state().await;
        if !matches!(state, ShardState::Identifying | ShardState::Resuming) {
            self.set_state(ShardState::Connecting).await;
            self.inner.hooks.events.connecting(self.inner.id);
        }

        let url = self.gateway_url().await;
        debug!(shard_id = self.inner.id, %url, "connecting to gateway");
        let connection = self.inner.hooks.transport.connect(&url).await?;

        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut socket = self.inner.socket.lock().await;
            *socket = Some(Socket {
                sink: connection.sink,
                epoch,
            });
        }
        self.spawn_reader(connection.events, epoch);

        let state = self.state().await;
        if !matches!(state, ShardState::Identifying | ShardState::Resuming) {
            self.set_state(ShardState::Unidentified).await;
        }
        self.inner.hooks.events.connected(self.inner.id);
        Ok(())
    }

    /// Target URL for the next connect.
    ///
    /// The primary gateway gets explicit version and encoding
    /// parameters; proxy gateways pass through unmodified. While
    /// resuming, the session's resume endpoint replaces the configured
    /// one.
    async fn gateway_url(&self) -> String {
        let config = &self.inner.config;
        let resuming = self.state().await == ShardState::Resuming;
        let base = if resuming {
            self.inner
                .session
                .lock()
                .await
                .resume_gateway_url
                .clone()
                .unwrap_or_else(|| config.url.clone())
        } else {
            config.url.clone()
        };
        if config.url.trim_end_matches('/') == PRIMARY_GATEWAY {
            format!(
                "{}?v={}&encoding=json",
                base.trim_end_matches('/'),
                config.version
            )
        } else {
            base
        }
    }

    /// Pump inbound transport events into the packet handler until the
    /// connection dies or is replaced.
    fn spawn_reader(&self, mut events: mpsc::Receiver<TransportEvent>, epoch: u64) {
        let shard = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if shard.inner.epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
                match event {
                    TransportEvent::Text(text) => shard.handle_frame(&text).await,
                    TransportEvent::Binary(bytes) => match &shard.inner.hooks.inflater {
                        Some(inflater) => match inflater.inflate(&bytes) {
                            Some(text) => shard.handle_frame(&text).await,
                            None => warn!(
                                shard_id = shard.inner.id,
                                "dropping undecodable compressed frame"
                            ),
                        },
                        None => trace!(
                            shard_id = shard.inner.id,
                            "dropping binary frame without inflater"
                        ),
                    },
                    TransportEvent::Closed { code, reason } => {
                        shard.handle_remote_close(epoch, code, &reason).await;
                        return;
                    }
                    TransportEvent::Error(message) => {
                        warn!(shard_id = shard.inner.id, error = %message, "transport error");
                    }
                }
            }
            // Stream ended without a close frame.
            shard
                .handle_remote_close(epoch, ABNORMAL_CLOSURE, "connection reset")
                .await;
        });
    }

    // ── Packet handling ──────────────────────────────────────

    async fn handle_frame(&self, text: &str) {
        let packet: GatewayPacket = match serde_json::from_str(text) {
            Ok(packet) => packet,
            Err(error) => {
                warn!(shard_id = self.inner.id, %error, "unparseable gateway frame");
                return;
            }
        };
        self.handle_packet(packet).await;
    }

    /// Dispatch one inbound packet.
    pub(crate) async fn handle_packet(&self, packet: GatewayPacket) {
        // Any inbound traffic acknowledges the outstanding beat and
        // yields an RTT sample.
        self.inner.heart.lock().await.note_packet();

        match OpCode::from_u8(packet.op) {
            Some(OpCode::Dispatch) => self.handle_dispatch(&packet).await,
            Some(OpCode::Heartbeat) => {
                trace!(shard_id = self.inner.id, "server requested a heartbeat");
                self.send_heartbeat().await;
            }
            Some(OpCode::Hello) => self.handle_hello(&packet).await,
            Some(OpCode::HeartbeatAck) => {
                let rtt = self
                    .inner
                    .heart
                    .lock()
                    .await
                    .rtt
                    .map(|rtt| u64::try_from(rtt.as_millis()).unwrap_or(u64::MAX));
                self.inner.hooks.events.heartbeat_ack(self.inner.id, rtt);
            }
            Some(OpCode::Reconnect) => {
                info!(shard_id = self.inner.id, "server requested reconnect");
                self.inner.hooks.events.requested_reconnect(self.inner.id);
                let shard = self.clone();
                tokio::spawn(async move {
                    if let Err(error) = shard.resume().await {
                        warn!(shard_id = shard.inner.id, %error, "requested reconnect failed");
                    }
                });
            }
            Some(OpCode::InvalidSession) => self.handle_invalid_session(&packet),
            Some(_) => {}
            None => debug!(shard_id = self.inner.id, op = packet.op, "unknown opcode"),
        }

        if let Some(sequence) = packet.s {
            self.inner.session.lock().await.sequence = Some(sequence);
        }

        let packet = match &self.inner.hooks.message_transform {
            Some(transform) => transform(packet),
            None => packet,
        };
        self.inner.hooks.events.message(self.inner.id, &packet);
    }

    async fn handle_dispatch(&self, packet: &GatewayPacket) {
        let Some(name) = packet.t.as_deref() else {
            return;
        };
        match name {
            "READY" => {
                if let Some(d) = &packet.d {
                    match serde_json::from_value::<Ready>(d.clone()) {
                        Ok(ready) => {
                            let mut session = self.inner.session.lock().await;
                            session.session_id = Some(ready.session_id);
                            session.resume_gateway_url = ready.resume_gateway_url;
                        }
                        Err(error) => {
                            warn!(shard_id = self.inner.id, %error, "malformed READY payload");
                        }
                    }
                }
                info!(shard_id = self.inner.id, "shard ready");
                self.set_state(ShardState::Connected).await;
                self.inner.offline.drain().await;
                self.inner.resolves.lock().await.settle_ready();
            }
            "RESUMED" => {
                info!(shard_id = self.inner.id, "session resumed");
                self.set_state(ShardState::Connected).await;
                self.inner.offline.drain().await;
                self.inner.resolves.lock().await.settle_resumed();
                self.inner.hooks.events.resumed(self.inner.id);
            }
            "GUILD_MEMBERS_CHUNK" => self.handle_members_chunk(packet).await,
            _ => {}
        }
    }

    async fn handle_hello(&self, packet: &GatewayPacket) {
        let interval_ms = packet
            .d
            .as_ref()
            .and_then(|d| serde_json::from_value::<Hello>(d.clone()).ok())
            .map_or(heart::DEFAULT_INTERVAL_MS, |hello| hello.heartbeat_interval);
        let resuming = self.state().await == ShardState::Resuming;

        self.inner.hooks.events.hello(self.inner.id, interval_ms);
        heart::start(self.clone(), interval_ms).await;

        if !resuming {
            let config = &self.inner.config;
            let safe = safe_requests(
                config.max_requests_per_interval,
                config.rate_limit_refill_interval,
                Duration::from_millis(interval_ms),
            );
            debug!(shard_id = self.inner.id, safe, "rebuilding command bucket");
            self.inner
                .bucket
                .reconfigure(safe, safe, config.rate_limit_refill_interval)
                .await;
        }
    }

    async fn handle_members_chunk(&self, packet: &GatewayPacket) {
        if !self.inner.config.cache_request_members {
            return;
        }
        let Some(d) = &packet.d else { return };
        let chunk: GuildMembersChunk = match serde_json::from_value(d.clone()) {
            Ok(chunk) => chunk,
            Err(error) => {
                warn!(shard_id = self.inner.id, %error, "malformed members chunk");
                return;
            }
        };
        let Some(nonce) = chunk.nonce else { return };

        let mut pending = self.inner.members.lock().await;
        let Some(request) = pending.get_mut(&nonce) else {
            return;
        };
        request.members.extend(chunk.members);
        if chunk.chunk_index + 1 >= chunk.chunk_count
            && let Some(done) = pending.remove(&nonce)
        {
            let _ = done.tx.send(done.members);
        }
    }

    fn handle_invalid_session(&self, packet: &GatewayPacket) {
        let resumable = packet
            .d
            .as_ref()
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        info!(shard_id = self.inner.id, resumable, "session invalidated");
        self.inner
            .hooks
            .events
            .invalid_session(self.inner.id, resumable);

        let shard = self.clone();
        tokio::spawn(async move {
            let delay = Duration::from_millis(invalid_session_backoff_ms());
            debug!(
                shard_id = shard.inner.id,
                delay_ms = delay.as_millis() as u64,
                "invalid session backoff"
            );
            tokio::time::sleep(delay).await;
            shard.inner.resolves.lock().await.settle_invalid_session();
            let result = if resumable {
                shard.resume().await
            } else {
                shard.identify().await
            };
            if let Err(error) = result {
                warn!(shard_id = shard.inner.id, %error, "invalid session recovery failed");
            }
        });
    }

    // ── Closing ──────────────────────────────────────────────

    /// Close the connection with the given code. No-op unless a socket
    /// is currently open.
    pub async fn close(&self, code: CloseCode, reason: &str) {
        let taken = self.inner.socket.lock().await.take();
        let Some(mut socket) = taken else { return };
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Err(error) = socket.sink.close(code.as_u16(), reason).await {
            debug!(shard_id = self.inner.id, %error, "close frame failed");
        }
        self.handle_close(code.as_u16(), reason).await;
    }

    /// A close delivered by the transport. Ignored when the connection
    /// it belongs to has already been replaced or torn down.
    async fn handle_remote_close(&self, epoch: u64, code: u16, reason: &str) {
        {
            let mut socket = self.inner.socket.lock().await;
            let current = socket.as_ref().is_some_and(|socket| socket.epoch == epoch);
            if !current {
                trace!(shard_id = self.inner.id, code, "stale close ignored");
                return;
            }
            socket.take();
        }
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.handle_close(code, reason).await;
    }

    /// Classify a close and run the corresponding recovery.
    async fn handle_close(&self, code: u16, reason: &str) {
        self.inner.heart.lock().await.stop();
        let behavior = CloseBehavior::classify(code);
        info!(shard_id = self.inner.id, code, reason, ?behavior, "connection closed");

        match behavior {
            CloseBehavior::Testing => {
                self.set_state(ShardState::Offline).await;
            }
            CloseBehavior::Graceful => {
                self.set_state(ShardState::Disconnected).await;
                self.inner.hooks.events.disconnected(self.inner.id, code);
            }
            CloseBehavior::ReIdentify => {
                self.clear_session().await;
                self.set_state(ShardState::Identifying).await;
                self.inner.hooks.events.disconnected(self.inner.id, code);
                let shard = self.clone();
                tokio::spawn(async move {
                    if let Err(error) = shard.identify().await {
                        warn!(shard_id = shard.inner.id, %error, "re-identify after close failed");
                    }
                });
            }
            CloseBehavior::Fatal => {
                self.clear_session().await;
                self.set_state(ShardState::Offline).await;
                self.inner.resolves.lock().await.fail_all(code, reason);
                self.inner.offline.abort_all().await;
                self.inner.bucket.abort_waiters().await;
                self.inner.members.lock().await.clear();
                self.inner.hooks.events.disconnected(self.inner.id, code);
            }
            CloseBehavior::Resume => {
                self.set_state(ShardState::Resuming).await;
                self.inner.hooks.events.disconnected(self.inner.id, code);
                let shard = self.clone();
                tokio::spawn(async move {
                    if let Err(error) = shard.resume().await {
                        warn!(shard_id = shard.inner.id, %error, "resume after close failed");
                    }
                });
            }
        }
    }

    async fn clear_session(&self) {
        let mut session = self.inner.session.lock().await;
        session.session_id = None;
        session.resume_gateway_url = None;
    }

    // ── Lifecycle operations ─────────────────────────────────

    /// Authenticate from scratch, creating a fresh session.
    ///
    /// Tears down any open socket first. Resolves when the gateway
    /// answers with `READY`, or silently when the session is
    /// invalidated (the invalid-session handler schedules the next
    /// attempt).
    ///
    /// # Errors
    ///
    /// [`ShardError::Fatal`] when the connection is closed with a
    /// non-recoverable code; [`ShardError::Shutdown`] when the shard
    /// shuts down mid-handshake; transport errors from the dial.
    pub fn identify(&self) -> Pin<Box<dyn Future<Output = Result<(), ShardError>> + Send + '_>> {
        Box::pin(async move {
            let attempt = self.inner.identify_attempt.fetch_add(1, Ordering::SeqCst) + 1;
            if self.is_open().await {
                self.close(CloseCode::ReIdentifying, "re-identifying").await;
            }
            self.set_state(ShardState::Identifying).await;
            self.inner.hooks.events.identifying(self.inner.id);
            if !self.is_open().await {
                self.connect().await?;
            }
            if self.identify_superseded(attempt) {
                return Ok(());
            }

            self.inner
                .hooks
                .identify_queue
                .wait_for_permit(self.inner.id)
                .await;
            if self.identify_superseded(attempt) {
                return Ok(());
            }

            let (ready_rx, invalid_rx) = {
                let mut resolves = self.inner.resolves.lock().await;
                let (ready_tx, ready_rx) = oneshot::channel();
                let (invalid_tx, invalid_rx) = oneshot::channel();
                resolves.ready = Some(ready_tx);
                resolves.invalid_session = Some(invalid_tx);
                (ready_rx, invalid_rx)
            };

            let presence = self.inner.hooks.make_presence.as_ref().and_then(|make| make());
            let payload = build_identify(&self.inner.config, self.inner.id, presence);
            self.send(&payload, true).await?;

            tokio::select! {
                outcome = ready_rx => match outcome {
                    Ok(Settle::Done) => {
                        self.inner.hooks.events.identified(self.inner.id);
                        Ok(())
                    }
                    Ok(Settle::Fatal { code, reason }) => Err(ShardError::Fatal { code, reason }),
                    Err(_) => Err(ShardError::Shutdown),
                },
                outcome = invalid_rx => match outcome {
                    Ok(Settle::Done) => Ok(()),
                    Ok(Settle::Fatal { code, reason }) => Err(ShardError::Fatal { code, reason }),
                    Err(_) => Err(ShardError::Shutdown),
                },
            }
        })
    }

    fn identify_superseded(&self, attempt: u64) -> bool {
        let current = self.inner.identify_attempt.load(Ordering::SeqCst);
        if current != attempt {
            debug!(
                shard_id = self.inner.id,
                attempt, current, "identify superseded"
            );
            return true;
        }
        false
    }

    /// Rejoin the existing session from the last seen sequence number.
    ///
    /// Falls back to [`identify`](Self::identify) when there is no
    /// session to resume. Resolves on `RESUMED`, or silently when the
    /// session is invalidated.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`identify`](Self::identify).
    pub fn resume(&self) -> Pin<Box<dyn Future<Output = Result<(), ShardError>> + Send + '_>> {
        Box::pin(async move {
            if self.is_open().await {
                self.close(CloseCode::ResumeClosingOldConnection, "resuming")
                    .await;
            }
            let (session_id, sequence) = {
                let session = self.inner.session.lock().await;
                (session.session_id.clone(), session.sequence)
            };
            let Some(session_id) = session_id else {
                debug!(shard_id = self.inner.id, "no session to resume, identifying");
                return self.identify().await;
            };

            self.set_state(ShardState::Resuming).await;
            self.connect().await?;

            let (resumed_rx, invalid_rx) = {
                let mut resolves = self.inner.resolves.lock().await;
                let (resumed_tx, resumed_rx) = oneshot::channel();
                let (invalid_tx, invalid_rx) = oneshot::channel();
                resolves.resumed = Some(resumed_tx);
                resolves.invalid_session = Some(invalid_tx);
                (resumed_rx, invalid_rx)
            };

            let payload = build_resume(
                &self.inner.config.token,
                &session_id,
                sequence.unwrap_or(0),
            );
            self.send(&payload, true).await?;

            tokio::select! {
                outcome = resumed_rx => match outcome {
                    Ok(Settle::Done) => Ok(()),
                    Ok(Settle::Fatal { code, reason }) => Err(ShardError::Fatal { code, reason }),
                    Err(_) => Err(ShardError::Shutdown),
                },
                outcome = invalid_rx => match outcome {
                    Ok(Settle::Done) => Ok(()),
                    Ok(Settle::Fatal { code, reason }) => Err(ShardError::Fatal { code, reason }),
                    Err(_) => Err(ShardError::Shutdown),
                },
            }
        })
    }

    /// Close the connection and wake everything that is waiting.
    ///
    /// The sole explicit cancellation: resolvers, offline-queue
    /// waiters and bucket waiters all observe a cancellation outcome
    /// rather than hanging.
    pub async fn shutdown(&self) {
        info!(shard_id = self.inner.id, "shutting down");
        self.close(CloseCode::Shutdown, "shutting down").await;
        self.inner.heart.lock().await.stop();
        self.set_state(ShardState::Offline).await;
        self.inner.resolves.lock().await.clear();
        self.inner.offline.abort_all().await;
        self.inner.bucket.shut_down().await;
        self.inner.members.lock().await.clear();
    }

    // ── Send path ────────────────────────────────────────────

    /// Send a command frame through admission control.
    ///
    /// Parks while the socket is down, takes a rate-limit token, then
    /// transmits. High-priority senders overtake at both the offline
    /// queue and the bucket. A socket that closes after the token is
    /// taken drops the frame silently; the offline queue exists to
    /// make that window small.
    ///
    /// # Errors
    ///
    /// [`ShardError::Shutdown`] when the shard shuts down while the
    /// caller is parked; [`ShardError::Json`] when the frame cannot be
    /// serialized.
    pub async fn send(&self, packet: &GatewayPacket, high_priority: bool) -> Result<(), ShardError> {
        self.check_offline(high_priority).await?;
        self.inner.bucket.acquire(1, high_priority).await?;
        // The socket may have closed while we held no token.
        self.check_offline(high_priority).await?;

        let text = serde_json::to_string(packet)?;
        let mut socket = self.inner.socket.lock().await;
        match socket.as_mut() {
            Some(current) => {
                if let Err(error) = current.sink.send(text).await {
                    warn!(shard_id = self.inner.id, %error, "gateway send failed");
                }
            }
            None => {
                trace!(shard_id = self.inner.id, "socket closed before send, dropping frame");
            }
        }
        Ok(())
    }

    async fn check_offline(&self, high_priority: bool) -> Result<(), ShardError> {
        if self.is_open().await {
            return Ok(());
        }
        self.inner.offline.park(high_priority).await
    }

    /// Transmit a heartbeat immediately, bypassing the bucket.
    ///
    /// Heartbeats are server-reserved traffic; the safe-rate
    /// derivation already set their tokens aside.
    pub(crate) async fn send_heartbeat(&self) {
        let sequence = self.inner.session.lock().await.sequence;
        let payload = build_heartbeat(sequence);
        let Ok(text) = serde_json::to_string(&payload) else {
            return;
        };
        {
            let mut socket = self.inner.socket.lock().await;
            let Some(current) = socket.as_mut() else { return };
            if let Err(error) = current.sink.send(text).await {
                debug!(shard_id = self.inner.id, %error, "heartbeat send failed");
                return;
            }
        }
        self.inner.heart.lock().await.note_beat();
        self.inner.hooks.events.heartbeat(self.inner.id, sequence);
    }
}

/// Backoff before acting on an invalid session: uniformly random in
/// `[1, 5)` seconds.
fn invalid_session_backoff_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let millis = ((fastrand::f64() * 4.0 + 1.0) * 1000.0).floor() as u64;
    millis
}
