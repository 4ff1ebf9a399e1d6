//! Heartbeat engine: jittered first beat, steady interval, ack
//! tracking and zombie detection.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::protocol::CloseCode;
use crate::shard::{Shard, ShardState};

/// Interval assumed until the server supplies one in `Hello`.
pub(crate) const DEFAULT_INTERVAL_MS: u64 = 45_000;

/// Heartbeat bookkeeping for the current connection.
pub(crate) struct Heart {
    /// Beat cadence negotiated in `Hello`.
    pub(crate) interval: Duration,
    /// `false` from the moment a beat is transmitted until the next
    /// inbound packet.
    pub(crate) acknowledged: bool,
    /// When the last beat went out.
    pub(crate) last_beat_at: Option<Instant>,
    /// When the last inbound packet arrived.
    pub(crate) last_ack_at: Option<Instant>,
    /// Round-trip measured between a beat and the next inbound packet.
    pub(crate) rtt: Option<Duration>,
    jitter: Option<JoinHandle<()>>,
    steady: Option<JoinHandle<()>>,
}

impl Heart {
    pub(crate) fn new() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            acknowledged: true,
            last_beat_at: None,
            last_ack_at: None,
            rtt: None,
            jitter: None,
            steady: None,
        }
    }

    /// Record an inbound packet: any traffic proves the link alive, so
    /// RTT is measured against the last unacknowledged beat rather
    /// than waiting for an explicit ack frame.
    pub(crate) fn note_packet(&mut self) {
        let now = Instant::now();
        self.last_ack_at = Some(now);
        if let Some(beat) = self.last_beat_at
            && !self.acknowledged
        {
            self.rtt = Some(now.saturating_duration_since(beat));
            self.acknowledged = true;
        }
    }

    /// Record an outbound beat.
    pub(crate) fn note_beat(&mut self) {
        self.last_beat_at = Some(Instant::now());
        self.acknowledged = false;
    }

    /// Cancel both timers. Abort is synchronous; no further beat fires
    /// after this returns.
    pub(crate) fn stop(&mut self) {
        if let Some(handle) = self.jitter.take() {
            handle.abort();
        }
        if let Some(handle) = self.steady.take() {
            handle.abort();
        }
    }
}

/// First-beat delay: `ceil(interval × max(random, 0.5))`.
///
/// The 0.5 floor keeps the first beat from racing the identify
/// handshake at near-zero delay.
fn jitter_delay(interval: Duration) -> Duration {
    let factor = fastrand::f64().max(0.5);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let millis = (interval.as_millis() as f64 * factor).ceil() as u64;
    Duration::from_millis(millis)
}

/// Start heartbeating for the current connection.
///
/// Driven by the `Hello` packet. Replaces any timers left over from a
/// previous connection.
pub(crate) async fn start(shard: Shard, interval_ms: u64) {
    let interval = Duration::from_millis(interval_ms);
    {
        let mut heart = shard.heart().lock().await;
        heart.stop();
        heart.interval = interval;
        heart.acknowledged = true;
        heart.last_beat_at = None;
    }
    if matches!(
        shard.state().await,
        ShardState::Disconnected | ShardState::Offline
    ) {
        shard.set_state(ShardState::Unidentified).await;
    }

    let delay = jitter_delay(interval);
    debug!(
        shard_id = shard.id(),
        interval_ms,
        delay_ms = delay.as_millis() as u64,
        "starting heartbeat"
    );
    let beat_shard = shard.clone();
    let jitter = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if !beat_shard.is_open().await {
            return;
        }
        beat_shard.send_heartbeat().await;
        // Spawn and register the steady timer without yielding in
        // between, so a concurrent stop() cannot orphan it.
        let mut heart = beat_shard.heart().lock().await;
        let steady = tokio::spawn(run_steady(beat_shard.clone(), interval));
        heart.steady = Some(steady);
    });
    shard.heart().lock().await.jitter = Some(jitter);
}

/// Steady beats every `interval`. A tick that finds the previous beat
/// unacknowledged means the connection is zombied: close it and start
/// a fresh identify.
async fn run_steady(shard: Shard, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        if !shard.is_open().await {
            continue;
        }
        let acknowledged = shard.heart().lock().await.acknowledged;
        if acknowledged {
            shard.send_heartbeat().await;
            continue;
        }

        warn!(shard_id = shard.id(), "heartbeat ack missed, connection zombied");
        // The close below aborts this task, so the teardown runs in
        // its own task.
        let zombied = shard.clone();
        tokio::spawn(async move {
            zombied
                .close(CloseCode::ZombiedConnection, "zombied connection")
                .await;
            if let Err(error) = zombied.identify().await {
                warn!(
                    shard_id = zombied.id(),
                    %error,
                    "re-identify after zombied connection failed"
                );
            }
        });
        return;
    }
}
