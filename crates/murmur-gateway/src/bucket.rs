//! Leaky-bucket admission control for outbound gateway commands.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, oneshot};
use tokio::time::Instant;
use tracing::trace;

use crate::error::ShardError;

/// Tokens the gateway may demand back per rate-limit tick (ad hoc
/// heartbeat requests); reserved out of the caller budget.
const RESERVED_PER_BEAT: u32 = 2;

/// Tokens left for caller traffic after reserving heartbeat slots.
///
/// `max_per_interval − ceil(refill_interval / heartbeat_interval) × 2`,
/// clamped to zero when the heartbeat cadence exhausts the budget.
#[must_use]
pub fn safe_requests(
    max_per_interval: u32,
    refill_interval: Duration,
    heartbeat_interval: Duration,
) -> u32 {
    let beats = refill_interval
        .as_millis()
        .div_ceil(heartbeat_interval.as_millis().max(1));
    let reserved = u32::try_from(beats)
        .unwrap_or(u32::MAX)
        .saturating_mul(RESERVED_PER_BEAT);
    max_per_interval.saturating_sub(reserved)
}

/// Token-count rate limiter with priority waiters.
///
/// Tokens refill by `refill_amount` every `refill_interval`, capped at
/// `max`. [`acquire`](LeakyBucket::acquire) blocks until tokens are
/// available; waiters are served strictly in deque order, with
/// high-priority waiters pushed to the front. The waiter deque survives
/// [`reconfigure`](LeakyBucket::reconfigure), so nothing queued is lost
/// when the capacity changes mid-flight.
#[derive(Clone)]
pub struct LeakyBucket {
    state: Arc<Mutex<BucketState>>,
    /// Wakes the pump early after a reconfigure or shutdown.
    poke: Arc<Notify>,
}

struct Waiter {
    tokens: u32,
    tx: oneshot::Sender<Result<(), ShardError>>,
}

struct BucketState {
    max: u32,
    refill_amount: u32,
    refill_interval: Duration,
    available: u32,
    last_refill: Instant,
    waiting: VecDeque<Waiter>,
    pump_running: bool,
    shut_down: bool,
}

impl BucketState {
    /// Credit whole elapsed refill ticks.
    fn refill(&mut self) {
        let interval_ms = self.refill_interval.as_millis();
        if interval_ms == 0 {
            return;
        }
        let ticks = self.last_refill.elapsed().as_millis() / interval_ms;
        let Ok(ticks) = u32::try_from(ticks) else {
            self.available = self.max;
            self.last_refill = Instant::now();
            return;
        };
        if ticks == 0 {
            return;
        }
        self.available = self
            .available
            .saturating_add(ticks.saturating_mul(self.refill_amount))
            .min(self.max);
        self.last_refill += self.refill_interval * ticks;
    }

    /// Release waiters from the head while tokens last.
    ///
    /// A head waiter that needs more tokens than are available blocks
    /// everyone behind it; that keeps grant order equal to queue order.
    fn serve(&mut self) {
        while let Some(head) = self.waiting.front() {
            if head.tokens > self.available {
                break;
            }
            if let Some(waiter) = self.waiting.pop_front() {
                self.available -= waiter.tokens;
                let _ = waiter.tx.send(Ok(()));
            }
        }
    }
}

impl LeakyBucket {
    /// Create a bucket that starts full.
    #[must_use]
    pub fn new(max: u32, refill_amount: u32, refill_interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BucketState {
                max,
                refill_amount,
                refill_interval,
                available: max,
                last_refill: Instant::now(),
                waiting: VecDeque::new(),
                pump_running: false,
                shut_down: false,
            })),
            poke: Arc::new(Notify::new()),
        }
    }

    /// Acquire `tokens`, waiting for a refill if necessary.
    ///
    /// High-priority callers are queued at the head and overtake every
    /// pending low-priority waiter.
    ///
    /// # Errors
    ///
    /// [`ShardError::Shutdown`] when the bucket shuts down while the
    /// caller is waiting.
    pub async fn acquire(&self, tokens: u32, high_priority: bool) -> Result<(), ShardError> {
        let rx = {
            let mut state = self.state.lock().await;
            if state.shut_down {
                return Err(ShardError::Shutdown);
            }
            state.refill();
            if state.waiting.is_empty() && state.available >= tokens {
                state.available -= tokens;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let waiter = Waiter { tokens, tx };
            if high_priority {
                state.waiting.push_front(waiter);
            } else {
                state.waiting.push_back(waiter);
            }
            trace!(queued = state.waiting.len(), high_priority, "bucket waiter parked");
            self.spawn_pump(&mut state);
            rx
        };
        rx.await.unwrap_or(Err(ShardError::Shutdown))
    }

    /// Replace the capacity and refill settings in place.
    ///
    /// The fresh budget starts full and queued waiters are served
    /// against it immediately, in their existing order.
    pub async fn reconfigure(&self, max: u32, refill_amount: u32, refill_interval: Duration) {
        let mut state = self.state.lock().await;
        state.max = max;
        state.refill_amount = refill_amount;
        state.refill_interval = refill_interval;
        state.available = max;
        state.last_refill = Instant::now();
        state.serve();
        self.spawn_pump(&mut state);
        self.poke.notify_waiters();
    }

    /// Wake every queued waiter with a cancellation outcome, keeping
    /// the bucket usable.
    pub async fn abort_waiters(&self) {
        let mut state = self.state.lock().await;
        for waiter in state.waiting.drain(..) {
            let _ = waiter.tx.send(Err(ShardError::Shutdown));
        }
        self.poke.notify_waiters();
    }

    /// Shut the bucket down; every queued and future acquire fails.
    pub async fn shut_down(&self) {
        let mut state = self.state.lock().await;
        state.shut_down = true;
        for waiter in state.waiting.drain(..) {
            let _ = waiter.tx.send(Err(ShardError::Shutdown));
        }
        self.poke.notify_waiters();
    }

    /// Tokens currently available.
    pub async fn available(&self) -> u32 {
        let mut state = self.state.lock().await;
        state.refill();
        state.available
    }

    /// Queued waiter count.
    pub async fn waiting(&self) -> usize {
        self.state.lock().await.waiting.len()
    }

    /// Start the refill pump if waiters are queued and it is not
    /// already running. The pump exits once the queue drains.
    fn spawn_pump(&self, state: &mut BucketState) {
        if state.pump_running || state.waiting.is_empty() || state.shut_down {
            return;
        }
        state.pump_running = true;
        let shared = Arc::clone(&self.state);
        let poke = Arc::clone(&self.poke);
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let mut state = shared.lock().await;
                    state.refill();
                    state.serve();
                    if state.shut_down || state.waiting.is_empty() {
                        state.pump_running = false;
                        return;
                    }
                    state.last_refill + state.refill_interval
                };
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => {}
                    () = poke.notified() => {}
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    const TICK: Duration = Duration::from_millis(40);

    #[test]
    fn safe_requests_reserves_heartbeat_budget() {
        // ceil(60000 / 41250) = 2 beats, 4 reserved tokens.
        let safe = safe_requests(
            120,
            Duration::from_secs(60),
            Duration::from_millis(41_250),
        );
        assert_eq!(safe, 116);
    }

    #[test]
    fn safe_requests_clamps_to_zero() {
        // 120 beats per interval reserve 240 tokens out of 120.
        let safe = safe_requests(120, Duration::from_secs(60), Duration::from_millis(500));
        assert_eq!(safe, 0);
    }

    #[tokio::test]
    async fn acquire_is_immediate_while_tokens_last() {
        let bucket = LeakyBucket::new(3, 3, Duration::from_secs(60));
        for _ in 0..3 {
            bucket.acquire(1, false).await.unwrap();
        }
        assert_eq!(bucket.available().await, 0);
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        let bucket = LeakyBucket::new(1, 1, TICK);
        bucket.acquire(1, false).await.unwrap();

        let start = Instant::now();
        bucket.acquire(1, false).await.unwrap();
        assert!(start.elapsed() >= TICK / 2, "second acquire should wait for a tick");
    }

    #[tokio::test]
    async fn high_priority_overtakes_queued_lows() {
        let bucket = LeakyBucket::new(1, 1, TICK);
        bucket.acquire(1, false).await.unwrap();

        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for label in ["low-1", "low-2"] {
            let bucket = bucket.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                bucket.acquire(1, false).await.unwrap();
                order.lock().unwrap().push(label);
            }));
            tokio::task::yield_now().await;
        }
        {
            let bucket = bucket.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                bucket.acquire(1, true).await.unwrap();
                order.lock().unwrap().push("high");
            }));
            tokio::task::yield_now().await;
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["high", "low-1", "low-2"]);
    }

    #[tokio::test]
    async fn reconfigure_serves_existing_waiters() {
        let bucket = LeakyBucket::new(0, 0, Duration::from_secs(60));

        let waiter = {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.acquire(1, false).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(bucket.waiting().await, 1);

        bucket.reconfigure(10, 10, Duration::from_secs(60)).await;
        waiter.await.unwrap().unwrap();
        assert_eq!(bucket.available().await, 9);
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters_with_error() {
        let bucket = LeakyBucket::new(0, 0, Duration::from_secs(60));
        let waiter = {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.acquire(1, false).await })
        };
        tokio::task::yield_now().await;

        bucket.shut_down().await;
        assert!(matches!(waiter.await.unwrap(), Err(ShardError::Shutdown)));
        assert!(matches!(
            bucket.acquire(1, false).await,
            Err(ShardError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn abort_waiters_keeps_bucket_usable() {
        let bucket = LeakyBucket::new(0, 0, Duration::from_secs(60));
        let waiter = {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.acquire(1, false).await })
        };
        tokio::task::yield_now().await;

        bucket.abort_waiters().await;
        assert!(matches!(waiter.await.unwrap(), Err(ShardError::Shutdown)));

        bucket.reconfigure(1, 1, Duration::from_secs(60)).await;
        bucket.acquire(1, false).await.unwrap();
    }

    #[tokio::test]
    async fn refill_is_capped_at_max() {
        let bucket = LeakyBucket::new(2, 5, TICK);
        bucket.acquire(1, false).await.unwrap();
        tokio::time::sleep(TICK * 3).await;
        assert_eq!(bucket.available().await, 2);
    }
}
