//! Token-bucket rate limiter shared across the adapter instance (spec section
//! 4.1 / 5). Grounded on a priority-queue token bucket from the wider
//! example pack, simplified to the single-priority case this system needs:
//! one queue, fair FIFO admission, cooperative blocking.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};

struct Waiter {
    tx: oneshot::Sender<()>,
    cancelled: Arc<AtomicBool>,
}

struct Inner {
    capacity: usize,
    tokens: usize,
    interval: Duration,
    last_refill: Instant,
    waiters: VecDeque<Waiter>,
}

impl Inner {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        if elapsed >= self.interval {
            let periods = elapsed.as_millis() / self.interval.as_millis().max(1);
            let add_tokens = (periods as usize + 1) * self.capacity;
            self.last_refill = now;
            self.tokens = (self.tokens + add_tokens).min(self.capacity);
        }
        self.drain_waiters();
    }

    /// Hands out tokens to queued waiters, skipping any that cancelled
    /// (dropped their `acquire()` future) without spending a token on them.
    fn drain_waiters(&mut self) {
        while self.tokens > 0 {
            match self.waiters.pop_front() {
                Some(waiter) if waiter.cancelled.load(Ordering::SeqCst) => continue,
                Some(waiter) => {
                    self.tokens -= 1;
                    let _ = waiter.tx.send(());
                }
                None => break,
            }
        }
    }
}

/// Marks its waiter cancelled on drop so a parked `acquire()` that is itself
/// cancelled (e.g. by an enclosing `tokio::time::timeout`) never burns a
/// bucket token it was never handed.
struct CancelOnDrop {
    cancelled: Arc<AtomicBool>,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// A token bucket admitting `capacity` operations per `interval`, refilled
/// lazily on each `acquire`. Cloning shares the same underlying bucket.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<Inner>>,
}

impl RateLimiter {
    pub fn new(capacity: usize, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                capacity,
                tokens: capacity,
                interval,
                last_refill: Instant::now(),
                waiters: VecDeque::new(),
            })),
        }
    }

    pub fn per_second(capacity: usize) -> Self {
        Self::new(capacity, Duration::from_secs(1))
    }

    /// Blocks until a token is available. Cancel-safe: if the returned
    /// future is dropped before it resolves, its queued waiter is marked
    /// cancelled and the next `refill()` skips it rather than spending a
    /// token on a waiter nobody is listening for anymore.
    pub async fn acquire(&self) {
        loop {
            let (rx, _guard) = {
                let mut inner = self.inner.lock().await;
                inner.refill();
                if inner.tokens > 0 {
                    inner.tokens -= 1;
                    (None, None)
                } else {
                    let (tx, rx) = oneshot::channel();
                    let cancelled = Arc::new(AtomicBool::new(false));
                    inner.waiters.push_back(Waiter { tx, cancelled: cancelled.clone() });
                    (Some(rx), Some(CancelOnDrop { cancelled }))
                }
            };
            match rx {
                None => return,
                Some(rx) => {
                    let _ = rx.await;
                }
            }
        }
    }
}
