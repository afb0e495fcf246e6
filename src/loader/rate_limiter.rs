//! Admission-rate limiting for the data-loading queue.
//!
//! A token bucket smooths bursts of requests (fast scrolling through
//! an image grid) so the transport layer is not flooded with transfers
//! that are about to be cancelled anyway. Work admitted while tokens
//! remain runs immediately; the rest queues FIFO and drains as the
//! bucket refills.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type Admission = Box<dyn FnOnce() + Send>;

struct LimiterState {
    available: f64,
    last_refill: Instant,
    pending: VecDeque<Admission>,
    is_draining: bool,
}

/// Token bucket gating admissions to the data-loading queue.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// Default bucket: 80 admissions per second, bursts of 25.
    pub fn new() -> Self {
        Self::with_rate(80.0, 25.0)
    }

    /// Create a bucket with an explicit refill rate (admissions per
    /// second) and burst capacity.
    pub fn with_rate(rate: f64, burst: f64) -> Self {
        Self {
            rate,
            burst,
            state: Mutex::new(LimiterState {
                available: burst,
                last_refill: Instant::now(),
                pending: VecDeque::new(),
                is_draining: false,
            }),
        }
    }

    /// Run `work` now if a token is available, otherwise queue it until
    /// the bucket refills.
    pub fn execute(self: Arc<Self>, work: impl FnOnce() + Send + 'static) {
        let admitted = {
            let mut state = self.state.lock().unwrap();
            self.refill(&mut state);
            if state.pending.is_empty() && state.available >= 1.0 {
                state.available -= 1.0;
                true
            } else {
                state.pending.push_back(Box::new(work));
                if !state.is_draining {
                    state.is_draining = true;
                    let limiter = Arc::clone(&self);
                    tokio::spawn(async move {
                        limiter.drain().await;
                    });
                }
                return;
            }
        };
        if admitted {
            work();
        }
    }

    async fn drain(self: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let mut ready = Vec::new();
            let finished;
            {
                let mut state = self.state.lock().unwrap();
                self.refill(&mut state);
                while state.available >= 1.0 {
                    let Some(work) = state.pending.pop_front() else {
                        break;
                    };
                    state.available -= 1.0;
                    ready.push(work);
                }
                finished = state.pending.is_empty();
                if finished {
                    state.is_draining = false;
                }
            }
            for work in ready {
                work();
            }
            if finished {
                return;
            }
        }
    }

    fn refill(&self, state: &mut LimiterState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        state.available = (state.available + elapsed * self.rate).min(self.burst);
    }

    /// Number of admissions waiting for tokens.
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
