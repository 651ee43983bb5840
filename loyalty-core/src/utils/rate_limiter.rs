//! Shared backoff window opened by upstream throttling.
//!
//! Workers polling the same upstream share one limiter. The first `429`
//! opens the window for the advertised `Retry-After` (60 s if absent,
//! never more than [`MAX_COOL_DOWN`]);
//! further `429`s within [`DUPLICATE_WINDOW`] of that activation are
//! treated as echoes of the same throttle and ignored.

use super::retry_after::parse_retry_after;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;

pub const TOO_MANY_REQUESTS: u16 = 429;
pub const DUPLICATE_WINDOW: Duration = Duration::from_secs(5);
pub const DEFAULT_COOL_DOWN: Duration = Duration::from_secs(60);
pub const MAX_COOL_DOWN: Duration = Duration::from_secs(60 * 60);

/// Status of an upstream response and its `Retry-After` header, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleSignal {
    pub status: u16,
    pub retry_after: Option<String>,
}

impl ThrottleSignal {
    pub fn too_many_requests(retry_after: Option<String>) -> Self {
        Self {
            status: TOO_MANY_REQUESTS,
            retry_after,
        }
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    active: bool,
    cool_down: Duration,
    last_activation: Option<Instant>,
    /// Bumped on every activation so a waiter only clears its own window.
    generation: u64,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed a response status to the limiter. Returns whether limiting is active.
    pub fn observe(&self, signal: &ThrottleSignal) -> bool {
        if signal.status != TOO_MANY_REQUESTS {
            return false;
        }

        let now = Instant::now();
        let mut state = self.lock();
        if state
            .last_activation
            .is_some_and(|at| now.duration_since(at) < DUPLICATE_WINDOW)
        {
            return true;
        }

        let cool_down = signal
            .retry_after
            .as_deref()
            .and_then(|v| parse_retry_after(v, OffsetDateTime::now_utc()))
            .unwrap_or(DEFAULT_COOL_DOWN)
            .min(MAX_COOL_DOWN);

        state.active = true;
        state.cool_down = cool_down;
        state.last_activation = Some(now);
        state.generation += 1;
        tracing::warn!(
            cool_down_secs = cool_down.as_secs(),
            "Upstream throttled, pausing requests"
        );
        true
    }

    pub fn is_limiting(&self) -> bool {
        self.lock().active
    }

    /// Wait out the current window, if any, then clear it.
    ///
    /// A window opened by a newer activation while waiting is left in place.
    pub async fn await_clear(&self) {
        let (deadline, generation) = {
            let state = self.lock();
            if !state.active {
                return;
            }
            let activated = state.last_activation.unwrap_or_else(Instant::now);
            let deadline = activated
                .checked_add(state.cool_down)
                .unwrap_or_else(|| activated + MAX_COOL_DOWN);
            (deadline, state.generation)
        };

        tokio::time::sleep_until(deadline).await;

        let mut state = self.lock();
        if state.generation == generation {
            state.active = false;
            state.cool_down = Duration::ZERO;
        }
    }
}
