// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Rate-limited versions of the [`tracing`] event macros.
//!
//! Use these wherever the host (or any other untrusted party) can cause an
//! event to be logged on demand, such as when it sends a malformed control
//! message or corrupts a ring. Each call site owns a small budget of events
//! per period; once the budget is spent, further events are counted and the
//! count is reported as `dropped_ratelimited` on the next event that gets
//! through.

#![forbid(unsafe_code)]

use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;
#[doc(hidden)]
pub use tracing;

/// The default period over which events are counted.
pub const PERIOD: Duration = Duration::from_secs(5);
/// The default number of events allowed per period.
pub const EVENTS_PER_PERIOD: u32 = 10;

static DISABLED: AtomicBool = AtomicBool::new(false);

/// Disables or reenables rate limiting for every call site.
///
/// Tests usually want every event.
pub fn disable_rate_limiting(disabled: bool) {
    DISABLED.store(disabled, Ordering::Relaxed);
}

/// The per-call-site limiter state.
#[doc(hidden)]
pub struct RateLimiter {
    period: Duration,
    budget: u32,
    state: Mutex<Window>,
}

struct Window {
    opened: Option<Instant>,
    logged: u32,
    dropped: u64,
}

/// The event was suppressed.
#[doc(hidden)]
#[derive(Debug)]
pub struct Suppressed;

impl RateLimiter {
    /// A limiter with [`PERIOD`] and [`EVENTS_PER_PERIOD`].
    pub const fn new() -> Self {
        Self::with_budget(PERIOD, EVENTS_PER_PERIOD)
    }

    /// A limiter that allows `budget` events every `period`.
    pub const fn with_budget(period: Duration, budget: u32) -> Self {
        Self {
            period,
            budget,
            state: Mutex::new(Window {
                opened: None,
                logged: 0,
                dropped: 0,
            }),
        }
    }

    /// Accounts for one event.
    ///
    /// Returns the number of events dropped since the last one that was
    /// logged, or `None` if there were none and the budget is not exhausted
    /// by this event.
    pub fn event(&self) -> Result<Option<u64>, Suppressed> {
        if DISABLED.load(Ordering::Relaxed) {
            return Ok(None);
        }
        // Contention means another event is being logged right now. Drop
        // this one rather than wait.
        let mut state = self.state.try_lock().ok_or(Suppressed)?;
        let now = Instant::now();
        match state.opened {
            Some(opened) if now.duration_since(opened) <= self.period => {}
            _ => {
                state.opened = Some(now);
                state.logged = 0;
            }
        }
        if state.logged >= self.budget {
            state.dropped += 1;
            return Err(Suppressed);
        }
        state.logged += 1;
        let dropped = std::mem::take(&mut state.dropped);
        Ok((dropped != 0 || state.logged == self.budget).then_some(dropped))
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __ratelimited {
    ($level:ident, $($rest:tt)*) => {{
        static LIMITER: $crate::RateLimiter = $crate::RateLimiter::new();
        if let Ok(dropped) = LIMITER.event() {
            $crate::tracing::$level!(dropped_ratelimited = dropped, $($rest)*);
        }
    }};
}

/// As [`tracing::error!`], but rate limited per call site.
#[macro_export]
macro_rules! error_ratelimited {
    ($($rest:tt)*) => { $crate::__ratelimited!(error, $($rest)*) };
}

/// As [`tracing::warn!`], but rate limited per call site.
#[macro_export]
macro_rules! warn_ratelimited {
    ($($rest:tt)*) => { $crate::__ratelimited!(warn, $($rest)*) };
}

/// As [`tracing::info!`], but rate limited per call site.
#[macro_export]
macro_rules! info_ratelimited {
    ($($rest:tt)*) => { $crate::__ratelimited!(info, $($rest)*) };
}

#[cfg(test)]
mod tests {
    use super::RateLimiter;
    use std::time::Duration;

    #[test]
    fn budget_then_drop_count() {
        let limiter = RateLimiter::with_budget(Duration::from_secs(3600), 2);
        assert_eq!(limiter.event().unwrap(), None);
        // The last event within budget reports so the reader knows more may
        // have been lost.
        assert_eq!(limiter.event().unwrap(), Some(0));
        assert!(limiter.event().is_err());
        assert!(limiter.event().is_err());
    }

    #[test]
    fn window_reopens() {
        let limiter = RateLimiter::with_budget(Duration::ZERO, 1);
        assert_eq!(limiter.event().unwrap(), Some(0));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(limiter.event().unwrap(), Some(0));
    }

    #[test]
    fn macros_expand() {
        let value = 5;
        crate::warn_ratelimited!(value, "warning");
        crate::error_ratelimited!("plain error");
        crate::info_ratelimited!(value = %value, "info {}", value);
    }
}
