//! Bounded retry and polling with backoff and cancellation.
//!
//! Every wait in the session goes through here: busy retries on session
//! start, paper and calibration polls, response timeouts. Each attempt is
//! preceded by a cancellation check, and the number of attempts is always
//! `1 + max_retries`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::DriverError;

/// Cooperative cancellation flag shared between the caller and a session.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// `Err(Cancelled)` once the flag is set.
    pub fn check(&self) -> Result<(), DriverError> {
        if self.is_cancelled() {
            Err(DriverError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Delay growth per attempt; 1.0 keeps the delay fixed.
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    pub fn with_backoff(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.multiplier = multiplier.max(1.0);
        self.max_delay = max_delay.max(self.base_delay);
        self
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(16) as i32);
        let ms = (self.base_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(ms).min(self.max_delay)
    }
}

fn pause(delay: Duration) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
}

/// Run `op` until it succeeds, fails with an error `retryable` rejects, or
/// the retry budget is spent. The last error is returned on exhaustion.
pub fn retry<T>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    what: &str,
    retryable: impl Fn(&DriverError) -> bool,
    mut op: impl FnMut(u32) -> Result<T, DriverError>,
) -> Result<T, DriverError> {
    let mut attempt = 0;
    loop {
        cancel.check()?;
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) if retryable(&e) && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                debug!(what, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying");
                pause(delay);
                attempt += 1;
            }
            Err(e) => {
                if attempt >= policy.max_retries && retryable(&e) {
                    warn!(what, attempts = attempt + 1, "Retry limit exhausted");
                }
                return Err(e);
            }
        }
    }
}

/// Call `step` until it yields a value. `Ok(None)` means the poll budget
/// ran out without one.
pub fn poll<T>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    what: &str,
    mut step: impl FnMut(u32) -> Result<Option<T>, DriverError>,
) -> Result<Option<T>, DriverError> {
    let mut attempt = 0;
    loop {
        cancel.check()?;
        if let Some(value) = step(attempt)? {
            return Ok(Some(value));
        }
        if attempt >= policy.max_retries {
            debug!(what, polls = attempt + 1, "Poll budget spent");
            return Ok(None);
        }
        pause(policy.delay_for(attempt));
        attempt += 1;
    }
}
