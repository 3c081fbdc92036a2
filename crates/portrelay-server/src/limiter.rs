//! Per-listener session cap.
//!
//! [`SessionLimiter`] owns an atomic count of live sessions for one listener.
//! A slot is taken with [`SessionLimiter::try_acquire`] and handed back when
//! the returned [`SessionGuard`] is dropped, so the guard can simply be moved
//! into the session task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts live sessions against an optional maximum (`0` = unlimited).
#[derive(Debug)]
pub struct SessionLimiter {
    max_sessions: usize,
    active: Arc<AtomicUsize>,
}

impl SessionLimiter {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reserve a session slot.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` describing the limit when every slot is taken.
    pub fn try_acquire(&self) -> Result<SessionGuard, String> {
        if self.max_sessions == 0 {
            self.active.fetch_add(1, Ordering::Relaxed);
        } else {
            self.active
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < self.max_sessions).then_some(n + 1)
                })
                .map_err(|n| format!("session limit reached ({}/{})", n, self.max_sessions))?;
        }
        Ok(SessionGuard {
            counter: self.active.clone(),
        })
    }

    /// Current number of live sessions. Approximate under concurrency;
    /// meant for logging.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// RAII slot that decrements the session count on drop.
#[derive(Debug)]
pub struct SessionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
