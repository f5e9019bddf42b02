//! Classify errors talking to a leader.
//!
//! While leadership fails over, calls to the old leader fail for up to one
//! lease TTL. The filter reports errors inside that window as transient,
//! unless a success was seen in between: an error after a success means
//! the leader is reachable and something else is wrong.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Probably a failover artefact; retry quietly.
    Transient,
    /// Worth surfacing.
    Persistent,
}

#[derive(Debug, Default)]
struct Window {
    first_error: Option<Instant>,
    recorded_success: Option<Instant>,
}

#[derive(Debug)]
pub struct ErrorFilter {
    ttl: Duration,
    window: Mutex<Window>,
}

impl ErrorFilter {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            window: Mutex::new(Window::default()),
        }
    }

    pub fn report_error(&self) -> FailureKind {
        self.report_error_at(Instant::now())
    }

    pub fn report_success(&self) {
        self.report_success_at(Instant::now());
    }

    pub fn report_error_at(&self, now: Instant) -> FailureKind {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(first) = window.first_error else {
            window.first_error = Some(now);
            return FailureKind::Transient;
        };
        if now > first + self.ttl || window.recorded_success.is_some() {
            FailureKind::Persistent
        } else {
            FailureKind::Transient
        }
    }

    pub fn report_success_at(&self, now: Instant) {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(first) = window.first_error else {
            return;
        };
        if now <= first + self.ttl {
            window.recorded_success = Some(now);
        } else {
            *window = Window::default();
        }
    }
}
