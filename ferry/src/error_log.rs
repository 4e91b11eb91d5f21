//! Distinct error log.
//!
//! Identical errors (same code and message) share one entry whose observation
//! count grows. Every observation, new or repeated, increments
//! [`SystemCounter::Errors`].

use std::sync::Arc;

use parking_lot::Mutex;

use crate::counters::{SystemCounter, SystemCounters};
use crate::driver::commands::ErrorCode;
use crate::timing::{Micros, MonoInstant};

/// One distinct error and how often it was seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorObservation {
    pub code: ErrorCode,
    pub message: String,
    pub count: u64,
    pub first_seen: MonoInstant<Micros>,
    pub last_seen: MonoInstant<Micros>,
}

pub struct ErrorLog {
    entries: Mutex<Vec<ErrorObservation>>,
    counters: Arc<SystemCounters>,
}

impl ErrorLog {
    #[must_use]
    pub fn new(counters: Arc<SystemCounters>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            counters,
        }
    }

    /// Records an observation. Returns `true` if it is a new distinct error.
    pub fn record(&self, code: ErrorCode, message: &str, now: MonoInstant<Micros>) -> bool {
        let is_new = {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries
                .iter_mut()
                .find(|e| e.code == code && e.message == message)
            {
                entry.count += 1;
                entry.last_seen = now;
                false
            } else {
                entries.push(ErrorObservation {
                    code,
                    message: message.to_owned(),
                    count: 1,
                    first_seen: now,
                    last_seen: now,
                });
                true
            }
        };
        self.counters.increment(SystemCounter::Errors);
        is_new
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<ErrorObservation> {
        self.entries.lock().clone()
    }

    /// Returns `true` if any recorded message contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.entries.lock().iter().any(|e| e.message.contains(needle))
    }

    /// Number of distinct errors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
