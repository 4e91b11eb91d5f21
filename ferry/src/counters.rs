//! Process-wide system counters.
//!
//! Counters are monotonically non-decreasing `i64`s readable from any thread.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum SystemCounter {
    /// Errors recorded in the driver's error log.
    Errors,
    /// Error frames handed to client notification queues.
    ErrorFramesSent,
    /// Error frames processed by clients.
    ErrorFramesReceived,
    ImagesCreated,
    /// Images that expired without explicit rejection.
    ImageLivenessTimeouts,
    ClientTimeouts,
    /// Notifications dropped because a client queue was full.
    NotificationsDropped,
}

impl SystemCounter {
    pub const ALL: [Self; 7] = [
        Self::Errors,
        Self::ErrorFramesSent,
        Self::ErrorFramesReceived,
        Self::ImagesCreated,
        Self::ImageLivenessTimeouts,
        Self::ClientTimeouts,
        Self::NotificationsDropped,
    ];

    #[must_use]
    pub const fn id(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Errors => "Errors",
            Self::ErrorFramesSent => "Error frames sent",
            Self::ErrorFramesReceived => "Error frames received",
            Self::ImagesCreated => "Images created",
            Self::ImageLivenessTimeouts => "Image liveness timeouts",
            Self::ClientTimeouts => "Client liveness timeouts",
            Self::NotificationsDropped => "Notifications dropped",
        }
    }
}

/// Fixed set of atomic counters, one per [`SystemCounter`].
#[derive(Default)]
pub struct SystemCounters {
    values: [AtomicI64; SystemCounter::ALL.len()],
}

impl SystemCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn increment(&self, counter: SystemCounter) {
        self.add(counter, 1);
    }

    #[inline]
    pub fn add(&self, counter: SystemCounter, delta: i64) {
        debug_assert!(delta >= 0, "counters never decrease");
        self.values[counter.id()].fetch_add(delta, Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn get(&self, counter: SystemCounter) -> i64 {
        self.values[counter.id()].load(Ordering::Acquire)
    }
}

impl fmt::Debug for SystemCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for counter in SystemCounter::ALL {
            map.entry(&counter.label(), &self.get(counter));
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_match_positions() {
        for (i, counter) in SystemCounter::ALL.iter().enumerate() {
            assert_eq!(counter.id(), i);
        }
    }

    #[test]
    fn counters_are_independent() {
        let counters = SystemCounters::new();
        counters.increment(SystemCounter::Errors);
        counters.add(SystemCounter::ErrorFramesSent, 2);
        assert_eq!(counters.get(SystemCounter::Errors), 1);
        assert_eq!(counters.get(SystemCounter::ErrorFramesSent), 2);
        assert_eq!(counters.get(SystemCounter::ErrorFramesReceived), 0);
    }
}
