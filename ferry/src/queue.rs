//! Bounded lock-free queues between client threads and the conductor.
//!
//! - [`mpsc`]: command inbox. Every client holds a clone of the producer, the
//!   conductor owns the only consumer.
//! - [`spsc`]: one notification queue per client. The conductor produces, the
//!   client consumes.
//!
//! Neither side ever blocks inside `push`/`pop`; a full queue hands the item
//! back so the caller decides what a drop means.

pub mod mpsc;
pub mod spsc;

use std::time::Duration;

/// Timeout specification for the spinning helpers.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

impl Timeout {
    pub(crate) fn deadline(self) -> Option<minstant::Instant> {
        match self {
            Self::Infinite => None,
            Self::Duration(d) => Some(minstant::Instant::now() + d),
        }
    }
}

/// Compile-time assertion that a queue capacity is non-zero.
struct CapacityCheck<const N: usize>;

impl<const N: usize> CapacityCheck<N> {
    const OK: () = assert!(N > 0, "queue capacity must be greater than 0");
}
