//! Timing primitives for the conductor.
//!
//! - `time`: strongly-typed units, durations and monotonic instants.
//! - `slab`: generational slab backing the wheel's intrusive timer lists.
//! - `wheel`: hashed timing wheel with O(1) schedule/cancel.
//!
//! Everything here is single-threaded and takes `now` explicitly, so tests can
//! drive the clock by hand.

mod slab;
mod time;
pub mod wheel;

pub use time::{Duration, Micros, Millis, MonoInstant, Now, TimeUnit};
pub use wheel::{PowerOfTwo, TimerHandle, Wheel, WheelConfig, WheelError};
