//! Minimal time units and strongly-typed durations/instants.
use core::marker::PhantomData;
use std::sync::OnceLock;

/// Marker trait for a time unit.
pub trait TimeUnit: Copy + Ord + core::hash::Hash + core::fmt::Debug {
    /// Human-readable name for logs.
    const NAME: &'static str;
    /// Nanoseconds per unit.
    const NANOS: u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Micros {}
impl TimeUnit for Micros {
    const NAME: &'static str = "us";
    const NANOS: u64 = 1_000;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Millis {}
impl TimeUnit for Millis {
    const NAME: &'static str = "ms";
    const NANOS: u64 = 1_000_000;
}

/// Source of "now" for a unit.
pub trait Now: TimeUnit + Sized {
    fn now() -> MonoInstant<Self>;
}

fn process_anchor() -> minstant::Instant {
    static ANCHOR: OnceLock<minstant::Instant> = OnceLock::new();
    *ANCHOR.get_or_init(minstant::Instant::now)
}

fn elapsed_nanos() -> u64 {
    u64::try_from(process_anchor().elapsed().as_nanos()).unwrap_or(u64::MAX)
}

impl Now for Micros {
    fn now() -> MonoInstant<Self> {
        MonoInstant::new(elapsed_nanos() / Self::NANOS)
    }
}

impl Now for Millis {
    fn now() -> MonoInstant<Self> {
        MonoInstant::new(elapsed_nanos() / Self::NANOS)
    }
}

/// Strongly-typed duration in a given unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Duration<U: TimeUnit>(u64, PhantomData<U>);

/// Point on a monotonic timeline, counted in `U` since an arbitrary origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MonoInstant<U: TimeUnit>(u64, PhantomData<U>);

impl<U: TimeUnit> Duration<U> {
    pub const ZERO: Self = Self::new(0);

    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value, PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Converts from `std::time::Duration`, truncating sub-unit precision.
    #[must_use]
    pub fn from_std(d: std::time::Duration) -> Self {
        Self::new(u64::try_from(d.as_nanos() / u128::from(U::NANOS)).unwrap_or(u64::MAX))
    }

    #[must_use]
    pub const fn to_std(self) -> std::time::Duration {
        std::time::Duration::from_nanos(self.0.saturating_mul(U::NANOS))
    }
}

impl Duration<Millis> {
    #[inline]
    #[must_use]
    pub const fn from_millis(value: u64) -> Self {
        Self::new(value)
    }
}

impl<U: TimeUnit> MonoInstant<U> {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value, PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    #[must_use]
    pub const fn saturating_duration_since(self, earlier: Self) -> Duration<U> {
        Duration::new(self.0.saturating_sub(earlier.0))
    }
}

impl<U: TimeUnit> core::ops::Add<Duration<U>> for MonoInstant<U> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Duration<U>) -> Self::Output {
        Self::new(self.0.saturating_add(rhs.0))
    }
}

impl<U: TimeUnit> core::fmt::Display for Duration<U> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}{}", self.0, U::NAME)
    }
}

impl<U: TimeUnit> core::fmt::Display for MonoInstant<U> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "@{}{}", self.0, U::NAME)
    }
}
