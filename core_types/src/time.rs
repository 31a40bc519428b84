//! Time abstractions
//!
//! Filament runs on an injected logical clock. `VirtualTime` is a point
//! on that clock, `TimeDelta` a distance between two points, and `Tick`
//! the per-timeline logical step index assigned at commit. Wall-clock
//! timestamps appear only as informational metadata in event headers and
//! are never constrained.

use core::ops::{Add, Sub};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in virtual time, in nanoseconds on the injected clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VirtualTime {
    nanos: u64,
}

impl VirtualTime {
    /// The clock origin.
    pub const ZERO: VirtualTime = VirtualTime { nanos: 0 };

    /// Creates a point from nanoseconds.
    pub const fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    /// Returns nanoseconds since the clock origin.
    pub const fn as_nanos(&self) -> u64 {
        self.nanos
    }

    /// Returns the delta since an earlier point (saturating).
    pub fn delta_since(&self, earlier: VirtualTime) -> TimeDelta {
        TimeDelta::from_nanos(self.nanos.saturating_sub(earlier.nanos))
    }
}

impl Add<TimeDelta> for VirtualTime {
    type Output = VirtualTime;

    fn add(self, delta: TimeDelta) -> Self::Output {
        VirtualTime::from_nanos(self.nanos + delta.as_nanos())
    }
}

impl Sub<TimeDelta> for VirtualTime {
    type Output = VirtualTime;

    fn sub(self, delta: TimeDelta) -> Self::Output {
        VirtualTime::from_nanos(self.nanos.saturating_sub(delta.as_nanos()))
    }
}

impl fmt::Display for VirtualTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vt:{}", self.nanos)
    }
}

/// A span of virtual time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeDelta {
    nanos: u64,
}

impl TimeDelta {
    /// The empty span.
    pub const ZERO: TimeDelta = TimeDelta { nanos: 0 };

    /// Creates a span from nanoseconds.
    pub const fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    /// Creates a span from microseconds.
    pub const fn from_micros(micros: u64) -> Self {
        Self { nanos: micros * 1_000 }
    }

    /// Creates a span from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self { nanos: millis * 1_000_000 }
    }

    /// Returns the span in nanoseconds.
    pub const fn as_nanos(&self) -> u64 {
        self.nanos
    }
}

impl Add for TimeDelta {
    type Output = TimeDelta;

    fn add(self, other: TimeDelta) -> Self::Output {
        TimeDelta::from_nanos(self.nanos + other.nanos)
    }
}

impl Sub for TimeDelta {
    type Output = TimeDelta;

    fn sub(self, other: TimeDelta) -> Self::Output {
        TimeDelta::from_nanos(self.nanos.saturating_sub(other.nanos))
    }
}

/// Logical step index on a timeline.
///
/// Ticks are strictly monotonic and unique across all committed events of
/// a timeline; once committed, a tick never changes or shifts on prune.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Tick(u64);

impl Tick {
    /// Tick zero; the first committed event gets `Tick::ZERO.next()`.
    pub const ZERO: Tick = Tick(0);

    /// Creates a tick from its raw index.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw index.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the successor tick.
    pub const fn next(&self) -> Tick {
        Tick(self.0 + 1)
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tick:{}", self.0)
    }
}
