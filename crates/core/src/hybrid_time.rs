//! Hybrid time: physical microseconds plus a logical counter
//!
//! ## Encoding
//!
//! A hybrid time is a single `u64`:
//!
//! ```text
//! ┌──────────────────────────────────────────┬──────────────┐
//! │ physical microseconds since epoch (52)   │ logical (12) │
//! └──────────────────────────────────────────┴──────────────┘
//! ```
//!
//! Ordering the raw value orders by physical time first, then by the
//! logical counter. The logical counter disambiguates events that share a
//! microsecond.
//!
//! ## Clock
//!
//! [`HybridClock`] never hands out the same value twice and never goes
//! backwards, even if the wall clock does. [`Clock::update`] lets a node
//! move its clock past a hybrid time it has observed from another node.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Number of bits used by the logical component
pub const LOGICAL_BITS: u32 = 12;

const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// Hybrid timestamp ordering transactions across tablets
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HybridTime(u64);

impl HybridTime {
    /// Smallest hybrid time; initial history cutoff of every tablet
    pub const MIN: HybridTime = HybridTime(0);

    /// Largest representable hybrid time
    pub const MAX: HybridTime = HybridTime(u64::MAX);

    /// Build from physical microseconds and a logical counter
    pub const fn new(physical_micros: u64, logical: u64) -> Self {
        HybridTime((physical_micros << LOGICAL_BITS) | (logical & LOGICAL_MASK))
    }

    /// Build from physical microseconds with a zero logical component
    pub const fn from_micros(physical_micros: u64) -> Self {
        HybridTime::new(physical_micros, 0)
    }

    /// Wrap a raw encoded value
    pub const fn from_raw(raw: u64) -> Self {
        HybridTime(raw)
    }

    /// Raw encoded value
    #[inline]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Physical component in microseconds since Unix epoch
    #[inline]
    pub const fn physical_micros(&self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    /// Logical component
    #[inline]
    pub const fn logical(&self) -> u64 {
        self.0 & LOGICAL_MASK
    }

    /// Subtract a duration from the physical component, saturating at `MIN`
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        let micros = self
            .physical_micros()
            .saturating_sub(duration.as_micros() as u64);
        HybridTime::new(micros, 0)
    }

    /// Add a duration to the physical component
    pub fn saturating_add(&self, duration: Duration) -> Self {
        let micros = self
            .physical_micros()
            .saturating_add(duration.as_micros() as u64)
            .min(u64::MAX >> LOGICAL_BITS);
        HybridTime::new(micros, self.logical())
    }

    /// Hybrid time immediately before this one (saturating)
    pub fn decremented(&self) -> Self {
        HybridTime(self.0.saturating_sub(1))
    }

    /// Physical distance from `earlier`, zero if `earlier` is later
    pub fn physical_diff(&self, earlier: HybridTime) -> Duration {
        Duration::from_micros(
            self.physical_micros()
                .saturating_sub(earlier.physical_micros()),
        )
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ physical: {} logical: {} }}", self.physical_micros(), self.logical())
    }
}

/// Source of hybrid timestamps
pub trait Clock: Send + Sync {
    /// Current hybrid time; strictly greater than every previous result
    fn now(&self) -> HybridTime;

    /// Move the clock past a hybrid time observed elsewhere
    fn update(&self, observed: HybridTime);
}

/// Wall-clock backed hybrid clock
///
/// `max_clock_skew` is advisory: it is how far ahead of local wall time an
/// observed remote time may be before `update` logs it as suspicious. The
/// clock still advances so ordering is never violated.
pub struct HybridClock {
    last: Mutex<HybridTime>,
    max_clock_skew: Duration,
}

impl HybridClock {
    /// Create a clock with the given skew bound
    pub fn new(max_clock_skew: Duration) -> Self {
        Self {
            last: Mutex::new(HybridTime::MIN),
            max_clock_skew,
        }
    }

    /// Configured skew bound
    pub fn max_clock_skew(&self) -> Duration {
        self.max_clock_skew
    }

    fn wall_micros() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        HybridClock::new(Duration::from_millis(500))
    }
}

impl Clock for HybridClock {
    fn now(&self) -> HybridTime {
        let wall = HybridTime::from_micros(Self::wall_micros());
        let mut last = self.last.lock();
        let next = if wall > *last {
            wall
        } else {
            HybridTime::from_raw(last.raw() + 1)
        };
        *last = next;
        next
    }

    fn update(&self, observed: HybridTime) {
        let mut last = self.last.lock();
        if observed > *last {
            let ahead = observed.physical_micros().saturating_sub(Self::wall_micros());
            if Duration::from_micros(ahead) > self.max_clock_skew {
                tracing::warn!(
                    target: "tabletsnap::clock",
                    observed = %observed,
                    ahead_us = ahead,
                    "Observed hybrid time exceeds max clock skew"
                );
            }
            *last = observed;
        }
    }
}
