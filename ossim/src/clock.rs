//! Simulated clock: the shared-memory layout, point-in-time snapshots and
//! termination-time arithmetic.
//!
//! The orchestrator is the only writer. Workers read both fields with
//! independent relaxed loads and no sequence lock, so a snapshot taken while
//! the orchestrator carries nanoseconds into seconds can be torn (new
//! seconds with old nanoseconds or the reverse). The simulation accepts that
//! approximation; a versioned snapshot would have to be introduced on the
//! orchestrator side.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::ipc::shmem::{SharedMemorySafe, Shm, ShmMode};

/// Nanoseconds in one simulated second.
pub const NANOS_PER_SEC: u32 = 1_000_000_000;

/// Shared-memory layout of the orchestrator's clock.
///
/// Matches `struct { unsigned int seconds; unsigned int nanoseconds; }`.
#[derive(Debug, Default)]
#[repr(C)]
pub struct SimClock {
    seconds: AtomicU32,
    nanoseconds: AtomicU32,
}

// SAFETY: SimClock is repr(C) with two AtomicU32 fields, both
// SharedMemorySafe; it holds no pointers.
unsafe impl SharedMemorySafe for SimClock {}

impl SimClock {
    /// Best-effort read of both fields. May be torn, see the module docs.
    #[must_use]
    pub fn snapshot(&self) -> ClockSnapshot {
        let seconds = self.seconds.load(Ordering::Relaxed);
        let nanoseconds = self.nanoseconds.load(Ordering::Relaxed);
        ClockSnapshot::new(seconds, nanoseconds)
    }

    /// Publishes a new time. Only the clock owner calls this.
    pub fn publish(&self, now: ClockSnapshot) {
        self.seconds.store(now.seconds, Ordering::Relaxed);
        self.nanoseconds.store(now.nanoseconds, Ordering::Relaxed);
    }
}

/// A point on the simulated clock.
///
/// Field order makes the derived `Ord` lexicographic: seconds first, then
/// nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockSnapshot {
    seconds: u32,
    nanoseconds: u32,
}

impl ClockSnapshot {
    /// Builds a snapshot, carrying whole seconds out of `nanoseconds`.
    #[must_use]
    pub const fn new(seconds: u32, nanoseconds: u32) -> Self {
        let carry = nanoseconds / NANOS_PER_SEC;
        Self {
            seconds: seconds.saturating_add(carry),
            nanoseconds: nanoseconds % NANOS_PER_SEC,
        }
    }

    #[must_use]
    pub const fn seconds(&self) -> u32 {
        self.seconds
    }

    #[must_use]
    pub const fn nanoseconds(&self) -> u32 {
        self.nanoseconds
    }

    /// `self + interval`, normalized so nanoseconds stay below one second.
    ///
    /// Seconds saturate at `u32::MAX`.
    #[must_use]
    pub fn advanced_by(self, interval: BurstInterval) -> Self {
        let nanos = u64::from(self.nanoseconds) + u64::from(interval.nanoseconds);
        let carry = nanos / u64::from(NANOS_PER_SEC);
        let seconds = u64::from(self.seconds) + u64::from(interval.seconds) + carry;

        Self {
            seconds: u32::try_from(seconds).unwrap_or(u32::MAX),
            nanoseconds: (nanos % u64::from(NANOS_PER_SEC)) as u32,
        }
    }

    /// Whether this instant is at or past `deadline`.
    #[must_use]
    pub fn has_reached(&self, deadline: ClockSnapshot) -> bool {
        *self >= deadline
    }
}

/// How long a worker may run: both its wall-clock budget on the simulated
/// clock and, in total nanoseconds, its CPU burst limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstInterval {
    seconds: u32,
    nanoseconds: u32,
}

impl BurstInterval {
    /// `nanoseconds` may exceed one second; the excess is carried when the
    /// interval is added to a snapshot.
    #[must_use]
    pub const fn new(seconds: u32, nanoseconds: u32) -> Self {
        Self {
            seconds,
            nanoseconds,
        }
    }

    #[must_use]
    pub const fn seconds(&self) -> u32 {
        self.seconds
    }

    #[must_use]
    pub const fn nanoseconds(&self) -> u32 {
        self.nanoseconds
    }

    /// Total length in nanoseconds.
    #[must_use]
    pub const fn total_nanos(&self) -> u64 {
        self.seconds as u64 * NANOS_PER_SEC as u64 + self.nanoseconds as u64
    }

    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.seconds == 0 && self.nanoseconds == 0
    }
}

/// Anything the worker can read the current simulated time from.
pub trait ClockSource {
    fn now(&self) -> ClockSnapshot;
}

impl<M: ShmMode> ClockSource for Shm<SimClock, M> {
    fn now(&self) -> ClockSnapshot {
        self.snapshot()
    }
}

impl ClockSource for SimClock {
    fn now(&self) -> ClockSnapshot {
        self.snapshot()
    }
}

impl<C: ClockSource + ?Sized> ClockSource for &C {
    fn now(&self) -> ClockSnapshot {
        (**self).now()
    }
}
