//! CPU burst accounting.
//!
//! Each granted quantum is classified as blocked, fully used, or the
//! worker's last. Consumption is tracked in simulated nanoseconds against a
//! fixed burst limit that can never be exceeded.

use crate::dice::Dice;
use crate::protocol::CycleStatus;

/// Rolls below this block the worker partway through the quantum.
pub const BLOCK_PERCENT: u32 = 10;

/// Rolls below this (and at or above [`BLOCK_PERCENT`]) use the full quantum;
/// the remainder terminate voluntarily.
pub const FULL_USE_PERCENT: u32 = 80;

/// Classification of one scheduling cycle, with the nanoseconds it consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The quantum would reach the burst limit; only the remainder was used.
    Terminated { consumed: u32 },
    /// Blocked on an event partway through the quantum.
    Blocked { consumed: u32 },
    /// Ran for the whole quantum.
    FullUse { consumed: u32 },
    /// Chose to exit partway through the quantum.
    VoluntaryExit { consumed: u32 },
}

impl Outcome {
    #[must_use]
    pub fn consumed(&self) -> u32 {
        match *self {
            Outcome::Terminated { consumed }
            | Outcome::Blocked { consumed }
            | Outcome::FullUse { consumed }
            | Outcome::VoluntaryExit { consumed } => consumed,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Outcome::Terminated { .. } | Outcome::VoluntaryExit { .. })
    }

    #[must_use]
    pub fn status(&self) -> CycleStatus {
        match self {
            Outcome::Terminated { .. } | Outcome::VoluntaryExit { .. } => CycleStatus::Terminating,
            Outcome::Blocked { .. } => CycleStatus::Blocked,
            Outcome::FullUse { .. } => CycleStatus::UsedFullQuantum,
        }
    }

    /// Amount as reported to the orchestrator: negated when terminating.
    #[must_use]
    pub fn reported(&self) -> i32 {
        // consumed never exceeds a quantum decoded from an i32
        let amount = i32::try_from(self.consumed()).unwrap_or(i32::MAX);
        if self.is_terminal() { -amount } else { amount }
    }
}

/// Tracks simulated CPU consumption against the burst limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurstAccountant {
    consumed: u64,
    limit: u64,
    terminated: bool,
}

impl BurstAccountant {
    /// `limit` is in nanoseconds and should be positive.
    #[must_use]
    pub fn new(limit: u64) -> Self {
        debug_assert!(limit > 0, "burst limit must be positive");
        Self {
            consumed: 0,
            limit,
            terminated: false,
        }
    }

    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.limit - self.consumed
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Accounts one granted quantum.
    ///
    /// A quantum that would reach the limit terminates deterministically.
    /// Otherwise a percent roll picks blocked, full use or voluntary exit.
    /// After termination every call reports a zero-length terminal cycle.
    pub fn consume_quantum<D: Dice + ?Sized>(&mut self, quantum: u32, dice: &mut D) -> Outcome {
        if self.terminated {
            return Outcome::Terminated { consumed: 0 };
        }

        if self.consumed + u64::from(quantum) >= self.limit {
            // remaining < quantum here, so it fits in u32
            let consumed = self.remaining() as u32;
            self.charge(consumed);
            self.terminated = true;
            return Outcome::Terminated { consumed };
        }

        let roll = dice.percent();
        let outcome = if roll < BLOCK_PERCENT {
            Outcome::Blocked {
                consumed: dice.below(quantum),
            }
        } else if roll < FULL_USE_PERCENT {
            Outcome::FullUse { consumed: quantum }
        } else {
            Outcome::VoluntaryExit {
                consumed: dice.below(quantum),
            }
        };

        self.charge(outcome.consumed());
        if outcome.is_terminal() {
            self.terminated = true;
        }
        outcome
    }

    fn charge(&mut self, amount: u32) {
        self.consumed += u64::from(amount);
        debug_assert!(self.consumed <= self.limit);
    }
}
