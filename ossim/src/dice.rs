//! Random draws behind the worker's decisions.
//!
//! Both decision components take `&mut impl Dice` so tests can pin every
//! branch with scripted rolls while the binary uses a seeded [`StdRng`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of uniform integer draws.
pub trait Dice {
    /// Uniform integer in `[0, 100)`.
    fn percent(&mut self) -> u32;

    /// Uniform integer in `[0, bound)`. Returns 0 when `bound` is 0.
    fn below(&mut self, bound: u32) -> u32;
}

impl<D: Dice + ?Sized> Dice for &mut D {
    fn percent(&mut self) -> u32 {
        (**self).percent()
    }

    fn below(&mut self, bound: u32) -> u32 {
        (**self).below(bound)
    }
}

/// Production dice backed by a seeded [`StdRng`].
#[derive(Debug, Clone)]
pub struct SeededDice {
    rng: StdRng,
}

impl SeededDice {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Seed from the wall clock mixed with the process id, so workers spawned
    /// in the same second still diverge.
    #[must_use]
    pub fn seed_for(pid: i32) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        now ^ u64::from(pid.unsigned_abs())
    }
}

impl Dice for SeededDice {
    fn percent(&mut self) -> u32 {
        self.rng.random_range(0..100)
    }

    fn below(&mut self, bound: u32) -> u32 {
        if bound == 0 {
            return 0;
        }
        self.rng.random_range(0..bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_dice_ranges() {
        let mut dice = SeededDice::new(7);
        for bound in [1, 2, 10, 1000] {
            for _ in 0..1000 {
                assert!(dice.percent() < 100);
                assert!(dice.below(bound) < bound);
            }
        }
        assert_eq!(dice.below(0), 0);
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = SeededDice::new(99);
        let mut b = SeededDice::new(99);
        let xs: Vec<u32> = (0..32).map(|_| a.percent()).collect();
        let ys: Vec<u32> = (0..32).map(|_| b.percent()).collect();
        assert_eq!(xs, ys);
    }
}
