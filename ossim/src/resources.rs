//! Resource negotiation with hierarchical class ordering.
//!
//! A worker may ask for more instances of class `r` only while it holds at
//! least one instance of every class below `r`. Every worker therefore
//! acquires in increasing class order, which rules out circular wait.

use std::fmt;

use crate::dice::Dice;
use crate::trace::warn;

/// Number of resource classes managed by the orchestrator.
pub const RESOURCE_CLASSES: usize = 10;

/// Instances of each class in the system, and so the most a worker can hold.
pub const INSTANCES_PER_RESOURCE: u32 = 5;

/// Percent of cycles that attempt a request; the rest attempt a release.
pub const REQUEST_PERCENT: u32 = 60;

/// Instances of each class currently held by this worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeldResources([u32; RESOURCE_CLASSES]);

impl HeldResources {
    #[must_use]
    pub const fn new(held: [u32; RESOURCE_CLASSES]) -> Self {
        Self(held)
    }

    #[must_use]
    pub fn get(&self, class: usize) -> u32 {
        self.0[class]
    }

    #[must_use]
    pub fn as_array(&self) -> &[u32; RESOURCE_CLASSES] {
        &self.0
    }

    /// Further instances of `class` this worker could still hold.
    #[must_use]
    pub fn room(&self, class: usize) -> u32 {
        INSTANCES_PER_RESOURCE.saturating_sub(self.0[class])
    }

    /// Ordering check: every class below `class` is held at least once.
    #[must_use]
    pub fn can_request(&self, class: usize) -> bool {
        self.0[..class].iter().all(|&held| held >= 1)
    }

    #[must_use]
    pub fn total(&self) -> u32 {
        self.0.iter().sum()
    }

    /// Applies a granted delta.
    ///
    /// Results are clamped into `[0, INSTANCES_PER_RESOURCE]`. Neither bound
    /// is reachable while the orchestrator enforces the same invariants.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub fn apply(&mut self, delta: &ResourceDelta) {
        for (class, (held, change)) in self.0.iter_mut().zip(delta.0).enumerate() {
            let next = i64::from(*held) + i64::from(change);
            let clamped = next.clamp(0, i64::from(INSTANCES_PER_RESOURCE));
            if clamped != next {
                warn!(class, held = *held, change, "granted delta left resource bounds, clamping");
            }
            *held = clamped as u32;
        }
    }
}

impl fmt::Display for HeldResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// A proposed change to the held resources: `+n` requests `n` instances,
/// `-n` releases `n`. At most one class is non-zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceDelta([i32; RESOURCE_CLASSES]);

/// What a [`ResourceDelta`] asks the orchestrator for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    None,
    Request { class: usize, amount: u32 },
    Release { class: usize, amount: u32 },
}

impl ResourceDelta {
    /// The empty proposal.
    #[must_use]
    pub const fn none() -> Self {
        Self([0; RESOURCE_CLASSES])
    }

    #[must_use]
    pub fn request(class: usize, amount: u32) -> Self {
        let mut delta = Self::none();
        delta.0[class] = amount as i32;
        delta
    }

    #[must_use]
    pub fn release(class: usize, amount: u32) -> Self {
        let mut delta = Self::none();
        delta.0[class] = -(amount as i32);
        delta
    }

    /// Wraps a raw vector as received on the wire; not validated.
    #[must_use]
    pub const fn from_array(raw: [i32; RESOURCE_CLASSES]) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_array(&self) -> &[i32; RESOURCE_CLASSES] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&v| v == 0)
    }

    /// Interprets the first non-zero entry.
    #[must_use]
    pub fn kind(&self) -> DeltaKind {
        match self.0.iter().position(|&v| v != 0) {
            None => DeltaKind::None,
            Some(class) if self.0[class] > 0 => DeltaKind::Request {
                class,
                amount: self.0[class].unsigned_abs(),
            },
            Some(class) => DeltaKind::Release {
                class,
                amount: self.0[class].unsigned_abs(),
            },
        }
    }
}

/// Decides this cycle's request or release.
///
/// - `[0, 60)`: request between 1 and `room` instances of a random class,
///   provided the class has room and the ordering check passes
/// - `[60, 100)`: release between 1 and all held instances of a random class
///
/// Any failed precondition yields [`ResourceDelta::none`], which is still
/// sent to the orchestrator as a no-op request.
pub fn propose<D: Dice + ?Sized>(held: &HeldResources, dice: &mut D) -> ResourceDelta {
    let roll = dice.percent();
    let class = dice.below(RESOURCE_CLASSES as u32) as usize;

    if roll < REQUEST_PERCENT {
        let room = held.room(class);
        if room == 0 || !held.can_request(class) {
            return ResourceDelta::none();
        }
        ResourceDelta::request(class, 1 + dice.below(room))
    } else {
        let current = held.get(class);
        if current == 0 {
            return ResourceDelta::none();
        }
        ResourceDelta::release(class, 1 + dice.below(current))
    }
}
