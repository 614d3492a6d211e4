//! Newtype wrappers and type aliases for domain concepts.
//!
//! Newtypes for identifiers (PIDs, CPU IDs, group IDs, arena handles) and
//! virtual time prevent silent type confusion. Type aliases for plain
//! quantities (timestamps) provide self-documenting code without the
//! boilerplate of implementing arithmetic traits.

use std::fmt;
use std::ops::Add;

use serde::{Deserialize, Serialize};

/// Process identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Pid(pub i32);

/// CPU identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct CpuId(pub u32);

/// Task group identifier (a cgroup in kernel terms).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u64);

impl GroupId {
    /// The root group. Every CPU has a root run-queue with no owning entity.
    pub const ROOT: GroupId = GroupId(1);
}

impl Default for GroupId {
    fn default() -> Self {
        Self::ROOT
    }
}

/// Handle into a scheduler's entity arena.
///
/// Handles are only meaningful for the `Scheduler` that issued them; an
/// entity migrated to another CPU receives a new handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntityId(pub(crate) u32);

/// Handle into a scheduler's run-queue arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct RqIdx(pub(crate) u32);

/// Identity of a run-queue across the whole system: the CPU it lives on
/// and the group whose entities it orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId {
    pub cpu: CpuId,
    pub group: GroupId,
}

impl QueueId {
    pub fn root(cpu: CpuId) -> Self {
        Self {
            cpu,
            group: GroupId::ROOT,
        }
    }
}

/// Time in nanoseconds.
pub type TimeNs = u64;

/// Virtual time for fair scheduling (opaque u64, not nanoseconds).
///
/// Ordering uses wrapping comparison (like the kernel's `time_before64`),
/// so `Vtime(u64::MAX)` compares as less than `Vtime(0)` when they are
/// within half the u64 range of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Vtime(pub u64);

impl Vtime {
    /// Signed distance `self - other`, valid while both are within half the
    /// u64 range of each other.
    pub fn delta(self, other: Vtime) -> i64 {
        self.0.wrapping_sub(other.0) as i64
    }

    /// Offset by a signed amount.
    pub fn offset(self, by: i64) -> Vtime {
        Vtime(self.0.wrapping_add(by as u64))
    }

    /// Re-express `self` relative to another time base: preserves the
    /// distance to `from` as distance to `to`.
    pub fn rebase(self, from: Vtime, to: Vtime) -> Vtime {
        Vtime(self.0.wrapping_sub(from.0).wrapping_add(to.0))
    }
}

impl Add<u64> for Vtime {
    type Output = Vtime;

    fn add(self, rhs: u64) -> Vtime {
        Vtime(self.0.wrapping_add(rhs))
    }
}

impl PartialOrd for Vtime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Vtime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Matches kernel time_before64: (s64)(a - b) < 0 means a < b.
        (self.0.wrapping_sub(other.0) as i64).cmp(&0)
    }
}

impl fmt::Display for Vtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::fmt::fmt_grouped(self.0))
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ROOT {
            f.write_str("root")
        } else {
            write!(f, "g{}", self.0)
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "se#{}", self.0)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}/{}", self.cpu, self.group)
    }
}
