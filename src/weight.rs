//! Load weights and real-to-virtual time scaling.
//!
//! A weight expresses an entity's share of its run-queue relative to the
//! reference weight [`NICE_0_LOAD`]. Virtual time advances at
//! `real * NICE_0_LOAD / weight`; the division is replaced by a multiply
//! with a precomputed 32-bit fixed-point reciprocal, as the kernel does in
//! `__calc_delta()`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedError};
use crate::types::TimeNs;

/// Weight of a nice-0 task; virtual time runs at wall-clock rate for it.
pub const NICE_0_LOAD: u64 = 1024;

pub const MIN_NICE: i32 = -20;
pub const MAX_NICE: i32 = 19;

/// Weight of `SCHED_IDLE` tasks, regardless of nice.
pub const WEIGHT_IDLEPRIO: u64 = 3;

const WMULT_CONST: u64 = u32::MAX as u64;
const WMULT_SHIFT: u32 = 32;

/// Kernel `sched_prio_to_weight[]`: each nice step is roughly a 10% change
/// in CPU share relative to a competing task.
const SCHED_PRIO_TO_WEIGHT: [u32; 40] = [
    /* -20 */ 88761, 71755, 56483, 46273, 36291, /* -15 */ 29154, 23254, 18705, 14949,
    11916, /* -10 */ 9548, 7620, 6100, 4904, 3906, /*  -5 */ 3121, 2501, 1991, 1586,
    1277, /*   0 */ 1024, 820, 655, 526, 423, /*   5 */ 335, 272, 215, 172, 137,
    /*  10 */ 110, 87, 70, 56, 45, /*  15 */ 36, 29, 23, 18, 15,
];

/// Cgroup weight constants from include/linux/cgroup.h.
const CGROUP_WEIGHT_MIN: u32 = 1;
const CGROUP_WEIGHT_DFL: u32 = 100;
const CGROUP_WEIGHT_MAX: u32 = 10000;

pub fn is_valid_nice(nice: i32) -> bool {
    (MIN_NICE..=MAX_NICE).contains(&nice)
}

/// Convert a nice value (-20..=19) to a kernel scheduler weight.
pub fn nice_to_weight(nice: i32) -> Result<u64> {
    if !is_valid_nice(nice) {
        return Err(SchedError::InvalidPriority(nice));
    }
    Ok(SCHED_PRIO_TO_WEIGHT[(nice - MIN_NICE) as usize] as u64)
}

/// Convert a cgroup `cpu.weight` value [1..10000] to a load weight.
///
/// Inverse of the kernel's `sched_weight_to_cgroup()`: the default
/// `cpu.weight` of 100 maps to [`NICE_0_LOAD`].
pub fn cgroup_weight_to_load(cpu_weight: u32) -> LoadWeight {
    let cg = cpu_weight.clamp(CGROUP_WEIGHT_MIN, CGROUP_WEIGHT_MAX) as u64;
    LoadWeight::new((cg * NICE_0_LOAD + CGROUP_WEIGHT_DFL as u64 / 2) / CGROUP_WEIGHT_DFL as u64)
}

/// Scheduling policies served by the fair class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// `SCHED_OTHER`.
    #[default]
    Normal,
    /// `SCHED_BATCH`: normal weight, never preempts on wakeup.
    Batch,
    /// `SCHED_IDLE`: minimal weight, never preempts on wakeup.
    Idle,
}

impl SchedPolicy {
    /// Whether a newly woken task of this policy may preempt the running one.
    pub fn wakeup_preempts(self) -> bool {
        self == SchedPolicy::Normal
    }
}

impl fmt::Display for SchedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SchedPolicy::Normal => "SCHED_OTHER",
            SchedPolicy::Batch => "SCHED_BATCH",
            SchedPolicy::Idle => "SCHED_IDLE",
        })
    }
}

impl FromStr for SchedPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" | "other" | "sched_other" => Ok(SchedPolicy::Normal),
            "batch" | "sched_batch" => Ok(SchedPolicy::Batch),
            "idle" | "sched_idle" => Ok(SchedPolicy::Idle),
            _ => Err(format!("unknown scheduling policy {s:?}")),
        }
    }
}

/// Weight and its fixed-point reciprocal, kept together so scaling never
/// divides on the hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadWeight {
    pub weight: u64,
    /// `u32::MAX / weight`, so `weight * inv_weight ≈ 2^32`.
    pub inv_weight: u32,
}

impl Default for LoadWeight {
    fn default() -> Self {
        Self::new(NICE_0_LOAD)
    }
}

impl LoadWeight {
    /// Arbitrary weight. Zero is clamped to 1 so scaling stays defined.
    pub fn new(weight: u64) -> Self {
        let weight = weight.max(1);
        let inv_weight = (WMULT_CONST / weight).max(1) as u32;
        Self { weight, inv_weight }
    }

    pub fn from_priority(nice: i32) -> Result<Self> {
        nice_to_weight(nice).map(Self::new)
    }

    pub fn for_policy(policy: SchedPolicy, nice: i32) -> Result<Self> {
        let weight = nice_to_weight(nice)?;
        Ok(match policy {
            SchedPolicy::Idle => Self::new(WEIGHT_IDLEPRIO),
            SchedPolicy::Normal | SchedPolicy::Batch => Self::new(weight),
        })
    }

    /// Convert a real-time delta to a virtual-time delta:
    /// `delta * NICE_0_LOAD / weight`.
    ///
    /// Nice-0 entities take the exact fast path. Everything else multiplies
    /// by the reciprocal in 128 bits, so the result saturates instead of
    /// overflowing for absurd deltas.
    pub fn scale_runtime(&self, delta: TimeNs) -> u64 {
        self.scale_by(delta, NICE_0_LOAD)
    }

    /// `delta * factor / weight` using the reciprocal.
    pub fn scale_by(&self, delta: u64, factor: u64) -> u64 {
        if self.weight == factor {
            return delta;
        }
        let wide = (delta as u128 * factor as u128 * self.inv_weight as u128) >> WMULT_SHIFT;
        u64::try_from(wide).unwrap_or(u64::MAX)
    }
}
