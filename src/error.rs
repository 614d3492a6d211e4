//! Errors reported to callers of the scheduler core.
//!
//! Every variant is a contract violation detected before any state is
//! mutated: the entity, queue and group tables are unchanged when an
//! operation returns `Err`. Time accounting never produces errors.

use thiserror::Error;

use crate::types::{CpuId, EntityId, GroupId, Pid};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedError {
    #[error("invalid priority {0}, nice must be within -20..=19")]
    InvalidPriority(i32),

    #[error("cannot migrate between scheduling hierarchies {from} and {to}")]
    CrossHierarchyMigration { from: u64, to: u64 },

    #[error("{0} is already on a run-queue")]
    DoubleEnqueue(EntityId),

    #[error("{0} is not on a run-queue")]
    DequeueNotEnqueued(EntityId),

    #[error("task {0} is still runnable")]
    TaskRunnable(Pid),

    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown task {0}")]
    UnknownTask(Pid),

    #[error("task {0} already exists")]
    DuplicateTask(Pid),

    #[error("unknown group {0}")]
    UnknownGroup(GroupId),

    #[error("group {0} already exists")]
    DuplicateGroup(GroupId),

    #[error("group {0} still has tasks or child groups")]
    GroupNotEmpty(GroupId),

    #[error("unknown cpu {0}")]
    UnknownCpu(CpuId),
}

pub type Result<T, E = SchedError> = std::result::Result<T, E>;
