//! Scripted tasks for the simulator.

use serde::{Deserialize, Serialize};

use crate::types::{CpuId, GroupId, Pid, TimeNs};
use crate::weight::SchedPolicy;

/// Simulator-side view of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Defined but not yet started.
    New,
    Sleeping,
    /// Runnable but not executing.
    Runnable,
    Running,
    /// Finished its phases and left the scheduler.
    Exited,
}

/// One step of a task's script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Consume this much CPU time.
    Run(TimeNs),
    /// Block for this long. `u64::MAX` suspends until another task wakes it.
    Sleep(TimeNs),
    /// Wake another task, taking no time.
    Wake(Pid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    Once,
    Count(u32),
    Forever,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBehavior {
    pub phases: Vec<Phase>,
    pub repeat: RepeatMode,
}

/// A task in a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    pub name: String,
    pub pid: Pid,
    pub nice: i32,
    #[serde(default)]
    pub policy: SchedPolicy,
    pub behavior: TaskBehavior,
    /// When the task first becomes runnable.
    #[serde(default)]
    pub start_time_ns: TimeNs,
    #[serde(default)]
    pub group: GroupId,
    #[serde(default)]
    pub cpu: CpuId,
}

/// A task while the simulation runs.
#[derive(Debug)]
pub(crate) struct SimTask {
    pub name: String,
    pub behavior: TaskBehavior,
    pub phase_idx: usize,
    pub iteration: u32,
    /// Time left in the current `Run` phase.
    pub run_remaining_ns: TimeNs,
    pub state: TaskState,
    pub cpu: CpuId,
    /// Bumped on every sleep so that a timed wake-up left over from an
    /// earlier sleep is recognized as stale.
    pub sleep_gen: u64,
}

impl SimTask {
    pub fn new(def: &TaskDef) -> Self {
        Self {
            name: def.name.clone(),
            behavior: def.behavior.clone(),
            phase_idx: 0,
            iteration: 0,
            run_remaining_ns: 0,
            state: TaskState::New,
            cpu: def.cpu,
            sleep_gen: 0,
        }
    }

    pub fn current_phase(&self) -> Option<&Phase> {
        self.behavior.phases.get(self.phase_idx)
    }

    /// Step to the next phase, wrapping per the repeat mode. Returns false
    /// once the script is exhausted.
    pub fn advance_phase(&mut self) -> bool {
        self.phase_idx += 1;
        if self.phase_idx >= self.behavior.phases.len() {
            match self.behavior.repeat {
                RepeatMode::Once => return false,
                RepeatMode::Forever => {}
                RepeatMode::Count(n) => {
                    self.iteration += 1;
                    if self.iteration >= n {
                        return false;
                    }
                }
            }
            self.phase_idx = 0;
        }
        true
    }
}
