//! Behavior builders for common task patterns.

use crate::task::{Phase, RepeatMode, TaskBehavior, TaskDef};
use crate::types::{CpuId, GroupId, Pid, TimeNs};
use crate::weight::SchedPolicy;

/// Runs continuously in `run_ns` chunks, never sleeping.
pub fn cpu_bound(run_ns: TimeNs) -> TaskBehavior {
    TaskBehavior {
        phases: vec![Phase::Run(run_ns)],
        repeat: RepeatMode::Forever,
    }
}

/// Runs for `run_ns` out of every `period_ns`.
///
/// # Panics
/// Panics if `run_ns >= period_ns`.
pub fn periodic(run_ns: TimeNs, period_ns: TimeNs) -> TaskBehavior {
    assert!(
        run_ns < period_ns,
        "run_ns ({run_ns}) must be less than period_ns ({period_ns})"
    );
    TaskBehavior {
        phases: vec![Phase::Run(run_ns), Phase::Sleep(period_ns - run_ns)],
        repeat: RepeatMode::Forever,
    }
}

/// Short bursts separated by long sleeps.
pub fn io_bound(run_ns: TimeNs, sleep_ns: TimeNs) -> TaskBehavior {
    TaskBehavior {
        phases: vec![Phase::Run(run_ns), Phase::Sleep(sleep_ns)],
        repeat: RepeatMode::Forever,
    }
}

/// Two tasks handing work back and forth. `a` starts running; `b` waits
/// to be woken.
pub fn ping_pong(pid_a: Pid, pid_b: Pid, work_ns: TimeNs) -> (TaskBehavior, TaskBehavior) {
    let a = TaskBehavior {
        phases: vec![
            Phase::Run(work_ns),
            Phase::Wake(pid_b),
            Phase::Sleep(TimeNs::MAX),
        ],
        repeat: RepeatMode::Forever,
    };
    let b = TaskBehavior {
        phases: vec![
            Phase::Sleep(TimeNs::MAX),
            Phase::Run(work_ns),
            Phase::Wake(pid_a),
        ],
        repeat: RepeatMode::Forever,
    };
    (a, b)
}

/// `per_level` CPU-bound tasks at each nice level, pids from `first_pid`,
/// spread round-robin over `nr_cpus`.
pub fn flood(nice_levels: &[i32], per_level: u32, nr_cpus: u32, first_pid: Pid) -> Vec<TaskDef> {
    let mut defs = Vec::new();
    let mut pid = first_pid.0;
    for &nice in nice_levels {
        for i in 0..per_level {
            defs.push(TaskDef {
                name: format!("nice{nice}-{i}"),
                pid: Pid(pid),
                nice,
                policy: SchedPolicy::Normal,
                behavior: cpu_bound(100_000_000),
                start_time_ns: 0,
                group: GroupId::ROOT,
                cpu: CpuId(defs.len() as u32 % nr_cpus.max(1)),
            });
            pid += 1;
        }
    }
    defs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flood_layout() {
        let defs = flood(&[0, 5, -5], 2, 2, Pid(10));
        assert_eq!(defs.len(), 6);
        assert_eq!(defs[0].pid, Pid(10));
        assert_eq!(defs[5].pid, Pid(15));
        assert_eq!(defs[2].nice, 5);
        assert_eq!(defs[3].name, "nice5-1");
        let cpus: Vec<u32> = defs.iter().map(|d| d.cpu.0).collect();
        assert_eq!(cpus, vec![0, 1, 0, 1, 0, 1]);
    }

    #[test]
    #[should_panic(expected = "must be less than")]
    fn test_periodic_rejects_full_period() {
        periodic(10, 10);
    }
}
