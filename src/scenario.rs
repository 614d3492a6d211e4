//! Scenario definition and builder API.

use crate::config::SchedConfig;
use crate::task::{TaskBehavior, TaskDef};
use crate::types::{CpuId, GroupId, Pid, QueueId, TimeNs};
use crate::weight::SchedPolicy;

/// A task group created on every CPU before the simulation starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDef {
    pub id: GroupId,
    pub parent: GroupId,
    /// cgroup `cpu.weight`, 100 by default.
    pub cpu_weight: u32,
}

/// An explicit migration request issued at a fixed time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationDef {
    pub at_ns: TimeNs,
    pub pid: Pid,
    pub to: QueueId,
}

/// A complete simulation scenario: CPUs, groups, tasks, and duration.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub nr_cpus: u32,
    pub groups: Vec<GroupDef>,
    pub tasks: Vec<TaskDef>,
    pub migrations: Vec<MigrationDef>,
    pub config: SchedConfig,
    pub duration_ns: TimeNs,
}

pub struct ScenarioBuilder {
    nr_cpus: u32,
    groups: Vec<GroupDef>,
    tasks: Vec<TaskDef>,
    migrations: Vec<MigrationDef>,
    config: SchedConfig,
    duration_ns: TimeNs,
    next_pid: Pid,
}

impl Scenario {
    pub fn builder() -> ScenarioBuilder {
        ScenarioBuilder {
            nr_cpus: 1,
            groups: Vec::new(),
            tasks: Vec::new(),
            migrations: Vec::new(),
            config: SchedConfig::default(),
            duration_ns: 100_000_000,
            next_pid: Pid(1),
        }
    }
}

impl ScenarioBuilder {
    pub fn cpus(mut self, n: u32) -> Self {
        self.nr_cpus = n;
        self
    }

    pub fn config(mut self, config: SchedConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a group under `parent` with the given cgroup `cpu.weight`.
    pub fn group(mut self, id: GroupId, parent: GroupId, cpu_weight: u32) -> Self {
        self.groups.push(GroupDef {
            id,
            parent,
            cpu_weight,
        });
        self
    }

    /// Add a task with a full definition.
    pub fn task(mut self, def: TaskDef) -> Self {
        self.next_pid = Pid(self.next_pid.0.max(def.pid.0 + 1));
        self.tasks.push(def);
        self
    }

    /// Add a normal-policy task on CPU 0 in the root group, with the next
    /// free pid.
    pub fn add_task(self, name: &str, nice: i32, behavior: TaskBehavior) -> Self {
        let pid = self.next_pid;
        self.task(TaskDef {
            name: name.to_string(),
            pid,
            nice,
            policy: SchedPolicy::Normal,
            behavior,
            start_time_ns: 0,
            group: GroupId::ROOT,
            cpu: CpuId(0),
        })
    }

    /// Move `pid` to `to` at time `at_ns`.
    pub fn migrate_at(mut self, at_ns: TimeNs, pid: Pid, to: QueueId) -> Self {
        self.migrations.push(MigrationDef { at_ns, pid, to });
        self
    }

    pub fn duration_ns(mut self, ns: TimeNs) -> Self {
        self.duration_ns = ns;
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ns = ms * 1_000_000;
        self
    }

    pub fn build(self) -> Scenario {
        assert!(
            !self.tasks.is_empty(),
            "scenario must have at least one task"
        );
        assert!(self.nr_cpus > 0, "scenario must have at least one CPU");
        Scenario {
            nr_cpus: self.nr_cpus,
            groups: self.groups,
            tasks: self.tasks,
            migrations: self.migrations,
            config: self.config,
            duration_ns: self.duration_ns,
        }
    }
}

/// Parse a human-readable duration into nanoseconds.
///
/// Accepts `s`, `ms`, `us` and `ns` suffixes and fractional values
/// (`"1.5ms"`). A bare number is nanoseconds.
pub fn parse_duration_ns(s: &str) -> Result<TimeNs, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".into());
    }

    // Longest suffix first: "ms" before "s".
    let (num_str, multiplier) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1_000_000.0)
    } else if let Some(n) = s.strip_suffix("us") {
        (n, 1_000.0)
    } else if let Some(n) = s.strip_suffix("ns") {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000_000_000.0)
    } else {
        (s, 1.0)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration number: {num_str:?}"))?;
    if num < 0.0 {
        return Err(format!("duration must be non-negative: {s:?}"));
    }
    let ns = num * multiplier;
    if ns > u64::MAX as f64 {
        return Err(format!("duration overflow: {s:?}"));
    }
    Ok(ns as TimeNs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workloads;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_ns("1s").unwrap(), 1_000_000_000);
        assert_eq!(parse_duration_ns("2.5s").unwrap(), 2_500_000_000);
        assert_eq!(parse_duration_ns("500ms").unwrap(), 500_000_000);
        assert_eq!(parse_duration_ns("0.5ms").unwrap(), 500_000);
        assert_eq!(parse_duration_ns("100us").unwrap(), 100_000);
        assert_eq!(parse_duration_ns("1000ns").unwrap(), 1_000);
        assert_eq!(parse_duration_ns(" 42 ").unwrap(), 42);
    }

    #[test]
    fn test_parse_duration_errors() {
        assert!(parse_duration_ns("").is_err());
        assert!(parse_duration_ns("abc").is_err());
        assert!(parse_duration_ns("-1ms").is_err());
        assert!(parse_duration_ns("ms").is_err());
    }

    #[test]
    fn test_builder_assigns_pids() {
        let scenario = Scenario::builder()
            .cpus(2)
            .add_task("a", 0, workloads::cpu_bound(1_000_000))
            .add_task("b", 5, workloads::cpu_bound(1_000_000))
            .group(GroupId(2), GroupId::ROOT, 200)
            .duration_ms(10)
            .build();
        assert_eq!(scenario.nr_cpus, 2);
        assert_eq!(scenario.tasks[0].pid, Pid(1));
        assert_eq!(scenario.tasks[1].pid, Pid(2));
        assert_eq!(scenario.tasks[1].nice, 5);
        assert_eq!(scenario.groups[0].cpu_weight, 200);
        assert_eq!(scenario.duration_ns, 10_000_000);
    }

    #[test]
    #[should_panic(expected = "at least one task")]
    fn test_builder_requires_task() {
        Scenario::builder().build();
    }
}
