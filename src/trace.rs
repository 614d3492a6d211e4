//! Trace event recording for the simulator.
//!
//! Every scheduling action (task scheduled, preempted, slept, woke,
//! migrated, CPU idle) is recorded with its simulated timestamp and CPU.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::entity::EntitySnapshot;
use crate::fmt::FmtTs;
use crate::types::{CpuId, Pid, TimeNs};

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub time_ns: TimeNs,
    pub cpu: CpuId,
    pub kind: TraceKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TraceKind {
    TaskScheduled { pid: Pid },
    /// Switched out while still runnable.
    TaskPreempted { pid: Pid },
    TaskSlept { pid: Pid },
    TaskWoke { pid: Pid },
    /// Finished its script and left the scheduler.
    TaskCompleted { pid: Pid },
    /// Moved to another CPU; `cpu` of the event is the source.
    TaskMigrated { pid: Pid, to: CpuId },
    CpuIdle,
    /// End of the simulated interval; closes every running interval.
    SimulationEnd,
}

/// All events of a run in chronological order, plus the final scheduling
/// statistics of every task still known to a CPU.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Trace {
    events: Vec<TraceEvent>,
    snapshots: BTreeMap<Pid, EntitySnapshot>,
}

impl Trace {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, time_ns: TimeNs, cpu: CpuId, kind: TraceKind) {
        self.events.push(TraceEvent { time_ns, cpu, kind });
    }

    pub(crate) fn add_snapshot(&mut self, snapshot: EntitySnapshot) {
        if let Some(pid) = snapshot.pid {
            self.snapshots.insert(pid, snapshot);
        }
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Final statistics of `pid`, if it had not exited.
    pub fn snapshot(&self, pid: Pid) -> Option<&EntitySnapshot> {
        self.snapshots.get(&pid)
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &EntitySnapshot> {
        self.snapshots.values()
    }

    /// Total time `pid` spent running: from each `TaskScheduled` to the
    /// next event that takes it off the CPU.
    pub fn total_runtime(&self, pid: Pid) -> TimeNs {
        let mut total: TimeNs = 0;
        let mut running_since: Option<TimeNs> = None;

        for event in &self.events {
            match &event.kind {
                TraceKind::TaskScheduled { pid: p } if *p == pid => {
                    running_since = Some(event.time_ns);
                }
                TraceKind::TaskPreempted { pid: p }
                | TraceKind::TaskSlept { pid: p }
                | TraceKind::TaskCompleted { pid: p }
                | TraceKind::TaskMigrated { pid: p, .. }
                    if *p == pid =>
                {
                    if let Some(start) = running_since.take() {
                        total += event.time_ns - start;
                    }
                }
                TraceKind::SimulationEnd => {
                    if let Some(start) = running_since.take() {
                        total += event.time_ns - start;
                    }
                }
                _ => {}
            }
        }
        total
    }

    pub fn schedule_count(&self, pid: Pid) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.kind, TraceKind::TaskScheduled { pid: p } if p == pid))
            .count()
    }

    pub fn preempt_count(&self, pid: Pid) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.kind, TraceKind::TaskPreempted { pid: p } if p == pid))
            .count()
    }

    pub fn idle_count(&self, cpu: CpuId) -> usize {
        self.events
            .iter()
            .filter(|e| e.cpu == cpu && matches!(e.kind, TraceKind::CpuIdle))
            .count()
    }

    /// Pids in the order they were scheduled on `cpu`.
    pub fn schedule_order(&self, cpu: CpuId) -> Vec<Pid> {
        self.events
            .iter()
            .filter(|e| e.cpu == cpu)
            .filter_map(|e| match e.kind {
                TraceKind::TaskScheduled { pid } => Some(pid),
                _ => None,
            })
            .collect()
    }

    /// Pretty-print the trace to stderr.
    pub fn dump(&self) {
        for event in &self.events {
            let desc = match &event.kind {
                TraceKind::TaskScheduled { pid } => format!("SCHED    pid={pid}"),
                TraceKind::TaskPreempted { pid } => format!("PREEMPT  pid={pid}"),
                TraceKind::TaskSlept { pid } => format!("SLEEP    pid={pid}"),
                TraceKind::TaskWoke { pid } => format!("WAKE     pid={pid}"),
                TraceKind::TaskCompleted { pid } => format!("COMPLETE pid={pid}"),
                TraceKind::TaskMigrated { pid, to } => format!("MIGRATE  pid={pid} to={to}"),
                TraceKind::CpuIdle => "IDLE".to_string(),
                TraceKind::SimulationEnd => "END".to_string(),
            };
            eprintln!("[{}] {}", FmtTs::new(event.time_ns, Some(event.cpu)), desc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_runtime_closes_intervals() {
        let mut trace = Trace::new();
        let cpu = CpuId(0);
        trace.record(0, cpu, TraceKind::TaskScheduled { pid: Pid(1) });
        trace.record(3, cpu, TraceKind::TaskPreempted { pid: Pid(1) });
        trace.record(3, cpu, TraceKind::TaskScheduled { pid: Pid(2) });
        trace.record(5, cpu, TraceKind::TaskMigrated { pid: Pid(2), to: CpuId(1) });
        trace.record(5, cpu, TraceKind::TaskScheduled { pid: Pid(1) });
        trace.record(9, cpu, TraceKind::SimulationEnd);

        assert_eq!(trace.total_runtime(Pid(1)), 3 + 4);
        assert_eq!(trace.total_runtime(Pid(2)), 2);
        assert_eq!(trace.schedule_count(Pid(1)), 2);
        assert_eq!(trace.preempt_count(Pid(1)), 1);
        assert_eq!(trace.schedule_order(cpu), vec![Pid(1), Pid(2), Pid(1)]);
    }
}
