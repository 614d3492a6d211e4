//! Event-driven simulation engine.
//!
//! The engine owns a [`System`], a scripted [`SimTask`] per pid and an
//! event queue ordered by simulated time. Each event is turned into calls
//! on the CPU's [`Scheduler`](crate::Scheduler); whatever task the
//! scheduler reports as current afterwards is what the CPU executes.
//!
//! All CPUs share one global clock. Every CPU receives a periodic tick
//! every `tick_ns`; a running task additionally gets an event for the
//! moment its current `Run` phase would complete.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use tracing::{debug, info, warn};

use crate::error::{Result, SchedError};
use crate::fmt::{set_sim_clock, FmtN};
use crate::scenario::Scenario;
use crate::system::System;
use crate::task::{Phase, SimTask, TaskState};
use crate::trace::{Trace, TraceKind};
use crate::types::{CpuId, Pid, QueueId, TimeNs};
use crate::weight::cgroup_weight_to_load;

/// Events are ordered and compared by `(time_ns, seq)` alone.
#[derive(Debug, Clone)]
struct Event {
    time_ns: TimeNs,
    /// Tiebreaker for events at the same time (lower first).
    seq: u64,
    kind: EventKind,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        (self.time_ns, self.seq) == (other.time_ns, other.seq)
    }
}

impl Eq for Event {}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time_ns
            .cmp(&other.time_ns)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EventKind {
    /// Timed wake-up at the end of a sleep. `gen` must match the task's
    /// `sleep_gen` for the wake to apply.
    TaskWake { pid: Pid, gen: u64 },
    Tick { cpu: CpuId },
    /// The running task's `Run` phase completes. Stale unless `gen`
    /// matches the CPU's generation.
    RunDone { cpu: CpuId, gen: u64 },
    Migrate { pid: Pid, to: QueueId },
}

/// What a task does after its script was advanced.
enum Step {
    Run,
    Sleep(TimeNs),
    Exit,
}

#[derive(Debug, Default)]
struct CpuSlot {
    running: Option<Pid>,
    /// When `running` was last charged.
    since: TimeNs,
    gen: u64,
}

pub struct Simulator {
    scenario: Scenario,
}

impl Simulator {
    pub fn new(scenario: Scenario) -> Self {
        Self { scenario }
    }

    /// Run the scenario to completion and return its trace.
    ///
    /// Fails if the scenario is inconsistent: a configuration that
    /// [`SchedConfig::validate`](crate::SchedConfig::validate) rejects, an
    /// invalid nice level, a task on a CPU or in a group that does not exist,
    /// a duplicate pid.
    pub fn run(&self) -> Result<Trace> {
        let mut engine = Engine::new(&self.scenario)?;
        info!(
            cpus = self.scenario.nr_cpus,
            tasks = self.scenario.tasks.len(),
            duration = %FmtN(self.scenario.duration_ns),
            "simulation start"
        );
        engine.run()?;
        info!(events = engine.trace.events().len(), "simulation end");
        Ok(engine.trace)
    }
}

struct Engine<'a> {
    scenario: &'a Scenario,
    system: System,
    tasks: BTreeMap<Pid, SimTask>,
    cpus: Vec<CpuSlot>,
    events: BinaryHeap<Reverse<Event>>,
    seq: u64,
    trace: Trace,
}

impl<'a> Engine<'a> {
    fn new(scenario: &'a Scenario) -> Result<Self> {
        scenario
            .config
            .validate()
            .map_err(|e| SchedError::InvalidConfig(e.to_string()))?;
        let system = System::new(scenario.nr_cpus, scenario.config.clone());
        for g in &scenario.groups {
            system.create_group(g.id, g.parent, cgroup_weight_to_load(g.cpu_weight))?;
        }
        let mut tasks = BTreeMap::new();
        for def in &scenario.tasks {
            system
                .lock(def.cpu)?
                .add_task(def.pid, def.nice, def.policy, def.group)?;
            tasks.insert(def.pid, SimTask::new(def));
        }
        Ok(Self {
            scenario,
            system,
            tasks,
            cpus: (0..scenario.nr_cpus).map(|_| CpuSlot::default()).collect(),
            events: BinaryHeap::new(),
            seq: 0,
            trace: Trace::new(),
        })
    }

    fn push(&mut self, time_ns: TimeNs, kind: EventKind) {
        self.events.push(Reverse(Event {
            time_ns,
            seq: self.seq,
            kind,
        }));
        self.seq += 1;
    }

    fn run(&mut self) -> Result<()> {
        let scenario = self.scenario;
        for def in &scenario.tasks {
            self.push(def.start_time_ns, EventKind::TaskWake { pid: def.pid, gen: 0 });
        }
        for cpu in 0..scenario.nr_cpus {
            self.push(scenario.config.tick_ns, EventKind::Tick { cpu: CpuId(cpu) });
        }
        for m in &scenario.migrations {
            self.push(m.at_ns, EventKind::Migrate { pid: m.pid, to: m.to });
        }

        while let Some(Reverse(event)) = self.events.pop() {
            if event.time_ns > scenario.duration_ns {
                break;
            }
            let now = event.time_ns;
            match event.kind {
                EventKind::TaskWake { pid, gen } => {
                    set_sim_clock(now, None);
                    self.wake_task(pid, now, Some(gen))?;
                }
                EventKind::Tick { cpu } => {
                    set_sim_clock(now, Some(cpu));
                    self.push(now + scenario.config.tick_ns, EventKind::Tick { cpu });
                    self.advance(cpu, now)?;
                }
                EventKind::RunDone { cpu, gen } => {
                    set_sim_clock(now, Some(cpu));
                    self.run_done(cpu, gen, now)?;
                }
                EventKind::Migrate { pid, to } => {
                    set_sim_clock(now, None);
                    self.migrate(pid, to, now)?;
                }
            }
        }

        let end = scenario.duration_ns;
        set_sim_clock(end, None);
        for cpu in 0..scenario.nr_cpus {
            self.advance(CpuId(cpu), end)?;
        }
        self.trace.record(end, CpuId(0), TraceKind::SimulationEnd);
        for cpu in 0..scenario.nr_cpus {
            for snapshot in self.system.lock(CpuId(cpu))?.snapshots() {
                self.trace.add_snapshot(snapshot);
            }
        }
        Ok(())
    }

    /// Charge the CPU's running task for the time since it was last
    /// charged.
    fn charge(&mut self, cpu: CpuId, now: TimeNs) {
        let slot = &mut self.cpus[cpu.0 as usize];
        let Some(pid) = slot.running else {
            return;
        };
        let elapsed = now.saturating_sub(slot.since);
        slot.since = now;
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.run_remaining_ns = task.run_remaining_ns.saturating_sub(elapsed);
        }
    }

    /// Bring `cpu` up to `now` and follow any switch the scheduler makes.
    fn advance(&mut self, cpu: CpuId, now: TimeNs) -> Result<()> {
        self.charge(cpu, now);
        let current = self.system.lock(cpu)?.on_clock_advance(now);
        self.reconcile(cpu, now, current);
        Ok(())
    }

    /// Switch tasks on `cpu` if the scheduler asked for it.
    fn settle(&mut self, cpu: CpuId, now: TimeNs) -> Result<()> {
        let current = {
            let mut sched = self.system.lock(cpu)?;
            if !sched.need_resched() {
                return Ok(());
            }
            sched.schedule()
        };
        self.reconcile(cpu, now, current);
        Ok(())
    }

    /// Make the CPU execute `next`, recording the switch.
    fn reconcile(&mut self, cpu: CpuId, now: TimeNs, next: Option<Pid>) {
        let idx = cpu.0 as usize;
        let prev = self.cpus[idx].running;
        let still_running = |p: Pid| {
            self.tasks
                .get(&p)
                .is_some_and(|t| t.state == TaskState::Running)
        };
        if prev == next && next.map_or(true, still_running) {
            return;
        }
        if let Some(p) = prev {
            if let Some(task) = self.tasks.get_mut(&p) {
                if task.state == TaskState::Running {
                    task.state = TaskState::Runnable;
                    self.trace.record(now, cpu, TraceKind::TaskPreempted { pid: p });
                }
            }
        }

        let slot = &mut self.cpus[idx];
        slot.gen += 1;
        let gen = slot.gen;
        match next {
            Some(pid) => {
                slot.running = Some(pid);
                slot.since = now;
                let remaining = match self.tasks.get_mut(&pid) {
                    Some(task) => {
                        task.state = TaskState::Running;
                        task.cpu = cpu;
                        task.run_remaining_ns
                    }
                    None => 0,
                };
                self.trace.record(now, cpu, TraceKind::TaskScheduled { pid });
                self.push(now.saturating_add(remaining), EventKind::RunDone { cpu, gen });
            }
            None => {
                slot.running = None;
                self.trace.record(now, cpu, TraceKind::CpuIdle);
            }
        }
    }

    fn run_done(&mut self, cpu: CpuId, gen: u64, now: TimeNs) -> Result<()> {
        let slot = &self.cpus[cpu.0 as usize];
        if slot.gen != gen {
            return Ok(());
        }
        let Some(pid) = slot.running else {
            return Ok(());
        };
        self.advance(cpu, now)?;

        match self.next_step(pid, now, true)? {
            Step::Run => {
                let slot = &mut self.cpus[cpu.0 as usize];
                if slot.running == Some(pid) {
                    slot.gen += 1;
                    let gen = slot.gen;
                    let remaining = self.tasks.get(&pid).map_or(0, |t| t.run_remaining_ns);
                    self.push(now.saturating_add(remaining), EventKind::RunDone { cpu, gen });
                }
            }
            Step::Sleep(ns) => self.block(pid, ns, now)?,
            Step::Exit => self.exit(pid, now)?,
        }
        self.settle(cpu, now)
    }

    /// Advance `pid`'s script to its next `Run` or `Sleep`, executing any
    /// `Wake` phases on the way. With `advance_first` the current phase is
    /// considered done.
    fn next_step(&mut self, pid: Pid, now: TimeNs, advance_first: bool) -> Result<Step> {
        let limit = self
            .tasks
            .get(&pid)
            .map_or(0, |t| 2 * t.behavior.phases.len() + 2);
        let mut advance = advance_first;
        for _ in 0..limit {
            let Some(task) = self.tasks.get_mut(&pid) else {
                return Ok(Step::Exit);
            };
            if advance && !task.advance_phase() {
                return Ok(Step::Exit);
            }
            advance = true;
            match task.current_phase().cloned() {
                None => return Ok(Step::Exit),
                Some(Phase::Run(0)) => {}
                Some(Phase::Run(ns)) => {
                    task.run_remaining_ns = ns;
                    return Ok(Step::Run);
                }
                Some(Phase::Sleep(ns)) => return Ok(Step::Sleep(ns)),
                Some(Phase::Wake(other)) => {
                    if other != pid {
                        self.wake_task(other, now, None)?;
                    }
                }
            }
        }
        warn!(pid = %pid, "script makes no progress, parking task");
        Ok(Step::Sleep(TimeNs::MAX))
    }

    /// Put a task to sleep for `ns`; `TimeNs::MAX` waits for an explicit
    /// wake.
    fn go_to_sleep(&mut self, pid: Pid, ns: TimeNs, now: TimeNs) {
        let Some(task) = self.tasks.get_mut(&pid) else {
            return;
        };
        task.state = TaskState::Sleeping;
        task.sleep_gen += 1;
        let gen = task.sleep_gen;
        if ns != TimeNs::MAX {
            self.push(now.saturating_add(ns), EventKind::TaskWake { pid, gen });
        }
    }

    fn block(&mut self, pid: Pid, ns: TimeNs, now: TimeNs) -> Result<()> {
        let Some(cpu) = self.tasks.get(&pid).map(|t| t.cpu) else {
            return Ok(());
        };
        self.system.lock(cpu)?.on_task_blocks(pid)?;
        self.trace.record(now, cpu, TraceKind::TaskSlept { pid });
        self.go_to_sleep(pid, ns, now);
        Ok(())
    }

    fn exit(&mut self, pid: Pid, now: TimeNs) -> Result<()> {
        let Some(task) = self.tasks.get_mut(&pid) else {
            return Ok(());
        };
        task.state = TaskState::Exited;
        let cpu = task.cpu;
        debug!(pid = %pid, name = %task.name, "task exits");
        let snapshot = self.system.lock(cpu)?.remove_task(pid)?;
        self.trace.add_snapshot(snapshot);
        self.trace.record(now, cpu, TraceKind::TaskCompleted { pid });
        self.settle(cpu, now)
    }

    /// Wake `pid`. Timed wake-ups carry the sleep generation they belong
    /// to; explicit wakes from another task's script carry none.
    fn wake_task(&mut self, pid: Pid, now: TimeNs, gen: Option<u64>) -> Result<()> {
        let Some(task) = self.tasks.get(&pid) else {
            warn!(pid = %pid, "wake of unknown task");
            return Ok(());
        };
        let advance_first = match task.state {
            TaskState::New => false,
            TaskState::Sleeping => true,
            TaskState::Runnable | TaskState::Running | TaskState::Exited => return Ok(()),
        };
        if gen.is_some_and(|g| g != task.sleep_gen) {
            return Ok(());
        }
        let cpu = task.cpu;
        self.advance(cpu, now)?;

        match self.next_step(pid, now, advance_first)? {
            Step::Run => {
                self.system.lock(cpu)?.on_task_wakes(pid)?;
                if let Some(task) = self.tasks.get_mut(&pid) {
                    task.state = TaskState::Runnable;
                }
                self.trace.record(now, cpu, TraceKind::TaskWoke { pid });
                self.settle(cpu, now)
            }
            Step::Sleep(ns) => {
                self.go_to_sleep(pid, ns, now);
                Ok(())
            }
            Step::Exit => self.exit(pid, now),
        }
    }

    fn migrate(&mut self, pid: Pid, to: QueueId, now: TimeNs) -> Result<()> {
        let Some(task) = self.tasks.get(&pid) else {
            warn!(pid = %pid, "migration of unknown task");
            return Ok(());
        };
        if task.state == TaskState::Exited {
            return Ok(());
        }
        let from = task.cpu;
        self.advance(from, now)?;
        if to.cpu != from {
            self.advance(to.cpu, now)?;
        }
        self.system.request_migration(pid, from, to)?;

        if to.cpu != from {
            if let Some(task) = self.tasks.get_mut(&pid) {
                if task.state == TaskState::Running {
                    task.state = TaskState::Runnable;
                }
                task.cpu = to.cpu;
            }
            self.trace
                .record(now, from, TraceKind::TaskMigrated { pid, to: to.cpu });
        }
        self.settle(from, now)?;
        if to.cpu != from {
            self.settle(to.cpu, now)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{RepeatMode, TaskBehavior, TaskDef};
    use crate::types::GroupId;
    use crate::weight::SchedPolicy;
    use crate::workloads;

    fn def(pid: i32, nice: i32, behavior: TaskBehavior) -> TaskDef {
        TaskDef {
            name: format!("t{pid}"),
            pid: Pid(pid),
            nice,
            policy: SchedPolicy::Normal,
            behavior,
            start_time_ns: 0,
            group: GroupId::ROOT,
            cpu: CpuId(0),
        }
    }

    #[test]
    fn test_single_task_runs_whole_duration() {
        let scenario = Scenario::builder()
            .task(def(1, 0, workloads::cpu_bound(5_000_000)))
            .duration_ms(50)
            .build();
        let trace = Simulator::new(scenario).run().unwrap();
        assert_eq!(trace.total_runtime(Pid(1)), 50_000_000);
        assert_eq!(trace.schedule_count(Pid(1)), 1);
        assert_eq!(trace.snapshot(Pid(1)).unwrap().sum_exec_runtime, 50_000_000);
    }

    #[test]
    fn test_sleeping_task_releases_cpu() {
        let scenario = Scenario::builder()
            .task(def(1, 0, workloads::periodic(2_000_000, 10_000_000)))
            .duration_ms(50)
            .build();
        let trace = Simulator::new(scenario).run().unwrap();
        assert_eq!(trace.total_runtime(Pid(1)), 10_000_000);
        assert_eq!(trace.idle_count(CpuId(0)), 5);
    }

    #[test]
    fn test_task_exits_after_script() {
        let behavior = TaskBehavior {
            phases: vec![Phase::Run(3_000_000)],
            repeat: RepeatMode::Count(2),
        };
        let scenario = Scenario::builder()
            .task(def(1, 0, behavior))
            .duration_ms(20)
            .build();
        let trace = Simulator::new(scenario).run().unwrap();
        assert_eq!(trace.total_runtime(Pid(1)), 6_000_000);
        let completed = trace
            .events()
            .iter()
            .find(|e| e.kind == TraceKind::TaskCompleted { pid: Pid(1) })
            .unwrap();
        assert_eq!(completed.time_ns, 6_000_000);
        assert_eq!(trace.snapshot(Pid(1)).unwrap().sum_exec_runtime, 6_000_000);
    }

    #[test]
    fn test_ping_pong_alternates() {
        let (a, b) = workloads::ping_pong(Pid(1), Pid(2), 1_000_000);
        let scenario = Scenario::builder()
            .task(def(1, 0, a))
            .task(def(2, 0, b))
            .duration_ms(10)
            .build();
        let trace = Simulator::new(scenario).run().unwrap();
        let order = trace.schedule_order(CpuId(0));
        assert!(order.len() >= 8, "order {order:?}");
        for pair in order.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
        assert_eq!(trace.total_runtime(Pid(1)), 5_000_000);
        assert_eq!(trace.total_runtime(Pid(2)), 5_000_000);
    }

    #[test]
    fn test_invalid_scenario_is_rejected() {
        let scenario = Scenario::builder()
            .task(def(1, 25, workloads::cpu_bound(1_000_000)))
            .build();
        assert!(Simulator::new(scenario).run().is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let zero_tick = crate::SchedConfig {
            tick_ns: 0,
            ..Default::default()
        };
        let scenario = Scenario::builder()
            .config(zero_tick)
            .task(def(1, 0, workloads::cpu_bound(1_000_000)))
            .duration_ms(1)
            .build();
        assert!(matches!(
            Simulator::new(scenario).run(),
            Err(SchedError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_events_order_by_time_then_seq() {
        let at = |time_ns, seq, cpu| Event {
            time_ns,
            seq,
            kind: EventKind::Tick { cpu: CpuId(cpu) },
        };
        assert_eq!(at(5, 1, 0), at(5, 1, 1));
        assert!(at(5, 1, 0) < at(5, 2, 0));
        assert!(at(4, 9, 0) < at(5, 0, 0));

        let mut heap = BinaryHeap::new();
        for e in [at(7, 0, 0), at(3, 2, 0), at(3, 1, 0)] {
            heap.push(Reverse(e));
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop().map(|Reverse(e)| (e.time_ns, e.seq)))
            .collect();
        assert_eq!(order, vec![(3, 1), (3, 2), (7, 0)]);
    }
}
