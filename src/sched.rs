//! Per-CPU scheduler driver.
//!
//! A [`Scheduler`] owns everything one CPU needs: the entity and run-queue
//! arenas, the group tree, the CPU clock and the currently running task.
//! External collaborators drive it through four entry points:
//!
//! - [`on_clock_advance`](Scheduler::on_clock_advance): time passed.
//! - [`on_task_wakes`](Scheduler::on_task_wakes): a task became runnable.
//! - [`on_task_blocks`](Scheduler::on_task_blocks): a task stopped being
//!   runnable.
//! - [`migrate_task`]: move a task to another CPU's scheduler.
//!
//! All operations run to completion under `&mut self`; there is no hidden
//! global state, so any number of schedulers can coexist.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::avg::{LoadSample, LoadSnapshot};
use crate::config::SchedConfig;
use crate::entity::{EntityKind, EntitySnapshot, EntityState, SchedEntity};
use crate::error::{Result, SchedError};
use crate::group::GroupHierarchy;
use crate::rq::FairRunQueue;
use crate::types::{CpuId, EntityId, GroupId, Pid, TimeNs, Vtime};
use crate::weight::{LoadWeight, SchedPolicy};

static NEXT_HIERARCHY: AtomicU64 = AtomicU64::new(1);

pub(crate) fn new_hierarchy_id() -> u64 {
    NEXT_HIERARCHY.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug)]
pub struct Scheduler {
    cpu: CpuId,
    /// Schedulers may only exchange tasks within one hierarchy: they must
    /// agree on the group tree.
    hierarchy: u64,
    config: SchedConfig,
    clock: TimeNs,
    h: GroupHierarchy,
    current: Option<EntityId>,
    need_resched: bool,
    load: Arc<LoadSnapshot>,
}

impl Scheduler {
    /// A scheduler with its own, independent hierarchy.
    pub fn new(cpu: CpuId, config: SchedConfig) -> Self {
        Self::with_hierarchy(cpu, config, new_hierarchy_id())
    }

    pub(crate) fn with_hierarchy(cpu: CpuId, config: SchedConfig, hierarchy: u64) -> Self {
        Self {
            cpu,
            hierarchy,
            config,
            clock: 0,
            h: GroupHierarchy::new(0),
            current: None,
            need_resched: false,
            load: Arc::new(LoadSnapshot::default()),
        }
    }

    /// A scheduler for another CPU in the same hierarchy, with the same
    /// configuration and no tasks or groups.
    pub fn sibling(&self, cpu: CpuId) -> Self {
        Self::with_hierarchy(cpu, self.config.clone(), self.hierarchy)
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn hierarchy_id(&self) -> u64 {
        self.hierarchy
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn clock(&self) -> TimeNs {
        self.clock
    }

    pub fn need_resched(&self) -> bool {
        self.need_resched
    }

    /// Task currently selected to run.
    pub fn current(&self) -> Option<Pid> {
        self.current
            .and_then(|id| self.h.entities.get(id))
            .and_then(SchedEntity::pid)
    }

    /// Runnable tasks on this CPU, including the running one.
    pub fn nr_running(&self) -> u32 {
        self.h.nr_running()
    }

    /// Lock-free view of this CPU's load for load balancers.
    pub fn load_snapshot(&self) -> Arc<LoadSnapshot> {
        Arc::clone(&self.load)
    }

    pub fn add_task(
        &mut self,
        pid: Pid,
        nice: i32,
        policy: SchedPolicy,
        group: GroupId,
    ) -> Result<EntityId> {
        let load = LoadWeight::for_policy(policy, nice)?;
        self.spawn(pid, nice, policy, load, group)
    }

    /// Add a task with an explicit weight instead of a nice level.
    pub fn add_task_with_weight(
        &mut self,
        pid: Pid,
        load: LoadWeight,
        group: GroupId,
    ) -> Result<EntityId> {
        self.spawn(pid, 0, SchedPolicy::Normal, load, group)
    }

    fn spawn(
        &mut self,
        pid: Pid,
        nice: i32,
        policy: SchedPolicy,
        load: LoadWeight,
        group: GroupId,
    ) -> Result<EntityId> {
        let kind = EntityKind::Task { pid, nice, policy };
        let rq = self.h.group(group)?.queue;
        let se = SchedEntity::new(kind, load, rq, self.clock);
        let id = self.h.attach_task(pid, se, group)?;
        debug!(cpu = %self.cpu, pid = %pid, group = %group, weight = load.weight, "add task");
        Ok(id)
    }

    /// Remove a task, dequeuing it first if needed. Returns its final
    /// statistics.
    pub fn remove_task(&mut self, pid: Pid) -> Result<EntitySnapshot> {
        let id = self.h.task(pid)?;
        if self.current == Some(id) {
            self.detach_current();
        }
        if self.h.entities[id].on_rq() {
            self.h.dequeue_task(id, &self.config, self.clock)?;
        }
        let se = self.h.detach_task(pid)?;
        debug!(cpu = %self.cpu, pid = %pid, "remove task");
        self.publish_load();
        Ok(se.snapshot())
    }

    pub fn create_group(&mut self, id: GroupId, parent: GroupId, load: LoadWeight) -> Result<()> {
        self.h.create_group(id, parent, load, self.clock)
    }

    pub fn destroy_group(&mut self, id: GroupId) -> Result<()> {
        self.h.destroy_group(id)
    }

    /// Whether `id` still holds tasks, child groups or runnable entities.
    pub fn group_in_use(&self, id: GroupId) -> Result<bool> {
        let node = self.h.group(id)?;
        Ok(node.nr_tasks > 0 || node.nr_children > 0 || !self.h.queues[node.queue].is_empty())
    }

    pub fn set_nice(&mut self, pid: Pid, nice: i32) -> Result<()> {
        let policy = self.policy_of(pid)?;
        self.reprioritize(pid, policy, nice)
    }

    pub fn set_policy(&mut self, pid: Pid, policy: SchedPolicy) -> Result<()> {
        let id = self.h.task(pid)?;
        let EntityKind::Task { nice, .. } = self.h.entities[id].kind else {
            return Err(SchedError::UnknownTask(pid));
        };
        self.reprioritize(pid, policy, nice)
    }

    fn policy_of(&self, pid: Pid) -> Result<SchedPolicy> {
        let id = self.h.task(pid)?;
        match self.h.entities[id].kind {
            EntityKind::Task { policy, .. } => Ok(policy),
            EntityKind::Group(_) => Err(SchedError::UnknownTask(pid)),
        }
    }

    fn reprioritize(&mut self, pid: Pid, policy: SchedPolicy, nice: i32) -> Result<()> {
        let load = LoadWeight::for_policy(policy, nice)?;
        let id = self.h.task(pid)?;
        if let Some(curr) = self.current {
            self.h.update_curr_chain(curr, &self.config, self.clock);
        }
        let rq = self.h.entities[id].rq;
        self.h.queues[rq].reweight(&mut self.h.entities, id, load, &self.config, self.clock);
        self.h.entities[id].kind = EntityKind::Task { pid, nice, policy };
        if self.h.entities[id].on_rq() {
            self.need_resched = true;
        }
        debug!(cpu = %self.cpu, pid = %pid, nice, policy = %policy, "reprioritize");
        Ok(())
    }

    /// Time advanced to `now`: charge the running chain, check for
    /// preemption and switch tasks if needed.
    ///
    /// Returns the task running after the call. A `now` behind the CPU
    /// clock is ignored.
    pub fn on_clock_advance(&mut self, now: TimeNs) -> Option<Pid> {
        if now < self.clock {
            warn!(cpu = %self.cpu, now, clock = self.clock, "clock went backward, ignoring");
            return self.current();
        }
        self.clock = now;
        if let Some(curr) = self.current {
            if self.h.update_curr_chain(curr, &self.config, now) {
                self.need_resched = true;
            }
            if self.check_preempt_tick(curr) {
                self.need_resched = true;
            }
        }
        if self.need_resched || (self.current.is_none() && self.nr_running() > 0) {
            return self.schedule();
        }
        self.publish_load();
        self.current()
    }

    /// Make a blocked task runnable. Requests a reschedule when the woken
    /// task should preempt the running one.
    pub fn on_task_wakes(&mut self, pid: Pid) -> Result<EntityId> {
        let id = self.h.task(pid)?;
        if self.h.entities[id].on_rq() {
            return Err(SchedError::DoubleEnqueue(id));
        }
        if let Some(curr) = self.current {
            self.h.update_curr_chain(curr, &self.config, self.clock);
        }
        self.h.enqueue_task(id, &self.config, self.clock)?;
        self.check_preempt_wakeup(id);
        debug!(
            cpu = %self.cpu,
            pid = %pid,
            vruntime = self.h.entities[id].vruntime.0,
            resched = self.need_resched,
            "wake"
        );
        Ok(id)
    }

    /// Take a task off its run-queue. Blocking the running task requests a
    /// reschedule; the task keeps the CPU until [`schedule`](Self::schedule).
    pub fn on_task_blocks(&mut self, pid: Pid) -> Result<()> {
        let id = self.h.task(pid)?;
        if !self.h.entities[id].on_rq() {
            return Err(SchedError::DequeueNotEnqueued(id));
        }
        if self.current == Some(id) {
            self.h.update_curr_chain(id, &self.config, self.clock);
            self.h.entities[id].nr_voluntary_switches += 1;
            self.need_resched = true;
        }
        self.h.dequeue_task(id, &self.config, self.clock)?;
        debug!(cpu = %self.cpu, pid = %pid, vlag = self.h.entities[id].vlag, "block");
        Ok(())
    }

    /// Put the previous task back and pick the next one.
    pub fn schedule(&mut self) -> Option<Pid> {
        let now = self.clock;
        let prev = self.current.take();
        let prev_running = prev.is_some_and(|p| {
            self.h
                .entities
                .get(p)
                .is_some_and(|se| se.state == EntityState::Running)
        });
        if let Some(prev) = prev {
            self.h.put_prev_task(prev, &self.config, now);
        }
        let next = self.h.pick_next_task(&self.config, now);
        if let Some(prev) = prev {
            if prev_running && next != Some(prev) {
                self.h.entities[prev].nr_involuntary_switches += 1;
            }
        }
        self.current = next;
        self.need_resched = false;
        self.publish_load();

        let next_pid = self.current();
        debug!(
            cpu = %self.cpu,
            prev = ?prev.and_then(|p| self.h.entities.get(p)).and_then(SchedEntity::pid),
            next = ?next_pid,
            "switch"
        );
        next_pid
    }

    /// Move a task into another group on this CPU.
    pub fn move_task(&mut self, pid: Pid, group: GroupId) -> Result<()> {
        let id = self.h.task(pid)?;
        self.h.group(group)?;
        let runnable = self.h.entities[id].on_rq();
        if self.current == Some(id) {
            self.detach_current();
        }
        if runnable {
            self.h.dequeue_task(id, &self.config, self.clock)?;
        }
        self.h.move_task(pid, group)?;
        if runnable {
            self.h.enqueue_task(id, &self.config, self.clock)?;
            self.check_preempt_wakeup(id);
        }
        Ok(())
    }

    pub fn entity(&self, pid: Pid) -> Option<&SchedEntity> {
        let id = self.h.task(pid).ok()?;
        self.h.entities.get(id)
    }

    pub fn group_entity(&self, group: GroupId) -> Option<&SchedEntity> {
        let id = self.h.groups.get(&group)?.entity?;
        self.h.entities.get(id)
    }

    pub fn snapshot(&self, pid: Pid) -> Option<EntitySnapshot> {
        self.entity(pid).map(SchedEntity::snapshot)
    }

    /// Snapshots of every task on this CPU, by pid.
    pub fn snapshots(&self) -> Vec<EntitySnapshot> {
        self.h
            .tasks
            .values()
            .map(|&id| self.h.entities[id].snapshot())
            .collect()
    }

    pub fn tasks(&self) -> impl Iterator<Item = Pid> + '_ {
        self.h.tasks.keys().copied()
    }

    pub fn queue(&self, group: GroupId) -> Option<&FairRunQueue> {
        let node = self.h.groups.get(&group)?;
        Some(&self.h.queues[node.queue])
    }

    /// Waiting entities of a group's queue, earliest deadline first. The
    /// running entity is not included.
    pub fn queue_order(&self, group: GroupId) -> Vec<EntityKind> {
        self.queue(group)
            .map(|rq| {
                rq.in_order(&self.h.entities)
                    .into_iter()
                    .map(|id| self.h.entities[id].kind)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn queue_min_deadline(&self, group: GroupId) -> Option<Vtime> {
        self.queue(group)?.min_deadline(&self.h.entities)
    }

    pub fn queue_avg_vruntime(&self, group: GroupId) -> Option<Vtime> {
        Some(self.queue(group)?.avg_vruntime(&self.h.entities))
    }

    /// Put the running chain back without picking a successor.
    fn detach_current(&mut self) {
        if let Some(prev) = self.current.take() {
            self.h.put_prev_task(prev, &self.config, self.clock);
            self.need_resched = true;
        }
    }

    /// Slice expiry or a better deadline at any level of the running chain.
    fn check_preempt_tick(&self, leaf: EntityId) -> bool {
        let mut se = Some(leaf);
        while let Some(id) = se {
            let rq = self.h.queue_of(id);
            if rq.curr() == Some(id) {
                if let Some(candidate) = rq.pick_next(&self.h.entities, &self.config) {
                    if rq.should_preempt(&self.h.entities, &self.config, id, candidate) {
                        return true;
                    }
                }
            }
            se = self.h.entities[id].parent;
        }
        false
    }

    fn check_preempt_wakeup(&mut self, woken: EntityId) {
        let Some(curr) = self.current else {
            self.need_resched = true;
            return;
        };
        if self.need_resched {
            return;
        }
        let policy = |id: EntityId| match self.h.entities[id].kind {
            EntityKind::Task { policy, .. } => policy,
            EntityKind::Group(_) => SchedPolicy::Normal,
        };
        let (curr_policy, woken_policy) = (policy(curr), policy(woken));
        if curr_policy == SchedPolicy::Idle && woken_policy != SchedPolicy::Idle {
            self.need_resched = true;
            return;
        }
        if !woken_policy.wakeup_preempts() {
            return;
        }
        let Some((cse, wse)) = self.h.matching_level(curr, woken) else {
            return;
        };
        let rq = self.h.queue_of(cse);
        if rq.curr() == Some(cse) && rq.deadline_preempts(&self.h.entities, &self.config, cse, wse)
        {
            self.need_resched = true;
        }
    }

    fn publish_load(&mut self) {
        let root = self.h.root;
        self.h.queues[root].update_avg(&self.config, self.clock);
        let rq = &self.h.queues[root];
        self.load.publish(LoadSample {
            load_avg: rq.avg().load_avg(),
            runnable_avg: rq.avg().runnable_avg(),
            util_avg: rq.avg().util_avg(),
            nr_running: rq.h_nr_running() as u64,
            updated_at: self.clock,
        });
    }
}

/// Move `pid` from `src` to `group` on `dst`.
///
/// The task's vruntime is rebased from the source queue's `min_vruntime`
/// to the destination's; a runnable task is dequeued (storing its lag) and
/// enqueued on `dst`. Fails without changing either scheduler if they
/// belong to different hierarchies, the task or group is unknown, or `dst`
/// already has a task with this pid.
pub fn migrate_task(
    src: &mut Scheduler,
    dst: &mut Scheduler,
    pid: Pid,
    group: GroupId,
) -> Result<()> {
    if src.hierarchy != dst.hierarchy {
        return Err(SchedError::CrossHierarchyMigration {
            from: src.hierarchy,
            to: dst.hierarchy,
        });
    }
    let id = src.h.task(pid)?;
    let dst_rq = dst.h.group(group)?.queue;
    if dst.h.tasks.contains_key(&pid) {
        return Err(SchedError::DuplicateTask(pid));
    }

    let runnable = src.h.entities[id].on_rq();
    if src.current == Some(id) {
        src.detach_current();
    }
    if runnable {
        src.h.dequeue_task(id, &src.config, src.clock)?;
    }
    let src_min = src.h.queue_of(id).min_vruntime();
    let mut se = src.h.detach_task(pid)?;

    let dst_min = dst.h.queues[dst_rq].min_vruntime();
    se.vruntime = se.vruntime.rebase(src_min, dst_min);
    se.nr_migrations += 1;
    se.exec_start = dst.clock;
    se.avg.rebase(dst.clock);
    let asleep = src.clock.saturating_sub(se.dequeued_at);
    se.dequeued_at = dst.clock.saturating_sub(asleep);
    let new_id = dst.h.attach_task(pid, se, group)?;
    if runnable {
        dst.h.enqueue_task(new_id, &dst.config, dst.clock)?;
        dst.check_preempt_wakeup(new_id);
    }
    src.publish_load();
    dst.publish_load();
    debug!(pid = %pid, from = %src.cpu, to = %dst.cpu, group = %group, runnable, "migrate");
    Ok(())
}
