//! Schedulable entities: tasks and the group entities that stand in for a
//! whole task group inside their parent's run-queue.
//!
//! Entities live in an [`EntityArena`] owned by the CPU's scheduler. Queues
//! and parents are referenced by handle, never by pointer: a run-queue
//! orders entity handles, and an entity records the queue it belongs to and
//! its parent group entity for lookup only.

use std::fmt;
use std::ops::{Index, IndexMut};

use serde::Serialize;
use tracing::warn;

use crate::avg::AvgTracker;
use crate::config::SchedConfig;
use crate::rq::FairRunQueue;
use crate::types::{EntityId, GroupId, Pid, RqIdx, TimeNs, Vtime};
use crate::weight::{LoadWeight, SchedPolicy};

/// Run-queue membership of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntityState {
    /// Not runnable, or runnable but not yet handed to a queue.
    Off,
    /// Waiting in its queue's timeline.
    Enqueued,
    /// The queue's current entity. Still counted as runnable, but kept out
    /// of the timeline while its vruntime moves.
    Running,
}

/// What the entity schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntityKind {
    Task { pid: Pid, nice: i32, policy: SchedPolicy },
    Group(GroupId),
}

/// Balanced-tree links, embedded in the entity so the timeline needs no
/// node allocation of its own.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TreeLinks {
    pub left: Option<EntityId>,
    pub right: Option<EntityId>,
    pub height: u8,
    /// Smallest vruntime in the subtree rooted here.
    pub min_vruntime: Vtime,
}

#[derive(Debug, Clone)]
pub struct SchedEntity {
    pub(crate) kind: EntityKind,
    pub(crate) load: LoadWeight,
    pub(crate) state: EntityState,

    pub(crate) vruntime: Vtime,
    pub(crate) deadline: Vtime,
    /// Smallest deadline in the timeline subtree rooted at this entity.
    pub(crate) min_deadline: Vtime,
    /// `vruntime - avg_vruntime` at the last dequeue; negative when the
    /// entity was owed service.
    pub(crate) vlag: i64,
    pub(crate) slice: TimeNs,

    pub(crate) exec_start: TimeNs,
    pub(crate) sum_exec_runtime: TimeNs,
    pub(crate) prev_sum_exec_runtime: TimeNs,
    pub(crate) dequeued_at: TimeNs,
    pub(crate) ever_enqueued: bool,

    pub(crate) nr_migrations: u64,
    pub(crate) nr_voluntary_switches: u64,
    pub(crate) nr_involuntary_switches: u64,

    pub(crate) depth: u32,
    pub(crate) parent: Option<EntityId>,
    pub(crate) rq: RqIdx,
    pub(crate) my_q: Option<RqIdx>,

    pub(crate) avg: AvgTracker,

    pub(crate) seq: u64,
    pub(crate) links: TreeLinks,
}

impl SchedEntity {
    pub(crate) fn new(kind: EntityKind, load: LoadWeight, rq: RqIdx, now: TimeNs) -> Self {
        Self {
            kind,
            load,
            state: EntityState::Off,
            vruntime: Vtime(0),
            deadline: Vtime(0),
            min_deadline: Vtime(0),
            vlag: 0,
            slice: 0,
            exec_start: now,
            sum_exec_runtime: 0,
            prev_sum_exec_runtime: 0,
            dequeued_at: now,
            ever_enqueued: false,
            nr_migrations: 0,
            nr_voluntary_switches: 0,
            nr_involuntary_switches: 0,
            depth: 0,
            parent: None,
            rq,
            my_q: None,
            avg: AvgTracker::new_task(now, load.weight),
            seq: 0,
            links: TreeLinks::default(),
        }
    }

    /// Charge the real time elapsed since `exec_start`.
    ///
    /// Returns the charged delta. A clock behind `exec_start` charges
    /// nothing and leaves `exec_start` in place.
    pub fn update_runtime(&mut self, now: TimeNs) -> TimeNs {
        let Some(delta) = now.checked_sub(self.exec_start) else {
            warn!(
                now,
                exec_start = self.exec_start,
                kind = ?self.kind,
                "clock went backward, not charging runtime"
            );
            return 0;
        };
        self.sum_exec_runtime = self.sum_exec_runtime.saturating_add(delta);
        self.vruntime = self.vruntime + self.load.scale_runtime(delta);
        self.exec_start = now;
        delta
    }

    /// Slice this entity would be granted on `rq` now: its share of
    /// `target_latency` by weight, within `[min_granularity,
    /// target_latency]`. An entity not yet on `rq` is counted as if it were.
    /// If `min_granularity` exceeds `target_latency` the floor wins.
    pub fn compute_slice(&self, rq: &FairRunQueue, config: &SchedConfig) -> TimeNs {
        let mut total = rq.load_weight();
        if self.state == EntityState::Off {
            total += self.load.weight;
        }
        let share =
            config.target_latency_ns as u128 * self.load.weight as u128 / total.max(1) as u128;
        (share as u64)
            .min(config.target_latency_ns)
            .max(config.min_granularity_ns)
    }

    /// Real time consumed since the entity was last picked.
    pub fn slice_elapsed(&self) -> TimeNs {
        self.sum_exec_runtime
            .saturating_sub(self.prev_sum_exec_runtime)
    }

    /// The lag clamp: the stored lag may not exceed the virtual length of
    /// two slices, or of one tick for entities with tiny slices.
    pub(crate) fn lag_limit(&self, config: &SchedConfig) -> i64 {
        let span = (2 * self.slice).max(config.tick_ns);
        self.load.scale_runtime(span).min(i64::MAX as u64) as i64
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn pid(&self) -> Option<Pid> {
        match self.kind {
            EntityKind::Task { pid, .. } => Some(pid),
            EntityKind::Group(_) => None,
        }
    }

    pub fn is_task(&self) -> bool {
        matches!(self.kind, EntityKind::Task { .. })
    }

    pub fn load(&self) -> LoadWeight {
        self.load
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn on_rq(&self) -> bool {
        self.state != EntityState::Off
    }

    pub fn vruntime(&self) -> Vtime {
        self.vruntime
    }

    pub fn deadline(&self) -> Vtime {
        self.deadline
    }

    pub fn vlag(&self) -> i64 {
        self.vlag
    }

    pub fn slice(&self) -> TimeNs {
        self.slice
    }

    pub fn sum_exec_runtime(&self) -> TimeNs {
        self.sum_exec_runtime
    }

    pub fn nr_migrations(&self) -> u64 {
        self.nr_migrations
    }

    pub fn nr_switches(&self) -> u64 {
        self.nr_voluntary_switches + self.nr_involuntary_switches
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn avg(&self) -> &AvgTracker {
        &self.avg
    }

    pub fn snapshot(&self) -> EntitySnapshot {
        let (pid, nice, policy) = match self.kind {
            EntityKind::Task { pid, nice, policy } => (Some(pid), Some(nice), Some(policy)),
            EntityKind::Group(_) => (None, None, None),
        };
        EntitySnapshot {
            pid,
            group: match self.kind {
                EntityKind::Group(id) => Some(id),
                EntityKind::Task { .. } => None,
            },
            nice,
            policy,
            state: self.state,
            exec_start: self.exec_start,
            vruntime: self.vruntime.0,
            deadline: self.deadline.0,
            vlag: self.vlag,
            slice: self.slice,
            sum_exec_runtime: self.sum_exec_runtime,
            nr_migrations: self.nr_migrations,
            nr_switches: self.nr_switches(),
            nr_voluntary_switches: self.nr_voluntary_switches,
            nr_involuntary_switches: self.nr_involuntary_switches,
            load_weight: self.load.weight,
            load_avg: self.avg.load_avg(),
            runnable_avg: self.avg.runnable_avg(),
            util_avg: self.avg.util_avg(),
            depth: self.depth,
        }
    }
}

/// Copy of an entity's statistics, laid out like `/proc/<pid>/sched`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitySnapshot {
    pub pid: Option<Pid>,
    pub group: Option<GroupId>,
    pub nice: Option<i32>,
    pub policy: Option<SchedPolicy>,
    pub state: EntityState,
    pub exec_start: TimeNs,
    pub vruntime: u64,
    pub deadline: u64,
    pub vlag: i64,
    pub slice: TimeNs,
    pub sum_exec_runtime: TimeNs,
    pub nr_migrations: u64,
    pub nr_switches: u64,
    pub nr_voluntary_switches: u64,
    pub nr_involuntary_switches: u64,
    pub load_weight: u64,
    pub load_avg: u64,
    pub runnable_avg: u64,
    pub util_avg: u64,
    pub depth: u32,
}

impl fmt::Display for EntitySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.pid, self.group) {
            (Some(pid), _) => writeln!(f, "pid {pid}")?,
            (None, Some(group)) => writeln!(f, "group {group}")?,
            (None, None) => writeln!(f, "entity")?,
        }
        writeln!(f, "{:-<60}", "")?;
        let rows: [(&str, String); 16] = [
            ("se.exec_start", self.exec_start.to_string()),
            ("se.vruntime", self.vruntime.to_string()),
            ("se.deadline", self.deadline.to_string()),
            ("se.vlag", self.vlag.to_string()),
            ("se.slice", self.slice.to_string()),
            ("se.sum_exec_runtime", self.sum_exec_runtime.to_string()),
            ("se.nr_migrations", self.nr_migrations.to_string()),
            ("nr_switches", self.nr_switches.to_string()),
            ("nr_voluntary_switches", self.nr_voluntary_switches.to_string()),
            (
                "nr_involuntary_switches",
                self.nr_involuntary_switches.to_string(),
            ),
            ("se.load.weight", self.load_weight.to_string()),
            ("se.avg.load_avg", self.load_avg.to_string()),
            ("se.avg.runnable_avg", self.runnable_avg.to_string()),
            ("se.avg.util_avg", self.util_avg.to_string()),
            ("policy", self.policy.map_or("-".into(), |p| p.to_string())),
            ("prio", self.nice.map_or("-".into(), |n| (120 + n).to_string())),
        ];
        for (key, value) in rows {
            writeln!(f, "{key:<41}: {value:>18}")?;
        }
        Ok(())
    }
}

/// Slot storage for entities with handle reuse.
///
/// Indexing with a handle that was never issued, or whose entity was
/// removed, is an internal invariant violation and panics.
#[derive(Debug, Default)]
pub(crate) struct EntityArena {
    slots: Vec<Option<SchedEntity>>,
    free: Vec<u32>,
}

impl EntityArena {
    pub fn insert(&mut self, se: SchedEntity) -> EntityId {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(se);
                EntityId(idx)
            }
            None => {
                self.slots.push(Some(se));
                EntityId(self.slots.len() as u32 - 1)
            }
        }
    }

    pub fn remove(&mut self, id: EntityId) -> Option<SchedEntity> {
        let se = self.slots.get_mut(id.0 as usize)?.take()?;
        self.free.push(id.0);
        Some(se)
    }

    pub fn get(&self, id: EntityId) -> Option<&SchedEntity> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

impl Index<EntityId> for EntityArena {
    type Output = SchedEntity;

    fn index(&self, id: EntityId) -> &SchedEntity {
        match self.slots.get(id.0 as usize) {
            Some(Some(se)) => se,
            _ => panic!("stale entity handle {id}"),
        }
    }
}

impl IndexMut<EntityId> for EntityArena {
    fn index_mut(&mut self, id: EntityId) -> &mut SchedEntity {
        match self.slots.get_mut(id.0 as usize) {
            Some(Some(se)) => se,
            _ => panic!("stale entity handle {id}"),
        }
    }
}
