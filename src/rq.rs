//! A single fair run-queue: one level of the group hierarchy on one CPU.
//!
//! # Virtual time bookkeeping
//!
//! Entities waiting to run sit in the [`Timeline`] ordered by virtual
//! deadline. The running entity (`curr`) is taken out of the timeline while
//! its vruntime moves and is accounted separately, so the timeline keys
//! never change under the tree.
//!
//! The queue tracks the load-weighted average vruntime `V` exactly, using
//! sums relative to `min_vruntime` to keep magnitudes small:
//!
//! ```text
//!   avg_vruntime_sum = Σ w_i * (v_i - min_vruntime)    (timeline only)
//!   avg_load         = Σ w_i                            (timeline only)
//!   V = min_vruntime + (avg_vruntime_sum + w_c * (v_c - min_vruntime))
//!                      / (avg_load + w_c)
//! ```
//!
//! An entity is *eligible* when `v <= V`, i.e. it has not received more
//! than its fair share. `pick_next` returns the earliest-deadline eligible
//! entity.
//!
//! `min_vruntime` is a monotonic watermark that follows the smallest
//! vruntime on the queue. It anchors placement of new entities and is the
//! reference for rebasing vruntime across queues on migration.

use tracing::debug;

use crate::avg::AvgTracker;
use crate::config::{EligibilityPolicy, LagPolicy, SchedConfig};
use crate::entity::{EntityArena, EntityState};
use crate::error::{Result, SchedError};
use crate::tree::Timeline;
use crate::types::{EntityId, GroupId, RqIdx, TimeNs, Vtime};
use crate::weight::LoadWeight;

#[derive(Debug)]
pub struct FairRunQueue {
    pub(crate) idx: RqIdx,
    group: GroupId,
    /// Group entity representing this queue in the parent queue; `None`
    /// for the root.
    pub(crate) owner: Option<EntityId>,

    timeline: Timeline,
    curr: Option<EntityId>,
    next_seq: u64,

    min_vruntime: Vtime,
    avg_vruntime_sum: i128,
    avg_load: u64,

    /// Σ weight of queued and running entities.
    load_weight: u64,
    /// Queued plus running entities at this level.
    nr_running: u32,
    /// Runnable tasks anywhere below this queue.
    pub(crate) h_nr_running: u32,

    avg: AvgTracker,
}

impl FairRunQueue {
    pub(crate) fn new(idx: RqIdx, group: GroupId, owner: Option<EntityId>, now: TimeNs) -> Self {
        Self {
            idx,
            group,
            owner,
            timeline: Timeline::default(),
            curr: None,
            next_seq: 0,
            min_vruntime: Vtime(0),
            avg_vruntime_sum: 0,
            avg_load: 0,
            load_weight: 0,
            nr_running: 0,
            h_nr_running: 0,
            avg: AvgTracker::new(now),
        }
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn nr_running(&self) -> u32 {
        self.nr_running
    }

    pub fn h_nr_running(&self) -> u32 {
        self.h_nr_running
    }

    /// Entities waiting in the timeline (excludes the running one).
    pub fn nr_queued(&self) -> usize {
        self.timeline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nr_running == 0
    }

    pub fn load_weight(&self) -> u64 {
        self.load_weight
    }

    pub fn min_vruntime(&self) -> Vtime {
        self.min_vruntime
    }

    pub fn avg(&self) -> &AvgTracker {
        &self.avg
    }

    pub(crate) fn curr(&self) -> Option<EntityId> {
        self.curr
    }

    pub(crate) fn min_deadline(&self, arena: &EntityArena) -> Option<Vtime> {
        self.timeline.min_deadline(arena)
    }

    pub(crate) fn in_order(&self, arena: &EntityArena) -> Vec<EntityId> {
        self.timeline.in_order(arena)
    }

    fn entity_key(&self, v: Vtime) -> i128 {
        v.delta(self.min_vruntime) as i128
    }

    /// Weighted sum and total weight of every runnable entity, including
    /// the running one.
    fn avg_parts(&self, arena: &EntityArena) -> (i128, i128) {
        let mut sum = self.avg_vruntime_sum;
        let mut load = self.avg_load as i128;
        if let Some(c) = self.curr {
            let se = &arena[c];
            let w = se.load.weight as i128;
            sum += self.entity_key(se.vruntime) * w;
            load += w;
        }
        (sum, load)
    }

    /// Load-weighted average vruntime of the runnable entities, or
    /// `min_vruntime` for an idle queue.
    pub(crate) fn avg_vruntime(&self, arena: &EntityArena) -> Vtime {
        let (sum, load) = self.avg_parts(arena);
        if load == 0 {
            return self.min_vruntime;
        }
        // Round toward negative infinity so the average never sits above
        // every entity.
        let offset = sum.div_euclid(load);
        self.min_vruntime.offset(offset as i64)
    }

    /// `v <= V` without the division: `Σ w_i (v_i - v0) >= (v - v0) Σ w_i`.
    pub(crate) fn vruntime_eligible(
        &self,
        arena: &EntityArena,
        config: &SchedConfig,
        v: Vtime,
    ) -> bool {
        if config.eligibility == EligibilityPolicy::Disabled {
            return true;
        }
        let (sum, load) = self.avg_parts(arena);
        sum >= self.entity_key(v) * load
    }

    fn avg_vruntime_add(&mut self, arena: &EntityArena, id: EntityId) {
        let se = &arena[id];
        self.avg_vruntime_sum += self.entity_key(se.vruntime) * se.load.weight as i128;
        self.avg_load += se.load.weight;
    }

    fn avg_vruntime_sub(&mut self, arena: &EntityArena, id: EntityId) {
        let se = &arena[id];
        self.avg_vruntime_sum -= self.entity_key(se.vruntime) * se.load.weight as i128;
        self.avg_load -= se.load.weight;
    }

    fn insert_timeline(&mut self, arena: &mut EntityArena, id: EntityId) {
        arena[id].seq = self.next_seq;
        self.next_seq += 1;
        self.avg_vruntime_add(arena, id);
        self.timeline.insert(arena, id);
    }

    fn remove_timeline(&mut self, arena: &mut EntityArena, id: EntityId) {
        if self.timeline.remove(arena, id) {
            self.avg_vruntime_sub(arena, id);
        }
    }

    /// Advance the watermark to the smallest runnable vruntime, never
    /// backward. Keys are relative to the watermark, so the weighted sum is
    /// shifted by the same amount.
    pub(crate) fn update_min_vruntime(&mut self, arena: &EntityArena) {
        let curr = self.curr.map(|c| arena[c].vruntime);
        let queued = self.timeline.min_vruntime(arena);
        let candidate = match (curr, queued) {
            (Some(c), Some(q)) => c.min(q),
            (Some(v), None) | (None, Some(v)) => v,
            (None, None) => return,
        };
        if candidate > self.min_vruntime {
            let delta = candidate.delta(self.min_vruntime) as i128;
            self.avg_vruntime_sum -= self.avg_load as i128 * delta;
            self.min_vruntime = candidate;
        }
    }

    /// Fold the time since the last update into the entity's and the
    /// queue's averages. Must run before either changes state.
    fn update_load_avg(
        &mut self,
        arena: &mut EntityArena,
        id: EntityId,
        config: &SchedConfig,
        now: TimeNs,
    ) {
        let se = &mut arena[id];
        let weight = se.load.weight;
        let runnable = se.state != EntityState::Off;
        let running = se.state == EntityState::Running;
        se.avg
            .update(now, config.avg_half_life_ns, weight, runnable, running);
        self.update_avg(config, now);
    }

    /// Fold the time since the last update into the queue's own averages.
    pub(crate) fn update_avg(&mut self, config: &SchedConfig, now: TimeNs) {
        self.avg.update(
            now,
            config.avg_half_life_ns,
            self.load_weight,
            self.nr_running > 0,
            self.curr.is_some(),
        );
    }

    /// Charge the running entity up to `now`.
    ///
    /// Returns true when the entity reached its deadline and was granted a
    /// new slice.
    pub(crate) fn update_curr(
        &mut self,
        arena: &mut EntityArena,
        config: &SchedConfig,
        now: TimeNs,
    ) -> bool {
        let Some(c) = self.curr else {
            return false;
        };
        self.update_load_avg(arena, c, config, now);
        if arena[c].update_runtime(now) == 0 {
            return false;
        }
        let renewed = self.update_deadline(arena, c, config);
        self.update_min_vruntime(arena);
        renewed
    }

    fn update_deadline(&self, arena: &mut EntityArena, id: EntityId, config: &SchedConfig) -> bool {
        if arena[id].vruntime < arena[id].deadline {
            return false;
        }
        let slice = arena[id].compute_slice(self, config);
        let se = &mut arena[id];
        se.slice = slice;
        se.deadline = se.vruntime + se.load.scale_runtime(slice);
        se.prev_sum_exec_runtime = se.sum_exec_runtime;
        true
    }

    /// Choose vruntime, deadline and slice for an entity about to join.
    ///
    /// New entities, and entities asleep for longer than `stale_sleep_ns`,
    /// start at the queue average or their own vruntime, whichever is
    /// later. Others return at the average offset by their stored lag.
    fn place_entity(
        &self,
        arena: &mut EntityArena,
        id: EntityId,
        config: &SchedConfig,
        now: TimeNs,
    ) {
        let base = self.avg_vruntime(arena);
        let slice = arena[id].compute_slice(self, config);
        let queued_load = self.avg_load + self.curr.map_or(0, |c| arena[c].load.weight);

        let se = &mut arena[id];
        let stale = now.saturating_sub(se.dequeued_at) > config.stale_sleep_ns;
        if !se.ever_enqueued || stale {
            se.vruntime = se.vruntime.max(base);
        } else {
            let lag = match config.lag {
                LagPolicy::Discard => 0,
                LagPolicy::Plain => se.vlag,
                // Adding the entity moves the average toward it by
                // w / (W + w) of its lag; inflate so the lag it keeps after
                // joining is the stored one.
                LagPolicy::Preserve if queued_load > 0 => {
                    let w = se.load.weight as i128;
                    let load = queued_load as i128;
                    (se.vlag as i128 * (load + w) / load) as i64
                }
                LagPolicy::Preserve => se.vlag,
            };
            se.vruntime = base.offset(lag);
        }
        se.vlag = 0;
        se.slice = slice;
        se.deadline = se.vruntime + se.load.scale_runtime(slice);
        se.ever_enqueued = true;
    }

    pub(crate) fn enqueue(
        &mut self,
        arena: &mut EntityArena,
        id: EntityId,
        config: &SchedConfig,
        now: TimeNs,
    ) -> Result<()> {
        if arena[id].state != EntityState::Off {
            return Err(SchedError::DoubleEnqueue(id));
        }
        self.update_curr(arena, config, now);
        self.update_load_avg(arena, id, config, now);
        self.place_entity(arena, id, config, now);

        self.load_weight += arena[id].load.weight;
        self.nr_running += 1;
        let se = &mut arena[id];
        se.rq = self.idx;
        se.state = EntityState::Enqueued;
        self.insert_timeline(arena, id);

        let se = &arena[id];
        debug!(
            rq = %self.group,
            se = %id,
            vruntime = se.vruntime.0,
            deadline = se.deadline.0,
            slice = se.slice,
            "enqueue"
        );
        Ok(())
    }

    /// Remove a queued or running entity, remembering its lag.
    pub(crate) fn dequeue(
        &mut self,
        arena: &mut EntityArena,
        id: EntityId,
        config: &SchedConfig,
        now: TimeNs,
    ) -> Result<()> {
        if arena[id].state == EntityState::Off {
            return Err(SchedError::DequeueNotEnqueued(id));
        }
        self.update_curr(arena, config, now);
        self.update_load_avg(arena, id, config, now);

        let avg = self.avg_vruntime(arena);
        let limit = arena[id].lag_limit(config);
        let se = &mut arena[id];
        se.vlag = se.vruntime.delta(avg).clamp(-limit, limit);

        if self.curr == Some(id) {
            self.curr = None;
        } else {
            self.remove_timeline(arena, id);
        }
        let se = &mut arena[id];
        self.load_weight -= se.load.weight;
        self.nr_running -= 1;
        se.state = EntityState::Off;
        se.dequeued_at = now;
        debug!(rq = %self.group, se = %id, vlag = se.vlag, "dequeue");

        self.update_min_vruntime(arena);
        Ok(())
    }

    /// Earliest-deadline eligible entity, or the earliest deadline overall
    /// when nothing is eligible. Does not consider the running entity.
    pub(crate) fn pick_next(&self, arena: &EntityArena, config: &SchedConfig) -> Option<EntityId> {
        if config.eligibility == EligibilityPolicy::Disabled {
            return self.timeline.first(arena);
        }
        let (sum, load) = self.avg_parts(arena);
        let min_vruntime = self.min_vruntime;
        self.timeline
            .first_eligible(arena, |v| sum >= v.delta(min_vruntime) as i128 * load)
            .or_else(|| self.timeline.first(arena))
    }

    /// Whether `candidate` should displace `running`.
    ///
    /// True once `running` has used up its slice, or when `candidate` is
    /// eligible and its deadline beats `running`'s by more than the wakeup
    /// granularity (in the candidate's virtual time).
    pub(crate) fn should_preempt(
        &self,
        arena: &EntityArena,
        config: &SchedConfig,
        running: EntityId,
        candidate: EntityId,
    ) -> bool {
        let curr = &arena[running];
        if curr.slice_elapsed() >= curr.slice {
            return true;
        }
        self.deadline_preempts(arena, config, running, candidate)
    }

    /// The deadline half of [`should_preempt`](Self::should_preempt), used
    /// on wakeup where slice expiry is left to the tick.
    pub(crate) fn deadline_preempts(
        &self,
        arena: &EntityArena,
        config: &SchedConfig,
        running: EntityId,
        candidate: EntityId,
    ) -> bool {
        let curr = &arena[running];
        let cand = &arena[candidate];
        if !self.vruntime_eligible(arena, config, cand.vruntime) {
            return false;
        }
        let margin = cand.load.scale_runtime(config.wakeup_granularity_ns);
        cand.deadline + margin < curr.deadline
    }

    /// Make a queued entity the running one.
    pub(crate) fn set_next(
        &mut self,
        arena: &mut EntityArena,
        id: EntityId,
        config: &SchedConfig,
        now: TimeNs,
    ) {
        if arena[id].state == EntityState::Enqueued {
            self.update_load_avg(arena, id, config, now);
            self.remove_timeline(arena, id);
        }
        let slice = arena[id].compute_slice(self, config);
        let se = &mut arena[id];
        se.state = EntityState::Running;
        se.exec_start = now;
        se.prev_sum_exec_runtime = se.sum_exec_runtime;
        se.slice = slice;
        self.curr = Some(id);
    }

    /// Return the running entity to the timeline. Entities that were
    /// dequeued while running are left off.
    pub(crate) fn put_prev(
        &mut self,
        arena: &mut EntityArena,
        id: EntityId,
        config: &SchedConfig,
        now: TimeNs,
    ) {
        if arena[id].state != EntityState::Running {
            return;
        }
        self.update_curr(arena, config, now);
        self.update_load_avg(arena, id, config, now);
        arena[id].state = EntityState::Enqueued;
        self.curr = None;
        self.insert_timeline(arena, id);
    }

    /// Change an entity's weight in place, keeping the queue average fixed:
    /// lag and relative deadline are scaled by `old / new`.
    pub(crate) fn reweight(
        &mut self,
        arena: &mut EntityArena,
        id: EntityId,
        load: LoadWeight,
        config: &SchedConfig,
        now: TimeNs,
    ) {
        let state = arena[id].state;
        let old = arena[id].load.weight as i128;
        let new = load.weight as i128;
        if state == EntityState::Off {
            let se = &mut arena[id];
            se.vlag = (se.vlag as i128 * old / new) as i64;
            se.load = load;
            return;
        }
        if state == EntityState::Running {
            self.update_curr(arena, config, now);
        }
        self.update_load_avg(arena, id, config, now);
        let avg = self.avg_vruntime(arena);
        if state == EntityState::Enqueued {
            self.remove_timeline(arena, id);
        }

        let se = &mut arena[id];
        let lag = se.vruntime.delta(avg) as i128 * old / new;
        let rel_deadline = se.deadline.delta(avg) as i128 * old / new;
        se.vruntime = avg.offset(lag as i64);
        se.deadline = avg.offset(rel_deadline as i64);
        se.load = load;
        self.load_weight = self.load_weight - old as u64 + load.weight;

        if state == EntityState::Enqueued {
            self.insert_timeline(arena, id);
        }
        debug!(rq = %self.group, se = %id, weight = load.weight, "reweight");
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::entity::{EntityKind, SchedEntity};
    use crate::types::Pid;
    use crate::weight::SchedPolicy;

    fn spawn(arena: &mut EntityArena, pid: i32, weight: u64) -> EntityId {
        arena.insert(SchedEntity::new(
            EntityKind::Task {
                pid: Pid(pid),
                nice: 0,
                policy: SchedPolicy::Normal,
            },
            LoadWeight::new(weight),
            RqIdx(0),
            0,
        ))
    }

    fn root_rq() -> FairRunQueue {
        FairRunQueue::new(RqIdx(0), GroupId::ROOT, None, 0)
    }

    fn latency_24() -> SchedConfig {
        SchedConfig {
            target_latency_ns: 24,
            min_granularity_ns: 1,
            wakeup_granularity_ns: 0,
            ..Default::default()
        }
    }

    /// Run the next pick for `quantum` ns (or its own slice when `None`).
    fn run_one(
        rq: &mut FairRunQueue,
        arena: &mut EntityArena,
        config: &SchedConfig,
        now: &mut TimeNs,
        quantum: Option<TimeNs>,
    ) -> EntityId {
        let next = rq.pick_next(arena, config).unwrap();
        rq.set_next(arena, next, config, *now);
        *now += quantum.unwrap_or(arena[next].slice);
        rq.update_curr(arena, config, *now);
        rq.put_prev(arena, next, config, *now);
        next
    }

    #[test]
    fn test_state_machine_errors() {
        let config = SchedConfig::default();
        let mut arena = EntityArena::default();
        let mut rq = root_rq();
        let a = spawn(&mut arena, 1, 1024);

        assert_eq!(
            rq.dequeue(&mut arena, a, &config, 0),
            Err(SchedError::DequeueNotEnqueued(a))
        );
        rq.enqueue(&mut arena, a, &config, 0).unwrap();
        assert_eq!(
            rq.enqueue(&mut arena, a, &config, 0),
            Err(SchedError::DoubleEnqueue(a))
        );
        assert_eq!(rq.nr_running(), 1);
        assert_eq!(rq.nr_queued(), 1);

        rq.set_next(&mut arena, a, &config, 0);
        assert_eq!(
            rq.enqueue(&mut arena, a, &config, 0),
            Err(SchedError::DoubleEnqueue(a))
        );
        rq.dequeue(&mut arena, a, &config, 10).unwrap();
        assert_eq!(arena[a].state, EntityState::Off);
        assert!(rq.is_empty());
        assert_eq!(rq.curr(), None);
        assert_eq!(rq.load_weight(), 0);
    }

    #[test]
    fn test_slices_split_by_weight() {
        let config = latency_24();
        let mut arena = EntityArena::default();
        let mut rq = root_rq();
        let ids: Vec<_> = [1, 2, 1]
            .iter()
            .enumerate()
            .map(|(i, &w)| spawn(&mut arena, i as i32 + 1, w))
            .collect();
        for &id in &ids {
            rq.enqueue(&mut arena, id, &config, 0).unwrap();
            assert_eq!(arena[id].vruntime, Vtime(0));
        }
        let slices: Vec<_> = ids
            .iter()
            .map(|&id| arena[id].compute_slice(&rq, &config))
            .collect();
        assert_eq!(slices, vec![6, 12, 6]);
    }

    #[test]
    fn test_round_equalizes_vruntime() {
        let config = latency_24();
        let mut arena = EntityArena::default();
        let mut rq = root_rq();
        let ids: Vec<_> = [1, 2, 1]
            .iter()
            .enumerate()
            .map(|(i, &w)| spawn(&mut arena, i as i32 + 1, w))
            .collect();
        for &id in &ids {
            rq.enqueue(&mut arena, id, &config, 0).unwrap();
        }

        let mut now = 0;
        let mut picked: Vec<_> = (0..3)
            .map(|_| run_one(&mut rq, &mut arena, &config, &mut now, None))
            .collect();
        picked.sort();
        assert_eq!(picked, ids, "each entity runs exactly once per round");
        assert_eq!(now, 24);

        let v: Vec<_> = ids.iter().map(|&id| arena[id].vruntime.0).collect();
        let spread = v.iter().max().unwrap() - v.iter().min().unwrap();
        assert!(spread <= 1, "vruntimes {v:?} differ by more than rounding");
    }

    #[test]
    fn test_pick_frequency_follows_weight() {
        let config = latency_24();
        let mut arena = EntityArena::default();
        let mut rq = root_rq();
        let ids: Vec<_> = [1, 2, 1]
            .iter()
            .enumerate()
            .map(|(i, &w)| spawn(&mut arena, i as i32 + 1, w))
            .collect();
        for &id in &ids {
            rq.enqueue(&mut arena, id, &config, 0).unwrap();
        }

        let mut now = 0;
        let picks: Vec<_> = (0..400)
            .map(|_| run_one(&mut rq, &mut arena, &config, &mut now, Some(6)))
            .collect();

        // Every aligned window of four picks serves the entities 1:2:1.
        for window in picks.chunks(4) {
            let count = |id| window.iter().filter(|&&p| p == id).count();
            assert_eq!(
                (count(ids[0]), count(ids[1]), count(ids[2])),
                (1, 2, 1),
                "window {window:?}"
            );
        }
    }

    #[test]
    fn test_negative_lag_places_ahead() {
        let config = SchedConfig::default();
        let mut arena = EntityArena::default();
        let mut rq = root_rq();

        // Push min_vruntime to 100.
        let x = spawn(&mut arena, 1, 1024);
        rq.enqueue(&mut arena, x, &config, 0).unwrap();
        rq.set_next(&mut arena, x, &config, 0);
        rq.update_curr(&mut arena, &config, 100);
        rq.dequeue(&mut arena, x, &config, 100).unwrap();
        assert_eq!(rq.min_vruntime(), Vtime(100));

        // A sleeper that was owed 5 units of virtual time.
        let y = spawn(&mut arena, 2, 1024);
        arena[y].ever_enqueued = true;
        arena[y].vlag = -5;
        arena[y].dequeued_at = 50;
        rq.enqueue(&mut arena, y, &config, 100).unwrap();
        assert_eq!(arena[y].vruntime, Vtime(95));
        assert_eq!(arena[y].vlag, 0);
        assert!(arena[y].deadline > arena[y].vruntime);
    }

    #[test]
    fn test_lag_round_trip_with_preserve() {
        let config = SchedConfig::default();
        let mut arena = EntityArena::default();
        let mut rq = root_rq();
        let a = spawn(&mut arena, 1, 1024);
        let b = spawn(&mut arena, 2, 1024);
        let c = spawn(&mut arena, 3, 1024);
        for id in [a, b, c] {
            rq.enqueue(&mut arena, id, &config, 0).unwrap();
        }
        // a runs 2ms, so b and c are owed service.
        rq.set_next(&mut arena, a, &config, 0);
        rq.update_curr(&mut arena, &config, 2_000_000);
        rq.put_prev(&mut arena, a, &config, 2_000_000);

        let before = arena[b].vruntime.delta(rq.avg_vruntime(&arena));
        assert!(before < 0);
        rq.dequeue(&mut arena, b, &config, 2_000_000).unwrap();
        assert_eq!(arena[b].vlag, before);
        rq.enqueue(&mut arena, b, &config, 3_000_000).unwrap();
        let after = arena[b].vruntime.delta(rq.avg_vruntime(&arena));
        assert!(
            (after - before).abs() <= 1,
            "lag before sleep {before}, after wakeup {after}"
        );
    }

    #[test]
    fn test_lag_is_clamped() {
        let config = SchedConfig::default();
        let mut arena = EntityArena::default();
        let mut rq = root_rq();
        let a = spawn(&mut arena, 1, 1024);
        let b = spawn(&mut arena, 2, 1024);
        rq.enqueue(&mut arena, a, &config, 0).unwrap();
        rq.enqueue(&mut arena, b, &config, 0).unwrap();
        rq.set_next(&mut arena, a, &config, 0);
        rq.update_curr(&mut arena, &config, 1_000_000_000);
        rq.dequeue(&mut arena, a, &config, 1_000_000_000).unwrap();
        let limit = arena[a].lag_limit(&config);
        assert_eq!(arena[a].vlag, limit);
    }

    #[test]
    fn test_avg_vruntime_is_weighted() {
        let config = SchedConfig::default();
        let mut arena = EntityArena::default();
        let mut rq = root_rq();
        let light = spawn(&mut arena, 1, 1024);
        let heavy = spawn(&mut arena, 2, 3072);
        rq.enqueue(&mut arena, light, &config, 0).unwrap();
        rq.enqueue(&mut arena, heavy, &config, 0).unwrap();
        assert_eq!(rq.avg_vruntime(&arena), Vtime(0));

        // heavy runs 12ms real, 4ms virtual.
        rq.set_next(&mut arena, heavy, &config, 0);
        rq.update_curr(&mut arena, &config, 12_000_000);
        let v = arena[heavy].vruntime.0;
        assert!((3_999_999..=4_000_000).contains(&v));
        assert_eq!(rq.avg_vruntime(&arena).0, v * 3 / 4);
        assert!(rq.vruntime_eligible(&arena, &config, arena[light].vruntime));
        assert!(!rq.vruntime_eligible(&arena, &config, arena[heavy].vruntime));
    }

    #[test]
    fn test_pick_skips_ineligible_earlier_deadline() {
        let config = SchedConfig::default();
        let mut arena = EntityArena::default();
        let mut rq = root_rq();
        let a = spawn(&mut arena, 1, 1024);
        let b = spawn(&mut arena, 2, 1024);
        rq.enqueue(&mut arena, a, &config, 0).unwrap();
        rq.enqueue(&mut arena, b, &config, 0).unwrap();
        // a: slice 6ms alone; b: half of 6ms.
        assert_eq!(arena[a].deadline, Vtime(6_000_000));
        assert_eq!(arena[b].deadline, Vtime(3_000_000));
        assert_eq!(rq.pick_next(&arena, &config), Some(b));

        // b runs 1ms: still the earlier deadline, but now ahead of average.
        rq.set_next(&mut arena, b, &config, 0);
        rq.update_curr(&mut arena, &config, 1_000_000);
        rq.put_prev(&mut arena, b, &config, 1_000_000);
        assert_eq!(rq.min_deadline(&arena), Some(Vtime(3_000_000)));
        assert_eq!(rq.pick_next(&arena, &config), Some(a));

        let edf = SchedConfig {
            eligibility: EligibilityPolicy::Disabled,
            ..config
        };
        assert_eq!(rq.pick_next(&arena, &edf), Some(b));
    }

    #[test]
    fn test_pick_falls_back_when_nothing_eligible() {
        let config = SchedConfig::default();
        let mut arena = EntityArena::default();
        let mut rq = root_rq();
        let a = spawn(&mut arena, 1, 1024);
        let b = spawn(&mut arena, 2, 1024);
        rq.enqueue(&mut arena, a, &config, 0).unwrap();
        rq.enqueue(&mut arena, b, &config, 0).unwrap();

        rq.set_next(&mut arena, b, &config, 0);
        rq.update_curr(&mut arena, &config, 2_000_000);
        rq.put_prev(&mut arena, b, &config, 2_000_000);
        // a runs with vruntime 0, leaving b alone in the timeline and
        // ahead of the average.
        rq.set_next(&mut arena, a, &config, 2_000_000);
        assert!(!rq.vruntime_eligible(&arena, &config, arena[b].vruntime));
        assert_eq!(rq.pick_next(&arena, &config), Some(b));

        rq.dequeue(&mut arena, b, &config, 2_000_000).unwrap();
        assert_eq!(rq.pick_next(&arena, &config), None);
    }

    #[test]
    fn test_should_preempt() {
        let config = SchedConfig::default();
        let mut arena = EntityArena::default();
        let mut rq = root_rq();
        let a = spawn(&mut arena, 1, 1024);
        let b = spawn(&mut arena, 2, 1024);
        rq.enqueue(&mut arena, a, &config, 0).unwrap();
        rq.enqueue(&mut arena, b, &config, 0).unwrap();

        // a (deadline 6ms) runs; b (deadline 3ms) beats it by 3ms > 1ms.
        rq.set_next(&mut arena, a, &config, 0);
        assert!(rq.should_preempt(&arena, &config, a, b));

        // With a wide hysteresis only slice expiry preempts.
        let sticky = SchedConfig {
            wakeup_granularity_ns: 5_000_000,
            ..config.clone()
        };
        assert!(!rq.should_preempt(&arena, &sticky, a, b));
        let slice = arena[a].slice;
        rq.update_curr(&mut arena, &sticky, slice);
        assert!(rq.should_preempt(&arena, &sticky, a, b));
    }

    #[test]
    fn test_reweight_keeps_average() {
        let config = SchedConfig::default();
        let mut arena = EntityArena::default();
        let mut rq = root_rq();
        let ids: Vec<_> = (1..=3).map(|pid| spawn(&mut arena, pid, 1024)).collect();
        for &id in &ids {
            rq.enqueue(&mut arena, id, &config, 0).unwrap();
        }
        rq.set_next(&mut arena, ids[0], &config, 0);
        rq.update_curr(&mut arena, &config, 3_000_000);
        rq.put_prev(&mut arena, ids[0], &config, 3_000_000);

        let before = rq.avg_vruntime(&arena);
        let lag_before = arena[ids[0]].vruntime.delta(before);
        rq.reweight(&mut arena, ids[0], LoadWeight::new(4096), &config, 3_000_000);
        let after = rq.avg_vruntime(&arena);
        assert!(after.delta(before).abs() <= 1, "{before} -> {after}");
        assert_eq!(rq.load_weight(), 1024 * 2 + 4096);
        let lag_after = arena[ids[0]].vruntime.delta(after);
        assert!((lag_after - lag_before / 4).abs() <= 1);
    }

    #[test]
    fn test_random_churn_invariants() {
        let config = SchedConfig::default();
        let mut rng = SmallRng::seed_from_u64(42);
        let mut arena = EntityArena::default();
        let mut rq = root_rq();
        let ids: Vec<_> = (0..32)
            .map(|pid| spawn(&mut arena, pid, rng.gen_range(15..20_000)))
            .collect();
        let mut now: TimeNs = 0;
        let mut last_min = rq.min_vruntime();

        for _ in 0..3_000 {
            let id = ids[rng.gen_range(0..ids.len())];
            let state = arena[id].state;
            match state {
                EntityState::Off => rq.enqueue(&mut arena, id, &config, now).unwrap(),
                EntityState::Enqueued if rng.gen_bool(0.3) => {
                    rq.dequeue(&mut arena, id, &config, now).unwrap()
                }
                _ => {
                    if let Some(next) = rq.pick_next(&arena, &config) {
                        rq.set_next(&mut arena, next, &config, now);
                        now += rng.gen_range(1..4_000_000);
                        rq.update_curr(&mut arena, &config, now);
                        if rng.gen_bool(0.2) {
                            rq.dequeue(&mut arena, next, &config, now).unwrap();
                        } else {
                            rq.put_prev(&mut arena, next, &config, now);
                        }
                    }
                }
            }

            rq.timeline.check_invariants(&arena);
            assert!(rq.min_vruntime() >= last_min, "min_vruntime went backward");
            last_min = rq.min_vruntime();
            if let Some(min_deadline) = rq.min_deadline(&arena) {
                for &id in &ids {
                    if arena[id].state == EntityState::Enqueued {
                        assert!(min_deadline <= arena[id].deadline);
                    }
                }
            }
            let queued: u64 = ids
                .iter()
                .filter(|&&id| arena[id].state != EntityState::Off)
                .map(|&id| arena[id].load.weight)
                .sum();
            assert_eq!(queued, rq.load_weight());
        }
    }
}
