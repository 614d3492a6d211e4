//! Multi-CPU container: one [`Scheduler`] per CPU, each behind its own
//! mutex.
//!
//! Schedulers built by one `System` share a hierarchy id, so tasks can be
//! migrated between them. A migration holds both CPUs' locks, taken in
//! ascending CPU order. Per-CPU load is published through lock-free
//! snapshots that balancers read without touching the scheduler locks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::avg::{LoadSample, LoadSnapshot};
use crate::config::SchedConfig;
use crate::error::{Result, SchedError};
use crate::sched::{migrate_task, new_hierarchy_id, Scheduler};
use crate::types::{CpuId, GroupId, Pid, QueueId};
use crate::weight::LoadWeight;

#[derive(Debug)]
pub struct System {
    cpus: Vec<Mutex<Scheduler>>,
    loads: Vec<Arc<LoadSnapshot>>,
}

impl System {
    pub fn new(nr_cpus: u32, config: SchedConfig) -> Self {
        let hierarchy = new_hierarchy_id();
        let scheds: Vec<Scheduler> = (0..nr_cpus)
            .map(|cpu| Scheduler::with_hierarchy(CpuId(cpu), config.clone(), hierarchy))
            .collect();
        let loads = scheds.iter().map(Scheduler::load_snapshot).collect();
        Self {
            cpus: scheds.into_iter().map(Mutex::new).collect(),
            loads,
        }
    }

    pub fn nr_cpus(&self) -> u32 {
        self.cpus.len() as u32
    }

    /// Exclusive access to one CPU's scheduler.
    ///
    /// A panic while another caller held the lock does not leave the
    /// scheduler half-updated (operations validate before mutating), so a
    /// poisoned lock is recovered.
    pub fn lock(&self, cpu: CpuId) -> Result<MutexGuard<'_, Scheduler>> {
        let m = self
            .cpus
            .get(cpu.0 as usize)
            .ok_or(SchedError::UnknownCpu(cpu))?;
        Ok(m.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Create `id` under `parent` on every CPU.
    pub fn create_group(&self, id: GroupId, parent: GroupId, load: LoadWeight) -> Result<()> {
        for cpu in 0..self.nr_cpus() {
            self.lock(CpuId(cpu))?.create_group(id, parent, load)?;
        }
        Ok(())
    }

    /// Destroy `id` on every CPU. Fails without changing anything if any
    /// CPU still has tasks or child groups in it.
    pub fn destroy_group(&self, id: GroupId) -> Result<()> {
        for cpu in 0..self.nr_cpus() {
            if id == GroupId::ROOT || self.lock(CpuId(cpu))?.group_in_use(id)? {
                return Err(SchedError::GroupNotEmpty(id));
            }
        }
        for cpu in 0..self.nr_cpus() {
            self.lock(CpuId(cpu))?.destroy_group(id)?;
        }
        Ok(())
    }

    /// Move `pid` from CPU `from` into `target`.
    ///
    /// Same-CPU requests only change the task's group. Cross-CPU requests
    /// lock both schedulers, lower CPU id first.
    pub fn request_migration(&self, pid: Pid, from: CpuId, target: QueueId) -> Result<()> {
        if from == target.cpu {
            return self.lock(from)?.move_task(pid, target.group);
        }
        let (lo, hi) = if from < target.cpu {
            (from, target.cpu)
        } else {
            (target.cpu, from)
        };
        let mut lo_guard = self.lock(lo)?;
        let mut hi_guard = self.lock(hi)?;
        let (src, dst) = if from == lo {
            (&mut *lo_guard, &mut *hi_guard)
        } else {
            (&mut *hi_guard, &mut *lo_guard)
        };
        debug!(pid = %pid, from = %from, to = %target, "migration request");
        migrate_task(src, dst, pid, target.group)
    }

    /// Last published load of `cpu`. Does not take the scheduler lock.
    pub fn load(&self, cpu: CpuId) -> Result<LoadSample> {
        self.loads
            .get(cpu.0 as usize)
            .map(|l| l.read())
            .ok_or(SchedError::UnknownCpu(cpu))
    }

    /// CPU with the highest published load average; ties go to the lowest
    /// id.
    pub fn busiest_cpu(&self) -> Option<CpuId> {
        self.loads
            .iter()
            .enumerate()
            .max_by_key(|(i, l)| {
                let s = l.read();
                (s.load_avg, s.nr_running, std::cmp::Reverse(*i))
            })
            .map(|(i, _)| CpuId(i as u32))
    }

    /// CPU with the lowest published load average; ties go to the lowest
    /// id.
    pub fn idlest_cpu(&self) -> Option<CpuId> {
        self.loads
            .iter()
            .enumerate()
            .min_by_key(|(i, l)| {
                let s = l.read();
                (s.load_avg, s.nr_running, *i)
            })
            .map(|(i, _)| CpuId(i as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weight::SchedPolicy;

    #[test]
    fn test_migration_between_cpus() {
        let sys = System::new(2, SchedConfig::default());
        sys.create_group(GroupId(2), GroupId::ROOT, LoadWeight::default())
            .unwrap();
        {
            let mut cpu0 = sys.lock(CpuId(0)).unwrap();
            cpu0.add_task(Pid(1), 0, SchedPolicy::Normal, GroupId::ROOT)
                .unwrap();
            cpu0.on_task_wakes(Pid(1)).unwrap();
            cpu0.on_clock_advance(1_000_000);
        }
        sys.request_migration(Pid(1), CpuId(0), QueueId { cpu: CpuId(1), group: GroupId(2) })
            .unwrap();

        assert!(sys.lock(CpuId(0)).unwrap().entity(Pid(1)).is_none());
        let cpu1 = sys.lock(CpuId(1)).unwrap();
        let se = cpu1.entity(Pid(1)).unwrap();
        assert!(se.on_rq());
        assert_eq!(se.nr_migrations(), 1);
        assert_eq!(se.depth(), 1);
        assert_eq!(cpu1.nr_running(), 1);
        assert_eq!(sys.load(CpuId(1)).unwrap().nr_running, 1);
        assert_eq!(sys.load(CpuId(0)).unwrap().nr_running, 0);
    }

    #[test]
    fn test_reverse_order_migration() {
        let sys = System::new(3, SchedConfig::default());
        sys.lock(CpuId(2))
            .unwrap()
            .add_task(Pid(7), 0, SchedPolicy::Normal, GroupId::ROOT)
            .unwrap();
        sys.request_migration(Pid(7), CpuId(2), QueueId::root(CpuId(0)))
            .unwrap();
        assert!(sys.lock(CpuId(0)).unwrap().entity(Pid(7)).is_some());

        // Same-CPU request changes nothing but the group.
        sys.request_migration(Pid(7), CpuId(0), QueueId::root(CpuId(0)))
            .unwrap();
        assert_eq!(
            sys.request_migration(Pid(7), CpuId(1), QueueId::root(CpuId(0))),
            Err(SchedError::UnknownTask(Pid(7)))
        );
        assert!(matches!(
            sys.lock(CpuId(3)),
            Err(SchedError::UnknownCpu(CpuId(3)))
        ));
    }

    #[test]
    fn test_busiest_and_idlest() {
        let sys = System::new(3, SchedConfig::default());
        for pid in 1..=2 {
            let mut cpu1 = sys.lock(CpuId(1)).unwrap();
            cpu1.add_task(Pid(pid), 0, SchedPolicy::Normal, GroupId::ROOT)
                .unwrap();
            cpu1.on_task_wakes(Pid(pid)).unwrap();
        }
        {
            let mut cpu2 = sys.lock(CpuId(2)).unwrap();
            cpu2.add_task(Pid(3), 0, SchedPolicy::Normal, GroupId::ROOT)
                .unwrap();
            cpu2.on_task_wakes(Pid(3)).unwrap();
            cpu2.on_clock_advance(100_000_000);
        }
        sys.lock(CpuId(1)).unwrap().on_clock_advance(100_000_000);
        assert_eq!(sys.busiest_cpu(), Some(CpuId(1)));
        assert_eq!(sys.idlest_cpu(), Some(CpuId(0)));
    }

    #[test]
    fn test_destroy_group_checks_every_cpu() {
        let sys = System::new(2, SchedConfig::default());
        sys.create_group(GroupId(2), GroupId::ROOT, LoadWeight::default())
            .unwrap();
        sys.lock(CpuId(1))
            .unwrap()
            .add_task(Pid(1), 0, SchedPolicy::Normal, GroupId(2))
            .unwrap();
        assert_eq!(
            sys.destroy_group(GroupId(2)),
            Err(SchedError::GroupNotEmpty(GroupId(2)))
        );
        assert!(sys.lock(CpuId(0)).unwrap().queue(GroupId(2)).is_some());

        sys.lock(CpuId(1)).unwrap().remove_task(Pid(1)).unwrap();
        sys.destroy_group(GroupId(2)).unwrap();
        assert!(sys.lock(CpuId(0)).unwrap().queue(GroupId(2)).is_none());
        assert!(sys.lock(CpuId(1)).unwrap().queue(GroupId(2)).is_none());
    }
}
