//! scx_eevdf - weighted virtual-time fair scheduling core.
//!
//! Decides which runnable task a CPU runs next and for how long, so that
//! long-run CPU share is proportional to task weight and latency stays
//! bounded. Tasks are picked by *earliest eligible virtual deadline first*:
//! among the entities that have not received more than their fair share,
//! the one whose current request ends soonest in virtual time wins.
//!
//! # Architecture
//!
//! - **Weights** ([`weight`]): nice level and policy to load weight, and
//!   real to virtual time scaling.
//! - **Entities** ([`entity`]): per-task and per-group accounting.
//! - **Run-queues** ([`rq`]): one level of the hierarchy on one CPU; an
//!   augmented balanced tree ordered by virtual deadline.
//! - **Groups**: nested run-queues joined by group entities.
//! - **Scheduler** ([`sched`]): the per-CPU driver reacting to clock,
//!   wake-up and block events.
//! - **System** ([`system`]): per-CPU schedulers behind mutexes, with
//!   ordered-lock migration and lock-free load snapshots.
//! - **Simulator** ([`engine`], [`scenario`], [`task`], [`trace`]):
//!   deterministic event-driven harness with scripted tasks.
//!
//! # Usage
//!
//! ```rust,no_run
//! use scx_eevdf::*;
//!
//! let scenario = Scenario::builder()
//!     .cpus(1)
//!     .add_task("heavy", -3, workloads::cpu_bound(10_000_000))
//!     .add_task("light", 0, workloads::cpu_bound(10_000_000))
//!     .duration_ms(500)
//!     .build();
//!
//! let trace = Simulator::new(scenario).run().unwrap();
//! println!("{}", trace.total_runtime(Pid(1)));
//! ```

pub mod avg;
pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod fmt;
mod group;
pub mod rq;
pub mod scenario;
pub mod sched;
pub mod system;
pub mod task;
pub mod trace;
mod tree;
pub mod types;
pub mod weight;
pub mod workloads;

pub use avg::{LoadSample, LoadSnapshot};
pub use config::{EligibilityPolicy, LagPolicy, SchedConfig};
pub use engine::Simulator;
pub use entity::{EntityKind, EntitySnapshot, EntityState, SchedEntity};
pub use error::{Result, SchedError};
pub use fmt::SimFormat;
pub use rq::FairRunQueue;
pub use scenario::{parse_duration_ns, Scenario};
pub use sched::{migrate_task, Scheduler};
pub use system::System;
pub use task::{Phase, RepeatMode, TaskBehavior, TaskDef};
pub use trace::{Trace, TraceEvent, TraceKind};
pub use types::{CpuId, EntityId, GroupId, Pid, QueueId, TimeNs, Vtime};
pub use weight::{cgroup_weight_to_load, LoadWeight, SchedPolicy};
