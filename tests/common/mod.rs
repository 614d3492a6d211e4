use scx_eevdf::{CpuId, GroupId, Pid, SchedPolicy, TaskBehavior, TaskDef};

/// Initialize tracing from `RUST_LOG`.
///
/// `try_init()` is idempotent: the first call in the process installs the
/// subscriber, later calls are ignored.
pub fn setup_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(scx_eevdf::SimFormat)
        .with_test_writer()
        .try_init();
}

/// A normal-policy task on CPU 0 in the root group.
#[allow(dead_code)]
pub fn task(pid: i32, nice: i32, behavior: TaskBehavior) -> TaskDef {
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
