//! eevdfsim - pit nice levels against each other on simulated CPUs.
//!
//! Spawns `--flood` CPU-bound tasks per `--nice` level, runs them under the
//! fair scheduler for `--duration`, and reports each task's CPU share next
//! to the share its weight entitles it to.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;

use scx_eevdf::scenario::parse_duration_ns;
use scx_eevdf::weight::is_valid_nice;
use scx_eevdf::{
    workloads, CpuId, LoadWeight, Pid, Scenario, SchedConfig, SimFormat, Simulator, TaskDef,
    TimeNs,
};

/// Compare CPU shares of tasks at different nice levels.
#[derive(Debug, Parser)]
#[command(name = "eevdfsim", version, about)]
struct Cli {
    /// Nice level of a task set. Repeat to compare several levels.
    #[arg(
        short,
        long = "nice",
        value_parser = parse_nice,
        allow_negative_numbers = true,
        default_values_t = vec![0, 5]
    )]
    nice: Vec<i32>,

    /// Number of tasks spawned at each nice level.
    #[arg(long, default_value_t = 1)]
    flood: u32,

    /// Number of simulated CPUs. Tasks are spread over them round-robin.
    #[arg(short, long, default_value_t = 1)]
    cpus: u32,

    /// Simulated time to run for ("1s", "500ms", "100us"; bare numbers are
    /// nanoseconds).
    #[arg(short, long, default_value = "1s", value_parser = parse_duration_ns)]
    duration: TimeNs,

    /// Scheduler tunables as inline JSON, or "f:<path>" to read them from a
    /// file.
    #[arg(long, env = "EEVDFSIM_CONFIG")]
    config: Option<String>,

    /// Print the final scheduling statistics of every task.
    #[arg(long)]
    display_sched: bool,

    /// Print trace events to stderr.
    #[arg(long)]
    dump_trace: bool,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

fn parse_nice(s: &str) -> Result<i32, String> {
    let nice: i32 = s.parse().map_err(|_| format!("not an integer: {s:?}"))?;
    if !is_valid_nice(nice) {
        return Err(format!("invalid nice level {nice}, must be within -20..=19"));
    }
    Ok(nice)
}

#[derive(Debug, Serialize)]
struct TaskReport {
    pid: Pid,
    name: String,
    nice: i32,
    cpu: CpuId,
    runtime_ns: TimeNs,
    /// Percent of its CPU's time the task received.
    share: f64,
    /// Percent its weight entitles it to among the tasks on its CPU.
    expected: f64,
    nr_switches: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = match &cli.config {
        Some(input) => SchedConfig::parse(input).context("invalid --config")?,
        None => SchedConfig::default(),
    };
    if cli.flood == 0 {
        bail!("--flood must be at least 1");
    }
    if cli.cpus == 0 {
        bail!("--cpus must be at least 1");
    }

    let defs = workloads::flood(&cli.nice, cli.flood, cli.cpus, Pid(1));
    let mut builder = Scenario::builder()
        .cpus(cli.cpus)
        .config(config)
        .duration_ns(cli.duration);
    for def in defs.iter().cloned() {
        builder = builder.task(def);
    }
    let scenario = builder.build();

    let trace = Simulator::new(scenario)
        .run()
        .context("simulation failed")?;
    if cli.dump_trace {
        trace.dump();
    }

    let mut cpu_weight: BTreeMap<CpuId, u64> = BTreeMap::new();
    for def in &defs {
        *cpu_weight.entry(def.cpu).or_default() += weight_of(def)?;
    }
    let mut reports = Vec::with_capacity(defs.len());
    for def in &defs {
        let weight = weight_of(def)?;
        let total = cpu_weight.get(&def.cpu).copied().unwrap_or(weight).max(1);
        let runtime_ns = trace.total_runtime(def.pid);
        reports.push(TaskReport {
            pid: def.pid,
            name: def.name.clone(),
            nice: def.nice,
            cpu: def.cpu,
            runtime_ns,
            share: 100.0 * runtime_ns as f64 / cli.duration.max(1) as f64,
            expected: 100.0 * weight as f64 / total as f64,
            nr_switches: trace.snapshot(def.pid).map_or(0, |s| s.nr_switches),
        });
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        println!(
            "{:>6} {:<12} {:>5} {:>4} {:>14} {:>8} {:>9} {:>9}",
            "pid", "name", "nice", "cpu", "runtime_ns", "share%", "expected%", "switches"
        );
        for r in &reports {
            println!(
                "{:>6} {:<12} {:>5} {:>4} {:>14} {:>8.2} {:>9.2} {:>9}",
                r.pid.0, r.name, r.nice, r.cpu.0, r.runtime_ns, r.share, r.expected, r.nr_switches
            );
        }
    }

    if cli.display_sched {
        for snapshot in trace.snapshots() {
            println!("\n{snapshot}");
        }
    }
    Ok(())
}

fn weight_of(def: &TaskDef) -> Result<u64> {
    Ok(LoadWeight::for_policy(def.policy, def.nice)?.weight)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(SimFormat)
        .try_init();
}
