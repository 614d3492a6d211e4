//! Scheduler tunables.
//!
//! Configuration is JSON, either inline or read from a file with an `f:` /
//! `file:` prefix. Missing fields take their defaults, so `{}` is a valid
//! configuration.

use std::fs;
use std::io::Read;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::types::TimeNs;

/// Which entities `pick_next` may choose before falling back to the
/// earliest deadline overall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityPolicy {
    /// Eligible iff `vruntime` is at or below the load-weighted average
    /// vruntime of the queue (zero or positive lag in EEVDF terms).
    #[default]
    WeightedAverage,
    /// Every queued entity is eligible: plain earliest-virtual-deadline.
    Disabled,
}

/// How lag stored at dequeue is applied when the entity is placed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LagPolicy {
    /// Inflate the stored lag by `(W + w) / W` so that, after the entity's
    /// own weight is added to the average, its effective lag is the stored
    /// one (W: load already queued, w: the entity's weight).
    #[default]
    Preserve,
    /// Apply the stored lag unchanged: `vruntime = avg + vlag`.
    Plain,
    /// Ignore stored lag; every wakeup is placed at the average.
    Discard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedConfig {
    /// Period over which every runnable entity should run once; slices are
    /// this period split by weight.
    pub target_latency_ns: TimeNs,
    /// Lower bound on any slice.
    pub min_granularity_ns: TimeNs,
    /// A woken or queued entity must beat the running entity's deadline by
    /// this much (real time, scaled by the candidate's weight) to preempt.
    pub wakeup_granularity_ns: TimeNs,
    /// Tick period. Also the lower bound of the lag clamp.
    pub tick_ns: TimeNs,
    /// Half-life of the load, runnable and utilization averages.
    pub avg_half_life_ns: TimeNs,
    /// Entities off-queue for longer than this lose their stored lag and
    /// are placed at no earlier than the queue average.
    pub stale_sleep_ns: TimeNs,
    pub eligibility: EligibilityPolicy,
    pub lag: LagPolicy,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            target_latency_ns: 6_000_000,
            min_granularity_ns: 750_000,
            wakeup_granularity_ns: 1_000_000,
            tick_ns: 4_000_000,
            avg_half_life_ns: 32_000_000,
            stale_sleep_ns: 60_000_000_000,
            eligibility: EligibilityPolicy::default(),
            lag: LagPolicy::default(),
        }
    }
}

impl SchedConfig {
    pub fn parse(input: &str) -> Result<Self> {
        let config: SchedConfig = if let Some(path) = input
            .strip_prefix("f:")
            .or_else(|| input.strip_prefix("file:"))
        {
            let mut f = fs::OpenOptions::new()
                .read(true)
                .open(path)
                .with_context(|| format!("failed to open config file {path:?}"))?;
            let mut content = String::new();
            f.read_to_string(&mut content)?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse config file {path:?}"))?
        } else {
            serde_json::from_str(input).context("failed to parse inline config")?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_granularity_ns == 0 {
            bail!("min_granularity_ns must be non-zero");
        }
        if self.target_latency_ns < self.min_granularity_ns {
            bail!(
                "target_latency_ns ({}) must not be below min_granularity_ns ({})",
                self.target_latency_ns,
                self.min_granularity_ns
            );
        }
        if self.avg_half_life_ns == 0 {
            bail!("avg_half_life_ns must be non-zero");
        }
        if self.tick_ns == 0 {
            bail!("tick_ns must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SchedConfig::default();
        config.validate().unwrap();
        assert_eq!(SchedConfig::parse("{}").unwrap(), config);
    }

    #[test]
    fn test_parse_inline() {
        let config = SchedConfig::parse(
            r#"{"target_latency_ns": 24, "min_granularity_ns": 1, "lag": "discard",
                "eligibility": "disabled"}"#,
        )
        .unwrap();
        assert_eq!(config.target_latency_ns, 24);
        assert_eq!(config.min_granularity_ns, 1);
        assert_eq!(config.lag, LagPolicy::Discard);
        assert_eq!(config.eligibility, EligibilityPolicy::Disabled);
        assert_eq!(config.tick_ns, SchedConfig::default().tick_ns);
    }

    #[test]
    fn test_parse_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"wakeup_granularity_ns": 0, "lag": "plain"}}"#).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        for prefix in ["f:", "file:"] {
            let config = SchedConfig::parse(&format!("{prefix}{path}")).unwrap();
            assert_eq!(config.wakeup_granularity_ns, 0);
            assert_eq!(config.lag, LagPolicy::Plain);
        }
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(SchedConfig::parse(r#"{"min_granularity_ns": 0}"#).is_err());
        assert!(
            SchedConfig::parse(r#"{"target_latency_ns": 10, "min_granularity_ns": 20}"#).is_err()
        );
        assert!(SchedConfig::parse(r#"{"lag": "sometimes"}"#).is_err());
        assert!(SchedConfig::parse("f:/nonexistent/eevdf.json").is_err());
    }
}
