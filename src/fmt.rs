//! Compact formatting helpers and the simulated-time log formatter.

use std::cell::Cell;
use std::fmt;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

use crate::types::{CpuId, TimeNs};

thread_local! {
    static SIM_CLOCK: Cell<TimeNs> = const { Cell::new(0) };
    static SIM_CPU: Cell<Option<CpuId>> = const { Cell::new(None) };
}

/// Simulated time of the event being processed on this thread.
pub fn sim_clock() -> TimeNs {
    SIM_CLOCK.with(Cell::get)
}

pub fn sim_cpu() -> Option<CpuId> {
    SIM_CPU.with(Cell::get)
}

/// Stamp subsequent log lines on this thread with `now` and `cpu`.
pub fn set_sim_clock(now: TimeNs, cpu: Option<CpuId>) {
    SIM_CLOCK.with(|c| c.set(now));
    SIM_CPU.with(|c| c.set(cpu));
}

/// Displays large round numbers compactly: `20_000_000` as `20M`.
/// Non-round numbers pass through unchanged.
pub struct FmtN(pub u64);

impl fmt::Display for FmtN {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        const SUFFIXES: &[(u64, &str)] = &[
            (1_000_000_000_000, "T"),
            (1_000_000_000, "B"),
            (1_000_000, "M"),
            (1_000, "K"),
        ];
        for &(divisor, suffix) in SUFFIXES {
            if v >= divisor && v % divisor == 0 {
                return write!(f, "{}{}", v / divisor, suffix);
            }
        }
        write!(f, "{v}")
    }
}

/// Nanosecond timestamp, underscore-grouped and right-aligned, with the
/// CPU it was taken on:
///
/// - `[     20_000_000:C1]`
/// - `[     20_000_000:G]` when there is no CPU context
pub struct FmtTs {
    pub ns: TimeNs,
    pub cpu: Option<CpuId>,
}

impl FmtTs {
    pub fn new(ns: TimeNs, cpu: Option<CpuId>) -> Self {
        Self { ns, cpu }
    }
}

impl fmt::Display for FmtTs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let grouped = fmt_grouped(self.ns);
        match self.cpu {
            Some(cpu) => write!(f, "{:>15}:C{}", grouped, cpu.0),
            None => write!(f, "{:>15}:G", grouped),
        }
    }
}

/// Format a u64 with underscore grouping (groups of 3 from the right).
pub(crate) fn fmt_grouped(v: u64) -> String {
    let digits = v.to_string();
    let len = digits.len();
    if len <= 3 {
        return digits;
    }
    let mut result = String::with_capacity(len + (len - 1) / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            result.push('_');
        }
        result.push(ch);
    }
    result
}

/// Event formatter that shows simulated time instead of wall-clock time
/// and uses plain colored text.
pub struct SimFormat;

impl<S, N> FormatEvent<S, N> for SimFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(writer, "[{}] ", FmtTs::new(sim_clock(), sim_cpu()))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::ERROR => "\x1b[31m",
                Level::WARN => "\x1b[33m",
                Level::INFO => "\x1b[32m",
                Level::DEBUG => "\x1b[34m",
                Level::TRACE => "\x1b[35m",
            };
            write!(writer, "{color}{level:>5}\x1b[0m ")?;
        } else {
            write!(writer, "{level:>5} ")?;
        }

        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);
        write!(writer, "{}", visitor.message)?;
        for (key, value) in &visitor.fields {
            write!(writer, " {key}={value}")?;
        }
        writeln!(writer)
    }
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: Vec<(String, String)>,
}

impl FieldCollector {
    fn push(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, FmtN(value).to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, value.to_string());
    }
}
