//! Running statistics and console formatting for the monitor loop.

use std::{fmt::Write as _, time::Duration};

use chrono::{DateTime, Utc};
use holder_watch_domain::Mint;

/// Percentage growth between two readings that raises an alert.
pub const GROWTH_ALERT_PERCENT: f64 = 50.0;
/// Percentage drop between two readings that raises an alert.
pub const DROP_ALERT_PERCENT: f64 = -20.0;

/// One reading compared with the one before it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HolderStats {
    pub count: u64,
    pub observed_at: DateTime<Utc>,
    pub change: i64,
    pub change_percent: f64,
}

pub fn calculate_stats(
    count: u64,
    previous: Option<u64>,
    observed_at: DateTime<Utc>,
) -> HolderStats {
    let (change, change_percent) = match previous {
        None => (0, 0.0),
        Some(prev) => {
            let change = if count >= prev {
                i64::try_from(count - prev).unwrap_or(i64::MAX)
            } else {
                i64::try_from(prev - count).map_or(i64::MIN, |drop| -drop)
            };
            let percent = match (prev, count) {
                (0, 0) => 0.0,
                // Any holders where there were none counts as full growth.
                (0, _) => 100.0,
                _ => change as f64 / prev as f64 * 100.0,
            };
            (change, percent)
        }
    };

    HolderStats {
        count,
        observed_at,
        change,
        change_percent,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    Growth,
    Drop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub kind: AlertKind,
    pub previous: u64,
    pub current: u64,
    pub change: i64,
    pub change_percent: f64,
}

impl Alert {
    pub fn message(&self) -> String {
        let label = match self.kind {
            AlertKind::Growth => "significant growth",
            AlertKind::Drop => "significant drop",
        };
        format!(
            "{label}: {:+} holders ({:+.1}%) | {} -> {}",
            self.change, self.change_percent, self.previous, self.current
        )
    }
}

/// Alert raised by `stats` relative to `previous`, if any.
pub fn check_alerts(stats: &HolderStats, previous: Option<u64>) -> Option<Alert> {
    let previous = previous?;
    let kind = if stats.change_percent >= GROWTH_ALERT_PERCENT {
        AlertKind::Growth
    } else if stats.change_percent <= DROP_ALERT_PERCENT {
        AlertKind::Drop
    } else {
        return None;
    };
    Some(Alert {
        kind,
        previous,
        current: stats.count,
        change: stats.change,
        change_percent: stats.change_percent,
    })
}

/// Aggregates over every successful poll of one monitor run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorMetrics {
    pub min_holders: Option<u64>,
    pub max_holders: Option<u64>,
    pub total_polls: u64,
    pub failed_polls: u64,
    sum_holders: u128,
    pub alerts: Vec<Alert>,
}

impl MonitorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, count: u64) {
        self.min_holders = Some(self.min_holders.map_or(count, |min| min.min(count)));
        self.max_holders = Some(self.max_holders.map_or(count, |max| max.max(count)));
        self.total_polls += 1;
        self.sum_holders += u128::from(count);
    }

    pub fn record_failure(&mut self) {
        self.failed_polls += 1;
    }

    pub fn push_alert(&mut self, alert: Alert) {
        self.alerts.push(alert);
    }

    pub fn average_holders(&self) -> f64 {
        if self.total_polls == 0 {
            return 0.0;
        }
        self.sum_holders as f64 / self.total_polls as f64
    }
}

fn format_change(stats: &HolderStats) -> String {
    let mut out = match stats.change {
        0 => "±0".to_string(),
        change => format!("{change:+}"),
    };
    if stats.change_percent != 0.0 {
        let _ = write!(out, " ({:+.1}%)", stats.change_percent);
    }
    out
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// `MINT: <id> | Holders: <n> | Δ: <±d> (<±p%>) | Time: <UTC> | Fetch: <s>s`
pub fn format_status_line(mint: &Mint, stats: &HolderStats, elapsed: Duration) -> String {
    format!(
        "MINT: {mint} | Holders: {} | Δ: {} | Time: {} | Fetch: {:.2}s",
        stats.count,
        format_change(stats),
        format_timestamp(stats.observed_at),
        elapsed.as_secs_f64()
    )
}

/// Multi-line summary printed when the monitor stops.
pub fn render_summary(mint: &Mint, metrics: &MonitorMetrics) -> String {
    let rule = "=".repeat(80);
    let mut out = String::new();
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "FINAL METRICS for {mint}");
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "Total polls: {}", metrics.total_polls);
    if metrics.failed_polls > 0 {
        let _ = writeln!(out, "Failed polls: {}", metrics.failed_polls);
    }
    if let Some(min) = metrics.min_holders {
        let _ = writeln!(out, "Min holders: {min}");
    }
    if let Some(max) = metrics.max_holders {
        let _ = writeln!(out, "Max holders: {max}");
    }
    let _ = writeln!(out, "Average holders: {:.2}", metrics.average_holders());
    if !metrics.alerts.is_empty() {
        let _ = writeln!(out, "\nALERTS TRIGGERED:");
        for alert in &metrics.alerts {
            let _ = writeln!(out, "  - {}", alert.message());
        }
    }
    let _ = write!(out, "{rule}");
    out
}
