use std::{
    future::Future,
    time::{Duration, Instant},
};

use holder_watch_domain::Mint;
use metrics::{counter, gauge, histogram};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::{
    fetcher::HolderFetcher,
    stats::{calculate_stats, check_alerts, format_status_line, HolderStats, MonitorMetrics},
};

/// Polls slower than this are called out in the log.
const SLOW_POLL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Periodically polls one mint and reports the change between readings.
pub struct MonitorLoop {
    fetcher: HolderFetcher,
    mint: Mint,
    interval: Duration,
    structured: bool,
}

impl MonitorLoop {
    pub fn new(fetcher: HolderFetcher, mint: Mint, interval: Duration) -> Self {
        Self {
            fetcher,
            mint,
            interval,
            structured: false,
        }
    }

    /// Emit readings as log records instead of console lines.
    pub fn with_structured(mut self, structured: bool) -> Self {
        self.structured = structured;
        self
    }

    /// Polls on every interval until `shutdown` resolves, then returns the
    /// aggregates of the run. Failed polls are logged and do not stop it.
    pub async fn run_until<F>(self, shutdown: F) -> MonitorMetrics
    where
        F: Future<Output = ()>,
    {
        let mut metrics = MonitorMetrics::new();
        let mut previous = None;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(mint = %self.mint, interval = ?self.interval, "monitor loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = &mut shutdown => break,
                reading = self.poll_once(previous, &mut metrics) => {
                    previous = reading.or(previous);
                }
            }
        }
        info!(mint = %self.mint, polls = metrics.total_polls, "monitor loop stopped");
        metrics
    }

    /// One reading; returns the new count or `None` when the fetch failed.
    pub async fn poll_once(
        &self,
        previous: Option<u64>,
        metrics: &mut MonitorMetrics,
    ) -> Option<u64> {
        let started = Instant::now();
        let entry = match self.fetcher.poll(&self.mint).await {
            Ok(entry) => entry,
            Err(err) => {
                metrics.record_failure();
                counter!("holder_monitor_polls_total", "result" => "error").increment(1);
                error!(mint = %self.mint, %err, "failed to fetch holder count");
                return None;
            }
        };
        let elapsed = started.elapsed();
        counter!("holder_monitor_polls_total", "result" => "ok").increment(1);
        histogram!("holder_monitor_poll_seconds").record(elapsed.as_secs_f64());
        gauge!("holder_monitor_holders").set(entry.holder_count as f64);

        if elapsed > SLOW_POLL {
            warn!(mint = %self.mint, elapsed = ?elapsed, "slow holder poll");
        }

        let stats = calculate_stats(entry.holder_count, previous, entry.last_updated);
        metrics.record(entry.holder_count);
        if let Some(alert) = check_alerts(&stats, previous) {
            warn!(mint = %self.mint, alert = %alert.message(), "holder alert");
            metrics.push_alert(alert);
        }
        self.report(&stats, elapsed);

        Some(entry.holder_count)
    }

    fn report(&self, stats: &HolderStats, elapsed: Duration) {
        if self.structured {
            info!(
                mint = %self.mint,
                holders = stats.count,
                change = stats.change,
                change_percent = stats.change_percent,
                observed_at = %stats.observed_at.to_rfc3339(),
                fetch_secs = elapsed.as_secs_f64(),
                "holder count"
            );
        } else {
            println!("{}", format_status_line(&self.mint, stats, elapsed));
        }
    }
}
