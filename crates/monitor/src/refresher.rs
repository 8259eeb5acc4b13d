//! Background refresh of every tracked mint.

use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::{
    task::{JoinHandle, JoinSet},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::fetcher::{HolderFetcher, RefreshOutcome};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub failed: usize,
    /// Mints whose fetch was already running elsewhere.
    pub skipped: usize,
}

#[derive(Clone)]
pub struct Refresher {
    fetcher: HolderFetcher,
    period: Duration,
}

impl Refresher {
    pub fn new(fetcher: HolderFetcher, period: Duration) -> Self {
        Self { fetcher, period }
    }

    /// Refreshes every mint known to the cache once. Each mint is fetched in
    /// its own task so a slow mint only delays its own result.
    pub async fn refresh_once(&self) -> RefreshReport {
        let mints = self.fetcher.cache().list_identifiers();
        let started = Instant::now();
        let mut tasks = JoinSet::new();
        for mint in mints {
            let fetcher = self.fetcher.clone();
            tasks.spawn(async move {
                let outcome = fetcher.refresh(&mint).await;
                (mint, outcome)
            });
        }

        let mut report = RefreshReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((mint, RefreshOutcome::Refreshed(count))) => {
                    report.refreshed += 1;
                    counter!("holder_refresh_total", "result" => "ok").increment(1);
                    debug!(mint = %mint, holders = count, "refreshed");
                }
                Ok((mint, RefreshOutcome::Failed(err))) => {
                    report.failed += 1;
                    counter!(
                        "holder_refresh_total",
                        "result" => err.kind().as_ref().to_owned()
                    )
                    .increment(1);
                    warn!(mint = %mint, %err, "refresh failed, keeping last value");
                }
                Ok((_, RefreshOutcome::Skipped)) => {
                    report.skipped += 1;
                    counter!("holder_refresh_total", "result" => "skipped").increment(1);
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(%err, "refresh task aborted");
                }
            }
        }

        histogram!("holder_refresh_cycle_seconds").record(started.elapsed().as_secs_f64());
        report
    }

    /// Ticks forever. Every cycle runs in its own task, so a cycle that
    /// outlives the period does not delay the next tick; mints it still holds
    /// are skipped by the next cycle.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; values are fresh at startup.
        ticker.tick().await;
        info!(period = ?self.period, "refresher started");

        loop {
            ticker.tick().await;
            let refresher = self.clone();
            tokio::spawn(async move {
                let report = refresher.refresh_once().await;
                if report.refreshed + report.failed + report.skipped > 0 {
                    info!(
                        refreshed = report.refreshed,
                        failed = report.failed,
                        skipped = report.skipped,
                        "refresh cycle finished"
                    );
                }
            });
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
