use holder_watch_domain::{services::telemetry::TelemetryGuard, HolderCache};
use holder_watch_monitor::HolderFetcher;

#[derive(Clone)]
pub struct AppState {
    fetcher: HolderFetcher,
    telemetry: TelemetryGuard,
}

impl AppState {
    pub fn new(fetcher: HolderFetcher, telemetry: TelemetryGuard) -> Self {
        Self { fetcher, telemetry }
    }

    pub fn fetcher(&self) -> &HolderFetcher {
        &self.fetcher
    }

    pub fn cache(&self) -> &HolderCache {
        self.fetcher.cache().as_ref()
    }

    pub fn telemetry(&self) -> &TelemetryGuard {
        &self.telemetry
    }
}
