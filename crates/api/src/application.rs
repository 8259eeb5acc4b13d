use std::sync::Arc;

use actix_web::{middleware::Logger, web, App, HttpServer};
use clap::Parser;
use holder_watch_domain::{
    config::{hydrate_env_file, AppConfig, ConfigError},
    services::telemetry::{init_telemetry, TelemetryConfig, TelemetryError, TelemetryGuard},
    FailureCache, HolderCache, Mint,
};
use holder_watch_monitor::{
    render_summary, HolderFetcher, HolderSource, MonitorError, MonitorLoop, MonitorMetrics,
    Refresher, RpcHolderSource,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    cli::Cli,
    handlers::{health_handler, holders_handler, metrics_handler, stats_handler, tokens_handler},
    state::AppState,
};

/// Route table shared by the binary and the handler tests.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_handler))
        .route("/holders/{mint}", web::get().to(holders_handler))
        .route("/tokens", web::get().to(tokens_handler))
        .route("/stats", web::get().to(stats_handler))
        .route("/metrics", web::get().to(metrics_handler));
}

pub async fn run() -> Result<(), BootstrapError> {
    hydrate_env_file()?;
    let config = AppConfig::from_raw(Cli::parse().into_raw())?;

    let telemetry_config = TelemetryConfig::from_env("HOLDER_WATCH").with_json(config.json_log());
    let telemetry = init_telemetry(&telemetry_config)?;

    let source = RpcHolderSource::new(config.rpc().clone())?;
    match source.health_check().await {
        Ok(slot) => info!(url = config.rpc().url(), slot, "rpc endpoint reachable"),
        Err(err) => warn!(url = config.rpc().url(), %err, "rpc health check failed, continuing"),
    }

    let fetcher = HolderFetcher::new(
        Arc::new(HolderCache::new(config.cache_ttl())),
        Arc::new(FailureCache::default()),
        Arc::new(source),
        config.rpc().fetch_budget(),
    );
    let refresher = Refresher::new(fetcher.clone(), config.cache_ttl()).spawn();

    let server = match config.api() {
        Some(api) => {
            let state = AppState::new(fetcher.clone(), telemetry.clone());
            let mut server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(state.clone()))
                    .wrap(Logger::default())
                    .configure(routes)
            });
            // The monitor loop owns Ctrl+C when it runs.
            if config.monitor_enabled() {
                server = server.disable_signals();
            }
            let server = server.bind(api.socket_address())?.run();
            info!(address = %api.socket_address(), "api listening");
            Some(server)
        }
        None => None,
    };

    if config.monitor_enabled() {
        let handle = server.as_ref().map(|server| server.handle());
        let server_task = server.map(actix_web::rt::spawn);

        let monitor = MonitorLoop::new(
            fetcher.clone(),
            config.primary_mint().clone(),
            config.poll_interval(),
        )
        .with_structured(telemetry.structured());
        info!("press Ctrl+C to stop and view metrics");
        let metrics = monitor.run_until(shutdown_signal()).await;
        report_summary(config.primary_mint(), &metrics, &telemetry);

        if let Some(handle) = handle {
            handle.stop(true).await;
        }
        if let Some(task) = server_task {
            match task.await {
                Ok(result) => result?,
                Err(err) => warn!(%err, "api server task ended abnormally"),
            }
        }
    } else if let Some(server) = server {
        warm_primary(&fetcher, config.primary_mint());
        server.await?;
    }

    refresher.abort();
    Ok(())
}

/// Registers the configured mint so the refresher tracks it from the start.
fn warm_primary(fetcher: &HolderFetcher, mint: &Mint) {
    let fetcher = fetcher.clone();
    let mint = mint.clone();
    tokio::spawn(async move {
        if let Err(err) = fetcher.lookup(&mint).await {
            warn!(mint = %mint, %err, "initial fetch failed");
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "failed to listen for Ctrl+C; running until killed");
        std::future::pending::<()>().await;
    }
}

fn report_summary(mint: &Mint, metrics: &MonitorMetrics, telemetry: &TelemetryGuard) {
    if telemetry.structured() {
        info!(
            mint = %mint,
            polls = metrics.total_polls,
            failed_polls = metrics.failed_polls,
            min_holders = ?metrics.min_holders,
            max_holders = ?metrics.max_holders,
            average_holders = metrics.average_holders(),
            alerts = metrics.alerts.len(),
            "final metrics"
        );
    } else {
        println!("\n{}", render_summary(mint, metrics));
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("monitor error: {0}")]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
