use std::{env, net::SocketAddr, sync::Arc};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{get_optional_var, hydrate_env_file};

static SUBSCRIBER_INSTALLED: OnceCell<()> = OnceCell::new();
static METRICS_HANDLE: OnceCell<Arc<PrometheusHandle>> = OnceCell::new();

/// Shared observability options for binaries.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    log_filter: String,
    metrics_address: Option<String>,
    json: bool,
}

impl TelemetryConfig {
    /// Loads telemetry knobs from optional environment variables prefixed with
    /// `<PREFIX>_`, e.g. `HOLDER_WATCH_LOG_FILTER`. Missing entries fall back
    /// to defaults so binaries boot without extra configuration.
    pub fn from_env(prefix: &str) -> Self {
        let _ = hydrate_env_file();
        let upper = prefix.trim().to_ascii_uppercase();
        let log_filter = env::var(format!("{upper}_LOG_FILTER"))
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "info".to_string());
        let metrics_address = get_optional_var(&format!("{upper}_METRICS_ADDRESS"));
        let json = env::var(format!("{upper}_JSON_LOG"))
            .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Self {
            log_filter,
            metrics_address,
            json,
        }
    }

    /// Forces machine-readable log output regardless of the environment.
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = self.json || json;
        self
    }

    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    pub fn metrics_address(&self) -> Option<&str> {
        self.metrics_address.as_deref()
    }

    pub fn json(&self) -> bool {
        self.json
    }
}

/// Guard returned after telemetry initialization.
#[derive(Clone)]
pub struct TelemetryGuard {
    metrics: Arc<PrometheusHandle>,
    json: bool,
}

impl TelemetryGuard {
    pub fn render_metrics(&self) -> String {
        self.metrics.render()
    }

    /// Whether log records are emitted as JSON; console reporters switch to
    /// structured records instead of printing lines.
    pub fn structured(&self) -> bool {
        self.json
    }
}

/// Centralized helper to wire up tracing + metrics exporters once per process.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    install_tracing(config)?;
    let metrics = install_metrics(config)?;

    Ok(TelemetryGuard {
        metrics,
        json: config.json(),
    })
}

fn install_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    if SUBSCRIBER_INSTALLED.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_new(config.log_filter())
        .map_err(|err| TelemetryError::InvalidLogFilter(err.to_string()))?;

    if SUBSCRIBER_INSTALLED.set(()).is_ok() {
        let (plain, json) = if config.json() {
            (None, Some(tracing_subscriber::fmt::layer().json().with_target(true)))
        } else {
            (Some(tracing_subscriber::fmt::layer().with_target(true)), None)
        };
        tracing_subscriber::registry()
            .with(env_filter)
            .with(plain)
            .with(json)
            .try_init()
            .map_err(|err| TelemetryError::Tracing(err.to_string()))?;
    }

    Ok(())
}

fn install_metrics(config: &TelemetryConfig) -> Result<Arc<PrometheusHandle>, TelemetryError> {
    METRICS_HANDLE
        .get_or_try_init(|| match config.metrics_address() {
            Some(addr) => {
                let socket: SocketAddr =
                    addr.parse().map_err(|err: std::net::AddrParseError| {
                        TelemetryError::InvalidMetricsAddress(addr.to_string(), err.to_string())
                    })?;
                spawn_listener(socket)
            }
            None => PrometheusBuilder::new()
                .install_recorder()
                .map(Arc::new)
                .map_err(|err| TelemetryError::Metrics(err.to_string())),
        })
        .cloned()
}

/// Installs the recorder and serves scrapes on `socket` from the current
/// tokio runtime.
fn spawn_listener(socket: SocketAddr) -> Result<Arc<PrometheusHandle>, TelemetryError> {
    let runtime = Handle::try_current()
        .map_err(|_| TelemetryError::Metrics("metrics listener needs a tokio runtime".into()))?;

    let (recorder, exporter) = PrometheusBuilder::new()
        .with_http_listener(socket)
        .build()
        .map_err(|err| TelemetryError::Metrics(err.to_string()))?;
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|err| TelemetryError::Metrics(err.to_string()))?;

    runtime.spawn(async move {
        if let Err(err) = exporter.await {
            error!(?err, "metrics listener stopped");
        }
    });
    info!(address = %socket, "metrics listener started");
    Ok(Arc::new(handle))
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    InvalidLogFilter(String),
    #[error("failed to install tracing subscriber: {0}")]
    Tracing(String),
    #[error("invalid metrics address `{0}`: {1}")]
    InvalidMetricsAddress(String, String),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_GUARD: Mutex<()> = Mutex::new(());

    fn clear(prefix: &str) {
        env::set_var("HOLDER_WATCH_SKIP_DOTENV", "1");
        env::remove_var(format!("{prefix}_LOG_FILTER"));
        env::remove_var(format!("{prefix}_METRICS_ADDRESS"));
        env::remove_var(format!("{prefix}_JSON_LOG"));
    }

    #[test]
    fn telemetry_config_uses_defaults() {
        let _guard = ENV_GUARD.lock().unwrap();
        clear("TELEMETRY_DEFAULTS");

        let cfg = TelemetryConfig::from_env("telemetry_defaults");
        assert_eq!(cfg.log_filter(), "info");
        assert_eq!(cfg.metrics_address(), None);
        assert!(!cfg.json());
    }

    #[test]
    fn telemetry_config_reads_env() {
        let _guard = ENV_GUARD.lock().unwrap();
        clear("TELEMETRY_ENV");
        env::set_var("TELEMETRY_ENV_LOG_FILTER", "debug");
        env::set_var("TELEMETRY_ENV_METRICS_ADDRESS", "127.0.0.1:9898");
        env::set_var("TELEMETRY_ENV_JSON_LOG", "true");

        let cfg = TelemetryConfig::from_env("TELEMETRY_ENV");
        assert_eq!(cfg.log_filter(), "debug");
        assert_eq!(cfg.metrics_address(), Some("127.0.0.1:9898"));
        assert!(cfg.json());
        clear("TELEMETRY_ENV");
    }

    #[test]
    fn empty_metrics_address_is_treated_as_none() {
        let _guard = ENV_GUARD.lock().unwrap();
        clear("TELEMETRY_EMPTY");
        env::set_var("TELEMETRY_EMPTY_METRICS_ADDRESS", "  ");
        let cfg = TelemetryConfig::from_env("TELEMETRY_EMPTY");
        assert_eq!(cfg.metrics_address(), None);
        clear("TELEMETRY_EMPTY");
    }

    fn scrape(address: &str) -> String {
        use std::{
            io::{Read, Write},
            net::TcpStream,
            time::Duration,
        };

        let mut stream = TcpStream::connect(address).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn configured_address_serves_scrapes() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let address = format!("127.0.0.1:{port}");
        let cfg = TelemetryConfig {
            log_filter: "info".into(),
            metrics_address: Some(address.clone()),
            json: false,
        };

        let guard = init_telemetry(&cfg).expect("telemetry installs");
        metrics::counter!("holder_listener_scrapes_total").increment(1);

        let response = tokio::task::spawn_blocking(move || scrape(&address))
            .await
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("holder_listener_scrapes_total"));
        assert!(guard
            .render_metrics()
            .contains("holder_listener_scrapes_total"));
    }

    #[test]
    fn json_flag_only_turns_structured_output_on() {
        let _guard = ENV_GUARD.lock().unwrap();
        clear("TELEMETRY_FLAG");
        let cfg = TelemetryConfig::from_env("TELEMETRY_FLAG").with_json(true);
        assert!(cfg.json());
        assert!(cfg.with_json(false).json());
    }
}
