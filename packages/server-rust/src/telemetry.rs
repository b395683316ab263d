//! Logging, metrics and error-tracking setup.
//!
//! Library code only emits `tracing` events and `metrics` samples; the
//! binary decides where they go by calling [`init_tracing`] and, with the
//! `sentry` feature, [`init_sentry`].

use std::sync::{Arc, OnceLock};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::network::config::{ServiceInfo, SENTRY_DSN_ENV};
use crate::service::report::{ErrorReporter, NoopReporter};

/// Telemetry configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Filter used when `RUST_LOG` is not set.
    pub default_filter: String,
    /// JSON lines instead of compact human-readable output.
    pub json_logs: bool,
    pub sentry_dsn: Option<String>,
    pub release: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            json_logs: true,
            sentry_dsn: None,
            release: None,
        }
    }
}

impl TelemetryConfig {
    /// Production hosts get JSON logs, developer machines compact ones.
    /// `SENTRY_DSN` enables error tracking.
    #[must_use]
    pub fn from_env(service: &ServiceInfo) -> Self {
        Self {
            json_logs: !service.local,
            sentry_dsn: std::env::var(SENTRY_DSN_ENV)
                .ok()
                .filter(|dsn| !dsn.is_empty()),
            release: Some(format!("{}@{}", service.name, service.version)),
            ..Self::default()
        }
    }
}

/// Installs the global subscriber: `RUST_LOG` (or the default filter) and
/// JSON or compact output.
///
/// # Errors
///
/// Returns an error if the filter does not parse or a global subscriber is
/// already installed.
pub fn init_tracing(config: &TelemetryConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_filter))?
        .add_directive("hyper=info".parse()?)
        .add_directive("h2=info".parse()?)
        .add_directive("tower=info".parse()?);

    let fmt_layer = if config.json_logs {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).compact().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

/// Starts the Sentry client when a DSN is configured. Keep the guard alive
/// for the process lifetime; dropping it flushes pending events.
#[cfg(feature = "sentry")]
#[must_use]
pub fn init_sentry(config: &TelemetryConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry_dsn.as_deref()?;

    let guard = sentry::init((
        dsn,
        sentry::ClientOptions {
            release: config.release.clone().map(Into::into),
            attach_stacktrace: true,
            send_default_pii: false,
            ..Default::default()
        },
    ));

    if guard.is_enabled() {
        tracing::info!("Sentry initialized");
        Some(guard)
    } else {
        warn!("Sentry DSN provided but client not enabled");
        None
    }
}

/// Reporter matching the process setup: Sentry when a client is bound,
/// otherwise nothing.
#[must_use]
pub fn default_reporter() -> Arc<dyn ErrorReporter> {
    #[cfg(feature = "sentry")]
    {
        let enabled = sentry::Hub::current()
            .client()
            .is_some_and(|client| client.is_enabled());
        if enabled {
            return Arc::new(crate::service::report::SentryReporter);
        }
    }
    Arc::new(NoopReporter)
}

static PROMETHEUS: OnceLock<PrometheusHandle> = OnceLock::new();

/// Handle of the process-wide Prometheus recorder, installed on first use.
///
/// If another recorder is already installed the handle still renders, but
/// only what was recorded through it (nothing).
#[must_use]
pub fn prometheus_handle() -> PrometheusHandle {
    PROMETHEUS
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if let Err(e) = metrics::set_global_recorder(recorder) {
                warn!(error = %e, "Metrics recorder already installed; /metrics will be empty");
            }
            handle
        })
        .clone()
}
