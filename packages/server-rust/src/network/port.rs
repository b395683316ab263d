//! Listen ports with deferred startup and two-phase shutdown.
//!
//! A port collects routes while `Unbound`, binds its socket in `bind()`,
//! and starts the accept loop on the runtime in `serve()`. Shutdown is
//! split so a supervisor can order it across ports: `drain()` stops
//! accepting new connections, `close(deadline)` waits for in-flight work
//! and force-closes whatever is left at the deadline.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, MethodRouter};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::config::{PortConfig, PortRole, ServiceInfo};
use super::handler::std_layers;
use super::handlers::{health_handler, metrics_handler, HEALTH_PATH, METRICS_PATH};
use super::middleware::track_in_flight;
use super::shutdown::{LocalAddr, PortState, PortStatus};
use crate::service::middleware::CALL_DEADLINE_CEILING;

/// Time granted to requests after a forced close before the port reports
/// `Closed` anyway.
const FORCED_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Errors raised while bringing a port up.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("port {port}: cannot bind {address}")]
    Bind {
        port: String,
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("port {port}: cannot read the bound address")]
    LocalAddr {
        port: String,
        #[source]
        source: std::io::Error,
    },
    #[error("port {port} is already serving")]
    AlreadyServing { port: String },
    #[error("port {port} is {state} and cannot serve")]
    Stopped { port: String, state: PortState },
}

/// A listener supplied by the caller instead of binding `host:port`.
#[derive(Debug)]
pub enum Binding {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl Binding {
    fn local_addr(&self) -> std::io::Result<LocalAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr().map(LocalAddr::Tcp),
            #[cfg(unix)]
            Self::Unix(listener) => listener.local_addr().map(|addr| {
                LocalAddr::Unix(
                    addr.as_pathname()
                        .map(PathBuf::from)
                        .unwrap_or_default(),
                )
            }),
        }
    }
}

struct Running {
    task: JoinHandle<std::io::Result<()>>,
    drain: CancellationToken,
}

/// One HTTP listener and the routes it serves.
///
/// Every port answers `GET /health`; ports with a metrics handle also
/// answer `GET /metrics`. Both paths are reserved.
pub struct ListenPort {
    config: PortConfig,
    service: Arc<ServiceInfo>,
    ceiling: Duration,
    metrics: Option<PrometheusHandle>,
    router: Router,
    binding: Option<Binding>,
    status: PortStatus,
    running: Option<Running>,
}

impl ListenPort {
    /// Creates an unbound port without `/metrics`. [`crate::Server`] attaches
    /// a handle to internal ports when it starts serving.
    #[must_use]
    pub fn new(config: PortConfig, service: Arc<ServiceInfo>) -> Self {
        Self {
            config,
            service,
            ceiling: CALL_DEADLINE_CEILING,
            metrics: None,
            router: Router::new(),
            binding: None,
            status: PortStatus::new(),
            running: None,
        }
    }

    /// Serves on `binding` instead of binding the configured address.
    #[must_use]
    pub fn with_binding(mut self, binding: Binding) -> Self {
        self.binding = Some(binding);
        self
    }

    /// Exposes `/metrics` from `handle` on this port, whatever its role.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub(crate) fn has_metrics(&self) -> bool {
        self.metrics.is_some()
    }

    pub(crate) fn set_metrics(&mut self, handle: PrometheusHandle) {
        self.metrics = Some(handle);
    }

    /// Timeout applied to routers mounted with [`ListenPort::nest_http`].
    #[must_use]
    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn role(&self) -> PortRole {
        self.config.role
    }

    #[must_use]
    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    /// Shared status handle; stays valid after the port is moved.
    #[must_use]
    pub fn status(&self) -> PortStatus {
        self.status.clone()
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<LocalAddr> {
        self.status.local_addr().cloned()
    }

    /// Replaces the configured TCP port. Ignored once bound or when a
    /// binding was supplied.
    pub(crate) fn override_port(&mut self, port: u16) {
        if self.binding.is_none() && self.status.state() == PortState::Unbound {
            self.config.port = port;
        }
    }

    // -- handler tree --------------------------------------------------------

    /// Adds a route.
    pub fn route(&mut self, path: &str, method_router: MethodRouter) -> &mut Self {
        self.extend(|router| router.route(path, method_router))
    }

    /// Mounts `router` under `path`. `"/"` and `""` merge at the root.
    pub fn nest(&mut self, path: &str, router: Router) -> &mut Self {
        if path.is_empty() || path == "/" {
            return self.merge(router);
        }
        self.extend(|outer| outer.nest(path, router))
    }

    /// Like [`ListenPort::nest`], for plain handlers: adds the ceiling
    /// timeout and panic recovery.
    pub fn nest_http(&mut self, path: &str, router: Router) -> &mut Self {
        let router = router.layer(std_layers(self.ceiling));
        self.nest(path, router)
    }

    pub fn merge(&mut self, router: Router) -> &mut Self {
        self.extend(|outer| outer.merge(router))
    }

    fn extend(&mut self, add: impl FnOnce(Router) -> Router) -> &mut Self {
        if self.running.is_some() {
            warn!(port = %self.config.name, "Ignoring routes added after the port started serving");
            return self;
        }
        self.router = add(std::mem::take(&mut self.router));
        self
    }

    // -- lifecycle -----------------------------------------------------------

    /// Binds the listener. A supplied binding is used as is.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn bind(&mut self) -> Result<(), PortError> {
        if self.status.state() != PortState::Unbound {
            return Ok(());
        }
        let binding = match self.binding.take() {
            Some(binding) => binding,
            None => {
                let address = self.config.address();
                let listener =
                    TcpListener::bind(&address)
                        .await
                        .map_err(|source| PortError::Bind {
                            port: self.config.name.clone(),
                            address,
                            source,
                        })?;
                Binding::Tcp(listener)
            }
        };
        let local = binding.local_addr().map_err(|source| PortError::LocalAddr {
            port: self.config.name.clone(),
            source,
        })?;

        info!(port = %self.config.name, address = %local, "Listener bound");
        self.status.set_bound(local);
        self.binding = Some(binding);
        Ok(())
    }

    /// Starts the accept loop on the runtime, binding first if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails, or the port is already serving or
    /// shutting down.
    pub async fn serve(&mut self) -> Result<(), PortError> {
        if self.running.is_some() {
            return Err(PortError::AlreadyServing {
                port: self.config.name.clone(),
            });
        }
        match self.status.state() {
            PortState::Unbound => self.bind().await?,
            PortState::Bound => {}
            state @ (PortState::Draining | PortState::Closed) => {
                return Err(PortError::Stopped {
                    port: self.config.name.clone(),
                    state,
                })
            }
        }
        let Some(binding) = self.binding.take() else {
            return Err(PortError::Stopped {
                port: self.config.name.clone(),
                state: self.status.state(),
            });
        };

        let app = self.app();
        let drain = CancellationToken::new();
        let signal = drain.clone().cancelled_owned();
        let task = match binding {
            Binding::Tcp(listener) => tokio::spawn(async move {
                axum::serve(
                    listener,
                    app.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(signal)
                .await
            }),
            #[cfg(unix)]
            Binding::Unix(listener) => tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(signal)
                    .await
            }),
        };

        info!(
            port = %self.config.name,
            metrics = self.metrics.is_some(),
            "Serving"
        );
        self.running = Some(Running { task, drain });
        Ok(())
    }

    /// Final router: user routes plus `/health`, optionally `/metrics`,
    /// in-flight tracking and request tracing.
    fn app(&mut self) -> Router {
        let mut router = std::mem::take(&mut self.router).route(
            HEALTH_PATH,
            get(health_handler).with_state(Arc::clone(&self.service)),
        );
        if let Some(handle) = &self.metrics {
            router = router.route(METRICS_PATH, get(metrics_handler).with_state(handle.clone()));
        }
        router
            .layer(axum::middleware::from_fn_with_state(
                self.status.clone(),
                track_in_flight,
            ))
            .layer(TraceLayer::new_for_http().on_failure(()))
    }

    /// Stops accepting new connections. In-flight requests keep running.
    pub fn drain(&mut self) {
        let ticket = self.status.begin_drain();
        if let Some(running) = &self.running {
            running.drain.cancel();
        }
        info!(
            port = %self.config.name,
            ticket,
            in_flight = self.status.in_flight_count(),
            "Draining"
        );
    }

    /// Waits for open connections to finish until `deadline`, then cuts
    /// whatever is left. Returns whether anything had to be cut.
    pub async fn close(&mut self, deadline: Instant) -> bool {
        let forced = match self.running.take() {
            None => {
                self.binding = None;
                false
            }
            Some(Running { mut task, drain }) => {
                drain.cancel();
                let forced = match tokio::time::timeout_at(deadline, &mut task).await {
                    Ok(Ok(Ok(()))) => false,
                    Ok(Ok(Err(e))) => {
                        warn!(port = %self.config.name, error = %e, "Listener stopped with an error");
                        false
                    }
                    Ok(Err(e)) => {
                        warn!(port = %self.config.name, error = %e, "Listener task failed");
                        false
                    }
                    Err(_) => true,
                };
                self.status.force();
                task.abort();
                if !self.status.wait_for_drain(FORCED_CLOSE_GRACE).await {
                    warn!(
                        port = %self.config.name,
                        in_flight = self.status.in_flight_count(),
                        "Requests still running after forced close"
                    );
                }
                forced
            }
        };

        self.status.set_closed();
        if forced {
            metrics::counter!("portico_port_forced_closes_total", "port" => self.config.name.clone())
                .increment(1);
            warn!(port = %self.config.name, "Port force-closed at the shutdown deadline");
        } else {
            info!(port = %self.config.name, "Port closed");
        }
        forced
    }

    /// [`ListenPort::drain`] followed by [`ListenPort::close`].
    pub async fn shutdown(&mut self, deadline: Instant) -> bool {
        self.drain();
        self.close(deadline).await
    }
}

impl std::fmt::Debug for ListenPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenPort")
            .field("config", &self.config)
            .field("state", &self.status.state())
            .field("metrics", &self.metrics.is_some())
            .field("serving", &self.running.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
