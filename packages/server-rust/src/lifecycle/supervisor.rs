//! The server: ports, background tasks and the shutdown sequence.
//!
//! Follows the deferred startup pattern:
//! 1. `Server::new()` -- creates the shared cancellation token and the ports
//! 2. configuration -- routes, RPC services and background tasks are added
//! 3. `serve()` -- binds every port, starts everything, and blocks until
//!    shutdown has completed
//!
//! Shutdown is triggered by SIGINT/SIGTERM, [`StopHandle::stop`], the first
//! background-task failure, or a fatal configuration error. It cancels the
//! shared token, drains internal ports before primary ones, and closes
//! everything against one deadline.

use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use metrics_exporter_prometheus::PrometheusHandle;
use portico_core::ConfigError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fatal::{FatalHandler, ShutdownOnFatal, FATAL_EXIT_CODE};
use super::signals::shutdown_signal;
use super::tasks::{BackgroundTask, FnTask, Lifetime, TaskFailure, TaskGroup, TaskHandle};
use crate::network::config::{port_override, PortConfig, PortRole, ServerConfig, SENTRY_DSN_ENV};
use crate::network::port::{ListenPort, PortError};
use crate::service::hub::ConnectHub;
use crate::service::middleware::InterceptorConfig;
use crate::service::report::ErrorReporter;

/// Why [`Server::serve`] returned an error.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// A port could not be bound or started.
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    TaskFailed(#[from] TaskFailure),
    /// A call revealed a build-time misconfiguration.
    #[error("fatal configuration error")]
    Misconfigured(#[from] ConfigError),
}

impl LifecycleError {
    /// Process exit status for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Misconfigured(_) => FATAL_EXIT_CODE,
            Self::Port(_) | Self::TaskFailed(_) => 1,
        }
    }
}

/// Where the server is in its life.
///
/// State machine: Configured -> Serving -> ShuttingDown -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Accepting ports, routes and tasks.
    Configured,
    /// Every port bound, every task started.
    Serving,
    ShuttingDown,
    Stopped,
}

/// Stops a running server from anywhere.
#[derive(Debug, Clone)]
pub struct StopHandle {
    token: CancellationToken,
    state: Arc<ArcSwap<SupervisorState>>,
}

impl StopHandle {
    /// Starts the shutdown sequence. Idempotent.
    pub fn stop(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn state(&self) -> SupervisorState {
        **self.state.load()
    }
}

struct PendingTask {
    task: Box<dyn BackgroundTask>,
    handle: TaskHandle,
}

/// Owns the listen ports and background tasks of one process.
pub struct Server {
    config: ServerConfig,
    token: CancellationToken,
    state: Arc<ArcSwap<SupervisorState>>,
    fatal: ShutdownOnFatal,
    interceptors: InterceptorConfig,
    metrics: Option<PrometheusHandle>,
    ports: Vec<ListenPort>,
    tasks: Vec<PendingTask>,
}

impl Server {
    /// Creates the shared token, the primary port and (unless disabled) the
    /// internal port.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let token = CancellationToken::new();
        let interceptors = InterceptorConfig {
            ceiling: config.call_ceiling,
            verbose_errors: config.service.local,
            reporter: crate::telemetry::default_reporter(),
        };

        let mut server = Self {
            fatal: ShutdownOnFatal::new(token.clone()),
            token,
            state: Arc::new(ArcSwap::from_pointee(SupervisorState::Configured)),
            interceptors,
            metrics: None,
            ports: Vec::new(),
            tasks: Vec::new(),
            config,
        };

        let primary = server.new_port(server.config.primary.clone());
        server.ports.push(primary);
        if let Some(internal) = server.config.internal.clone() {
            let internal = server.new_port(internal);
            server.ports.push(internal);
        }
        server
    }

    fn new_port(&self, config: PortConfig) -> ListenPort {
        ListenPort::new(config, Arc::new(self.config.service.clone()))
            .with_ceiling(self.config.call_ceiling)
    }

    /// Sends every reportable failure to `reporter` instead of the default.
    ///
    /// Affects hubs created afterwards.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.interceptors.reporter = reporter;
        self
    }

    /// Serves `/metrics` from `handle` instead of installing the
    /// process-wide Prometheus recorder at startup.
    #[must_use]
    pub fn with_metrics_handle(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn interceptors(&self) -> &InterceptorConfig {
        &self.interceptors
    }

    /// The port application traffic arrives on.
    pub fn primary(&mut self) -> &mut ListenPort {
        // `Server::new` always pushes the primary port first.
        &mut self.ports[0]
    }

    /// The health and metrics port, unless disabled.
    pub fn internal(&mut self) -> Option<&mut ListenPort> {
        self.ports
            .iter_mut()
            .find(|port| port.role() == PortRole::Internal)
    }

    /// Looks a port up by its configured name.
    pub fn port(&mut self, name: &str) -> Option<&mut ListenPort> {
        self.ports.iter_mut().find(|port| port.name() == name)
    }

    /// Adds a port bound from `config`.
    pub fn add_port(&mut self, config: PortConfig) -> &mut ListenPort {
        let port = self.new_port(config);
        self.add_listen_port(port)
    }

    /// Adds a port built by the caller, e.g. one with a supplied
    /// [`crate::network::Binding`].
    pub fn add_listen_port(&mut self, port: ListenPort) -> &mut ListenPort {
        let index = self.ports.len();
        self.ports.push(port);
        &mut self.ports[index]
    }

    /// Registers a closure as a background task.
    pub fn go<F, Fut>(&mut self, name: &str, body: F) -> TaskHandle
    where
        F: FnOnce(Lifetime) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn(FnTask::new(name, body))
    }

    /// Registers a background task, started by [`Server::serve`].
    pub fn spawn(&mut self, task: impl BackgroundTask) -> TaskHandle {
        let handle = TaskHandle::new(task.name());
        self.tasks.push(PendingTask {
            task: Box::new(task),
            handle: handle.clone(),
        });
        handle
    }

    /// Read-only view of the shared cancellation token.
    #[must_use]
    pub fn lifetime(&self) -> Lifetime {
        Lifetime::new(self.token.clone())
    }

    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: self.token.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// A hub that mounts RPC services with this server's interceptors.
    /// Fatal configuration errors shut the server down.
    #[must_use]
    pub fn connect_hub(&self) -> ConnectHub {
        ConnectHub::new(
            self.interceptors.clone(),
            Arc::new(self.fatal.clone()) as Arc<dyn FatalHandler>,
        )
        .with_cors_origins(self.config.cors_origins.iter().cloned())
    }

    /// Serves until SIGINT/SIGTERM or another shutdown trigger.
    ///
    /// # Errors
    ///
    /// See [`Server::serve_until`].
    pub async fn serve(self) -> Result<(), LifecycleError> {
        self.serve_until(shutdown_signal()).await
    }

    /// Serves until `signal` resolves or another shutdown trigger fires,
    /// then shuts down and returns once every port is closed and every task
    /// has returned (or been aborted at the deadline).
    ///
    /// # Errors
    ///
    /// Returns an error if a port cannot be bound or started, or the fatal
    /// cause of the shutdown: the first background-task failure or a fatal
    /// configuration error.
    pub async fn serve_until(
        self,
        signal: impl Future<Output = ()> + Send,
    ) -> Result<(), LifecycleError> {
        let Self {
            config,
            token,
            state,
            fatal,
            metrics,
            mut ports,
            tasks,
            ..
        } = self;

        if config.port_from_env {
            if let Some(port) = port_override() {
                info!(port, "Using the PORT environment override");
                ports[0].override_port(port);
            }
        }
        attach_metrics(&mut ports, config.metrics_on_primary, metrics);
        if std::env::var(SENTRY_DSN_ENV).is_ok_and(|dsn| !dsn.is_empty()) {
            info!("Sentry error reporting enabled");
        }

        if let Err(e) = start_ports(&mut ports).await {
            error!(error = %e, "Startup failed");
            token.cancel();
            let deadline = Instant::now() + config.shutdown_timeout;
            for port in &mut ports {
                port.shutdown(deadline).await;
            }
            state.store(Arc::new(SupervisorState::Stopped));
            return Err(e.into());
        }

        let mut group = TaskGroup::new(token.clone());
        for PendingTask { task, handle } in tasks {
            group.spawn_with(task, handle);
        }
        state.store(Arc::new(SupervisorState::Serving));
        info!(
            service = %config.service.name,
            version = %config.service.version,
            ports = ports.len(),
            tasks = group.len(),
            "Instance initialized successfully"
        );

        tokio::select! {
            () = signal => info!("Shutdown requested"),
            () = token.cancelled() => debug!("Shared token cancelled"),
        }

        state.store(Arc::new(SupervisorState::ShuttingDown));
        token.cancel();
        let deadline = Instant::now() + config.shutdown_timeout;
        info!(timeout = ?config.shutdown_timeout, "Shutting down");

        let forced = shutdown_ports(&mut ports, deadline).await;
        let tasks_result = group.wait_until(deadline).await;
        if forced > 0 {
            warn!(ports = forced, "Ports force-closed at the shutdown deadline");
        }
        state.store(Arc::new(SupervisorState::Stopped));

        if let Some(err) = fatal.take() {
            error!(error = %err, "Stopped after a fatal configuration error");
            return Err(LifecycleError::Misconfigured(err));
        }
        if let Err(failure) = tasks_result {
            error!(task = %failure.task, error = %format!("{:#}", failure.source), "Stopped after a background task failed");
            return Err(LifecycleError::TaskFailed(failure));
        }
        info!("Shutdown complete");
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("service", &self.config.service.name)
            .field("ports", &self.ports)
            .field("tasks", &self.tasks.len())
            .field("state", &**self.state.load())
            .finish_non_exhaustive()
    }
}

/// Gives `/metrics` to internal ports (and the primary one when asked)
/// that were not built with a handle. The global recorder is only
/// installed when one of them needs it and no handle was supplied.
fn attach_metrics(ports: &mut [ListenPort], on_primary: bool, handle: Option<PrometheusHandle>) {
    let wants = |index: usize, port: &ListenPort| {
        !port.has_metrics() && (port.role() == PortRole::Internal || (index == 0 && on_primary))
    };
    if !ports.iter().enumerate().any(|(index, port)| wants(index, port)) {
        return;
    }
    let handle = handle.unwrap_or_else(crate::telemetry::prometheus_handle);
    for (index, port) in ports.iter_mut().enumerate() {
        if wants(index, &*port) {
            port.set_metrics(handle.clone());
        }
    }
}

/// Binds every port, then starts every accept loop.
async fn start_ports(ports: &mut [ListenPort]) -> Result<(), PortError> {
    for port in ports.iter_mut() {
        port.bind().await?;
    }
    for port in ports.iter_mut() {
        port.serve().await?;
    }
    Ok(())
}

/// Drains internal ports, then primary ones, then closes all of them
/// concurrently. Returns how many had to be forced.
async fn shutdown_ports(ports: &mut [ListenPort], deadline: Instant) -> usize {
    for role in [PortRole::Internal, PortRole::Primary] {
        for port in ports.iter_mut().filter(|port| port.role() == role) {
            port.drain();
        }
    }
    futures_util::future::join_all(ports.iter_mut().map(|port| port.close(deadline)))
        .await
        .into_iter()
        .filter(|forced| *forced)
        .count()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::lifecycle::tasks::TaskState;
    use crate::network::shutdown::PortState;

    fn test_config() -> ServerConfig {
        ServerConfig {
            primary: PortConfig::primary(0).with_host("127.0.0.1"),
            internal: Some(PortConfig::internal(0).with_host("127.0.0.1")),
            shutdown_timeout: Duration::from_secs(2),
            port_from_env: false,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn explicit_stop_shuts_everything_down_in_order() {
        let mut server = Server::new(test_config());
        let primary = server.primary().status();
        let internal = server.internal().map(|port| port.status()).unwrap();
        let stop = server.stop_handle();
        assert_eq!(stop.state(), SupervisorState::Configured);

        let ticker = server.go("ticker", |lifetime: Lifetime| async move {
            lifetime.cancelled().await;
            Ok(())
        });

        let serving = tokio::spawn(server.serve_until(std::future::pending()));
        while stop.state() != SupervisorState::Serving {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(primary.state(), PortState::Bound);

        stop.stop();
        serving.await.unwrap().unwrap();

        assert_eq!(stop.state(), SupervisorState::Stopped);
        assert_eq!(primary.state(), PortState::Closed);
        assert_eq!(internal.state(), PortState::Closed);
        assert!(internal.drain_ticket() < primary.drain_ticket());
        assert_eq!(ticker.state(), TaskState::Finished);
    }

    #[tokio::test]
    async fn signal_future_triggers_shutdown() {
        let server = Server::new(test_config());
        let lifetime = server.lifetime();
        server
            .serve_until(tokio::time::sleep(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(lifetime.is_cancelled());
    }

    #[tokio::test]
    async fn first_task_failure_is_the_fatal_cause() {
        let mut server = Server::new(test_config());
        server.go("a", |_lifetime: Lifetime| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(anyhow::anyhow!("a broke"))
        });
        let b = server.go("b", |lifetime: Lifetime| async move {
            lifetime.cancelled().await;
            Ok(())
        });

        let err = server
            .serve_until(std::future::pending())
            .await
            .unwrap_err();
        let LifecycleError::TaskFailed(failure) = err else {
            panic!("expected a task failure, got {err:?}");
        };
        assert_eq!(failure.task, "a");
        assert_eq!(b.state(), TaskState::Finished);
    }

    #[tokio::test]
    async fn bind_failures_stop_the_server() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let busy = taken.local_addr().unwrap().port();
        let mut config = test_config();
        config.internal = Some(PortConfig::internal(busy).with_host("127.0.0.1"));

        let server = Server::new(config);
        let lifetime = server.lifetime();
        let stop = server.stop_handle();
        let err = server
            .serve_until(std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Port(PortError::Bind { .. })));
        assert_eq!(err.exit_code(), 1);
        assert!(lifetime.is_cancelled());
        assert_eq!(stop.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn fatal_configuration_errors_stop_the_server() {
        let server = Server::new(test_config());
        server.connect_hub().fatal_handler().fatal(ConfigError::ServerInterceptorOnClient {
            procedure: "/a.v1.B/C".to_string(),
        });

        let err = server
            .serve_until(std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Misconfigured(_)));
        assert_eq!(err.exit_code(), FATAL_EXIT_CODE);
    }

    #[tokio::test]
    async fn supplied_metrics_handle_is_served_on_the_primary_when_asked() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("portico_supplied_total").increment(1);
        });
        let mut server = Server::new(ServerConfig {
            internal: None,
            metrics_on_primary: true,
            ..test_config()
        })
        .with_metrics_handle(recorder.handle());
        let primary = server.primary().status();
        let stop = server.stop_handle();

        let serving = tokio::spawn(server.serve_until(std::future::pending()));
        while stop.state() != SupervisorState::Serving {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let Some(crate::network::LocalAddr::Tcp(addr)) = primary.local_addr().cloned() else {
            panic!("expected a TCP address");
        };
        let body = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("portico_supplied_total"), "{body}");

        stop.stop();
        serving.await.unwrap().unwrap();
    }

    #[test]
    fn internal_port_can_be_disabled() {
        let mut server = Server::new(ServerConfig {
            internal: None,
            ..test_config()
        });
        assert!(server.internal().is_none());
        server.add_port(PortConfig {
            name: "admin".to_string(),
            ..PortConfig::internal(0)
        });
        assert!(server.port("admin").is_some());
        assert_eq!(server.primary().name(), "primary");
    }
}
