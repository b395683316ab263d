//! Demo server: one greeting RPC service, a plain HTTP route and a
//! heartbeat background task.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use clap::Parser;
use portico_core::{CallContext, FieldDescriptor, MessageDescriptor, RpcError, Schema};
use portico_server::lifecycle::{ExitProcess, Lifetime};
use portico_server::network::{fallible, PortConfig, ServerConfig, ServiceInfo};
use portico_server::service::{ConnectHub, RpcService};
use portico_server::telemetry::{self, TelemetryConfig};
use portico_server::Server;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

#[derive(Debug, Parser)]
#[command(name = "portico-demo", about = "Portico demo server")]
struct Args {
    /// Interface to listen on.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Primary port. `PORT` in the environment takes precedence.
    #[arg(long, default_value_t = portico_server::network::DEFAULT_PRIMARY_PORT)]
    port: u16,

    /// Health and metrics port.
    #[arg(long, env = "INTERNAL_PORT", default_value_t = portico_server::network::DEFAULT_INTERNAL_PORT)]
    internal_port: u16,

    /// Serve health and metrics on the primary port only.
    #[arg(long)]
    no_internal_port: bool,

    /// Seconds granted to the shutdown sequence.
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 25)]
    shutdown_timeout_secs: u64,

    /// Additional CORS origin for the RPC service (repeatable).
    #[arg(long = "cors-origin")]
    cors_origins: Vec<String>,

    /// Seconds between heartbeat log lines.
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Exit with status 70 on a fatal configuration error instead of
    /// draining the ports first.
    #[arg(long)]
    exit_on_fatal: bool,
}

static GREET_REQUEST: MessageDescriptor = MessageDescriptor {
    name: "portico.demo.v1.GreetRequest",
    fields: &[
        FieldDescriptor::string("name"),
        FieldDescriptor::string("api_key").sensitive(),
    ],
};

#[derive(Debug, Serialize, Deserialize)]
struct GreetRequest {
    name: String,
    #[serde(default)]
    api_key: String,
}

impl Schema for GreetRequest {
    fn descriptor() -> &'static MessageDescriptor {
        &GREET_REQUEST
    }
}

#[derive(Debug, Serialize)]
struct GreetResponse {
    greeting: String,
}

async fn greet(_ctx: CallContext, req: Arc<GreetRequest>) -> Result<GreetResponse, RpcError> {
    if req.api_key.is_empty() {
        return Err(RpcError::unauthenticated("api_key is required"));
    }
    if req.name.trim().is_empty() {
        return Err(RpcError::invalid_argument("name must not be empty"));
    }
    Ok(GreetResponse {
        greeting: format!("Hello, {}!", req.name.trim()),
    })
}

async fn uptime(_req: Request, started: tokio::time::Instant) -> anyhow::Result<Response> {
    Ok(format!("up {}s\n", started.elapsed().as_secs()).into_response())
}

async fn heartbeat(lifetime: Lifetime, every: Duration) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = lifetime.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                metrics::counter!("portico_demo_heartbeats_total").increment(1);
                debug!("Heartbeat");
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let service = ServiceInfo::from_env();

    let telemetry = TelemetryConfig::from_env(&service);
    if let Err(e) = telemetry::init_tracing(&telemetry) {
        eprintln!("Failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }
    #[cfg(feature = "sentry")]
    let _sentry = telemetry::init_sentry(&telemetry);

    let config = ServerConfig {
        service,
        primary: PortConfig::primary(args.port).with_host(&args.host),
        internal: (!args.no_internal_port)
            .then(|| PortConfig::internal(args.internal_port).with_host(&args.host)),
        shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        cors_origins: args.cors_origins,
        metrics_on_primary: args.no_internal_port,
        ..ServerConfig::default()
    };

    let mut server = Server::new(config);

    let greeter = RpcService::new("portico.demo.v1.GreeterService").unary("Greet", greet);
    let hub = if args.exit_on_fatal {
        ConnectHub::new(server.interceptors().clone(), Arc::new(ExitProcess))
            .with_cors_origins(server.config().cors_origins.iter().cloned())
    } else {
        server.connect_hub()
    };
    hub.mount(server.primary(), greeter);

    let started = tokio::time::Instant::now();
    let uptime_route = fallible(server.interceptors(), move |req: Request| uptime(req, started));
    server.primary().route("/uptime", get(uptime_route));

    let every = Duration::from_secs(args.heartbeat_secs.max(1));
    server.go("heartbeat", move |lifetime| heartbeat(lifetime, every));

    match server.serve().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Server stopped with an error");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}
