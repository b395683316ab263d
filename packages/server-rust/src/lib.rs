//! Portico server: the call interceptor pipeline, listen ports and the
//! lifecycle supervisor that runs them.

pub mod lifecycle;
pub mod network;
pub mod service;
pub mod telemetry;

pub use lifecycle::{LifecycleError, Lifetime, Server};
pub use network::{ListenPort, PortConfig, ServerConfig, ServiceInfo};
pub use service::{ConnectHub, RpcService};
