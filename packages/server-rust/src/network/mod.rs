//! Listen ports, their configuration, shutdown state and HTTP middleware.

pub mod config;
pub mod handler;
pub mod handlers;
pub mod middleware;
pub mod port;
pub mod shutdown;

pub use config::{
    port_override, PortConfig, PortRole, ServerConfig, ServiceInfo, DEFAULT_INTERNAL_PORT,
    DEFAULT_PRIMARY_PORT, DEFAULT_SHUTDOWN_TIMEOUT,
};
pub use handler::{error_page, fallible, std_layers};
pub use port::{Binding, ListenPort, PortError};
pub use shutdown::{InFlightGuard, LocalAddr, PortState, PortStatus};
