//! Network and server configuration types.

use std::time::Duration;

use tracing::warn;

use crate::service::middleware::CALL_DEADLINE_CEILING;

/// Port served when nothing else is configured.
pub const DEFAULT_PRIMARY_PORT: u16 = 8080;
/// Port of the internal (health and metrics) listener.
pub const DEFAULT_INTERNAL_PORT: u16 = 8000;
/// Bound on the whole shutdown sequence.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(25);

/// Environment variable overriding the primary port.
pub const PORT_ENV: &str = "PORT";
/// Environment variable enabling the Sentry reporter.
pub const SENTRY_DSN_ENV: &str = "SENTRY_DSN";

/// Identity of the running service, reported by `/health`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    /// Running on a developer machine: verbose errors, human-readable logs.
    pub local: bool,
}

impl ServiceInfo {
    /// Reads `SERVICE_NAME` (or `K_SERVICE`), `VERSION` (or `K_REVISION`)
    /// and `LOCAL_DEVELOPMENT`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServiceInfo::from_env`] over an arbitrary lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let first = |keys: &[&str]| {
            keys.iter()
                .find_map(|key| lookup(key).filter(|value| !value.is_empty()))
        };
        Self {
            name: first(&["SERVICE_NAME", "K_SERVICE"]).unwrap_or(defaults.name),
            version: first(&["VERSION", "K_REVISION"]).unwrap_or(defaults.version),
            local: lookup("LOCAL_DEVELOPMENT").is_some_and(|value| is_truthy(&value)),
        }
    }
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            local: false,
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Whether a port carries application traffic or only operational routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRole {
    Primary,
    /// Health and metrics; drained first on shutdown.
    Internal,
}

/// Where one listener binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    /// Used in logs.
    pub name: String,
    pub host: String,
    /// 0 means OS-assigned.
    pub port: u16,
    pub role: PortRole,
}

impl PortConfig {
    #[must_use]
    pub fn primary(port: u16) -> Self {
        Self {
            name: "primary".to_string(),
            host: "0.0.0.0".to_string(),
            port,
            role: PortRole::Primary,
        }
    }

    #[must_use]
    pub fn internal(port: u16) -> Self {
        Self {
            name: "internal".to_string(),
            host: "0.0.0.0".to_string(),
            port,
            role: PortRole::Internal,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Top-level configuration of a [`crate::lifecycle::Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub service: ServiceInfo,
    pub primary: PortConfig,
    /// `None` disables the internal port; metrics then need
    /// `metrics_on_primary`.
    pub internal: Option<PortConfig>,
    pub shutdown_timeout: Duration,
    /// Per-call deadline ceiling.
    pub call_ceiling: Duration,
    /// Extra CORS origins for RPC services.
    pub cors_origins: Vec<String>,
    /// Serve `/metrics` on the primary port too, for hosts that expose a
    /// single port.
    pub metrics_on_primary: bool,
    /// Apply the `PORT` environment override when serving.
    pub port_from_env: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service: ServiceInfo::default(),
            primary: PortConfig::primary(DEFAULT_PRIMARY_PORT),
            internal: Some(PortConfig::internal(DEFAULT_INTERNAL_PORT)),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            call_ceiling: CALL_DEADLINE_CEILING,
            cors_origins: Vec::new(),
            metrics_on_primary: false,
            port_from_env: true,
        }
    }
}

/// Reads the `PORT` override. Unparsable values are ignored with a warning.
#[must_use]
pub fn port_override() -> Option<u16> {
    parse_port(std::env::var(PORT_ENV).ok().as_deref())
}

fn parse_port(value: Option<&str>) -> Option<u16> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    match value.parse() {
        Ok(port) => Some(port),
        Err(e) => {
            warn!(value, error = %e, "Ignoring invalid {PORT_ENV}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.primary.port, 8080);
        assert_eq!(config.internal.as_ref().map(|p| p.port), Some(8000));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(25));
        assert_eq!(config.call_ceiling, Duration::from_secs(29));
        assert!(!config.metrics_on_primary);
        assert!(config.port_from_env);
    }

    #[test]
    fn service_info_prefers_explicit_names() {
        let info = ServiceInfo::from_lookup(lookup(&[
            ("SERVICE_NAME", "billing"),
            ("K_SERVICE", "billing-knative"),
            ("K_REVISION", "billing-00042"),
        ]));
        assert_eq!(info.name, "billing");
        assert_eq!(info.version, "billing-00042");
        assert!(!info.local);
    }

    #[test]
    fn service_info_falls_back_to_package() {
        let info = ServiceInfo::from_lookup(lookup(&[("SERVICE_NAME", "")]));
        assert_eq!(info, ServiceInfo::default());
    }

    #[test]
    fn local_development_flag() {
        assert!(ServiceInfo::from_lookup(lookup(&[("LOCAL_DEVELOPMENT", "true")])).local);
        assert!(ServiceInfo::from_lookup(lookup(&[("LOCAL_DEVELOPMENT", "1")])).local);
        assert!(!ServiceInfo::from_lookup(lookup(&[("LOCAL_DEVELOPMENT", "no")])).local);
    }

    #[test]
    fn port_parsing() {
        assert_eq!(parse_port(Some("9090")), Some(9090));
        assert_eq!(parse_port(Some(" 81 ")), Some(81));
        assert_eq!(parse_port(Some("")), None);
        assert_eq!(parse_port(Some("http")), None);
        assert_eq!(parse_port(Some("70000")), None);
        assert_eq!(parse_port(None), None);
    }

    #[test]
    fn port_config_address() {
        let config = PortConfig::internal(0).with_host("127.0.0.1");
        assert_eq!(config.address(), "127.0.0.1:0");
        assert_eq!(config.role, PortRole::Internal);
    }
}
