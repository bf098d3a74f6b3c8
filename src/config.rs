//! Service configuration loaded from environment variables or deserialized
//! from an application's own configuration file.
//!
//! # Environment Variables
//!
//! - `RESTARTABLE_PROTOCOL`: `http` or `http2`. Default: `http`
//! - `RESTARTABLE_HOST`: Host used by [`ServiceConfig::bind_options`]. Default: `127.0.0.1`
//! - `RESTARTABLE_PORT`: Port used by [`ServiceConfig::bind_options`]. Default: `0` (ephemeral)
//! - `RESTARTABLE_FORCE_CLOSE_CONNECTIONS`: `never`, `idle` or `all`. Default: `never`

use crate::error::RestartError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use tracing::info;

/// Transport protocol served on the listening socket.
///
/// Both variants are served by the same connection builder, which negotiates
/// HTTP/1.1 or HTTP/2 (prior knowledge) per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Http,
    Http2,
}

impl Protocol {
    /// URL scheme for addresses served with this protocol.
    pub fn scheme(&self) -> &'static str {
        "http"
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Http2 => write!(f, "http2"),
        }
    }
}

impl FromStr for Protocol {
    type Err = RestartError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" | "http1" => Ok(Protocol::Http),
            "http2" | "h2c" => Ok(Protocol::Http2),
            _ => Err(RestartError::UnknownProtocol(s.to_string())),
        }
    }
}

/// What happens to open connections when the socket is finally closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ForceCloseConnections {
    /// Wait until clients hang up, idle keep-alive connections included.
    #[default]
    Never,
    /// Close idle keep-alive connections now and busy ones after their current request.
    Idle,
    /// Abort every connection, in-flight requests included.
    All,
}

impl FromStr for ForceCloseConnections {
    type Err = RestartError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "never" | "false" | "0" => Ok(ForceCloseConnections::Never),
            "idle" => Ok(ForceCloseConnections::Idle),
            "all" | "true" | "1" => Ok(ForceCloseConnections::All),
            other => Err(RestartError::InvalidArgument(format!(
                "force_close_connections must be never, idle or all, got {other}"
            ))),
        }
    }
}

/// Configuration handed to the application factory on every build.
///
/// The instance built by a restart records the configuration it was built
/// with, and that configuration becomes the default for the next restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Transport protocol name, validated when the service is constructed.
    pub protocol: String,
    /// Default host for [`ServiceConfig::bind_options`].
    pub host: String,
    /// Default port for [`ServiceConfig::bind_options`].
    pub port: u16,
    pub force_close_connections: ForceCloseConnections,
    /// Free-form settings passed through to the application.
    pub settings: serde_json::Value,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Http.to_string(),
            host: Ipv4Addr::LOCALHOST.to_string(),
            port: 0,
            force_close_connections: ForceCloseConnections::default(),
            settings: serde_json::Value::Null,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults. Malformed values fail instead of
    /// falling back silently.
    pub fn from_env() -> Result<Self, RestartError> {
        let mut config = Self::default();

        if let Ok(protocol) = std::env::var("RESTARTABLE_PROTOCOL") {
            protocol.parse::<Protocol>()?;
            config.protocol = protocol;
        }

        if let Ok(host) = std::env::var("RESTARTABLE_HOST") {
            config.host = host;
        }

        if let Ok(port) = std::env::var("RESTARTABLE_PORT") {
            config.port = port.parse().map_err(|_| {
                RestartError::InvalidArgument(format!("RESTARTABLE_PORT is not a port: {port}"))
            })?;
        }

        if let Ok(mode) = std::env::var("RESTARTABLE_FORCE_CLOSE_CONNECTIONS") {
            config.force_close_connections = mode.parse()?;
        }

        Ok(config)
    }

    /// Builder-style setter for the protocol name.
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Builder-style setter for the connection close policy.
    pub fn with_force_close_connections(mut self, mode: ForceCloseConnections) -> Self {
        self.force_close_connections = mode;
        self
    }

    /// Builder-style setter for the application settings.
    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = settings;
        self
    }

    /// Parsed protocol, or `UnknownProtocol` if the name is not supported.
    pub fn protocol(&self) -> Result<Protocol, RestartError> {
        self.protocol.parse()
    }

    /// Bind options derived from `host` and `port`.
    pub fn bind_options(&self) -> BindOptions {
        BindOptions::new(self.host.clone(), self.port)
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!("Protocol: {}", self.protocol);
        info!("Default bind: {}:{}", self.host, self.port);
        info!(
            "Force close connections: {:?}",
            self.force_close_connections
        );
    }
}

/// Where to bind the listening socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindOptions {
    pub host: String,
    pub port: u16,
}

impl BindOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to a socket address. `localhost` maps to `127.0.0.1`; any other
    /// host must be an IP literal.
    pub fn resolve(&self) -> Result<SocketAddr, RestartError> {
        let ip = if self.host.eq_ignore_ascii_case("localhost") {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.host.parse::<IpAddr>().map_err(|_| {
                RestartError::InvalidArgument(format!("not an IP address: {}", self.host))
            })?
        };
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Default for BindOptions {
    fn default() -> Self {
        ServiceConfig::default().bind_options()
    }
}
