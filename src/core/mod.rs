/// Core abstractions: endpoints, server descriptions, connections and pools
pub mod connection;
pub mod pool;

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

pub use connection::{
    Connection, ConnectionOptions, ConnectionState, Connector, TcpConnector, Transport,
};
pub use pool::{ConnectionPool, PoolOptions, PoolStats, PooledConnection};

/// Port used when an endpoint string omits one
pub const DEFAULT_PORT: u16 = 27017;

/// Network address of one server process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            // IPv6 literal
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = String;

    /// Parse `host`, `host:port` or `[v6]:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("endpoint cannot be empty".to_string());
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| format!("invalid endpoint '{}': unterminated '['", s))?;
            match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if after.is_empty() => (host, None),
                None => return Err(format!("invalid endpoint '{}'", s)),
            }
        } else {
            let (host, port) = match s.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            };
            if host.contains(':') {
                return Err(format!(
                    "invalid endpoint '{}': IPv6 addresses must be written as [addr]:port",
                    s
                ));
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(format!("invalid endpoint '{}': missing host", s));
        }

        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| format!("invalid endpoint '{}': bad port '{}'", s, port))?,
            None => DEFAULT_PORT,
        };

        Ok(Endpoint::new(host, port))
    }
}

/// Last observed reachability of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unknown,
    Connected,
    Unreachable,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Unknown => write!(f, "Unknown"),
            ServerState::Connected => write!(f, "Connected"),
            ServerState::Unreachable => write!(f, "Unreachable"),
        }
    }
}

/// Role a server advertised in its last handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    Primary,
    Secondary,
    Standalone,
    Unknown,
}

impl ServerRole {
    pub fn is_writable(&self) -> bool {
        matches!(self, ServerRole::Primary | ServerRole::Standalone)
    }

    pub fn is_readable(&self) -> bool {
        !matches!(self, ServerRole::Unknown)
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerRole::Primary => write!(f, "Primary"),
            ServerRole::Secondary => write!(f, "Secondary"),
            ServerRole::Standalone => write!(f, "Standalone"),
            ServerRole::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Snapshot of what the topology knows about one server
#[derive(Debug, Clone)]
pub struct ServerDescription {
    pub endpoint: Endpoint,
    pub state: ServerState,
    pub role: ServerRole,
    pub round_trip_time: Option<Duration>,
    pub last_update: Option<SystemTime>,
    pub consecutive_failures: u32,
    pub max_wire_version: Option<i32>,
    pub last_error: Option<String>,
}

impl ServerDescription {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            state: ServerState::Unknown,
            role: ServerRole::Unknown,
            round_trip_time: None,
            last_update: None,
            consecutive_failures: 0,
            max_wire_version: None,
            last_error: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ServerState::Connected
    }
}
