use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::FtpKitError;

pub const DEFAULT_PORT: u16 = 21;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
/// Recommended to be at least three times `max_connections` so listing
/// workers never starve the transfer fan-out.
pub const DEFAULT_MAX_WORKERS: usize = 30;
pub const SOCKET_BUFFER_SIZE: usize = 1_048_576; // 1 MiB

/// Password holder that never leaks its value through `Debug`, `Display`
/// or serialization. The value is only reachable via [`SecretString::expose`].
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl std::fmt::Display for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl Serialize for SecretString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }
}

/// Control-socket tuning applied after every TCP connect.
///
/// `linger_secs = Some(0)` forces an immediate RST on close, which avoids
/// TIME_WAIT exhaustion when many pooled sockets churn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketTuning {
    /// SO_RCVBUF / SO_SNDBUF size in bytes.
    pub buffer_size: usize,
    /// TCP_NODELAY: low latency for short control commands.
    pub nodelay: bool,
    /// SO_KEEPALIVE: survive idleness in pooled sockets.
    pub keepalive: bool,
    /// SO_LINGER timeout; `None` leaves the OS default close behavior.
    pub linger_secs: Option<u64>,
}

impl Default for SocketTuning {
    fn default() -> Self {
        Self {
            buffer_size: SOCKET_BUFFER_SIZE,
            nodelay: true,
            keepalive: true,
            linger_secs: Some(0),
        }
    }
}

/// Validated connection configuration shared by the pool, the file system
/// and the transfer engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParameters {
    pub host: String,
    /// `0` means "omit the port" when constructing FTP URLs; connections
    /// then use the protocol default.
    pub port: u16,
    pub credentials: Credentials,
    /// Applied to TCP connect and to pool initialization. `0` disables the
    /// deadline.
    pub timeout_secs: u64,
    pub max_connections: usize,
    pub max_workers: usize,
    pub tuning: SocketTuning,
}

impl ConnectionParameters {
    pub fn new(host: impl Into<String>, credentials: Credentials) -> Result<Self, FtpKitError> {
        let params = Self {
            host: host.into(),
            port: DEFAULT_PORT,
            credentials,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_workers: DEFAULT_MAX_WORKERS,
            tuning: SocketTuning::default(),
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), FtpKitError> {
        if self.host.trim().is_empty() {
            return Err(FtpKitError::Config("host must not be empty".to_string()));
        }
        if self.max_connections == 0 {
            return Err(FtpKitError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.max_workers == 0 {
            return Err(FtpKitError::Config(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.tuning.buffer_size == 0 {
            return Err(FtpKitError::Config(
                "socket buffer_size must be at least 1 byte".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Port used for actual TCP connections; URL-omitted ports fall back to
    /// the protocol default.
    pub fn connect_port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_PORT
        } else {
            self.port
        }
    }
}
