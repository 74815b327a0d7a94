//! Runtime configuration for the KNXnet/IP secure transport core.
//!
//! Centralizes the literal constants `spec.md` pins (handshake deadlines,
//! keep-alive interval, receive buffer size) so they are overridable by a
//! caller without editing source.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Error;

/// Top-level configuration for a [`crate::transport::TcpConnection`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// TCP connection tuning.
    pub transport: TransportConfig,

    /// Secure-session handshake and keep-alive tuning.
    pub session: SessionConfig,
}

impl Config {
    /// Parses a TOML document into a `Config`, overlaying the literal
    /// defaults for any table or key the document omits.
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        toml::from_str(s).map_err(|e| Error::InvalidArgument {
            reason: format!("failed to parse config: {}", e),
        })
    }

    /// Reads and parses a TOML config file from disk.
    pub async fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, Error> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| Error::InvalidArgument {
                reason: format!("failed to read config file {}: {}", path.as_ref().display(), e),
            })?;
        Self::from_toml_str(&content)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

/// TCP connection tuning (`spec.md` §4.5, §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Wall-clock deadline for `socket.connect()`.
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,

    /// Size of the fixed receive-accumulator buffer. Frames larger than this
    /// are skipped rather than parsed (`spec.md` §4.5 step 3, §9 open question).
    pub receive_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            receive_buffer_size: 512,
        }
    }
}

/// Secure-session handshake and keep-alive tuning (`spec.md` §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Per-half handshake deadline: `SessionRequest -> SessionResponse` and
    /// `SessionAuth -> SessionStatus` each get this long.
    #[serde(with = "duration_millis")]
    pub handshake_half_deadline: Duration,

    /// Interval between keep-alive `SessionStatus` frames once Authenticated.
    #[serde(with = "duration_millis")]
    pub keep_alive_interval: Duration,

    /// Blocking budget for a device-management `responseFor(...)` call.
    #[serde(with = "duration_millis")]
    pub dev_mgmt_response_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_half_deadline: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(30),
            dev_mgmt_response_timeout: Duration::from_secs(1),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
