//! Server configuration.
//!
//! Every option has a default, so an empty TOML file (or no file at all) yields a working
//! server. Keys use kebab-case:
//!
//! ```toml
//! bind-address = "0.0.0.0:9000"
//! scene-throttle = 5000000
//! default-rto-ms = 1000
//!
//! [throttle-rates]
//! texture = 40000
//!
//! [packet-log]
//! enabled = true
//! directory = "/var/log/lludp"
//!
//! [[sessions]]
//! circuit-code = 42
//! session-id = "0b6e8d4e-1b35-4c8f-93c4-7c2f1c4f2a11"
//! agent-id = "6f7e4a1c-24b9-4a53-8b17-3f9a52b1d8c0"
//! ```

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::transport::{ThrottleCategory, MTU};

/// Default UDP port of a region.
pub const DEFAULT_PORT: u16 = 9000;

/// Current version of the crate.
pub(crate) const PCK_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed reading config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct UdpServerConfig {
    /// Local address the server socket binds to.
    pub bind_address: SocketAddr,

    /// Kernel receive buffer size (`SO_RCVBUF`). Left to the OS default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recv_buffer_size: Option<usize>,

    /// Aggregate outbound ceiling for the whole scene in bytes/s. 0 disables the ceiling.
    pub scene_throttle: usize,

    /// Aggregate outbound ceiling per circuit in bytes/s. 0 disables the ceiling.
    pub client_throttle: usize,

    /// Per-category default rates (bytes/s) applied to every new circuit.
    pub throttle_rates: ThrottleRates,

    /// Length of the burst window. A bucket holds at most `rate * window` bytes, never less
    /// than one MTU so a full datagram can always eventually be sent.
    pub burst_window_ms: u64,

    /// Initial retransmission timeout and lower clamp of the estimator.
    pub default_rto_ms: u64,

    /// Upper clamp for the retransmission timeout, including backoff.
    pub max_rto_ms: u64,

    /// A circuit that sent nothing for this long is closed.
    pub ack_timeout_ms: u64,

    /// Replaces `ack_timeout_ms` while a circuit is paused.
    pub paused_ack_timeout_ms: u64,

    /// How long datagrams from an endpoint are buffered while its handshake is authorized.
    pub pending_admission_timeout_ms: u64,

    /// Most datagrams buffered per endpoint while its handshake is authorized. Later ones
    /// are dropped.
    pub pending_buffer_limit: usize,

    /// Drop a reliable message after this many retransmissions. Unlimited when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_resends: Option<u32>,

    /// Send everything immediately, bypassing every token bucket.
    pub disable_throttles: bool,

    /// Reuse datagram receive buffers.
    pub use_packet_pool: bool,

    /// Reuse decoded message body buffers.
    pub use_message_pool: bool,

    /// Number of idle buffers each pool retains.
    pub pool_capacity: usize,

    /// Maximum number of concurrently running background jobs (admission checks, forced
    /// disconnects).
    pub background_tasks: usize,

    pub packet_log: PacketLogConfig,

    /// Static session records, consumed by [`crate::transport::StaticSessions`].
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sessions: Vec<SessionRecord>,
}

impl Default for UdpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            recv_buffer_size: None,
            scene_throttle: 0,
            client_throttle: 0,
            throttle_rates: ThrottleRates::default(),
            burst_window_ms: 500,
            default_rto_ms: 1_000,
            max_rto_ms: 20_000,
            ack_timeout_ms: 60_000,
            paused_ack_timeout_ms: 300_000,
            pending_admission_timeout_ms: 30_000,
            pending_buffer_limit: 64,
            max_resends: None,
            disable_throttles: false,
            use_packet_pool: true,
            use_message_pool: true,
            pool_capacity: 256,
            background_tasks: 4,
            packet_log: PacketLogConfig::default(),
            sessions: Vec::new(),
        }
    }
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT)
}

impl UdpServerConfig {
    /// Reads and validates a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        tracing::debug!(?path, version = PCK_VERSION, "Loaded server configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_rto_ms == 0 {
            return Err(ConfigError::Invalid("default-rto-ms must be positive"));
        }
        if self.max_rto_ms < self.default_rto_ms {
            return Err(ConfigError::Invalid(
                "max-rto-ms must not be lower than default-rto-ms",
            ));
        }
        if self.ack_timeout_ms == 0 || self.paused_ack_timeout_ms < self.ack_timeout_ms {
            return Err(ConfigError::Invalid(
                "ack timeouts must be positive and the paused timeout must not be shorter",
            ));
        }
        if self.pending_buffer_limit == 0 {
            return Err(ConfigError::Invalid("pending-buffer-limit must be at least 1"));
        }
        if self.background_tasks == 0 {
            return Err(ConfigError::Invalid("background-tasks must be at least 1"));
        }
        if self.packet_log.enabled && self.packet_log.rotation_secs == 0 {
            return Err(ConfigError::Invalid("packet-log rotation-secs must be positive"));
        }
        Ok(())
    }

    pub fn default_rto(&self) -> Duration {
        Duration::from_millis(self.default_rto_ms)
    }

    pub fn max_rto(&self) -> Duration {
        Duration::from_millis(self.max_rto_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn paused_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.paused_ack_timeout_ms)
    }

    pub fn pending_admission_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_admission_timeout_ms)
    }

    /// Bucket capacity for a given rate.
    pub fn burst_capacity(&self, rate: usize) -> usize {
        let window = rate as u128 * self.burst_window_ms as u128 / 1000;
        (window as usize).max(MTU)
    }
}

/// Default per-category rates in bytes per second.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ThrottleRates {
    pub resend: usize,
    pub task: usize,
    pub texture: usize,
    pub asset: usize,
    pub state: usize,
}

impl Default for ThrottleRates {
    fn default() -> Self {
        Self {
            resend: 12_500,
            task: 18_500,
            texture: 18_500,
            asset: 10_500,
            state: 10_000,
        }
    }
}

impl ThrottleRates {
    /// Rate for a throttled category; `None` for categories that have no bucket of their own.
    pub fn rate(&self, category: ThrottleCategory) -> Option<usize> {
        match category {
            ThrottleCategory::Resend => Some(self.resend),
            ThrottleCategory::Task => Some(self.task),
            ThrottleCategory::Texture => Some(self.texture),
            ThrottleCategory::Asset => Some(self.asset),
            ThrottleCategory::State => Some(self.state),
            ThrottleCategory::Control => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct PacketLogConfig {
    /// Write the header of every datagram to a binary log.
    pub enabled: bool,
    pub directory: PathBuf,
    /// A new log file is started after this many seconds.
    pub rotation_secs: u64,
}

impl Default for PacketLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("packet-logs"),
            rotation_secs: 3600,
        }
    }
}

impl PacketLogConfig {
    pub fn rotation(&self) -> Duration {
        Duration::from_secs(self.rotation_secs)
    }
}

/// A session the login service handed out, keyed by its circuit code.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SessionRecord {
    pub circuit_code: u32,
    pub session_id: Uuid,
    pub agent_id: Uuid,
}
