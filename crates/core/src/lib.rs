/// Server configuration, loadable from TOML.
pub mod config;

/// Logging bootstrap.
pub mod tracing;

/// Circuit-based reliable transport over UDP: framing, acknowledgement, throttling, admission
/// and the threads driving them.
pub mod transport;

pub mod util;

pub use config::UdpServerConfig;
pub use transport::{Collaborators, SendOptions, UdpServer};
