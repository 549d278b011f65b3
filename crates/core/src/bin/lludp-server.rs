use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use crossbeam::channel::RecvTimeoutError;
use lludp::transport::{Circuit, ConnectionLifecycle, InboundMessage, StaticSessions};
use lludp::{Collaborators, UdpServer, UdpServerConfig};
use tracing::level_filters::LevelFilter;

/// Runs a standalone circuit server with the sessions listed in its configuration file.
#[derive(Parser, Debug)]
#[command(version, about)]
struct ServerCliConfig {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long, env = "LLUDP_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `bind-address` from the configuration file.
    #[arg(long, env = "LLUDP_BIND")]
    bind: Option<SocketAddr>,

    #[arg(long, env = "LLUDP_LOG_LEVEL")]
    log_level: Option<LevelFilter>,

    /// Seconds between metric reports.
    #[arg(long, env = "LLUDP_METRICS_INTERVAL", default_value_t = 30)]
    metrics_interval: u64,
}

struct LogLifecycle;

impl ConnectionLifecycle for LogLifecycle {
    fn on_timeout(&self, circuit: &Circuit) {
        tracing::info!(
            circuit_code = circuit.circuit_code(),
            agent = %circuit.agent_id(),
            "Agent timed out"
        );
    }

    fn on_closed(&self, circuit: &Circuit) {
        tracing::debug!(circuit_code = circuit.circuit_code(), "Circuit closed");
    }
}

fn log_message(circuit: &Circuit, message: &InboundMessage) -> anyhow::Result<()> {
    tracing::debug!(
        circuit_code = circuit.circuit_code(),
        agent = %circuit.agent_id(),
        id = %message.message_id,
        sequence = message.sequence,
        len = message.body().len(),
        "Message received"
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = ServerCliConfig::parse();
    lludp::tracing::set_logger(cli.log_level)?;

    let mut config = match &cli.config {
        Some(path) => UdpServerConfig::load(path)?,
        None => UdpServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.bind_address = bind;
    }
    let sessions: Arc<StaticSessions> = Arc::new(config.sessions.iter().copied().collect());
    tracing::info!(sessions = sessions.len(), "Static sessions loaded");

    let collaborators = Collaborators::new(sessions.clone(), sessions, Arc::new(log_message))
        .with_lifecycle(Arc::new(LogLifecycle));
    let server = UdpServer::<UdpSocket>::bind(config, collaborators)?;
    server.start_inbound()?;
    server.start_outbound()?;

    let (shutdown_tx, shutdown) = crossbeam::channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })?;

    let interval = Duration::from_secs(cli.metrics_interval.max(1));
    loop {
        match shutdown.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                let metrics = serde_json::to_string(&server.metrics())?;
                tracing::info!(%metrics, "Transport metrics");
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::info!("Received Ctrl+C, shutting down");
    server.stop();
    Ok(())
}
