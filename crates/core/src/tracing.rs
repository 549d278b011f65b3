use std::sync::atomic::{AtomicBool, Ordering};

use tracing::level_filters::LevelFilter;

/// Installs the global subscriber once per process; later calls are no-ops.
///
/// Honors `RUST_LOG` directives on top of `level`. See [`tracer::init_tracer`] for the
/// environment switches.
pub fn set_logger(level: Option<LevelFilter>) -> anyhow::Result<()> {
    static LOGGER_SET: AtomicBool = AtomicBool::new(false);
    if LOGGER_SET
        .compare_exchange(false, true, Ordering::Release, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }
    #[cfg(feature = "trace")]
    {
        tracer::init_tracer(level)
    }
    #[cfg(not(feature = "trace"))]
    {
        let _ = level;
        Ok(())
    }
}

#[cfg(feature = "trace")]
pub use tracer::init_tracer;

#[cfg(feature = "trace")]
pub mod tracer {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

    /// Builds the fmt layer and sets it as the global default.
    ///
    /// - `LLUDP_LOG_FORMAT=json` switches from pretty to JSON lines.
    /// - `LLUDP_LOG_TO_STDERR` writes to stderr instead of stdout.
    /// - `LLUDP_DISABLE_LOGS` installs nothing.
    pub fn init_tracer(level: Option<LevelFilter>) -> anyhow::Result<()> {
        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let default_filter = level.unwrap_or(default_filter);
        let filter_layer = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(default_filter.into())
            .from_env_lossy();

        if std::env::var("LLUDP_DISABLE_LOGS").is_ok() {
            return Ok(());
        }
        let to_stderr = std::env::var("LLUDP_LOG_TO_STDERR").is_ok();
        let json = std::env::var("LLUDP_LOG_FORMAT").is_ok_and(|format| format == "json");

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_level(true)
            .with_thread_names(true);
        let fmt_layer = if cfg!(any(test, debug_assertions)) {
            fmt_layer.with_file(true).with_line_number(true)
        } else {
            fmt_layer
        };
        let layer = match (json, to_stderr) {
            (true, true) => fmt_layer.json().with_writer(std::io::stderr).boxed(),
            (true, false) => fmt_layer.json().boxed(),
            (false, true) => fmt_layer.pretty().with_writer(std::io::stderr).boxed(),
            (false, false) => fmt_layer.pretty().boxed(),
        };
        let subscriber = Registry::default().with(layer.with_filter(filter_layer));
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }
}
