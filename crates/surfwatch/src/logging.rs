//! Process-wide log setup for binaries embedding the library.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Installs a `tracing` subscriber and forwards `log` records into it.
///
/// `RUST_LOG` wins over the configured level. Safe to call more than once;
/// only the first call has an effect, and an already-installed global
/// subscriber is left in place.
pub fn init_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

        let layer = if config.json {
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .json()
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .boxed()
        };

        // try_init also installs the log -> tracing bridge.
        if tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init()
            .is_err()
        {
            let _ = tracing_log::LogTracer::init();
            tracing::debug!("Global tracing subscriber already set, keeping it");
        }

        tracing::info!(
            level = %config.level,
            json = config.json,
            pid = std::process::id(),
            "Logging initialized"
        );
    });
}
