//! Runs the scan orchestrator until interrupted.
//!
//! Usage: `surfwatchd [CONFIG]`. Without an argument the config path comes
//! from `SURFWATCH_CONFIG`, then `~/.surfwatch/surfwatch.json`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;

use log::{error, info};
use surfwatch::logging::init_logging;
use surfwatch::{load_config, Orchestrator};

fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("SURFWATCH_CONFIG").map(PathBuf::from))
        .or_else(|| dirs::home_dir().map(|h| h.join(".surfwatch").join("surfwatch.json")))
}

fn main() -> ExitCode {
    let Some(path) = config_path() else {
        eprintln!("No config path given and no home directory found");
        return ExitCode::FAILURE;
    };

    let config = match load_config(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.logging);
    info!("Loaded configuration from {}", path.display());

    let mut orchestrator = match Orchestrator::open(config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!("Failed to initialize: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let (stop_tx, stop_rx) = mpsc::channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    }) {
        error!("Failed to install signal handler: {}", e);
        return ExitCode::FAILURE;
    }

    if let Err(e) = orchestrator.start() {
        error!("Failed to start: {}", e);
        return ExitCode::FAILURE;
    }

    let _ = stop_rx.recv();
    info!("Received shutdown signal");
    orchestrator.shutdown();

    ExitCode::SUCCESS
}
