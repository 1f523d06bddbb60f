//! Structured logging into the vault.
//!
//! Events go to `<vault>/askai.log` as one JSON object per line, so the terminal stays free for
//! the streamed answer. `RUST_LOG` overrides the default filter.

use std::error::Error;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing::Subscriber;
use tracing_subscriber::EnvFilter;

/// File name of the log inside the vault.
pub const LOG_FILE: &str = "askai.log";

fn default_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "askai=debug" } else { "askai=info" })
    })
}

fn file_subscriber(file: File, filter: EnvFilter) -> impl Subscriber + Send + Sync {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .finish()
}

/// Install the process-wide subscriber. Call once, early in `main`.
///
/// # Errors
///
/// Fails if the log file cannot be opened or a subscriber is already installed.
pub fn init_logging(vault: &Path, verbose: bool) -> Result<(), Box<dyn Error>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(vault.join(LOG_FILE))?;

    tracing::subscriber::set_global_default(file_subscriber(file, default_filter(verbose)))
        .map_err(|e| format!("failed to install logger: {e}"))?;
    Ok(())
}
