//! Structured logging for render runs.
//!
//! Output goes to stderr so a tile list can still be piped through stdout.
//! The filter is taken from `RUST_LOG` when set, e.g.
//! `RUST_LOG=tile_forge=debug` to see every write.

use std::io;

use tracing_subscriber::EnvFilter;

use crate::error::Error;

/// Filter used when `RUST_LOG` is unset: lifecycle and progress lines only.
pub const DEFAULT_FILTER: &str = "info";

/// Installs the global subscriber.
///
/// Fails instead of panicking when a subscriber is already installed, so
/// embedding applications that set up their own logging are left alone.
pub fn init_logging(default_filter: &str) -> Result<(), Error> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_filter(default_filter)?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}

fn build_filter(directives: &str) -> Result<EnvFilter, Error> {
    EnvFilter::try_new(directives).map_err(|e| Error::Logging(format!("{directives:?}: {e}")))
}
