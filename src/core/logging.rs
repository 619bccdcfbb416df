//! Logging setup built on tracing
//!
//! One subscriber for the whole process. `MAESTRO_LOG` (or `RUST_LOG`)
//! wins over the configured level so operators can raise verbosity
//! without editing config.

use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// `verbosity` counts `-v` flags: 0 uses the configured level, 1 forces
/// debug, 2+ forces trace. Safe to call more than once; subsequent calls
/// are no-ops.
pub fn init(configured_level: &str, verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => configured_level.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };

    let filter = EnvFilter::try_from_env("MAESTRO_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();

    Ok(())
}
