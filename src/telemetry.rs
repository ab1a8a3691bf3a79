use tracing::Level;

use crate::error::{ChainError, Result};

pub fn parse_level(level: &str) -> Result<Level> {
    level
        .parse::<Level>()
        .map_err(|_| ChainError::configuration(format!("unknown log level: {}", level)))
}

/// Installs the global fmt subscriber.
///
/// Returns `Ok(false)` when a global subscriber was already installed.
pub fn init_tracing(level: &str) -> Result<bool> {
    let level = parse_level(level)?;
    let installed = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init()
        .is_ok();
    Ok(installed)
}
