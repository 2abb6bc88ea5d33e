pub mod commands;
pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod guard;
pub mod outcome;
pub mod state;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use outcome::Outcome;
pub use state::AppState;

/// Install the global tracing subscriber. `Config::log_filter` replaces the
/// default `info` level; otherwise `RUST_LOG` is honoured.
pub fn init_tracing(config: &Config) -> AppResult<()> {
    let filter = match config.log_filter {
        Some(ref directives) => tracing_subscriber::EnvFilter::try_new(directives)
            .map_err(|e| AppError::Config(format!("Invalid log filter '{}': {}", directives, e)))?,
        None => tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| AppError::Internal(format!("Failed to install tracing subscriber: {}", e)))?;

    tracing::info!("Starting migration orchestrator");
    Ok(())
}
