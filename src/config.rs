use std::path::PathBuf;

use crate::error::AppError;

pub const DEFAULT_DISCOVERY_WORKERS: usize = 5;
pub const DEFAULT_PROGRESS_FLUSH_EVERY: usize = 25;
pub const DEFAULT_POOL_SIZE: u32 = 8;

/// Runtime configuration, read from the environment (and `.env` when present).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub pool_size: u32,
    pub discovery_workers: usize,
    pub progress_flush_every: usize,
    pub log_filter: Option<String>,
}

impl Config {
    pub fn with_database_path(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            pool_size: DEFAULT_POOL_SIZE,
            discovery_workers: DEFAULT_DISCOVERY_WORKERS,
            progress_flush_every: DEFAULT_PROGRESS_FLUSH_EVERY,
            log_filter: None,
        }
    }

    /// Load from the process environment
    pub fn from_env() -> Result<Self, AppError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(AppError::Config(format!("Failed to read .env: {}", e)));
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup so tests don't touch the real environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let database_path = match non_empty(lookup("MIGRATOR_DATABASE_PATH")) {
            Some(path) => PathBuf::from(path),
            None => crate::db::connection::default_db_path()?,
        };

        let pool_size = parse_positive(&lookup, "MIGRATOR_POOL_SIZE", DEFAULT_POOL_SIZE as usize)?;
        let discovery_workers = parse_positive(
            &lookup,
            "MIGRATOR_DISCOVERY_WORKERS",
            DEFAULT_DISCOVERY_WORKERS,
        )?;
        let progress_flush_every = parse_positive(
            &lookup,
            "MIGRATOR_PROGRESS_FLUSH_EVERY",
            DEFAULT_PROGRESS_FLUSH_EVERY,
        )?;

        Ok(Self {
            database_path,
            pool_size: u32::try_from(pool_size)
                .map_err(|_| AppError::Config("MIGRATOR_POOL_SIZE is too large".into()))?,
            discovery_workers,
            progress_flush_every,
            log_filter: non_empty(lookup("MIGRATOR_LOG_FILTER")),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: usize,
) -> Result<usize, AppError> {
    match non_empty(lookup(key)) {
        None => Ok(default),
        Some(raw) => match raw.parse::<usize>() {
            Ok(0) | Err(_) => Err(AppError::Config(format!(
                "{} must be a positive number, got '{}'",
                key, raw
            ))),
            Ok(value) => Ok(value),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup(&[("MIGRATOR_DATABASE_PATH", "/tmp/m.db")])).unwrap();

        assert_eq!(config.database_path, PathBuf::from("/tmp/m.db"));
        assert_eq!(config.discovery_workers, DEFAULT_DISCOVERY_WORKERS);
        assert_eq!(config.progress_flush_every, DEFAULT_PROGRESS_FLUSH_EVERY);
        assert!(config.log_filter.is_none());
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("MIGRATOR_DATABASE_PATH", "/tmp/m.db"),
            ("MIGRATOR_DISCOVERY_WORKERS", "12"),
            ("MIGRATOR_LOG_FILTER", "migration_orchestrator=debug"),
        ]))
        .unwrap();

        assert_eq!(config.discovery_workers, 12);
        assert_eq!(
            config.log_filter.as_deref(),
            Some("migration_orchestrator=debug")
        );
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let result = Config::from_lookup(lookup(&[
            ("MIGRATOR_DATABASE_PATH", "/tmp/m.db"),
            ("MIGRATOR_DISCOVERY_WORKERS", "0"),
        ]));
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
