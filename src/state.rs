use std::sync::Arc;

use crate::commands::DiscoveryController;
use crate::config::Config;
use crate::db::DbPool;
use crate::discovery::CollectorFactory;
use crate::error::AppError;

/// Shared state handed to whatever serves the operations
pub struct AppState {
    pub db: DbPool,
    pub config: Config,
    pub discovery: DiscoveryController,
}

impl AppState {
    /// Open the database, run migrations and recover discovery runs left
    /// behind by a previous process.
    pub fn init(config: Config, collectors: Arc<dyn CollectorFactory>) -> Result<Self, AppError> {
        let db = crate::db::init_database(&config.database_path, config.pool_size)?;
        let discovery = DiscoveryController::new(
            db.clone(),
            collectors,
            config.discovery_workers,
            config.progress_flush_every,
        );

        let recovered = discovery.recover_interrupted()?;
        if recovered > 0 {
            tracing::warn!(recovered, "Recovered interrupted discovery runs");
        }

        Ok(Self {
            db,
            config,
            discovery,
        })
    }

    /// Initialize from the environment
    pub fn from_env(collectors: Arc<dyn CollectorFactory>) -> Result<Self, AppError> {
        Self::init(Config::from_env()?, collectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::discovery::{get_progress, insert_progress};
    use crate::db::{DiscoveryStatus, DiscoveryType};
    use crate::test_support::{FakeCollectorFactory, FakeScript};
    use tempfile::tempdir;

    #[test]
    fn test_app_state_recovers_stale_discovery() {
        let dir = tempdir().unwrap();
        let config = Config::with_database_path(dir.path().join("state.db"));

        let stale_id = {
            let db = crate::db::init_database(&config.database_path, 1).unwrap();
            let conn = db.get().unwrap();
            insert_progress(&conn, DiscoveryType::Organization, "acme", None, None)
                .unwrap()
                .id
        };

        let probe = crate::db::init_database(&config.database_path, 1).unwrap();
        let factory = Arc::new(FakeCollectorFactory::new(
            probe,
            Arc::new(FakeScript::with_repos(0)),
        ));
        let state = AppState::init(config, factory).unwrap();

        let row = get_progress(&state.db.get().unwrap(), stale_id).unwrap();
        assert_eq!(row.status, DiscoveryStatus::Failed);
        assert!(state.discovery.get_discovery_status().unwrap().is_some());
    }
}
