use std::path::{Path, PathBuf};

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::AppError;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("src/db/migrations");
}

/// Applied to every pooled connection. The busy timeout lets concurrent
/// writers (discovery jobs, request handlers) queue instead of failing.
const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON;
     PRAGMA journal_mode = WAL;
     PRAGMA busy_timeout = 5000;";

pub fn create_pool(db_path: &Path, max_size: u32) -> Result<DbPool, AppError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(db_path)
        .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));

    Ok(Pool::builder().max_size(max_size.max(1)).build(manager)?)
}

pub fn run_migrations(pool: &DbPool) -> Result<(), AppError> {
    let mut conn = pool.get()?;

    let report = embedded::migrations::runner()
        .run(&mut *conn)
        .map_err(|e| AppError::Internal(format!("Migration error: {}", e)))?;

    tracing::info!(
        applied = report.applied_migrations().len(),
        "Database schema is up to date"
    );
    Ok(())
}

/// `<data dir>/migration-orchestrator.db` for the current user.
pub fn default_db_path() -> Result<PathBuf, AppError> {
    directories::ProjectDirs::from("com", "migration-orchestrator", "MigrationOrchestrator")
        .map(|dirs| dirs.data_local_dir().join("migration-orchestrator.db"))
        .ok_or_else(|| AppError::Config("Cannot determine data directory".into()))
}

/// Open the pool and bring the schema up to date.
pub fn init_database(db_path: &Path, max_size: u32) -> Result<DbPool, AppError> {
    tracing::info!("Opening database at {:?}", db_path);

    let pool = create_pool(db_path, max_size)?;
    run_migrations(&pool)?;
    Ok(pool)
}
