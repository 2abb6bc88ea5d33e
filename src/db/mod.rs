// SQLite database connection, migrations and queries
pub mod batches;
pub mod connection;
pub mod discovery;
pub mod migration_logs;
pub mod models;
pub mod repositories;
pub mod sources;

pub use connection::{init_database, DbConnection, DbPool};
pub use models::{
    Batch, BatchStatus, BatchType, CreateBatch, DiscoveredRepository, DiscoveryProgress,
    DiscoveryStatus, DiscoveryType, ExclusionFlags, LogOperation, MigrationApi, MigrationLog,
    MigrationPhase, Repository, RepositoryFilter, RepositoryStatus, Source, SourcePlatform,
    UpdateBatch,
};

/// True when `err` is a UNIQUE constraint rejection.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}
