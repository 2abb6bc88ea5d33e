use rusqlite::{params, Connection};

use crate::db::{LogOperation, MigrationLog, MigrationPhase};
use crate::error::AppResult;

/// Append an audit entry. Entries are never updated or deleted.
pub fn append_log(
    conn: &Connection,
    repository_id: i64,
    phase: MigrationPhase,
    operation: LogOperation,
    message: &str,
    initiated_by: Option<&str>,
) -> AppResult<i64> {
    conn.execute(
        "INSERT INTO migration_logs (repository_id, phase, operation, message, initiated_by)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![repository_id, phase, operation, message, initiated_by],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_logs(conn: &Connection, repository_id: i64) -> AppResult<Vec<MigrationLog>> {
    let mut stmt = conn.prepare(
        "SELECT id, repository_id, phase, operation, message, initiated_by, created_at
         FROM migration_logs WHERE repository_id = ?1 ORDER BY id",
    )?;

    let logs = stmt
        .query_map([repository_id], |row| {
            Ok(MigrationLog {
                id: row.get(0)?,
                repository_id: row.get(1)?,
                phase: row.get(2)?,
                operation: row.get(3)?,
                message: row.get(4)?,
                initiated_by: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(logs)
}
