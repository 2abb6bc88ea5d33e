use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{is_unique_violation, Batch, BatchStatus, CreateBatch, ExclusionFlags};
use crate::error::{AppError, AppResult};

const BATCH_COLUMNS: &str = "id, name, description, status, batch_type, migration_api,
    destination_org, exclude_releases, exclude_attachments, exclude_metadata,
    exclude_git_data, exclude_owner_projects, last_dry_run_at, started_at, completed_at,
    created_at, updated_at";

fn map_batch(row: &Row<'_>) -> rusqlite::Result<Batch> {
    Ok(Batch {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        status: row.get(3)?,
        batch_type: row.get(4)?,
        migration_api: row.get(5)?,
        destination_org: row.get(6)?,
        exclusions: ExclusionFlags {
            exclude_releases: row.get(7)?,
            exclude_attachments: row.get(8)?,
            exclude_metadata: row.get(9)?,
            exclude_git_data: row.get(10)?,
            exclude_owner_projects: row.get(11)?,
        },
        last_dry_run_at: row.get(12)?,
        started_at: row.get(13)?,
        completed_at: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

fn name_conflict(name: &str) -> AppError {
    AppError::Conflict(format!("A batch named '{}' already exists", name))
}

pub fn insert_batch(conn: &Connection, request: &CreateBatch) -> AppResult<i64> {
    let result = conn.execute(
        "INSERT INTO batches (name, description, batch_type, migration_api, destination_org,
            exclude_releases, exclude_attachments, exclude_metadata, exclude_git_data,
            exclude_owner_projects)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            request.name,
            request.description,
            request.batch_type,
            request.migration_api,
            request.destination_org,
            request.exclusions.exclude_releases,
            request.exclusions.exclude_attachments,
            request.exclusions.exclude_metadata,
            request.exclusions.exclude_git_data,
            request.exclusions.exclude_owner_projects,
        ],
    );

    match result {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(e) if is_unique_violation(&e) => Err(name_conflict(&request.name)),
        Err(e) => Err(e.into()),
    }
}

pub fn get_batch(conn: &Connection, id: i64) -> AppResult<Batch> {
    let sql = format!("SELECT {} FROM batches WHERE id = ?1", BATCH_COLUMNS);
    conn.query_row(&sql, [id], map_batch)
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("Batch with id {} not found", id)))
}

pub fn list_batches(conn: &Connection) -> AppResult<Vec<Batch>> {
    let sql = format!("SELECT {} FROM batches ORDER BY created_at DESC, id DESC", BATCH_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let batches = stmt
        .query_map([], map_batch)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(batches)
}

/// Overwrite the editable attributes of a batch.
pub fn save_batch(conn: &Connection, batch: &Batch) -> AppResult<()> {
    let result = conn.execute(
        "UPDATE batches SET
            name = ?1,
            description = ?2,
            batch_type = ?3,
            migration_api = ?4,
            destination_org = ?5,
            exclude_releases = ?6,
            exclude_attachments = ?7,
            exclude_metadata = ?8,
            exclude_git_data = ?9,
            exclude_owner_projects = ?10,
            updated_at = datetime('now')
         WHERE id = ?11",
        params![
            batch.name,
            batch.description,
            batch.batch_type,
            batch.migration_api,
            batch.destination_org,
            batch.exclusions.exclude_releases,
            batch.exclusions.exclude_attachments,
            batch.exclusions.exclude_metadata,
            batch.exclusions.exclude_git_data,
            batch.exclusions.exclude_owner_projects,
            batch.id,
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(name_conflict(&batch.name)),
        Err(e) => Err(e.into()),
    }
}

/// Which timestamp column a status change stamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStamp {
    None,
    DryRun,
    Started,
    Completed,
}

/// Compare-and-set the batch status. Returns false when the batch has left
/// `expected` in the meantime.
pub fn update_batch_status(
    conn: &Connection,
    id: i64,
    expected: BatchStatus,
    next: BatchStatus,
    stamp: BatchStamp,
) -> AppResult<bool> {
    let stamp_sql = match stamp {
        BatchStamp::None => "",
        BatchStamp::DryRun => ", last_dry_run_at = datetime('now')",
        BatchStamp::Started => ", started_at = datetime('now'), completed_at = NULL",
        BatchStamp::Completed => ", completed_at = datetime('now')",
    };
    let sql = format!(
        "UPDATE batches SET status = ?1, updated_at = datetime('now'){}
         WHERE id = ?2 AND status = ?3",
        stamp_sql
    );
    let affected = conn.execute(&sql, params![next, id, expected])?;
    Ok(affected == 1)
}

pub fn delete_batch(conn: &Connection, id: i64) -> AppResult<bool> {
    let affected = conn.execute("DELETE FROM batches WHERE id = ?1", [id])?;
    Ok(affected == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;

    fn request(name: &str) -> CreateBatch {
        CreateBatch {
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_and_get() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();

        let id = insert_batch(&conn, &request("wave-1")).unwrap();
        let batch = get_batch(&conn, id).unwrap();

        assert_eq!(batch.name, "wave-1");
        assert_eq!(batch.status, BatchStatus::Pending);
        assert!(batch.started_at.is_none());
    }

    #[test]
    fn test_duplicate_name_is_conflict() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();

        insert_batch(&conn, &request("wave-1")).unwrap();
        let err = insert_batch(&conn, &request("wave-1")).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn test_status_update_is_compare_and_set() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let id = insert_batch(&conn, &request("wave-1")).unwrap();

        assert!(update_batch_status(
            &conn,
            id,
            BatchStatus::Pending,
            BatchStatus::InProgress,
            BatchStamp::Started
        )
        .unwrap());
        assert!(!update_batch_status(
            &conn,
            id,
            BatchStatus::Pending,
            BatchStatus::Ready,
            BatchStamp::None
        )
        .unwrap());

        let batch = get_batch(&conn, id).unwrap();
        assert_eq!(batch.status, BatchStatus::InProgress);
        assert!(batch.started_at.is_some());
    }
}
