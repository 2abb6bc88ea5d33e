use rusqlite::{params, Connection, OptionalExtension};

use crate::db::{is_unique_violation, Source, SourcePlatform};
use crate::error::{AppError, AppResult};

pub fn insert_source(conn: &Connection, name: &str, platform: SourcePlatform) -> AppResult<Source> {
    match conn.execute(
        "INSERT INTO sources (name, platform) VALUES (?1, ?2)",
        params![name, platform],
    ) {
        Ok(_) => get_source(conn, conn.last_insert_rowid()),
        Err(e) if is_unique_violation(&e) => Err(AppError::Conflict(format!(
            "A source named '{}' already exists",
            name
        ))),
        Err(e) => Err(e.into()),
    }
}

pub fn get_source(conn: &Connection, id: i64) -> AppResult<Source> {
    conn.query_row(
        "SELECT id, name, platform, repository_count, last_discovered_at, created_at, updated_at
         FROM sources WHERE id = ?1",
        [id],
        |row| {
            Ok(Source {
                id: row.get(0)?,
                name: row.get(1)?,
                platform: row.get(2)?,
                repository_count: row.get(3)?,
                last_discovered_at: row.get(4)?,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound(format!("Source with id {} not found", id)))
}

/// Recount the ledger rows attributed to `id` and cache the result.
pub fn refresh_repository_count(conn: &Connection, id: i64) -> AppResult<i64> {
    let count = crate::db::repositories::count_for_source(conn, id)?;
    let affected = conn.execute(
        "UPDATE sources SET repository_count = ?1, last_discovered_at = datetime('now'),
            updated_at = datetime('now')
         WHERE id = ?2",
        params![count, id],
    )?;

    if affected == 0 {
        return Err(AppError::NotFound(format!("Source with id {} not found", id)));
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::upsert_discovered_repository;
    use crate::test_support::{discovered, test_pool};

    #[test]
    fn test_refresh_counts_only_own_repositories() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let source = insert_source(&conn, "github-prod", SourcePlatform::GitHub).unwrap();

        for name in ["acme/a", "acme/b"] {
            let mut repo = discovered(name);
            repo.source_id = Some(source.id);
            upsert_discovered_repository(&conn, &repo).unwrap();
        }
        upsert_discovered_repository(&conn, &discovered("other/c")).unwrap();

        assert_eq!(refresh_repository_count(&conn, source.id).unwrap(), 2);
        let source = get_source(&conn, source.id).unwrap();
        assert_eq!(source.repository_count, 2);
        assert!(source.last_discovered_at.is_some());
    }

    #[test]
    fn test_refresh_unknown_source_is_not_found() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();

        let err = refresh_repository_count(&conn, 42).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
