//! Repository ledger queries.
//!
//! Status writes are compare-and-set on the status the caller validated, so a
//! concurrent writer can never be overwritten with a transition that was only
//! legal from the old status.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{
    DiscoveredRepository, ExclusionFlags, Repository, RepositoryFilter, RepositoryStatus,
};
use crate::error::{AppError, AppResult};
use crate::guard;

const REPOSITORY_COLUMNS: &str = "id, full_name, source_platform, source_id, default_branch,
    size_kb, status, priority, batch_id, source_migration_id, is_source_locked,
    destination_full_name, exclude_releases, exclude_attachments, exclude_metadata,
    exclude_git_data, exclude_owner_projects, destination_url, migrated_at, last_error,
    discovered_at, updated_at";

fn map_repository(row: &Row<'_>) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get(0)?,
        full_name: row.get(1)?,
        source_platform: row.get(2)?,
        source_id: row.get(3)?,
        default_branch: row.get(4)?,
        size_kb: row.get(5)?,
        status: row.get(6)?,
        priority: row.get(7)?,
        batch_id: row.get(8)?,
        source_migration_id: row.get(9)?,
        is_source_locked: row.get(10)?,
        destination_full_name: row.get(11)?,
        exclusions: ExclusionFlags {
            exclude_releases: row.get(12)?,
            exclude_attachments: row.get(13)?,
            exclude_metadata: row.get(14)?,
            exclude_git_data: row.get(15)?,
            exclude_owner_projects: row.get(16)?,
        },
        destination_url: row.get(17)?,
        migrated_at: row.get(18)?,
        last_error: row.get(19)?,
        discovered_at: row.get(20)?,
        updated_at: row.get(21)?,
    })
}

/// SQL list of the statuses eligible for batch assignment.
fn eligible_status_list() -> String {
    guard::BATCH_ELIGIBLE
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn find_repository(conn: &Connection, id: i64) -> AppResult<Option<Repository>> {
    let sql = format!("SELECT {} FROM repositories WHERE id = ?1", REPOSITORY_COLUMNS);
    let repo = conn.query_row(&sql, [id], map_repository).optional()?;
    Ok(repo)
}

pub fn get_repository(conn: &Connection, id: i64) -> AppResult<Repository> {
    find_repository(conn, id)?
        .ok_or_else(|| AppError::NotFound(format!("Repository with id {} not found", id)))
}

pub fn list_repositories(conn: &Connection, filter: &RepositoryFilter) -> AppResult<Vec<Repository>> {
    let mut sql = format!("SELECT {} FROM repositories WHERE 1=1", REPOSITORY_COLUMNS);
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(status) = filter.status {
        sql.push_str(" AND status = ?");
        params.push(Box::new(status));
    }

    if let Some(batch_id) = filter.batch_id {
        sql.push_str(" AND batch_id = ?");
        params.push(Box::new(batch_id));
    }

    if let Some(source_id) = filter.source_id {
        sql.push_str(" AND source_id = ?");
        params.push(Box::new(source_id));
    }

    if let Some(platform) = filter.source_platform {
        sql.push_str(" AND source_platform = ?");
        params.push(Box::new(platform));
    }

    if let Some(ref needle) = filter.name_contains {
        sql.push_str(" AND full_name LIKE ? ESCAPE '\\'");
        let escaped = needle
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        params.push(Box::new(format!("%{}%", escaped)));
    }

    sql.push_str(" ORDER BY full_name");

    if let Some(limit) = filter.limit {
        sql.push_str(" LIMIT ?");
        params.push(Box::new(limit));
    }

    let mut stmt = conn.prepare(&sql)?;
    let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let repos = stmt
        .query_map(params_ref.as_slice(), map_repository)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(repos)
}

pub fn list_batch_repositories(conn: &Connection, batch_id: i64) -> AppResult<Vec<Repository>> {
    list_repositories(
        conn,
        &RepositoryFilter {
            batch_id: Some(batch_id),
            ..Default::default()
        },
    )
}

/// Insert a discovered repository or refresh the metadata of an existing one.
/// Lifecycle fields of an existing row are left alone.
pub fn upsert_discovered_repository(
    conn: &Connection,
    repo: &DiscoveredRepository,
) -> AppResult<i64> {
    let id = conn.query_row(
        "INSERT INTO repositories (full_name, source_platform, source_id, default_branch, size_kb)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (source_platform, full_name) DO UPDATE SET
            source_id = COALESCE(excluded.source_id, repositories.source_id),
            default_branch = excluded.default_branch,
            size_kb = excluded.size_kb,
            updated_at = datetime('now')
         RETURNING id",
        params![
            repo.full_name,
            repo.source_platform,
            repo.source_id,
            repo.default_branch,
            repo.size_kb,
        ],
        |row| row.get(0),
    )?;

    Ok(id)
}

/// Move `id` from `expected` to `next`. Returns false when the row no longer
/// holds `expected`.
pub fn compare_and_set_status(
    conn: &Connection,
    id: i64,
    expected: RepositoryStatus,
    next: RepositoryStatus,
    priority: Option<i64>,
) -> AppResult<bool> {
    let affected = conn.execute(
        "UPDATE repositories
         SET status = ?1, priority = COALESCE(?2, priority), updated_at = datetime('now')
         WHERE id = ?3 AND status = ?4",
        params![next, priority, id, expected],
    )?;
    Ok(affected == 1)
}

/// Claim `id` for `batch_id`, applying the batch defaults. The eligibility
/// predicate is re-evaluated inside the update so two batches can never both
/// claim the same repository.
pub fn assign_to_batch(
    conn: &Connection,
    id: i64,
    batch_id: i64,
    default_destination: Option<&str>,
    exclusions: &ExclusionFlags,
) -> AppResult<bool> {
    let sql = format!(
        "UPDATE repositories SET
            batch_id = ?1,
            destination_full_name = COALESCE(destination_full_name, ?2),
            exclude_releases = MAX(exclude_releases, ?3),
            exclude_attachments = MAX(exclude_attachments, ?4),
            exclude_metadata = MAX(exclude_metadata, ?5),
            exclude_git_data = MAX(exclude_git_data, ?6),
            exclude_owner_projects = MAX(exclude_owner_projects, ?7),
            updated_at = datetime('now')
         WHERE id = ?8 AND batch_id IS NULL AND status IN ({})",
        eligible_status_list()
    );

    let affected = conn.execute(
        &sql,
        params![
            batch_id,
            default_destination,
            exclusions.exclude_releases,
            exclusions.exclude_attachments,
            exclusions.exclude_metadata,
            exclusions.exclude_git_data,
            exclusions.exclude_owner_projects,
            id,
        ],
    )?;
    Ok(affected == 1)
}

pub fn remove_from_batch(conn: &Connection, id: i64, batch_id: i64) -> AppResult<bool> {
    let affected = conn.execute(
        "UPDATE repositories SET batch_id = NULL, updated_at = datetime('now')
         WHERE id = ?1 AND batch_id = ?2",
        params![id, batch_id],
    )?;
    Ok(affected == 1)
}

/// Detach every member of `batch_id`; statuses are untouched.
pub fn clear_batch(conn: &Connection, batch_id: i64) -> AppResult<usize> {
    let affected = conn.execute(
        "UPDATE repositories SET batch_id = NULL, updated_at = datetime('now')
         WHERE batch_id = ?1",
        [batch_id],
    )?;
    Ok(affected)
}

/// Compare-and-set to `wont_migrate`, dropping any batch association.
pub fn mark_wont_migrate(
    conn: &Connection,
    id: i64,
    expected: RepositoryStatus,
) -> AppResult<bool> {
    let affected = conn.execute(
        "UPDATE repositories
         SET status = ?1, batch_id = NULL, updated_at = datetime('now')
         WHERE id = ?2 AND status = ?3",
        params![RepositoryStatus::WontMigrate, id, expected],
    )?;
    Ok(affected == 1)
}

pub fn set_source_locked(conn: &Connection, id: i64, locked: bool) -> AppResult<()> {
    conn.execute(
        "UPDATE repositories SET is_source_locked = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![locked, id],
    )?;
    Ok(())
}

pub fn set_destination(
    conn: &Connection,
    id: i64,
    destination_full_name: Option<&str>,
    exclusions: &ExclusionFlags,
) -> AppResult<()> {
    conn.execute(
        "UPDATE repositories SET
            destination_full_name = ?1,
            exclude_releases = ?2,
            exclude_attachments = ?3,
            exclude_metadata = ?4,
            exclude_git_data = ?5,
            exclude_owner_projects = ?6,
            updated_at = datetime('now')
         WHERE id = ?7",
        params![
            destination_full_name,
            exclusions.exclude_releases,
            exclusions.exclude_attachments,
            exclusions.exclude_metadata,
            exclusions.exclude_git_data,
            exclusions.exclude_owner_projects,
            id,
        ],
    )?;
    Ok(())
}

/// Re-point the destination only if it still holds `previous`.
pub fn replace_destination(
    conn: &Connection,
    id: i64,
    previous: Option<&str>,
    next: &str,
) -> AppResult<bool> {
    let affected = conn.execute(
        "UPDATE repositories SET destination_full_name = ?1, updated_at = datetime('now')
         WHERE id = ?2 AND destination_full_name IS ?3",
        params![next, id, previous],
    )?;
    Ok(affected == 1)
}

/// Linkage a migration worker reports alongside a status change.
#[derive(Debug, Clone, Default)]
pub struct MigrationLinkage<'a> {
    pub source_migration_id: Option<&'a str>,
    pub is_source_locked: Option<bool>,
    pub destination_url: Option<&'a str>,
    pub error: Option<&'a str>,
    pub mark_migrated: bool,
}

pub fn record_worker_report(
    conn: &Connection,
    id: i64,
    expected: RepositoryStatus,
    next: RepositoryStatus,
    linkage: &MigrationLinkage<'_>,
) -> AppResult<bool> {
    let affected = conn.execute(
        "UPDATE repositories SET
            status = ?1,
            source_migration_id = COALESCE(?2, source_migration_id),
            is_source_locked = COALESCE(?3, is_source_locked),
            destination_url = COALESCE(?4, destination_url),
            last_error = ?5,
            migrated_at = CASE WHEN ?6 THEN datetime('now') ELSE migrated_at END,
            updated_at = datetime('now')
         WHERE id = ?7 AND status = ?8",
        params![
            next,
            linkage.source_migration_id,
            linkage.is_source_locked,
            linkage.destination_url,
            linkage.error,
            linkage.mark_migrated,
            id,
            expected,
        ],
    )?;
    Ok(affected == 1)
}

/// Atomically move the highest-priority repository in `from` to `to`.
pub fn claim_next(
    conn: &Connection,
    from: RepositoryStatus,
    to: RepositoryStatus,
) -> AppResult<Option<Repository>> {
    let sql = format!(
        "UPDATE repositories SET status = ?1, updated_at = datetime('now')
         WHERE id = (
            SELECT id FROM repositories WHERE status = ?2 ORDER BY priority DESC, id LIMIT 1
         ) AND status = ?2
         RETURNING {}",
        REPOSITORY_COLUMNS
    );
    let repo = conn
        .query_row(&sql, params![to, from], map_repository)
        .optional()?;
    Ok(repo)
}

pub fn count_for_source(conn: &Connection, source_id: i64) -> AppResult<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM repositories WHERE source_id = ?1",
        [source_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SourcePlatform;
    use crate::test_support::{discovered, insert_repository, test_pool};

    #[test]
    fn test_get_repository_not_found() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();

        let result = get_repository(&conn, 999);
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_upsert_keeps_lifecycle_fields() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();

        let id = upsert_discovered_repository(&conn, &discovered("acme/api")).unwrap();
        assert!(compare_and_set_status(
            &conn,
            id,
            RepositoryStatus::Pending,
            RepositoryStatus::Complete,
            None
        )
        .unwrap());

        let mut again = discovered("acme/api");
        again.size_kb = Some(2048);
        let same_id = upsert_discovered_repository(&conn, &again).unwrap();

        let repo = get_repository(&conn, id).unwrap();
        assert_eq!(same_id, id);
        assert_eq!(repo.status, RepositoryStatus::Complete);
        assert_eq!(repo.size_kb, Some(2048));
    }

    #[test]
    fn test_same_name_on_other_platform_is_a_new_row() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();

        let github = upsert_discovered_repository(&conn, &discovered("acme/api")).unwrap();
        let mut ado = discovered("acme/api");
        ado.source_platform = SourcePlatform::AzureDevOps;
        let ado_id = upsert_discovered_repository(&conn, &ado).unwrap();

        assert_ne!(github, ado_id);
    }

    #[test]
    fn test_compare_and_set_rejects_stale_status() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let id = insert_repository(&conn, "acme/api", RepositoryStatus::DryRunQueued);

        let swapped = compare_and_set_status(
            &conn,
            id,
            RepositoryStatus::Pending,
            RepositoryStatus::DryRunQueued,
            Some(1),
        )
        .unwrap();

        assert!(!swapped);
        assert_eq!(get_repository(&conn, id).unwrap().priority, 0);
    }

    #[test]
    fn test_assign_to_batch_refuses_second_claim() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let first = crate::test_support::insert_batch(&conn, "wave-1");
        let second = crate::test_support::insert_batch(&conn, "wave-2");
        let id = insert_repository(&conn, "acme/api", RepositoryStatus::Pending);

        let flags = ExclusionFlags {
            exclude_releases: true,
            ..Default::default()
        };
        assert!(assign_to_batch(&conn, id, first, Some("dest/api"), &flags).unwrap());
        assert!(!assign_to_batch(&conn, id, second, None, &ExclusionFlags::default()).unwrap());

        let repo = get_repository(&conn, id).unwrap();
        assert_eq!(repo.batch_id, Some(first));
        assert_eq!(repo.destination_full_name.as_deref(), Some("dest/api"));
        assert!(repo.exclusions.exclude_releases);
    }

    #[test]
    fn test_assign_to_batch_rejects_ineligible_status() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let batch = crate::test_support::insert_batch(&conn, "wave-1");
        let id = insert_repository(&conn, "acme/api", RepositoryStatus::Complete);

        assert!(!assign_to_batch(&conn, id, batch, None, &ExclusionFlags::default()).unwrap());
        assert_eq!(get_repository(&conn, id).unwrap().batch_id, None);
    }

    #[test]
    fn test_claim_next_prefers_priority() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let low = insert_repository(&conn, "acme/low", RepositoryStatus::QueuedForMigration);
        let high = insert_repository(&conn, "acme/high", RepositoryStatus::QueuedForMigration);
        conn.execute("UPDATE repositories SET priority = 1 WHERE id = ?1", [high])
            .unwrap();

        let claimed = claim_next(
            &conn,
            RepositoryStatus::QueuedForMigration,
            RepositoryStatus::PreMigration,
        )
        .unwrap()
        .unwrap();
        assert_eq!(claimed.id, high);
        assert_eq!(claimed.status, RepositoryStatus::PreMigration);

        let next = claim_next(
            &conn,
            RepositoryStatus::QueuedForMigration,
            RepositoryStatus::PreMigration,
        )
        .unwrap()
        .unwrap();
        assert_eq!(next.id, low);

        assert!(claim_next(
            &conn,
            RepositoryStatus::QueuedForMigration,
            RepositoryStatus::PreMigration
        )
        .unwrap()
        .is_none());
    }

    #[test]
    fn test_list_filters_by_name_and_status() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        insert_repository(&conn, "acme/api", RepositoryStatus::Pending);
        insert_repository(&conn, "acme/web_app", RepositoryStatus::Complete);
        insert_repository(&conn, "acme/webapp", RepositoryStatus::Pending);

        let filter = RepositoryFilter {
            name_contains: Some("web_".into()),
            ..Default::default()
        };
        let repos = list_repositories(&conn, &filter).unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].full_name, "acme/web_app");

        let pending = list_repositories(
            &conn,
            &RepositoryFilter {
                status: Some(RepositoryStatus::Pending),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(pending.len(), 2);
    }
}
