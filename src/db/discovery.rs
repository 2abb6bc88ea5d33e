use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{is_unique_violation, DiscoveryProgress, DiscoveryStatus, DiscoveryType};
use crate::error::{AppError, AppResult};

/// Phase label written while a cancellation is pending.
pub const PHASE_CANCELLING: &str = "cancelling";

const PROGRESS_COLUMNS: &str = "id, discovery_type, target, projects, source_id, status, phase,
    total_orgs, processed_orgs, total_repos, processed_repos, error_count, last_error,
    started_at, completed_at";

fn map_progress(row: &Row<'_>) -> rusqlite::Result<DiscoveryProgress> {
    let projects: Option<String> = row.get(3)?;
    let projects = projects
        .map(|raw| serde_json::from_str::<Vec<String>>(&raw))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(DiscoveryProgress {
        id: row.get(0)?,
        discovery_type: row.get(1)?,
        target: row.get(2)?,
        projects,
        source_id: row.get(4)?,
        status: row.get(5)?,
        phase: row.get(6)?,
        total_orgs: row.get(7)?,
        processed_orgs: row.get(8)?,
        total_repos: row.get(9)?,
        processed_repos: row.get(10)?,
        error_count: row.get(11)?,
        last_error: row.get(12)?,
        started_at: row.get(13)?,
        completed_at: row.get(14)?,
    })
}

/// Insert a new in-progress run. The partial unique index on
/// `status = 'in_progress'` turns a lost check-then-insert race into
/// [`AppError::DiscoveryInProgress`].
pub fn insert_progress(
    conn: &Connection,
    discovery_type: DiscoveryType,
    target: &str,
    projects: Option<&[String]>,
    source_id: Option<i64>,
) -> AppResult<DiscoveryProgress> {
    let projects_json = projects.map(serde_json::to_string).transpose()?;
    let total_orgs: i64 = match discovery_type {
        DiscoveryType::Organization | DiscoveryType::AdoOrganization => 1,
        DiscoveryType::AdoProjects => projects.map(|p| p.len() as i64).unwrap_or(0),
        DiscoveryType::Enterprise => 0,
    };

    let result = conn.execute(
        "INSERT INTO discovery_progress (discovery_type, target, projects, source_id, status, total_orgs)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            discovery_type,
            target,
            projects_json,
            source_id,
            DiscoveryStatus::InProgress,
            total_orgs,
        ],
    );

    match result {
        Ok(_) => get_progress(conn, conn.last_insert_rowid()),
        Err(e) if is_unique_violation(&e) => Err(AppError::DiscoveryInProgress),
        Err(e) => Err(e.into()),
    }
}

pub fn get_progress(conn: &Connection, id: i64) -> AppResult<DiscoveryProgress> {
    let sql = format!("SELECT {} FROM discovery_progress WHERE id = ?1", PROGRESS_COLUMNS);
    conn.query_row(&sql, [id], map_progress)
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("Discovery progress {} not found", id)))
}

pub fn find_active(conn: &Connection) -> AppResult<Option<DiscoveryProgress>> {
    let sql = format!(
        "SELECT {} FROM discovery_progress WHERE status = ?1",
        PROGRESS_COLUMNS
    );
    let progress = conn
        .query_row(&sql, [DiscoveryStatus::InProgress], map_progress)
        .optional()?;
    Ok(progress)
}

pub fn list_history(conn: &Connection, limit: i64) -> AppResult<Vec<DiscoveryProgress>> {
    let sql = format!(
        "SELECT {} FROM discovery_progress ORDER BY id DESC LIMIT ?1",
        PROGRESS_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([limit], map_progress)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn set_phase(conn: &Connection, id: i64, phase: &str) -> AppResult<()> {
    conn.execute(
        "UPDATE discovery_progress SET phase = ?1 WHERE id = ?2 AND status = ?3",
        params![phase, id, DiscoveryStatus::InProgress],
    )?;
    Ok(())
}

/// Counters accumulated by a progress tracker between flushes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub phase: Option<String>,
    pub total_orgs: Option<i64>,
    pub processed_orgs: i64,
    pub total_repos: i64,
    pub processed_repos: i64,
    pub error_count: i64,
    pub last_error: Option<String>,
}

/// Persist a tracker snapshot. A pending cancellation keeps its phase label.
pub fn write_snapshot(conn: &Connection, id: i64, snapshot: &ProgressSnapshot) -> AppResult<()> {
    conn.execute(
        "UPDATE discovery_progress SET
            phase = CASE WHEN phase = ?1 OR ?2 IS NULL THEN phase ELSE ?2 END,
            total_orgs = COALESCE(?3, total_orgs),
            processed_orgs = ?4,
            total_repos = ?5,
            processed_repos = ?6,
            error_count = ?7,
            last_error = COALESCE(?8, last_error)
         WHERE id = ?9",
        params![
            PHASE_CANCELLING,
            snapshot.phase,
            snapshot.total_orgs,
            snapshot.processed_orgs,
            snapshot.total_repos,
            snapshot.processed_repos,
            snapshot.error_count,
            snapshot.last_error,
            id,
        ],
    )?;
    Ok(())
}

/// Close the run. Only the first call has an effect.
pub fn finalize(
    conn: &Connection,
    id: i64,
    status: DiscoveryStatus,
    error: Option<&str>,
) -> AppResult<bool> {
    let affected = conn.execute(
        "UPDATE discovery_progress SET
            status = ?1,
            phase = ?2,
            last_error = COALESCE(?3, last_error),
            completed_at = datetime('now')
         WHERE id = ?4 AND status = ?5",
        params![status, status.as_str(), error, id, DiscoveryStatus::InProgress],
    )?;
    Ok(affected == 1)
}
