use rusqlite::Connection;
use serde::Deserialize;

use crate::commands::batches::refresh_batch_status;
use crate::db::migration_logs::{append_log, list_logs};
use crate::db::repositories as ledger;
use crate::db::{
    DbPool, ExclusionFlags, LogOperation, MigrationLog, MigrationPhase, Repository,
    RepositoryFilter, RepositoryStatus,
};
use crate::error::{AppError, AppResult};
use crate::guard::{self, Transition};
use crate::outcome::Outcome;

/// Apply `transition` to `repo` through the guard and a compare-and-set write.
pub(crate) fn transition_repository(
    conn: &Connection,
    repo: &Repository,
    transition: Transition,
    priority: Option<i64>,
) -> AppResult<RepositoryStatus> {
    let next = guard::check(repo.status, transition)?;

    if !ledger::compare_and_set_status(conn, repo.id, repo.status, next, priority)? {
        return Err(AppError::PreconditionFailed(format!(
            "repository '{}' changed status concurrently (expected '{}')",
            repo.full_name, repo.status
        )));
    }

    tracing::debug!(
        repository_id = repo.id,
        "Repository {} moved {} -> {}",
        repo.full_name,
        repo.status,
        next
    );
    Ok(next)
}

/// Append an audit entry; a failure becomes a warning on `outcome`.
pub(crate) fn log_best_effort<T>(
    conn: &Connection,
    outcome: &mut Outcome<T>,
    repository_id: i64,
    phase: MigrationPhase,
    operation: LogOperation,
    message: &str,
    initiated_by: Option<&str>,
) {
    if let Err(e) = append_log(conn, repository_id, phase, operation, message, initiated_by) {
        outcome.warn(format!(
            "failed to write migration log for repository {}: {}",
            repository_id, e
        ));
    }
}

/// Statuses in which a repository's migration settings are frozen.
fn is_busy(status: RepositoryStatus) -> bool {
    matches!(
        status,
        RepositoryStatus::DryRunQueued | RepositoryStatus::QueuedForMigration
    ) || guard::IN_FLIGHT.contains(&status)
}

pub fn get_repository(db: &DbPool, id: i64) -> AppResult<Repository> {
    let conn = db.get()?;
    ledger::get_repository(&conn, id)
}

pub fn list_repositories(db: &DbPool, filter: &RepositoryFilter) -> AppResult<Vec<Repository>> {
    if let Some(limit) = filter.limit {
        if limit <= 0 {
            return Err(AppError::InvalidInput("limit must be a positive number".into()));
        }
    }
    let conn = db.get()?;
    ledger::list_repositories(&conn, filter)
}

pub fn list_migration_logs(db: &DbPool, repository_id: i64) -> AppResult<Vec<MigrationLog>> {
    let conn = db.get()?;
    ledger::get_repository(&conn, repository_id)?;
    list_logs(&conn, repository_id)
}

/// Update destination request; `None` keeps the current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateRepositoryDestination {
    pub destination_full_name: Option<String>,
    pub exclusions: Option<ExclusionFlags>,
}

fn validate_full_name(value: &str) -> AppResult<String> {
    let trimmed = value.trim();
    match trimmed.split_once('/') {
        Some((org, name)) if !org.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok(trimmed.to_string())
        }
        _ => Err(AppError::InvalidInput(format!(
            "destination must be in 'org/name' form, got '{}'",
            value
        ))),
    }
}

pub fn update_repository_destination(
    db: &DbPool,
    id: i64,
    request: &UpdateRepositoryDestination,
) -> AppResult<Repository> {
    let conn = db.get()?;
    let repo = ledger::get_repository(&conn, id)?;

    if is_busy(repo.status) {
        return Err(AppError::PreconditionFailed(format!(
            "cannot edit repository '{}' while its status is '{}'",
            repo.full_name, repo.status
        )));
    }

    let destination = match &request.destination_full_name {
        Some(name) => Some(validate_full_name(name)?),
        None => repo.destination_full_name.clone(),
    };
    let exclusions = request.exclusions.unwrap_or(repo.exclusions);

    ledger::set_destination(&conn, id, destination.as_deref(), &exclusions)?;
    ledger::get_repository(&conn, id)
}

pub fn queue_repository_dry_run(
    db: &DbPool,
    id: i64,
    initiated_by: Option<&str>,
) -> AppResult<Outcome<Repository>> {
    let conn = db.get()?;
    let repo = ledger::get_repository(&conn, id)?;

    transition_repository(&conn, &repo, Transition::QueueDryRun { only_pending: false }, None)?;
    tracing::info!(repository_id = id, "Queued dry run for {}", repo.full_name);

    let mut outcome = Outcome::new(());
    log_best_effort(
        &conn,
        &mut outcome,
        id,
        MigrationPhase::DryRun,
        LogOperation::Queue,
        "Dry run queued",
        initiated_by,
    );

    let repo = ledger::get_repository(&conn, id)?;
    Ok(outcome.map(|_| repo))
}

/// Reject repositories the source platform still holds a migration lock on.
pub(crate) fn ensure_source_unlocked(repo: &Repository) -> AppResult<()> {
    if repo.is_source_locked {
        return Err(AppError::PreconditionFailed(format!(
            "repository '{}' is locked on the source; unlock it before queueing a migration",
            repo.full_name
        )));
    }
    Ok(())
}

pub fn queue_repository_migration(
    db: &DbPool,
    id: i64,
    initiated_by: Option<&str>,
) -> AppResult<Outcome<Repository>> {
    let conn = db.get()?;
    let repo = ledger::get_repository(&conn, id)?;

    guard::check(repo.status, Transition::QueueMigration)?;
    ensure_source_unlocked(&repo)?;
    transition_repository(&conn, &repo, Transition::QueueMigration, None)?;
    tracing::info!(repository_id = id, "Queued migration for {}", repo.full_name);

    let mut outcome = Outcome::new(());
    log_best_effort(
        &conn,
        &mut outcome,
        id,
        MigrationPhase::Migration,
        LogOperation::Queue,
        "Migration queued",
        initiated_by,
    );

    let repo = ledger::get_repository(&conn, id)?;
    Ok(outcome.map(|_| repo))
}

/// Apply an operator transition. A batch member may have been the last one
/// holding its batch open, so the batch status is refreshed best effort.
fn apply_operator_transition(
    db: &DbPool,
    id: i64,
    transition: Transition,
) -> AppResult<Outcome<Repository>> {
    let conn = db.get()?;
    let repo = ledger::get_repository(&conn, id)?;

    transition_repository(&conn, &repo, transition, None)?;
    tracing::info!(
        repository_id = id,
        "Operator action '{}' applied to {}",
        transition.label(),
        repo.full_name
    );

    let mut outcome = Outcome::new(());
    if let Some(batch_id) = repo.batch_id {
        if let Err(e) = refresh_batch_status(&conn, batch_id) {
            outcome.warn(format!("failed to refresh status of batch {}: {}", batch_id, e));
        }
    }

    let repo = ledger::get_repository(&conn, id)?;
    Ok(outcome.map(|_| repo))
}

pub fn rollback_repository(db: &DbPool, id: i64) -> AppResult<Outcome<Repository>> {
    apply_operator_transition(db, id, Transition::Rollback)
}

/// Send a repository stuck in flight back to `pending`.
pub fn reset_stuck_repository(db: &DbPool, id: i64) -> AppResult<Outcome<Repository>> {
    apply_operator_transition(db, id, Transition::ResetStuck)
}

pub fn unmark_wont_migrate(db: &DbPool, id: i64) -> AppResult<Outcome<Repository>> {
    apply_operator_transition(db, id, Transition::UnmarkWontMigrate)
}

/// Exclude a repository from migration; it also leaves its batch.
pub fn mark_wont_migrate(db: &DbPool, id: i64) -> AppResult<Repository> {
    let conn = db.get()?;
    let repo = ledger::get_repository(&conn, id)?;

    guard::check(repo.status, Transition::MarkWontMigrate)?;
    if !ledger::mark_wont_migrate(&conn, id, repo.status)? {
        return Err(AppError::PreconditionFailed(format!(
            "repository '{}' changed status concurrently (expected '{}')",
            repo.full_name, repo.status
        )));
    }

    tracing::info!(repository_id = id, "Marked {} as won't migrate", repo.full_name);
    ledger::get_repository(&conn, id)
}

/// Clear the source-side migration lock flag.
pub fn unlock_source_repository(db: &DbPool, id: i64) -> AppResult<Repository> {
    let conn = db.get()?;
    let repo = ledger::get_repository(&conn, id)?;

    if !repo.is_source_locked {
        return Err(AppError::PreconditionFailed(format!(
            "repository '{}' is not locked on the source",
            repo.full_name
        )));
    }

    ledger::set_source_locked(&conn, id, false)?;
    tracing::info!(repository_id = id, "Unlocked source repository {}", repo.full_name);
    ledger::get_repository(&conn, id)
}
