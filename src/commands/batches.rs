//! Batch executor.
//!
//! Bulk operations walk the members of a batch one at a time. Each repository
//! is validated by the state guard and written with a single compare-and-set
//! statement; a repository that fails either step is skipped and counted, it
//! never aborts the rest of the batch. The call itself only fails when nothing
//! at all could be done.

use rusqlite::Connection;
use serde::Serialize;

use crate::commands::repositories::{ensure_source_unlocked, log_best_effort, transition_repository};
use crate::db::batches::{self as store, BatchStamp};
use crate::db::repositories as ledger;
use crate::db::{
    Batch, BatchStatus, CreateBatch, DbPool, LogOperation, MigrationPhase, Repository,
    RepositoryStatus, UpdateBatch,
};
use crate::error::{AppError, AppResult};
use crate::guard::{self, Transition};
use crate::outcome::Outcome;

/// A repository the operation left alone, and why.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SkippedRepository {
    pub repository_id: i64,
    pub full_name: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MembershipResult {
    pub repositories_added: usize,
    pub repositories_removed: usize,
    pub skipped: Vec<SkippedRepository>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueResult {
    pub batch: Batch,
    pub queued: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryResult {
    pub batch: Batch,
    pub retried: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CascadeSummary {
    pub updated: usize,
    /// Following the default, but the batch no longer has one.
    pub unchanged: usize,
    pub customized: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchUpdate {
    pub batch: Batch,
    pub cascade: CascadeSummary,
}

fn ensure_editable(batch: &Batch, action: &str) -> AppResult<()> {
    if !batch.status.is_editable() {
        return Err(AppError::PreconditionFailed(format!(
            "cannot {} batch '{}' with status '{}'",
            action, batch.name, batch.status
        )));
    }
    Ok(())
}

fn validate_name(name: &str) -> AppResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidInput("batch name cannot be empty".into()));
    }
    Ok(trimmed.to_string())
}

fn normalize_org(org: Option<&str>) -> Option<String> {
    org.map(str::trim)
        .filter(|o| !o.is_empty())
        .map(|o| o.trim_end_matches('/').to_string())
}

fn default_destination(org: Option<&str>, repo: &Repository) -> Option<String> {
    org.map(|org| format!("{}/{}", org, repo.name()))
}

fn dedup_ids(ids: &[i64]) -> AppResult<Vec<i64>> {
    if ids.is_empty() {
        return Err(AppError::InvalidInput("no repository ids given".into()));
    }
    let mut seen = std::collections::HashSet::new();
    Ok(ids.iter().copied().filter(|id| seen.insert(*id)).collect())
}

pub fn create_batch(db: &DbPool, request: &CreateBatch) -> AppResult<Batch> {
    let request = CreateBatch {
        name: validate_name(&request.name)?,
        destination_org: normalize_org(request.destination_org.as_deref()),
        ..request.clone()
    };

    let conn = db.get()?;
    let id = store::insert_batch(&conn, &request)?;
    tracing::info!(batch_id = id, "Created batch '{}'", request.name);
    store::get_batch(&conn, id)
}

pub fn get_batch(db: &DbPool, id: i64) -> AppResult<Batch> {
    let conn = db.get()?;
    store::get_batch(&conn, id)
}

pub fn list_batches(db: &DbPool) -> AppResult<Vec<Batch>> {
    let conn = db.get()?;
    store::list_batches(&conn)
}

pub fn batch_repositories(db: &DbPool, id: i64) -> AppResult<Vec<Repository>> {
    let conn = db.get()?;
    store::get_batch(&conn, id)?;
    ledger::list_batch_repositories(&conn, id)
}

/// Edit batch attributes. A changed destination organization is cascaded to
/// members that still use the batch default.
pub fn update_batch(db: &DbPool, id: i64, request: &UpdateBatch) -> AppResult<Outcome<BatchUpdate>> {
    let conn = db.get()?;
    let current = store::get_batch(&conn, id)?;
    ensure_editable(&current, "edit")?;

    let mut updated = current.clone();
    if let Some(ref name) = request.name {
        updated.name = validate_name(name)?;
    }
    if let Some(ref description) = request.description {
        updated.description = Some(description.clone()).filter(|d| !d.trim().is_empty());
    }
    if let Some(batch_type) = request.batch_type {
        updated.batch_type = batch_type;
    }
    if let Some(api) = request.migration_api {
        updated.migration_api = api;
    }
    if let Some(ref org) = request.destination_org {
        updated.destination_org = normalize_org(Some(org.as_str()));
    }
    if let Some(exclusions) = request.exclusions {
        updated.exclusions = exclusions;
    }

    store::save_batch(&conn, &updated)?;
    tracing::info!(batch_id = id, "Updated batch '{}'", updated.name);

    let mut outcome = Outcome::new(CascadeSummary::default());
    if updated.destination_org != current.destination_org {
        cascade_destination(
            &conn,
            &mut outcome,
            id,
            current.destination_org.as_deref(),
            updated.destination_org.as_deref(),
        )?;
    }

    let batch = store::get_batch(&conn, id)?;
    Ok(outcome.map(|cascade| BatchUpdate { batch, cascade }))
}

/// Re-point members whose destination is unset or still equals the old
/// default. Customized destinations are left untouched.
fn cascade_destination(
    conn: &Connection,
    outcome: &mut Outcome<CascadeSummary>,
    batch_id: i64,
    old_org: Option<&str>,
    new_org: Option<&str>,
) -> AppResult<()> {
    for repo in ledger::list_batch_repositories(conn, batch_id)? {
        let current = repo.destination_full_name.as_deref();
        let old_default = default_destination(old_org, &repo);
        let follows_default = match current {
            None => true,
            Some(dest) => old_default.as_deref() == Some(dest),
        };

        if !follows_default {
            outcome.value.customized += 1;
            continue;
        }

        let Some(next) = default_destination(new_org, &repo) else {
            outcome.value.unchanged += 1;
            continue;
        };

        match ledger::replace_destination(conn, repo.id, current, &next) {
            Ok(true) => outcome.value.updated += 1,
            Ok(false) => {
                outcome.value.failed += 1;
                outcome.warn(format!(
                    "destination of '{}' changed while cascading batch {}",
                    repo.full_name, batch_id
                ));
            }
            Err(e) => {
                outcome.value.failed += 1;
                outcome.warn(format!(
                    "failed to update destination of '{}': {}",
                    repo.full_name, e
                ));
            }
        }
    }

    tracing::info!(
        batch_id,
        updated = outcome.value.updated,
        unchanged = outcome.value.unchanged,
        customized = outcome.value.customized,
        failed = outcome.value.failed,
        "Cascaded destination organization"
    );
    Ok(())
}

/// Delete a batch that is not running. Members keep their status and only
/// lose the batch association. Returns the number of detached repositories.
pub fn delete_batch(db: &DbPool, id: i64) -> AppResult<usize> {
    let mut conn = db.get()?;
    let tx = conn.transaction()?;

    let batch = store::get_batch(&tx, id)?;
    if batch.status == BatchStatus::InProgress {
        return Err(AppError::PreconditionFailed(format!(
            "cannot delete batch '{}' while it is in progress",
            batch.name
        )));
    }

    let detached = ledger::clear_batch(&tx, id)?;
    store::delete_batch(&tx, id)?;
    tx.commit()?;

    tracing::info!(batch_id = id, detached, "Deleted batch '{}'", batch.name);
    Ok(detached)
}

fn ineligibility_reason(repo: &Repository, batch_id: i64) -> Option<String> {
    if let Some(existing) = repo.batch_id {
        return Some(if existing == batch_id {
            "already in this batch".to_string()
        } else {
            format!("already assigned to batch {}", existing)
        });
    }

    if !guard::is_batch_eligible(repo.status) {
        return Some(format!(
            "status '{}' is not eligible for batch assignment",
            repo.status
        ));
    }
    None
}

/// Add repositories to a batch. Ineligible repositories are reported one by
/// one; the call fails only when none could be added.
pub fn add_repositories_to_batch(
    db: &DbPool,
    batch_id: i64,
    repository_ids: &[i64],
) -> AppResult<MembershipResult> {
    let ids = dedup_ids(repository_ids)?;
    let conn = db.get()?;
    let batch = store::get_batch(&conn, batch_id)?;
    ensure_editable(&batch, "add repositories to")?;

    let mut result = MembershipResult::default();
    for id in ids {
        let Some(repo) = ledger::find_repository(&conn, id)? else {
            result.skipped.push(SkippedRepository {
                repository_id: id,
                full_name: None,
                reason: "repository not found".into(),
            });
            continue;
        };

        if let Some(reason) = ineligibility_reason(&repo, batch_id) {
            tracing::debug!(batch_id, "Skipping {}: {}", repo.full_name, reason);
            result.skipped.push(SkippedRepository {
                repository_id: id,
                full_name: Some(repo.full_name),
                reason,
            });
            continue;
        }

        let destination = default_destination(batch.destination_org.as_deref(), &repo);
        if ledger::assign_to_batch(&conn, id, batch_id, destination.as_deref(), &batch.exclusions)? {
            result.repositories_added += 1;
        } else {
            result.skipped.push(SkippedRepository {
                repository_id: id,
                full_name: Some(repo.full_name),
                reason: "repository changed concurrently and is no longer eligible".into(),
            });
        }
    }

    if result.repositories_added == 0 {
        return Err(AppError::PreconditionFailed(format!(
            "no eligible repositories to add: {}",
            describe_skipped(&result.skipped)
        )));
    }

    tracing::info!(
        batch_id,
        added = result.repositories_added,
        skipped = result.skipped.len(),
        "Added repositories to batch '{}'",
        batch.name
    );
    Ok(result)
}

pub fn remove_repositories_from_batch(
    db: &DbPool,
    batch_id: i64,
    repository_ids: &[i64],
) -> AppResult<MembershipResult> {
    let ids = dedup_ids(repository_ids)?;
    let conn = db.get()?;
    let batch = store::get_batch(&conn, batch_id)?;
    ensure_editable(&batch, "remove repositories from")?;

    let mut result = MembershipResult::default();
    for id in ids {
        let repo = ledger::find_repository(&conn, id)?;
        let full_name = repo.as_ref().map(|r| r.full_name.clone());

        let reason = match repo {
            None => "repository not found",
            Some(r) if r.batch_id != Some(batch_id) => "not a member of this batch",
            Some(_) => {
                if ledger::remove_from_batch(&conn, id, batch_id)? {
                    result.repositories_removed += 1;
                    continue;
                }
                "repository changed concurrently"
            }
        };

        result.skipped.push(SkippedRepository {
            repository_id: id,
            full_name,
            reason: reason.to_string(),
        });
    }

    if result.repositories_removed == 0 {
        return Err(AppError::PreconditionFailed(format!(
            "no repositories removed: {}",
            describe_skipped(&result.skipped)
        )));
    }

    tracing::info!(
        batch_id,
        removed = result.repositories_removed,
        "Removed repositories from batch '{}'",
        batch.name
    );
    Ok(result)
}

fn describe_skipped(skipped: &[SkippedRepository]) -> String {
    skipped
        .iter()
        .map(|s| match s.full_name {
            Some(ref name) => format!("{} ({})", name, s.reason),
            None => format!("#{} ({})", s.repository_id, s.reason),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

struct QueueCounts {
    queued: usize,
    skipped: usize,
}

/// Queue every member that passes the guard (and `extra_check`).
fn queue_members(
    conn: &Connection,
    outcome: &mut Outcome<()>,
    batch: &Batch,
    transition: Transition,
    phase: MigrationPhase,
    initiated_by: Option<&str>,
    extra_check: impl Fn(&Repository) -> AppResult<()>,
) -> AppResult<QueueCounts> {
    let priority = batch.batch_type.priority();
    let message = match phase {
        MigrationPhase::DryRun => format!("Dry run queued by batch '{}'", batch.name),
        MigrationPhase::Migration => format!("Migration queued by batch '{}'", batch.name),
    };

    let mut counts = QueueCounts {
        queued: 0,
        skipped: 0,
    };

    for repo in ledger::list_batch_repositories(conn, batch.id)? {
        let queued = guard::check(repo.status, transition)
            .and_then(|_| extra_check(&repo))
            .and_then(|_| transition_repository(conn, &repo, transition, Some(priority)));

        match queued {
            Ok(_) => {
                counts.queued += 1;
                log_best_effort(
                    conn,
                    outcome,
                    repo.id,
                    phase,
                    LogOperation::Queue,
                    &message,
                    initiated_by,
                );
            }
            Err(e) if e.is_client_error() => {
                tracing::debug!(batch_id = batch.id, "Skipping {}: {}", repo.full_name, e);
                counts.skipped += 1;
            }
            Err(e) => {
                counts.skipped += 1;
                outcome.warn(format!("failed to queue '{}': {}", repo.full_name, e));
            }
        }
    }

    Ok(counts)
}

fn mark_batch_in_progress(
    conn: &Connection,
    outcome: &mut Outcome<()>,
    batch: &Batch,
    stamp: BatchStamp,
) -> AppResult<()> {
    if !store::update_batch_status(conn, batch.id, batch.status, BatchStatus::InProgress, stamp)? {
        outcome.warn(format!(
            "batch '{}' changed status while repositories were being queued",
            batch.name
        ));
    }
    Ok(())
}

fn load_members_batch(conn: &Connection, batch_id: i64, action: &str) -> AppResult<Batch> {
    let batch = store::get_batch(conn, batch_id)?;
    ensure_editable(&batch, action)?;

    if ledger::list_batch_repositories(conn, batch_id)?.is_empty() {
        return Err(AppError::PreconditionFailed(format!(
            "batch '{}' has no repositories",
            batch.name
        )));
    }
    Ok(batch)
}

/// Queue a dry run for every eligible member and move the batch to
/// `in_progress`. With `only_pending`, members that already have a
/// successful dry run are left alone.
pub fn dry_run_batch(
    db: &DbPool,
    batch_id: i64,
    only_pending: bool,
    initiated_by: Option<&str>,
) -> AppResult<Outcome<QueueResult>> {
    let conn = db.get()?;
    let batch = load_members_batch(&conn, batch_id, "run a dry run for")?;

    let mut outcome = Outcome::new(());
    let counts = queue_members(
        &conn,
        &mut outcome,
        &batch,
        Transition::QueueDryRun { only_pending },
        MigrationPhase::DryRun,
        initiated_by,
        |_| Ok(()),
    )?;

    if counts.queued == 0 {
        return Err(AppError::PreconditionFailed(format!(
            "no repositories to run dry run, {} skipped",
            counts.skipped
        )));
    }

    mark_batch_in_progress(&conn, &mut outcome, &batch, BatchStamp::DryRun)?;
    tracing::info!(
        batch_id,
        queued = counts.queued,
        skipped = counts.skipped,
        "Queued dry run for batch '{}'",
        batch.name
    );

    let batch = store::get_batch(&conn, batch_id)?;
    Ok(outcome.map(|_| QueueResult {
        batch,
        queued: counts.queued,
        skipped: counts.skipped,
    }))
}

/// Queue the migration of every eligible member. A batch that never ran a
/// dry run (still `pending`) is only started when `skip_dry_run` is set.
pub fn start_batch(
    db: &DbPool,
    batch_id: i64,
    skip_dry_run: bool,
    initiated_by: Option<&str>,
) -> AppResult<Outcome<QueueResult>> {
    let conn = db.get()?;
    let batch = load_members_batch(&conn, batch_id, "start")?;

    if batch.status == BatchStatus::Pending && !skip_dry_run {
        return Err(AppError::PreconditionFailed(format!(
            "batch '{}' has not completed a dry run; run one first or set skip_dry_run",
            batch.name
        )));
    }

    let mut outcome = Outcome::new(());
    let counts = queue_members(
        &conn,
        &mut outcome,
        &batch,
        Transition::QueueMigration,
        MigrationPhase::Migration,
        initiated_by,
        ensure_source_unlocked,
    )?;

    if counts.queued == 0 {
        return Err(AppError::PreconditionFailed(format!(
            "no repositories to migrate, {} skipped",
            counts.skipped
        )));
    }

    mark_batch_in_progress(&conn, &mut outcome, &batch, BatchStamp::Started)?;
    tracing::info!(
        batch_id,
        queued = counts.queued,
        skipped = counts.skipped,
        "Started batch '{}'",
        batch.name
    );

    let batch = store::get_batch(&conn, batch_id)?;
    Ok(outcome.map(|_| QueueResult {
        batch,
        queued: counts.queued,
        skipped: counts.skipped,
    }))
}

/// Re-queue failed members for migration.
///
/// With explicit `repository_ids`, every id must be a failed member of the
/// batch or nothing is retried. Without them, all failed members are retried
/// and the rest are ignored.
pub fn retry_batch_failures(
    db: &DbPool,
    batch_id: i64,
    repository_ids: Option<&[i64]>,
    initiated_by: Option<&str>,
) -> AppResult<Outcome<RetryResult>> {
    let conn = db.get()?;
    let batch = store::get_batch(&conn, batch_id)?;

    let candidates: Vec<Repository> = match repository_ids {
        Some(ids) => {
            let mut selected = Vec::new();
            for id in dedup_ids(ids)? {
                let repo = ledger::get_repository(&conn, id)?;
                if repo.batch_id != Some(batch_id) {
                    return Err(AppError::PreconditionFailed(format!(
                        "repository '{}' does not belong to batch '{}'",
                        repo.full_name, batch.name
                    )));
                }
                if !repo.status.is_failed() {
                    return Err(AppError::PreconditionFailed(format!(
                        "repository '{}' has status '{}' and cannot be retried",
                        repo.full_name, repo.status
                    )));
                }
                selected.push(repo);
            }
            selected
        }
        None => ledger::list_batch_repositories(&conn, batch_id)?
            .into_iter()
            .filter(|r| r.status.is_failed())
            .collect(),
    };

    if candidates.is_empty() {
        return Err(AppError::PreconditionFailed(format!(
            "no failed repositories to retry in batch '{}'",
            batch.name
        )));
    }

    let priority = batch.batch_type.priority();
    let mut outcome = Outcome::new(());
    let mut retried = 0;
    let mut failed = 0;

    for repo in &candidates {
        match transition_repository(&conn, repo, Transition::RetryFailed, Some(priority)) {
            Ok(_) => {
                retried += 1;
                log_best_effort(
                    &conn,
                    &mut outcome,
                    repo.id,
                    MigrationPhase::Migration,
                    LogOperation::Retry,
                    &format!("Retry queued after {}", repo.status),
                    initiated_by,
                );
            }
            Err(e) => {
                failed += 1;
                outcome.warn(format!("failed to retry '{}': {}", repo.full_name, e));
            }
        }
    }

    if retried == 0 {
        return Err(AppError::PreconditionFailed(format!(
            "no repositories retried, {} failed",
            failed
        )));
    }

    if batch.status != BatchStatus::InProgress {
        let stamp = if batch.started_at.is_none() {
            BatchStamp::Started
        } else {
            BatchStamp::None
        };
        mark_batch_in_progress(&conn, &mut outcome, &batch, stamp)?;
    }

    tracing::info!(batch_id, retried, failed, "Retried failures in batch '{}'", batch.name);

    let batch = store::get_batch(&conn, batch_id)?;
    Ok(outcome.map(|_| RetryResult {
        batch,
        retried,
        failed,
    }))
}

fn is_active(status: RepositoryStatus) -> bool {
    matches!(
        status,
        RepositoryStatus::DryRunQueued | RepositoryStatus::QueuedForMigration
    ) || guard::IN_FLIGHT.contains(&status)
}

/// Recompute the status of a running batch from its members. Returns the new
/// status when it changed.
pub fn refresh_batch_status(conn: &Connection, batch_id: i64) -> AppResult<Option<BatchStatus>> {
    let batch = store::get_batch(conn, batch_id)?;
    if batch.status != BatchStatus::InProgress {
        return Ok(None);
    }

    let members = ledger::list_batch_repositories(conn, batch_id)?;
    if members.is_empty() || members.iter().any(|r| is_active(r.status)) {
        return Ok(None);
    }

    // A batch that never started has only been through a dry run. Once
    // started, a member reset back to pending never migrated.
    let (next, stamp) = if batch.started_at.is_none() {
        (BatchStatus::Ready, BatchStamp::None)
    } else if members.iter().any(|r| {
        r.status.is_failed()
            || matches!(
                r.status,
                RepositoryStatus::RemediationRequired | RepositoryStatus::Pending
            )
    }) {
        (BatchStatus::CompletedWithErrors, BatchStamp::Completed)
    } else {
        (BatchStatus::Completed, BatchStamp::Completed)
    };

    if store::update_batch_status(conn, batch_id, BatchStatus::InProgress, next, stamp)? {
        tracing::info!(batch_id, "Batch '{}' is now {}", batch.name, next);
        return Ok(Some(next));
    }
    Ok(None)
}
