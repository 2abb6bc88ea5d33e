//! Operations used by migration workers.
//!
//! Workers claim queued repositories and report progress back. Every report
//! goes through the state guard like operator actions do, and a report for a
//! batch member triggers a recomputation of the batch status.

use serde::{Deserialize, Serialize};

use crate::commands::batches::refresh_batch_status;
use crate::db::repositories::{self as ledger, MigrationLinkage};
use crate::db::{DbPool, Repository, RepositoryStatus};
use crate::error::{AppError, AppResult};
use crate::guard::{self, Transition};
use crate::outcome::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    DryRun,
    Migration,
}

impl WorkKind {
    fn claim(&self) -> (RepositoryStatus, Transition) {
        match self {
            WorkKind::DryRun => (RepositoryStatus::DryRunQueued, Transition::StartDryRun),
            WorkKind::Migration => (RepositoryStatus::QueuedForMigration, Transition::StartMigration),
        }
    }
}

/// Claim the highest-priority queued repository of `kind`, oldest first on
/// ties. Returns `None` when the queue is empty.
pub fn claim_next_repository(db: &DbPool, kind: WorkKind) -> AppResult<Option<Repository>> {
    let (from, transition) = kind.claim();
    let to = guard::check(from, transition)?;

    let conn = db.get()?;
    let claimed = ledger::claim_next(&conn, from, to)?;

    if let Some(ref repo) = claimed {
        tracing::info!(
            repository_id = repo.id,
            priority = repo.priority,
            "Claimed {} for {:?}",
            repo.full_name,
            kind
        );
    }
    Ok(claimed)
}

/// Progress a worker reports for a repository it holds.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusReport {
    DryRunSucceeded,
    DryRunFailed {
        error: String,
    },
    /// Moved to the next migration phase. The source migration id and lock
    /// state are usually known once the archive is being generated.
    PhaseAdvanced {
        source_migration_id: Option<String>,
        source_locked: Option<bool>,
    },
    MigrationSucceeded {
        destination_url: Option<String>,
        source_locked: Option<bool>,
    },
    RemediationRequired {
        destination_url: Option<String>,
        detail: String,
    },
    MigrationFailed {
        error: String,
        source_locked: Option<bool>,
    },
    RemediationResolved,
}

impl StatusReport {
    fn transition(&self) -> Transition {
        match self {
            StatusReport::DryRunSucceeded => Transition::CompleteDryRun,
            StatusReport::DryRunFailed { .. } => Transition::FailDryRun,
            StatusReport::PhaseAdvanced { .. } => Transition::AdvanceMigration,
            StatusReport::MigrationSucceeded { .. } => Transition::CompleteMigration,
            StatusReport::RemediationRequired { .. } => Transition::RequireRemediation,
            StatusReport::MigrationFailed { .. } => Transition::FailMigration,
            StatusReport::RemediationResolved => Transition::ResolveRemediation,
        }
    }

    fn linkage(&self) -> MigrationLinkage<'_> {
        match self {
            StatusReport::DryRunSucceeded | StatusReport::RemediationResolved => {
                MigrationLinkage::default()
            }
            StatusReport::DryRunFailed { error } => MigrationLinkage {
                error: Some(error.as_str()),
                ..Default::default()
            },
            StatusReport::PhaseAdvanced {
                source_migration_id,
                source_locked,
            } => MigrationLinkage {
                source_migration_id: source_migration_id.as_deref(),
                is_source_locked: *source_locked,
                ..Default::default()
            },
            StatusReport::MigrationSucceeded {
                destination_url,
                source_locked,
            } => MigrationLinkage {
                destination_url: destination_url.as_deref(),
                is_source_locked: *source_locked,
                mark_migrated: true,
                ..Default::default()
            },
            StatusReport::RemediationRequired {
                destination_url,
                detail,
            } => MigrationLinkage {
                destination_url: destination_url.as_deref(),
                error: Some(detail.as_str()),
                mark_migrated: true,
                ..Default::default()
            },
            StatusReport::MigrationFailed {
                error,
                source_locked,
            } => MigrationLinkage {
                error: Some(error.as_str()),
                is_source_locked: *source_locked,
                ..Default::default()
            },
        }
    }
}

/// Apply a worker report. The repository write must succeed; refreshing the
/// owning batch afterwards is best effort.
pub fn report_repository_status(
    db: &DbPool,
    id: i64,
    report: &StatusReport,
) -> AppResult<Outcome<Repository>> {
    let conn = db.get()?;
    let repo = ledger::get_repository(&conn, id)?;
    let next = guard::check(repo.status, report.transition())?;

    if !ledger::record_worker_report(&conn, id, repo.status, next, &report.linkage())? {
        return Err(AppError::PreconditionFailed(format!(
            "repository '{}' changed status concurrently (expected '{}')",
            repo.full_name, repo.status
        )));
    }

    match next {
        RepositoryStatus::DryRunFailed | RepositoryStatus::MigrationFailed => tracing::warn!(
            repository_id = id,
            "Repository {} moved {} -> {}",
            repo.full_name,
            repo.status,
            next
        ),
        _ => tracing::info!(
            repository_id = id,
            "Repository {} moved {} -> {}",
            repo.full_name,
            repo.status,
            next
        ),
    }

    let mut outcome = Outcome::new(());
    if let Some(batch_id) = repo.batch_id {
        if let Err(e) = refresh_batch_status(&conn, batch_id) {
            outcome.warn(format!("failed to refresh status of batch {}: {}", batch_id, e));
        }
    }

    let repo = ledger::get_repository(&conn, id)?;
    Ok(outcome.map(|_| repo))
}
