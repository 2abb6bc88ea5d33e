//! Repository status state machine.
//!
//! Every status write in the crate goes through [`check`]; call sites never
//! compare status text directly. Operator and batch transitions come first,
//! followed by the transitions migration workers report.

use serde::{Deserialize, Serialize};

use crate::db::RepositoryStatus;
use crate::error::{AppError, AppResult};

use RepositoryStatus::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Queue a dry run. `only_pending` restricts the source set to repositories
    /// that have never succeeded a dry run or have failed since.
    QueueDryRun { only_pending: bool },
    QueueMigration,
    RetryFailed,
    ResetStuck,
    Rollback,
    MarkWontMigrate,
    UnmarkWontMigrate,

    StartDryRun,
    CompleteDryRun,
    FailDryRun,
    StartMigration,
    /// Move to the next in-flight migration phase.
    AdvanceMigration,
    CompleteMigration,
    RequireRemediation,
    FailMigration,
    ResolveRemediation,
}

impl Transition {
    pub fn label(&self) -> &'static str {
        match self {
            Transition::QueueDryRun { .. } => "queue dry run for",
            Transition::QueueMigration => "queue migration for",
            Transition::RetryFailed => "retry",
            Transition::ResetStuck => "reset",
            Transition::Rollback => "roll back",
            Transition::MarkWontMigrate => "mark as won't migrate",
            Transition::UnmarkWontMigrate => "unmark won't migrate for",
            Transition::StartDryRun => "start dry run for",
            Transition::CompleteDryRun => "complete dry run for",
            Transition::FailDryRun => "fail dry run for",
            Transition::StartMigration => "start migration for",
            Transition::AdvanceMigration => "advance migration for",
            Transition::CompleteMigration => "complete migration for",
            Transition::RequireRemediation => "flag remediation for",
            Transition::FailMigration => "fail migration for",
            Transition::ResolveRemediation => "resolve remediation for",
        }
    }
}

/// Statuses a repository may be in when it is assigned to a batch.
pub const BATCH_ELIGIBLE: &[RepositoryStatus] =
    &[Pending, DryRunComplete, DryRunFailed, MigrationFailed, RolledBack];

/// Statuses in which a worker holds the repository.
pub const IN_FLIGHT: &[RepositoryStatus] = &[
    DryRunInProgress,
    PreMigration,
    ArchiveGenerating,
    MigratingContent,
    PostMigration,
];

pub fn is_batch_eligible(status: RepositoryStatus) -> bool {
    BATCH_ELIGIBLE.contains(&status)
}

/// Resulting status of `transition` from `from`, or `None` when illegal.
pub fn target(from: RepositoryStatus, transition: Transition) -> Option<RepositoryStatus> {
    let legal = match transition {
        Transition::QueueDryRun { only_pending: false } => !matches!(
            from,
            Complete
                | QueuedForMigration
                | MigratingContent
                | ArchiveGenerating
                | DryRunInProgress
                | DryRunQueued
        ),
        Transition::QueueDryRun { only_pending: true } => {
            matches!(from, Pending | DryRunFailed | MigrationFailed | RolledBack)
        }
        Transition::QueueMigration => matches!(
            from,
            Pending | DryRunQueued | DryRunFailed | DryRunComplete | MigrationFailed | RolledBack
        ),
        Transition::RetryFailed => from.is_failed(),
        Transition::ResetStuck => IN_FLIGHT.contains(&from),
        Transition::Rollback => from == Complete,
        Transition::MarkWontMigrate => {
            matches!(
                from,
                Pending | DryRunComplete | DryRunFailed | MigrationFailed | RolledBack
            )
        }
        Transition::UnmarkWontMigrate => from == WontMigrate,
        Transition::StartDryRun => from == DryRunQueued,
        Transition::CompleteDryRun | Transition::FailDryRun => from == DryRunInProgress,
        Transition::StartMigration => from == QueuedForMigration,
        Transition::AdvanceMigration => {
            matches!(from, PreMigration | ArchiveGenerating | MigratingContent)
        }
        Transition::CompleteMigration | Transition::RequireRemediation => from == PostMigration,
        Transition::FailMigration => {
            matches!(
                from,
                PreMigration | ArchiveGenerating | MigratingContent | PostMigration
            )
        }
        Transition::ResolveRemediation => from == RemediationRequired,
    };

    if !legal {
        return None;
    }

    let to = match transition {
        Transition::QueueDryRun { .. } => DryRunQueued,
        Transition::QueueMigration | Transition::RetryFailed => QueuedForMigration,
        Transition::ResetStuck | Transition::UnmarkWontMigrate => Pending,
        Transition::Rollback => RolledBack,
        Transition::MarkWontMigrate => WontMigrate,
        Transition::StartDryRun => DryRunInProgress,
        Transition::CompleteDryRun => DryRunComplete,
        Transition::FailDryRun => DryRunFailed,
        Transition::StartMigration => PreMigration,
        Transition::AdvanceMigration => match from {
            PreMigration => ArchiveGenerating,
            ArchiveGenerating => MigratingContent,
            _ => PostMigration,
        },
        Transition::CompleteMigration | Transition::ResolveRemediation => Complete,
        Transition::RequireRemediation => RemediationRequired,
        Transition::FailMigration => MigrationFailed,
    };

    Some(to)
}

/// Validate `transition` from `from`, naming the current status on rejection.
pub fn check(from: RepositoryStatus, transition: Transition) -> AppResult<RepositoryStatus> {
    target(from, transition).ok_or_else(|| {
        AppError::PreconditionFailed(format!(
            "cannot {} repository with status '{}'",
            transition.label(),
            from
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legal_sources(transition: Transition) -> Vec<RepositoryStatus> {
        RepositoryStatus::ALL
            .iter()
            .copied()
            .filter(|s| target(*s, transition).is_some())
            .collect()
    }

    #[test]
    fn test_queue_migration_exhaustive() {
        let allowed = [
            Pending,
            DryRunQueued,
            DryRunFailed,
            DryRunComplete,
            MigrationFailed,
            RolledBack,
        ];
        for status in RepositoryStatus::ALL {
            let result = check(*status, Transition::QueueMigration);
            if allowed.contains(status) {
                assert_eq!(result.unwrap(), QueuedForMigration, "from {}", status);
            } else {
                assert!(
                    matches!(result, Err(AppError::PreconditionFailed(ref m)) if m.contains(status.as_str())),
                    "from {}",
                    status
                );
            }
        }
    }

    #[test]
    fn test_queue_dry_run_all_mode_excludes_active_and_complete() {
        let denied = [
            Complete,
            QueuedForMigration,
            MigratingContent,
            ArchiveGenerating,
            DryRunInProgress,
            DryRunQueued,
        ];
        for status in RepositoryStatus::ALL {
            let result = target(*status, Transition::QueueDryRun { only_pending: false });
            assert_eq!(result.is_none(), denied.contains(status), "from {}", status);
        }
    }

    #[test]
    fn test_queue_dry_run_only_pending_mode() {
        assert_eq!(
            legal_sources(Transition::QueueDryRun { only_pending: true }),
            vec![Pending, DryRunFailed, MigrationFailed, RolledBack]
        );
    }

    #[test]
    fn test_operator_transitions() {
        assert_eq!(
            legal_sources(Transition::RetryFailed),
            vec![DryRunFailed, MigrationFailed]
        );
        assert_eq!(
            legal_sources(Transition::ResetStuck),
            vec![
                DryRunInProgress,
                PreMigration,
                MigratingContent,
                ArchiveGenerating,
                PostMigration
            ]
        );
        assert_eq!(legal_sources(Transition::Rollback), vec![Complete]);
        assert_eq!(
            legal_sources(Transition::MarkWontMigrate),
            vec![Pending, DryRunComplete, DryRunFailed, MigrationFailed, RolledBack]
        );
        assert_eq!(legal_sources(Transition::UnmarkWontMigrate), vec![WontMigrate]);
        assert_eq!(check(WontMigrate, Transition::UnmarkWontMigrate).unwrap(), Pending);
        assert_eq!(check(Complete, Transition::Rollback).unwrap(), RolledBack);
    }

    #[test]
    fn test_worker_phases_advance_in_order() {
        let mut status = check(QueuedForMigration, Transition::StartMigration).unwrap();
        let mut seen = vec![status];
        while status != PostMigration {
            status = check(status, Transition::AdvanceMigration).unwrap();
            seen.push(status);
        }
        assert_eq!(
            seen,
            vec![PreMigration, ArchiveGenerating, MigratingContent, PostMigration]
        );
        assert_eq!(check(PostMigration, Transition::CompleteMigration).unwrap(), Complete);
        assert!(check(PostMigration, Transition::AdvanceMigration).is_err());
    }

    #[test]
    fn test_terminal_states_only_reopen_by_operator() {
        for status in [Complete, WontMigrate] {
            let reopening: Vec<_> = [
                Transition::Rollback,
                Transition::UnmarkWontMigrate,
                Transition::QueueDryRun { only_pending: false },
            ]
            .into_iter()
            .filter(|t| target(status, *t).is_some())
            .collect();
            assert!(!reopening.is_empty());
            assert!(target(status, Transition::StartMigration).is_none());
            assert!(target(status, Transition::FailMigration).is_none());
        }
    }

    #[test]
    fn test_batch_eligibility() {
        assert!(is_batch_eligible(Pending));
        assert!(is_batch_eligible(RolledBack));
        assert!(!is_batch_eligible(Complete));
        assert!(!is_batch_eligible(DryRunQueued));
    }
}
