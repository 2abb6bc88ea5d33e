use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Closed enums persisted as text. Generates the text mapping, `Display`,
/// `FromStr` and the rusqlite conversions so rows never carry raw strings.
macro_rules! text_enum {
    ($name:ident, $label:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(format!("Unknown {}: {}", $label, s)),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SourcePlatform {
    #[serde(rename = "github")]
    GitHub,
    #[serde(rename = "azuredevops")]
    AzureDevOps,
}

text_enum!(SourcePlatform, "source platform" {
    GitHub => "github",
    AzureDevOps => "azuredevops",
});

/// Lifecycle status of a repository in the ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryStatus {
    Pending,
    DryRunQueued,
    DryRunInProgress,
    DryRunComplete,
    DryRunFailed,
    QueuedForMigration,
    PreMigration,
    MigratingContent,
    ArchiveGenerating,
    PostMigration,
    Complete,
    MigrationFailed,
    RolledBack,
    RemediationRequired,
    WontMigrate,
}

text_enum!(RepositoryStatus, "repository status" {
    Pending => "pending",
    DryRunQueued => "dry_run_queued",
    DryRunInProgress => "dry_run_in_progress",
    DryRunComplete => "dry_run_complete",
    DryRunFailed => "dry_run_failed",
    QueuedForMigration => "queued_for_migration",
    PreMigration => "pre_migration",
    MigratingContent => "migrating_content",
    ArchiveGenerating => "archive_generating",
    PostMigration => "post_migration",
    Complete => "complete",
    MigrationFailed => "migration_failed",
    RolledBack => "rolled_back",
    RemediationRequired => "remediation_required",
    WontMigrate => "wont_migrate",
});

impl RepositoryStatus {
    /// Absorbing states; only an explicit operator action reopens them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RepositoryStatus::Complete | RepositoryStatus::WontMigrate)
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            RepositoryStatus::MigrationFailed | RepositoryStatus::DryRunFailed
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Ready,
    InProgress,
    Completed,
    CompletedWithErrors,
}

text_enum!(BatchStatus, "batch status" {
    Pending => "pending",
    Ready => "ready",
    InProgress => "in_progress",
    Completed => "completed",
    CompletedWithErrors => "completed_with_errors",
});

impl BatchStatus {
    /// Membership, dry-run and start edits are only accepted in these states.
    pub fn is_editable(&self) -> bool {
        matches!(self, BatchStatus::Pending | BatchStatus::Ready)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    #[default]
    Standard,
    Pilot,
}

text_enum!(BatchType, "batch type" {
    Standard => "standard",
    Pilot => "pilot",
});

impl BatchType {
    /// Priority written onto every repository this batch transitions.
    pub fn priority(&self) -> i64 {
        match self {
            BatchType::Pilot => 1,
            BatchType::Standard => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum MigrationApi {
    #[default]
    #[serde(rename = "GEI")]
    Gei,
    #[serde(rename = "ELM")]
    Elm,
}

text_enum!(MigrationApi, "migration API" {
    Gei => "GEI",
    Elm => "ELM",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryType {
    Organization,
    Enterprise,
    AdoOrganization,
    AdoProjects,
}

text_enum!(DiscoveryType, "discovery type" {
    Organization => "organization",
    Enterprise => "enterprise",
    AdoOrganization => "ado_organization",
    AdoProjects => "ado_projects",
});

impl DiscoveryType {
    pub fn source_platform(&self) -> SourcePlatform {
        match self {
            DiscoveryType::Organization | DiscoveryType::Enterprise => SourcePlatform::GitHub,
            DiscoveryType::AdoOrganization | DiscoveryType::AdoProjects => {
                SourcePlatform::AzureDevOps
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

text_enum!(DiscoveryStatus, "discovery status" {
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    DryRun,
    Migration,
}

text_enum!(MigrationPhase, "migration phase" {
    DryRun => "dry_run",
    Migration => "migration",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogOperation {
    Queue,
    Retry,
}

text_enum!(LogOperation, "log operation" {
    Queue => "queue",
    Retry => "retry",
});

/// Parts of a repository left out of the migration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExclusionFlags {
    pub exclude_releases: bool,
    pub exclude_attachments: bool,
    pub exclude_metadata: bool,
    pub exclude_git_data: bool,
    pub exclude_owner_projects: bool,
}

impl ExclusionFlags {
    /// Flags set on either side stay set.
    pub fn merge(&self, other: &ExclusionFlags) -> ExclusionFlags {
        ExclusionFlags {
            exclude_releases: self.exclude_releases || other.exclude_releases,
            exclude_attachments: self.exclude_attachments || other.exclude_attachments,
            exclude_metadata: self.exclude_metadata || other.exclude_metadata,
            exclude_git_data: self.exclude_git_data || other.exclude_git_data,
            exclude_owner_projects: self.exclude_owner_projects || other.exclude_owner_projects,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub full_name: String,
    pub source_platform: SourcePlatform,
    pub source_id: Option<i64>,
    pub default_branch: Option<String>,
    pub size_kb: Option<i64>,
    pub status: RepositoryStatus,
    pub priority: i64,
    pub batch_id: Option<i64>,
    pub source_migration_id: Option<String>,
    pub is_source_locked: bool,
    pub destination_full_name: Option<String>,
    pub exclusions: ExclusionFlags,
    pub destination_url: Option<String>,
    pub migrated_at: Option<String>,
    pub last_error: Option<String>,
    pub discovered_at: String,
    pub updated_at: String,
}

impl Repository {
    /// Repository name without its organization (or ADO project) prefix.
    pub fn name(&self) -> &str {
        self.full_name
            .rsplit_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.full_name)
    }
}

/// Repository as reported by a collector, before it has lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredRepository {
    pub full_name: String,
    pub source_platform: SourcePlatform,
    pub source_id: Option<i64>,
    pub default_branch: Option<String>,
    pub size_kb: Option<i64>,
}

/// Optional filters for listing the ledger; unset fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepositoryFilter {
    pub status: Option<RepositoryStatus>,
    pub batch_id: Option<i64>,
    pub source_id: Option<i64>,
    pub source_platform: Option<SourcePlatform>,
    pub name_contains: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub status: BatchStatus,
    pub batch_type: BatchType,
    pub migration_api: MigrationApi,
    pub destination_org: Option<String>,
    pub exclusions: ExclusionFlags,
    pub last_dry_run_at: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateBatch {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub batch_type: BatchType,
    #[serde(default)]
    pub migration_api: MigrationApi,
    pub destination_org: Option<String>,
    #[serde(default)]
    pub exclusions: ExclusionFlags,
}

/// Partial batch edit; `None` keeps the current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateBatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub batch_type: Option<BatchType>,
    pub migration_api: Option<MigrationApi>,
    pub destination_org: Option<String>,
    pub exclusions: Option<ExclusionFlags>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryProgress {
    pub id: i64,
    pub discovery_type: DiscoveryType,
    pub target: String,
    pub projects: Option<Vec<String>>,
    pub source_id: Option<i64>,
    pub status: DiscoveryStatus,
    pub phase: String,
    pub total_orgs: i64,
    pub processed_orgs: i64,
    pub total_repos: i64,
    pub processed_repos: i64,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationLog {
    pub id: i64,
    pub repository_id: i64,
    pub phase: MigrationPhase,
    pub operation: LogOperation,
    pub message: String,
    pub initiated_by: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub platform: SourcePlatform,
    pub repository_count: i64,
    pub last_discovered_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text_round_trips_for_every_variant() {
        for status in RepositoryStatus::ALL {
            let parsed: RepositoryStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, *status);
        }
        assert_eq!(RepositoryStatus::ALL.len(), 15);
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let err = "migrated".parse::<RepositoryStatus>().unwrap_err();
        assert_eq!(err, "Unknown repository status: migrated");
    }

    #[test]
    fn test_pilot_batches_boost_priority() {
        assert_eq!(BatchType::Pilot.priority(), 1);
        assert_eq!(BatchType::Standard.priority(), 0);
    }

    #[test]
    fn test_serde_names_match_persisted_text() {
        assert_eq!(
            serde_json::to_string(&RepositoryStatus::QueuedForMigration).unwrap(),
            "\"queued_for_migration\""
        );
        assert_eq!(serde_json::to_string(&MigrationApi::Elm).unwrap(), "\"ELM\"");
        assert_eq!(
            serde_json::to_string(&SourcePlatform::AzureDevOps).unwrap(),
            "\"azuredevops\""
        );
    }

    #[test]
    fn test_repository_name_strips_owner() {
        let repo = Repository {
            id: 1,
            full_name: "acme/widgets".into(),
            source_platform: SourcePlatform::GitHub,
            source_id: None,
            default_branch: None,
            size_kb: None,
            status: RepositoryStatus::Pending,
            priority: 0,
            batch_id: None,
            source_migration_id: None,
            is_source_locked: false,
            destination_full_name: None,
            exclusions: ExclusionFlags::default(),
            destination_url: None,
            migrated_at: None,
            last_error: None,
            discovered_at: String::new(),
            updated_at: String::new(),
        };
        assert_eq!(repo.name(), "widgets");
    }
}
