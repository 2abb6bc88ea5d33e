//! Discovery controller.
//!
//! At most one discovery runs at a time. A run is accepted by inserting an
//! `in_progress` progress row, then executed on a detached task inside an
//! envelope that owns its cancellation token, the final progress flush and
//! the classification of the result.

use std::sync::Arc;

use anyhow::anyhow;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::db::discovery::{self as runs, PHASE_CANCELLING};
use crate::db::sources::refresh_repository_count;
use crate::db::{DbPool, DiscoveryProgress, DiscoveryStatus, DiscoveryType};
use crate::discovery::{CancelRegistry, Collector, CollectorFactory, DbProgressTracker, ProgressTracker};
use crate::error::{AppError, AppResult};

/// What to scan.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryScope {
    Organization { organization: String },
    Enterprise { enterprise_slug: String },
    AdoOrganization { organization: String },
    /// Projects are scanned strictly in the given order.
    AdoProjects {
        organization: String,
        projects: Vec<String>,
    },
}

impl DiscoveryScope {
    pub fn discovery_type(&self) -> DiscoveryType {
        match self {
            DiscoveryScope::Organization { .. } => DiscoveryType::Organization,
            DiscoveryScope::Enterprise { .. } => DiscoveryType::Enterprise,
            DiscoveryScope::AdoOrganization { .. } => DiscoveryType::AdoOrganization,
            DiscoveryScope::AdoProjects { .. } => DiscoveryType::AdoProjects,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            DiscoveryScope::Organization { organization }
            | DiscoveryScope::AdoOrganization { organization }
            | DiscoveryScope::AdoProjects { organization, .. } => organization.as_str(),
            DiscoveryScope::Enterprise { enterprise_slug } => enterprise_slug.as_str(),
        }
    }

    fn projects(&self) -> Option<&[String]> {
        match self {
            DiscoveryScope::AdoProjects { projects, .. } => Some(projects.as_slice()),
            _ => None,
        }
    }

    fn validate(&self) -> AppResult<()> {
        if self.target().trim().is_empty() {
            return Err(AppError::InvalidInput(format!(
                "{} discovery requires a target",
                self.discovery_type()
            )));
        }

        if let Some(projects) = self.projects() {
            if projects.is_empty() {
                return Err(AppError::InvalidInput(
                    "at least one project is required".into(),
                ));
            }
            if projects.iter().any(|p| p.trim().is_empty()) {
                return Err(AppError::InvalidInput("project names cannot be empty".into()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartDiscovery {
    pub scope: DiscoveryScope,
    /// Falls back to the configured default.
    pub workers: Option<usize>,
    pub source_id: Option<i64>,
}

#[derive(Clone)]
pub struct DiscoveryController {
    db: DbPool,
    collectors: Arc<dyn CollectorFactory>,
    default_workers: usize,
    flush_every: usize,
    registry: Arc<CancelRegistry>,
}

impl DiscoveryController {
    pub fn new(
        db: DbPool,
        collectors: Arc<dyn CollectorFactory>,
        default_workers: usize,
        flush_every: usize,
    ) -> Self {
        Self {
            db,
            collectors,
            default_workers: default_workers.max(1),
            flush_every: flush_every.max(1),
            registry: Arc::new(CancelRegistry::new()),
        }
    }

    /// Accept a discovery and run it in the background. Returns the new
    /// progress row; a run already in progress is a conflict.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start_discovery(&self, request: StartDiscovery) -> AppResult<DiscoveryProgress> {
        request.scope.validate()?;
        let workers = match request.workers {
            Some(0) => {
                return Err(AppError::InvalidInput("workers must be positive".into()));
            }
            Some(n) => n,
            None => self.default_workers,
        };

        let conn = self.db.get()?;
        if let Some(active) = runs::find_active(&conn)? {
            return Err(already_running(&active));
        }

        let progress = match runs::insert_progress(
            &conn,
            request.scope.discovery_type(),
            request.scope.target(),
            request.scope.projects(),
            request.source_id,
        ) {
            Ok(progress) => progress,
            Err(AppError::DiscoveryInProgress) => {
                return Err(match runs::find_active(&conn)? {
                    Some(active) => already_running(&active),
                    None => AppError::Conflict("a discovery is already in progress".into()),
                });
            }
            Err(e) => return Err(e),
        };

        let platform = progress.discovery_type.source_platform();
        let mut collector = match self.collectors.create(platform) {
            Ok(collector) => collector,
            Err(e) => {
                runs::finalize(&conn, progress.id, DiscoveryStatus::Failed, Some(&e.to_string()))?;
                return Err(e);
            }
        };
        drop(conn);

        let tracker = Arc::new(DbProgressTracker::new(
            self.db.clone(),
            progress.id,
            self.flush_every,
        ));
        collector.set_workers(workers);
        collector.set_source_id(request.source_id);
        collector.set_progress_tracker(tracker.clone());

        let token = self.registry.register(progress.id);
        let job = DiscoveryJob {
            db: self.db.clone(),
            registry: self.registry.clone(),
            progress_id: progress.id,
            scope: request.scope,
            source_id: request.source_id,
            collector,
            tracker,
        };

        tracing::info!(
            progress_id = progress.id,
            workers,
            "Starting {} discovery of '{}'",
            progress.discovery_type,
            progress.target
        );
        tokio::spawn(job.run(token));

        Ok(progress)
    }

    /// Request cooperative cancellation of the active discovery.
    pub fn cancel_discovery(&self) -> AppResult<DiscoveryProgress> {
        let conn = self.db.get()?;
        let active = runs::find_active(&conn)?
            .ok_or_else(|| AppError::NotFound("no discovery is in progress".into()))?;

        let not_running = || {
            AppError::NotFound(format!(
                "discovery {} is not running in this process",
                active.id
            ))
        };
        if !self.registry.is_registered(active.id) {
            return Err(not_running());
        }

        // The phase write only applies while the row is in progress, and
        // finalizing overwrites it, so it can run outside the registry lock.
        runs::set_phase(&conn, active.id, PHASE_CANCELLING)?;
        if !self.registry.cancel(active.id) {
            return Err(not_running());
        }

        tracing::info!(progress_id = active.id, "Cancellation requested for '{}'", active.target);
        runs::get_progress(&conn, active.id)
    }

    /// The active run, or the most recent one when nothing is running.
    pub fn get_discovery_status(&self) -> AppResult<Option<DiscoveryProgress>> {
        let conn = self.db.get()?;
        if let Some(active) = runs::find_active(&conn)? {
            return Ok(Some(active));
        }
        Ok(runs::list_history(&conn, 1)?.into_iter().next())
    }

    pub fn list_discovery_history(&self, limit: i64) -> AppResult<Vec<DiscoveryProgress>> {
        if limit <= 0 {
            return Err(AppError::InvalidInput("limit must be positive".into()));
        }
        let conn = self.db.get()?;
        runs::list_history(&conn, limit)
    }

    /// Fail runs left `in_progress` by a previous process. Their tasks are
    /// gone, so nothing could ever finish or cancel them.
    pub fn recover_interrupted(&self) -> AppResult<usize> {
        let conn = self.db.get()?;
        let mut recovered = 0;

        while let Some(stale) = runs::find_active(&conn)? {
            if self.registry.is_registered(stale.id) {
                break;
            }
            if runs::finalize(
                &conn,
                stale.id,
                DiscoveryStatus::Failed,
                Some("interrupted by restart"),
            )? {
                tracing::warn!(progress_id = stale.id, "Marked interrupted discovery of '{}' as failed", stale.target);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    pub fn is_running(&self) -> bool {
        !self.registry.is_empty()
    }
}

fn already_running(active: &DiscoveryProgress) -> AppError {
    AppError::Conflict(format!(
        "discovery of '{}' already in progress since {}",
        active.target, active.started_at
    ))
}

struct DiscoveryJob {
    db: DbPool,
    registry: Arc<CancelRegistry>,
    progress_id: i64,
    scope: DiscoveryScope,
    source_id: Option<i64>,
    collector: Box<dyn Collector>,
    tracker: Arc<DbProgressTracker>,
}

impl DiscoveryJob {
    async fn run(self, token: CancellationToken) {
        let result = scan(
            self.collector.as_ref(),
            &self.scope,
            token.clone(),
            self.tracker.as_ref(),
        )
        .await;

        // Unregistering under the registry lock orders this read against any
        // concurrent cancel request.
        let cancelled = self.registry.unregister(self.progress_id);
        token.cancel();

        if let Err(e) = self.tracker.flush() {
            tracing::warn!(progress_id = self.progress_id, "Final progress flush failed: {}", e);
        }

        let (status, error) = match result {
            _ if cancelled => (DiscoveryStatus::Cancelled, None),
            Ok(()) => (DiscoveryStatus::Completed, None),
            Err(e) => (DiscoveryStatus::Failed, Some(format!("{:#}", e))),
        };

        if let Err(e) = self.finish(status, error.as_deref()) {
            tracing::error!(progress_id = self.progress_id, "Failed to record discovery result: {}", e);
        }
    }

    fn finish(&self, status: DiscoveryStatus, error: Option<&str>) -> AppResult<()> {
        let conn = self.db.get()?;

        if status == DiscoveryStatus::Completed {
            if let Some(source_id) = self.source_id {
                match refresh_repository_count(&conn, source_id) {
                    Ok(count) => tracing::debug!(source_id, count, "Refreshed source repository count"),
                    Err(e) => tracing::warn!(source_id, "Failed to refresh source repository count: {}", e),
                }
            }
        }

        runs::finalize(&conn, self.progress_id, status, error)?;
        match error {
            Some(error) => tracing::error!(
                progress_id = self.progress_id,
                "Discovery of '{}' failed: {}",
                self.scope.target(),
                error
            ),
            None => tracing::info!(
                progress_id = self.progress_id,
                "Discovery of '{}' {}",
                self.scope.target(),
                status
            ),
        }
        Ok(())
    }
}

fn repos_seen(tracker: &dyn ProgressTracker) -> usize {
    usize::try_from(tracker.snapshot().total_repos).unwrap_or(0)
}

/// Scan a single organization-like target, bracketed by org markers.
async fn scan_single(
    tracker: &dyn ProgressTracker,
    name: &str,
    work: impl std::future::Future<Output = anyhow::Result<()>>,
) -> anyhow::Result<()> {
    let before = repos_seen(tracker);
    tracker.start_org(name, 0);
    work.await?;
    tracker.complete_org(name, repos_seen(tracker).saturating_sub(before));
    Ok(())
}

async fn scan(
    collector: &dyn Collector,
    scope: &DiscoveryScope,
    ctx: CancellationToken,
    tracker: &dyn ProgressTracker,
) -> anyhow::Result<()> {
    match scope {
        DiscoveryScope::Organization { organization } => {
            scan_single(
                tracker,
                organization,
                collector.discover_repositories(ctx, organization),
            )
            .await
        }
        DiscoveryScope::Enterprise { enterprise_slug } => {
            collector
                .discover_enterprise_repositories(ctx, enterprise_slug)
                .await
        }
        DiscoveryScope::AdoOrganization { organization } => {
            scan_single(
                tracker,
                organization,
                collector.discover_ado_organization(ctx, organization),
            )
            .await
        }
        DiscoveryScope::AdoProjects {
            organization,
            projects,
        } => scan_projects(collector, organization, projects, ctx, tracker).await,
    }
}

/// Projects run one after another. A failing project is recorded and the
/// rest still run; the scan fails only when every project failed.
async fn scan_projects(
    collector: &dyn Collector,
    organization: &str,
    projects: &[String],
    ctx: CancellationToken,
    tracker: &dyn ProgressTracker,
) -> anyhow::Result<()> {
    tracker.set_total_orgs(projects.len());
    let mut failed = 0;

    for (index, project) in projects.iter().enumerate() {
        if ctx.is_cancelled() {
            return Err(anyhow!("cancelled before project '{}'", project));
        }

        let before = repos_seen(tracker);
        tracker.start_org(project, index);

        if let Err(e) = collector
            .discover_ado_project(ctx.clone(), organization, project)
            .await
        {
            failed += 1;
            tracker.record_error(&format!("project {}: {:#}", project, e));
        }

        tracker.complete_org(project, repos_seen(tracker).saturating_sub(before));
        if let Err(e) = tracker.flush() {
            tracing::warn!("Failed to flush progress after project '{}': {}", project, e);
        }
    }

    if failed == projects.len() {
        return Err(anyhow!("all {} projects failed", failed));
    }
    Ok(())
}
