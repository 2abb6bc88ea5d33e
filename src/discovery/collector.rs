use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::db::SourcePlatform;
use crate::discovery::ProgressTracker;
use crate::error::AppResult;

/// Platform client that scans a source and writes what it finds into the
/// repository ledger (see `db::repositories::upsert_discovered_repository`).
///
/// Implementations must stop picking up new work once `ctx` is cancelled and
/// report progress through the tracker they were given.
#[async_trait]
pub trait Collector: Send + Sync {
    fn set_workers(&mut self, workers: usize);

    fn set_source_id(&mut self, source_id: Option<i64>);

    fn set_progress_tracker(&mut self, tracker: Arc<dyn ProgressTracker>);

    async fn discover_repositories(&self, ctx: CancellationToken, org: &str) -> anyhow::Result<()>;

    /// Iterates the member organizations of the enterprise, reporting each one
    /// through `start_org` / `complete_org`.
    async fn discover_enterprise_repositories(
        &self,
        ctx: CancellationToken,
        enterprise_slug: &str,
    ) -> anyhow::Result<()>;

    async fn discover_ado_organization(
        &self,
        ctx: CancellationToken,
        organization: &str,
    ) -> anyhow::Result<()>;

    async fn discover_ado_project(
        &self,
        ctx: CancellationToken,
        organization: &str,
        project: &str,
    ) -> anyhow::Result<()>;
}

/// Builds a fresh collector for each discovery run.
pub trait CollectorFactory: Send + Sync {
    fn create(&self, platform: SourcePlatform) -> AppResult<Box<dyn Collector>>;
}
