//! Fixtures shared by unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use rusqlite::Connection;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::db::batches::insert_batch as insert_batch_row;
use crate::db::discovery::get_progress;
use crate::db::repositories::upsert_discovered_repository;
use crate::db::{
    init_database, CreateBatch, DbPool, DiscoveredRepository, DiscoveryProgress, DiscoveryStatus,
    RepositoryStatus, SourcePlatform,
};
use crate::discovery::{Collector, CollectorFactory, ProgressTracker};
use crate::error::AppResult;

/// Fresh migrated database in a temp dir. Keep the dir alive for the test.
pub fn test_pool() -> (TempDir, DbPool) {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("test.db"), 8).unwrap();
    (dir, pool)
}

pub fn discovered(full_name: &str) -> DiscoveredRepository {
    DiscoveredRepository {
        full_name: full_name.to_string(),
        source_platform: SourcePlatform::GitHub,
        source_id: None,
        default_branch: Some("main".into()),
        size_kb: Some(1024),
    }
}

pub fn insert_repository(conn: &Connection, full_name: &str, status: RepositoryStatus) -> i64 {
    let id = upsert_discovered_repository(conn, &discovered(full_name)).unwrap();
    conn.execute(
        "UPDATE repositories SET status = ?1 WHERE id = ?2",
        rusqlite::params![status, id],
    )
    .unwrap();
    id
}

pub fn insert_batch(conn: &Connection, name: &str) -> i64 {
    insert_batch_row(
        conn,
        &CreateBatch {
            name: name.into(),
            ..Default::default()
        },
    )
    .unwrap()
}

/// Put a repository in a batch regardless of its status.
pub fn assign(conn: &Connection, repository_id: i64, batch_id: i64) {
    conn.execute(
        "UPDATE repositories SET batch_id = ?1 WHERE id = ?2",
        [batch_id, repository_id],
    )
    .unwrap();
}

pub async fn wait_until_finished(pool: &DbPool, progress_id: i64) -> DiscoveryProgress {
    for _ in 0..500 {
        let progress = get_progress(&pool.get().unwrap(), progress_id).unwrap();
        if progress.status != DiscoveryStatus::InProgress {
            return progress;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("discovery {} did not finish", progress_id);
}

/// Behaviour of the fake collector, shared with the test for inspection.
#[derive(Default)]
pub struct FakeScript {
    repos: usize,
    failing: Vec<String>,
    gate: Option<Notify>,
    ignore_cancel: bool,
    calls: Mutex<Vec<String>>,
    workers: Mutex<Option<usize>>,
}

impl FakeScript {
    /// Every scanned target yields `repos` repositories.
    pub fn with_repos(repos: usize) -> Self {
        Self {
            repos,
            ..Default::default()
        }
    }

    /// Targets (org, project or member org names) that fail.
    pub fn failing(mut self, targets: &[&str]) -> Self {
        self.failing = targets.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Each scan waits for [`FakeScript::release`] before doing any work.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Notify::new());
        self
    }

    /// Keep going after cancellation, like a worker finishing claimed work.
    pub fn ignoring_cancel(mut self) -> Self {
        self.ignore_cancel = true;
        self
    }

    pub fn release(&self) {
        if let Some(ref gate) = self.gate {
            gate.notify_one();
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn workers(&self) -> Option<usize> {
        *self.workers.lock().unwrap()
    }
}

pub struct FakeCollectorFactory {
    db: DbPool,
    script: Arc<FakeScript>,
}

impl FakeCollectorFactory {
    pub fn new(db: DbPool, script: Arc<FakeScript>) -> Self {
        Self { db, script }
    }
}

impl CollectorFactory for FakeCollectorFactory {
    fn create(&self, platform: SourcePlatform) -> AppResult<Box<dyn Collector>> {
        Ok(Box::new(FakeCollector {
            db: self.db.clone(),
            script: self.script.clone(),
            platform,
            source_id: None,
            tracker: None,
        }))
    }
}

struct FakeCollector {
    db: DbPool,
    script: Arc<FakeScript>,
    platform: SourcePlatform,
    source_id: Option<i64>,
    tracker: Option<Arc<dyn ProgressTracker>>,
}

impl FakeCollector {
    async fn scan(&self, ctx: &CancellationToken, call: String, key: &str) -> anyhow::Result<()> {
        self.script.calls.lock().unwrap().push(call.clone());

        if let Some(ref gate) = self.script.gate {
            gate.notified().await;
        }
        if self.script.failing.iter().any(|f| f == key) {
            return Err(anyhow!("{} unavailable", key));
        }

        for i in 0..self.script.repos {
            if ctx.is_cancelled() && !self.script.ignore_cancel {
                break;
            }

            let conn = self.db.get()?;
            upsert_discovered_repository(
                &conn,
                &DiscoveredRepository {
                    full_name: format!("{}/repo-{}", call, i),
                    source_platform: self.platform,
                    source_id: self.source_id,
                    default_branch: Some("main".into()),
                    size_kb: Some(64),
                },
            )?;

            if let Some(ref tracker) = self.tracker {
                tracker.add_repos(1);
                tracker.repo_processed();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Collector for FakeCollector {
    fn set_workers(&mut self, workers: usize) {
        *self.script.workers.lock().unwrap() = Some(workers);
    }

    fn set_source_id(&mut self, source_id: Option<i64>) {
        self.source_id = source_id;
    }

    fn set_progress_tracker(&mut self, tracker: Arc<dyn ProgressTracker>) {
        self.tracker = Some(tracker);
    }

    async fn discover_repositories(&self, ctx: CancellationToken, org: &str) -> anyhow::Result<()> {
        self.scan(&ctx, org.to_string(), org).await
    }

    async fn discover_enterprise_repositories(
        &self,
        ctx: CancellationToken,
        enterprise_slug: &str,
    ) -> anyhow::Result<()> {
        let orgs = [format!("{}-east", enterprise_slug), format!("{}-west", enterprise_slug)];
        if let Some(ref tracker) = self.tracker {
            tracker.set_total_orgs(orgs.len());
        }

        for (index, org) in orgs.iter().enumerate() {
            if ctx.is_cancelled() {
                break;
            }
            if let Some(ref tracker) = self.tracker {
                tracker.start_org(org, index);
            }
            self.scan(&ctx, org.clone(), org).await?;
            if let Some(ref tracker) = self.tracker {
                tracker.complete_org(org, self.script.repos);
            }
        }
        Ok(())
    }

    async fn discover_ado_organization(
        &self,
        ctx: CancellationToken,
        organization: &str,
    ) -> anyhow::Result<()> {
        self.scan(&ctx, organization.to_string(), organization).await
    }

    async fn discover_ado_project(
        &self,
        ctx: CancellationToken,
        organization: &str,
        project: &str,
    ) -> anyhow::Result<()> {
        self.scan(&ctx, format!("{}/{}", organization, project), project)
            .await
    }
}
