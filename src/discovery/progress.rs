use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::db::discovery::{write_snapshot, ProgressSnapshot};
use crate::db::DbPool;
use crate::error::AppResult;

/// Sink for incremental discovery progress.
///
/// Updates may be buffered; `flush` must persist everything recorded so far,
/// and is always called once more when the run ends, including on
/// cancellation and failure.
pub trait ProgressTracker: Send + Sync {
    fn set_total_orgs(&self, total: usize);

    fn start_org(&self, name: &str, index: usize);

    fn complete_org(&self, name: &str, repo_count: usize);

    /// Repositories found that will be processed.
    fn add_repos(&self, count: usize);

    fn repo_processed(&self);

    fn record_error(&self, error: &str);

    fn snapshot(&self) -> ProgressSnapshot;

    fn flush(&self) -> AppResult<()>;
}

#[derive(Debug, Default)]
struct Buffered {
    snapshot: ProgressSnapshot,
    pending: usize,
}

/// Tracker that accumulates counters in memory and writes them to the
/// `discovery_progress` row every `flush_every` updates.
///
/// Writes happen under the state lock so snapshots land in order. A write
/// blocks the calling thread for at most the connection `busy_timeout`.
pub struct DbProgressTracker {
    db: DbPool,
    progress_id: i64,
    flush_every: usize,
    state: Mutex<Buffered>,
}

impl DbProgressTracker {
    pub fn new(db: DbPool, progress_id: i64, flush_every: usize) -> Self {
        Self {
            db,
            progress_id,
            flush_every: flush_every.max(1),
            state: Mutex::new(Buffered::default()),
        }
    }

    pub fn progress_id(&self) -> i64 {
        self.progress_id
    }

    fn state(&self) -> MutexGuard<'_, Buffered> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, apply: impl FnOnce(&mut ProgressSnapshot)) {
        let mut state = self.state();
        apply(&mut state.snapshot);
        state.pending += 1;

        if state.pending >= self.flush_every {
            if let Err(e) = self.write(&mut state) {
                tracing::warn!(
                    progress_id = self.progress_id,
                    "Failed to flush discovery progress: {}",
                    e
                );
            }
        }
    }

    fn write(&self, state: &mut Buffered) -> AppResult<()> {
        let conn = self.db.get()?;
        write_snapshot(&conn, self.progress_id, &state.snapshot)?;
        state.pending = 0;
        Ok(())
    }
}

impl ProgressTracker for DbProgressTracker {
    fn set_total_orgs(&self, total: usize) {
        self.update(|s| s.total_orgs = Some(total as i64));
    }

    fn start_org(&self, name: &str, index: usize) {
        tracing::debug!(progress_id = self.progress_id, index, "Discovering {}", name);
        self.update(|s| s.phase = Some(format!("discovering {}", name)));
    }

    fn complete_org(&self, name: &str, repo_count: usize) {
        tracing::info!(
            progress_id = self.progress_id,
            repo_count,
            "Finished discovering {}",
            name
        );
        self.update(|s| s.processed_orgs += 1);
    }

    fn add_repos(&self, count: usize) {
        self.update(|s| s.total_repos += count as i64);
    }

    fn repo_processed(&self) {
        self.update(|s| s.processed_repos += 1);
    }

    fn record_error(&self, error: &str) {
        tracing::warn!(progress_id = self.progress_id, "Discovery error: {}", error);
        self.update(|s| {
            s.error_count += 1;
            s.last_error = Some(error.to_string());
        });
    }

    fn snapshot(&self) -> ProgressSnapshot {
        self.state().snapshot.clone()
    }

    fn flush(&self) -> AppResult<()> {
        let mut state = self.state();
        self.write(&mut state)
    }
}
