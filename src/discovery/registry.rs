use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

/// Cancellation tokens of running discovery jobs, keyed by progress id.
///
/// Every access holds the single lock, so a job that unregisters itself and a
/// cancel request for the same id are strictly ordered: either the request
/// cancels the token before the job reads it, or the request finds nothing.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<i64, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<i64, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create and register a token for `progress_id`.
    pub fn register(&self, progress_id: i64) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens().insert(progress_id, token.clone());
        token
    }

    /// Remove the entry and report whether it had been cancelled.
    pub fn unregister(&self, progress_id: i64) -> bool {
        self.tokens()
            .remove(&progress_id)
            .map(|token| token.is_cancelled())
            .unwrap_or(false)
    }

    pub fn is_registered(&self, progress_id: i64) -> bool {
        self.tokens().contains_key(&progress_id)
    }

    /// Cancel the token for `progress_id`. Returns false when the job has
    /// already unregistered.
    pub fn cancel(&self, progress_id: i64) -> bool {
        match self.tokens().get(&progress_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tokens().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens().is_empty()
    }
}
