use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Raised by the storage layer when the single-active-discovery index rejects an insert.
    #[error("A discovery is already in progress")]
    DiscoveryInProgress,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// True for rejections caused by the caller's request rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AppError::InvalidInput(_)
                | AppError::NotFound(_)
                | AppError::PreconditionFailed(_)
                | AppError::Conflict(_)
                | AppError::DiscoveryInProgress
        )
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        tracing::error!("JSON error: {:?}", err);
        AppError::Internal(format!("Invalid JSON: {}", err))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("Error: {:?}", err);
        AppError::Internal(err.to_string())
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[cfg(debug_assertions)]
        let user_message = self.to_string();

        // Release builds hide storage and internal details from callers
        #[cfg(not(debug_assertions))]
        let user_message = match self {
            AppError::Database(_) | AppError::Pool(_) => "Database error occurred".to_string(),
            AppError::Io(_) => "File operation failed".to_string(),
            AppError::Config(_) => "Configuration error".to_string(),
            AppError::Internal(_) => "Internal error occurred".to_string(),
            other => other.to_string(),
        };

        serializer.serialize_str(&user_message)
    }
}

pub type AppResult<T> = Result<T, AppError>;
