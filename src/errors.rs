use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("authorization was denied by the provider: {0}")]
    ProviderDenied(String),
    #[error("malformed OAuth callback: {0}")]
    MalformedCallback(String),
    #[error("invalid OAuth state; restart linking from the settings page")]
    StateMismatch,
    #[error("failed to link account: {0}")]
    ExchangeFailed(String),
    #[error("failed to list files: {0}")]
    ListFailed(String),
    #[error("failed to import file: {0}")]
    ImportFailed(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("unknown cloud provider: {0}")]
    UnknownProvider(String),
    #[error("backend request failed ({status}): {message}")]
    Api { status: u16, message: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Config(String),
}

impl AppError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::ListFailed(_) | AppError::ImportFailed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }
}
