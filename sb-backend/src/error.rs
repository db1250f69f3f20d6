use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend rate limited the request")]
    RateLimited,

    #[error("another run is already active on this thread")]
    ConcurrentRunActive,

    #[error("backend call exceeded its deadline")]
    Timeout,

    #[error("backend error: {0}")]
    Unclassified(String),
}

impl BackendError {
    /// Whether the dispatcher should retry the same task with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::ConcurrentRunActive | Self::Timeout
        )
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout;
        }
        Self::Unclassified(e.to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        Self::Unclassified(format!("unexpected response format: {e}"))
    }
}
