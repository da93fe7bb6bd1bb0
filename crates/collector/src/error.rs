use narrative_core::PipelineError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CollectError>;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Credential error: {0}")]
    Auth(String),

    /// The raw store failed; this aborts the whole run.
    #[error("Store error: {0}")]
    Store(#[from] PipelineError),
}

impl CollectError {
    /// Errors confined to one handle; anything else stops retrieval.
    pub fn is_per_handle(&self) -> bool {
        !matches!(self, CollectError::Store(_) | CollectError::Auth(_))
    }
}

impl From<reqwest::Error> for CollectError {
    fn from(err: reqwest::Error) -> Self {
        CollectError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for CollectError {
    fn from(err: serde_json::Error) -> Self {
        CollectError::Parse(err.to_string())
    }
}
