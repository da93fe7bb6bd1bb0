//! Typed errors for the pipeline stages.

use thiserror::Error;

/// Errors that abort a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// An input file lacks a column the stage reads.
    #[error("missing column '{column}' in {path}")]
    MissingColumn { path: String, column: String },

    /// A row could not be decoded into the expected record.
    #[error("malformed row at line {line} in {path}: {message}")]
    MalformedRow {
        path: String,
        line: u64,
        message: String,
    },

    /// A record carries a value the stage cannot interpret.
    #[error("invalid value in record '{record}': {message}")]
    InvalidRecord { record: String, message: String },

    #[error("training split is empty")]
    EmptyTrainingSplit,

    #[error("training split contains a single label ({label}); nothing to discriminate")]
    SingleClassTraining { label: String },

    #[error("no classifier produced a usable fit")]
    NoUsableClassifier,

    #[error("analysis dataset is empty after joining posts to legislators")]
    EmptyAnalysisSet,

    /// A fitted pipeline failed while labelling.
    #[error("prediction failed: {0}")]
    Prediction(#[from] FitError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Errors raised while fitting a single model. These are recorded per model,
/// per classifier, or per bootstrap replicate rather than aborting a run.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FitError {
    #[error("did not converge after {iterations} iterations (gradient norm {gradient_norm:.3e})")]
    NonConvergence {
        iterations: usize,
        gradient_norm: f64,
    },

    #[error("singular system while {context}")]
    Singular { context: String },

    #[error("degenerate input: {0}")]
    Degenerate(String),

    /// Raised inside a numerical library.
    #[error("{algorithm} failed: {message}")]
    Library {
        algorithm: &'static str,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, PipelineError>;
pub type FitResult<T> = std::result::Result<T, FitError>;
