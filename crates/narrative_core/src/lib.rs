pub mod analysis;
pub mod cancel;
pub mod classify;
pub mod clean;
pub mod config;
pub mod db;
pub mod error;
pub mod io;
pub mod schema;
pub mod stats;
pub mod topic;

pub use cancel::CancelFlag;
pub use error::{FitError, PipelineError};
