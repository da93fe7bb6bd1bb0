//! Classifier Bench and Label Propagator.

pub mod bench;
pub mod models;
pub mod propagate;
pub mod split;
pub mod text;

use crate::schema::NarrativeLabel;

/// Positive class for every metric and every binary decision rule.
pub const POSITIVE_LABEL: NarrativeLabel = NarrativeLabel::Decline;

pub use bench::{run_bench, BenchConfig, BenchReport, FailedModel, Metrics, ScoredModel, SplitSummary};
pub use models::{Algorithm, Candidate, ClassifierSpec, FittedClassifier, SvmKernel};
pub use propagate::{propagate_labels, FittedPipeline};
