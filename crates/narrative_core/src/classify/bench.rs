use super::models::{Candidate, ClassifierSpec};
use super::propagate::FittedPipeline;
use super::split::{stratified_folds, stratified_split, Split};
use super::text::TfidfRecipe;
use super::POSITIVE_LABEL;
use crate::error::{FitError, FitResult, PipelineError, Result};
use crate::schema::{LabeledExample, NarrativeLabel};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_test_fraction")]
    pub test_fraction: f64,
    #[serde(default = "default_max_features")]
    pub max_features: usize,
    #[serde(default = "default_cv_folds")]
    pub cv_folds: usize,
    #[serde(default)]
    pub extra_stop_words: Vec<String>,
}

fn default_seed() -> u64 {
    42
}

fn default_test_fraction() -> f64 {
    0.25
}

fn default_max_features() -> usize {
    1000
}

fn default_cv_folds() -> usize {
    5
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            test_fraction: default_test_fraction(),
            max_features: default_max_features(),
            cv_folds: default_cv_folds(),
            extra_stop_words: Vec::new(),
        }
    }
}

/// Confusion counts and derived scores; `decline` is the positive class.
/// Undefined ratios (zero denominators) are reported as 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub accuracy: f64,
    pub recall: f64,
    pub precision: f64,
    pub f1: f64,
    pub true_positive: usize,
    pub false_positive: usize,
    pub true_negative: usize,
    pub false_negative: usize,
}

impl Metrics {
    pub fn compute(predicted: &[bool], actual: &[bool]) -> Self {
        let (mut tp, mut fp, mut tn, mut fn_) = (0, 0, 0, 0);
        for (&p, &a) in predicted.iter().zip(actual) {
            match (p, a) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, false) => tn += 1,
                (false, true) => fn_ += 1,
            }
        }
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let recall = ratio(tp, tp + fn_);
        let precision = ratio(tp, tp + fp);
        let f1 = if recall + precision == 0.0 {
            0.0
        } else {
            2.0 * recall * precision / (recall + precision)
        };
        Self {
            accuracy: ratio(tp + tn, predicted.len()),
            recall,
            precision,
            f1,
            true_positive: tp,
            false_positive: fp,
            true_negative: tn,
            false_negative: fn_,
        }
    }
}

#[derive(Debug)]
pub struct ScoredModel {
    pub name: String,
    pub algorithm: String,
    pub params: String,
    pub cv_accuracy: Option<f64>,
    pub metrics: Metrics,
    pub pipeline: FittedPipeline,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedModel {
    pub name: String,
    pub algorithm: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplitSummary {
    pub train: usize,
    pub test: usize,
    pub train_decline_share: f64,
    pub test_decline_share: f64,
    pub vocabulary: usize,
    pub test_ids: Vec<String>,
}

#[derive(Debug)]
pub struct BenchReport {
    pub split: SplitSummary,
    /// Best first: accuracy, then recall, then precision, then name.
    pub ranked: Vec<ScoredModel>,
    pub failed: Vec<FailedModel>,
}

impl BenchReport {
    pub fn best(&self) -> Option<&ScoredModel> {
        self.ranked.first()
    }

    /// The winner, or an error when every classifier failed.
    pub fn require_best(&self) -> Result<&ScoredModel> {
        self.best().ok_or(PipelineError::NoUsableClassifier)
    }
}

fn rank(a: &ScoredModel, b: &ScoredModel) -> Ordering {
    b.metrics
        .accuracy
        .total_cmp(&a.metrics.accuracy)
        .then_with(|| b.metrics.recall.total_cmp(&a.metrics.recall))
        .then_with(|| b.metrics.precision.total_cmp(&a.metrics.precision))
        .then_with(|| a.name.cmp(&b.name))
}

fn decline_share(labels: &[bool]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    labels.iter().filter(|v| **v).count() as f64 / labels.len() as f64
}

/// Split, fit the shared recipe on the training rows, tune and fit every
/// configured classifier, score on the held-out rows, and rank.
pub fn run_bench(
    examples: &[LabeledExample],
    specs: &[ClassifierSpec],
    config: &BenchConfig,
) -> Result<BenchReport> {
    let labels: Vec<NarrativeLabel> = examples.iter().map(|e| e.label).collect();
    let split = stratified_split(&labels, config.test_fraction, config.seed);
    if split.train.is_empty() {
        return Err(PipelineError::EmptyTrainingSplit);
    }
    let train_labels: Vec<NarrativeLabel> = split.train.iter().map(|&i| labels[i]).collect();
    if let Some(first) = train_labels.first()
        && train_labels.iter().all(|l| l == first)
    {
        return Err(PipelineError::SingleClassTraining {
            label: first.to_string(),
        });
    }

    let texts = |idx: &[usize]| -> Vec<&str> { idx.iter().map(|&i| examples[i].text.as_str()).collect() };
    let targets = |idx: &[usize]| -> Vec<bool> { idx.iter().map(|&i| labels[i] == POSITIVE_LABEL).collect() };

    let recipe = TfidfRecipe::fit(&texts(&split.train), config.max_features, &config.extra_stop_words);
    let x_train = recipe.transform_all(&texts(&split.train));
    let x_test = recipe.transform_all(&texts(&split.test));
    let y_train = targets(&split.train);
    let y_test = targets(&split.test);
    let folds = stratified_folds(&train_labels, config.cv_folds, config.seed);

    tracing::info!(
        train = split.train.len(),
        test = split.test.len(),
        vocabulary = recipe.n_features(),
        classifiers = specs.len(),
        "classifier bench starting"
    );

    let mut ranked = Vec::new();
    let mut failed = Vec::new();
    for spec in specs {
        match fit_and_score(spec, &x_train, &y_train, &x_test, &y_test, &folds) {
            Ok((candidate, cv_accuracy, classifier, metrics)) => {
                tracing::info!(
                    name = %spec.name,
                    params = %candidate.describe(),
                    accuracy = metrics.accuracy,
                    recall = metrics.recall,
                    precision = metrics.precision,
                    "classifier scored"
                );
                ranked.push(ScoredModel {
                    name: spec.name.clone(),
                    algorithm: spec.algorithm.kind().to_string(),
                    params: candidate.describe(),
                    cv_accuracy,
                    metrics,
                    pipeline: FittedPipeline {
                        name: spec.name.clone(),
                        params: candidate.describe(),
                        recipe: recipe.clone(),
                        classifier,
                    },
                });
            }
            Err(err) => {
                tracing::warn!(name = %spec.name, error = %err, "classifier failed; excluded from ranking");
                failed.push(FailedModel {
                    name: spec.name.clone(),
                    algorithm: spec.algorithm.kind().to_string(),
                    error: err.to_string(),
                });
            }
        }
    }
    ranked.sort_by(rank);

    Ok(BenchReport {
        split: SplitSummary {
            train: split.train.len(),
            test: split.test.len(),
            train_decline_share: decline_share(&y_train),
            test_decline_share: decline_share(&y_test),
            vocabulary: recipe.n_features(),
            test_ids: split.test.iter().map(|&i| examples[i].id.clone()).collect(),
        },
        ranked,
        failed,
    })
}

type Scored = (Candidate, Option<f64>, super::models::FittedClassifier, Metrics);

fn fit_and_score(
    spec: &ClassifierSpec,
    x_train: &Array2<f64>,
    y_train: &[bool],
    x_test: &Array2<f64>,
    y_test: &[bool],
    folds: &[Vec<usize>],
) -> FitResult<Scored> {
    let grid = spec.algorithm.grid();
    let (candidate, cv_accuracy) = match grid.as_slice() {
        [] => return Err(FitError::Degenerate("empty hyperparameter grid".to_string())),
        [only] => (*only, None),
        _ => {
            let (best, score) = tune(&grid, x_train, y_train, folds)?;
            (best, Some(score))
        }
    };
    let classifier = candidate.fit(x_train, y_train)?;
    let metrics = Metrics::compute(&classifier.predict(x_test)?, y_test);
    Ok((candidate, cv_accuracy, classifier, metrics))
}

/// Mean cross-validated accuracy per candidate; the first best wins. A
/// candidate that fails on any fold is skipped.
fn tune(
    grid: &[Candidate],
    x: &Array2<f64>,
    y: &[bool],
    folds: &[Vec<usize>],
) -> FitResult<(Candidate, f64)> {
    let mut best: Option<(Candidate, f64)> = None;
    let mut last_error = None;
    for candidate in grid {
        match cross_validate(candidate, x, y, folds) {
            Ok(score) => {
                tracing::debug!(params = %candidate.describe(), cv_accuracy = score, "cv scored");
                if best.is_none_or(|(_, s)| score > s) {
                    best = Some((*candidate, score));
                }
            }
            Err(err) => last_error = Some(err),
        }
    }
    best.ok_or_else(|| last_error.unwrap_or_else(|| FitError::Degenerate("no candidate scored".to_string())))
}

fn cross_validate(
    candidate: &Candidate,
    x: &Array2<f64>,
    y: &[bool],
    folds: &[Vec<usize>],
) -> FitResult<f64> {
    let mut total = 0.0;
    for held_out in folds {
        let train: Vec<usize> = (0..x.nrows()).filter(|i| held_out.binary_search(i).is_err()).collect();
        let model = candidate.fit(&x.select(Axis(0), &train), &subset(y, &train))?;
        let predicted = model.predict(&x.select(Axis(0), held_out))?;
        let correct = predicted.iter().zip(held_out).filter(|(p, i)| **p == y[**i]).count();
        total += correct as f64 / held_out.len() as f64;
    }
    Ok(total / folds.len() as f64)
}

fn subset(y: &[bool], indices: &[usize]) -> Vec<bool> {
    indices.iter().map(|&i| y[i]).collect()
}

/// Re-derive the split a bench run used, for audit exports.
pub fn split_for(examples: &[LabeledExample], config: &BenchConfig) -> Split {
    let labels: Vec<NarrativeLabel> = examples.iter().map(|e| e.label).collect();
    stratified_split(&labels, config.test_fraction, config.seed)
}
