use super::design::{DesignLayout, ModelSpec};
use super::glm::{fit_logistic, IrlsOptions};
use super::marginal::{marginal_predictions, MarginalRow};
use super::mixed::fit_mixed_logistic;
use super::normal_two_sided_p;
use super::spline::fit_additive_logistic;
use crate::error::{FitError, FitResult, PipelineError, Result};
use crate::schema::AnalysisRecord;
use nalgebra::{DMatrix, DVector};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Logistic,
    MixedLogistic,
    AdditiveLogistic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CoefficientRow {
    pub term: String,
    pub estimate: f64,
    pub std_error: f64,
    /// `None` when the standard error is zero or not finite.
    pub z: Option<f64>,
    pub p_value: Option<f64>,
    pub significant: bool,
}

impl CoefficientRow {
    pub fn new(term: &str, estimate: f64, variance: f64, significance: f64) -> Self {
        let std_error = variance.max(0.0).sqrt();
        let z = (std_error > 0.0 && std_error.is_finite()).then(|| estimate / std_error);
        let p_value = z.map(normal_two_sided_p);
        Self {
            term: term.to_string(),
            estimate,
            std_error,
            z,
            p_value,
            significant: p_value.is_some_and(|p| p < significance),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RandomInterceptSummary {
    pub groups: usize,
    pub variance: f64,
    pub std_dev: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SmoothSummary {
    pub term: String,
    pub edf: f64,
    pub lambda: f64,
    pub chi_squared: f64,
    pub p_value: f64,
    pub significant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModelFit {
    pub name: String,
    pub hypothesis: String,
    pub family: Family,
    pub observations: usize,
    pub coefficients: Vec<CoefficientRow>,
    pub random_intercept: Option<RandomInterceptSummary>,
    pub smooth: Option<SmoothSummary>,
    pub log_likelihood: f64,
    pub deviance: f64,
    pub aic: f64,
    pub iterations: usize,
    #[serde(default)]
    pub dropped_columns: Vec<String>,
    #[serde(default)]
    pub marginal: Vec<MarginalRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FitFailure {
    pub kind: String,
    pub message: String,
    pub iterations: Option<usize>,
    pub gradient_norm: Option<f64>,
}

impl From<&FitError> for FitFailure {
    fn from(err: &FitError) -> Self {
        let (kind, iterations, gradient_norm) = match err {
            FitError::NonConvergence {
                iterations,
                gradient_norm,
            } => ("non_convergence", Some(*iterations), Some(*gradient_norm)),
            FitError::Singular { .. } => ("singular", None, None),
            FitError::Degenerate(_) => ("degenerate", None, None),
            FitError::Library { .. } => ("library", None, None),
        };
        Self {
            kind: kind.to_string(),
            message: err.to_string(),
            iterations,
            gradient_norm,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModelOutcome {
    Fitted(ModelFit),
    Failed {
        name: String,
        hypothesis: String,
        failure: FitFailure,
    },
}

impl ModelOutcome {
    pub fn name(&self) -> &str {
        match self {
            ModelOutcome::Fitted(fit) => &fit.name,
            ModelOutcome::Failed { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothStats {
    pub lambda: f64,
    pub edf: f64,
    pub chi_squared: f64,
    pub p_value: f64,
}

/// Estimates shared by every family. `parameters` counts the variance
/// parameter of a mixed model and is the total edf of an additive one.
#[derive(Debug, Clone)]
pub struct Estimate {
    pub family: Family,
    pub beta: DVector<f64>,
    pub covariance: DMatrix<f64>,
    pub fitted: DVector<f64>,
    pub log_likelihood: f64,
    pub deviance: f64,
    pub parameters: f64,
    pub iterations: usize,
    pub sigma: Option<f64>,
    pub smooth: Option<SmoothStats>,
}

impl Estimate {
    pub fn aic(&self) -> f64 {
        self.deviance + 2.0 * self.parameters
    }
}

/// Fit one specification to already-built arrays. Used for the original fit
/// and for every bootstrap resample, so the column layout stays fixed.
pub fn fit_arrays(
    spec: &ModelSpec,
    layout: &DesignLayout,
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    groups: &[usize],
    options: &IrlsOptions,
) -> FitResult<Estimate> {
    if spec.random_intercept && spec.smooth_date {
        return Err(FitError::Degenerate(
            "a random intercept cannot be combined with the smooth date term".to_string(),
        ));
    }
    if spec.random_intercept {
        let n_groups = groups.iter().max().map_or(0, |g| g + 1);
        let fit = fit_mixed_logistic(x, y, groups, n_groups, options)?;
        return Ok(Estimate {
            family: Family::MixedLogistic,
            parameters: fit.beta.len() as f64 + 1.0,
            beta: fit.beta,
            covariance: fit.covariance,
            fitted: fit.fitted,
            log_likelihood: fit.log_likelihood,
            deviance: fit.deviance,
            iterations: fit.iterations,
            sigma: Some(fit.sigma),
            smooth: None,
        });
    }
    if let Some(basis) = &layout.smooth {
        let gam = fit_additive_logistic(x, y, &basis.penalty(), layout.parametric_width(), options)?;
        return Ok(Estimate {
            family: Family::AdditiveLogistic,
            parameters: gam.glm.edf,
            beta: gam.glm.beta,
            covariance: gam.glm.covariance,
            fitted: gam.glm.fitted,
            log_likelihood: gam.glm.log_likelihood,
            deviance: gam.glm.deviance,
            iterations: gam.glm.iterations,
            sigma: None,
            smooth: Some(SmoothStats {
                lambda: gam.lambda,
                edf: gam.smooth_edf,
                chi_squared: gam.chi_squared,
                p_value: gam.p_value,
            }),
        });
    }
    let fit = fit_logistic(x, y, None, options)?;
    Ok(Estimate {
        family: Family::Logistic,
        parameters: fit.beta.len() as f64,
        beta: fit.beta,
        covariance: fit.covariance,
        fitted: fit.fitted,
        log_likelihood: fit.log_likelihood,
        deviance: fit.deviance,
        iterations: fit.iterations,
        sigma: None,
        smooth: None,
    })
}

pub fn outcomes_of(records: &[AnalysisRecord]) -> DVector<f64> {
    DVector::from_iterator(records.len(), records.iter().map(AnalysisRecord::outcome))
}

pub fn groups_of(records: &[AnalysisRecord]) -> Vec<usize> {
    records.iter().map(|r| r.legislator).collect()
}

#[derive(Debug, Clone)]
pub struct FittedModel {
    pub spec: ModelSpec,
    pub layout: DesignLayout,
    pub estimate: Estimate,
    pub summary: ModelFit,
}

pub fn fit_model(spec: &ModelSpec, records: &[AnalysisRecord], significance: f64) -> FitResult<FittedModel> {
    let layout = DesignLayout::build(spec, records)?;
    let x = layout.matrix(records);
    let estimate = fit_arrays(
        spec,
        &layout,
        &x,
        &outcomes_of(records),
        &groups_of(records),
        &IrlsOptions::default(),
    )?;

    let coefficients = (0..layout.parametric_width())
        .map(|i| CoefficientRow::new(&layout.names[i], estimate.beta[i], estimate.covariance[(i, i)], significance))
        .collect();
    let random_intercept = estimate.sigma.map(|sigma| RandomInterceptSummary {
        groups: records
            .iter()
            .map(|r| r.legislator)
            .collect::<std::collections::BTreeSet<_>>()
            .len(),
        variance: sigma * sigma,
        std_dev: sigma,
    });
    let smooth = estimate.smooth.map(|s| SmoothSummary {
        term: "s(day)".to_string(),
        edf: s.edf,
        lambda: s.lambda,
        chi_squared: s.chi_squared,
        p_value: s.p_value,
        significant: s.p_value < significance,
    });
    let marginal = marginal_predictions(&layout, &estimate.beta, &estimate.covariance, records, &spec.marginal);

    let summary = ModelFit {
        name: spec.name.clone(),
        hypothesis: spec.hypothesis.clone(),
        family: estimate.family,
        observations: records.len(),
        coefficients,
        random_intercept,
        smooth,
        log_likelihood: estimate.log_likelihood,
        deviance: estimate.deviance,
        aic: estimate.aic(),
        iterations: estimate.iterations,
        dropped_columns: layout.dropped.clone(),
        marginal,
    };
    Ok(FittedModel {
        spec: spec.clone(),
        layout,
        estimate,
        summary,
    })
}

#[derive(Debug, Clone)]
pub struct CascadeEntry {
    pub spec: ModelSpec,
    pub result: FitResult<FittedModel>,
}

#[derive(Debug, Clone)]
pub struct CascadeReport {
    pub observations: usize,
    pub entries: Vec<CascadeEntry>,
}

impl CascadeReport {
    pub fn find(&self, name: &str) -> Option<&FittedModel> {
        self.entries
            .iter()
            .find(|e| e.spec.name == name)
            .and_then(|e| e.result.as_ref().ok())
    }

    pub fn fitted(&self) -> impl Iterator<Item = &FittedModel> {
        self.entries.iter().filter_map(|e| e.result.as_ref().ok())
    }

    pub fn outcomes(&self) -> Vec<ModelOutcome> {
        self.entries
            .iter()
            .map(|entry| match &entry.result {
                Ok(model) => ModelOutcome::Fitted(model.summary.clone()),
                Err(err) => ModelOutcome::Failed {
                    name: entry.spec.name.clone(),
                    hypothesis: entry.spec.hypothesis.clone(),
                    failure: FitFailure::from(err),
                },
            })
            .collect()
    }
}

/// Fit every specification in order. A model that fails is recorded with its
/// diagnostics and the cascade moves on.
pub fn run_cascade(records: &[AnalysisRecord], specs: &[ModelSpec], significance: f64) -> Result<CascadeReport> {
    if records.is_empty() {
        return Err(PipelineError::EmptyAnalysisSet);
    }
    let mut entries = Vec::with_capacity(specs.len());
    for spec in specs {
        let result = fit_model(spec, records, significance);
        match &result {
            Ok(model) => tracing::info!(
                model = %spec.name,
                family = ?model.summary.family,
                aic = model.summary.aic,
                iterations = model.summary.iterations,
                "model fitted"
            ),
            Err(err) => tracing::warn!(model = %spec.name, error = %err, "model failed"),
        }
        entries.push(CascadeEntry {
            spec: spec.clone(),
            result,
        });
    }
    Ok(CascadeReport {
        observations: records.len(),
        entries,
    })
}
