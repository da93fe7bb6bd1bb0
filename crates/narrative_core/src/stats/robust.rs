use super::cascade::{fit_arrays, groups_of, outcomes_of, CascadeReport, FittedModel};
use super::chi_squared_sf;
use super::glm::IrlsOptions;
use crate::cancel::CancelFlag;
use crate::config::ModelingConfig;
use crate::error::{FitError, FitResult};
use crate::schema::AnalysisRecord;
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

const KEPT_FAILURE_MESSAGES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LikelihoodRatio {
    pub model: String,
    pub companion: String,
    pub deviance_difference: f64,
    pub df: usize,
    pub p_value: f64,
    pub significant: bool,
}

/// Compare a random-intercept model with the same fixed effects fitted
/// without it, on the same rows and columns.
pub fn likelihood_ratio(
    model: &FittedModel,
    records: &[AnalysisRecord],
    significance: f64,
) -> FitResult<LikelihoodRatio> {
    if !model.spec.random_intercept {
        return Err(FitError::Degenerate(format!(
            "model '{}' has no random intercept to test",
            model.spec.name
        )));
    }
    let companion = model.spec.fixed_companion();
    let fixed = fit_arrays(
        &companion,
        &model.layout,
        &model.layout.matrix(records),
        &outcomes_of(records),
        &groups_of(records),
        &IrlsOptions::default(),
    )?;
    let deviance_difference = (fixed.deviance - model.estimate.deviance).max(0.0);
    let p_value = chi_squared_sf(deviance_difference, 1.0);
    Ok(LikelihoodRatio {
        model: model.spec.name.clone(),
        companion: companion.name,
        deviance_difference,
        df: 1,
        p_value,
        significant: p_value < significance,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DispersionCheck {
    pub model: String,
    pub pearson_chi_squared: f64,
    pub residual_df: f64,
    pub ratio: f64,
    pub overdispersed: bool,
}

/// Σ Pearson² / residual df. Fitted values of mixed models include the
/// random intercepts.
pub fn dispersion(model: &FittedModel, records: &[AnalysisRecord], threshold: f64) -> DispersionCheck {
    let pearson_chi_squared: f64 = records
        .iter()
        .zip(&model.estimate.fitted)
        .map(|(record, mu)| {
            let mu = mu.clamp(1e-10, 1.0 - 1e-10);
            (record.outcome() - mu).powi(2) / (mu * (1.0 - mu))
        })
        .sum();
    let residual_df = records.len() as f64 - model.estimate.parameters;
    let ratio = if residual_df > 0.0 {
        pearson_chi_squared / residual_df
    } else {
        f64::NAN
    };
    DispersionCheck {
        model: model.spec.name.clone(),
        pearson_chi_squared,
        residual_df,
        ratio,
        overdispersed: ratio > threshold,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BootstrapOptions {
    pub replicates: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BootstrapCoefficient {
    pub term: String,
    pub original: f64,
    pub mean: Option<f64>,
    pub bias: Option<f64>,
    /// The spread needs at least two successful replicates.
    pub std_error: Option<f64>,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BootstrapReport {
    pub model: String,
    pub requested: usize,
    pub attempted: usize,
    pub successful: usize,
    pub failed: usize,
    pub failure_messages: Vec<String>,
    pub cancelled: bool,
    pub coefficients: Vec<BootstrapCoefficient>,
    /// Parametric estimates of each successful replicate.
    #[serde(skip)]
    #[schemars(skip)]
    pub replicates: Vec<Vec<f64>>,
}

/// Case-resampling bootstrap of `model`. Columns stay as laid out for the
/// original fit; a replicate whose fit errors is counted and excluded.
pub fn bootstrap(
    model: &FittedModel,
    records: &[AnalysisRecord],
    options: &BootstrapOptions,
    cancel: &CancelFlag,
) -> BootstrapReport {
    let x = model.layout.matrix(records);
    let y = outcomes_of(records);
    let groups = groups_of(records);
    let n = records.len();
    let width = model.layout.parametric_width();
    let mut rng = StdRng::seed_from_u64(options.seed);

    let mut report = BootstrapReport {
        model: model.spec.name.clone(),
        requested: options.replicates,
        attempted: 0,
        successful: 0,
        failed: 0,
        failure_messages: Vec::new(),
        cancelled: false,
        coefficients: Vec::new(),
        replicates: Vec::new(),
    };

    for replicate in 0..options.replicates {
        if cancel.is_cancelled() {
            tracing::warn!(completed = replicate, "bootstrap cancelled; reporting partial results");
            report.cancelled = true;
            break;
        }
        let rows: Vec<usize> = (0..n).map(|_| rng.random_range(0..n)).collect();
        let xs = x.select_rows(rows.iter());
        let ys = DVector::from_iterator(n, rows.iter().map(|&i| y[i]));
        let gs: Vec<usize> = rows.iter().map(|&i| groups[i]).collect();
        report.attempted += 1;
        match fit_arrays(&model.spec, &model.layout, &xs, &ys, &gs, &IrlsOptions::default()) {
            Ok(estimate) => {
                report.successful += 1;
                report.replicates.push(estimate.beta.rows(0, width).iter().copied().collect());
            }
            Err(err) => {
                report.failed += 1;
                tracing::debug!(replicate, error = %err, "bootstrap replicate failed");
                if report.failure_messages.len() < KEPT_FAILURE_MESSAGES {
                    report.failure_messages.push(format!("replicate {replicate}: {err}"));
                }
            }
        }
        if (replicate + 1) % 100 == 0 {
            tracing::info!(
                done = replicate + 1,
                of = options.replicates,
                failed = report.failed,
                "bootstrap progress"
            );
        }
    }

    report.coefficients = (0..width)
        .map(|k| {
            let mut values: Vec<f64> = report.replicates.iter().map(|b| b[k]).collect();
            let original = model.estimate.beta[k];
            let count = values.len() as f64;
            let mean = (!values.is_empty()).then(|| values.iter().sum::<f64>() / count);
            let spread = values.len() > 1;
            let std_error = mean
                .filter(|_| spread)
                .map(|m| (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (count - 1.0)).sqrt());
            values.sort_by(f64::total_cmp);
            BootstrapCoefficient {
                term: model.layout.names[k].clone(),
                original,
                mean,
                bias: mean.map(|m| m - original),
                std_error,
                lower: quantile(&values, 0.025).filter(|_| spread),
                upper: quantile(&values, 0.975).filter(|_| spread),
            }
        })
        .collect();
    tracing::info!(
        model = %report.model,
        successful = report.successful,
        failed = report.failed,
        cancelled = report.cancelled,
        "bootstrap finished"
    );
    report
}

fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    match sorted.len() {
        0 => None,
        1 => Some(sorted[0]),
        n => {
            let h = (n - 1) as f64 * q;
            let lo = h.floor() as usize;
            let hi = (lo + 1).min(n - 1);
            Some(sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo]))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RobustnessReport {
    pub likelihood_ratios: Vec<LikelihoodRatio>,
    pub skipped: Vec<(String, String)>,
    pub dispersion: Vec<DispersionCheck>,
    pub bootstrap: Option<BootstrapReport>,
}

pub fn run_robustness(
    cascade: &CascadeReport,
    records: &[AnalysisRecord],
    modeling: &ModelingConfig,
    cancel: &CancelFlag,
) -> RobustnessReport {
    let mut report = RobustnessReport {
        likelihood_ratios: Vec::new(),
        skipped: Vec::new(),
        dispersion: Vec::new(),
        bootstrap: None,
    };

    for model in cascade.fitted() {
        if model.spec.random_intercept {
            match likelihood_ratio(model, records, modeling.significance) {
                Ok(lrt) => report.likelihood_ratios.push(lrt),
                Err(err) => {
                    tracing::warn!(model = %model.spec.name, error = %err, "likelihood-ratio test failed");
                    report.skipped.push((format!("lrt:{}", model.spec.name), err.to_string()));
                }
            }
        }
        let check = dispersion(model, records, modeling.dispersion_threshold);
        if check.overdispersed {
            tracing::warn!(model = %check.model, ratio = check.ratio, "overdispersion");
        }
        report.dispersion.push(check);
    }

    match cascade.find(&modeling.bootstrap_model) {
        Some(model) if modeling.bootstrap_replicates > 0 => {
            let options = BootstrapOptions {
                replicates: modeling.bootstrap_replicates,
                seed: modeling.bootstrap_seed,
            };
            report.bootstrap = Some(bootstrap(model, records, &options, cancel));
        }
        Some(_) => {}
        None => {
            tracing::warn!(model = %modeling.bootstrap_model, "bootstrap model not fitted; skipping bootstrap");
            report.skipped.push((
                format!("bootstrap:{}", modeling.bootstrap_model),
                "model missing from the cascade or failed to fit".to_string(),
            ));
        }
    }
    report
}
