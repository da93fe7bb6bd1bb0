use super::design::{DesignLayout, Factor};
use super::glm::sigmoid;
use crate::schema::AnalysisRecord;
use nalgebra::{DMatrix, DVector};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Two-sided 95% standard normal quantile.
pub const Z_95: f64 = 1.959_963_984_540_054;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MarginalRow {
    /// `factor=level` for each focal factor.
    pub levels: Vec<String>,
    pub probability: f64,
    pub std_error: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Average predicted probability of decline framing with every observation
/// set to each combination of focal levels (random intercepts at zero).
/// Standard errors by the delta method; intervals are clipped to [0, 1].
pub fn marginal_predictions(
    layout: &DesignLayout,
    beta: &DVector<f64>,
    covariance: &DMatrix<f64>,
    records: &[AnalysisRecord],
    focal: &[Factor],
) -> Vec<MarginalRow> {
    if focal.is_empty() || records.is_empty() {
        return Vec::new();
    }
    let mut combos: Vec<Vec<(Factor, usize)>> = vec![Vec::new()];
    for &factor in focal {
        combos = combos
            .into_iter()
            .flat_map(|prefix| {
                (0..factor.level_count()).map(move |level| {
                    let mut next = prefix.clone();
                    next.push((factor, level));
                    next
                })
            })
            .collect();
    }

    let n = records.len() as f64;
    combos
        .into_iter()
        .filter(|combo| observed(records, combo))
        .map(|combo| {
            let x = layout.matrix_with(records, &combo);
            let mu = (&x * beta).map(sigmoid);
            let probability = mu.sum() / n;
            let gradient = x.tr_mul(&mu.map(|m| m * (1.0 - m) / n));
            let std_error = gradient.dot(&(covariance * &gradient)).max(0.0).sqrt();
            MarginalRow {
                levels: combo
                    .iter()
                    .map(|(factor, level)| format!("{}={}", factor.as_str(), layout.level_name(*factor, *level)))
                    .collect(),
                probability,
                std_error,
                lower: (probability - Z_95 * std_error).max(0.0),
                upper: (probability + Z_95 * std_error).min(1.0),
            }
        })
        .collect()
}

/// Window levels absent from the data have no estimable column; skip them.
fn observed(records: &[AnalysisRecord], combo: &[(Factor, usize)]) -> bool {
    combo.iter().all(|(factor, level)| {
        *factor != Factor::EventWindow || records.iter().any(|r| r.window == *level)
    })
}
