//! Logistic regression by iteratively reweighted least squares.

use super::linalg::{cholesky, weighted_gram};
use crate::error::{FitError, FitResult};
use nalgebra::{DMatrix, DVector};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IrlsOptions {
    pub max_iterations: usize,
    /// Relative change in (penalised) deviance that counts as converged.
    pub tolerance: f64,
}

impl Default for IrlsOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GlmFit {
    pub beta: DVector<f64>,
    /// Inverse of the penalised information at the optimum.
    pub covariance: DMatrix<f64>,
    pub fitted: DVector<f64>,
    pub log_likelihood: f64,
    pub deviance: f64,
    pub iterations: usize,
    /// Trace of `(X'WX + P)^-1 X'WX`; the coefficient count when unpenalised.
    pub edf: f64,
    pub edf_by_coefficient: DVector<f64>,
}

pub(crate) fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

fn softplus(z: f64) -> f64 {
    if z > 0.0 { z + (-z).exp().ln_1p() } else { z.exp().ln_1p() }
}

pub(crate) fn log_likelihood(eta: &DVector<f64>, y: &DVector<f64>) -> f64 {
    eta.iter().zip(y.iter()).map(|(e, y)| y * e - softplus(*e)).sum()
}

pub(crate) fn working_weights(mu: &DVector<f64>) -> DVector<f64> {
    mu.map(|m| (m * (1.0 - m)).max(1e-10))
}

fn penalised_deviance(x: &DMatrix<f64>, y: &DVector<f64>, beta: &DVector<f64>, penalty: Option<&DMatrix<f64>>) -> f64 {
    let quadratic = penalty.map_or(0.0, |p| beta.dot(&(p * beta)));
    -2.0 * log_likelihood(&(x * beta), y) + quadratic
}

pub(crate) fn check_inputs(x: &DMatrix<f64>, y: &DVector<f64>) -> FitResult<()> {
    if x.is_empty() {
        return Err(FitError::Degenerate("empty design matrix".to_string()));
    }
    if x.nrows() != y.len() {
        return Err(FitError::Degenerate(format!(
            "{} design rows for {} outcomes",
            x.nrows(),
            y.len()
        )));
    }
    if y.iter().any(|v| *v != 0.0 && *v != 1.0) {
        return Err(FitError::Degenerate("outcome must be 0 or 1".to_string()));
    }
    Ok(())
}

/// Maximise the (optionally penalised) Bernoulli likelihood. Each Newton step
/// is halved until the penalised deviance does not increase.
pub fn fit_logistic(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    penalty: Option<&DMatrix<f64>>,
    options: &IrlsOptions,
) -> FitResult<GlmFit> {
    check_inputs(x, y)?;
    let mut beta = DVector::zeros(x.ncols());
    let mut deviance = penalised_deviance(x, y, &beta, penalty);
    let mut gradient_norm = f64::INFINITY;

    for iteration in 1..=options.max_iterations {
        let mu = (x * &beta).map(sigmoid);
        let mut gradient = x.tr_mul(&(y - &mu));
        let mut information = weighted_gram(x, &working_weights(&mu));
        if let Some(p) = penalty {
            gradient -= p * &beta;
            information += p;
        }
        gradient_norm = gradient.norm();
        let step = cholesky(&information, "solving the IRLS step")?.solve(&gradient);

        let mut scale = 1.0;
        let mut accepted = None;
        for _ in 0..30 {
            let trial = &beta + &step * scale;
            let value = penalised_deviance(x, y, &trial, penalty);
            if value.is_finite() && value <= deviance + 1e-12 * deviance.abs() {
                accepted = Some((trial, value));
                break;
            }
            scale *= 0.5;
        }
        let Some((trial, value)) = accepted else {
            return Err(FitError::NonConvergence {
                iterations: iteration,
                gradient_norm,
            });
        };

        let change = (deviance - value).abs() / (value.abs() + 0.1);
        beta = trial;
        deviance = value;
        if change < options.tolerance {
            return finish(x, y, beta, penalty, iteration);
        }
    }
    Err(FitError::NonConvergence {
        iterations: options.max_iterations,
        gradient_norm,
    })
}

fn finish(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    beta: DVector<f64>,
    penalty: Option<&DMatrix<f64>>,
    iterations: usize,
) -> FitResult<GlmFit> {
    let eta = x * &beta;
    let fitted = eta.map(sigmoid);
    let gram = weighted_gram(x, &working_weights(&fitted));
    let information = match penalty {
        Some(p) => &gram + p,
        None => gram.clone(),
    };
    let covariance = cholesky(&information, "inverting the information")?.inverse();
    let edf_by_coefficient = (&covariance * &gram).diagonal();
    let log_likelihood = log_likelihood(&eta, y);
    Ok(GlmFit {
        beta,
        covariance,
        fitted,
        log_likelihood,
        deviance: -2.0 * log_likelihood,
        iterations,
        edf: edf_by_coefficient.sum(),
        edf_by_coefficient,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two groups of 100 with 30 and 60 successes.
    fn two_groups() -> (DMatrix<f64>, DVector<f64>) {
        let mut rows = Vec::new();
        let mut y = Vec::new();
        for (group, successes) in [(0.0, 30), (1.0, 60)] {
            for i in 0..100 {
                rows.extend([1.0, group]);
                y.push(if i < successes { 1.0 } else { 0.0 });
            }
        }
        (DMatrix::from_row_slice(200, 2, &rows), DVector::from_vec(y))
    }

    fn logit(p: f64) -> f64 {
        (p / (1.0 - p)).ln()
    }

    #[test]
    fn saturated_binary_model_matches_closed_form() {
        let (x, y) = two_groups();
        let fit = fit_logistic(&x, &y, None, &IrlsOptions::default()).unwrap();
        assert!((fit.beta[0] - logit(0.3)).abs() < 1e-6);
        assert!((fit.beta[1] - (logit(0.6) - logit(0.3))).abs() < 1e-6);
        // Var(logit p_hat) = 1 / (n p (1 - p))
        let var0 = 1.0 / (100.0 * 0.3 * 0.7);
        assert!((fit.covariance[(0, 0)] - var0).abs() < 1e-6);
        assert!((fit.edf - 2.0).abs() < 1e-9);
        assert!(fit.iterations < 10);
        let expected_ll = 100.0 * (0.3f64.ln() * 0.3 + 0.7f64.ln() * 0.7)
            + 100.0 * (0.6f64.ln() * 0.6 + 0.4f64.ln() * 0.4);
        assert!((fit.log_likelihood - expected_ll).abs() < 1e-6);
    }

    #[test]
    fn penalty_shrinks_towards_zero() {
        let (x, y) = two_groups();
        let mut p = DMatrix::zeros(2, 2);
        p[(1, 1)] = 50.0;
        let free = fit_logistic(&x, &y, None, &IrlsOptions::default()).unwrap();
        let shrunk = fit_logistic(&x, &y, Some(&p), &IrlsOptions::default()).unwrap();
        assert!(shrunk.beta[1].abs() < free.beta[1].abs());
        assert!(shrunk.edf < 2.0);
    }

    #[test]
    fn aliased_columns_are_singular() {
        let (x, y) = two_groups();
        let aliased = DMatrix::from_fn(x.nrows(), 3, |r, c| x[(r, c.min(1))]);
        let err = fit_logistic(&aliased, &y, None, &IrlsOptions::default()).unwrap_err();
        assert!(matches!(err, FitError::Singular { .. }), "{err:?}");
    }

    #[test]
    fn iteration_cap_reports_diagnostics() {
        let (x, y) = two_groups();
        let options = IrlsOptions {
            max_iterations: 1,
            tolerance: 0.0,
        };
        match fit_logistic(&x, &y, None, &options) {
            Err(FitError::NonConvergence {
                iterations,
                gradient_norm,
            }) => {
                assert_eq!(iterations, 1);
                assert!(gradient_norm > 0.0);
            }
            other => panic!("expected non-convergence, got {other:?}"),
        }
    }

    #[test]
    fn non_binary_outcome_is_rejected() {
        let (x, mut y) = two_groups();
        y[0] = 2.0;
        assert!(matches!(
            fit_logistic(&x, &y, None, &IrlsOptions::default()),
            Err(FitError::Degenerate(_))
        ));
    }
}
