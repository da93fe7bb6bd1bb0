//! Logistic regression with a random intercept per group, fitted by the
//! Laplace approximation. The fixed-effect block of each Newton step goes
//! through the Schur complement `A - B' D⁻¹ B`; `D` is diagonal.

use super::glm::{check_inputs, fit_logistic, log_likelihood, sigmoid, working_weights, IrlsOptions};
use super::linalg::{cholesky, weighted_gram};
use crate::error::{FitError, FitResult};
use argmin::core::{CostFunction, Executor, State};
use argmin::solver::brent::BrentOpt;
use nalgebra::{DMatrix, DVector};
use std::cell::Cell;

const LOG_SIGMA_MIN: f64 = -6.907_755_278_982_137; // ln 1e-3
const LOG_SIGMA_MAX: f64 = 2.302_585_092_994_046; // ln 10
const SEARCH_ITERATIONS: u64 = 100;
const FAILED_COST: f64 = 1e12;

#[derive(Debug, Clone)]
pub struct MixedFit {
    pub beta: DVector<f64>,
    pub covariance: DMatrix<f64>,
    /// Conditional modes of the group intercepts.
    pub random_effects: DVector<f64>,
    pub sigma: f64,
    pub fitted: DVector<f64>,
    pub log_likelihood: f64,
    pub deviance: f64,
    pub iterations: usize,
    pub evaluations: usize,
}

struct Mode {
    beta: DVector<f64>,
    u: DVector<f64>,
    laplace: f64,
    covariance: DMatrix<f64>,
    fitted: DVector<f64>,
    iterations: usize,
}

struct Blocks {
    a: DMatrix<f64>,
    b: DMatrix<f64>,
    d: DVector<f64>,
    h: DVector<f64>,
}

impl Blocks {
    fn schur(&self) -> DMatrix<f64> {
        let mut scaled = self.b.clone();
        for (mut row, dj) in scaled.row_iter_mut().zip(self.d.iter()) {
            row /= *dj;
        }
        &self.a - self.b.tr_mul(&scaled)
    }
}

struct Problem<'a> {
    x: &'a DMatrix<f64>,
    y: &'a DVector<f64>,
    groups: &'a [usize],
    n_groups: usize,
    start: DVector<f64>,
    options: IrlsOptions,
}

impl Problem<'_> {
    fn eta(&self, beta: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        let mut eta = self.x * beta;
        for (e, &g) in eta.iter_mut().zip(self.groups) {
            *e += u[g];
        }
        eta
    }

    fn objective(&self, beta: &DVector<f64>, u: &DVector<f64>, sigma2: f64) -> f64 {
        log_likelihood(&self.eta(beta, u), self.y) - u.norm_squared() / (2.0 * sigma2)
    }

    fn blocks(&self, mu: &DVector<f64>, sigma2: f64) -> Blocks {
        let w = working_weights(mu);
        let mut b = DMatrix::zeros(self.n_groups, self.x.ncols());
        let mut h = DVector::zeros(self.n_groups);
        for (i, &g) in self.groups.iter().enumerate() {
            h[g] += w[i];
            let mut bg = b.row_mut(g);
            bg += self.x.row(i) * w[i];
        }
        let d = h.map(|hj| hj + 1.0 / sigma2);
        Blocks {
            a: weighted_gram(self.x, &w),
            b,
            d,
            h,
        }
    }

    fn conditional_mode(&self, sigma: f64) -> FitResult<Mode> {
        let sigma2 = sigma * sigma;
        let mut beta = self.start.clone();
        let mut u = DVector::zeros(self.n_groups);
        let mut current = self.objective(&beta, &u, sigma2);
        let mut gradient_norm = f64::INFINITY;

        for iteration in 1..=self.options.max_iterations {
            let mu = self.eta(&beta, &u).map(sigmoid);
            let resid = self.y - &mu;
            let g_beta = self.x.tr_mul(&resid);
            let mut g_u = &u / -sigma2;
            for (r, &g) in resid.iter().zip(self.groups) {
                g_u[g] += r;
            }
            gradient_norm = (g_beta.norm_squared() + g_u.norm_squared()).sqrt();

            let blocks = self.blocks(&mu, sigma2);
            let chol = cholesky(&blocks.schur(), "solving the mixed-model step")?;
            let g_scaled = g_u.component_div(&blocks.d);
            let step_beta = chol.solve(&(&g_beta - blocks.b.tr_mul(&g_scaled)));
            let step_u = (&g_u - &blocks.b * &step_beta).component_div(&blocks.d);

            let mut scale = 1.0;
            let mut accepted = None;
            for _ in 0..30 {
                let beta_t = &beta + &step_beta * scale;
                let u_t = &u + &step_u * scale;
                let value = self.objective(&beta_t, &u_t, sigma2);
                if value.is_finite() && value >= current - 1e-12 * current.abs() {
                    accepted = Some((beta_t, u_t, value));
                    break;
                }
                scale *= 0.5;
            }
            let Some((beta_t, u_t, value)) = accepted else {
                return Err(FitError::NonConvergence {
                    iterations: iteration,
                    gradient_norm,
                });
            };
            let change = (value - current).abs() / (value.abs() + 0.1);
            beta = beta_t;
            u = u_t;
            current = value;
            if change < self.options.tolerance {
                return self.mode_at(beta, u, sigma, iteration);
            }
        }
        Err(FitError::NonConvergence {
            iterations: self.options.max_iterations,
            gradient_norm,
        })
    }

    fn mode_at(&self, beta: DVector<f64>, u: DVector<f64>, sigma: f64, iterations: usize) -> FitResult<Mode> {
        let sigma2 = sigma * sigma;
        let fitted = self.eta(&beta, &u).map(sigmoid);
        let blocks = self.blocks(&fitted, sigma2);
        let covariance = cholesky(&blocks.schur(), "inverting the mixed-model information")?.inverse();
        let laplace = self.objective(&beta, &u, sigma2) - 0.5 * blocks.h.iter().map(|hj| (sigma2 * hj).ln_1p()).sum::<f64>();
        Ok(Mode {
            beta,
            u,
            laplace,
            covariance,
            fitted,
            iterations,
        })
    }
}

/// Negative Laplace likelihood as a function of ln σ.
struct SigmaSearch<'a> {
    problem: &'a Problem<'a>,
    evaluations: &'a Cell<usize>,
}

impl CostFunction for SigmaSearch<'_> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, log_sigma: &f64) -> Result<f64, argmin::core::Error> {
        self.evaluations.set(self.evaluations.get() + 1);
        Ok(match self.problem.conditional_mode(log_sigma.exp()) {
            Ok(mode) => -mode.laplace,
            Err(err) => {
                tracing::debug!(sigma = log_sigma.exp(), error = %err, "inner fit failed");
                FAILED_COST
            }
        })
    }
}

/// `groups[i]` is the group of row `i`, in `0..n_groups`.
pub fn fit_mixed_logistic(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    groups: &[usize],
    n_groups: usize,
    options: &IrlsOptions,
) -> FitResult<MixedFit> {
    check_inputs(x, y)?;
    if groups.len() != y.len() || groups.iter().any(|g| *g >= n_groups) {
        return Err(FitError::Degenerate("group index out of range".to_string()));
    }
    let start = match fit_logistic(x, y, None, options) {
        Ok(fit) => fit.beta,
        Err(FitError::Singular { context }) => return Err(FitError::Singular { context }),
        Err(_) => DVector::zeros(x.ncols()),
    };
    let problem = Problem {
        x,
        y,
        groups,
        n_groups,
        start,
        options: *options,
    };

    let evaluations = Cell::new(0);
    let search = SigmaSearch {
        problem: &problem,
        evaluations: &evaluations,
    };
    let result = Executor::new(search, BrentOpt::new(LOG_SIGMA_MIN, LOG_SIGMA_MAX))
        .configure(|state| state.max_iters(SEARCH_ITERATIONS))
        .run()
        .map_err(|err| FitError::Library {
            algorithm: "brent",
            message: err.to_string(),
        })?;
    let log_sigma = result
        .state()
        .get_best_param()
        .copied()
        .ok_or_else(|| FitError::Library {
            algorithm: "brent",
            message: "search returned no parameter".to_string(),
        })?;
    let sigma = log_sigma.exp();

    let mode = problem.conditional_mode(sigma)?;
    let log_likelihood = mode.laplace;
    Ok(MixedFit {
        beta: mode.beta,
        covariance: mode.covariance,
        random_effects: mode.u,
        sigma,
        fitted: mode.fitted,
        log_likelihood,
        deviance: -2.0 * log_likelihood,
        iterations: mode.iterations,
        evaluations: evaluations.get() + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// `groups` groups of `per_group` rows; one binary covariate; group
    /// intercepts drawn with standard deviation `sigma`.
    fn simulate(groups: usize, per_group: usize, sigma: f64, seed: u64) -> (DMatrix<f64>, DVector<f64>, Vec<usize>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut rows = Vec::new();
        let mut y = Vec::new();
        let mut membership = Vec::new();
        for g in 0..groups {
            // Box-Muller
            let (u1, u2): (f64, f64) = (rng.random_range(1e-12..1.0), rng.random());
            let effect = sigma * (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
            for i in 0..per_group {
                let x = (i % 2) as f64;
                let eta = -0.4 + 1.0 * x + effect;
                let p = 1.0 / (1.0 + (-eta).exp());
                rows.extend([1.0, x]);
                y.push(if rng.random::<f64>() < p { 1.0 } else { 0.0 });
                membership.push(g);
            }
        }
        (DMatrix::from_row_slice(y.len(), 2, &rows), DVector::from_vec(y), membership)
    }

    #[test]
    fn recovers_group_variation() {
        let (x, y, groups) = simulate(80, 40, 1.2, 3);
        let fit = fit_mixed_logistic(&x, &y, &groups, 80, &IrlsOptions::default()).unwrap();
        assert!(fit.sigma > 0.7 && fit.sigma < 1.8, "sigma {}", fit.sigma);
        assert!((fit.beta[1] - 1.0).abs() < 0.3, "beta {}", fit.beta);
        assert_eq!(fit.random_effects.len(), 80);
        assert!(fit.covariance[(1, 1)] > 0.0);
        assert!(fit.evaluations > 2);
    }

    #[test]
    fn no_group_variation_shrinks_sigma() {
        let (x, y, groups) = simulate(40, 50, 0.0, 5);
        let mixed = fit_mixed_logistic(&x, &y, &groups, 40, &IrlsOptions::default()).unwrap();
        let fixed = fit_logistic(&x, &y, None, &IrlsOptions::default()).unwrap();
        assert!(mixed.sigma < 0.4, "sigma {}", mixed.sigma);
        // the Laplace likelihood can only improve on sigma -> 0
        assert!(mixed.log_likelihood >= fixed.log_likelihood - 1e-3);
    }

    #[test]
    fn fitting_twice_is_identical() {
        let (x, y, groups) = simulate(30, 20, 1.0, 9);
        let a = fit_mixed_logistic(&x, &y, &groups, 30, &IrlsOptions::default()).unwrap();
        let b = fit_mixed_logistic(&x, &y, &groups, 30, &IrlsOptions::default()).unwrap();
        assert_eq!(a.beta, b.beta);
        assert_eq!(a.sigma, b.sigma);
    }

    #[test]
    fn inner_non_convergence_is_surfaced() {
        let (x, y, groups) = simulate(20, 20, 1.0, 1);
        let options = IrlsOptions {
            max_iterations: 3,
            tolerance: 0.0,
        };
        match fit_mixed_logistic(&x, &y, &groups, 20, &options) {
            Err(FitError::NonConvergence {
                iterations,
                gradient_norm,
            }) => {
                assert!(iterations <= 3);
                assert!(gradient_norm.is_finite());
            }
            other => panic!("expected non-convergence, got {other:?}"),
        }
    }

    #[test]
    fn bad_group_index_is_rejected() {
        let (x, y, mut groups) = simulate(5, 4, 1.0, 2);
        groups[0] = 5;
        assert!(matches!(
            fit_mixed_logistic(&x, &y, &groups, 5, &IrlsOptions::default()),
            Err(FitError::Degenerate(_))
        ));
    }
}
