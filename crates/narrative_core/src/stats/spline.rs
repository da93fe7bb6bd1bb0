//! Cubic P-splines and the additive logistic model built on them.

use super::glm::{fit_logistic, GlmFit, IrlsOptions};
use super::linalg::{cholesky, submatrix};
use super::chi_squared_sf;
use crate::error::{FitError, FitResult};
use nalgebra::{DMatrix, DVector};

const DEGREE: usize = 3;

/// Equally spaced cubic B-spline basis over the observed range, centred on the
/// fitting data with the last column dropped so it is identifiable next to an
/// intercept.
#[derive(Debug, Clone, PartialEq)]
pub struct SplineBasis {
    knots: Vec<f64>,
    lo: f64,
    hi: f64,
    size: usize,
    means: Vec<f64>,
}

impl SplineBasis {
    pub fn new(values: &[f64], size: usize) -> FitResult<Self> {
        if size <= DEGREE + 1 {
            return Err(FitError::Degenerate(format!("spline basis of size {size} is too small")));
        }
        let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !(hi > lo) {
            return Err(FitError::Degenerate("smooth covariate has no spread".to_string()));
        }
        let h = (hi - lo) / (size - DEGREE) as f64;
        let knots = (0..size + DEGREE + 1)
            .map(|i| lo + (i as f64 - DEGREE as f64) * h)
            .collect();
        let mut basis = Self {
            knots,
            lo,
            hi,
            size,
            means: vec![0.0; size],
        };
        let mut sums = vec![0.0; size];
        for &v in values {
            for (s, b) in sums.iter_mut().zip(basis.raw(v)) {
                *s += b;
            }
        }
        basis.means = sums.into_iter().map(|s| s / values.len() as f64).collect();
        Ok(basis)
    }

    pub fn width(&self) -> usize {
        self.size - 1
    }

    /// Uncentred B-spline values (Cox-de Boor); `x` is clamped to the range.
    pub fn raw(&self, x: f64) -> Vec<f64> {
        let x = x.clamp(self.lo, self.hi);
        let t = &self.knots;
        let n_intervals = t.len() - 1;
        // last knot span is closed on the right
        let span = (DEGREE..self.size)
            .find(|&i| x >= t[i] && x < t[i + 1])
            .unwrap_or(self.size - 1);

        let mut b = vec![0.0; n_intervals];
        b[span] = 1.0;
        for d in 1..=DEGREE {
            for i in 0..n_intervals - d {
                let left = if t[i + d] > t[i] { (x - t[i]) / (t[i + d] - t[i]) * b[i] } else { 0.0 };
                let right = if t[i + d + 1] > t[i + 1] {
                    (t[i + d + 1] - x) / (t[i + d + 1] - t[i + 1]) * b[i + 1]
                } else {
                    0.0
                };
                b[i] = left + right;
            }
        }
        b.truncate(self.size);
        b
    }

    pub fn row(&self, x: f64) -> Vec<f64> {
        self.raw(x)
            .into_iter()
            .zip(&self.means)
            .take(self.width())
            .map(|(b, m)| b - m)
            .collect()
    }

    /// Second-difference penalty `D'D` restricted to the kept columns.
    pub fn penalty(&self) -> DMatrix<f64> {
        let k = self.width();
        let mut s = DMatrix::zeros(k, k);
        for r in 0..self.size - 2 {
            let diff = [(r, 1.0), (r + 1, -2.0), (r + 2, 1.0)];
            for &(i, a) in &diff {
                for &(j, b) in &diff {
                    if i < k && j < k {
                        s[(i, j)] += a * b;
                    }
                }
            }
        }
        s
    }
}

/// Log10 grid of smoothing parameters searched by AIC.
pub fn lambda_grid() -> Vec<f64> {
    (0..=14).map(|k| 10f64.powf(-3.0 + 0.5 * k as f64)).collect()
}

#[derive(Debug, Clone)]
pub struct GamFit {
    pub glm: GlmFit,
    pub lambda: f64,
    pub aic: f64,
    pub smooth_edf: f64,
    pub chi_squared: f64,
    pub p_value: f64,
}

/// Penalised logistic fit where columns `offset..offset + penalty.nrows()` of
/// `x` are the smooth block. λ is picked on [`lambda_grid`] by minimum
/// `deviance + 2 * edf`; the smooth is tested with a Wald χ² on `edf` df.
pub fn fit_additive_logistic(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    penalty: &DMatrix<f64>,
    offset: usize,
    options: &IrlsOptions,
) -> FitResult<GamFit> {
    let p = x.ncols();
    let k = penalty.nrows();
    if offset + k > p {
        return Err(FitError::Degenerate("smooth block exceeds the design width".to_string()));
    }

    let mut best: Option<(f64, f64, GlmFit)> = None;
    let mut last_error = None;
    for lambda in lambda_grid() {
        let mut full = DMatrix::<f64>::zeros(p, p);
        full.view_mut((offset, offset), (k, k)).copy_from(&(penalty * lambda));
        match fit_logistic(x, y, Some(&full), options) {
            Ok(fit) => {
                let aic = fit.deviance + 2.0 * fit.edf;
                tracing::debug!(lambda, aic, edf = fit.edf, "smoothing parameter scored");
                if best.as_ref().is_none_or(|(_, a, _)| aic < *a) {
                    best = Some((lambda, aic, fit));
                }
            }
            Err(err) => last_error = Some(err),
        }
    }
    let (lambda, aic, glm) = best.ok_or_else(|| {
        last_error.unwrap_or_else(|| FitError::Degenerate("no smoothing parameter fitted".to_string()))
    })?;

    let block: Vec<usize> = (offset..offset + k).collect();
    let smooth_edf: f64 = block.iter().map(|&i| glm.edf_by_coefficient[i]).sum();
    let coefs = glm.beta.rows(offset, k).into_owned();
    let chi_squared = match cholesky(&submatrix(&glm.covariance, &block), "testing the smooth term") {
        Ok(chol) => coefs.dot(&chol.solve(&coefs)),
        Err(_) => f64::NAN,
    };
    let p_value = chi_squared_sf(chi_squared, smooth_edf.max(1.0));
    Ok(GamFit {
        glm,
        lambda,
        aic,
        smooth_edf,
        chi_squared,
        p_value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn days() -> Vec<f64> {
        (0..200).map(|d| d as f64).collect()
    }

    #[test]
    fn raw_basis_is_a_partition_of_unity() {
        let basis = SplineBasis::new(&days(), 10).unwrap();
        for x in [0.0, 13.7, 99.5, 150.0, 199.0, 250.0] {
            let raw = basis.raw(x);
            assert_eq!(raw.len(), 10);
            assert!((raw.iter().sum::<f64>() - 1.0).abs() < 1e-12, "x = {x}");
            assert!(raw.iter().all(|b| *b >= 0.0));
        }
    }

    #[test]
    fn centred_columns_average_zero_on_fitting_data() {
        let data = days();
        let basis = SplineBasis::new(&data, 10).unwrap();
        assert_eq!(basis.width(), 9);
        let mut sums = vec![0.0; 9];
        for &d in &data {
            for (s, v) in sums.iter_mut().zip(basis.row(d)) {
                *s += v;
            }
        }
        assert!(sums.iter().all(|s| s.abs() < 1e-9));
    }

    #[test]
    fn penalty_vanishes_on_linear_coefficients() {
        let basis = SplineBasis::new(&days(), 10).unwrap();
        let s = basis.penalty();
        // linear in the index with the dropped coefficient at zero
        let coef = DVector::from_fn(9, |i, _| i as f64 - 9.0);
        let quad = coef.dot(&(&s * &coef));
        assert!(quad.abs() < 1e-9);
    }

    #[test]
    fn constant_covariate_is_degenerate() {
        assert!(matches!(SplineBasis::new(&[3.0, 3.0], 10), Err(FitError::Degenerate(_))));
    }

    #[test]
    fn additive_fit_detects_a_strong_trend() {
        let mut rng = StdRng::seed_from_u64(11);
        let data: Vec<f64> = (0..1500).map(|i| (i % 300) as f64).collect();
        let basis = SplineBasis::new(&data, 10).unwrap();
        let mut rows = Vec::new();
        let mut y = Vec::new();
        for &d in &data {
            let eta = 2.0 * (d / 300.0 * std::f64::consts::TAU).sin();
            let p = 1.0 / (1.0 + (-eta).exp());
            y.push(if rng.random::<f64>() < p { 1.0 } else { 0.0 });
            rows.push(1.0);
            rows.extend(basis.row(d));
        }
        let x = DMatrix::from_row_slice(data.len(), 10, &rows);
        let y = DVector::from_vec(y);
        let fit = fit_additive_logistic(&x, &y, &basis.penalty(), 1, &IrlsOptions::default()).unwrap();
        assert!(fit.smooth_edf > 1.5 && fit.smooth_edf < 9.0, "edf {}", fit.smooth_edf);
        assert!(fit.p_value < 1e-6);
        assert!(lambda_grid().contains(&fit.lambda));
    }
}
