use crate::error::{FitError, FitResult};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

/// Pivots below this share of the largest diagonal entry count as singular.
const PIVOT_TOLERANCE: f64 = 1e-12;

/// Factor a symmetric positive-definite system. nalgebra only rejects
/// non-positive pivots, so near-aliased columns are caught here as well.
pub fn cholesky(a: &DMatrix<f64>, context: &str) -> FitResult<Cholesky<f64, Dyn>> {
    let singular = || FitError::Singular {
        context: format!("{context} ({0}x{0})", a.nrows()),
    };
    if !a.is_square() || a.iter().any(|v| !v.is_finite()) {
        return Err(singular());
    }
    let scale = a.diagonal().amax().max(1.0);
    let chol = a.clone().cholesky().ok_or_else(singular)?;
    if chol.l_dirty().diagonal().iter().any(|d| d * d <= PIVOT_TOLERANCE * scale) {
        return Err(singular());
    }
    Ok(chol)
}

/// X' diag(w) X.
pub fn weighted_gram(x: &DMatrix<f64>, w: &DVector<f64>) -> DMatrix<f64> {
    let mut scaled = x.clone();
    for (mut row, wi) in scaled.row_iter_mut().zip(w.iter()) {
        row *= *wi;
    }
    x.tr_mul(&scaled)
}

/// Square sub-block over the given indices.
pub fn submatrix(a: &DMatrix<f64>, indices: &[usize]) -> DMatrix<f64> {
    a.select_rows(indices.iter()).select_columns(indices.iter())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliased_system_is_singular() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        assert!(matches!(cholesky(&a, "test"), Err(FitError::Singular { .. })));
        let spd = DMatrix::from_row_slice(2, 2, &[4.0, 2.0, 2.0, 3.0]);
        let x = cholesky(&spd, "test").unwrap().solve(&DVector::from_vec(vec![2.0, 1.0]));
        assert!((&spd * x - DVector::from_vec(vec![2.0, 1.0])).norm() < 1e-12);
    }

    #[test]
    fn weighted_gram_matches_definition() {
        let x = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 1.0, -1.0, 1.0, 0.5]);
        let g = weighted_gram(&x, &DVector::from_vec(vec![1.0, 2.0, 4.0]));
        assert_eq!(g[(0, 0)], 7.0);
        assert_eq!(g[(0, 1)], 2.0);
        assert_eq!(g[(1, 0)], g[(0, 1)]);
        assert_eq!(g[(1, 1)], 7.0);
        assert_eq!(submatrix(&g, &[1]), DMatrix::from_element(1, 1, 7.0));
    }
}
