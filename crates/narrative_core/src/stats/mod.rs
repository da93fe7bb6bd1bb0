//! Regression Cascade and Robustness Suite.

pub mod cascade;
pub mod design;
pub mod glm;
pub mod linalg;
pub mod marginal;
pub mod mixed;
pub mod robust;
pub mod spline;

pub use cascade::{
    fit_model, run_cascade, CascadeReport, CoefficientRow, Estimate, Family, FitFailure, FittedModel, ModelFit,
    ModelOutcome, RandomInterceptSummary, SmoothSummary,
};
pub use design::{DesignLayout, Factor, ModelSpec, Term};
pub use marginal::MarginalRow;
pub use robust::{
    bootstrap, dispersion, likelihood_ratio, run_robustness, BootstrapCoefficient, BootstrapOptions,
    BootstrapReport, DispersionCheck, LikelihoodRatio, RobustnessReport,
};

use statrs::function::erf::erfc;
use statrs::function::gamma::gamma_ur;

/// Two-sided p-value of a standard normal statistic.
pub fn normal_two_sided_p(z: f64) -> f64 {
    if z.is_nan() {
        return f64::NAN;
    }
    erfc(z.abs() / std::f64::consts::SQRT_2)
}

/// Upper tail of the χ² distribution with `df` degrees of freedom.
pub fn chi_squared_sf(x: f64, df: f64) -> f64 {
    if x.is_nan() || !(df > 0.0) {
        return f64::NAN;
    }
    if x <= 0.0 {
        return 1.0;
    }
    if x.is_infinite() {
        return 0.0;
    }
    gamma_ur(df / 2.0, x / 2.0)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_p_values() {
        assert!((normal_two_sided_p(1.959_963_984_540_054) - 0.05).abs() < 1e-9);
        assert!((normal_two_sided_p(0.0) - 1.0).abs() < 1e-12);
        assert_eq!(normal_two_sided_p(-2.0), normal_two_sided_p(2.0));
    }

    #[test]
    fn chi_squared_tail() {
        assert!((chi_squared_sf(3.841_458_820_694_124, 1.0) - 0.05).abs() < 1e-9);
        assert!((chi_squared_sf(2.0, 2.0) - (-1.0f64).exp()).abs() < 1e-12);
        assert_eq!(chi_squared_sf(0.0, 1.0), 1.0);
        assert_eq!(chi_squared_sf(-1.0, 1.0), 1.0);
    }
}
