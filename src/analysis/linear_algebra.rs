//! Least-squares polynomial fitting and the 3×3 matrix operations used by
//! tumble calibration.
//!
//! Fits are solved through an SVD of the Vandermonde matrix rather than the
//! normal equations, which keeps cubic fits over temperatures in the ±60 °C
//! range well conditioned.

use crate::error::{CalError, CalResult};
use nalgebra::{DMatrix, DVector, Matrix3};

/// Determinant magnitude below which a 3×3 matrix is treated as singular.
pub const SINGULAR_DET_THRESHOLD: f64 = 1e-9;

/// Result of [`solve_least_squares`].
#[derive(Debug, Clone, PartialEq)]
pub struct LeastSquaresFit {
    /// Polynomial coefficients, lowest order first (`c0 + c1·x + c2·x² …`).
    pub coefficients: Vec<f64>,
    /// Residual standard error, `sqrt(SSR / (n - order - 1))`; zero when the
    /// fit has no degrees of freedom left.
    pub sigma: f64,
    /// Coefficient of determination.
    pub r_squared: f64,
}

impl LeastSquaresFit {
    /// Constant term `c₀`.
    pub fn intercept(&self) -> f64 {
        self.coefficients.first().copied().unwrap_or(0.0)
    }

    /// First-order term `c₁`.
    pub fn slope(&self) -> f64 {
        self.coefficients.get(1).copied().unwrap_or(0.0)
    }

    /// Fitted value at `x`.
    pub fn evaluate(&self, x: f64) -> f64 {
        evaluate(x, &self.coefficients)
    }
}

/// Fits `y = Σ cᵢ·xⁱ` for `i` in `0..=order`.
///
/// # Errors
/// - `InsufficientData` when the slices differ in length, when there are fewer
///   than `order + 1` points, or when `x` holds fewer than `order + 1` distinct
///   values (at least two for any fit).
/// - `SingularMatrix` if the design matrix is rank deficient anyway.
pub fn solve_least_squares(x: &[f64], y: &[f64], order: usize) -> CalResult<LeastSquaresFit> {
    if x.len() != y.len() {
        return Err(CalError::InsufficientData(format!(
            "{} inputs but {} outputs",
            x.len(),
            y.len()
        )));
    }
    let terms = order + 1;
    if x.len() < terms {
        return Err(CalError::InsufficientData(format!(
            "order {} fit needs {} points, got {}",
            order,
            terms,
            x.len()
        )));
    }
    let distinct = distinct_count(x);
    if distinct < terms.max(2) {
        return Err(CalError::InsufficientData(format!(
            "order {} fit needs {} distinct inputs, got {}",
            order,
            terms.max(2),
            distinct
        )));
    }

    let design = DMatrix::from_fn(x.len(), terms, |row, col| x[row].powi(col as i32));
    let observed = DVector::from_column_slice(y);
    let svd = design.svd(true, true);
    if svd.rank(1e-12) < terms {
        return Err(CalError::SingularMatrix { det: 0.0 });
    }
    let solution = svd
        .solve(&observed, 1e-12)
        .map_err(|msg| CalError::InsufficientData(msg.to_string()))?;
    let coefficients: Vec<f64> = solution.iter().copied().collect();

    let fitted = polynomial(x, &coefficients);
    let ssr: f64 = fitted.iter().zip(y).map(|(f, a)| (a - f).powi(2)).sum();
    let mean_y = y.iter().sum::<f64>() / y.len() as f64;
    let sst: f64 = y.iter().map(|a| (a - mean_y).powi(2)).sum();

    let dof = x.len() - terms;
    let sigma = if dof > 0 {
        (ssr / dof as f64).sqrt()
    } else {
        0.0
    };
    let r_squared = if sst > 0.0 {
        1.0 - ssr / sst
    } else {
        1.0
    };

    Ok(LeastSquaresFit {
        coefficients,
        sigma,
        r_squared,
    })
}

/// Evaluates `Σ cᵢ·xⁱ` at every `x`.
pub fn polynomial(x: &[f64], coefficients: &[f64]) -> Vec<f64> {
    x.iter().map(|&xi| evaluate(xi, coefficients)).collect()
}

fn evaluate(x: f64, coefficients: &[f64]) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

fn distinct_count(values: &[f64]) -> usize {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(f64::total_cmp);
    sorted.dedup();
    sorted.len()
}

// ============================================================================
// 3×3 matrix operations
// ============================================================================

/// Element-wise `a + b`.
pub fn add(a: &Matrix3<f64>, b: &Matrix3<f64>) -> Matrix3<f64> {
    a + b
}

/// Element-wise `a - b`.
pub fn subtract(a: &Matrix3<f64>, b: &Matrix3<f64>) -> Matrix3<f64> {
    a - b
}

/// Every element of `a` times `factor`.
pub fn scale(a: &Matrix3<f64>, factor: f64) -> Matrix3<f64> {
    a * factor
}

/// Inverts `a`, failing when `|det(a)| < 1e-9`.
pub fn invert(a: &Matrix3<f64>) -> CalResult<Matrix3<f64>> {
    let det = a.determinant();
    if det.abs() < SINGULAR_DET_THRESHOLD {
        return Err(CalError::SingularMatrix { det });
    }
    a.try_inverse().ok_or(CalError::SingularMatrix { det })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-12;

    #[test]
    fn test_linear_fit_is_exact() {
        let fit = solve_least_squares(&[0.0, 1.0, 2.0, 3.0], &[0.0, 2.0, 4.0, 6.0], 1).unwrap();
        assert_eq!(fit.coefficients.len(), 2);
        assert!(fit.coefficients[0].abs() < TOL);
        assert!((fit.coefficients[1] - 2.0).abs() < TOL);
        assert!((fit.r_squared - 1.0).abs() < TOL);
        assert!(fit.sigma.abs() < TOL);
    }

    #[test]
    fn test_cubic_fit_recovers_coefficients() {
        let coeffs = [1.5, -0.25, 0.01, 0.002];
        let x: Vec<f64> = (-4..=4).map(|t| t as f64 * 10.0).collect();
        let y = polynomial(&x, &coeffs);
        let fit = solve_least_squares(&x, &y, 3).unwrap();
        for (got, want) in fit.coefficients.iter().zip(coeffs) {
            assert!((got - want).abs() < 1e-9, "{got} vs {want}");
        }
    }

    #[test]
    fn test_residuals_reported() {
        let fit = solve_least_squares(&[0.0, 1.0, 2.0], &[0.0, 1.0, 0.0], 1).unwrap();
        assert!(fit.sigma > 0.0);
        assert!(fit.r_squared < 1.0);
    }

    #[test]
    fn test_insufficient_points() {
        let err = solve_least_squares(&[1.0], &[2.0], 1).unwrap_err();
        assert!(matches!(err, CalError::InsufficientData(_)));
    }

    #[test]
    fn test_single_distinct_input_rejected() {
        let err = solve_least_squares(&[1.0, 1.0, 1.0], &[2.0, 3.0, 4.0], 1).unwrap_err();
        assert!(matches!(err, CalError::InsufficientData(_)));
    }

    #[test]
    fn test_polynomial_evaluation() {
        assert_eq!(polynomial(&[2.0], &[1.0, 2.0, 3.0]), vec![17.0]);
    }

    #[test]
    fn test_invert_roundtrip() {
        let a = Matrix3::new(2.0, 0.1, 0.0, 0.0, 1.0, 0.2, 0.3, 0.0, 4.0);
        let inv = invert(&a).unwrap();
        let identity = a * inv;
        assert!((identity - Matrix3::identity()).abs().max() < TOL);
    }

    #[test]
    fn test_invert_singular() {
        let a = Matrix3::new(1.0, 2.0, 3.0, 2.0, 4.0, 6.0, 0.0, 1.0, 1.0);
        assert!(matches!(invert(&a), Err(CalError::SingularMatrix { .. })));
    }

    #[test]
    fn test_elementwise_ops() {
        let a = Matrix3::identity();
        let b = scale(&a, 2.0);
        assert_eq!(add(&a, &b), scale(&a, 3.0));
        assert_eq!(subtract(&b, &a), a);
    }
}
