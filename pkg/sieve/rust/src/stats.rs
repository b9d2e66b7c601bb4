// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Numeric building blocks shared by the classifier, the clusterer and the
//! causality tests: moments, z-scores, ordinary least squares and the
//! distribution tails needed for F and t tests.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a numeric routine on degenerate input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NumericError {
    #[error("need at least {needed} observations, got {got}")]
    InsufficientObservations { needed: usize, got: usize },

    #[error("design matrix is singular")]
    Singular,
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Variance with `ddof` delta degrees of freedom (0 = population, 1 = sample).
pub fn variance(values: &[f64], ddof: usize) -> f64 {
    if values.len() <= ddof {
        return f64::NAN;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - ddof) as f64
}

/// Standardize to zero mean and unit standard deviation.
///
/// A series without spread maps to all zeros instead of NaN so that
/// downstream distance computations stay finite.
pub fn zscore(values: &[f64], ddof: usize) -> Vec<f64> {
    let std = variance(values, ddof).sqrt();
    if !std.is_finite() || std == 0.0 {
        return vec![0.0; values.len()];
    }
    let m = mean(values);
    values.iter().map(|v| (v - m) / std).collect()
}

/// True when the sequence never decreases or never increases.
pub fn is_monotonic(values: &[f64]) -> bool {
    let increasing = values.windows(2).all(|w| w[0] <= w[1]);
    increasing || values.windows(2).all(|w| w[0] >= w[1])
}

/// Result of a simple linear regression `y = slope * x + intercept`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_value: f64,
    /// Two-sided p-value of the null hypothesis `slope == 0`.
    pub p_value: f64,
    pub std_err: f64,
}

impl LinearFit {
    pub const UNDEFINED: LinearFit = LinearFit {
        slope: f64::NAN,
        intercept: f64::NAN,
        r_value: f64::NAN,
        p_value: f64::NAN,
        std_err: f64::NAN,
    };
}

/// Least-squares line through `(x, y)` with a t-test on the slope.
///
/// Returns `None` with fewer than three points or when `x` has no spread.
pub fn linregress(x: &[f64], y: &[f64]) -> Option<LinearFit> {
    let n = x.len();
    if n < 3 || n != y.len() {
        return None;
    }
    let xm = mean(x);
    let ym = mean(y);
    let (mut ssxm, mut ssym, mut ssxym) = (0.0, 0.0, 0.0);
    for (xi, yi) in x.iter().zip(y) {
        let dx = xi - xm;
        let dy = yi - ym;
        ssxm += dx * dx;
        ssym += dy * dy;
        ssxym += dx * dy;
    }
    if ssxm == 0.0 {
        return None;
    }

    let r_den = (ssxm * ssym).sqrt();
    let r = if r_den == 0.0 {
        0.0
    } else {
        (ssxym / r_den).clamp(-1.0, 1.0)
    };
    let slope = ssxym / ssxm;
    let intercept = ym - slope * xm;
    let df = (n - 2) as f64;

    const TINY: f64 = 1.0e-20;
    let t = r * (df / ((1.0 - r + TINY) * (1.0 + r + TINY))).sqrt();
    let p_value = student_t_two_sided(t, df);
    let std_err = ((1.0 - r * r) * ssym / ssxm / df).max(0.0).sqrt();

    Some(LinearFit {
        slope,
        intercept,
        r_value: r,
        p_value,
        std_err,
    })
}

/// Solve the ordinary least squares problem for the given design rows and
/// return `(coefficients, sum of squared residuals)`.
pub fn least_squares(rows: &[Vec<f64>], y: &[f64]) -> Result<(Vec<f64>, f64), NumericError> {
    let p = rows.first().map(Vec::len).unwrap_or(0);
    if rows.len() <= p || rows.len() != y.len() {
        return Err(NumericError::InsufficientObservations {
            needed: p + 1,
            got: rows.len().min(y.len()),
        });
    }

    // Normal equations, augmented with X'y as the last column.
    let mut a = vec![vec![0.0; p + 1]; p];
    for (row, &target) in rows.iter().zip(y) {
        for i in 0..p {
            for j in i..p {
                a[i][j] += row[i] * row[j];
            }
            a[i][p] += row[i] * target;
        }
    }
    for i in 0..p {
        for j in 0..i {
            a[i][j] = a[j][i];
        }
    }

    let coefficients = solve_augmented(a)?;
    let ssr = rows
        .iter()
        .zip(y)
        .map(|(row, &target)| {
            let fitted: f64 = row.iter().zip(&coefficients).map(|(x, b)| x * b).sum();
            (target - fitted).powi(2)
        })
        .sum();
    Ok((coefficients, ssr))
}

/// Gaussian elimination with partial pivoting on an `n x (n + 1)` system.
fn solve_augmented(mut a: Vec<Vec<f64>>) -> Result<Vec<f64>, NumericError> {
    let n = a.len();
    let scale = (0..n).map(|i| a[i][i].abs()).fold(0.0, f64::max);
    if scale == 0.0 || !scale.is_finite() {
        return Err(NumericError::Singular);
    }
    let tolerance = scale * 1e-12;

    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&l, &r| a[l][col].abs().total_cmp(&a[r][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() <= tolerance {
            return Err(NumericError::Singular);
        }
        a.swap(col, pivot);
        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..=n {
                a[row][k] -= factor * a[col][k];
            }
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = ((row + 1)..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (a[row][n] - tail) / a[row][row];
    }
    Ok(x)
}

/// Survival function of the F distribution with `(d1, d2)` degrees of freedom.
pub fn f_sf(f: f64, d1: f64, d2: f64) -> f64 {
    if f.is_nan() {
        return f64::NAN;
    }
    if f <= 0.0 {
        return 1.0;
    }
    regularized_incomplete_beta(d2 / (d2 + d1 * f), d2 / 2.0, d1 / 2.0)
}

/// Two-sided tail probability of Student's t distribution.
pub fn student_t_two_sided(t: f64, df: f64) -> f64 {
    if t.is_nan() {
        return f64::NAN;
    }
    regularized_incomplete_beta(df / (df + t * t), df / 2.0, 0.5)
}

const LANCZOS: [f64; 9] = [
    0.999_999_999_999_809_9,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_1,
    -176.615_029_162_140_6,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_572e-6,
    1.505_632_735_149_311_6e-7,
];

/// Natural log of the gamma function (Lanczos approximation, g = 7).
pub fn ln_gamma(x: f64) -> f64 {
    if x < 0.5 {
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin().abs()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let t = x + 7.5;
    let series = LANCZOS[1..]
        .iter()
        .enumerate()
        .fold(LANCZOS[0], |acc, (i, c)| acc + c / (x + i as f64 + 1.0));
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + series.ln()
}

/// Regularized incomplete beta function `I_x(a, b)`.
pub fn regularized_incomplete_beta(x: f64, a: f64, b: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(x, a, b) / a
    } else {
        1.0 - front * beta_continued_fraction(1.0 - x, b, a) / b
    }
}

/// Lentz evaluation of the incomplete beta continued fraction.
fn beta_continued_fraction(x: f64, a: f64, b: f64) -> f64 {
    const MAX_ITERATIONS: usize = 300;
    const EPSILON: f64 = 3.0e-14;
    const FLOOR: f64 = 1.0e-300;

    let guard = |v: f64| if v.abs() < FLOOR { FLOOR } else { v };

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 / guard(1.0 - qab * x / qap);
    let mut h = d;

    for m in 1..=MAX_ITERATIONS {
        let m = m as f64;
        let m2 = 2.0 * m;

        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 / guard(1.0 + aa * d);
        c = guard(1.0 + aa / c);
        h *= d * c;

        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 / guard(1.0 + aa * d);
        c = guard(1.0 + aa / c);
        let delta = d * c;
        h *= delta;

        if (delta - 1.0).abs() < EPSILON {
            break;
        }
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn test_variance_ddof() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!(close(variance(&values, 0), 4.0, 1e-12));
        assert!(close(variance(&values, 1), 32.0 / 7.0, 1e-12));
        assert!(variance(&[1.0], 1).is_nan());
    }

    #[test]
    fn test_zscore_constant_is_zero() {
        assert_eq!(zscore(&[3.0, 3.0, 3.0], 0), vec![0.0, 0.0, 0.0]);
        let z = zscore(&[1.0, 2.0, 3.0], 0);
        assert!(close(mean(&z), 0.0, 1e-12));
        assert!(close(variance(&z, 0), 1.0, 1e-12));
    }

    #[test]
    fn test_is_monotonic() {
        assert!(is_monotonic(&[1.0, 1.0, 2.0, 5.0]));
        assert!(is_monotonic(&[5.0, 4.0, 4.0]));
        assert!(!is_monotonic(&[1.0, 3.0, 2.0]));
        assert!(is_monotonic(&[]));
    }

    #[test]
    fn test_ln_gamma_matches_factorials() {
        // Gamma(n) = (n - 1)!
        assert!(close(ln_gamma(1.0), 0.0, 1e-10));
        assert!(close(ln_gamma(5.0), 24f64.ln(), 1e-10));
        assert!(close(ln_gamma(0.5), std::f64::consts::PI.sqrt().ln(), 1e-10));
    }

    #[test]
    fn test_incomplete_beta_symmetry() {
        // I_x(a, a) at x = 0.5 is exactly one half.
        assert!(close(regularized_incomplete_beta(0.5, 3.0, 3.0), 0.5, 1e-10));
        // I_x(1, 1) is the identity.
        assert!(close(regularized_incomplete_beta(0.3, 1.0, 1.0), 0.3, 1e-10));
    }

    #[test]
    fn test_f_sf_reference_values() {
        // With d1 = 2 the tail has the closed form (1 + d1 * f / d2)^(-d2 / 2).
        assert!(close(f_sf(3.0, 2.0, 10.0), 1.6f64.powf(-5.0), 1e-9));
        assert_eq!(f_sf(0.0, 2.0, 10.0), 1.0);
    }

    #[test]
    fn test_student_t_reference_values() {
        // scipy.stats.t.sf(2.0, 10) * 2 = 0.07339...
        assert!(close(student_t_two_sided(2.0, 10.0), 0.073_388, 1e-4));
        assert!(close(student_t_two_sided(0.0, 5.0), 1.0, 1e-12));
    }

    #[test]
    fn test_linregress_perfect_line() {
        let x: Vec<f64> = (0..20).map(f64::from).collect();
        let y: Vec<f64> = x.iter().map(|v| 3.0 * v - 2.0).collect();
        let fit = linregress(&x, &y).unwrap();
        assert!(close(fit.slope, 3.0, 1e-10));
        assert!(close(fit.intercept, -2.0, 1e-10));
        assert!(close(fit.r_value, 1.0, 1e-10));
        assert!(fit.p_value < 1e-10);
        assert!(close(fit.std_err, 0.0, 1e-6));
    }

    #[test]
    fn test_linregress_degenerate_x() {
        assert!(linregress(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]).is_none());
        assert!(linregress(&[1.0, 2.0], &[1.0, 2.0]).is_none());
    }

    #[test]
    fn test_least_squares_recovers_coefficients() {
        let rows: Vec<Vec<f64>> = (0..30)
            .map(|i| {
                let x = i as f64;
                vec![1.0, x, (x * 0.7).sin()]
            })
            .collect();
        let y: Vec<f64> = rows.iter().map(|r| 1.5 + 0.5 * r[1] - 2.0 * r[2]).collect();
        let (coef, ssr) = least_squares(&rows, &y).unwrap();
        assert!(close(coef[0], 1.5, 1e-8));
        assert!(close(coef[1], 0.5, 1e-8));
        assert!(close(coef[2], -2.0, 1e-8));
        assert!(ssr < 1e-12);
    }

    #[test]
    fn test_least_squares_singular() {
        let rows: Vec<Vec<f64>> = (0..10).map(|i| vec![i as f64, 2.0 * i as f64]).collect();
        let y: Vec<f64> = (0..10).map(f64::from).collect();
        assert_eq!(least_squares(&rows, &y), Err(NumericError::Singular));
    }
}
