use rayon::prelude::*;

use crate::error::{Result, ScError};

const STAGE: &str = "loess";

/// Pivot magnitude below which the local system counts as singular
const SINGULAR_TOL: f64 = 1e-12;

/// Results of a LOESS fit
///
/// ### Fields
///
/// * `fitted_vals` - Fitted value per input point, `NaN` for skipped points.
/// * `residuals` - `y - fitted`, `NaN` for skipped points.
/// * `valid_indices` - Sorted indices of the points that entered the fit.
#[derive(Debug, Clone)]
pub struct LoessRes {
    pub fitted_vals: Vec<f64>,
    pub residuals: Vec<f64>,
    pub valid_indices: Vec<usize>,
}

/////////////
// Helpers //
/////////////

/// Tricube kernel
#[inline]
fn tricube(u: f64) -> f64 {
    if u >= 1.0 {
        0.0
    } else {
        (1.0 - u.powi(3)).powi(3)
    }
}

/// Solve a small dense system with partial pivoting
///
/// ### Params
///
/// * `a` - Row-major `p x p` matrix, overwritten.
/// * `b` - Right hand side, overwritten.
///
/// ### Returns
///
/// The solution or `None` if the system is (numerically) singular.
fn solve_small(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let p = b.len();
    for col in 0..p {
        let pivot = (col..p).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < SINGULAR_TOL {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in (col + 1)..p {
            let factor = a[row][col] / a[col][col];
            for k in col..p {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; p];
    for row in (0..p).rev() {
        let tail: f64 = ((row + 1)..p).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Some(x)
}

/// Weighted least squares polynomial evaluated at the centre
///
/// The polynomial is expressed in `x - centre`, so its value at the centre
/// is the intercept. Falls back to lower degrees if the normal equations are
/// singular and to the plain mean if all weights vanish.
fn local_polynomial(centre: f64, points: &[(f64, f64)], weights: &[f64], degree: usize) -> f64 {
    for d in (1..=degree).rev() {
        if points.len() <= d {
            continue;
        }
        let p = d + 1;
        let mut xtwx = vec![vec![0.0; p]; p];
        let mut xtwy = vec![0.0; p];
        for (&(x, y), &w) in points.iter().zip(weights) {
            if w == 0.0 {
                continue;
            }
            let dx = x - centre;
            let powers: Vec<f64> = (0..p).map(|e| dx.powi(e as i32)).collect();
            for r in 0..p {
                xtwy[r] += w * powers[r] * y;
                for c in 0..p {
                    xtwx[r][c] += w * powers[r] * powers[c];
                }
            }
        }
        if let Some(coef) = solve_small(xtwx, xtwy) {
            return coef[0];
        }
    }

    let w_sum: f64 = weights.iter().sum();
    if w_sum > 0.0 {
        points.iter().zip(weights).map(|(&(_, y), &w)| w * y).sum::<f64>() / w_sum
    } else {
        points.iter().map(|&(_, y)| y).sum::<f64>() / points.len() as f64
    }
}

/// Windows of the `k` nearest points along a sorted axis
///
/// For sorted `xs` the `k` nearest neighbours of every point form a
/// contiguous window; it only ever moves right, so one sweep finds all of
/// them. Ties prefer the left side.
///
/// ### Returns
///
/// Start index of the window for every point.
fn nearest_windows(xs: &[f64], k: usize) -> Vec<usize> {
    let n = xs.len();
    let mut start = 0;
    xs.iter()
        .map(|&x| {
            while start + k < n && (xs[start + k] - x).abs() < (x - xs[start]).abs() {
                start += 1;
            }
            start
        })
        .collect()
}

///////////
// Loess //
///////////

/// Local polynomial regression with tricube weights
#[derive(Debug, Clone)]
pub struct LoessRegression {
    span: f64,
    degree: usize,
}

impl LoessRegression {
    /// Generate a new instance of the LOESS regression
    ///
    /// ### Params
    ///
    /// * `span` - Fraction of the points used in every local fit. In `(0, 1]`.
    /// * `degree` - Degree of the local polynomial (1 or 2).
    pub fn new(span: f64, degree: usize) -> Result<Self> {
        if !(span > 0.0 && span <= 1.0) {
            return Err(ScError::config("loess_span", format!("must be in (0, 1], got {}", span)));
        }
        if !(1..=2).contains(&degree) {
            return Err(ScError::config("loess_degree", "only linear (1) and quadratic (2) supported"));
        }
        Ok(Self { span, degree })
    }

    /// Fit `y` on `x`
    ///
    /// Non-finite pairs are skipped and get a fitted value of `NaN`.
    ///
    /// ### Params
    ///
    /// * `x` - The predictor variable
    /// * `y` - The response variable
    ///
    /// ### Returns
    ///
    /// The fit results in form of a `LoessRes`
    pub fn fit(&self, x: &[f64], y: &[f64]) -> Result<LoessRes> {
        if x.len() != y.len() {
            return Err(ScError::input(
                STAGE,
                format!("x has length {}, y has length {}", x.len(), y.len()),
            ));
        }

        let n = x.len();
        let mut order: Vec<usize> = (0..n)
            .filter(|&i| x[i].is_finite() && y[i].is_finite())
            .collect();
        order.sort_by(|&a, &b| x[a].total_cmp(&x[b]).then(a.cmp(&b)));

        let mut fitted_vals = vec![f64::NAN; n];
        let mut residuals = vec![f64::NAN; n];

        if !order.is_empty() {
            let points: Vec<(f64, f64)> = order.iter().map(|&i| (x[i], y[i])).collect();
            let xs: Vec<f64> = points.iter().map(|p| p.0).collect();
            let k = ((points.len() as f64 * self.span).ceil() as usize).clamp(1, points.len());
            let windows = nearest_windows(&xs, k);

            let fits: Vec<f64> = windows
                .par_iter()
                .zip(xs.par_iter())
                .map(|(&start, &centre)| {
                    let local = &points[start..start + k];
                    let max_dist = local
                        .iter()
                        .map(|p| (p.0 - centre).abs())
                        .fold(0.0, f64::max);
                    if max_dist == 0.0 {
                        return local.iter().map(|p| p.1).sum::<f64>() / k as f64;
                    }
                    let weights: Vec<f64> = local
                        .iter()
                        .map(|p| tricube((p.0 - centre).abs() / max_dist))
                        .collect();
                    local_polynomial(centre, local, &weights, self.degree)
                })
                .collect();

            for ((&idx, fit), &(_, yi)) in order.iter().zip(fits).zip(&points) {
                fitted_vals[idx] = fit;
                residuals[idx] = yi - fit;
            }
        }

        order.sort_unstable();

        Ok(LoessRes {
            fitted_vals,
            residuals,
            valid_indices: order,
        })
    }
}

///////////
// Tests //
///////////
