use faer::{Mat, MatRef};
use rand::prelude::*;
use rand_distr::StandardNormal;

use crate::error::{Result, ScError};

const STAGE: &str = "svd";

/// Extra sketch columns of the randomised SVD
const OVERSAMPLING: usize = 10;

/// Power iterations of the randomised SVD
const POWER_ITERATIONS: usize = 2;

////////////////
// Structures //
////////////////

/// Structure for (thin) SVD results
///
/// ### Fields
///
/// * `u` - Left singular vectors (nrow x rank)
/// * `v` - Right singular vectors (ncol x rank)
/// * `s` - Singular values in decreasing order
#[derive(Clone, Debug)]
pub struct SvdResults {
    pub u: Mat<f64>,
    pub v: Mat<f64>,
    pub s: Vec<f64>,
}

impl SvdResults {
    /// Keep only the leading `rank` triplets
    fn truncate(self, rank: usize) -> Self {
        let rank = rank.min(self.s.len());
        Self {
            u: Mat::from_fn(self.u.nrows(), rank, |i, j| self.u[(i, j)]),
            v: Mat::from_fn(self.v.nrows(), rank, |i, j| self.v[(i, j)]),
            s: self.s[..rank].to_vec(),
        }
    }

    /// Fix the sign of every singular vector pair
    ///
    /// The largest absolute entry of each right singular vector is made
    /// positive (the earliest one on ties).
    pub fn fix_signs(mut self) -> Self {
        for j in 0..self.v.ncols() {
            let mut best = 0;
            for i in 1..self.v.nrows() {
                if self.v[(i, j)].abs() > self.v[(best, j)].abs() {
                    best = i;
                }
            }
            if self.v.nrows() > 0 && self.v[(best, j)] < 0.0 {
                for i in 0..self.v.nrows() {
                    self.v[(i, j)] = -self.v[(i, j)];
                }
                for i in 0..self.u.nrows() {
                    self.u[(i, j)] = -self.u[(i, j)];
                }
            }
        }
        self
    }
}

///////////////
// Functions //
///////////////

/// Exact thin SVD, truncated to the leading `rank` components
///
/// ### Params
///
/// * `x` - The matrix to decompose.
/// * `rank` - Number of singular triplets to keep.
///
/// ### Returns
///
/// The `SvdResults`
pub fn exact_svd(x: MatRef<f64>, rank: usize) -> Result<SvdResults> {
    let svd = x
        .thin_svd()
        .map_err(|e| ScError::input(STAGE, format!("SVD did not converge: {:?}", e)))?;

    let res = SvdResults {
        u: svd.U().cloned(),
        v: svd.V().cloned(),
        s: svd.S().column_vector().iter().copied().collect(),
    };

    Ok(res.truncate(rank))
}

/// Range finder of the randomised SVD
///
/// Orthonormal basis for the column space of `x`, sketched with a seeded
/// Gaussian test matrix and sharpened by `POWER_ITERATIONS` rounds of
/// re-orthonormalised power iteration.
fn range_basis(x: MatRef<f64>, width: usize, seed: u64) -> Mat<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let sketch = Mat::from_fn(x.ncols(), width, |_, _| rng.sample::<f64, _>(StandardNormal));

    let mut basis = (x * &sketch).qr().compute_thin_Q();
    for _ in 0..POWER_ITERATIONS {
        let projected = (x.transpose() * &basis).qr().compute_thin_Q();
        basis = (x * &projected).qr().compute_thin_Q();
    }
    basis
}

/// Randomised truncated SVD (Halko et al.)
///
/// ### Params
///
/// * `x` - The matrix to decompose.
/// * `rank` - Number of singular triplets to keep.
/// * `seed` - Seed of the Gaussian sketch.
///
/// ### Returns
///
/// The `SvdResults`. The sketch is `rank + OVERSAMPLING` wide (capped by the
/// matrix dimensions).
pub fn randomised_svd(x: MatRef<f64>, rank: usize, seed: u64) -> Result<SvdResults> {
    let width = (rank + OVERSAMPLING).min(x.nrows().min(x.ncols()));
    let basis = range_basis(x, width, seed);

    let small = basis.transpose() * x;
    let svd = small
        .thin_svd()
        .map_err(|e| ScError::input(STAGE, format!("SVD did not converge: {:?}", e)))?;

    let res = SvdResults {
        u: &basis * svd.U(),
        v: svd.V().cloned(),
        s: svd.S().column_vector().iter().copied().collect(),
    };

    Ok(res.truncate(rank))
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn low_rank_matrix() -> Mat<f64> {
        // rank 2: outer products of two fixed patterns
        Mat::from_fn(30, 8, |i, j| {
            let a = (i as f64 * 0.3).sin();
            let b = (i as f64 * 0.7).cos();
            a * (j as f64 + 1.0) + 0.5 * b * ((j % 3) as f64 - 1.0)
        })
    }

    #[test]
    fn test_exact_svd_reconstructs() {
        let x = low_rank_matrix();
        let res = exact_svd(x.as_ref(), 2).unwrap();
        assert_eq!(res.s.len(), 2);
        for i in 0..x.nrows() {
            for j in 0..x.ncols() {
                let approx: f64 = (0..2).map(|k| res.u[(i, k)] * res.s[k] * res.v[(j, k)]).sum();
                assert_relative_eq!(approx, x[(i, j)], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_randomised_matches_exact() {
        let x = low_rank_matrix();
        let exact = exact_svd(x.as_ref(), 2).unwrap();
        let random = randomised_svd(x.as_ref(), 2, 42).unwrap();
        for k in 0..2 {
            assert_relative_eq!(exact.s[k], random.s[k], max_relative = 1e-8);
        }
    }

    #[test]
    fn test_fix_signs() {
        let x = low_rank_matrix();
        let res = exact_svd(x.as_ref(), 2).unwrap().fix_signs();
        for j in 0..2 {
            let max_entry = (0..res.v.nrows())
                .map(|i| res.v[(i, j)])
                .fold(0.0_f64, |acc, v| if v.abs() > acc.abs() { v } else { acc });
            assert!(max_entry > 0.0);
        }
    }
}
