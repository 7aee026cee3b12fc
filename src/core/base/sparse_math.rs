use faer::Mat;
use rayon::prelude::*;

use crate::core::data::count_matrix::*;
use crate::error::{Result, ScError};

const STAGE: &str = "matrix_ops";

//////////
// Sums //
//////////

/// Column sums (one per observation)
///
/// Accumulated in f64 regardless of the storage type.
///
/// ### Params
///
/// * `mat` - The gene x observation matrix.
///
/// ### Returns
///
/// Vector of length `n_obs`
pub fn col_sums<T: SparseValue>(mat: &FeatureMatrix<T>) -> Vec<f64> {
    (0..mat.n_obs())
        .into_par_iter()
        .map(|j| mat.column(j).1.iter().map(|v| v.to_f64()).sum::<f64>())
        .collect()
}

/// Row sums (one per gene)
///
/// ### Params
///
/// * `mat` - The gene x observation matrix.
///
/// ### Returns
///
/// Vector of length `n_genes`
pub fn row_sums<T: SparseValue>(mat: &FeatureMatrix<T>) -> Vec<f64> {
    let mut sums = vec![0.0; mat.n_genes()];
    for j in 0..mat.n_obs() {
        let (idx, vals) = mat.column(j);
        for (&i, v) in idx.iter().zip(vals) {
            sums[i] += v.to_f64();
        }
    }
    sums
}

/// Number of detected (non-zero) genes per observation
pub fn col_nnz<T: SparseValue>(mat: &FeatureMatrix<T>) -> Vec<usize> {
    (0..mat.n_obs()).map(|j| mat.column(j).0.len()).collect()
}

/// Number of observations in which each gene is detected
pub fn row_nnz<T: SparseValue>(mat: &FeatureMatrix<T>) -> Vec<usize> {
    let mut counts = vec![0usize; mat.n_genes()];
    for &i in &mat.csc().indices {
        counts[i] += 1;
    }
    counts
}

//////////////////////////
// Column-wise scalings //
//////////////////////////

/// Multiply every column by a factor
///
/// ### Params
///
/// * `mat` - The gene x observation matrix.
/// * `factors` - One factor per observation.
///
/// ### Returns
///
/// The scaled matrix. Columns multiplied by zero become empty.
pub fn scale_columns<T: SparseValue>(mat: &FeatureMatrix<T>, factors: &[f64]) -> Result<NormalisedMatrix> {
    if factors.len() != mat.n_obs() {
        return Err(ScError::input(
            STAGE,
            format!("{} factors for {} observations", factors.len(), mat.n_obs()),
        ));
    }
    if let Some(f) = factors.iter().find(|f| !f.is_finite() || **f < 0.0) {
        return Err(ScError::input(STAGE, format!("invalid column factor {}", f)));
    }
    mat.map_values(|_, j, v| v.to_f64() * factors[j])
}

/// Divide every column by a divisor
///
/// Zero divisors leave the (necessarily empty) column at zero.
///
/// ### Params
///
/// * `mat` - The gene x observation matrix.
/// * `divisors` - One divisor per observation.
pub fn divide_columns<T: SparseValue>(mat: &FeatureMatrix<T>, divisors: &[f64]) -> Result<NormalisedMatrix> {
    let factors: Vec<f64> = divisors
        .iter()
        .map(|&d| if d == 0.0 { 0.0 } else { 1.0 / d })
        .collect();
    scale_columns(mat, &factors)
}

////////////////
// Transforms //
////////////////

/// `ln(1 + x)` on every stored value
///
/// Zeros stay zeros, so the sparsity structure is preserved.
pub fn log1p(mat: &NormalisedMatrix) -> Result<NormalisedMatrix> {
    mat.map_values(|_, _, v| v.ln_1p())
}

/// `exp(x) - 1` on every stored value, the inverse of `log1p`
pub fn expm1(mat: &NormalisedMatrix) -> Result<NormalisedMatrix> {
    mat.map_values(|_, _, v| v.exp_m1())
}

/// Library size normalisation
///
/// Every observation is scaled to sum to `target_sum`. Observations without
/// any counts stay empty.
///
/// ### Params
///
/// * `counts` - The raw counts.
/// * `target_sum` - Target library size, e.g. `1e4`.
pub fn normalise_total<T: SparseValue>(counts: &FeatureMatrix<T>, target_sum: f64) -> Result<NormalisedMatrix> {
    if !(target_sum > 0.0 && target_sum.is_finite()) {
        return Err(ScError::config("target_sum", "must be a finite value > 0"));
    }
    let lib_size = col_sums(counts);
    let factors: Vec<f64> = lib_size
        .iter()
        .map(|&s| if s > 0.0 { target_sum / s } else { 0.0 })
        .collect();
    scale_columns(counts, &factors)
}

/// Library size normalisation followed by `log1p`
///
/// ### Params
///
/// * `counts` - The raw counts.
/// * `target_sum` - Target library size, e.g. `1e4`.
pub fn log_normalise<T: SparseValue>(counts: &FeatureMatrix<T>, target_sum: f64) -> Result<NormalisedMatrix> {
    let normalised = normalise_total(counts, target_sum)?;
    log1p(&normalised)
}

////////////////
// Statistics //
////////////////

/// Per gene mean and sample variance
///
/// Computed gene-wise from the CSR view, with implicit zeros accounted for.
///
/// ### Params
///
/// * `mat` - The gene x observation matrix.
///
/// ### Returns
///
/// Tuple of `(means, variances)`. The variance of a single observation is 0.
pub fn gene_mean_var<T: SparseValue>(mat: &FeatureMatrix<T>) -> (Vec<f64>, Vec<f64>) {
    let csr = mat.to_csr();
    let n = mat.n_obs();

    let res: Vec<(f64, f64)> = (0..mat.n_genes())
        .into_par_iter()
        .map(|i| {
            let (_, vals) = csr.outer(i);
            mean_var_sparse(vals.iter().map(|v| v.to_f64()), vals.len(), n)
        })
        .collect();

    res.into_iter().unzip()
}

/// Mean and sample variance of a sparse vector
///
/// ### Params
///
/// * `nz` - Iterator over the stored values.
/// * `nnz` - Number of stored values.
/// * `n` - Full length of the vector.
pub fn mean_var_sparse<I>(nz: I, nnz: usize, n: usize) -> (f64, f64)
where
    I: Iterator<Item = f64> + Clone,
{
    if n == 0 {
        return (0.0, 0.0);
    }
    let n_f64 = n as f64;
    let mean = nz.clone().sum::<f64>() / n_f64;
    if n < 2 {
        return (mean, 0.0);
    }
    let ss_nz: f64 = nz.map(|v| (v - mean) * (v - mean)).sum();
    let ss_zero = (n - nnz) as f64 * mean * mean;
    (mean, (ss_nz + ss_zero) / (n_f64 - 1.0))
}

/////////////
// Scaling //
/////////////

/// Centre and scale a subset of genes into a dense matrix
///
/// ### Params
///
/// * `mat` - The normalised gene x observation matrix.
/// * `gene_indices` - Which genes to keep (columns of the output, in order).
/// * `clip` - Scaled values are clipped to `[-clip, clip]`.
///
/// ### Returns
///
/// Dense observations x genes matrix with zero mean and unit (sample)
/// variance per column. Zero variance genes are all zero.
pub fn scale_genes<T: SparseValue>(mat: &FeatureMatrix<T>, gene_indices: &[usize], clip: f64) -> Result<Mat<f64>> {
    if let Some(&bad) = gene_indices.iter().find(|&&i| i >= mat.n_genes()) {
        return Err(ScError::input(
            STAGE,
            format!("gene index {} out of bounds ({})", bad, mat.n_genes()),
        ));
    }
    let csr = mat.to_csr();
    let n = mat.n_obs();

    let columns: Vec<Vec<f64>> = gene_indices
        .par_iter()
        .map(|&g| {
            let (idx, vals) = csr.outer(g);
            let (mean, var) = mean_var_sparse(vals.iter().map(|v| v.to_f64()), vals.len(), n);
            let mut col = vec![0.0; n];
            if var <= 0.0 {
                return col;
            }
            let sd = var.sqrt();
            let base = (-mean / sd).clamp(-clip, clip);
            col.iter_mut().for_each(|x| *x = base);
            for (&j, v) in idx.iter().zip(vals) {
                col[j] = ((v.to_f64() - mean) / sd).clamp(-clip, clip);
            }
            col
        })
        .collect();

    Ok(Mat::from_fn(n, gene_indices.len(), |i, j| columns[j][i]))
}

///////////
// Tests //
///////////
