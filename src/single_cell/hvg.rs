use rayon::prelude::*;
use std::time::Instant;

use crate::config::PipelineConfig;
use crate::core::base::loess::LoessRegression;
use crate::core::base::sparse_math::mean_var_sparse;
use crate::core::data::count_matrix::*;
use crate::error::{Result, ScError};

const STAGE: &str = "hvg";

////////////
// Params //
////////////

/// Parameters of the highly variable gene selection
///
/// ### Fields
///
/// * `n_features` - Number of genes to select.
/// * `loess_span` - Span of the LOESS fit of the mean-variance trend.
/// * `clip_max` - Upper clip of the standardised values. `None` uses
///   `sqrt(n_obs)`.
#[derive(Clone, Debug, PartialEq)]
pub struct HvgParams {
    pub n_features: usize,
    pub loess_span: f64,
    pub clip_max: Option<f64>,
}

impl Default for HvgParams {
    fn default() -> Self {
        (&PipelineConfig::default()).into()
    }
}

impl From<&PipelineConfig> for HvgParams {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            n_features: config.n_variable_features,
            loess_span: config.loess_span,
            clip_max: None,
        }
    }
}

/////////////
// Results //
/////////////

/// Per gene statistics of the variance stabilising transformation
///
/// ### Fields
///
/// * `gene_ids` - The gene identifiers.
/// * `mean` - The average expression of the gene.
/// * `var` - The variance of the gene.
/// * `var_exp` - The expected variance of the gene from the trend.
/// * `var_std` - The standardised variance of the gene.
/// * `rank` - 1-based rank by standardised variance (ties by gene id).
/// * `selected` - Is the gene among the highly variable genes.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureStatistics {
    pub gene_ids: Vec<String>,
    pub mean: Vec<f64>,
    pub var: Vec<f64>,
    pub var_exp: Vec<f64>,
    pub var_std: Vec<f64>,
    pub rank: Vec<usize>,
    pub selected: Vec<bool>,
}

impl FeatureStatistics {
    /// Indices of the selected genes in rank order
    pub fn selected_indices(&self) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..self.gene_ids.len()).filter(|&i| self.selected[i]).collect();
        idx.sort_unstable_by_key(|&i| self.rank[i]);
        idx
    }

    /// Number of selected genes
    pub fn n_selected(&self) -> usize {
        self.selected.iter().filter(|&&s| s).count()
    }
}

///////////////
// Functions //
///////////////

/// Standardised variance of one sparse gene vector
///
/// Values are standardised with the gene mean and the expected standard
/// deviation, clipped from above and the sum of squares is divided by
/// `n - 1`.
fn standardised_variance(vals: &[f64], n: usize, mean: f64, sd: f64, clip_max: f64) -> f64 {
    if n < 2 || sd <= 0.0 || !sd.is_finite() {
        return 0.0;
    }
    let zero_val = ((0.0 - mean) / sd).min(clip_max);
    let ss_nz: f64 = vals
        .iter()
        .map(|&v| {
            let z = ((v - mean) / sd).min(clip_max);
            z * z
        })
        .sum();
    let ss_zero = (n - vals.len()) as f64 * zero_val * zero_val;
    (ss_nz + ss_zero) / (n as f64 - 1.0)
}

/// Highly variable genes via the variance stabilising transformation
///
/// A quadratic LOESS is fitted to `log10(var) ~ log10(mean)` over the genes
/// with positive variance. The expected variance is `10^fit` and the
/// standardised variance is computed from the clipped standardised values.
/// Genes are ranked by standardised variance (descending, ties by gene id)
/// and the top `n_features` genes with positive variance are selected.
///
/// ### Params
///
/// * `mat` - The gene x observation matrix.
/// * `params` - The `HvgParams`.
///
/// ### Returns
///
/// The `FeatureStatistics`
pub fn get_hvg_vst<T: SparseValue>(mat: &FeatureMatrix<T>, params: &HvgParams) -> Result<FeatureStatistics> {
    if params.n_features == 0 {
        return Err(ScError::config("n_variable_features", "must be > 0"));
    }
    let n = mat.n_obs();
    if n < 2 {
        return Err(ScError::input(
            STAGE,
            format!("need at least 2 observations, got {}", n),
        ));
    }
    let loess = LoessRegression::new(params.loess_span, 2)?;
    let clip_max = params.clip_max.unwrap_or((n as f64).sqrt());

    let start = Instant::now();

    let csr = mat.to_csr();
    let rows: Vec<Vec<f64>> = (0..mat.n_genes())
        .into_par_iter()
        .map(|i| csr.outer(i).1.iter().map(|v| v.to_f64()).collect())
        .collect();

    let (mean, var): (Vec<f64>, Vec<f64>) = rows
        .par_iter()
        .map(|vals| mean_var_sparse(vals.iter().copied(), vals.len(), n))
        .unzip();

    // trend over the genes with positive variance only
    let x: Vec<f64> = mean
        .iter()
        .zip(&var)
        .map(|(&m, &v)| if v > 0.0 && m > 0.0 { m.log10() } else { f64::NAN })
        .collect();
    let y: Vec<f64> = var
        .iter()
        .map(|&v| if v > 0.0 { v.log10() } else { f64::NAN })
        .collect();
    let fit = loess.fit(&x, &y)?;

    let var_exp: Vec<f64> = fit
        .fitted_vals
        .iter()
        .map(|&f| if f.is_finite() { 10_f64.powf(f) } else { 0.0 })
        .collect();

    let var_std: Vec<f64> = rows
        .par_iter()
        .enumerate()
        .map(|(i, vals)| {
            if var[i] <= 0.0 || var_exp[i] <= 0.0 {
                return 0.0;
            }
            standardised_variance(vals, n, mean[i], var_exp[i].sqrt(), clip_max)
        })
        .collect();

    let gene_ids = mat.gene_ids();
    let mut order: Vec<usize> = (0..mat.n_genes()).collect();
    order.sort_by(|&a, &b| {
        var_std[b]
            .total_cmp(&var_std[a])
            .then_with(|| gene_ids[a].cmp(&gene_ids[b]))
    });

    let mut rank = vec![0; mat.n_genes()];
    let mut selected = vec![false; mat.n_genes()];
    let mut n_selected = 0;
    for (pos, &gene) in order.iter().enumerate() {
        rank[gene] = pos + 1;
        if n_selected < params.n_features && var[gene] > 0.0 {
            selected[gene] = true;
            n_selected += 1;
        }
    }

    if n_selected < params.n_features {
        log::info!(
            "Only {} genes with positive variance, requested {}",
            n_selected,
            params.n_features
        );
    }
    log::info!(
        "Selected {} highly variable genes out of {} in {:.2?}",
        n_selected,
        mat.n_genes(),
        start.elapsed()
    );

    Ok(FeatureStatistics {
        gene_ids: gene_ids.to_vec(),
        mean,
        var,
        var_exp,
        var_std,
        rank,
        selected,
    })
}

///////////
// Tests //
///////////
