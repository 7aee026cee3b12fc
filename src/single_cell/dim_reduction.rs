use faer::{Mat, MatRef};
use std::time::Instant;

use crate::config::{PcaSolver, PipelineConfig};
use crate::core::base::pca_svd::{exact_svd, randomised_svd, SvdResults};
use crate::error::{Result, ScError};

const STAGE: &str = "pca";

////////////
// Params //
////////////

/// Parameters of the PCA
///
/// ### Fields
///
/// * `n_components` - Number of principal components.
/// * `solver` - Which SVD solver to use.
/// * `seed` - Seed for the randomised solver.
#[derive(Clone, Debug, PartialEq)]
pub struct PcaParams {
    pub n_components: usize,
    pub solver: PcaSolver,
    pub seed: u64,
}

impl Default for PcaParams {
    fn default() -> Self {
        (&PipelineConfig::default()).into()
    }
}

impl From<&PipelineConfig> for PcaParams {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            n_components: config.n_pca_components,
            solver: config.pca_solver,
            seed: config.random_seed,
        }
    }
}

/////////////
// Results //
/////////////

/// Low dimensional representation of the observations
///
/// ### Fields
///
/// * `obs_ids` - The observation identifiers (rows of `scores`).
/// * `gene_ids` - The genes the PCA was run on (rows of `loadings`).
/// * `scores` - Observations x components.
/// * `loadings` - Genes x components.
/// * `singular_values` - Singular values of the centred matrix.
/// * `explained_variance` - Fraction of the total variance per component.
#[derive(Clone, Debug)]
pub struct ReducedEmbedding {
    pub obs_ids: Vec<String>,
    pub gene_ids: Vec<String>,
    pub scores: Mat<f64>,
    pub loadings: Mat<f64>,
    pub singular_values: Vec<f64>,
    pub explained_variance: Vec<f64>,
}

impl ReducedEmbedding {
    /// Number of observations
    pub fn n_obs(&self) -> usize {
        self.scores.nrows()
    }

    /// Number of components
    pub fn n_components(&self) -> usize {
        self.scores.ncols()
    }

    /// View on the leading `dims` components (all if `None` or too large)
    pub fn leading(&self, dims: Option<usize>) -> MatRef<'_, f64> {
        let d = dims.unwrap_or(self.n_components()).min(self.n_components());
        self.scores.as_ref().subcols(0, d)
    }
}

///////////////
// Functions //
///////////////

/// Largest rank a PCA can have on a matrix of this shape
pub fn feasible_rank(n_obs: usize, n_genes: usize) -> usize {
    n_obs.min(n_genes).saturating_sub(1)
}

/// Centre the columns of a matrix
fn centre_columns(x: MatRef<f64>) -> Mat<f64> {
    let n = x.nrows();
    let means: Vec<f64> = (0..x.ncols())
        .map(|j| (0..n).map(|i| x[(i, j)]).sum::<f64>() / n as f64)
        .collect();
    Mat::from_fn(n, x.ncols(), |i, j| x[(i, j)] - means[j])
}

/// Run the PCA on the scaled matrix
///
/// The matrix is centred column-wise before the decomposition (scaled data
/// is already centred up to clipping).
///
/// ### Params
///
/// * `scaled` - Observations x genes matrix, typically from `scale_genes`.
/// * `obs_ids` - Identifiers of the rows.
/// * `gene_ids` - Identifiers of the columns.
/// * `params` - The `PcaParams`.
///
/// ### Returns
///
/// The `ReducedEmbedding`. Requesting more components than
/// `min(n_obs, n_genes) - 1` is an `ScError::Input`.
pub fn run_pca(
    scaled: MatRef<f64>,
    obs_ids: &[String],
    gene_ids: &[String],
    params: &PcaParams,
) -> Result<ReducedEmbedding> {
    if scaled.nrows() != obs_ids.len() || scaled.ncols() != gene_ids.len() {
        return Err(ScError::input(
            STAGE,
            format!(
                "matrix is {} x {} but got {} observation and {} gene ids",
                scaled.nrows(),
                scaled.ncols(),
                obs_ids.len(),
                gene_ids.len()
            ),
        ));
    }
    if params.n_components == 0 {
        return Err(ScError::config("n_pca_components", "must be > 0"));
    }
    let max_rank = feasible_rank(scaled.nrows(), scaled.ncols());
    if params.n_components > max_rank {
        return Err(ScError::input(
            STAGE,
            format!(
                "rank {} exceeds feasible rank {} of a {} x {} matrix",
                params.n_components,
                max_rank,
                scaled.nrows(),
                scaled.ncols()
            ),
        ));
    }

    let start = Instant::now();

    let centred = centre_columns(scaled);
    let total_ss: f64 = (0..centred.ncols())
        .map(|j| (0..centred.nrows()).map(|i| centred[(i, j)].powi(2)).sum::<f64>())
        .sum();

    let svd: SvdResults = match params.solver {
        PcaSolver::Exact => exact_svd(centred.as_ref(), params.n_components)?,
        PcaSolver::Randomised => randomised_svd(centred.as_ref(), params.n_components, params.seed)?,
    }
    .fix_signs();

    let r = svd.s.len();
    let scores = Mat::from_fn(centred.nrows(), r, |i, j| svd.u[(i, j)] * svd.s[j]);
    let explained_variance: Vec<f64> = svd
        .s
        .iter()
        .map(|s| if total_ss > 0.0 { s * s / total_ss } else { 0.0 })
        .collect();

    log::info!(
        "PCA ({:?}) with {} components on {} x {} in {:.2?}; explained variance {:.3}",
        params.solver,
        r,
        centred.nrows(),
        centred.ncols(),
        start.elapsed(),
        explained_variance.iter().sum::<f64>()
    );

    Ok(ReducedEmbedding {
        obs_ids: obs_ids.to_vec(),
        gene_ids: gene_ids.to_vec(),
        scores,
        loadings: svd.v,
        singular_values: svd.s,
        explained_variance,
    })
}

///////////
// Tests //
///////////
