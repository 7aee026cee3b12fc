use faer::{Mat, MatRef};
use rand::prelude::*;
use std::time::Instant;

use crate::config::PipelineConfig;
use crate::core::graph::knn::{exact_knn, KnnResult};
use crate::error::{Result, ScError};

const STAGE: &str = "umap";

/// Gradient clip of the SGD
const GRAD_CLIP: f64 = 4.0;
/// Iterations of the sigma bisection
const SIGMA_ITER: usize = 64;
/// Tolerance of the sigma bisection
const SIGMA_TOL: f64 = 1e-5;
/// Upper bound of the initial layout
const INIT_SCALE: f64 = 10.0;

////////////
// Params //
////////////

/// Parameters of the UMAP layout
///
/// ### Fields
///
/// * `n_neighbors` - Size of the local neighbourhood.
/// * `n_components` - Dimensionality of the layout.
/// * `min_dist` - Minimum distance between points in the layout.
/// * `spread` - Effective scale of the embedded points.
/// * `n_epochs` - Number of SGD epochs.
/// * `learning_rate` - Initial learning rate, decays linearly to 0.
/// * `negative_sample_rate` - Negative samples per positive edge sample.
/// * `seed` - Seed for the initialisation fallback and negative sampling.
#[derive(Clone, Debug, PartialEq)]
pub struct UmapParams {
    pub n_neighbors: usize,
    pub n_components: usize,
    pub min_dist: f64,
    pub spread: f64,
    pub n_epochs: usize,
    pub learning_rate: f64,
    pub negative_sample_rate: usize,
    pub seed: u64,
}

impl Default for UmapParams {
    fn default() -> Self {
        (&PipelineConfig::default()).into()
    }
}

impl From<&PipelineConfig> for UmapParams {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            n_neighbors: config.umap_neighbors,
            n_components: 2,
            min_dist: config.umap_min_dist,
            spread: 1.0,
            n_epochs: config.umap_epochs,
            learning_rate: 1.0,
            negative_sample_rate: 5,
            seed: config.random_seed,
        }
    }
}

impl UmapParams {
    fn validate(&self, n_obs: usize) -> Result<()> {
        if self.n_neighbors < 2 {
            return Err(ScError::config("umap_neighbors", "must be >= 2"));
        }
        if self.n_neighbors >= n_obs {
            return Err(ScError::input(
                STAGE,
                format!(
                    "umap_neighbors ({}) must be < number of observations ({})",
                    self.n_neighbors, n_obs
                ),
            ));
        }
        if self.n_components == 0 {
            return Err(ScError::config("umap_components", "must be > 0"));
        }
        if self.n_epochs == 0 {
            return Err(ScError::config("umap_epochs", "must be > 0"));
        }
        if !(self.spread > 0.0) || !(self.min_dist >= 0.0) || self.min_dist > self.spread {
            return Err(ScError::config("umap_min_dist", "need 0 <= min_dist <= spread"));
        }
        Ok(())
    }
}

/////////////
// Results //
/////////////

/// UMAP layout of the observations
///
/// ### Fields
///
/// * `obs_ids` - The observation identifiers.
/// * `coordinates` - Observations x `n_components`.
/// * `n_epochs` - Number of epochs that were run.
#[derive(Clone, Debug)]
pub struct UmapEmbedding {
    pub obs_ids: Vec<String>,
    pub coordinates: Mat<f64>,
    pub n_epochs: usize,
}

/// Weighted edge of the fuzzy graph (`i < j`)
#[derive(Clone, Debug, PartialEq)]
struct Edge {
    i: usize,
    j: usize,
    weight: f64,
}

/////////////////////
// Fuzzy structure //
/////////////////////

/// Smooth kNN distances
///
/// For each point finds `rho` (distance to the nearest neighbour) and, by
/// bisection, `sigma` such that `sum(exp(-(d - rho) / sigma)) = log2(k)`.
///
/// ### Returns
///
/// Tuple of `(rhos, sigmas)`
fn smooth_knn_distances(knn: &KnnResult) -> (Vec<f64>, Vec<f64>) {
    let target = (knn.k() as f64).log2();

    knn.distances
        .iter()
        .map(|dists| {
            let rho = dists.first().copied().unwrap_or(0.0).max(0.0);
            let mut lo = 0.0_f64;
            let mut hi = f64::INFINITY;
            let mut sigma = 1.0;

            for _ in 0..SIGMA_ITER {
                let psum: f64 = dists.iter().map(|&d| (-(d - rho).max(0.0) / sigma).exp()).sum();
                if (psum - target).abs() < SIGMA_TOL {
                    break;
                }
                if psum > target {
                    hi = sigma;
                    sigma = (lo + hi) / 2.0;
                } else {
                    lo = sigma;
                    sigma = if hi.is_infinite() { sigma * 2.0 } else { (lo + hi) / 2.0 };
                }
            }

            // avoid vanishing sigmas on degenerate neighbourhoods
            let mean_dist = dists.iter().sum::<f64>() / dists.len().max(1) as f64;
            (rho, sigma.max(1e-3 * mean_dist).max(1e-12))
        })
        .unzip()
}

/// Fuzzy simplicial set with the fuzzy union as symmetrisation
///
/// `w(i, j) = a + b - a * b` with `a`, `b` the directed memberships.
///
/// ### Returns
///
/// Edges sorted by `(i, j)`.
fn fuzzy_graph(knn: &KnnResult, rhos: &[f64], sigmas: &[f64]) -> Vec<Edge> {
    let mut directed: Vec<(usize, usize, f64)> = Vec::with_capacity(knn.n_points() * knn.k());
    for (i, (idx, dists)) in knn.indices.iter().zip(&knn.distances).enumerate() {
        for (&j, &d) in idx.iter().zip(dists) {
            let w = (-(d - rhos[i]).max(0.0) / sigmas[i]).exp();
            let (lo, hi) = if i < j { (i, j) } else { (j, i) };
            directed.push((lo, hi, w));
        }
    }
    directed.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    let mut edges: Vec<Edge> = Vec::with_capacity(directed.len());
    let mut pos = 0;
    while pos < directed.len() {
        let (i, j, w) = directed[pos];
        if pos + 1 < directed.len() && directed[pos + 1].0 == i && directed[pos + 1].1 == j {
            let w2 = directed[pos + 1].2;
            edges.push(Edge {
                i,
                j,
                weight: w + w2 - w * w2,
            });
            pos += 2;
        } else {
            edges.push(Edge { i, j, weight: w });
            pos += 1;
        }
    }
    edges.retain(|e| e.weight > 0.0);
    edges
}

/// Sum of squared residuals of the `a`, `b` curve on the fit grid
fn ab_residual(a: f64, b: f64, grid: &[(f64, f64)]) -> f64 {
    grid.iter()
        .map(|&(d, target)| {
            let r = 1.0 / (1.0 + a * d.powf(2.0 * b)) - target;
            r * r
        })
        .sum()
}

/// Fit the `a`, `b` parameters of the low dimensional similarity
///
/// Least squares fit (damped Gauss-Newton) of `1 / (1 + a * d^(2b))`
/// against `1` for `d <= min_dist` and `exp(-(d - min_dist) / spread)`
/// beyond, on 300 points in `(0, 3 * spread]`.
fn fit_ab_params(min_dist: f64, spread: f64) -> (f64, f64) {
    if (min_dist - 0.1).abs() < 1e-10 && (spread - 1.0).abs() < 1e-10 {
        return (1.576943460405378, 0.8950608781227859);
    }

    let n_points = 300;
    let grid: Vec<(f64, f64)> = (1..=n_points)
        .map(|k| {
            let d = k as f64 * 3.0 * spread / n_points as f64;
            let target = if d <= min_dist {
                1.0
            } else {
                (-(d - min_dist) / spread).exp()
            };
            (d, target)
        })
        .collect();

    let mut a = 1.0_f64;
    let mut b = 1.0_f64;
    let mut sse = ab_residual(a, b, &grid);

    for _ in 0..100 {
        let (mut jtj_00, mut jtj_01, mut jtj_11, mut jtr_0, mut jtr_1) = (0.0, 0.0, 0.0, 0.0, 0.0);

        for &(d, target) in &grid {
            let d2b = d.powf(2.0 * b);
            let denom = 1.0 + a * d2b;
            let residual = 1.0 / denom - target;

            let df_da = -d2b / (denom * denom);
            let df_db = -a * d2b * 2.0 * d.ln() / (denom * denom);

            jtj_00 += df_da * df_da;
            jtj_01 += df_da * df_db;
            jtj_11 += df_db * df_db;
            jtr_0 += df_da * residual;
            jtr_1 += df_db * residual;
        }

        let det = jtj_00 * jtj_11 - jtj_01 * jtj_01;
        if det.abs() < 1e-20 {
            break;
        }
        let da = -(jtj_11 * jtr_0 - jtj_01 * jtr_1) / det;
        let db = -(jtj_00 * jtr_1 - jtj_01 * jtr_0) / det;

        // halve the step until the residual does not increase
        let mut step = 1.0;
        let mut improved = false;
        for _ in 0..20 {
            let a_new = (a + step * da).max(1e-3);
            let b_new = (b + step * db).max(1e-3);
            let sse_new = ab_residual(a_new, b_new, &grid);
            if sse_new <= sse {
                a = a_new;
                b = b_new;
                sse = sse_new;
                improved = true;
                break;
            }
            step *= 0.5;
        }

        if !improved || (step * da).abs() < 1e-8 && (step * db).abs() < 1e-8 {
            break;
        }
    }

    (a, b)
}

////////////////////
// Initialisation //
////////////////////

/// Initial layout from the leading input dimensions
///
/// Each of the first `n_components` columns is rescaled to `[0, 10]`.
/// Columns that do not exist or have no spread are drawn uniformly.
fn initialise_layout(data: MatRef<f64>, n_components: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let n = data.nrows();
    let mut layout = vec![vec![0.0; n_components]; n];

    for d in 0..n_components {
        let range = if d < data.ncols() {
            let col: Vec<f64> = (0..n).map(|i| data[(i, d)]).collect();
            let min = col.iter().copied().fold(f64::INFINITY, f64::min);
            let max = col.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            if max - min > 0.0 {
                Some((col, min, max))
            } else {
                None
            }
        } else {
            None
        };

        match range {
            Some((col, min, max)) => {
                for i in 0..n {
                    layout[i][d] = (col[i] - min) / (max - min) * INIT_SCALE;
                }
            }
            None => {
                for row in layout.iter_mut() {
                    row[d] = rng.random::<f64>() * INIT_SCALE;
                }
            }
        }
    }

    layout
}

//////////////////
// Optimisation //
//////////////////

#[inline]
fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// SGD with negative sampling
///
/// Edges are sampled proportionally to their weight and processed
/// sequentially, so the result only depends on the seed.
#[allow(clippy::too_many_arguments)]
fn optimise_layout(
    layout: &mut [Vec<f64>],
    edges: &[Edge],
    a: f64,
    b: f64,
    initial_lr: f64,
    n_epochs: usize,
    negative_sample_rate: usize,
    rng: &mut StdRng,
) {
    let n = layout.len();
    let max_weight = edges.iter().map(|e| e.weight).fold(0.0_f64, f64::max);
    if edges.is_empty() || max_weight <= 0.0 {
        return;
    }

    let epochs_per_sample: Vec<f64> = edges.iter().map(|e| max_weight / e.weight).collect();
    let mut epoch_of_next_sample = epochs_per_sample.clone();
    let dim = layout[0].len();

    for epoch in 0..n_epochs {
        let lr = initial_lr * (1.0 - epoch as f64 / n_epochs as f64);

        for (edge_idx, edge) in edges.iter().enumerate() {
            if epoch_of_next_sample[edge_idx] > epoch as f64 + 1.0 {
                continue;
            }
            let (i, j) = (edge.i, edge.j);

            let dist_sq = squared_distance(&layout[i], &layout[j]);
            if dist_sq > 0.0 {
                let coeff = -2.0 * a * b * dist_sq.powf(b - 1.0) / (1.0 + a * dist_sq.powf(b));
                for d in 0..dim {
                    let grad = (coeff * (layout[i][d] - layout[j][d])).clamp(-GRAD_CLIP, GRAD_CLIP);
                    layout[i][d] += lr * grad;
                    layout[j][d] -= lr * grad;
                }
            }

            for _ in 0..negative_sample_rate {
                let neg = rng.random_range(0..n);
                if neg == i {
                    continue;
                }
                let dist_sq = squared_distance(&layout[i], &layout[neg]);
                let coeff = 2.0 * b / ((0.001 + dist_sq) * (1.0 + a * dist_sq.powf(b)));
                for d in 0..dim {
                    let grad = if dist_sq > 0.0 {
                        (coeff * (layout[i][d] - layout[neg][d])).clamp(-GRAD_CLIP, GRAD_CLIP)
                    } else {
                        GRAD_CLIP
                    };
                    layout[i][d] += lr * grad;
                }
            }

            epoch_of_next_sample[edge_idx] += epochs_per_sample[edge_idx];
        }
    }
}

///////////////
// Functions //
///////////////

/// Compute a UMAP layout of a reduced embedding
///
/// ### Params
///
/// * `data` - Observations x dimensions (typically the PCA scores).
/// * `obs_ids` - Identifiers of the rows.
/// * `params` - The `UmapParams`.
///
/// ### Returns
///
/// The `UmapEmbedding`
pub fn run_umap(data: MatRef<f64>, obs_ids: &[String], params: &UmapParams) -> Result<UmapEmbedding> {
    if data.nrows() != obs_ids.len() {
        return Err(ScError::input(
            STAGE,
            format!("{} rows but {} observation ids", data.nrows(), obs_ids.len()),
        ));
    }
    params.validate(data.nrows())?;

    let start = Instant::now();
    let mut rng = StdRng::seed_from_u64(params.seed);

    let knn = exact_knn(data, obs_ids, params.n_neighbors)?;
    let (rhos, sigmas) = smooth_knn_distances(&knn);
    let edges = fuzzy_graph(&knn, &rhos, &sigmas);
    let (a, b) = fit_ab_params(params.min_dist, params.spread);

    log::debug!(
        "UMAP fuzzy graph with {} edges, a = {:.4}, b = {:.4}",
        edges.len(),
        a,
        b
    );

    let mut layout = initialise_layout(data, params.n_components, &mut rng);
    optimise_layout(
        &mut layout,
        &edges,
        a,
        b,
        params.learning_rate,
        params.n_epochs,
        params.negative_sample_rate,
        &mut rng,
    );

    log::info!(
        "UMAP of {} observations ({} epochs) in {:.2?}",
        data.nrows(),
        params.n_epochs,
        start.elapsed()
    );

    Ok(UmapEmbedding {
        obs_ids: obs_ids.to_vec(),
        coordinates: Mat::from_fn(data.nrows(), params.n_components, |i, j| layout[i][j]),
        n_epochs: params.n_epochs,
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("c{}", i)).collect()
    }

    fn two_clusters() -> Mat<f64> {
        Mat::from_fn(30, 3, |i, j| {
            let base = if i < 15 { 0.0 } else { 50.0 };
            base + ((i * (j + 3)) % 7) as f64 * 0.2
        })
    }

    fn params() -> UmapParams {
        UmapParams {
            n_neighbors: 5,
            n_epochs: 100,
            ..Default::default()
        }
    }

    fn centroid(m: &Mat<f64>, rows: std::ops::Range<usize>) -> (f64, f64) {
        let n = rows.len() as f64;
        let (mut x, mut y) = (0.0, 0.0);
        for i in rows {
            x += m[(i, 0)];
            y += m[(i, 1)];
        }
        (x / n, y / n)
    }

    #[test]
    fn test_umap_shape_and_determinism() {
        let data = two_clusters();
        let a = run_umap(data.as_ref(), &ids(30), &params()).unwrap();
        let b = run_umap(data.as_ref(), &ids(30), &params()).unwrap();
        assert_eq!(a.coordinates.nrows(), 30);
        assert_eq!(a.coordinates.ncols(), 2);
        for i in 0..30 {
            for j in 0..2 {
                assert!(a.coordinates[(i, j)].is_finite());
                assert_eq!(a.coordinates[(i, j)], b.coordinates[(i, j)]);
            }
        }
    }

    #[test]
    fn test_umap_keeps_clusters_apart() {
        let res = run_umap(two_clusters().as_ref(), &ids(30), &params()).unwrap();
        let m = &res.coordinates;
        let ca = centroid(m, 0..15);
        let cb = centroid(m, 15..30);
        let between = ((ca.0 - cb.0).powi(2) + (ca.1 - cb.1).powi(2)).sqrt();
        let spread: f64 = (0..15)
            .map(|i| ((m[(i, 0)] - ca.0).powi(2) + (m[(i, 1)] - ca.1).powi(2)).sqrt())
            .sum::<f64>()
            / 15.0;
        assert!(between > spread);
    }

    #[test]
    fn test_fuzzy_graph_symmetric_union() {
        let data = two_clusters();
        let obs: Vec<String> = (0..data.nrows()).map(|i| format!("c{}", i)).collect();
        let knn = exact_knn(data.as_ref(), &obs, 4).unwrap();
        let (rhos, sigmas) = smooth_knn_distances(&knn);
        let edges = fuzzy_graph(&knn, &rhos, &sigmas);
        for e in &edges {
            assert!(e.i < e.j);
            assert!(e.weight > 0.0 && e.weight <= 1.0 + 1e-12);
        }
        // nearest neighbours always have membership 1
        for (i, idx) in knn.indices.iter().enumerate() {
            let j = idx[0];
            let (lo, hi) = if i < j { (i, j) } else { (j, i) };
            let e = edges.iter().find(|e| e.i == lo && e.j == hi).unwrap();
            assert_relative_eq!(e.weight, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_ab_fit_close_to_default() {
        // a slightly shifted min_dist goes through the fit
        let (a, b) = fit_ab_params(0.1000001, 1.0);
        assert!(a > 1.0 && a < 2.5);
        assert!(b > 0.6 && b < 1.2);

        let grid: Vec<(f64, f64)> = (1..=300)
            .map(|k| {
                let d = k as f64 * 3.0 / 300.0;
                (d, if d <= 0.1 { 1.0 } else { (-(d - 0.1)).exp() })
            })
            .collect();
        assert!(ab_residual(a, b, &grid) < ab_residual(1.0, 1.0, &grid));
    }

    #[test]
    fn test_invalid_neighbours() {
        let params = UmapParams {
            n_neighbors: 30,
            ..params()
        };
        assert!(run_umap(two_clusters().as_ref(), &ids(30), &params).is_err());
    }
}
