use rand::prelude::*;
use rayon::prelude::*;
use std::time::Instant;

use crate::config::PipelineConfig;
use crate::core::base::stats::{calc_fdr, z_score_to_pval, TestAlternative};
use crate::core::data::count_matrix::*;
use crate::core::data::spatial_coordinates::SpatialCoordinates;
use crate::core::graph::knn::{exact_knn, symmetric_knn_adjacency};
use crate::error::{Result, ScError};

const STAGE: &str = "spatial";

////////////
// Params //
////////////

/// Parameters of the spatial autocorrelation ranking
///
/// ### Fields
///
/// * `k` - Number of spatial neighbours per spot.
/// * `alpha` - Threshold on the adjusted p-value.
/// * `n_permutations` - Permutations per gene. `0` uses the analytic normal
///   approximation.
/// * `seed` - Seed for the permutations (offset by the gene index).
#[derive(Clone, Debug, PartialEq)]
pub struct SpatialParams {
    pub k: usize,
    pub alpha: f64,
    pub n_permutations: usize,
    pub seed: u64,
}

impl Default for SpatialParams {
    fn default() -> Self {
        (&PipelineConfig::default()).into()
    }
}

impl From<&PipelineConfig> for SpatialParams {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            k: config.spatial_k,
            alpha: config.spatial_alpha,
            n_permutations: config.spatial_permutations,
            seed: config.random_seed,
        }
    }
}

/////////////
// Results //
/////////////

/// Spatial autocorrelation of one gene
///
/// ### Fields
///
/// * `gene_id` - The gene.
/// * `morans_i` - Moran's I.
/// * `gearys_c` - Geary's C.
/// * `z_score` - Z score of Moran's I under the normality assumption.
/// * `p_value` - One-sided p-value for positive autocorrelation.
/// * `p_adj` - Benjamini-Hochberg adjusted p-value.
/// * `rank` - 1-based rank by Moran's I (descending).
/// * `is_significant` - `p_adj < alpha`.
#[derive(Clone, Debug, PartialEq)]
pub struct SpatialVariableGene {
    pub gene_id: String,
    pub morans_i: f64,
    pub gearys_c: f64,
    pub z_score: f64,
    pub p_value: f64,
    pub p_adj: f64,
    pub rank: usize,
    pub is_significant: bool,
}

////////////////////
// Spatial graph  //
////////////////////

/// Binary spatial weights
///
/// ### Fields
///
/// * `neighbours` - Sorted, symmetric adjacency lists.
/// * `s0` - Sum of all weights.
/// * `s1` - `1/2 * sum((w_ij + w_ji)^2)`.
/// * `s2` - `sum((w_i. + w_.i)^2)`.
#[derive(Clone, Debug)]
pub struct SpatialWeights {
    pub neighbours: Vec<Vec<usize>>,
    pub s0: f64,
    pub s1: f64,
    pub s2: f64,
}

/// kNN graph over the pixel positions of the spots
///
/// `i` and `j` are neighbours if either is among the `k` nearest spots of
/// the other; all weights are 1.
///
/// ### Params
///
/// * `coords` - The `SpatialCoordinates`.
/// * `k` - Number of neighbours.
///
/// ### Returns
///
/// The `SpatialWeights`
pub fn spatial_weights(coords: &SpatialCoordinates, k: usize) -> Result<SpatialWeights> {
    if k == 0 {
        return Err(ScError::config("spatial_k", "must be > 0"));
    }
    let pixel = coords.pixel_matrix();
    let knn = exact_knn(pixel.as_ref(), coords.obs_ids(), k)?;
    let neighbours = symmetric_knn_adjacency(&knn);

    let degrees: Vec<f64> = neighbours.iter().map(|n| n.len() as f64).collect();
    let s0: f64 = degrees.iter().sum();
    let s1 = 2.0 * s0;
    let s2: f64 = degrees.iter().map(|d| 4.0 * d * d).sum();

    Ok(SpatialWeights {
        neighbours,
        s0,
        s1,
        s2,
    })
}

////////////////
// Statistics //
////////////////

/// Moran's I of centred values
fn morans_i(z: &[f64], ss: f64, weights: &SpatialWeights) -> f64 {
    let cross: f64 = weights
        .neighbours
        .iter()
        .enumerate()
        .map(|(i, nb)| z[i] * nb.iter().map(|&j| z[j]).sum::<f64>())
        .sum();
    (z.len() as f64 / weights.s0) * cross / ss
}

/// Geary's C of centred values
fn gearys_c(z: &[f64], ss: f64, weights: &SpatialWeights) -> f64 {
    let diff: f64 = weights
        .neighbours
        .iter()
        .enumerate()
        .map(|(i, nb)| nb.iter().map(|&j| (z[i] - z[j]).powi(2)).sum::<f64>())
        .sum();
    (z.len() as f64 - 1.0) * diff / (2.0 * weights.s0 * ss)
}

/// Expectation and variance of Moran's I under the normality assumption
fn morans_i_moments(n: usize, weights: &SpatialWeights) -> (f64, f64) {
    let n = n as f64;
    let expected = -1.0 / (n - 1.0);
    let s0_sq = weights.s0 * weights.s0;
    let second = (n * n * weights.s1 - n * weights.s2 + 3.0 * s0_sq) / (s0_sq * (n * n - 1.0));
    (expected, second - expected * expected)
}

/// Statistics of one gene
///
/// ### Returns
///
/// Tuple of `(I, C, z, p)`
fn gene_autocorrelation(
    values: &[f64],
    weights: &SpatialWeights,
    moments: (f64, f64),
    n_permutations: usize,
    seed: u64,
) -> (f64, f64, f64, f64) {
    let n = values.len();
    let mean = values.iter().sum::<f64>() / n as f64;
    let z: Vec<f64> = values.iter().map(|v| v - mean).collect();
    let ss: f64 = z.iter().map(|v| v * v).sum();

    if ss <= 0.0 {
        return (0.0, 1.0, 0.0, 1.0);
    }

    let i_obs = morans_i(&z, ss, weights);
    let c_obs = gearys_c(&z, ss, weights);
    let (expected, var) = moments;
    let z_score = if var > 0.0 {
        (i_obs - expected) / var.sqrt()
    } else {
        0.0
    };

    let p_value = if n_permutations == 0 {
        z_score_to_pval(z_score, TestAlternative::Greater)
    } else {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut shuffled = z.clone();
        let mut hits = 0usize;
        for _ in 0..n_permutations {
            shuffled.shuffle(&mut rng);
            if morans_i(&shuffled, ss, weights) >= i_obs {
                hits += 1;
            }
        }
        (hits + 1) as f64 / (n_permutations + 1) as f64
    };

    (i_obs, c_obs, z_score, p_value)
}

///////////////
// Functions //
///////////////

/// Rank genes by spatial autocorrelation (Moran's I)
///
/// ### Params
///
/// * `mat` - The log-normalised gene x spot matrix.
/// * `coords` - Coordinates of the spots; must cover every observation of
///   `mat`.
/// * `candidate_genes` - Optional subset of gene ids to test. `None` tests
///   all genes.
/// * `params` - The `SpatialParams`.
///
/// ### Returns
///
/// The genes ordered by descending Moran's I (ties by gene id).
pub fn spatially_variable_genes(
    mat: &NormalisedMatrix,
    coords: &SpatialCoordinates,
    candidate_genes: Option<&[String]>,
    params: &SpatialParams,
) -> Result<Vec<SpatialVariableGene>> {
    if !(params.alpha > 0.0 && params.alpha < 1.0) {
        return Err(ScError::config("spatial_alpha", "must be in (0, 1)"));
    }
    if mat.n_obs() < 3 {
        return Err(ScError::input(
            STAGE,
            format!("need at least 3 spots, got {}", mat.n_obs()),
        ));
    }

    let start = Instant::now();

    let gene_indices: Vec<usize> = match candidate_genes {
        None => (0..mat.n_genes()).collect(),
        Some(ids) => {
            let lookup = mat.gene_index_map();
            ids.iter()
                .map(|id| {
                    lookup
                        .get(id.as_str())
                        .copied()
                        .ok_or_else(|| ScError::input(STAGE, format!("unknown gene `{}`", id)))
                })
                .collect::<Result<Vec<_>>>()?
        }
    };

    let aligned = coords.align_to(mat.obs_ids())?;
    let weights = spatial_weights(&aligned, params.k)?;
    let moments = morans_i_moments(mat.n_obs(), &weights);

    let csr = mat.to_csr();
    let n = mat.n_obs();

    let stats: Vec<(f64, f64, f64, f64)> = gene_indices
        .par_iter()
        .map(|&g| {
            let (idx, vals) = csr.outer(g);
            let mut dense = vec![0.0; n];
            for (&j, &v) in idx.iter().zip(vals) {
                dense[j] = v;
            }
            gene_autocorrelation(
                &dense,
                &weights,
                moments,
                params.n_permutations,
                params.seed.wrapping_add(g as u64),
            )
        })
        .collect();

    let pvals: Vec<f64> = stats.iter().map(|s| s.3).collect();
    let p_adj = calc_fdr(&pvals);

    let gene_ids = mat.gene_ids();
    let mut res: Vec<SpatialVariableGene> = gene_indices
        .iter()
        .zip(stats)
        .zip(p_adj)
        .map(|((&g, (i, c, z, p)), q)| SpatialVariableGene {
            gene_id: gene_ids[g].clone(),
            morans_i: i,
            gearys_c: c,
            z_score: z,
            p_value: p,
            p_adj: q,
            rank: 0,
            is_significant: q < params.alpha,
        })
        .collect();

    res.sort_by(|a, b| {
        b.morans_i
            .total_cmp(&a.morans_i)
            .then_with(|| a.gene_id.cmp(&b.gene_id))
    });
    for (pos, gene) in res.iter_mut().enumerate() {
        gene.rank = pos + 1;
    }

    log::info!(
        "Spatial autocorrelation of {} genes on {} spots: {} significant in {:.2?}",
        res.len(),
        n,
        res.iter().filter(|g| g.is_significant).count(),
        start.elapsed()
    );

    Ok(res)
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::base::sparse_math::log_normalise;
    use crate::core::data::synthetic_data::generate_spot_grid;
    use approx::assert_relative_eq;

    fn grid_coords(n_rows: usize, n_cols: usize) -> SpatialCoordinates {
        let mut ids = Vec::new();
        let mut grid = Vec::new();
        let mut pixel = Vec::new();
        for r in 0..n_rows {
            for c in 0..n_cols {
                ids.push(format!("s{}_{}", r, c));
                grid.push((r as i64, c as i64));
                pixel.push((c as f64, r as f64));
            }
        }
        SpatialCoordinates::new(ids, grid, pixel).unwrap()
    }

    #[test]
    fn test_weights_symmetric() {
        let w = spatial_weights(&grid_coords(4, 4), 4).unwrap();
        for (i, nb) in w.neighbours.iter().enumerate() {
            for &j in nb {
                assert!(w.neighbours[j].contains(&i));
            }
        }
        assert_relative_eq!(w.s1, 2.0 * w.s0);
    }

    #[test]
    fn test_morans_i_extremes() {
        let w = spatial_weights(&grid_coords(6, 6), 4).unwrap();
        // gradient along the columns: strong positive autocorrelation
        let gradient: Vec<f64> = (0..36).map(|i| (i % 6) as f64).collect();
        let mean = gradient.iter().sum::<f64>() / 36.0;
        let z: Vec<f64> = gradient.iter().map(|v| v - mean).collect();
        let ss: f64 = z.iter().map(|v| v * v).sum();
        assert!(morans_i(&z, ss, &w) > 0.3);
        assert!(gearys_c(&z, ss, &w) < 0.5);

        // checkerboard: negative autocorrelation on the 4-neighbourhood
        let checker: Vec<f64> = (0..36).map(|i| ((i / 6 + i % 6) % 2) as f64).collect();
        let mean = checker.iter().sum::<f64>() / 36.0;
        let z: Vec<f64> = checker.iter().map(|v| v - mean).collect();
        let ss: f64 = z.iter().map(|v| v * v).sum();
        assert!(morans_i(&z, ss, &w) < 0.0);
    }

    #[test]
    fn test_constant_gene() {
        let w = spatial_weights(&grid_coords(3, 3), 2).unwrap();
        let moments = morans_i_moments(9, &w);
        let res = gene_autocorrelation(&[2.0; 9], &w, moments, 0, 1);
        assert_eq!(res, (0.0, 1.0, 0.0, 1.0));
    }

    #[test]
    fn test_smooth_gene_ranks_above_noise() {
        let spots = generate_spot_grid(8, 10, 3, 11).unwrap();
        let norm = log_normalise(&spots.counts, 1e4).unwrap();
        let res = spatially_variable_genes(&norm, &spots.coordinates, None, &SpatialParams::default()).unwrap();

        let smooth = res.iter().find(|g| g.gene_id == "smooth").unwrap();
        let noise = res.iter().find(|g| g.gene_id == "noise").unwrap();
        assert!(smooth.rank < noise.rank);
        assert!(smooth.is_significant);
        let ranks: Vec<usize> = res.iter().map(|g| g.rank).collect();
        assert_eq!(ranks, (1..=res.len()).collect::<Vec<_>>());
    }

    #[test]
    fn test_permutations_reproducible() {
        let spots = generate_spot_grid(5, 6, 1, 2).unwrap();
        let norm = log_normalise(&spots.counts, 1e4).unwrap();
        let params = SpatialParams {
            n_permutations: 99,
            ..Default::default()
        };
        let a = spatially_variable_genes(&norm, &spots.coordinates, None, &params).unwrap();
        let b = spatially_variable_genes(&norm, &spots.coordinates, None, &params).unwrap();
        assert_eq!(a, b);
        let smooth = a.iter().find(|g| g.gene_id == "smooth").unwrap();
        assert!(smooth.p_value <= 0.02);
    }

    #[test]
    fn test_candidate_subset_and_unknown_gene() {
        let spots = generate_spot_grid(4, 4, 2, 1).unwrap();
        let norm = log_normalise(&spots.counts, 1e4).unwrap();
        let subset = vec!["noise".to_string(), "smooth".to_string()];
        let res = spatially_variable_genes(&norm, &spots.coordinates, Some(&subset), &SpatialParams::default()).unwrap();
        assert_eq!(res.len(), 2);

        let unknown = vec!["nope".to_string()];
        assert!(spatially_variable_genes(&norm, &spots.coordinates, Some(&unknown), &SpatialParams::default()).is_err());
    }
}
