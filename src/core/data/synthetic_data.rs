use rand::prelude::*;
use rand_distr::{Distribution, Poisson};

use crate::core::data::count_matrix::CountMatrix;
use crate::core::data::sparse_structures::CompressedSparseData;
use crate::core::data::spatial_coordinates::SpatialCoordinates;
use crate::error::{Result, ScError};

/////////////
// Helpers //
/////////////

/// Poisson sampler with a parameter check
fn poisson(rate: f64, parameter: &'static str) -> Result<Poisson<f64>> {
    Poisson::new(rate).map_err(|e| ScError::config(parameter, format!("invalid rate {}: {}", rate, e)))
}

/// Draw one count (Poisson samples are integral floats)
#[inline]
fn draw(dist: &Poisson<f64>, rng: &mut StdRng) -> u32 {
    dist.sample(rng) as u32
}

/// Assemble a CSC count matrix from per-observation (gene, count) columns
fn columns_to_counts(
    columns: Vec<Vec<(usize, u32)>>,
    gene_ids: Vec<String>,
    obs_ids: Vec<String>,
) -> Result<CountMatrix> {
    let n_genes = gene_ids.len();
    let mut indptr = Vec::with_capacity(columns.len() + 1);
    let mut indices = Vec::new();
    let mut data = Vec::new();
    indptr.push(0);

    for col in columns {
        for (gene_idx, count) in col {
            if count > 0 {
                indices.push(gene_idx);
                data.push(count);
            }
        }
        indptr.push(indices.len());
    }

    let shape = (n_genes, obs_ids.len());
    CountMatrix::new(
        CompressedSparseData::new_csc(data, indices, indptr, shape),
        gene_ids,
        obs_ids,
    )
}

//////////////////////////
// Block-structured data //
//////////////////////////

/// Configuration of the synthetic block data
///
/// ### Fields
///
/// * `n_obs` - Number of observations (cells).
/// * `n_genes` - Number of genes, control genes included.
/// * `n_blocks` - Number of cell populations. Observations are assigned in
///   contiguous blocks.
/// * `markers_per_block` - Number of genes that are up-regulated in each
///   population.
/// * `n_control_genes` - Number of control (`MT-`) genes.
/// * `base_rate` - Poisson rate of background expression.
/// * `marker_rate` - Poisson rate of a marker in its own population.
/// * `control_rate` - Poisson rate of the control genes.
#[derive(Clone, Debug)]
pub struct BlockDataConfig {
    pub n_obs: usize,
    pub n_genes: usize,
    pub n_blocks: usize,
    pub markers_per_block: usize,
    pub n_control_genes: usize,
    pub base_rate: f64,
    pub marker_rate: f64,
    pub control_rate: f64,
}

impl Default for BlockDataConfig {
    fn default() -> Self {
        Self {
            n_obs: 100,
            n_genes: 50,
            n_blocks: 2,
            markers_per_block: 10,
            n_control_genes: 2,
            base_rate: 1.0,
            marker_rate: 12.0,
            control_rate: 0.2,
        }
    }
}

/// Structure for synthetic single cell data
///
/// ### Fields
///
/// * `counts` - The synthetic counts (genes x cells).
/// * `labels` - The population of every cell.
/// * `marker_genes` - For every population the indices of its markers.
#[derive(Clone, Debug)]
pub struct SyntheticCounts {
    pub counts: CountMatrix,
    pub labels: Vec<usize>,
    pub marker_genes: Vec<Vec<usize>>,
}

/// Generate block-structured synthetic counts
///
/// Control genes come first and are called `MT-<i>`, then the markers of
/// every block, then background genes. Cells are called `cell_<i>`.
///
/// ### Params
///
/// * `config` - The `BlockDataConfig`.
/// * `seed` - Seed for reproducibility purposes. Every cell uses its own
///   generator seeded with `seed + cell index`.
///
/// ### Returns
///
/// The `SyntheticCounts`
pub fn generate_block_counts(config: &BlockDataConfig, seed: u64) -> Result<SyntheticCounts> {
    if config.n_blocks == 0 || config.n_obs < config.n_blocks {
        return Err(ScError::config("n_blocks", "need at least one observation per block"));
    }
    let n_marker_genes = config.n_blocks * config.markers_per_block;
    if config.n_control_genes + n_marker_genes > config.n_genes {
        return Err(ScError::config(
            "n_genes",
            format!(
                "{} genes cannot hold {} control and {} marker genes",
                config.n_genes, config.n_control_genes, n_marker_genes
            ),
        ));
    }

    let base = poisson(config.base_rate, "base_rate")?;
    let marker = poisson(config.marker_rate, "marker_rate")?;
    let control = poisson(config.control_rate, "control_rate")?;

    let marker_genes: Vec<Vec<usize>> = (0..config.n_blocks)
        .map(|b| {
            let start = config.n_control_genes + b * config.markers_per_block;
            (start..start + config.markers_per_block).collect()
        })
        .collect();

    let gene_ids: Vec<String> = (0..config.n_genes)
        .map(|i| {
            if i < config.n_control_genes {
                format!("MT-{}", i)
            } else {
                format!("gene_{}", i)
            }
        })
        .collect();
    let obs_ids: Vec<String> = (0..config.n_obs).map(|i| format!("cell_{}", i)).collect();

    let mut labels = Vec::with_capacity(config.n_obs);
    let mut columns = Vec::with_capacity(config.n_obs);

    for cell_idx in 0..config.n_obs {
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(cell_idx as u64));
        let block = cell_idx * config.n_blocks / config.n_obs;
        labels.push(block);

        let own_markers = &marker_genes[block];
        let col: Vec<(usize, u32)> = (0..config.n_genes)
            .map(|gene_idx| {
                let dist = if gene_idx < config.n_control_genes {
                    &control
                } else if own_markers.contains(&gene_idx) {
                    &marker
                } else {
                    &base
                };
                (gene_idx, draw(dist, &mut rng))
            })
            .collect();
        columns.push(col);
    }

    Ok(SyntheticCounts {
        counts: columns_to_counts(columns, gene_ids, obs_ids)?,
        labels,
        marker_genes,
    })
}

////////////////////////
// Spatial spot grid //
////////////////////////

/// Structure for synthetic spot data
///
/// ### Fields
///
/// * `counts` - The synthetic counts (genes x spots).
/// * `coordinates` - The spot positions.
#[derive(Clone, Debug)]
pub struct SyntheticSpots {
    pub counts: CountMatrix,
    pub coordinates: SpatialCoordinates,
}

/// Generate a rectangular spot grid with spatial and non-spatial genes
///
/// Genes:
///
/// * `smooth` - rate increases linearly along the grid columns.
/// * `smooth_rev` - rate decreases linearly along the grid columns, so that
///   library sizes stay flat across the grid.
/// * `noise` - constant rate, independent of the position.
/// * `filler_<i>` - constant rate background genes.
///
/// ### Params
///
/// * `n_rows` - Number of grid rows.
/// * `n_cols` - Number of grid columns.
/// * `n_filler` - Number of background genes.
/// * `seed` - Seed for reproducibility purposes.
///
/// ### Returns
///
/// The `SyntheticSpots`
pub fn generate_spot_grid(n_rows: usize, n_cols: usize, n_filler: usize, seed: u64) -> Result<SyntheticSpots> {
    if n_rows == 0 || n_cols < 2 {
        return Err(ScError::config("n_cols", "need at least one row and two columns"));
    }

    let low = 2.0;
    let high = 20.0;
    let noise = poisson(8.0, "noise_rate")?;
    let filler = poisson(10.0, "filler_rate")?;

    let mut gene_ids = vec!["smooth".to_string(), "smooth_rev".to_string(), "noise".to_string()];
    gene_ids.extend((0..n_filler).map(|i| format!("filler_{}", i)));

    let n_spots = n_rows * n_cols;
    let mut obs_ids = Vec::with_capacity(n_spots);
    let mut grid = Vec::with_capacity(n_spots);
    let mut pixel = Vec::with_capacity(n_spots);
    let mut columns = Vec::with_capacity(n_spots);

    for r in 0..n_rows {
        for c in 0..n_cols {
            let spot_idx = r * n_cols + c;
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(spot_idx as u64));
            let t = c as f64 / (n_cols - 1) as f64;

            let up = poisson(low + (high - low) * t, "smooth_rate")?;
            let down = poisson(low + (high - low) * (1.0 - t), "smooth_rate")?;

            let mut col = vec![
                (0, draw(&up, &mut rng)),
                (1, draw(&down, &mut rng)),
                (2, draw(&noise, &mut rng)),
            ];
            for i in 0..n_filler {
                col.push((3 + i, draw(&filler, &mut rng)));
            }

            obs_ids.push(format!("spot_{}_{}", r, c));
            grid.push((r as i64, c as i64));
            pixel.push((c as f64 * 100.0, r as f64 * 100.0));
            columns.push(col);
        }
    }

    let coordinates = SpatialCoordinates::new(obs_ids.clone(), grid, pixel)?;
    let counts = columns_to_counts(columns, gene_ids, obs_ids)?;

    Ok(SyntheticSpots { counts, coordinates })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_counts_layout() {
        let data = generate_block_counts(&BlockDataConfig::default(), 42).unwrap();
        assert_eq!(data.counts.n_genes(), 50);
        assert_eq!(data.counts.n_obs(), 100);
        assert_eq!(data.labels.iter().filter(|&&l| l == 0).count(), 50);
        assert_eq!(data.marker_genes[1], (12..22).collect::<Vec<_>>());
        assert_eq!(data.counts.gene_ids()[0], "MT-0");
        assert!(data.counts.csc().check_structure().is_ok());
    }

    #[test]
    fn test_block_counts_reproducible() {
        let a = generate_block_counts(&BlockDataConfig::default(), 7).unwrap();
        let b = generate_block_counts(&BlockDataConfig::default(), 7).unwrap();
        assert_eq!(a.counts, b.counts);
    }

    #[test]
    fn test_markers_are_higher_in_their_block() {
        let data = generate_block_counts(&BlockDataConfig::default(), 1).unwrap();
        let gene = data.marker_genes[0][0];
        let in_block: u32 = (0..50).map(|j| data.counts.get(gene, j)).sum();
        let out_block: u32 = (50..100).map(|j| data.counts.get(gene, j)).sum();
        assert!(in_block > 3 * out_block);
    }

    #[test]
    fn test_block_config_checked() {
        let config = BlockDataConfig {
            n_genes: 10,
            ..Default::default()
        };
        assert!(generate_block_counts(&config, 1).is_err());
    }

    #[test]
    fn test_spot_grid() {
        let spots = generate_spot_grid(6, 8, 4, 3).unwrap();
        assert_eq!(spots.counts.n_obs(), 48);
        assert_eq!(spots.counts.n_genes(), 7);
        assert_eq!(spots.coordinates.len(), 48);
        assert_eq!(spots.coordinates.obs_ids(), spots.counts.obs_ids());
    }
}
