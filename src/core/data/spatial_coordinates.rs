use faer::Mat;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::core::data::count_matrix::check_unique;
use crate::error::{Result, ScError};

const STAGE: &str = "spatial_coordinates";

/// Positions of spatial spots
///
/// ### Fields
///
/// * `obs_ids` - Observation identifiers (same ids as the matrix columns).
/// * `grid` - Integer `(row, col)` array position of every spot. Unique.
/// * `pixel` - Continuous `(x, y)` image position of every spot.
#[derive(Clone, Debug, PartialEq)]
pub struct SpatialCoordinates {
    obs_ids: Vec<String>,
    grid: Vec<(i64, i64)>,
    pixel: Vec<(f64, f64)>,
}

impl SpatialCoordinates {
    /// Generate validated spatial coordinates
    ///
    /// ### Params
    ///
    /// * `obs_ids` - Unique observation identifiers.
    /// * `grid` - Grid positions, unique per observation.
    /// * `pixel` - Pixel positions, finite.
    pub fn new(obs_ids: Vec<String>, grid: Vec<(i64, i64)>, pixel: Vec<(f64, f64)>) -> Result<Self> {
        if obs_ids.len() != grid.len() || obs_ids.len() != pixel.len() {
            return Err(ScError::input(
                STAGE,
                format!(
                    "{} ids, {} grid positions and {} pixel positions",
                    obs_ids.len(),
                    grid.len(),
                    pixel.len()
                ),
            ));
        }
        check_unique(&obs_ids, "observation")?;

        let mut seen: FxHashSet<(i64, i64)> = FxHashSet::default();
        for (id, pos) in obs_ids.iter().zip(grid.iter()) {
            if !seen.insert(*pos) {
                return Err(ScError::input(
                    STAGE,
                    format!("grid position {:?} of `{}` is not unique", pos, id),
                ));
            }
        }
        if let Some(i) = pixel.iter().position(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(ScError::input(
                STAGE,
                format!("pixel position of `{}` is not finite", obs_ids[i]),
            ));
        }

        Ok(Self { obs_ids, grid, pixel })
    }

    /// Number of spots
    pub fn len(&self) -> usize {
        self.obs_ids.len()
    }

    /// Are there no spots
    pub fn is_empty(&self) -> bool {
        self.obs_ids.is_empty()
    }

    /// The observation identifiers
    pub fn obs_ids(&self) -> &[String] {
        &self.obs_ids
    }

    /// The grid positions
    pub fn grid(&self) -> &[(i64, i64)] {
        &self.grid
    }

    /// The pixel positions
    pub fn pixel(&self) -> &[(f64, f64)] {
        &self.pixel
    }

    /// Reorder (and subset) the coordinates to the given observations
    ///
    /// ### Params
    ///
    /// * `obs_ids` - Target order, typically the matrix columns.
    ///
    /// ### Returns
    ///
    /// Coordinates in the order of `obs_ids` or an error naming the first
    /// observation without coordinates.
    pub fn align_to(&self, obs_ids: &[String]) -> Result<Self> {
        let position: FxHashMap<&str, usize> = self
            .obs_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut grid = Vec::with_capacity(obs_ids.len());
        let mut pixel = Vec::with_capacity(obs_ids.len());
        for id in obs_ids {
            let i = *position.get(id.as_str()).ok_or_else(|| {
                ScError::input(STAGE, format!("no coordinates for observation `{}`", id))
            })?;
            grid.push(self.grid[i]);
            pixel.push(self.pixel[i]);
        }

        Ok(Self {
            obs_ids: obs_ids.to_vec(),
            grid,
            pixel,
        })
    }

    /// Pixel positions as an `n x 2` matrix
    pub fn pixel_matrix(&self) -> Mat<f64> {
        Mat::from_fn(self.len(), 2, |i, j| if j == 0 { self.pixel[i].0 } else { self.pixel[i].1 })
    }
}
