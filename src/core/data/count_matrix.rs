use rustc_hash::{FxHashMap, FxHashSet};

use crate::core::data::sparse_structures::*;
use crate::error::{Result, ScError};

const STAGE: &str = "matrix";

////////////
// Traits //
////////////

/// Values that can be stored in a `FeatureMatrix`
///
/// Counts are stored as `u32`, normalised values as `f64`. All arithmetic
/// downstream happens in `f64`.
pub trait SparseValue: Copy + Default + PartialEq + Send + Sync + std::fmt::Debug {
    /// Cast to f64
    fn to_f64(self) -> f64;

    /// Is this a valid (finite, non-negative) entry
    fn is_valid(self) -> bool;

    /// Is this an exact zero
    fn is_zero(self) -> bool {
        self == Self::default()
    }
}

impl SparseValue for u32 {
    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn is_valid(self) -> bool {
        true
    }
}

impl SparseValue for f64 {
    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn is_valid(self) -> bool {
        self.is_finite() && self >= 0.0
    }
}

////////////////
// Structures //
////////////////

/// Sparse gene x observation matrix with identifiers
///
/// Stored in CSC with observations (cells or spots) as columns. Row
/// indices are strictly sorted within each column.
///
/// ### Fields
///
/// * `data` - The CSC data (genes x observations).
/// * `gene_ids` - Unique gene identifiers (rows).
/// * `obs_ids` - Unique observation identifiers (columns).
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix<T>
where
    T: SparseValue,
{
    data: CompressedSparseData<T>,
    gene_ids: Vec<String>,
    obs_ids: Vec<String>,
}

/// Raw UMI counts
pub type CountMatrix = FeatureMatrix<u32>;

/// Normalised (and typically log-transformed) expression values
pub type NormalisedMatrix = FeatureMatrix<f64>;

impl<T> FeatureMatrix<T>
where
    T: SparseValue,
{
    /// Generate a new matrix from CSC data and identifiers
    ///
    /// ### Params
    ///
    /// * `data` - CSC data with genes as rows and observations as columns.
    /// * `gene_ids` - The gene identifiers.
    /// * `obs_ids` - The observation identifiers.
    ///
    /// ### Returns
    ///
    /// The validated matrix or an `ScError::Input` describing the problem.
    pub fn new(
        data: CompressedSparseData<T>,
        gene_ids: Vec<String>,
        obs_ids: Vec<String>,
    ) -> Result<Self> {
        data.check_structure().map_err(|e| ScError::input(STAGE, e))?;
        let data = match data.cs_type {
            CompressedSparseFormat::Csc => data,
            CompressedSparseFormat::Csr => data.transform(),
        };

        let (nrow, ncol) = data.shape();
        if gene_ids.len() != nrow {
            return Err(ScError::input(
                STAGE,
                format!("{} gene ids for {} rows", gene_ids.len(), nrow),
            ));
        }
        if obs_ids.len() != ncol {
            return Err(ScError::input(
                STAGE,
                format!("{} observation ids for {} columns", obs_ids.len(), ncol),
            ));
        }
        check_unique(&gene_ids, "gene")?;
        check_unique(&obs_ids, "observation")?;

        if let Some(pos) = data.data.iter().position(|v| !v.is_valid()) {
            return Err(ScError::input(
                STAGE,
                format!("entry {:?} at position {} is negative or not finite", data.data[pos], pos),
            ));
        }

        Ok(Self {
            data,
            gene_ids,
            obs_ids,
        })
    }

    /// Generate a matrix from `(gene index, observation index, value)`
    /// triplets
    ///
    /// Exact zeros are dropped. Duplicated coordinates are an error.
    ///
    /// ### Params
    ///
    /// * `gene_ids` - The gene identifiers.
    /// * `obs_ids` - The observation identifiers.
    /// * `triplets` - The non-zero entries.
    pub fn from_triplets(
        gene_ids: Vec<String>,
        obs_ids: Vec<String>,
        triplets: &[(usize, usize, T)],
    ) -> Result<Self> {
        let nrow = gene_ids.len();
        let ncol = obs_ids.len();

        let mut entries: Vec<(usize, usize, T)> = triplets
            .iter()
            .filter(|(_, _, v)| !v.is_zero())
            .copied()
            .collect();
        entries.sort_unstable_by_key(|&(r, c, _)| (c, r));

        let mut indptr = vec![0usize; ncol + 1];
        let mut indices = Vec::with_capacity(entries.len());
        let mut data = Vec::with_capacity(entries.len());

        for (i, &(r, c, v)) in entries.iter().enumerate() {
            if r >= nrow || c >= ncol {
                return Err(ScError::input(
                    STAGE,
                    format!("triplet ({}, {}) out of bounds for shape ({}, {})", r, c, nrow, ncol),
                ));
            }
            if i > 0 && entries[i - 1].0 == r && entries[i - 1].1 == c {
                return Err(ScError::input(
                    STAGE,
                    format!("duplicated entry at ({}, {})", r, c),
                ));
            }
            indptr[c + 1] += 1;
            indices.push(r);
            data.push(v);
        }
        for j in 0..ncol {
            indptr[j + 1] += indptr[j];
        }

        Self::new(
            CompressedSparseData::new_csc(data, indices, indptr, (nrow, ncol)),
            gene_ids,
            obs_ids,
        )
    }

    /// Generate a matrix from dense rows (one row per gene)
    ///
    /// ### Params
    ///
    /// * `gene_ids` - The gene identifiers.
    /// * `obs_ids` - The observation identifiers.
    /// * `rows` - Dense values, `rows[gene][obs]`.
    pub fn from_dense(gene_ids: Vec<String>, obs_ids: Vec<String>, rows: &[Vec<T>]) -> Result<Self> {
        if rows.len() != gene_ids.len() {
            return Err(ScError::input(
                STAGE,
                format!("{} dense rows for {} gene ids", rows.len(), gene_ids.len()),
            ));
        }
        let mut triplets = Vec::new();
        for (r, row) in rows.iter().enumerate() {
            if row.len() != obs_ids.len() {
                return Err(ScError::input(
                    STAGE,
                    format!("dense row {} has {} values, expected {}", r, row.len(), obs_ids.len()),
                ));
            }
            for (c, &v) in row.iter().enumerate() {
                triplets.push((r, c, v));
            }
        }
        Self::from_triplets(gene_ids, obs_ids, &triplets)
    }

    /// Number of genes (rows)
    pub fn n_genes(&self) -> usize {
        self.gene_ids.len()
    }

    /// Number of observations (columns)
    pub fn n_obs(&self) -> usize {
        self.obs_ids.len()
    }

    /// The gene identifiers
    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    /// The observation identifiers
    pub fn obs_ids(&self) -> &[String] {
        &self.obs_ids
    }

    /// The underlying CSC data
    pub fn csc(&self) -> &CompressedSparseData<T> {
        &self.data
    }

    /// Gene-major (CSR) copy of the data
    pub fn to_csr(&self) -> CompressedSparseData<T> {
        self.data.transposed_layout()
    }

    /// Non-zero entries of one observation
    ///
    /// ### Returns
    ///
    /// Tuple of `(gene indices, values)`
    #[inline]
    pub fn column(&self, obs_idx: usize) -> (&[usize], &[T]) {
        self.data.outer(obs_idx)
    }

    /// Value at a given position (zero if not stored)
    pub fn get(&self, gene_idx: usize, obs_idx: usize) -> T {
        let (idx, vals) = self.column(obs_idx);
        idx.binary_search(&gene_idx)
            .map(|pos| vals[pos])
            .unwrap_or_default()
    }

    /// Lookup from gene identifier to row index
    pub fn gene_index_map(&self) -> FxHashMap<&str, usize> {
        self.gene_ids
            .iter()
            .enumerate()
            .map(|(i, g)| (g.as_str(), i))
            .collect()
    }

    /// Generate a new matrix with the same structure but different values
    ///
    /// Entries mapped to exact zero are removed, so the sparsity pattern of
    /// the result only ever shrinks.
    ///
    /// ### Params
    ///
    /// * `f` - Function of `(gene index, observation index, value)`.
    pub fn map_values<F>(&self, f: F) -> Result<NormalisedMatrix>
    where
        F: Fn(usize, usize, T) -> f64,
    {
        let (nrow, ncol) = self.data.shape();
        let mut data = Vec::with_capacity(self.data.nnz());
        let mut indices = Vec::with_capacity(self.data.nnz());
        let mut indptr = Vec::with_capacity(ncol + 1);
        indptr.push(0);

        for j in 0..ncol {
            let (idx, vals) = self.column(j);
            for (&i, &v) in idx.iter().zip(vals.iter()) {
                let new_v = f(i, j, v);
                if new_v != 0.0 {
                    indices.push(i);
                    data.push(new_v);
                }
            }
            indptr.push(data.len());
        }

        FeatureMatrix::new(
            CompressedSparseData::new_csc(data, indices, indptr, (nrow, ncol)),
            self.gene_ids.clone(),
            self.obs_ids.clone(),
        )
    }

    /// Keep the observations flagged in the mask
    ///
    /// ### Params
    ///
    /// * `mask` - Boolean per observation.
    pub fn subset_observations(&self, mask: &[bool]) -> Result<Self> {
        if mask.len() != self.n_obs() {
            return Err(ScError::input(
                STAGE,
                format!("mask of length {} for {} observations", mask.len(), self.n_obs()),
            ));
        }

        let mut data = Vec::new();
        let mut indices = Vec::new();
        let mut indptr = vec![0usize];
        let mut obs_ids = Vec::new();

        for (j, &keep) in mask.iter().enumerate() {
            if !keep {
                continue;
            }
            let (idx, vals) = self.column(j);
            indices.extend_from_slice(idx);
            data.extend_from_slice(vals);
            indptr.push(data.len());
            obs_ids.push(self.obs_ids[j].clone());
        }

        let shape = (self.n_genes(), obs_ids.len());
        Ok(Self {
            data: CompressedSparseData::new_csc(data, indices, indptr, shape),
            gene_ids: self.gene_ids.clone(),
            obs_ids,
        })
    }

    /// Keep the given genes, in the given order
    ///
    /// ### Params
    ///
    /// * `gene_indices` - Row indices to keep. Must be unique.
    pub fn subset_genes(&self, gene_indices: &[usize]) -> Result<Self> {
        let mut new_pos = vec![usize::MAX; self.n_genes()];
        for (new_i, &old_i) in gene_indices.iter().enumerate() {
            if old_i >= self.n_genes() {
                return Err(ScError::input(
                    STAGE,
                    format!("gene index {} out of bounds ({})", old_i, self.n_genes()),
                ));
            }
            if new_pos[old_i] != usize::MAX {
                return Err(ScError::input(STAGE, format!("gene index {} selected twice", old_i)));
            }
            new_pos[old_i] = new_i;
        }

        let mut data = Vec::new();
        let mut indices = Vec::new();
        let mut indptr = vec![0usize];

        for j in 0..self.n_obs() {
            let (idx, vals) = self.column(j);
            let mut col: Vec<(usize, T)> = idx
                .iter()
                .zip(vals.iter())
                .filter(|&(&i, _)| new_pos[i] != usize::MAX)
                .map(|(&i, &v)| (new_pos[i], v))
                .collect();
            col.sort_unstable_by_key(|&(i, _)| i);
            for (i, v) in col {
                indices.push(i);
                data.push(v);
            }
            indptr.push(data.len());
        }

        let gene_ids = gene_indices.iter().map(|&i| self.gene_ids[i].clone()).collect();

        Ok(Self {
            data: CompressedSparseData::new_csc(data, indices, indptr, (gene_indices.len(), self.n_obs())),
            gene_ids,
            obs_ids: self.obs_ids.clone(),
        })
    }
}

/////////////
// Helpers //
/////////////

/// Check that identifiers are unique
///
/// ### Params
///
/// * `ids` - The identifiers.
/// * `what` - What kind of identifier (for the error message).
pub fn check_unique(ids: &[String], what: &str) -> Result<()> {
    let mut seen: FxHashSet<&str> = FxHashSet::default();
    for id in ids {
        if !seen.insert(id.as_str()) {
            return Err(ScError::input(
                STAGE,
                format!("duplicated {} identifier `{}`", what, id),
            ));
        }
    }
    Ok(())
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    fn small_counts() -> CountMatrix {
        // genes x cells
        // [1 0 2]
        // [0 3 0]
        // [4 0 5]
        CountMatrix::from_dense(
            ids("g", 3),
            ids("c", 3),
            &[vec![1, 0, 2], vec![0, 3, 0], vec![4, 0, 5]],
        )
        .unwrap()
    }

    #[test]
    fn test_from_dense_layout() {
        let m = small_counts();
        assert_eq!(m.csc().indptr, vec![0, 2, 3, 5]);
        assert_eq!(m.csc().indices, vec![0, 2, 1, 0, 2]);
        assert_eq!(m.get(2, 2), 5);
        assert_eq!(m.get(1, 0), 0);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let res = CountMatrix::from_dense(
            vec!["a".into(), "a".into()],
            ids("c", 1),
            &[vec![1], vec![2]],
        );
        assert!(matches!(res, Err(ScError::Input { .. })));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let res = CountMatrix::from_dense(ids("g", 2), ids("c", 2), &[vec![1, 2]]);
        assert!(res.is_err());
    }

    #[test]
    fn test_negative_values_rejected() {
        let res = NormalisedMatrix::from_dense(ids("g", 1), ids("c", 2), &[vec![1.0, -2.0]]);
        assert!(res.is_err());
    }

    #[test]
    fn test_duplicated_triplets_rejected() {
        let res = CountMatrix::from_triplets(ids("g", 2), ids("c", 2), &[(0, 1, 3), (0, 1, 4)]);
        assert!(res.is_err());
    }

    #[test]
    fn test_subset_observations() {
        let m = small_counts();
        let sub = m.subset_observations(&[true, false, true]).unwrap();
        assert_eq!(sub.n_obs(), 2);
        assert_eq!(sub.obs_ids(), &["c0".to_string(), "c2".to_string()]);
        assert_eq!(sub.get(2, 1), 5);
        assert_eq!(sub.get(1, 0), 0);
    }

    #[test]
    fn test_subset_genes_reorders() {
        let m = small_counts();
        let sub = m.subset_genes(&[2, 0]).unwrap();
        assert_eq!(sub.gene_ids(), &["g2".to_string(), "g0".to_string()]);
        assert_eq!(sub.get(0, 0), 4);
        assert_eq!(sub.get(1, 0), 1);
        assert!(sub.csc().check_structure().is_ok());
    }

    #[test]
    fn test_map_values_drops_zeros() {
        let m = small_counts();
        let mapped = m
            .map_values(|i, _, v| if i == 0 { 0.0 } else { v as f64 })
            .unwrap();
        assert_eq!(mapped.csc().nnz(), 3);
    }
}
