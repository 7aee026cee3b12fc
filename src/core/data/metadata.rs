use rustc_hash::FxHashMap;

use crate::core::data::count_matrix::check_unique;
use crate::error::{Result, ScError};

const STAGE: &str = "metadata";

////////////////
// Structures //
////////////////

/// One column of per-observation values
#[derive(Clone, Debug, PartialEq)]
pub enum MetadataColumn {
    /// Continuous values (library size, fractions, scores, coordinates)
    Numeric(Vec<f64>),
    /// Integer values (feature counts, cluster labels, grid positions)
    Integer(Vec<i64>),
    /// Free text (annotations)
    Text(Vec<String>),
    /// Boolean flags (QC pass/fail)
    Flag(Vec<bool>),
}

impl MetadataColumn {
    /// Number of values in the column
    pub fn len(&self) -> usize {
        match self {
            MetadataColumn::Numeric(v) => v.len(),
            MetadataColumn::Integer(v) => v.len(),
            MetadataColumn::Text(v) => v.len(),
            MetadataColumn::Flag(v) => v.len(),
        }
    }

    /// Is the column empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep the values flagged in the mask
    fn subset(&self, mask: &[bool]) -> Self {
        fn keep<T: Clone>(v: &[T], mask: &[bool]) -> Vec<T> {
            v.iter()
                .zip(mask)
                .filter(|(_, &m)| m)
                .map(|(x, _)| x.clone())
                .collect()
        }
        match self {
            MetadataColumn::Numeric(v) => MetadataColumn::Numeric(keep(v, mask)),
            MetadataColumn::Integer(v) => MetadataColumn::Integer(keep(v, mask)),
            MetadataColumn::Text(v) => MetadataColumn::Text(keep(v, mask)),
            MetadataColumn::Flag(v) => MetadataColumn::Flag(keep(v, mask)),
        }
    }
}

/// Per-observation annotations, stored column-wise
///
/// Columns are append-only: adding a column under an existing name is an
/// error, so no stage can silently overwrite the output of another one.
///
/// ### Fields
///
/// * `obs_ids` - The observation identifiers (row keys).
/// * `columns` - Named columns in insertion order.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservationMetadata {
    obs_ids: Vec<String>,
    columns: Vec<(String, MetadataColumn)>,
}

impl ObservationMetadata {
    /// Generate empty metadata for the given observations
    ///
    /// ### Params
    ///
    /// * `obs_ids` - Unique observation identifiers.
    pub fn new(obs_ids: Vec<String>) -> Result<Self> {
        check_unique(&obs_ids, "observation")?;
        Ok(Self {
            obs_ids,
            columns: Vec::new(),
        })
    }

    /// Number of observations
    pub fn n_obs(&self) -> usize {
        self.obs_ids.len()
    }

    /// The observation identifiers
    pub fn obs_ids(&self) -> &[String] {
        &self.obs_ids
    }

    /// Names of all columns in insertion order
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Does a column exist
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|(n, _)| n == name)
    }

    /// Get a column by name
    pub fn get(&self, name: &str) -> Option<&MetadataColumn> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, column)| column)
    }

    /// Get a numeric column by name
    pub fn get_numeric(&self, name: &str) -> Option<&[f64]> {
        match self.get(name) {
            Some(MetadataColumn::Numeric(v)) => Some(v),
            _ => None,
        }
    }

    /// Get an integer column by name
    pub fn get_integer(&self, name: &str) -> Option<&[i64]> {
        match self.get(name) {
            Some(MetadataColumn::Integer(v)) => Some(v),
            _ => None,
        }
    }

    /// Add a new column
    ///
    /// ### Params
    ///
    /// * `name` - Name of the column. Must not exist yet.
    /// * `column` - The values, one per observation.
    pub fn add_column(&mut self, name: &str, column: MetadataColumn) -> Result<()> {
        if self.has_column(name) {
            return Err(ScError::input(
                STAGE,
                format!("column `{}` already exists", name),
            ));
        }
        if column.len() != self.n_obs() {
            return Err(ScError::input(
                STAGE,
                format!(
                    "column `{}` has {} values for {} observations",
                    name,
                    column.len(),
                    self.n_obs()
                ),
            ));
        }
        self.columns.push((name.to_string(), column));
        Ok(())
    }

    /// Add a numeric column
    pub fn add_numeric_column(&mut self, name: &str, values: Vec<f64>) -> Result<()> {
        self.add_column(name, MetadataColumn::Numeric(values))
    }

    /// Add an integer column
    pub fn add_integer_column(&mut self, name: &str, values: Vec<i64>) -> Result<()> {
        self.add_column(name, MetadataColumn::Integer(values))
    }

    /// Add a text column
    pub fn add_text_column(&mut self, name: &str, values: Vec<String>) -> Result<()> {
        self.add_column(name, MetadataColumn::Text(values))
    }

    /// Add a flag column
    pub fn add_flag_column(&mut self, name: &str, values: Vec<bool>) -> Result<()> {
        self.add_column(name, MetadataColumn::Flag(values))
    }

    /// Add a column given as `observation id -> value` pairs
    ///
    /// Every observation must be present exactly once.
    ///
    /// ### Params
    ///
    /// * `name` - Name of the column.
    /// * `ids` - Observation identifiers of the values.
    /// * `values` - The values.
    pub fn add_numeric_column_by_id(&mut self, name: &str, ids: &[String], values: &[f64]) -> Result<()> {
        if ids.len() != values.len() {
            return Err(ScError::input(
                STAGE,
                format!("{} ids for {} values", ids.len(), values.len()),
            ));
        }
        let position = self.index_map();
        let mut column = vec![f64::NAN; self.n_obs()];
        let mut filled = vec![false; self.n_obs()];
        for (id, &v) in ids.iter().zip(values) {
            let idx = *position.get(id.as_str()).ok_or_else(|| {
                ScError::input(STAGE, format!("unknown observation id `{}`", id))
            })?;
            if filled[idx] {
                return Err(ScError::input(STAGE, format!("duplicated observation id `{}`", id)));
            }
            filled[idx] = true;
            column[idx] = v;
        }
        if let Some(missing) = filled.iter().position(|f| !f) {
            return Err(ScError::input(
                STAGE,
                format!("no value for observation `{}`", self.obs_ids[missing]),
            ));
        }
        self.add_numeric_column(name, column)
    }

    /// Lookup from observation id to row index
    pub fn index_map(&self) -> FxHashMap<&str, usize> {
        self.obs_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect()
    }

    /// Keep the observations flagged in the mask (all columns)
    ///
    /// ### Params
    ///
    /// * `mask` - Boolean per observation.
    pub fn subset(&self, mask: &[bool]) -> Result<Self> {
        if mask.len() != self.n_obs() {
            return Err(ScError::input(
                STAGE,
                format!("mask of length {} for {} observations", mask.len(), self.n_obs()),
            ));
        }
        let obs_ids = self
            .obs_ids
            .iter()
            .zip(mask)
            .filter(|(_, &m)| m)
            .map(|(id, _)| id.clone())
            .collect();
        let columns = self
            .columns
            .iter()
            .map(|(name, column)| (name.clone(), column.subset(mask)))
            .collect();
        Ok(Self { obs_ids, columns })
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> ObservationMetadata {
        ObservationMetadata::new(vec!["a".into(), "b".into(), "c".into()]).unwrap()
    }

    #[test]
    fn test_columns_are_append_only() {
        let mut meta = metadata();
        meta.add_numeric_column("total_counts", vec![1.0, 2.0, 3.0]).unwrap();
        let res = meta.add_numeric_column("total_counts", vec![4.0, 5.0, 6.0]);
        assert!(matches!(res, Err(ScError::Input { .. })));
        assert_eq!(meta.get_numeric("total_counts"), Some(&[1.0, 2.0, 3.0][..]));
    }

    #[test]
    fn test_length_mismatch() {
        let mut meta = metadata();
        assert!(meta.add_integer_column("cluster", vec![0, 1]).is_err());
        assert!(!meta.has_column("cluster"));
    }

    #[test]
    fn test_duplicate_ids() {
        assert!(ObservationMetadata::new(vec!["a".into(), "a".into()]).is_err());
    }

    #[test]
    fn test_by_id_and_subset() {
        let mut meta = metadata();
        meta.add_numeric_column_by_id(
            "score",
            &["c".into(), "a".into(), "b".into()],
            &[3.0, 1.0, 2.0],
        )
        .unwrap();
        meta.add_flag_column("keep", vec![true, false, true]).unwrap();

        let sub = meta.subset(&[true, false, true]).unwrap();
        assert_eq!(sub.obs_ids(), &["a".to_string(), "c".to_string()]);
        assert_eq!(sub.get_numeric("score"), Some(&[1.0, 3.0][..]));
        assert_eq!(sub.column_names(), vec!["score", "keep"]);
    }

    #[test]
    fn test_by_id_missing_observation() {
        let mut meta = metadata();
        let res = meta.add_numeric_column_by_id("score", &["a".into(), "b".into()], &[1.0, 2.0]);
        assert!(res.is_err());
    }
}
