use std::time::Instant;

use crate::config::PipelineConfig;
use crate::core::base::sparse_math::{col_nnz, col_sums, row_nnz};
use crate::core::data::count_matrix::*;
use crate::error::{Result, ScError};

const STAGE: &str = "qc";

////////////
// Params //
////////////

/// Thresholds of the quality control
///
/// ### Fields
///
/// * `min_features` - Minimum number of detected genes per observation.
/// * `min_total_counts` - Minimum library size per observation.
/// * `max_control_fraction` - Maximum fraction of counts from control genes.
/// * `control_gene_prefix` - Genes starting with this prefix form the
///   control set.
/// * `min_cells_per_gene` - Genes detected in fewer observations are removed.
#[derive(Clone, Debug, PartialEq)]
pub struct QcParams {
    pub min_features: usize,
    pub min_total_counts: f64,
    pub max_control_fraction: f64,
    pub control_gene_prefix: String,
    pub min_cells_per_gene: usize,
}

impl Default for QcParams {
    fn default() -> Self {
        (&PipelineConfig::default()).into()
    }
}

impl From<&PipelineConfig> for QcParams {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            min_features: config.min_features,
            min_total_counts: config.min_total_counts,
            max_control_fraction: config.max_control_fraction,
            control_gene_prefix: config.control_gene_prefix.clone(),
            min_cells_per_gene: config.min_cells_per_gene,
        }
    }
}

/////////////
// Results //
/////////////

/// Structure to store QC information on observations
///
/// ### Fields
///
/// * `to_keep` - Boolean vector indicating if the observation passes the
///   thresholds
/// * `lib_size` - Total counts of the observation
/// * `no_genes` - Number of detected genes of the observation
/// * `control_fraction` - Fraction of counts from the control genes. `NaN` for
///   empty observations.
#[derive(Clone, Debug, PartialEq)]
pub struct CellQuality {
    pub to_keep: Vec<bool>,
    pub lib_size: Vec<f64>,
    pub no_genes: Vec<usize>,
    pub control_fraction: Vec<f64>,
}

impl CellQuality {
    /// Number of observations passing the thresholds
    pub fn n_kept(&self) -> usize {
        self.to_keep.iter().filter(|&&k| k).count()
    }
}

/// Report of the full QC step
///
/// ### Fields
///
/// * `cells` - The per observation metrics and keep mask.
/// * `genes_to_keep` - Gene mask from `min_cells_per_gene`.
/// * `n_obs_before`, `n_obs_after` - Observation counts around the filter.
/// * `n_genes_before`, `n_genes_after` - Gene counts around the filter.
#[derive(Clone, Debug, PartialEq)]
pub struct QcReport {
    pub cells: CellQuality,
    pub genes_to_keep: Vec<bool>,
    pub n_obs_before: usize,
    pub n_obs_after: usize,
    pub n_genes_before: usize,
    pub n_genes_after: usize,
}

///////////////
// Functions //
///////////////

/// Identify the control genes by prefix
///
/// ### Params
///
/// * `gene_ids` - The gene identifiers.
/// * `prefix` - Prefix of the control genes (case sensitive). An empty prefix
///   selects no genes.
///
/// ### Returns
///
/// Boolean mask over the genes
pub fn control_gene_mask(gene_ids: &[String], prefix: &str) -> Vec<bool> {
    gene_ids
        .iter()
        .map(|id| !prefix.is_empty() && id.starts_with(prefix))
        .collect()
}

/// Compute the per observation QC metrics and the keep mask
///
/// An observation is kept if it has at least `min_features` detected genes,
/// at least `min_total_counts` counts and a control fraction of at most
/// `max_control_fraction`. Observations without counts have an undefined
/// control fraction and are always dropped.
///
/// ### Params
///
/// * `counts` - The raw counts.
/// * `is_control` - Boolean mask of the control genes.
/// * `params` - The `QcParams`.
///
/// ### Returns
///
/// The `CellQuality`
pub fn calculate_cell_quality(counts: &CountMatrix, is_control: &[bool], params: &QcParams) -> Result<CellQuality> {
    if is_control.len() != counts.n_genes() {
        return Err(ScError::input(
            STAGE,
            format!(
                "control mask of length {} for {} genes",
                is_control.len(),
                counts.n_genes()
            ),
        ));
    }
    if !(0.0..=1.0).contains(&params.max_control_fraction) {
        return Err(ScError::config("max_control_fraction", "must be in [0, 1]"));
    }

    let lib_size = col_sums(counts);
    let no_genes = col_nnz(counts);

    let control_fraction: Vec<f64> = (0..counts.n_obs())
        .map(|j| {
            if lib_size[j] <= 0.0 {
                return f64::NAN;
            }
            let (idx, vals) = counts.column(j);
            let control: f64 = idx
                .iter()
                .zip(vals)
                .filter(|(&i, _)| is_control[i])
                .map(|(_, v)| v.to_f64())
                .sum();
            control / lib_size[j]
        })
        .collect();

    let to_keep: Vec<bool> = (0..counts.n_obs())
        .map(|j| {
            // NaN fails the comparison and is dropped
            let control_ok = control_fraction[j] <= params.max_control_fraction;
            control_ok && no_genes[j] >= params.min_features && lib_size[j] >= params.min_total_counts
        })
        .collect();

    Ok(CellQuality {
        to_keep,
        lib_size,
        no_genes,
        control_fraction,
    })
}

/// Gene mask from the minimum number of observations a gene is detected in
///
/// ### Params
///
/// * `counts` - The counts.
/// * `min_cells` - Minimum number of observations with a non-zero count.
pub fn gene_detection_mask(counts: &CountMatrix, min_cells: usize) -> Vec<bool> {
    row_nnz(counts).into_iter().map(|n| n >= min_cells).collect()
}

/// Run the quality control
///
/// Observations are filtered first, the gene filter is computed on the
/// remaining observations. Counts before and after are logged.
///
/// ### Params
///
/// * `counts` - The raw counts.
/// * `params` - The `QcParams`.
///
/// ### Returns
///
/// Tuple of `(filtered counts, QcReport)`. Fails with `InsufficientData` if no
/// observation or gene remains.
pub fn run_qc(counts: &CountMatrix, params: &QcParams) -> Result<(CountMatrix, QcReport)> {
    let start = Instant::now();

    let is_control = control_gene_mask(counts.gene_ids(), &params.control_gene_prefix);
    let n_control = is_control.iter().filter(|&&c| c).count();
    log::debug!(
        "{} control genes with prefix `{}`",
        n_control,
        params.control_gene_prefix
    );

    let cells = calculate_cell_quality(counts, &is_control, params)?;
    let n_obs_after = cells.n_kept();
    if n_obs_after == 0 {
        return Err(ScError::InsufficientData {
            stage: STAGE,
            item: "observations".to_string(),
            message: format!("none of {} observations passed QC", counts.n_obs()),
        });
    }

    let filtered = counts.subset_observations(&cells.to_keep)?;
    let genes_to_keep = gene_detection_mask(&filtered, params.min_cells_per_gene);
    let kept_genes: Vec<usize> = genes_to_keep
        .iter()
        .enumerate()
        .filter(|(_, &k)| k)
        .map(|(i, _)| i)
        .collect();
    if kept_genes.is_empty() {
        return Err(ScError::InsufficientData {
            stage: STAGE,
            item: "genes".to_string(),
            message: format!(
                "no gene is detected in at least {} observations",
                params.min_cells_per_gene
            ),
        });
    }
    let filtered = if kept_genes.len() == filtered.n_genes() {
        filtered
    } else {
        filtered.subset_genes(&kept_genes)?
    };

    let report = QcReport {
        n_obs_before: counts.n_obs(),
        n_obs_after,
        n_genes_before: counts.n_genes(),
        n_genes_after: kept_genes.len(),
        cells,
        genes_to_keep,
    };

    log::info!(
        "QC kept {} of {} observations and {} of {} genes in {:.2?}",
        report.n_obs_after,
        report.n_obs_before,
        report.n_genes_after,
        report.n_genes_before,
        start.elapsed()
    );

    Ok((filtered, report))
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

    fn counts() -> CountMatrix {
        let genes = vec!["MT-1".to_string(), "A".into(), "B".into(), "C".into()];
        CountMatrix::from_dense(
            genes,
            ids("c", 4),
            &[
                vec![1, 5, 0, 0],
                vec![3, 1, 0, 0],
                vec![2, 0, 0, 0],
                vec![4, 0, 0, 0],
            ],
        )
        .unwrap()
    }

    fn params() -> QcParams {
        QcParams {
            min_features: 2,
            min_total_counts: 0.0,
            max_control_fraction: 0.3,
            control_gene_prefix: "MT-".to_string(),
            min_cells_per_gene: 0,
        }
    }

    #[test]
    fn test_cell_quality_metrics() {
        let counts = counts();
        let mask = control_gene_mask(counts.gene_ids(), "MT-");
        let qc = calculate_cell_quality(&counts, &mask, &params()).unwrap();

        assert_eq!(qc.lib_size, vec![10.0, 6.0, 0.0, 0.0]);
        assert_eq!(qc.no_genes, vec![4, 2, 0, 0]);
        assert!((qc.control_fraction[0] - 0.1).abs() < 1e-12);
        assert!((qc.control_fraction[1] - 5.0 / 6.0).abs() < 1e-12);
        assert!(qc.control_fraction[2].is_nan());
        assert_eq!(qc.to_keep, vec![true, false, false, false]);
    }

    #[test]
    fn test_every_kept_observation_passes() {
        let counts = counts();
        let params = QcParams {
            max_control_fraction: 1.0,
            min_features: 1,
            ..params()
        };
        let mask = control_gene_mask(counts.gene_ids(), "MT-");
        let qc = calculate_cell_quality(&counts, &mask, &params).unwrap();
        assert_eq!(qc.to_keep.len(), counts.n_obs());
        for j in 0..counts.n_obs() {
            if qc.to_keep[j] {
                assert!(qc.no_genes[j] >= params.min_features);
                assert!(qc.control_fraction[j] <= params.max_control_fraction);
            }
        }
        // empty observations are dropped even with permissive thresholds
        assert!(!qc.to_keep[2]);
    }

    #[test]
    fn test_run_qc_filters_genes() {
        let params = QcParams {
            min_features: 1,
            max_control_fraction: 1.0,
            min_cells_per_gene: 2,
            ..params()
        };
        let (filtered, report) = run_qc(&counts(), &params).unwrap();
        assert_eq!(report.n_obs_before, 4);
        assert_eq!(report.n_obs_after, 2);
        assert_eq!(filtered.gene_ids(), &["MT-1".to_string(), "A".to_string()]);
        assert_eq!(report.n_genes_after, 2);
    }

    #[test]
    fn test_run_qc_nothing_left() {
        let params = QcParams {
            min_features: 100,
            ..params()
        };
        assert!(matches!(
            run_qc(&counts(), &params),
            Err(ScError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_deterministic_mask() {
        let counts = counts();
        let mask = control_gene_mask(counts.gene_ids(), "MT-");
        let a = calculate_cell_quality(&counts, &mask, &params()).unwrap();
        let b = calculate_cell_quality(&counts, &mask, &params()).unwrap();
        assert_eq!(a.to_keep, b.to_keep);
    }
}
