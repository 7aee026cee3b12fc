use rayon::prelude::*;
use std::time::Instant;

use crate::config::PipelineConfig;
use crate::core::base::stats::{calc_fdr, wilcoxon_rank_sum_sparse};
use crate::core::data::count_matrix::*;
use crate::core::data::sparse_structures::CompressedSparseData;
use crate::error::{Result, ScError, StageWarning};
use crate::single_cell::clustering::ClusterAssignment;

const STAGE: &str = "markers";

/// Smallest group on which the rank-sum test is run
const MIN_GROUP_SIZE: usize = 3;

////////////
// Params //
////////////

/// Parameters of the marker gene detection
///
/// ### Fields
///
/// * `min_pct` - Minimum detection fraction in either group.
/// * `min_logfc` - Minimum absolute average log2 fold change.
/// * `only_positive` - Only report genes up-regulated in the cluster.
#[derive(Clone, Debug, PartialEq)]
pub struct MarkerParams {
    pub min_pct: f64,
    pub min_logfc: f64,
    pub only_positive: bool,
}

impl Default for MarkerParams {
    fn default() -> Self {
        (&PipelineConfig::default()).into()
    }
}

impl From<&PipelineConfig> for MarkerParams {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            min_pct: config.marker_min_pct,
            min_logfc: config.marker_min_logfc,
            only_positive: config.marker_only_positive,
        }
    }
}

/////////////
// Results //
/////////////

/// Outcome of the test for one row of the marker table
#[derive(Clone, Debug, PartialEq)]
pub enum MarkerStatus {
    /// The gene was tested
    Tested,
    /// The cluster (or its complement) was too small to be tested
    InsufficientData { n_members: usize },
}

/// One row of the marker table
///
/// ### Fields
///
/// * `cluster` - The cluster id.
/// * `gene_id` - The gene. Empty for `InsufficientData` rows.
/// * `avg_log2fc` - Average log2 fold change cluster vs rest.
/// * `p_value` - Two-sided Wilcoxon rank-sum p-value.
/// * `p_adj` - Benjamini-Hochberg adjusted p-value within the cluster.
/// * `auc` - Area under the curve of the cluster vs the rest.
/// * `pct_in` - Detection fraction in the cluster.
/// * `pct_out` - Detection fraction in the rest.
/// * `status` - The `MarkerStatus`.
#[derive(Clone, Debug, PartialEq)]
pub struct MarkerRow {
    pub cluster: usize,
    pub gene_id: String,
    pub avg_log2fc: f64,
    pub p_value: f64,
    pub p_adj: f64,
    pub auc: f64,
    pub pct_in: f64,
    pub pct_out: f64,
    pub status: MarkerStatus,
}

impl MarkerRow {
    fn insufficient(cluster: usize, n_members: usize) -> Self {
        Self {
            cluster,
            gene_id: String::new(),
            avg_log2fc: f64::NAN,
            p_value: f64::NAN,
            p_adj: f64::NAN,
            auc: f64::NAN,
            pct_in: f64::NAN,
            pct_out: f64::NAN,
            status: MarkerStatus::InsufficientData { n_members },
        }
    }
}

/// Marker genes of all clusters
///
/// ### Fields
///
/// * `rows` - Rows ordered by cluster, within a cluster by descending fold
///   change and then ascending p-value.
/// * `warnings` - One `InsufficientData` warning per skipped cluster.
#[derive(Clone, Debug, PartialEq)]
pub struct MarkerTable {
    pub rows: Vec<MarkerRow>,
    pub warnings: Vec<StageWarning>,
}

impl MarkerTable {
    /// Tested rows of one cluster
    pub fn cluster_rows(&self, cluster: usize) -> Vec<&MarkerRow> {
        self.rows
            .iter()
            .filter(|r| r.cluster == cluster && r.status == MarkerStatus::Tested)
            .collect()
    }
}

/// The first `n` tested markers of every cluster
///
/// ### Params
///
/// * `table` - The `MarkerTable`.
/// * `n` - Number of markers per cluster.
///
/// ### Returns
///
/// Rows in table order, at most `n` per cluster.
pub fn top_markers(table: &MarkerTable, n: usize) -> Vec<&MarkerRow> {
    let mut res = Vec::new();
    let mut current: Option<usize> = None;
    let mut taken = 0;
    for row in table.rows.iter().filter(|r| r.status == MarkerStatus::Tested) {
        if current != Some(row.cluster) {
            current = Some(row.cluster);
            taken = 0;
        }
        if taken < n {
            res.push(row);
            taken += 1;
        }
    }
    res
}

/////////////
// Helpers //
/////////////

/// Average log2 fold change on the linear scale
///
/// `log2(mean(expm1(x_in)) + 1) - log2(mean(expm1(x_out)) + 1)`
fn avg_log2fc(sum_in: f64, n_in: usize, sum_out: f64, n_out: usize) -> f64 {
    let mean_in = sum_in / n_in as f64;
    let mean_out = sum_out / n_out as f64;
    (mean_in + 1.0).log2() - (mean_out + 1.0).log2()
}

/// Test all genes for one cluster
fn markers_for_cluster(
    cluster: usize,
    csr: &CompressedSparseData<f64>,
    gene_ids: &[String],
    in_cluster: &[bool],
    n_in: usize,
    params: &MarkerParams,
) -> Vec<MarkerRow> {
    let n_out = in_cluster.len() - n_in;
    let mut rows: Vec<MarkerRow> = Vec::new();

    for (gene_idx, gene_id) in gene_ids.iter().enumerate() {
        let (idx, vals) = csr.outer(gene_idx);
        let mut nz_in = Vec::new();
        let mut nz_out = Vec::new();
        for (&j, &v) in idx.iter().zip(vals) {
            if in_cluster[j] {
                nz_in.push(v);
            } else {
                nz_out.push(v);
            }
        }

        let pct_in = nz_in.len() as f64 / n_in as f64;
        let pct_out = nz_out.len() as f64 / n_out as f64;
        if pct_in.max(pct_out) < params.min_pct {
            continue;
        }

        let lin_in: f64 = nz_in.iter().map(|v| v.exp_m1()).sum();
        let lin_out: f64 = nz_out.iter().map(|v| v.exp_m1()).sum();
        let logfc = avg_log2fc(lin_in, n_in, lin_out, n_out);
        if logfc.abs() < params.min_logfc || (params.only_positive && logfc <= 0.0) {
            continue;
        }

        let test = wilcoxon_rank_sum_sparse(&nz_in, n_in, &nz_out, n_out);
        rows.push(MarkerRow {
            cluster,
            gene_id: gene_id.clone(),
            avg_log2fc: logfc,
            p_value: test.p_value,
            p_adj: f64::NAN,
            auc: test.auc,
            pct_in,
            pct_out,
            status: MarkerStatus::Tested,
        });
    }

    let pvals: Vec<f64> = rows.iter().map(|r| r.p_value).collect();
    for (row, p_adj) in rows.iter_mut().zip(calc_fdr(&pvals)) {
        row.p_adj = p_adj;
    }

    rows.sort_by(|a, b| {
        b.avg_log2fc
            .total_cmp(&a.avg_log2fc)
            .then(a.p_value.total_cmp(&b.p_value))
            .then_with(|| a.gene_id.cmp(&b.gene_id))
    });
    rows
}

///////////////
// Functions //
///////////////

/// Find marker genes of every cluster against all other observations
///
/// Genes have to be detected in at least `min_pct` of either group and have
/// an absolute average log2 fold change of at least `min_logfc`. Clusters
/// with fewer than three members (or fewer than three observations outside
/// of them) are not tested; they get a single `InsufficientData` row and a
/// warning.
///
/// ### Params
///
/// * `mat` - The log-normalised gene x observation matrix.
/// * `clusters` - The `ClusterAssignment` of the same observations.
/// * `params` - The `MarkerParams`.
///
/// ### Returns
///
/// The `MarkerTable`
pub fn find_markers(mat: &NormalisedMatrix, clusters: &ClusterAssignment, params: &MarkerParams) -> Result<MarkerTable> {
    if clusters.labels.len() != mat.n_obs() {
        return Err(ScError::input(
            STAGE,
            format!(
                "{} cluster labels for {} observations",
                clusters.labels.len(),
                mat.n_obs()
            ),
        ));
    }
    if clusters.obs_ids.as_slice() != mat.obs_ids() {
        return Err(ScError::input(
            STAGE,
            "observations of the clusters and of the matrix differ",
        ));
    }
    if !(0.0..=1.0).contains(&params.min_pct) {
        return Err(ScError::config("marker_min_pct", "must be in [0, 1]"));
    }

    let start = Instant::now();
    let csr = mat.to_csr();
    let sizes = clusters.cluster_sizes();
    let n_obs = mat.n_obs();

    let per_cluster: Vec<(Vec<MarkerRow>, Option<StageWarning>)> = (0..clusters.n_clusters)
        .into_par_iter()
        .map(|cluster| {
            let n_in = sizes[cluster];
            if n_in < MIN_GROUP_SIZE || n_obs - n_in < MIN_GROUP_SIZE {
                let warning = StageWarning::InsufficientData {
                    stage: STAGE,
                    item: format!("cluster {}", cluster),
                    message: format!(
                        "{} members and {} other observations, need at least {} each",
                        n_in,
                        n_obs - n_in,
                        MIN_GROUP_SIZE
                    ),
                };
                return (vec![MarkerRow::insufficient(cluster, n_in)], Some(warning));
            }
            let in_cluster: Vec<bool> = clusters.labels.iter().map(|&l| l == cluster).collect();
            let rows = markers_for_cluster(cluster, &csr, mat.gene_ids(), &in_cluster, n_in, params);
            (rows, None)
        })
        .collect();

    let mut rows = Vec::new();
    let mut warnings = Vec::new();
    for (cluster_rows, warning) in per_cluster {
        rows.extend(cluster_rows);
        if let Some(w) = warning {
            w.log();
            warnings.push(w);
        }
    }

    log::info!(
        "Found {} marker rows for {} clusters in {:.2?}",
        rows.len(),
        clusters.n_clusters,
        start.elapsed()
    );

    Ok(MarkerTable { rows, warnings })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::base::sparse_math::log_normalise;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    fn assignment(labels: Vec<usize>, n_clusters: usize) -> ClusterAssignment {
        ClusterAssignment {
            obs_ids: ids("c", labels.len()),
            labels,
            n_clusters,
            modularity: 0.0,
            iterations: 1,
            warnings: Vec::new(),
        }
    }

    /// 20 observations, two clusters of ten. Only `marker` differs; the flat
    /// genes dominate the library size so normalisation barely moves them.
    fn two_clusters() -> (NormalisedMatrix, ClusterAssignment) {
        let genes = vec!["flat_a".to_string(), "marker".into(), "flat_b".into()];
        let rows = vec![
            vec![1000u32; 20],
            (0..20).map(|j| if j < 10 { 20 } else { 1 }).collect(),
            vec![1000u32; 20],
        ];
        let counts = CountMatrix::from_dense(genes, ids("c", 20), &rows).unwrap();
        let norm = log_normalise(&counts, 1e4).unwrap();
        let labels = (0..20).map(|j| if j < 10 { 0 } else { 1 }).collect();
        (norm, assignment(labels, 2))
    }

    #[test]
    fn test_single_marker_both_directions() {
        let (norm, clusters) = two_clusters();
        let params = MarkerParams {
            min_pct: 0.25,
            min_logfc: 0.25,
            only_positive: false,
        };
        let table = find_markers(&norm, &clusters, &params).unwrap();

        let top = top_markers(&table, 1);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].cluster, 0);
        assert_eq!(top[0].gene_id, "marker");
        assert!(top[0].avg_log2fc > 0.0);
        assert_eq!(top[1].cluster, 1);
        assert_eq!(top[1].gene_id, "marker");
        assert!(top[1].avg_log2fc < 0.0);
        assert!(top[0].p_value < 1e-3);
        assert!((top[0].auc - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_positive_only() {
        let (norm, clusters) = two_clusters();
        let table = find_markers(&norm, &clusters, &MarkerParams::default()).unwrap();
        assert_eq!(table.cluster_rows(0).len(), 1);
        assert!(table.cluster_rows(1).is_empty());
    }

    #[test]
    fn test_small_cluster_is_reported() {
        let (norm, _) = two_clusters();
        let labels = (0..20).map(|j| if j < 18 { 0 } else { 1 }).collect();
        let clusters = assignment(labels, 2);
        let table = find_markers(&norm, &clusters, &MarkerParams::default()).unwrap();

        let skipped: Vec<&MarkerRow> = table.rows.iter().filter(|r| r.cluster == 1).collect();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].status, MarkerStatus::InsufficientData { n_members: 2 });
        // cluster 0 is skipped as well, its complement is too small
        assert_eq!(table.warnings.len(), 2);
        assert_eq!(table.rows.len(), 2);
    }

    #[test]
    fn test_sorted_within_cluster() {
        let (norm, clusters) = two_clusters();
        let params = MarkerParams {
            min_pct: 0.0,
            min_logfc: 0.0,
            only_positive: false,
        };
        let table = find_markers(&norm, &clusters, &params).unwrap();
        let rows = table.cluster_rows(0);
        assert_eq!(rows.len(), 3);
        for w in rows.windows(2) {
            assert!(w[0].avg_log2fc >= w[1].avg_log2fc);
        }
        assert!(rows.iter().all(|r| r.p_adj >= r.p_value));
    }
}
