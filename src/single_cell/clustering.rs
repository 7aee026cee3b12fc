use rustc_hash::FxHashMap;
use std::time::Instant;

use crate::core::graph::leiden::{leiden_clustering, LeidenParams, LeidenResult};
use crate::error::{Result, StageWarning};
use crate::single_cell::sc_knn_snn::NeighbourGraph;

const STAGE: &str = "leiden";

/// Cluster label of every observation
///
/// ### Fields
///
/// * `obs_ids` - The observation identifiers.
/// * `labels` - Cluster per observation, contiguous from `0` and ordered by
///   descending cluster size.
/// * `n_clusters` - Number of clusters.
/// * `modularity` - Achieved modularity at the used resolution.
/// * `iterations` - Number of passes of the community detection.
/// * `warnings` - Non-fatal warnings (non-convergence).
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterAssignment {
    pub obs_ids: Vec<String>,
    pub labels: Vec<usize>,
    pub n_clusters: usize,
    pub modularity: f64,
    pub iterations: usize,
    pub warnings: Vec<StageWarning>,
}

impl ClusterAssignment {
    /// Number of observations per cluster
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.n_clusters];
        for &l in &self.labels {
            sizes[l] += 1;
        }
        sizes
    }

    /// Indices of the observations in a cluster
    pub fn members(&self, cluster: usize) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l == cluster)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Cluster the observations on the shared nearest neighbour graph
///
/// Hitting the iteration cap is not an error: the best partition found is
/// returned together with a `NonConvergence` warning.
///
/// ### Params
///
/// * `graph` - The `NeighbourGraph`.
/// * `params` - The `LeidenParams`.
///
/// ### Returns
///
/// The `ClusterAssignment`
pub fn cluster_observations(graph: &NeighbourGraph, params: &LeidenParams) -> Result<ClusterAssignment> {
    let start = Instant::now();

    let LeidenResult {
        labels,
        n_communities,
        modularity,
        iterations,
        converged,
    } = leiden_clustering(&graph.to_graph(), params)?;

    let mut warnings = Vec::new();
    if !converged {
        let warning = StageWarning::NonConvergence {
            stage: STAGE,
            iterations,
        };
        warning.log();
        warnings.push(warning);
    }

    log::info!(
        "Found {} clusters at resolution {} (modularity {:.4}) in {:.2?}",
        n_communities,
        params.resolution,
        modularity,
        start.elapsed()
    );

    Ok(ClusterAssignment {
        obs_ids: graph.obs_ids.clone(),
        labels,
        n_clusters: n_communities,
        modularity,
        iterations,
        warnings,
    })
}

/// Translate cluster labels into names
///
/// ### Params
///
/// * `assignment` - The `ClusterAssignment`.
/// * `names` - Caller provided cluster id to name table.
///
/// ### Returns
///
/// One name per observation. Clusters absent from `names` keep their numeric
/// label.
pub fn annotate_clusters(assignment: &ClusterAssignment, names: &FxHashMap<usize, String>) -> Vec<String> {
    let missing: Vec<usize> = (0..assignment.n_clusters)
        .filter(|c| !names.contains_key(c))
        .collect();
    if !missing.is_empty() {
        log::debug!("No annotation for clusters {:?}", missing);
    }

    assignment
        .labels
        .iter()
        .map(|l| names.get(l).cloned().unwrap_or_else(|| l.to_string()))
        .collect()
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::single_cell::sc_knn_snn::{build_snn_graph, SnnParams};
    use faer::Mat;

    fn graph() -> NeighbourGraph {
        // three groups of 15 points, far apart
        let mat = Mat::from_fn(45, 2, |i, j| {
            let group = (i / 15) as f64;
            let within = (i % 15) as f64;
            if j == 0 {
                group * 1000.0 + (within % 5.0)
            } else {
                within / 5.0
            }
        });
        let ids: Vec<String> = (0..45).map(|i| format!("c{}", i)).collect();
        let params = SnnParams {
            k: 5,
            dims: None,
            pruning: 0.0,
        };
        build_snn_graph(mat.as_ref(), &ids, &params).unwrap()
    }

    #[test]
    fn test_every_observation_has_one_cluster() {
        let res = cluster_observations(&graph(), &LeidenParams::default()).unwrap();
        assert_eq!(res.labels.len(), 45);
        assert!(res.labels.iter().all(|&l| l < res.n_clusters));
        assert_eq!(res.cluster_sizes().iter().sum::<usize>(), 45);
        assert!(res.n_clusters >= 3);
        // the groups never share a cluster
        for a in 0..15 {
            assert_ne!(res.labels[a], res.labels[a + 15]);
            assert_ne!(res.labels[a + 15], res.labels[a + 30]);
        }
    }

    #[test]
    fn test_sizes_descending() {
        let res = cluster_observations(&graph(), &LeidenParams::default()).unwrap();
        let sizes = res.cluster_sizes();
        for w in sizes.windows(2) {
            assert!(w[0] >= w[1]);
        }
        assert_eq!(res.members(0).len(), sizes[0]);
    }

    #[test]
    fn test_non_convergence_is_a_warning() {
        let params = LeidenParams {
            max_iterations: 1,
            ..Default::default()
        };
        let res = cluster_observations(&graph(), &params).unwrap();
        assert_eq!(res.iterations, 1);
        assert_eq!(res.warnings.len(), 1);
        assert!(matches!(res.warnings[0], StageWarning::NonConvergence { .. }));
    }

    #[test]
    fn test_annotate_clusters() {
        let res = cluster_observations(&graph(), &LeidenParams::default()).unwrap();
        let mut names = FxHashMap::default();
        names.insert(0, "T cells".to_string());
        let annotated = annotate_clusters(&res, &names);
        assert_eq!(annotated.len(), 45);
        for (label, name) in res.labels.iter().zip(&annotated) {
            if *label == 0 {
                assert_eq!(name, "T cells");
            } else {
                assert_eq!(name, &label.to_string());
            }
        }
    }
}
