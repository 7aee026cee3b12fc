use faer::MatRef;
use rayon::prelude::*;
use std::time::Instant;

use crate::config::PipelineConfig;
use crate::core::graph::knn::{exact_knn, KnnResult};
use crate::core::graph::leiden::Graph;
use crate::error::{Result, ScError};

const STAGE: &str = "snn";

////////////
// Params //
////////////

/// Parameters of the shared nearest neighbour graph
///
/// ### Fields
///
/// * `k` - Number of nearest neighbours.
/// * `dims` - Number of leading components to use. `None` uses all.
/// * `pruning` - Edges with a Jaccard similarity at or below this are
///   removed, unless the two nodes are kNN neighbours.
#[derive(Clone, Debug, PartialEq)]
pub struct SnnParams {
    pub k: usize,
    pub dims: Option<usize>,
    pub pruning: f64,
}

impl Default for SnnParams {
    fn default() -> Self {
        (&PipelineConfig::default()).into()
    }
}

impl From<&PipelineConfig> for SnnParams {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            k: config.neighbor_k,
            dims: config.neighbor_dims,
            pruning: config.snn_prune,
        }
    }
}

////////////////
// Structures //
////////////////

/// Weighted, undirected shared nearest neighbour graph
///
/// ### Fields
///
/// * `obs_ids` - Identifiers of the nodes.
/// * `knn` - The underlying kNN search result.
/// * `adjacency` - For every node its `(neighbour, weight)` pairs, sorted by
///   neighbour index. Every edge is stored in both directions.
#[derive(Clone, Debug)]
pub struct NeighbourGraph {
    pub obs_ids: Vec<String>,
    pub knn: KnnResult,
    pub adjacency: Vec<Vec<(usize, f64)>>,
}

impl NeighbourGraph {
    /// Number of nodes
    pub fn n_nodes(&self) -> usize {
        self.adjacency.len()
    }

    /// Number of undirected edges
    pub fn n_edges(&self) -> usize {
        self.adjacency.iter().map(|a| a.len()).sum::<usize>() / 2
    }

    /// Weight of the edge between `u` and `v` if present
    pub fn weight(&self, u: usize, v: usize) -> Option<f64> {
        let adj = &self.adjacency[u];
        adj.binary_search_by_key(&v, |&(n, _)| n)
            .ok()
            .map(|pos| adj[pos].1)
    }

    /// Is every edge present in both directions with the same weight
    pub fn is_symmetric(&self) -> bool {
        self.adjacency
            .iter()
            .enumerate()
            .all(|(u, adj)| adj.iter().all(|&(v, w)| self.weight(v, u) == Some(w)))
    }

    /// Convert into the graph structure of the community detection
    pub fn to_graph(&self) -> Graph {
        Graph::from_adjacency(self.adjacency.clone())
    }
}

///////////////
// Functions //
///////////////

/// Jaccard shared nearest neighbour edges from a kNN result
///
/// Every node counts as a member of its own neighbourhood, so the Jaccard
/// similarity of two nodes is `s / (2 * (k + 1) - s)` with `s` the size of
/// the intersection. Neighbourhoods are matched via a reverse mapping so that
/// only pairs sharing at least one neighbour are visited. A pair where either
/// node is in the other's kNN list always shares itself and is always kept.
///
/// ### Params
///
/// * `knn` - The kNN result.
/// * `pruning` - Other pairs need a weight above this.
///
/// ### Returns
///
/// Vector of `(i, j, weight)` with `i > j`, sorted by `(i, j)`.
pub fn snn_edges(knn: &KnnResult, pruning: f64) -> Vec<(usize, usize, f64)> {
    let n = knn.n_points();
    let k = knn.k();

    // reverse_mappings[m] = all nodes that have m in their (self-including)
    // neighbourhood
    let mut reverse_mappings: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        reverse_mappings[i].push(i);
        for &neighbour in &knn.indices[i] {
            reverse_mappings[neighbour].push(i);
        }
    }

    (0..n)
        .into_par_iter()
        .flat_map_iter(|j| {
            let mut scores = vec![0usize; n];
            let mut added = Vec::new();

            let own = std::iter::once(j).chain(knn.indices[j].iter().copied());
            for member in own {
                for &other in &reverse_mappings[member] {
                    if other < j {
                        if scores[other] == 0 {
                            added.push(other);
                        }
                        scores[other] += 1;
                    }
                }
            }

            added.sort_unstable();
            added
                .into_iter()
                .filter_map(|other| {
                    let shared = scores[other] as f64;
                    let weight = shared / (2.0 * (k as f64 + 1.0) - shared);
                    let is_knn_pair =
                        knn.indices[j].contains(&other) || knn.indices[other].contains(&j);
                    if is_knn_pair || weight > pruning {
                        Some((j, other, weight))
                    } else {
                        None
                    }
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Build the shared nearest neighbour graph on an embedding
///
/// ### Params
///
/// * `embedding` - Observations x dimensions, already restricted to the
///   components to use.
/// * `obs_ids` - Identifiers of the rows.
/// * `params` - The `SnnParams` (`dims` is not applied here).
///
/// ### Returns
///
/// The `NeighbourGraph`
pub fn build_snn_graph(embedding: MatRef<f64>, obs_ids: &[String], params: &SnnParams) -> Result<NeighbourGraph> {
    if embedding.nrows() != obs_ids.len() {
        return Err(ScError::input(
            STAGE,
            format!(
                "{} rows but {} observation ids",
                embedding.nrows(),
                obs_ids.len()
            ),
        ));
    }
    if !(0.0..1.0).contains(&params.pruning) {
        return Err(ScError::config("snn_prune", "must be in [0, 1)"));
    }

    let start = Instant::now();

    let knn = exact_knn(embedding, obs_ids, params.k)?;
    let edges = snn_edges(&knn, params.pruning);

    let mut adjacency: Vec<Vec<(usize, f64)>> = vec![Vec::new(); obs_ids.len()];
    for &(i, j, w) in &edges {
        adjacency[i].push((j, w));
        adjacency[j].push((i, w));
    }
    adjacency
        .par_iter_mut()
        .for_each(|adj| adj.sort_unstable_by_key(|&(n, _)| n));

    log::info!(
        "SNN graph (k = {}) with {} nodes and {} edges in {:.2?}",
        params.k,
        obs_ids.len(),
        edges.len(),
        start.elapsed()
    );

    Ok(NeighbourGraph {
        obs_ids: obs_ids.to_vec(),
        knn,
        adjacency,
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use faer::Mat;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("c{}", i)).collect()
    }

    /// Two well separated groups of ten points on a line
    fn two_groups() -> Mat<f64> {
        Mat::from_fn(20, 2, |i, j| {
            let offset = if i < 10 { 0.0 } else { 100.0 };
            if j == 0 {
                offset + i as f64
            } else {
                ((i * 3) % 5) as f64 * 0.1
            }
        })
    }

    fn jaccard(a: &[usize], b: &[usize]) -> f64 {
        let inter = a.iter().filter(|x| b.contains(x)).count() as f64;
        let union = (a.len() + b.len()) as f64 - inter;
        inter / union
    }

    #[test]
    fn test_snn_symmetric() {
        let params = SnnParams {
            k: 4,
            dims: None,
            pruning: 0.0,
        };
        let graph = build_snn_graph(two_groups().as_ref(), &ids(20), &params).unwrap();
        assert!(graph.is_symmetric());
        assert!(graph.n_edges() > 0);
    }

    #[test]
    fn test_snn_weights_are_jaccard() {
        let mat = two_groups();
        let params = SnnParams {
            k: 4,
            dims: None,
            pruning: 0.0,
        };
        let graph = build_snn_graph(mat.as_ref(), &ids(20), &params).unwrap();
        let hood = |i: usize| {
            let mut v = vec![i];
            v.extend(graph.knn.indices[i].iter().copied());
            v
        };
        for u in 0..20 {
            for &(v, w) in &graph.adjacency[u] {
                assert_relative_eq!(w, jaccard(&hood(u), &hood(v)), epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_snn_groups_disconnected() {
        let params = SnnParams {
            k: 4,
            dims: None,
            pruning: 0.0,
        };
        let graph = build_snn_graph(two_groups().as_ref(), &ids(20), &params).unwrap();
        for u in 0..10 {
            assert!(graph.adjacency[u].iter().all(|&(v, _)| v < 10));
        }
    }

    #[test]
    fn test_pruning_removes_edges() {
        let mat = two_groups();
        let loose = SnnParams {
            k: 4,
            dims: None,
            pruning: 0.0,
        };
        let strict = SnnParams {
            pruning: 0.5,
            ..loose.clone()
        };
        let a = build_snn_graph(mat.as_ref(), &ids(20), &loose).unwrap();
        let b = build_snn_graph(mat.as_ref(), &ids(20), &strict).unwrap();
        assert!(b.n_edges() < a.n_edges());
        for u in 0..20 {
            for &(v, w) in &b.adjacency[u] {
                let is_knn_pair = b.knn.indices[u].contains(&v) || b.knn.indices[v].contains(&u);
                assert!(is_knn_pair || w > 0.5);
            }
        }
    }

    #[test]
    fn test_knn_pairs_always_connected() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(123);
        let mat = Mat::from_fn(200, 10, |_, _| rng.random::<f64>());
        let params = SnnParams::default();
        assert_eq!(params.k, 20);

        for strict in [params.clone(), SnnParams { pruning: 0.2, ..params }] {
            let graph = build_snn_graph(mat.as_ref(), &ids(200), &strict).unwrap();
            for (i, neighbours) in graph.knn.indices.iter().enumerate() {
                for &j in neighbours {
                    assert!(graph.weight(i, j).is_some(), "kNN pair ({}, {}) dropped", i, j);
                    assert!(graph.weight(j, i).is_some());
                }
            }
            assert!(graph.adjacency.iter().all(|adj| !adj.is_empty()));
            assert!(graph.is_symmetric());
        }
    }

    #[test]
    fn test_invalid_pruning() {
        let params = SnnParams {
            pruning: 1.0,
            ..SnnParams::default()
        };
        assert!(build_snn_graph(two_groups().as_ref(), &ids(20), &params).is_err());
    }

    #[test]
    fn test_mismatched_ids() {
        let params = SnnParams::default();
        assert!(build_snn_graph(two_groups().as_ref(), &ids(3), &params).is_err());
    }
}
