use rand::prelude::*;
use std::collections::VecDeque;
use std::time::Instant;

use crate::config::PipelineConfig;
use crate::error::{Result, ScError};

/// Minimum improvement for a node move to count
const GAIN_TOL: f64 = 1e-10;

////////////
// Params //
////////////

/// Parameters of the Leiden community detection
///
/// ### Fields
///
/// * `resolution` - Resolution of the modularity objective. Higher values
///   give more and smaller communities.
/// * `max_iterations` - Cap on the number of move/refine/aggregate passes.
/// * `seed` - Seed for the node orders.
#[derive(Clone, Debug, PartialEq)]
pub struct LeidenParams {
    pub resolution: f64,
    pub max_iterations: usize,
    pub seed: u64,
}

impl Default for LeidenParams {
    fn default() -> Self {
        Self {
            resolution: 0.8,
            max_iterations: 100,
            seed: 42,
        }
    }
}

impl From<&PipelineConfig> for LeidenParams {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            resolution: config.cluster_resolution,
            max_iterations: config.cluster_max_iterations,
            seed: config.random_seed,
        }
    }
}

impl LeidenParams {
    /// Check the parameters
    pub fn validate(&self) -> Result<()> {
        if !(self.resolution > 0.0 && self.resolution.is_finite()) {
            return Err(ScError::config(
                "cluster_resolution",
                format!("must be a finite value > 0, got {}", self.resolution),
            ));
        }
        if self.max_iterations == 0 {
            return Err(ScError::config("cluster_max_iterations", "must be > 0"));
        }
        Ok(())
    }
}

///////////
// Graph //
///////////

/// Weighted undirected graph for community detection
///
/// ### Fields
///
/// * `node_count` - Number of nodes.
/// * `adjacency` - Symmetric adjacency lists sorted by neighbour. A self loop
///   is stored once and holds the full diagonal entry `A_ii`.
/// * `node_weights` - Strength of every node, `k_i = sum_j A_ij`.
/// * `total_weight` - Sum of all strengths (twice the edge weight).
#[derive(Debug, Clone)]
pub struct Graph {
    pub node_count: usize,
    pub adjacency: Vec<Vec<(usize, f64)>>,
    pub node_weights: Vec<f64>,
    pub total_weight: f64,
}

impl Graph {
    /// Generate a graph from symmetric adjacency lists
    ///
    /// ### Params
    ///
    /// * `adjacency` - For each node the `(neighbour, weight)` pairs. Must be
    ///   symmetric. Lists are sorted internally.
    pub fn from_adjacency(adjacency: Vec<Vec<(usize, f64)>>) -> Self {
        let mut adjacency = adjacency;
        for neighbours in adjacency.iter_mut() {
            neighbours.sort_by_key(|&(j, _)| j);
        }
        let node_weights: Vec<f64> = adjacency
            .iter()
            .map(|neighbours| neighbours.iter().map(|(_, w)| w).sum::<f64>())
            .collect();
        let total_weight = node_weights.iter().sum();

        Self {
            node_count: adjacency.len(),
            adjacency,
            node_weights,
            total_weight,
        }
    }

    /// Generate a graph from an undirected edge list
    ///
    /// ### Params
    ///
    /// * `node_count` - Number of nodes (isolated nodes are allowed).
    /// * `edges` - `(from, to, weight)`; each edge is added in both directions.
    pub fn from_edges(node_count: usize, edges: &[(usize, usize, f64)]) -> Self {
        let mut adjacency: Vec<Vec<(usize, f64)>> = vec![Vec::new(); node_count];
        for &(f, t, w) in edges {
            adjacency[f].push((t, w));
            if f != t {
                adjacency[t].push((f, w));
            }
        }
        Self::from_adjacency(merge_duplicates(adjacency))
    }

    /// Neighbours of one node
    #[inline]
    pub fn neighbors(&self, node: usize) -> &[(usize, f64)] {
        &self.adjacency[node]
    }

    /// Number of undirected edges (self loops included)
    pub fn edge_count(&self) -> usize {
        self.adjacency
            .iter()
            .enumerate()
            .map(|(i, neighbours)| neighbours.iter().filter(|(j, _)| *j >= i).count())
            .sum()
    }
}

/// Sum the weights of repeated neighbours (lists get sorted)
fn merge_duplicates(adjacency: Vec<Vec<(usize, f64)>>) -> Vec<Vec<(usize, f64)>> {
    adjacency
        .into_iter()
        .map(|mut neighbours| {
            neighbours.sort_by_key(|&(j, _)| j);
            let mut merged: Vec<(usize, f64)> = Vec::with_capacity(neighbours.len());
            for (j, w) in neighbours {
                match merged.last_mut() {
                    Some(last) if last.0 == j => last.1 += w,
                    _ => merged.push((j, w)),
                }
            }
            merged
        })
        .collect()
}

////////////////
// Modularity //
////////////////

/// Resolution-scaled modularity of a partition
///
/// `Q = 1/(2m) * sum_c [ in_c - resolution * tot_c^2 / (2m) ]`
///
/// ### Params
///
/// * `graph` - The graph.
/// * `labels` - Community of every node.
/// * `resolution` - The resolution parameter.
///
/// ### Returns
///
/// The modularity (0 for a graph without edges).
pub fn modularity(graph: &Graph, labels: &[usize], resolution: f64) -> f64 {
    let two_m = graph.total_weight;
    if two_m <= 0.0 {
        return 0.0;
    }
    let n_comm = labels.iter().max().map(|x| x + 1).unwrap_or(0);
    let mut internal = vec![0.0; n_comm];
    let mut total = vec![0.0; n_comm];

    for node in 0..graph.node_count {
        let c = labels[node];
        total[c] += graph.node_weights[node];
        for &(neighbour, w) in graph.neighbors(node) {
            if labels[neighbour] == c {
                internal[c] += w;
            }
        }
    }

    internal
        .iter()
        .zip(total.iter())
        .map(|(&in_c, &tot_c)| in_c - resolution * tot_c * tot_c / two_m)
        .sum::<f64>()
        / two_m
}

/////////////
// Helpers //
/////////////

/// Renumber labels to `0..n` in order of first appearance
///
/// ### Returns
///
/// The number of distinct labels
fn renumber(labels: &mut [usize]) -> usize {
    let max = labels.iter().max().map(|x| x + 1).unwrap_or(0);
    let mut map = vec![usize::MAX; max];
    let mut next = 0;
    for l in labels.iter_mut() {
        if map[*l] == usize::MAX {
            map[*l] = next;
            next += 1;
        }
        *l = map[*l];
    }
    next
}

/// Relabel communities by descending size
///
/// Ties are broken by the smallest member index.
///
/// ### Params
///
/// * `labels` - Any labelling with values in `0..n`.
///
/// ### Returns
///
/// Tuple of `(new labels, number of communities)`
pub fn relabel_by_size(labels: &[usize]) -> (Vec<usize>, usize) {
    let mut labels = labels.to_vec();
    let n_comm = renumber(&mut labels);

    // renumbering by first appearance makes the label the smallest member
    // rank, so a stable sort on size alone keeps the tie order
    let mut sizes = vec![0usize; n_comm];
    for &l in &labels {
        sizes[l] += 1;
    }
    let mut order: Vec<usize> = (0..n_comm).collect();
    order.sort_by(|a, b| sizes[*b].cmp(&sizes[*a]));

    let mut new_id = vec![0; n_comm];
    for (rank, &c) in order.iter().enumerate() {
        new_id[c] = rank;
    }

    (labels.iter().map(|&l| new_id[l]).collect(), n_comm)
}

//////////////////
// Local moving //
//////////////////

/// Queue based local moving of nodes between communities
///
/// ### Params
///
/// * `graph` - The (possibly aggregated) graph.
/// * `partition` - Community of every node, values in `0..node_count`. Will
///   be updated in place.
/// * `resolution` - The resolution parameter.
/// * `rng` - Random number generator for the node order.
///
/// ### Returns
///
/// Whether any node changed community.
fn fast_local_moving(graph: &Graph, partition: &mut [usize], resolution: f64, rng: &mut StdRng) -> bool {
    let n = graph.node_count;
    let two_m = graph.total_weight;
    if two_m <= 0.0 || n == 0 {
        return false;
    }

    let mut comm_tot = vec![0.0; n];
    let mut comm_size = vec![0usize; n];
    for node in 0..n {
        comm_tot[partition[node]] += graph.node_weights[node];
        comm_size[partition[node]] += 1;
    }
    let mut empty: Vec<usize> = (0..n).rev().filter(|&c| comm_size[c] == 0).collect();

    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(rng);
    let mut queue: VecDeque<usize> = order.into();
    let mut in_queue = vec![true; n];

    let mut neigh_w = vec![0.0; n];
    let mut seen = vec![false; n];
    let mut touched: Vec<usize> = Vec::new();
    let mut changed = false;

    while let Some(v) = queue.pop_front() {
        in_queue[v] = false;
        let c_old = partition[v];
        let k_v = graph.node_weights[v];

        for &(u, w) in graph.neighbors(v) {
            if u == v {
                continue;
            }
            let c = partition[u];
            if !seen[c] {
                seen[c] = true;
                touched.push(c);
            }
            neigh_w[c] += w;
        }
        touched.sort_unstable();

        // take v out of its community
        comm_tot[c_old] -= k_v;
        comm_size[c_old] -= 1;

        let current_gain = neigh_w[c_old] - resolution * k_v * comm_tot[c_old] / two_m;
        let mut best_other: Option<(usize, f64)> = None;
        for &c in &touched {
            if c == c_old {
                continue;
            }
            let gain = neigh_w[c] - resolution * k_v * comm_tot[c] / two_m;
            if best_other.map_or(true, |(_, g)| gain > g) {
                best_other = Some((c, gain));
            }
        }

        let mut best = c_old;
        let mut best_gain = current_gain;
        if let Some((c, gain)) = best_other {
            if gain > current_gain + GAIN_TOL {
                best = c;
                best_gain = gain;
            }
        }
        // an empty community always has a gain of 0
        if best_gain < -GAIN_TOL && comm_size[c_old] > 0 {
            if let Some(c) = empty.pop() {
                best = c;
            }
        }

        comm_tot[best] += k_v;
        comm_size[best] += 1;
        if comm_size[c_old] == 0 && best != c_old {
            empty.push(c_old);
        }
        partition[v] = best;

        if best != c_old {
            changed = true;
            for &(u, _) in graph.neighbors(v) {
                if u != v && partition[u] != best && !in_queue[u] {
                    in_queue[u] = true;
                    queue.push_back(u);
                }
            }
        }

        for &c in &touched {
            neigh_w[c] = 0.0;
            seen[c] = false;
        }
        touched.clear();
    }

    changed
}

////////////////
// Refinement //
////////////////

/// Refine every community into well-connected sub-communities
///
/// Starts from singletons and greedily merges nodes that are still singletons
/// into well-connected sub-communities of the same community.
///
/// ### Params
///
/// * `graph` - The graph.
/// * `partition` - The partition after local moving (contiguous labels).
/// * `n_comm` - Number of communities in `partition`.
/// * `resolution` - The resolution parameter.
/// * `rng` - Random number generator for the node order.
///
/// ### Returns
///
/// The refined partition (labels not contiguous).
fn refine_partition(
    graph: &Graph,
    partition: &[usize],
    n_comm: usize,
    resolution: f64,
    rng: &mut StdRng,
) -> Vec<usize> {
    let n = graph.node_count;
    let two_m = graph.total_weight;
    let mut refined: Vec<usize> = (0..n).collect();
    if two_m <= 0.0 {
        return refined;
    }

    let mut comm_tot = vec![0.0; n_comm];
    for node in 0..n {
        comm_tot[partition[node]] += graph.node_weights[node];
    }

    let mut ref_tot = graph.node_weights.clone();
    let mut ref_size = vec![1usize; n];
    // weight from each sub-community to the rest of its community
    let mut ref_ext: Vec<f64> = (0..n)
        .map(|v| {
            graph
                .neighbors(v)
                .iter()
                .filter(|&&(u, _)| u != v && partition[u] == partition[v])
                .map(|(_, w)| w)
                .sum::<f64>()
        })
        .collect();

    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(rng);

    let mut neigh_w = vec![0.0; n];
    let mut seen = vec![false; n];
    let mut touched: Vec<usize> = Vec::new();

    for v in order {
        if ref_size[refined[v]] != 1 {
            continue;
        }
        let s = partition[v];
        let k_v = graph.node_weights[v];
        if ref_ext[v] < resolution * k_v * (comm_tot[s] - k_v) / two_m {
            continue;
        }

        for &(u, w) in graph.neighbors(v) {
            if u == v || partition[u] != s {
                continue;
            }
            let r = refined[u];
            if !seen[r] {
                seen[r] = true;
                touched.push(r);
            }
            neigh_w[r] += w;
        }
        touched.sort_unstable();

        let mut best: Option<(usize, f64)> = None;
        for &r in &touched {
            let well_connected =
                ref_ext[r] >= resolution * ref_tot[r] * (comm_tot[s] - ref_tot[r]) / two_m;
            if !well_connected {
                continue;
            }
            let gain = neigh_w[r] - resolution * k_v * ref_tot[r] / two_m;
            if gain >= 0.0 && best.map_or(true, |(_, g)| gain > g) {
                best = Some((r, gain));
            }
        }

        if let Some((r, _)) = best {
            let own = refined[v];
            ref_ext[r] = ref_ext[r] + ref_ext[own] - 2.0 * neigh_w[r];
            ref_tot[r] += k_v;
            ref_size[r] += 1;
            ref_tot[own] = 0.0;
            ref_ext[own] = 0.0;
            ref_size[own] = 0;
            refined[v] = r;
        }

        for &r in &touched {
            neigh_w[r] = 0.0;
            seen[r] = false;
        }
        touched.clear();
    }

    refined
}

/////////////////
// Aggregation //
/////////////////

/// Collapse every community into one node
///
/// ### Params
///
/// * `graph` - The graph.
/// * `labels` - Contiguous community labels.
/// * `n_comm` - Number of communities.
fn aggregate_graph(graph: &Graph, labels: &[usize], n_comm: usize) -> Graph {
    let mut adjacency: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n_comm];
    for node in 0..graph.node_count {
        let c = labels[node];
        for &(neighbour, w) in graph.neighbors(node) {
            adjacency[c].push((labels[neighbour], w));
        }
    }
    Graph::from_adjacency(merge_duplicates(adjacency))
}

//////////
// Main //
//////////

/// Result of the Leiden community detection
///
/// ### Fields
///
/// * `labels` - Community of every node, `0` being the largest.
/// * `n_communities` - Number of communities.
/// * `modularity` - Modularity (at the used resolution) of the labels.
/// * `iterations` - Number of passes that were run.
/// * `converged` - `false` if the iteration cap was hit.
#[derive(Clone, Debug, PartialEq)]
pub struct LeidenResult {
    pub labels: Vec<usize>,
    pub n_communities: usize,
    pub modularity: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Leiden community detection
///
/// Every pass runs local moving, refinement of the found communities into
/// well-connected sub-communities and aggregation of the refined partition,
/// with the non-refined partition as the start of the next pass. When the
/// refinement cannot merge anything the pass aggregates the moved partition
/// directly. The procedure stops once local moving leaves every node of the
/// aggregated graph in its own community.
///
/// ### Params
///
/// * `graph` - The graph.
/// * `params` - The `LeidenParams`.
///
/// ### Returns
///
/// The `LeidenResult`
pub fn leiden_clustering(graph: &Graph, params: &LeidenParams) -> Result<LeidenResult> {
    params.validate()?;

    let start = Instant::now();
    let n = graph.node_count;
    let mut rng = StdRng::seed_from_u64(params.seed);

    log::debug!(
        "Leiden clustering on {} nodes and {} edges (resolution {})",
        n,
        graph.edge_count(),
        params.resolution
    );

    let mut membership: Vec<usize> = (0..n).collect();
    let mut current = graph.clone();
    let mut partition: Vec<usize> = (0..n).collect();
    let mut converged = false;
    let mut iterations = 0;

    while iterations < params.max_iterations {
        iterations += 1;

        fast_local_moving(&current, &mut partition, params.resolution, &mut rng);
        let n_comm = renumber(&mut partition);

        log::debug!(
            "Iteration {}: {} communities on {} aggregated nodes",
            iterations,
            n_comm,
            current.node_count
        );

        if n_comm == current.node_count {
            converged = true;
            break;
        }

        let mut refined = refine_partition(&current, &partition, n_comm, params.resolution, &mut rng);
        let n_refined = renumber(&mut refined);

        let (agg_labels, n_agg) = if n_refined < current.node_count {
            (refined, n_refined)
        } else {
            (partition.clone(), n_comm)
        };

        // every aggregated node starts in the community of its members
        let mut next_partition = vec![0; n_agg];
        for node in 0..current.node_count {
            next_partition[agg_labels[node]] = partition[node];
        }

        current = aggregate_graph(&current, &agg_labels, n_agg);
        for m in membership.iter_mut() {
            *m = agg_labels[*m];
        }
        partition = next_partition;
    }

    let raw: Vec<usize> = membership.iter().map(|&m| partition[m]).collect();
    let (labels, n_communities) = relabel_by_size(&raw);
    let q = modularity(graph, &labels, params.resolution);

    log::debug!(
        "Leiden found {} communities (Q = {:.4}) in {} iterations: {:.2?}",
        n_communities,
        q,
        iterations,
        start.elapsed()
    );

    Ok(LeidenResult {
        labels,
        n_communities,
        modularity: q,
        iterations,
        converged,
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    /// Planted partition graph with unit weights
    fn planted_partition(sizes: &[usize], p_in: f64, p_out: f64, seed: u64) -> Graph {
        let mut rng = StdRng::seed_from_u64(seed);
        let block: Vec<usize> = sizes
            .iter()
            .enumerate()
            .flat_map(|(b, &size)| std::iter::repeat(b).take(size))
            .collect();
        let n = block.len();

        let mut edges = Vec::new();
        for i in 0..n {
            for j in (i + 1)..n {
                let p = if block[i] == block[j] { p_in } else { p_out };
                if rng.random::<f64>() < p {
                    edges.push((i, j, 1.0));
                }
            }
        }
        Graph::from_edges(n, &edges)
    }

    /// Cliques joined into a ring by weak bridges
    fn clique_ring(n_cliques: usize, size: usize) -> Graph {
        let n = n_cliques * size;
        let mut edges: Vec<(usize, usize, f64)> = (0..n_cliques)
            .flat_map(|c| {
                let end = (c + 1) * size;
                (c * size..end).flat_map(move |i| ((i + 1)..end).map(move |j| (i, j, 1.0)))
            })
            .collect();
        if n_cliques > 1 {
            for c in 0..n_cliques {
                let next = (c + 1) % n_cliques;
                if n_cliques == 2 && c == 1 {
                    break;
                }
                edges.push(((c + 1) * size - 1, next * size, 0.1));
            }
        }
        Graph::from_edges(n, &edges)
    }

    fn params(resolution: f64) -> LeidenParams {
        LeidenParams {
            resolution,
            max_iterations: 100,
            seed: 42,
        }
    }

    #[test]
    fn test_ring_of_cliques() {
        let graph = clique_ring(4, 5);
        let res = leiden_clustering(&graph, &params(1.0)).unwrap();

        assert_eq!(res.n_communities, 4);
        assert!(res.converged);
        for clique in 0..4 {
            let label = res.labels[clique * 5];
            assert!(res.labels[clique * 5..(clique + 1) * 5].iter().all(|&l| l == label));
        }
    }

    #[test]
    fn test_clear_communities() {
        let graph = planted_partition(&[10, 10, 10], 0.8, 0.05, 42);
        let res = leiden_clustering(&graph, &params(1.0)).unwrap();

        assert!(
            (2..=4).contains(&res.n_communities),
            "Expected 2-4 communities, got {}",
            res.n_communities
        );
        assert!(res.modularity > 0.3);
    }

    #[test]
    fn test_single_clique() {
        let graph = clique_ring(1, 10);
        let res = leiden_clustering(&graph, &params(1.0)).unwrap();
        assert_eq!(res.n_communities, 1);
        assert!(res.labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn test_resolution_effects() {
        let graph = planted_partition(&[8, 8, 8], 0.7, 0.1, 42);

        let low = leiden_clustering(&graph, &params(0.1)).unwrap();
        let mid = leiden_clustering(&graph, &params(1.0)).unwrap();
        let high = leiden_clustering(&graph, &params(3.0)).unwrap();

        assert!(low.n_communities <= mid.n_communities);
        assert!(mid.n_communities <= high.n_communities);
    }

    #[test]
    fn test_deterministic_with_seed() {
        let graph = planted_partition(&[12, 9, 15], 0.5, 0.08, 7);
        let a = leiden_clustering(&graph, &params(1.0)).unwrap();
        let b = leiden_clustering(&graph, &params(1.0)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_labels_ordered_by_size() {
        let graph = planted_partition(&[5, 12, 8], 0.9, 0.01, 3);
        let res = leiden_clustering(&graph, &params(1.0)).unwrap();
        let mut sizes = vec![0; res.n_communities];
        for &l in &res.labels {
            sizes[l] += 1;
        }
        assert!(sizes.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_isolated_nodes_are_singletons() {
        let graph = Graph::from_edges(5, &[(0, 1, 1.0), (1, 2, 1.0), (0, 2, 1.0)]);
        let res = leiden_clustering(&graph, &params(1.0)).unwrap();
        assert_eq!(res.n_communities, 3);
        assert_eq!(res.labels[0], 0);
        assert_eq!(res.labels[0], res.labels[2]);
        assert_ne!(res.labels[3], res.labels[4]);
    }

    #[test]
    fn test_modularity_calculation() {
        let graph = Graph::from_edges(4, &[(0, 1, 1.0), (1, 2, 1.0), (2, 3, 1.0), (3, 0, 1.0)]);

        let separate = modularity(&graph, &[0, 1, 2, 3], 1.0);
        let together = modularity(&graph, &[0, 0, 0, 0], 1.0);

        assert!((separate + 0.25).abs() < 1e-12);
        assert!(together.abs() < 1e-12);
        assert!(together > separate);
    }

    #[test]
    fn test_invalid_resolution() {
        let graph = clique_ring(2, 3);
        assert!(leiden_clustering(&graph, &params(0.0)).is_err());
    }

    #[test]
    fn test_relabel_by_size() {
        let (labels, n) = relabel_by_size(&[7, 3, 3, 9, 7, 3]);
        assert_eq!(n, 3);
        assert_eq!(labels, vec![1, 0, 0, 2, 1, 0]);
    }
}
