use faer::MatRef;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::error::{Result, ScError};

const STAGE: &str = "knn";

/////////////
// Helpers //
/////////////

/// Helper struct for kNN with heap
///
/// ### Fields
///
/// * `index` - Index position of that neighbour
/// * `rank` - Position of the neighbour's identifier in sorted id order
/// * `distance` - Squared Euclidean distance to that neighbour
#[derive(Debug, Clone, Copy)]
struct DistanceItem {
    index: usize,
    rank: usize,
    distance: f64,
}

impl Eq for DistanceItem {}

impl PartialEq for DistanceItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

/// Ordered by distance, then by identifier rank, so that the max-heap always
/// pops the farthest (and on ties the later id) candidate.
impl Ord for DistanceItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.rank.cmp(&other.rank))
    }
}

impl PartialOrd for DistanceItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

////////////////
// Structures //
////////////////

/// Result of an exact kNN search
///
/// ### Fields
///
/// * `indices` - For each point the indices of its `k` nearest neighbours,
///   nearest first. The point itself is never included.
/// * `distances` - The matching Euclidean distances.
#[derive(Clone, Debug, PartialEq)]
pub struct KnnResult {
    pub indices: Vec<Vec<usize>>,
    pub distances: Vec<Vec<f64>>,
}

impl KnnResult {
    /// Number of points
    pub fn n_points(&self) -> usize {
        self.indices.len()
    }

    /// Number of neighbours per point
    pub fn k(&self) -> usize {
        self.indices.first().map(|v| v.len()).unwrap_or(0)
    }
}

///////////////
// Functions //
///////////////

/// Squared Euclidean distance between two rows
#[inline]
fn squared_distance(mat: &MatRef<f64>, i: usize, j: usize) -> f64 {
    let mut sum = 0.0;
    for c in 0..mat.ncols() {
        let diff = mat[(i, c)] - mat[(j, c)];
        sum += diff * diff;
    }
    sum
}

/// Rank of every identifier in lexicographic order
///
/// Identifiers are unique wherever they come from, equal ids would fall
/// back to their row order.
fn id_ranks(obs_ids: &[String]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..obs_ids.len()).collect();
    order.sort_by(|&a, &b| obs_ids[a].cmp(&obs_ids[b]).then(a.cmp(&b)));
    let mut ranks = vec![0; obs_ids.len()];
    for (rank, idx) in order.into_iter().enumerate() {
        ranks[idx] = rank;
    }
    ranks
}

/// Exact k-nearest neighbour search (brute force)
///
/// Ties at the k-th neighbour are broken by observation id order, so the
/// neighbour sets do not depend on how the rows are stored.
///
/// ### Params
///
/// * `mat` - Matrix in which rows represent the samples and columns the
///   respective embedding dimensions.
/// * `obs_ids` - Identifiers of the rows.
/// * `k` - Number of neighbours.
///
/// ### Returns
///
/// The `KnnResult`
pub fn exact_knn(mat: MatRef<f64>, obs_ids: &[String], k: usize) -> Result<KnnResult> {
    let n = mat.nrows();
    if obs_ids.len() != n {
        return Err(ScError::input(
            STAGE,
            format!("{} rows but {} observation ids", n, obs_ids.len()),
        ));
    }
    if k == 0 {
        return Err(ScError::config("neighbor_k", "must be > 0"));
    }
    if k >= n {
        return Err(ScError::input(
            STAGE,
            format!("k = {} requires more than {} observations", k, n),
        ));
    }

    let start = Instant::now();
    let ranks = id_ranks(obs_ids);

    let rows: Vec<(Vec<usize>, Vec<f64>)> = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut heap = BinaryHeap::with_capacity(k + 1);
            for j in 0..n {
                if i == j {
                    continue;
                }
                heap.push(DistanceItem {
                    index: j,
                    rank: ranks[j],
                    distance: squared_distance(&mat, i, j),
                });
                if heap.len() > k {
                    heap.pop();
                }
            }
            heap.into_sorted_vec()
                .into_iter()
                .map(|item| (item.index, item.distance.sqrt()))
                .unzip()
        })
        .collect();

    let (indices, distances) = rows.into_iter().unzip();

    log::debug!("Exact kNN search (n = {}, k = {}): {:.2?}", n, k, start.elapsed());

    Ok(KnnResult { indices, distances })
}

/// Symmetric binary adjacency from a kNN result
///
/// `i` and `j` are connected if either is among the other's neighbours.
///
/// ### Params
///
/// * `knn` - The kNN result.
///
/// ### Returns
///
/// Sorted adjacency lists.
pub fn symmetric_knn_adjacency(knn: &KnnResult) -> Vec<Vec<usize>> {
    let n = knn.n_points();
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, neighbours) in knn.indices.iter().enumerate() {
        for &j in neighbours {
            adjacency[i].push(j);
            adjacency[j].push(i);
        }
    }
    adjacency.par_iter_mut().for_each(|adj| {
        adj.sort_unstable();
        adj.dedup();
    });
    adjacency
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use faer::Mat;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("c{:02}", i)).collect()
    }

    #[test]
    fn test_knn_line() {
        let mat = Mat::from_fn(5, 1, |i, _| i as f64);
        let knn = exact_knn(mat.as_ref(), &ids(5), 2).unwrap();

        // point 2 has 1 and 3 at distance 1; tie broken by index
        assert_eq!(knn.indices[2], vec![1, 3]);
        assert_eq!(knn.distances[2], vec![1.0, 1.0]);
        // point 0 has 1 and 2
        assert_eq!(knn.indices[0], vec![1, 2]);
        assert_eq!(knn.k(), 2);
    }

    #[test]
    fn test_knn_ties_follow_id_order() {
        // 0 at origin, 1..=4 all at distance 1
        let coords = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (-1.0, 0.0), (0.0, -1.0)];
        let mat = Mat::from_fn(5, 2, |i, j| if j == 0 { coords[i].0 } else { coords[i].1 });

        let sorted = exact_knn(mat.as_ref(), &ids(5), 2).unwrap();
        assert_eq!(sorted.indices[0], vec![1, 2]);

        // "c10" < "c2" < "c3" < "c4": rows 1 and 4 are the first ids
        let unsorted: Vec<String> = ["c0", "c3", "c4", "c2", "c10"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let knn = exact_knn(mat.as_ref(), &unsorted, 2).unwrap();
        assert_eq!(knn.indices[0], vec![4, 3]);
        assert_eq!(knn.distances[0], vec![1.0, 1.0]);
    }

    #[test]
    fn test_knn_invariant_to_row_order() {
        let coords = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (-1.0, 0.0), (0.0, -1.0)];
        let names = ["o", "b", "d", "a", "c"];
        let order = [4, 2, 0, 3, 1];

        let mat = Mat::from_fn(5, 2, |i, j| if j == 0 { coords[i].0 } else { coords[i].1 });
        let ids_a: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let permuted = Mat::from_fn(5, 2, |i, j| {
            let c = coords[order[i]];
            if j == 0 { c.0 } else { c.1 }
        });
        let ids_b: Vec<String> = order.iter().map(|&i| names[i].to_string()).collect();

        let a = exact_knn(mat.as_ref(), &ids_a, 2).unwrap();
        let b = exact_knn(permuted.as_ref(), &ids_b, 2).unwrap();

        let names_of = |knn: &KnnResult, row: usize, ids: &[String]| -> Vec<String> {
            knn.indices[row].iter().map(|&j| ids[j].clone()).collect()
        };
        // "o" is row 0 in a and row 2 in b
        assert_eq!(names_of(&a, 0, &ids_a), vec!["a", "b"]);
        assert_eq!(names_of(&b, 2, &ids_b), vec!["a", "b"]);
    }

    #[test]
    fn test_knn_invalid_k() {
        let mat = Mat::from_fn(3, 2, |i, j| (i + j) as f64);
        assert!(exact_knn(mat.as_ref(), &ids(3), 0).is_err());
        assert!(exact_knn(mat.as_ref(), &ids(3), 3).is_err());
        assert!(exact_knn(mat.as_ref(), &ids(2), 1).is_err());
    }

    #[test]
    fn test_symmetric_adjacency() {
        let mat = Mat::from_fn(4, 1, |i, _| [0.0, 1.0, 2.0, 10.0][i]);
        let knn = exact_knn(mat.as_ref(), &ids(4), 1).unwrap();
        let adj = symmetric_knn_adjacency(&knn);
        for (i, neighbours) in adj.iter().enumerate() {
            for &j in neighbours {
                assert!(adj[j].contains(&i));
            }
        }
        assert_eq!(adj[3], vec![2]);
    }
}
