//! # Spatial neighbor graph
//!
//! Builds the row-normalized k-nearest-neighbor adjacency used by the CAR
//! prior: a balanced 2-D k-d tree answers the neighbor queries, and the
//! finished graph is stored in compressed sparse row form. The graph is
//! symmetrized before normalization, so `i ~ j` implies `j ~ i` in structure.

use std::collections::BTreeSet;

use log::debug;
use thiserror::Error;

/// Errors returned while building the spatial weight graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("at least two centroids are required to build a neighbor graph")]
    TooFewCentroids,
    #[error("neighbor count k must be positive")]
    InvalidNeighborCount,
    #[error("centroid {index} contains non-finite coordinates")]
    NonFiniteCentroid { index: usize },
    #[error("graph is degenerate: nodes {nodes:?} have no neighbors")]
    DegenerateGraph { nodes: Vec<usize> },
}

/// Balanced 2-D k-d tree over area centroids, built by median split.
#[derive(Debug, Clone)]
pub struct KdTree {
    nodes: Vec<KdNode>,
    root: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct KdNode {
    point: [f64; 2],
    index: usize,
    axis: usize,
    left: Option<usize>,
    right: Option<usize>,
}

impl KdTree {
    /// Build a tree over `points`; node `i` keeps its original index `i`.
    #[must_use]
    pub fn build(points: &[[f64; 2]]) -> Self {
        let mut items = points
            .iter()
            .copied()
            .enumerate()
            .map(|(index, point)| (point, index))
            .collect::<Vec<_>>();
        let mut nodes = Vec::with_capacity(points.len());
        let root = Self::build_range(&mut items, 0, &mut nodes);
        Self { nodes, root }
    }

    fn build_range(
        items: &mut [([f64; 2], usize)],
        depth: usize,
        nodes: &mut Vec<KdNode>,
    ) -> Option<usize> {
        if items.is_empty() {
            return None;
        }
        let axis = depth % 2;
        let median = items.len() / 2;
        // Tie-break on the original index so the tree is deterministic for
        // duplicate coordinates.
        items.select_nth_unstable_by(median, |a, b| {
            a.0[axis].total_cmp(&b.0[axis]).then(a.1.cmp(&b.1))
        });
        let (point, index) = items[median];
        let (before, rest) = items.split_at_mut(median);
        let after = &mut rest[1..];
        let left = Self::build_range(before, depth + 1, nodes);
        let right = Self::build_range(after, depth + 1, nodes);
        nodes.push(KdNode {
            point,
            index,
            axis,
            left,
            right,
        });
        Some(nodes.len() - 1)
    }

    /// The `k` nearest points to `query`, excluding `skip` (the query point's
    /// own index). Returns `(original_index, squared_distance)` pairs sorted
    /// by distance; duplicate coordinates (distance zero) are valid hits.
    #[must_use]
    pub fn k_nearest(&self, query: [f64; 2], k: usize, skip: usize) -> Vec<(usize, f64)> {
        let mut best = NearestSet::new(k);
        if let Some(root) = self.root {
            self.search(root, query, skip, &mut best);
        }
        best.into_sorted()
    }

    fn search(&self, node_id: usize, query: [f64; 2], skip: usize, best: &mut NearestSet) {
        let node = self.nodes[node_id];
        if node.index != skip {
            best.offer(node.index, squared_distance(node.point, query));
        }
        let delta = query[node.axis] - node.point[node.axis];
        let (near, far) = if delta < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };
        if let Some(child) = near {
            self.search(child, query, skip, best);
        }
        // Only cross the splitting plane when the far half-space can still
        // hold a closer point.
        if let Some(child) = far
            && (!best.is_full() || delta * delta < best.worst())
        {
            self.search(child, query, skip, best);
        }
    }
}

/// Bounded best-candidate set kept sorted by squared distance.
#[derive(Debug)]
struct NearestSet {
    entries: Vec<(f64, usize)>,
    capacity: usize,
}

impl NearestSet {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity + 1),
            capacity,
        }
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    fn worst(&self) -> f64 {
        self.entries.last().map_or(f64::INFINITY, |entry| entry.0)
    }

    fn offer(&mut self, index: usize, squared_dist: f64) {
        if self.capacity == 0 || (self.is_full() && squared_dist >= self.worst()) {
            return;
        }
        let position = self
            .entries
            .partition_point(|entry| entry.0.total_cmp(&squared_dist).is_lt());
        self.entries.insert(position, (squared_dist, index));
        self.entries.truncate(self.capacity);
    }

    fn into_sorted(self) -> Vec<(usize, f64)> {
        self.entries
            .into_iter()
            .map(|(dist, index)| (index, dist))
            .collect()
    }
}

fn squared_distance(a: [f64; 2], b: [f64; 2]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    dx.mul_add(dx, dy * dy)
}

/// Symmetrized, row-normalized neighbor weights in compressed sparse row form.
///
/// The structure (which pairs are neighbors) is symmetric; the values are
/// `1 / degree(i)` per row, so every non-empty row sums to one. The matrix is
/// never densified.
#[derive(Debug, Clone)]
pub struct SpatialWeights {
    node_count: usize,
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
    values: Vec<f64>,
    component_count: usize,
}

impl SpatialWeights {
    /// Number of nodes (rows).
    #[must_use]
    pub const fn node_count(&self) -> usize {
        self.node_count
    }

    /// Number of stored directed edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.col_indices.len()
    }

    /// Number of connected components in the symmetrized structure.
    #[must_use]
    pub const fn component_count(&self) -> usize {
        self.component_count
    }

    /// Neighbor degree of node `i`.
    #[must_use]
    pub fn degree(&self, i: usize) -> usize {
        self.row_offsets[i + 1] - self.row_offsets[i]
    }

    /// Iterate the neighbors of node `i` as `(column, weight)` pairs.
    pub fn neighbors(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.row_offsets[i]..self.row_offsets[i + 1];
        self.col_indices[range.clone()]
            .iter()
            .zip(&self.values[range])
            .map(|(&col, &weight)| (col, weight))
    }

    /// Sparse matrix-vector product `out = W x`.
    ///
    /// # Panics
    ///
    /// Panics if `x` or `out` do not have `node_count` entries.
    pub fn mul_vec_into(&self, x: &[f64], out: &mut [f64]) {
        assert_eq!(x.len(), self.node_count);
        assert_eq!(out.len(), self.node_count);
        for (i, slot) in out.iter_mut().enumerate() {
            let mut acc = 0.0;
            for offset in self.row_offsets[i]..self.row_offsets[i + 1] {
                acc = self.values[offset].mul_add(x[self.col_indices[offset]], acc);
            }
            *slot = acc;
        }
    }

    /// Quadratic form `x^T W x` without materializing `W x`.
    #[must_use]
    pub fn quadratic_form(&self, x: &[f64]) -> f64 {
        let mut total = 0.0;
        for i in 0..self.node_count {
            let mut acc = 0.0;
            for offset in self.row_offsets[i]..self.row_offsets[i + 1] {
                acc = self.values[offset].mul_add(x[self.col_indices[offset]], acc);
            }
            total = x[i].mul_add(acc, total);
        }
        total
    }

    fn count_components(adjacency: &[BTreeSet<usize>]) -> usize {
        let n = adjacency.len();
        let mut visited = vec![false; n];
        let mut components = 0;
        let mut queue = Vec::new();
        for start in 0..n {
            if visited[start] {
                continue;
            }
            components += 1;
            visited[start] = true;
            queue.push(start);
            while let Some(node) = queue.pop() {
                for &next in &adjacency[node] {
                    if !visited[next] {
                        visited[next] = true;
                        queue.push(next);
                    }
                }
            }
        }
        components
    }
}

/// Builder for [`SpatialWeights`]: k-nearest-neighbor query, symmetrize,
/// row-normalize.
#[derive(Debug, Clone)]
pub struct SpatialWeightsBuilder {
    k: usize,
    allow_isolated: BTreeSet<usize>,
}

impl SpatialWeightsBuilder {
    /// Builder requesting `k` nearest neighbors per node.
    #[must_use]
    pub const fn new(k: usize) -> Self {
        Self {
            k,
            allow_isolated: BTreeSet::new(),
        }
    }

    /// Exempt specific node indices from the degenerate-graph check.
    #[must_use]
    pub fn allow_isolated<I: IntoIterator<Item = usize>>(mut self, indices: I) -> Self {
        self.allow_isolated.extend(indices);
        self
    }

    /// Build the symmetrized, row-normalized weight graph over `centroids`.
    ///
    /// When `centroids.len() <= k` every other point becomes a neighbor.
    ///
    /// # Errors
    ///
    /// Returns `GraphError` for empty or non-finite input, `k == 0`, or a
    /// node left without neighbors.
    pub fn build(&self, centroids: &[[f64; 2]]) -> Result<SpatialWeights, GraphError> {
        if self.k == 0 {
            return Err(GraphError::InvalidNeighborCount);
        }
        if centroids.len() < 2 {
            return Err(GraphError::TooFewCentroids);
        }
        for (index, centroid) in centroids.iter().enumerate() {
            if !(centroid[0].is_finite() && centroid[1].is_finite()) {
                return Err(GraphError::NonFiniteCentroid { index });
            }
        }

        let n = centroids.len();
        let k = self.k.min(n - 1);
        let tree = KdTree::build(centroids);

        let mut adjacency = vec![BTreeSet::new(); n];
        for (i, &centroid) in centroids.iter().enumerate() {
            for (j, _dist) in tree.k_nearest(centroid, k, i) {
                adjacency[i].insert(j);
                adjacency[j].insert(i);
            }
        }

        let isolated = adjacency
            .iter()
            .enumerate()
            .filter(|(index, neighbors)| {
                neighbors.is_empty() && !self.allow_isolated.contains(index)
            })
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        if !isolated.is_empty() {
            return Err(GraphError::DegenerateGraph { nodes: isolated });
        }

        let component_count = SpatialWeights::count_components(&adjacency);
        if component_count > 1 {
            debug!("spatial graph has {component_count} connected components");
        }

        let mut row_offsets = Vec::with_capacity(n + 1);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        row_offsets.push(0);
        for neighbors in &adjacency {
            let degree = neighbors.len();
            let weight = if degree == 0 {
                0.0
            } else {
                1.0 / usize_to_f64(degree)
            };
            for &j in neighbors {
                col_indices.push(j);
                values.push(weight);
            }
            row_offsets.push(col_indices.len());
        }

        Ok(SpatialWeights {
            node_count: n,
            row_offsets,
            col_indices,
            values,
            component_count,
        })
    }
}

fn usize_to_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn line_centroids(n: usize) -> Vec<[f64; 2]> {
        (0..n)
            .map(|i| [f64::from(u32::try_from(i).unwrap_or(u32::MAX)), 0.0])
            .collect()
    }

    fn brute_force_nearest(
        points: &[[f64; 2]],
        query: [f64; 2],
        k: usize,
        skip: usize,
    ) -> Vec<usize> {
        let mut distances = points
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != skip)
            .map(|(index, &point)| (squared_distance(point, query), index))
            .collect::<Vec<_>>();
        distances.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        distances.into_iter().take(k).map(|(_, index)| index).collect()
    }

    #[test]
    fn kd_tree_matches_brute_force() {
        // Deterministic scatter without an RNG dependency in the fixture.
        let points = (0..40)
            .map(|i| {
                let t = f64::from(i) * 0.7;
                [t.sin() * 3.0 + t * 0.1, t.cos() * 2.0]
            })
            .collect::<Vec<_>>();
        let tree = KdTree::build(&points);
        for (i, &query) in points.iter().enumerate() {
            let found = tree
                .k_nearest(query, 5, i)
                .into_iter()
                .map(|(index, _)| index)
                .collect::<Vec<_>>();
            let expected = brute_force_nearest(&points, query, 5, i);
            let mut found_sorted = found.clone();
            found_sorted.sort_unstable();
            let mut expected_sorted = expected.clone();
            expected_sorted.sort_unstable();
            assert_eq!(found_sorted, expected_sorted, "query {i}");
        }
    }

    #[test]
    fn kd_tree_accepts_duplicate_centroids() {
        let points = vec![[1.0, 1.0], [1.0, 1.0], [5.0, 5.0]];
        let tree = KdTree::build(&points);
        let nearest = tree.k_nearest([1.0, 1.0], 1, 0);
        assert_eq!(nearest.len(), 1);
        assert_eq!(nearest[0].0, 1);
        assert_relative_eq!(nearest[0].1, 0.0);
    }

    #[test]
    fn line_graph_with_k2_links_adjacent_points() {
        let weights = SpatialWeightsBuilder::new(2)
            .build(&line_centroids(6))
            .expect("line graph should build");
        // Interior points see both immediate neighbors; symmetrization keeps
        // the ends connected to their two closest points as well.
        let mid = weights.neighbors(3).map(|(j, _)| j).collect::<Vec<_>>();
        assert!(mid.contains(&2));
        assert!(mid.contains(&4));
        assert_eq!(weights.component_count(), 1);
    }

    #[test]
    fn structure_is_symmetric_and_rows_sum_to_one() {
        let points = (0..25)
            .map(|i| {
                let t = f64::from(i) * 1.3;
                [t.sin() * 4.0, (t * 0.5).cos() * 4.0]
            })
            .collect::<Vec<_>>();
        let weights = SpatialWeightsBuilder::new(4)
            .build(&points)
            .expect("graph should build");
        for i in 0..weights.node_count() {
            let mut row_sum = 0.0;
            for (j, w) in weights.neighbors(i) {
                row_sum += w;
                assert!(
                    weights.neighbors(j).any(|(back, _)| back == i),
                    "edge {i}->{j} lacks its reverse"
                );
            }
            assert_relative_eq!(row_sum, 1.0, epsilon = 1.0e-12);
        }
    }

    #[test]
    fn small_n_degrades_to_all_other_points() {
        let weights = SpatialWeightsBuilder::new(10)
            .build(&line_centroids(4))
            .expect("small graph should build");
        for i in 0..4 {
            assert_eq!(weights.degree(i), 3);
        }
    }

    #[test]
    fn build_rejects_invalid_inputs() {
        let error = SpatialWeightsBuilder::new(0)
            .build(&line_centroids(5))
            .expect_err("k = 0 must be rejected");
        assert_eq!(error, GraphError::InvalidNeighborCount);

        let error = SpatialWeightsBuilder::new(2)
            .build(&line_centroids(1))
            .expect_err("a single centroid must be rejected");
        assert_eq!(error, GraphError::TooFewCentroids);

        let mut points = line_centroids(3);
        points[2] = [f64::NAN, 0.0];
        let error = SpatialWeightsBuilder::new(2)
            .build(&points)
            .expect_err("non-finite centroids must be rejected");
        assert_eq!(error, GraphError::NonFiniteCentroid { index: 2 });
    }

    #[test]
    fn mul_vec_and_quadratic_form_agree() {
        let weights = SpatialWeightsBuilder::new(3)
            .build(&line_centroids(8))
            .expect("graph should build");
        let x = (0..8).map(|i| f64::from(i) * 0.25 - 1.0).collect::<Vec<_>>();
        let mut wx = vec![0.0; 8];
        weights.mul_vec_into(&x, &mut wx);
        let explicit = x.iter().zip(&wx).map(|(a, b)| a * b).sum::<f64>();
        assert_relative_eq!(weights.quadratic_form(&x), explicit, epsilon = 1.0e-12);
    }

    #[test]
    fn disconnected_clusters_are_counted() {
        let mut points = line_centroids(3);
        points.extend_from_slice(&[[100.0, 0.0], [101.0, 0.0], [102.0, 0.0]]);
        let weights = SpatialWeightsBuilder::new(2)
            .build(&points)
            .expect("two-cluster graph should build");
        assert_eq!(weights.component_count(), 2);
    }
}
