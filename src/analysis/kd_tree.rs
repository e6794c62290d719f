//! k-d tree over fixed-width `f32` descriptors.
//!
//! Built once per detection call over every block descriptor and then queried
//! for each block. Splits go along the dimension with the widest spread, which
//! keeps the tree useful for the low-frequency DCT descriptors where the DC
//! term dominates the range.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
};

#[derive(Debug, Clone)]
struct KdNode {
    point_idx: usize,
    split_dim: usize,
    split_value: f32,
    left: Option<usize>,
    right: Option<usize>,
}

/// A query hit: index into the indexed points and squared Euclidean distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub dist_sq: f32,
}

impl Eq for Neighbor {}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist_sq
            .total_cmp(&other.dist_sq)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
pub struct KdTree<'a> {
    points: &'a [f32],
    dim: usize,
    nodes: Vec<KdNode>,
}

impl<'a> KdTree<'a> {
    /// Indexes `points`, a flat buffer of `points.len() / dim` rows.
    /// Returns `None` for an empty buffer or zero dimension.
    pub fn build(points: &'a [f32], dim: usize) -> Option<Self> {
        if dim == 0 || points.len() < dim {
            return None;
        }

        let count = points.len() / dim;
        let mut indices = (0..count).collect::<Vec<_>>();
        let mut tree = Self {
            points,
            dim,
            nodes: Vec::with_capacity(count),
        };
        tree.build_recursive(&mut indices);

        Some(tree)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn point(&self, index: usize) -> &[f32] {
        &self.points[index * self.dim..(index + 1) * self.dim]
    }

    fn widest_dimension(&self, indices: &[usize]) -> usize {
        let mut best_dim = 0;
        let mut best_spread = f32::NEG_INFINITY;

        for d in 0..self.dim {
            let mut lo = f32::INFINITY;
            let mut hi = f32::NEG_INFINITY;
            for &i in indices {
                let v = self.points[i * self.dim + d];
                lo = lo.min(v);
                hi = hi.max(v);
            }
            if hi - lo > best_spread {
                best_spread = hi - lo;
                best_dim = d;
            }
        }

        best_dim
    }

    fn build_recursive(&mut self, indices: &mut [usize]) -> Option<usize> {
        if indices.is_empty() {
            return None;
        }

        let split_dim = self.widest_dimension(indices);
        let median = indices.len() / 2;
        let points = self.points;
        let dim = self.dim;
        indices.select_nth_unstable_by(median, |&a, &b| {
            points[a * dim + split_dim]
                .total_cmp(&points[b * dim + split_dim])
                .then(a.cmp(&b))
        });

        let point_idx = indices[median];
        let node_idx = self.nodes.len();
        self.nodes.push(KdNode {
            point_idx,
            split_dim,
            split_value: points[point_idx * dim + split_dim],
            left: None,
            right: None,
        });

        let (left_indices, right_part) = indices.split_at_mut(median);
        let left = self.build_recursive(left_indices);
        let right = self.build_recursive(&mut right_part[1..]);

        self.nodes[node_idx].left = left;
        self.nodes[node_idx].right = right;

        Some(node_idx)
    }

    /// The `k` nearest indexed points to `query`, closest first. Equal
    /// distances are ordered by index, except that a query with more than `k`
    /// exact duplicates keeps the first `k` it reaches.
    pub fn k_nearest(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        self.search(query, k, usize::MAX).neighbors
    }

    /// Best-bin-first search that examines at most `max_checks` nodes.
    ///
    /// Pending branches are explored in order of their distance lower bound.
    /// The search ends early once `k` zero-distance hits are held, so flat or
    /// repeated descriptors cost a single descent instead of a full scan.
    pub fn search(&self, query: &[f32], k: usize, max_checks: usize) -> KnnSearch {
        let mut checks = 0;
        if self.nodes.is_empty() || k == 0 || max_checks == 0 {
            return KnnSearch {
                neighbors: Vec::new(),
                checks,
            };
        }

        let mut best = BinaryHeap::with_capacity(k + 1);
        let mut branches = BinaryHeap::new();
        branches.push(Reverse(Branch { bound: 0.0, node: 0 }));

        'search: while let Some(Reverse(branch)) = branches.pop() {
            if !admits(&best, k, branch.bound) {
                break;
            }

            let mut current = Some(branch.node);
            while let Some(node_idx) = current {
                if checks >= max_checks {
                    break 'search;
                }
                checks += 1;

                let node = &self.nodes[node_idx];
                let candidate = Neighbor {
                    index: node.point_idx,
                    dist_sq: squared_distance(query, self.point(node.point_idx)),
                };
                if best.len() < k {
                    best.push(candidate);
                } else if best.peek().is_some_and(|worst| candidate < *worst) {
                    best.pop();
                    best.push(candidate);
                }
                if best.len() == k && best.peek().is_some_and(|worst| worst.dist_sq == 0.0) {
                    break 'search;
                }

                let diff = query[node.split_dim] - node.split_value;
                let (near, far) = if diff < 0.0 {
                    (node.left, node.right)
                } else {
                    (node.right, node.left)
                };

                if let Some(far_idx) = far {
                    let bound = branch.bound.max(diff * diff);
                    if admits(&best, k, bound) {
                        branches.push(Reverse(Branch { bound, node: far_idx }));
                    }
                }
                current = near;
            }
        }

        KnnSearch {
            neighbors: best.into_sorted_vec(),
            checks,
        }
    }
}

/// Result of a bounded query.
#[derive(Debug, Clone, PartialEq)]
pub struct KnnSearch {
    pub neighbors: Vec<Neighbor>,
    /// Nodes examined.
    pub checks: usize,
}

/// An unexplored subtree with a lower bound on its squared distance.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Branch {
    bound: f32,
    node: usize,
}

impl Eq for Branch {}

impl Ord for Branch {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bound.total_cmp(&other.bound).then(self.node.cmp(&other.node))
    }
}

impl PartialOrd for Branch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn admits(best: &BinaryHeap<Neighbor>, k: usize, bound: f32) -> bool {
    best.len() < k || best.peek().is_some_and(|worst| bound <= worst.dist_sq)
}

pub fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
