use rayon::prelude::*;

use crate::analysis::{block_features::BlockFeatures, cancel::CancelToken, kd_tree::KdTree};

/// A pair of grid blocks with near-identical descriptors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateMatch {
    pub block_a: usize,
    pub block_b: usize,
    /// Position of `block_b` minus position of `block_a`, in pixels.
    pub offset: (i32, i32),
    /// Squared L2 descriptor distance.
    pub distance: f32,
}

impl CandidateMatch {
    pub fn shift(&self) -> f64 {
        let (dx, dy) = self.offset;
        ((dx as f64).powi(2) + (dy as f64).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MatchSet {
    pub matches: Vec<CandidateMatch>,
    /// Qualifying candidates found before the cap was applied.
    pub found: usize,
    pub truncated: bool,
    /// Tree nodes examined across all queries.
    pub checks: usize,
}

/// Per-query node budget used unless [`ApproximateMatcher::with_checks`] says otherwise.
pub const DEFAULT_CHECKS: usize = 256;

pub struct ApproximateMatcher {
    k: usize,
    tau: f32,
    min_shift: f64,
    max_candidates: usize,
    checks: usize,
}

impl ApproximateMatcher {
    pub fn new(k: usize, tau: f32, min_shift: f64, max_candidates: usize) -> Self {
        Self {
            k,
            tau,
            min_shift,
            max_candidates,
            checks: DEFAULT_CHECKS,
        }
    }

    pub fn with_checks(mut self, checks: usize) -> Self {
        self.checks = checks;
        self
    }

    /// Queries the `k` nearest non-self neighbours of every block and keeps
    /// those whose squared descriptor distance is within `tau` and whose
    /// spatial shift is at least `min_shift`. Both orderings of a pair are
    /// kept. Returns `None` only when cancelled.
    pub fn find_matches(&self, features: &BlockFeatures, cancel: &CancelToken) -> Option<MatchSet> {
        let Some(tree) = KdTree::build(features.descriptors(), features.dim()) else {
            return Some(MatchSet::default());
        };

        if cancel.is_cancelled() {
            return None;
        }

        let per_block = (0..features.len())
            .into_par_iter()
            .map(|i| {
                if cancel.is_cancelled() {
                    return None;
                }
                Some(self.query_block(&tree, features, i))
            })
            .collect::<Option<Vec<_>>>()?;

        let checks = per_block.iter().map(|(_, c)| c).sum::<usize>();
        let mut matches = per_block.into_iter().flat_map(|(m, _)| m).collect::<Vec<_>>();
        let found = matches.len();
        let truncated = found > self.max_candidates;

        if truncated {
            log::warn!(
                "Candidate matches capped at {} of {}; keeping lowest-distance pairs",
                self.max_candidates,
                found
            );
            matches.sort_by(|a, b| {
                a.distance
                    .total_cmp(&b.distance)
                    .then(a.block_a.cmp(&b.block_a))
                    .then(a.block_b.cmp(&b.block_b))
            });
            matches.truncate(self.max_candidates);
            matches.sort_by_key(|m| (m.block_a, m.block_b));
        }

        Some(MatchSet {
            matches,
            found,
            truncated,
            checks,
        })
    }

    fn query_block(&self, tree: &KdTree<'_>, features: &BlockFeatures, i: usize) -> (Vec<CandidateMatch>, usize) {
        let (xa, ya) = features.position(i);
        let search = tree.search(features.descriptor(i), self.k + 1, self.checks);

        let matches = search
            .neighbors
            .into_iter()
            .filter(|n| n.index != i)
            .take(self.k)
            .filter_map(|n| {
                if n.dist_sq > self.tau {
                    return None;
                }
                let (xb, yb) = features.position(n.index);
                let candidate = CandidateMatch {
                    block_a: i,
                    block_b: n.index,
                    offset: (xb as i32 - xa as i32, yb as i32 - ya as i32),
                    distance: n.dist_sq,
                };
                (candidate.shift() >= self.min_shift).then_some(candidate)
            })
            .collect();

        (matches, search.checks)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ndarray::Array2;

    use super::*;
    use crate::analysis::block_features::{BlockFeatureExtractor, BlockTransform};

    fn features_for(pixels: &Array2<f64>) -> BlockFeatures {
        BlockFeatureExtractor::new(Arc::new(BlockTransform::new(8, 15)), 4)
            .extract(pixels, &CancelToken::new())
            .unwrap()
    }

    fn textured(width: usize, height: usize) -> Array2<f64> {
        Array2::from_shape_fn((height, width), |(y, x)| {
            ((x * 73 + y * 151 + x * y * 31) % 256) as f64
        })
    }

    #[test]
    fn test_exact_copy_is_matched() {
        let mut pixels = textured(64, 64);
        for y in 0..8 {
            for x in 0..8 {
                pixels[[40 + y, 36 + x]] = pixels[[4 + y, 4 + x]];
            }
        }
        let features = features_for(&pixels);
        let set = ApproximateMatcher::new(5, 0.1, 10.0, 1000)
            .find_matches(&features, &CancelToken::new())
            .unwrap();

        assert!(set.matches.iter().any(|m| m.offset == (32, 36)));
        assert!(set.matches.iter().any(|m| m.offset == (-32, -36)));
        assert!(set.matches.iter().all(|m| m.block_a != m.block_b));
        assert!(set.matches.iter().all(|m| m.shift() >= 10.0));
        assert!(!set.truncated);
    }

    #[test]
    fn test_min_shift_rejects_neighbours() {
        let pixels = Array2::from_elem((32, 32), 100.0);
        let features = features_for(&pixels);
        let set = ApproximateMatcher::new(5, 0.1, 1000.0, 1000)
            .find_matches(&features, &CancelToken::new())
            .unwrap();
        assert!(set.matches.is_empty());
    }

    #[test]
    fn test_cap_keeps_lowest_distance() {
        let pixels = Array2::from_elem((64, 64), 100.0);
        let features = features_for(&pixels);
        let set = ApproximateMatcher::new(5, 0.1, 4.0, 7)
            .find_matches(&features, &CancelToken::new())
            .unwrap();
        assert!(set.truncated);
        assert!(set.found > 7);
        assert_eq!(set.matches.len(), 7);
    }

    #[test]
    fn test_empty_features() {
        let pixels = Array2::zeros((4, 4));
        let features = features_for(&pixels);
        let set = ApproximateMatcher::new(5, 0.1, 4.0, 10)
            .find_matches(&features, &CancelToken::new())
            .unwrap();
        assert!(set.matches.is_empty());
        assert_eq!(set.found, 0);
    }

    #[test]
    fn test_tau_bounds_squared_distance() {
        let mut pixels = textured(96, 96);
        for y in 0..16 {
            for x in 0..16 {
                pixels[[60 + y, 56 + x]] = pixels[[8 + y, 8 + x]];
            }
        }
        let v = pixels[[68, 64]];
        pixels[[68, 64]] = if v < 255.0 { v + 1.0 } else { v - 1.0 };

        let features = BlockFeatureExtractor::new(Arc::new(BlockTransform::new(16, 15)), 4)
            .extract(&pixels, &CancelToken::new())
            .unwrap();
        let find = |tau: f32| {
            ApproximateMatcher::new(5, tau, 10.0, 1000)
                .with_checks(usize::MAX)
                .find_matches(&features, &CancelToken::new())
                .unwrap()
                .matches
                .into_iter()
                .find(|m| m.offset == (48, 52))
        };

        // One gray level at the block centre: squared distance ~0.049, L2 ~0.22.
        let kept = find(0.10).unwrap();
        assert!((kept.distance - 0.0485).abs() < 1e-3);
        assert!(find(0.03).is_none());
    }

    #[test]
    fn test_flat_image_queries_stay_bounded() {
        let pixels = Array2::from_elem((256, 256), 100.0);
        let features = features_for(&pixels);
        let set = ApproximateMatcher::new(5, 0.1, 20.0, usize::MAX)
            .find_matches(&features, &CancelToken::new())
            .unwrap();

        assert_eq!(features.len(), 63 * 63);
        assert!(set.checks <= features.len() * 6);
        assert!(!set.matches.is_empty());
        assert!(set.matches.iter().all(|m| m.distance == 0.0));
    }
}
