//! Robust affine verification of offset clusters.
//!
//! Each cluster's block-centre pairs are fed to a RANSAC loop over minimal
//! three-point affine fits; the best consensus set is refined with least
//! squares and recounted. Clusters with too little support are dropped.

use rand::{SeedableRng, rngs::StdRng, seq::index};
use statrs::statistics::{Data, Median};

use crate::analysis::{
    block_features::BlockFeatures, cancel::CancelToken, matcher::CandidateMatch,
    offset_clustering::OffsetCluster,
};

/// `x' = a0 x + a1 y + a2`, `y' = a3 x + a4 y + a5`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineModel {
    pub coeffs: [f64; 6],
}

impl AffineModel {
    pub fn translation(dx: f64, dy: f64) -> Self {
        Self {
            coeffs: [1.0, 0.0, dx, 0.0, 1.0, dy],
        }
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let a = &self.coeffs;
        (a[0] * x + a[1] * y + a[2], a[3] * x + a[4] * y + a[5])
    }

    pub fn translation_components(&self) -> (f64, f64) {
        (self.coeffs[2], self.coeffs[5])
    }

    /// Determinant of the linear part; its square root is the area scale.
    pub fn determinant(&self) -> f64 {
        let a = &self.coeffs;
        a[0] * a[4] - a[1] * a[3]
    }

    pub fn rotation_angle(&self) -> f64 {
        self.coeffs[3].atan2(self.coeffs[0])
    }

    /// Least-squares fit over three or more pairs. `None` when the source
    /// points are collinear.
    pub fn fit(src: &[(f64, f64)], dst: &[(f64, f64)]) -> Option<Self> {
        if src.len() < 3 || src.len() != dst.len() {
            return None;
        }

        let n = src.len() as f64;
        let cx = src.iter().map(|p| p.0).sum::<f64>() / n;
        let cy = src.iter().map(|p| p.1).sum::<f64>() / n;

        // Centred source coordinates keep the normal equations well conditioned.
        let (mut sx, mut sy, mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0, 0.0, 0.0);
        let (mut su, mut sxu, mut syu) = (0.0, 0.0, 0.0);
        let (mut sv, mut sxv, mut syv) = (0.0, 0.0, 0.0);

        for (&(x, y), &(u, v)) in src.iter().zip(dst) {
            let (x, y) = (x - cx, y - cy);
            sx += x;
            sy += y;
            sxx += x * x;
            sxy += x * y;
            syy += y * y;
            su += u;
            sxu += x * u;
            syu += y * u;
            sv += v;
            sxv += x * v;
            syv += y * v;
        }

        let normal = [[sxx, sxy, sx], [sxy, syy, sy], [sx, sy, n]];
        let row_x = solve_3x3(&normal, [sxu, syu, su])?;
        let row_y = solve_3x3(&normal, [sxv, syv, sv])?;

        Some(Self {
            coeffs: [
                row_x[0],
                row_x[1],
                row_x[2] - row_x[0] * cx - row_x[1] * cy,
                row_y[0],
                row_y[1],
                row_y[2] - row_y[0] * cx - row_y[1] * cy,
            ],
        })
    }

    /// Mean displacement model, used when the support is collinear.
    pub fn mean_translation(src: &[(f64, f64)], dst: &[(f64, f64)]) -> Option<Self> {
        if src.is_empty() {
            return None;
        }
        let n = src.len() as f64;
        let (dx, dy) = src
            .iter()
            .zip(dst)
            .fold((0.0, 0.0), |(ax, ay), (&(x, y), &(u, v))| (ax + u - x, ay + v - y));
        Some(Self::translation(dx / n, dy / n))
    }

    pub fn residual_sq(&self, src: (f64, f64), dst: (f64, f64)) -> f64 {
        let (px, py) = self.apply(src.0, src.1);
        (px - dst.0).powi(2) + (py - dst.1).powi(2)
    }
}

/// Cramer's rule with a relative singularity guard.
fn solve_3x3(m: &[[f64; 3]; 3], b: [f64; 3]) -> Option<[f64; 3]> {
    let det3 = |m: &[[f64; 3]; 3]| {
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    };

    let det = det3(m);
    let scale = m.iter().flatten().map(|v| v.abs()).fold(0.0, f64::max);
    if scale == 0.0 || det.abs() <= 1e-12 * scale.powi(3) {
        return None;
    }

    let mut out = [0.0; 3];
    for (col, slot) in out.iter_mut().enumerate() {
        let mut replaced = *m;
        for row in 0..3 {
            replaced[row][col] = b[row];
        }
        *slot = det3(&replaced) / det;
    }

    Some(out)
}

#[derive(Debug, Clone)]
pub struct RansacConfig {
    pub max_iterations: usize,
    /// Inlier reprojection distance in pixels.
    pub threshold: f64,
    pub confidence: f64,
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            max_iterations: 2000,
            threshold: 3.0,
            confidence: 0.99,
            seed: 0x5eed_c0de,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RansacFit {
    pub model: AffineModel,
    pub inliers: Vec<usize>,
    pub iterations: usize,
}

const SAMPLE_SIZE: usize = 3;

fn adaptive_iterations(inlier_ratio: f64, confidence: f64, max_iterations: usize) -> usize {
    if inlier_ratio >= 1.0 {
        return 1;
    }
    if inlier_ratio <= 0.0 {
        return max_iterations;
    }

    let w_n = inlier_ratio.powi(SAMPLE_SIZE as i32);
    let log_outlier = (1.0 - w_n).ln();
    if log_outlier >= 0.0 {
        return max_iterations;
    }

    (((1.0 - confidence).ln() / log_outlier).ceil() as usize).min(max_iterations)
}

fn count_inliers(model: &AffineModel, src: &[(f64, f64)], dst: &[(f64, f64)], threshold: f64) -> Vec<usize> {
    let threshold_sq = threshold * threshold;
    src.iter()
        .zip(dst)
        .enumerate()
        .filter(|&(_, (&s, &d))| model.residual_sq(s, d) <= threshold_sq)
        .map(|(i, _)| i)
        .collect()
}

fn fit_or_translate(src: &[(f64, f64)], dst: &[(f64, f64)]) -> Option<AffineModel> {
    AffineModel::fit(src, dst).or_else(|| AffineModel::mean_translation(src, dst))
}

/// Seeded RANSAC over minimal three-point samples. Collinear samples fall
/// back to a pure translation so strip-shaped clones still verify.
pub fn estimate_affine(src: &[(f64, f64)], dst: &[(f64, f64)], config: &RansacConfig) -> Option<RansacFit> {
    let n = src.len();
    if n < SAMPLE_SIZE || n != dst.len() {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best: Option<(AffineModel, Vec<usize>)> = None;
    let mut sample_src = Vec::with_capacity(SAMPLE_SIZE);
    let mut sample_dst = Vec::with_capacity(SAMPLE_SIZE);
    let mut iterations = 0;
    let mut required = config.max_iterations;

    while iterations < required {
        iterations += 1;

        sample_src.clear();
        sample_dst.clear();
        for i in index::sample(&mut rng, n, SAMPLE_SIZE) {
            sample_src.push(src[i]);
            sample_dst.push(dst[i]);
        }

        let Some(model) = fit_or_translate(&sample_src, &sample_dst) else {
            continue;
        };
        let inliers = count_inliers(&model, src, dst, config.threshold);

        let improved = best
            .as_ref()
            .is_none_or(|(_, best_inliers)| inliers.len() > best_inliers.len());
        if improved {
            let ratio = inliers.len() as f64 / n as f64;
            required = adaptive_iterations(ratio, config.confidence, config.max_iterations);
            best = Some((model, inliers));
        }
    }

    let (model, inliers) = best?;
    if inliers.len() < SAMPLE_SIZE {
        return None;
    }

    let inlier_src = inliers.iter().map(|&i| src[i]).collect::<Vec<_>>();
    let inlier_dst = inliers.iter().map(|&i| dst[i]).collect::<Vec<_>>();
    let (model, inliers) = match fit_or_translate(&inlier_src, &inlier_dst) {
        Some(refined) => {
            let recount = count_inliers(&refined, src, dst, config.threshold);
            if recount.len() >= inliers.len() {
                (refined, recount)
            } else {
                (model, inliers)
            }
        }
        None => (model, inliers),
    };

    Some(RansacFit {
        model,
        inliers,
        iterations,
    })
}

/// A cluster that survived geometric verification.
#[derive(Debug, Clone)]
pub struct VerifiedRegion {
    pub cluster_id: usize,
    pub model: AffineModel,
    pub matches: Vec<CandidateMatch>,
    /// Inliers over cluster members.
    pub inlier_ratio: f64,
}

impl VerifiedRegion {
    pub fn inlier_count(&self) -> usize {
        self.matches.len()
    }
}

pub struct GeometricVerifier {
    ransac: RansacConfig,
    min_area: u64,
    inlier_ratio_cutoff: f64,
}

impl GeometricVerifier {
    pub fn new(ransac: RansacConfig, min_area: u64, inlier_ratio_cutoff: f64) -> Self {
        Self {
            ransac,
            min_area,
            inlier_ratio_cutoff,
        }
    }

    /// Fits every cluster, then drops clusters whose inlier footprint is
    /// below `min_area` or whose inlier count is under the cutoff fraction
    /// of the median inlier count. Returns `None` only when cancelled.
    pub fn verify(
        &self,
        clusters: &[OffsetCluster],
        matches: &[CandidateMatch],
        features: &BlockFeatures,
        cancel: &CancelToken,
    ) -> Option<Vec<VerifiedRegion>> {
        let half = features.block_size as f64 / 2.0;
        let block_area = features.block_size as u64 * features.block_size as u64;
        let center = |index: usize| {
            let (x, y) = features.position(index);
            (x as f64 + half, y as f64 + half)
        };

        let mut fitted = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            if cancel.is_cancelled() {
                return None;
            }
            if cluster.len() < SAMPLE_SIZE {
                log::debug!("Cluster {} too small to fit ({} matches)", cluster.id, cluster.len());
                continue;
            }

            let src = cluster.members.iter().map(|&m| center(matches[m].block_a)).collect::<Vec<_>>();
            let dst = cluster.members.iter().map(|&m| center(matches[m].block_b)).collect::<Vec<_>>();

            let config = RansacConfig {
                seed: self.ransac.seed ^ (cluster.id as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15),
                ..self.ransac.clone()
            };

            match estimate_affine(&src, &dst, &config) {
                Some(fit) => fitted.push((cluster, fit)),
                None => log::debug!("Cluster {} has no consistent affine model", cluster.id),
            }
        }

        if fitted.is_empty() {
            return Some(Vec::new());
        }

        let median_inliers = Data::new(
            fitted
                .iter()
                .map(|(_, fit)| fit.inliers.len() as f64)
                .collect::<Vec<_>>(),
        )
        .median();
        let min_inliers = self.inlier_ratio_cutoff * median_inliers;

        let regions = fitted
            .into_iter()
            .filter_map(|(cluster, fit)| {
                let count = fit.inliers.len();
                if (count as u64) * block_area < self.min_area {
                    log::debug!("Cluster {} below minimum area ({} inliers)", cluster.id, count);
                    return None;
                }
                if (count as f64) < min_inliers {
                    log::debug!(
                        "Cluster {} below inlier cutoff ({} < {:.1})",
                        cluster.id,
                        count,
                        min_inliers
                    );
                    return None;
                }

                Some(VerifiedRegion {
                    cluster_id: cluster.id,
                    model: fit.model,
                    matches: fit.inliers.iter().map(|&i| matches[cluster.members[i]]).collect(),
                    inlier_ratio: count as f64 / cluster.len() as f64,
                })
            })
            .collect();

        Some(regions)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ndarray::Array2;

    use super::*;
    use crate::analysis::block_features::{BlockFeatureExtractor, BlockTransform};

    fn grid_points(step: f64, side: usize) -> Vec<(f64, f64)> {
        (0..side)
            .flat_map(|j| (0..side).map(move |i| (i as f64 * step, j as f64 * step)))
            .collect()
    }

    #[test]
    fn test_fit_recovers_affine() {
        let known = AffineModel {
            coeffs: [1.1, 0.2, 5.0, -0.1, 0.95, -3.0],
        };
        let src = grid_points(10.0, 4);
        let dst = src.iter().map(|&(x, y)| known.apply(x, y)).collect::<Vec<_>>();
        let fit = AffineModel::fit(&src, &dst).unwrap();
        for (a, b) in fit.coeffs.iter().zip(known.coeffs.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_fit_rejects_collinear() {
        let src = vec![(0.0, 0.0), (1.0, 1.0), (2.0, 2.0), (3.0, 3.0)];
        let dst = src.iter().map(|&(x, y)| (x + 5.0, y)).collect::<Vec<_>>();
        assert!(AffineModel::fit(&src, &dst).is_none());
        let fallback = AffineModel::mean_translation(&src, &dst).unwrap();
        assert_eq!(fallback.translation_components(), (5.0, 0.0));
    }

    #[test]
    fn test_ransac_ignores_outliers() {
        let src = grid_points(8.0, 6);
        let mut dst = src.iter().map(|&(x, y)| (x + 60.0, y + 40.0)).collect::<Vec<_>>();
        for (i, p) in dst.iter_mut().enumerate().take(6) {
            *p = (p.0 + 30.0 + i as f64 * 7.0, p.1 - 25.0);
        }

        let fit = estimate_affine(&src, &dst, &RansacConfig::default()).unwrap();
        assert_eq!(fit.inliers, (6..36).collect::<Vec<_>>());
        let (dx, dy) = fit.model.translation_components();
        assert!((dx - 60.0).abs() < 1e-6 && (dy - 40.0).abs() < 1e-6);
        assert!((fit.model.determinant() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_ransac_is_deterministic() {
        let src = grid_points(4.0, 7);
        let dst = src
            .iter()
            .enumerate()
            .map(|(i, &(x, y))| (x + 20.0 + (i % 5) as f64 * 0.3, y - 12.0))
            .collect::<Vec<_>>();
        let config = RansacConfig::default();
        let a = estimate_affine(&src, &dst, &config).unwrap();
        let b = estimate_affine(&src, &dst, &config).unwrap();
        assert_eq!(a.model, b.model);
        assert_eq!(a.inliers, b.inliers);
    }

    #[test]
    fn test_adaptive_iterations_bounds() {
        assert_eq!(adaptive_iterations(1.0, 0.99, 2000), 1);
        assert_eq!(adaptive_iterations(0.0, 0.99, 2000), 2000);
        let mid = adaptive_iterations(0.5, 0.99, 2000);
        assert!(mid > 1 && mid < 2000);
    }

    const GRID: usize = 49;

    fn features() -> BlockFeatures {
        BlockFeatureExtractor::new(Arc::new(BlockTransform::new(8, 15)), 4)
            .extract(&Array2::zeros((200, 200)), &CancelToken::new())
            .unwrap()
    }

    /// `count` translated matches whose sources fill rows of `width`
    /// blocks starting at grid cell `origin`.
    fn translated(
        origin: (usize, usize),
        width: usize,
        count: usize,
        shift: (usize, usize),
        matches: &mut Vec<CandidateMatch>,
    ) -> Vec<usize> {
        (0..count)
            .map(|i| {
                let (bx, by) = (origin.0 + i % width, origin.1 + i / width);
                matches.push(CandidateMatch {
                    block_a: by * GRID + bx,
                    block_b: (by + shift.1) * GRID + bx + shift.0,
                    offset: (shift.0 as i32 * 4, shift.1 as i32 * 4),
                    distance: 0.0,
                });
                matches.len() - 1
            })
            .collect()
    }

    fn three_clusters() -> (Vec<OffsetCluster>, Vec<CandidateMatch>) {
        let mut matches = Vec::new();
        let sizes = [(0, (0, 0), 40, (10, 0)), (1, (0, 10), 38, (0, 12)), (2, (20, 30), 10, (6, 6))];
        let clusters = sizes
            .into_iter()
            .map(|(id, origin, count, shift)| OffsetCluster {
                id,
                members: translated(origin, 8, count, shift, &mut matches),
                mean_offset: (shift.0 as f64 * 4.0, shift.1 as f64 * 4.0),
            })
            .collect();
        (clusters, matches)
    }

    fn surviving(min_area: u64) -> Vec<(usize, usize)> {
        let features = features();
        let (clusters, matches) = three_clusters();
        GeometricVerifier::new(RansacConfig::default(), min_area, 0.6)
            .verify(&clusters, &matches, &features, &CancelToken::new())
            .unwrap()
            .iter()
            .map(|r| (r.cluster_id, r.inlier_count()))
            .collect()
    }

    #[test]
    fn test_cluster_under_median_cutoff_is_dropped() {
        // Median inliers 38, cutoff 22.8.
        assert_eq!(surviving(0), vec![(0, 40), (1, 38)]);
    }

    #[test]
    fn test_cluster_under_min_area_is_dropped() {
        // 39 blocks of 8x8; 40 inliers pass, 38 do not.
        assert_eq!(surviving(39 * 64), vec![(0, 40)]);
    }

    #[test]
    fn test_cancelled_verification() {
        let features = features();
        let (clusters, matches) = three_clusters();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = GeometricVerifier::new(RansacConfig::default(), 0, 0.6)
            .verify(&clusters, &matches, &features, &cancel);
        assert!(result.is_none());
    }
}
