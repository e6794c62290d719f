use std::{path::Path, sync::Arc, time::Instant};

use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};

use crate::{
    CopyMoveResult, DetectionStats, DetectionStatus, EmptyReason, MatchPair, SRegion,
    analysis::{
        block_features::{BlockFeatureExtractor, BlockFeatures, BlockTransform},
        cancel::CancelToken,
        confidence_map::ConfidenceMapBuilder,
        geometric::{GeometricVerifier, RansacConfig, VerifiedRegion},
        matcher::{ApproximateMatcher, DEFAULT_CHECKS},
        offset_clustering::OffsetClusterer,
        transform_cache::{TransformCache, TransformKey},
    },
    error::{ForensicsError, Result},
    image_utils::{gray_to_array, to_gray},
};

/// Smallest usable DBSCAN radius. Offsets are whole pixels, so anything below
/// this already clusters identical offsets only.
pub const MIN_CLUSTER_EPS: f64 = 1e-3;

/// Tunables of the dense block copy-move detector. The defaults are
/// empirical; none of them is load-bearing on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyMoveParams {
    pub block_size: u32,
    pub stride: u32,
    /// Leading zig-zag DCT coefficients kept per block.
    pub descriptor_len: usize,
    /// Non-self neighbours queried per block.
    pub k: usize,
    /// Maximum squared L2 descriptor distance of a candidate match.
    pub tau: f32,
    /// Tree nodes examined per nearest-neighbour query.
    pub search_checks: usize,
    /// Minimum spatial shift, in pixels, between matched blocks.
    pub min_shift: f64,
    pub cluster_eps: f64,
    /// When set, `eps` becomes this fraction of the image diagonal.
    pub cluster_eps_relative: Option<f64>,
    pub min_pts: usize,
    /// Minimum pixel area of a verified cluster and of a map component.
    pub min_area: u64,
    pub norm_percentile: f64,
    pub inlier_ratio_cutoff: f64,
    pub morph_kernel: usize,
    pub max_candidates: usize,
    pub ransac_threshold: f64,
    pub ransac_confidence: f64,
    pub ransac_max_iterations: usize,
    pub ransac_seed: u64,
    /// Confidence level counted by `suspicious_fraction`.
    pub score_threshold: f32,
}

impl Default for CopyMoveParams {
    fn default() -> Self {
        Self {
            block_size: 16,
            stride: 4,
            descriptor_len: 15,
            k: 5,
            tau: 0.10,
            search_checks: DEFAULT_CHECKS,
            min_shift: 20.0,
            cluster_eps: 5.0,
            cluster_eps_relative: None,
            min_pts: 20,
            min_area: 50,
            norm_percentile: 0.99,
            inlier_ratio_cutoff: 0.6,
            morph_kernel: 5,
            max_candidates: 200_000,
            ransac_threshold: 3.0,
            ransac_confidence: 0.99,
            ransac_max_iterations: 2000,
            ransac_seed: 0x5eed_c0de,
            score_threshold: 0.5,
        }
    }
}

impl CopyMoveParams {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ForensicsError::InvalidParameter(msg));

        if self.block_size < 2 {
            return invalid(format!("block_size must be at least 2, got {}", self.block_size));
        }
        if self.stride == 0 {
            return invalid("stride must be positive".into());
        }
        let max_len = u64::from(self.block_size) * u64::from(self.block_size);
        if self.descriptor_len == 0 || self.descriptor_len as u64 > max_len {
            return invalid(format!("descriptor_len must be in 1..={max_len}, got {}", self.descriptor_len));
        }
        if self.k == 0 {
            return invalid("k must be positive".into());
        }
        if !(self.tau >= 0.0) {
            return invalid(format!("tau must be non-negative, got {}", self.tau));
        }
        if !(self.min_shift >= 0.0) {
            return invalid(format!("min_shift must be non-negative, got {}", self.min_shift));
        }
        if self.search_checks == 0 {
            return invalid("search_checks must be positive".into());
        }
        if !(self.cluster_eps >= MIN_CLUSTER_EPS && self.cluster_eps.is_finite()) {
            return invalid(format!(
                "cluster_eps must be a finite value of at least {MIN_CLUSTER_EPS}, got {}",
                self.cluster_eps
            ));
        }
        if let Some(rel) = self.cluster_eps_relative {
            if !(rel > 0.0 && rel <= 1.0) {
                return invalid(format!("cluster_eps_relative must be in (0, 1], got {rel}"));
            }
        }
        if self.min_pts == 0 {
            return invalid("min_pts must be positive".into());
        }
        if !(self.norm_percentile > 0.0 && self.norm_percentile <= 1.0) {
            return invalid(format!("norm_percentile must be in (0, 1], got {}", self.norm_percentile));
        }
        if !(0.0..=1.0).contains(&self.inlier_ratio_cutoff) {
            return invalid(format!("inlier_ratio_cutoff must be in [0, 1], got {}", self.inlier_ratio_cutoff));
        }
        if self.morph_kernel % 2 == 0 {
            return invalid(format!("morph_kernel must be odd, got {}", self.morph_kernel));
        }
        if self.max_candidates == 0 {
            return invalid("max_candidates must be positive".into());
        }
        if !(self.ransac_threshold > 0.0) {
            return invalid(format!("ransac_threshold must be positive, got {}", self.ransac_threshold));
        }
        if !(self.ransac_confidence > 0.0 && self.ransac_confidence < 1.0) {
            return invalid(format!("ransac_confidence must be in (0, 1), got {}", self.ransac_confidence));
        }
        if self.ransac_max_iterations == 0 {
            return invalid("ransac_max_iterations must be positive".into());
        }

        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn with_block_size(mut self, block_size: u32, stride: u32) -> Self {
        self.block_size = block_size;
        self.stride = stride;
        self
    }

    pub fn with_matching(mut self, k: usize, tau: f32, min_shift: f64) -> Self {
        self.k = k;
        self.tau = tau;
        self.min_shift = min_shift;
        self
    }

    pub fn with_clustering(mut self, eps: f64, min_pts: usize) -> Self {
        self.cluster_eps = eps;
        self.min_pts = min_pts;
        self
    }

    pub fn with_min_area(mut self, min_area: u64) -> Self {
        self.min_area = min_area;
        self
    }

    pub fn with_norm_percentile(mut self, percentile: f64) -> Self {
        self.norm_percentile = percentile;
        self
    }

    pub fn effective_eps(&self, width: u32, height: u32) -> f64 {
        match self.cluster_eps_relative {
            Some(rel) => {
                let diagonal = ((width as f64).powi(2) + (height as f64).powi(2)).sqrt();
                (rel * diagonal).max(MIN_CLUSTER_EPS)
            }
            None => self.cluster_eps,
        }
    }

    pub fn transform_key(&self) -> TransformKey {
        TransformKey {
            block_size: self.block_size,
            descriptor_len: self.descriptor_len,
        }
    }

    fn ransac_config(&self) -> RansacConfig {
        RansacConfig {
            max_iterations: self.ransac_max_iterations,
            threshold: self.ransac_threshold,
            confidence: self.ransac_confidence,
            seed: self.ransac_seed,
        }
    }
}

/// Dense block copy-move detector.
///
/// Holds only immutable configuration and an optional shared transform
/// cache, so one instance can serve concurrent callers.
pub struct CopyMoveDetector {
    params: CopyMoveParams,
    cache: Option<Arc<TransformCache>>,
}

impl CopyMoveDetector {
    pub fn new(params: CopyMoveParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params, cache: None })
    }

    pub fn with_cache(mut self, cache: Arc<TransformCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn params(&self) -> &CopyMoveParams {
        &self.params
    }

    pub fn detect(&self, image: &DynamicImage) -> CopyMoveResult {
        self.detect_with_cancel(image, &CancelToken::new())
    }

    pub fn detect_with_cancel(&self, image: &DynamicImage, cancel: &CancelToken) -> CopyMoveResult {
        self.detect_gray(&to_gray(image), cancel)
    }

    pub fn detect_gray(&self, gray: &GrayImage, cancel: &CancelToken) -> CopyMoveResult {
        let started = Instant::now();
        let (width, height) = gray.dimensions();
        let params = &self.params;
        let mut stats = DetectionStats::default();

        log::info!("Copy-move analysis of {}x{} image", width, height);

        let finish_empty = |reason: EmptyReason, mut stats: DetectionStats| {
            stats.elapsed_ms = started.elapsed().as_millis() as u64;
            log::info!("Copy-move finished without detection: {:?}", reason);
            CopyMoveResult::empty(width, height, reason, stats)
        };

        let transform = match &self.cache {
            Some(cache) => cache.get_or_build(params.transform_key()),
            None => Arc::new(BlockTransform::new(params.block_size as usize, params.descriptor_len)),
        };

        let pixels = gray_to_array(gray);
        let extractor = BlockFeatureExtractor::new(transform, params.stride as usize);
        let Some(features) = extractor.extract(&pixels, cancel) else {
            return finish_empty(EmptyReason::Cancelled, stats);
        };
        stats.blocks = features.len();
        log::debug!("Extracted {} blocks ({}x{} grid)", features.len(), features.blocks_x, features.blocks_y);

        if features.is_empty() {
            return finish_empty(EmptyReason::InsufficientFeatures, stats);
        }

        let matcher = ApproximateMatcher::new(params.k, params.tau, params.min_shift, params.max_candidates)
            .with_checks(params.search_checks);
        let Some(match_set) = matcher.find_matches(&features, cancel) else {
            return finish_empty(EmptyReason::Cancelled, stats);
        };
        stats.candidates = match_set.matches.len();
        stats.candidates_truncated = match_set.truncated;
        log::debug!(
            "Found {} candidate matches ({} tree nodes examined)",
            match_set.found,
            match_set.checks
        );

        if match_set.matches.is_empty() {
            return finish_empty(EmptyReason::NoCandidateMatches, stats);
        }

        let eps = params.effective_eps(width, height);
        let clusterer = OffsetClusterer::new(eps, params.min_pts);
        let Some(clusters) = clusterer.cluster(&match_set.matches, cancel) else {
            return finish_empty(EmptyReason::Cancelled, stats);
        };
        stats.clusters = clusters.len();
        stats.clustered_matches = clusters.iter().map(|c| c.len()).sum();
        log::debug!("{} offset clusters (eps {:.2}) hold {} matches", clusters.len(), eps, stats.clustered_matches);

        if clusters.is_empty() {
            return finish_empty(EmptyReason::NoClusters, stats);
        }

        let verifier = GeometricVerifier::new(params.ransac_config(), params.min_area, params.inlier_ratio_cutoff);
        let Some(regions) = verifier.verify(&clusters, &match_set.matches, &features, cancel) else {
            return finish_empty(EmptyReason::Cancelled, stats);
        };
        stats.verified_regions = regions.len();
        stats.inlier_matches = regions.iter().map(|r| r.inlier_count()).sum();
        log::debug!("{} verified regions with {} inlier matches", regions.len(), stats.inlier_matches);

        if regions.is_empty() {
            return finish_empty(EmptyReason::NoVerifiedRegions, stats);
        }
        if cancel.is_cancelled() {
            return finish_empty(EmptyReason::Cancelled, stats);
        }

        let builder = ConfidenceMapBuilder::new(params.norm_percentile, params.morph_kernel, params.min_area);
        let built = builder.build(width, height, &regions, &features);
        stats.normalization = built.normalization;

        if built.map.is_all_zero() {
            return finish_empty(EmptyReason::RegionsTooSmall, stats);
        }

        let score = stats.inlier_matches as f64 / stats.candidates as f64;
        let suspicious_fraction = built.map.fraction_at_least(params.score_threshold);
        let pairs = match_pairs(&regions, &features);
        stats.elapsed_ms = started.elapsed().as_millis() as u64;

        log::info!(
            "Copy-move completed: score {:.3}, {} regions, {:.2}% suspicious pixels",
            score,
            regions.len(),
            suspicious_fraction * 100.0
        );

        CopyMoveResult {
            map: built.map,
            raw_votes: Some(built.raw_votes),
            score: score.clamp(0.0, 1.0),
            suspicious_fraction,
            status: DetectionStatus::Detected,
            regions,
            pairs,
            stats,
        }
    }
}

fn match_pairs(regions: &[VerifiedRegion], features: &BlockFeatures) -> Vec<MatchPair> {
    let size = features.block_size;
    let footprint = |index: usize| {
        let (x, y) = features.position(index);
        SRegion {
            x,
            y,
            width: size,
            height: size,
        }
    };

    regions
        .iter()
        .flat_map(|region| {
            region.matches.iter().map(move |m| MatchPair {
                cluster_id: region.cluster_id,
                source: footprint(m.block_a),
                target: footprint(m.block_b),
                distance: m.distance as f64,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_are_valid() {
        assert!(CopyMoveParams::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_params_rejected() {
        let bad = [
            CopyMoveParams { stride: 0, ..Default::default() },
            CopyMoveParams { block_size: 1, ..Default::default() },
            CopyMoveParams { descriptor_len: 300, ..Default::default() },
            CopyMoveParams { norm_percentile: 0.0, ..Default::default() },
            CopyMoveParams { morph_kernel: 4, ..Default::default() },
            CopyMoveParams { tau: f32::NAN, ..Default::default() },
            CopyMoveParams { search_checks: 0, ..Default::default() },
            CopyMoveParams { cluster_eps: 1e-20, ..Default::default() },
            CopyMoveParams { block_size: 70_000, descriptor_len: usize::MAX, ..Default::default() },
        ];
        for params in bad {
            assert!(
                matches!(CopyMoveDetector::new(params), Err(ForensicsError::InvalidParameter(_)))
            );
        }
    }

    #[test]
    fn test_json_fills_defaults() {
        let params = CopyMoveParams::from_json_str(r#"{ "block_size": 8, "norm_percentile": 0.95 }"#).unwrap();
        assert_eq!(params.block_size, 8);
        assert_eq!(params.norm_percentile, 0.95);
        assert_eq!(params.stride, 4);
        assert!(matches!(CopyMoveParams::from_json_str("{ \"k\": 0 }"), Err(ForensicsError::InvalidParameter(_))));
        assert!(matches!(CopyMoveParams::from_json_str("not json"), Err(ForensicsError::Json(_))));
    }

    #[test]
    fn test_relative_eps_scales_with_diagonal() {
        let params = CopyMoveParams {
            cluster_eps_relative: Some(0.01),
            ..Default::default()
        };
        let eps = params.effective_eps(300, 400);
        assert!((eps - 5.0).abs() < 1e-9);
        assert_eq!(CopyMoveParams::default().effective_eps(300, 400), 5.0);

        let tiny = CopyMoveParams {
            cluster_eps_relative: Some(1e-300),
            ..Default::default()
        };
        assert!(tiny.validate().is_ok());
        assert_eq!(tiny.effective_eps(300, 400), MIN_CLUSTER_EPS);
    }

    #[test]
    fn test_tiny_image_is_insufficient() {
        let detector = CopyMoveDetector::new(CopyMoveParams::default()).unwrap();
        let result = detector.detect(&DynamicImage::new_luma8(10, 10));
        assert_eq!(result.status, DetectionStatus::Empty(EmptyReason::InsufficientFeatures));
        assert_eq!(result.score, 0.0);
        assert_eq!(result.map.dimensions(), (10, 10));
        assert!(result.map.is_all_zero());
    }

    #[test]
    fn test_cancelled_detection_is_empty() {
        let detector = CopyMoveDetector::new(CopyMoveParams::default()).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = detector.detect_with_cancel(&DynamicImage::new_luma8(64, 64), &cancel);
        assert_eq!(result.status, DetectionStatus::Empty(EmptyReason::Cancelled));
        assert!(result.map.is_all_zero());
    }

    #[test]
    fn test_shared_cache_is_populated() {
        let cache = Arc::new(TransformCache::new());
        let detector = CopyMoveDetector::new(CopyMoveParams::default())
            .unwrap()
            .with_cache(Arc::clone(&cache));
        detector.detect(&DynamicImage::new_luma8(40, 40));
        assert_eq!(cache.len(), 1);
    }
}
