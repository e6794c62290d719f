use std::{fmt, path::Path, sync::Arc};

use image::DynamicImage;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{
    analysis::{
        cancel::CancelToken,
        confidence_map::ConfidenceMap,
        copy_move::{CopyMoveDetector, CopyMoveParams},
        geometric::VerifiedRegion,
        transform_cache::TransformCache,
    },
    detection::{CheckOutcome, ForensicCheck},
    error::Result,
    evaluation::{
        batch::EvaluationConfig,
        metrics::{MetricEvaluator, PixelMetrics},
        threshold::BinaryMask,
    },
    image_utils::load_mask,
};

pub mod analysis;
pub mod detection;
pub mod error;
pub mod evaluation;
pub mod image_utils;
pub mod report;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub copy_move: CopyMoveParams,
    pub evaluation: EvaluationConfig,
}

impl AnalysisConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        config.copy_move.validate()?;
        config.evaluation.validate()?;
        Ok(config)
    }
}

pub struct ForensicsAnalyzer {
    original: DynamicImage,
    config: AnalysisConfig,
    path: Option<String>,
    cache: Arc<TransformCache>,
}

impl ForensicsAnalyzer {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let original = image::open(&path)?;

        Ok(Self {
            original,
            config: AnalysisConfig::default(),
            path: Some(path_str),
            cache: Arc::new(TransformCache::new()),
        })
    }

    pub fn from_image(image: DynamicImage) -> Self {
        Self {
            original: image,
            config: AnalysisConfig::default(),
            path: None,
            cache: Arc::new(TransformCache::new()),
        }
    }

    pub fn with_config(mut self, config: AnalysisConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares block transforms with other analyzers.
    pub fn with_cache(mut self, cache: Arc<TransformCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn image(&self) -> &DynamicImage {
        &self.original
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn detector(&self) -> Result<CopyMoveDetector> {
        Ok(CopyMoveDetector::new(self.config.copy_move.clone())?.with_cache(Arc::clone(&self.cache)))
    }

    pub fn detect_copy_move(&self) -> Result<CopyMoveResult> {
        self.detect_copy_move_with(&CancelToken::new())
    }

    pub fn detect_copy_move_with(&self, cancel: &CancelToken) -> Result<CopyMoveResult> {
        Ok(self.detector()?.detect_with_cancel(&self.original, cancel))
    }

    /// Runs the copy-move check through the [`ForensicCheck`] contract.
    pub fn run_check(&self, cancel: &CancelToken) -> CheckOutcome {
        match self.detector() {
            Ok(detector) => detector.run(&self.original, cancel),
            Err(e) => CheckOutcome::failed("copy_move", e.into()),
        }
    }

    /// Scores `result` against a ground-truth mask with the configured
    /// threshold policy.
    pub fn evaluate(&self, result: &CopyMoveResult, truth: &BinaryMask) -> Result<EvaluationResult> {
        let evaluation = &self.config.evaluation;
        let (threshold, mask) = evaluation.threshold.apply(&result.map);
        let metrics = MetricEvaluator::new(evaluation.boundary_tolerance, evaluation.tpr_target)
            .evaluate(truth, &result.map, &mask)?;

        Ok(EvaluationResult {
            threshold,
            metrics,
            mask,
        })
    }

    /// Like [`evaluate`](Self::evaluate), loading the mask from disk and
    /// resizing it to the image when needed.
    pub fn evaluate_mask_file<P: AsRef<Path>>(&self, result: &CopyMoveResult, mask_path: P) -> Result<EvaluationResult> {
        let mask = load_mask(mask_path, self.original.width(), self.original.height())?;
        self.evaluate(result, &BinaryMask::from_gray(&mask))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyReason {
    /// The image is smaller than one block.
    InsufficientFeatures,
    NoCandidateMatches,
    NoClusters,
    NoVerifiedRegions,
    /// Every map component fell below the minimum area.
    RegionsTooSmall,
    Cancelled,
}

impl EmptyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmptyReason::InsufficientFeatures => "insufficient_features",
            EmptyReason::NoCandidateMatches => "no_candidate_matches",
            EmptyReason::NoClusters => "no_clusters",
            EmptyReason::NoVerifiedRegions => "no_verified_regions",
            EmptyReason::RegionsTooSmall => "regions_too_small",
            EmptyReason::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStatus {
    Detected,
    Empty(EmptyReason),
}

impl fmt::Display for DetectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionStatus::Detected => f.write_str("detected"),
            DetectionStatus::Empty(reason) => write!(f, "empty:{}", reason.as_str()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionStats {
    pub blocks: usize,
    pub candidates: usize,
    /// The candidate cap was hit and the highest-distance matches dropped.
    pub candidates_truncated: bool,
    pub clusters: usize,
    pub clustered_matches: usize,
    pub verified_regions: usize,
    pub inlier_matches: usize,
    pub normalization: f32,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CopyMoveResult {
    pub map: ConfidenceMap,
    /// Unnormalized votes; `None` when detection stopped before voting.
    pub raw_votes: Option<Array2<f32>>,
    /// Verified inlier matches over candidate matches.
    pub score: f64,
    pub suspicious_fraction: f64,
    pub status: DetectionStatus,
    pub regions: Vec<VerifiedRegion>,
    pub pairs: Vec<MatchPair>,
    pub stats: DetectionStats,
}

impl CopyMoveResult {
    pub fn empty(width: u32, height: u32, reason: EmptyReason, stats: DetectionStats) -> Self {
        Self {
            map: ConfidenceMap::zeros(width, height),
            raw_votes: None,
            score: 0.0,
            suspicious_fraction: 0.0,
            status: DetectionStatus::Empty(reason),
            regions: Vec::new(),
            pairs: Vec::new(),
            stats,
        }
    }

    pub fn is_detected(&self) -> bool {
        self.status == DetectionStatus::Detected
    }

    pub fn save_map<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.map.save(path)
    }
}

/// Source and destination footprint of one verified block match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPair {
    pub cluster_id: usize,
    pub source: SRegion,
    pub target: SRegion,
    /// Squared L2 descriptor distance.
    pub distance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl SRegion {
    pub fn center(&self) -> (u32, u32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }

    /// Smallest region covering both.
    pub fn union(&self, other: &SRegion) -> SRegion {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        SRegion {
            x,
            y,
            width: (self.x + self.width).max(other.x + other.width) - x,
            height: (self.y + self.height).max(other.y + other.height) - y,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub threshold: f32,
    pub metrics: PixelMetrics,
    pub mask: BinaryMask,
}
