use std::{fmt, path::Path};

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::{
    DetectionStatus, EmptyReason,
    analysis::{cancel::CancelToken, confidence_map::ConfidenceMap, copy_move::CopyMoveDetector},
    error::ForensicsError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    None,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl ConfidenceLevel {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s < 0.2 => ConfidenceLevel::None,
            s if s < 0.4 => ConfidenceLevel::Low,
            s if s < 0.6 => ConfidenceLevel::Medium,
            s if s < 0.8 => ConfidenceLevel::High,
            _ => ConfidenceLevel::VeryHigh,
        }
    }
}

/// Why a check produced no score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckFailure {
    Decode(String),
    Cancelled,
    Error(String),
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckFailure::Decode(msg) => write!(f, "decode failure: {msg}"),
            CheckFailure::Cancelled => f.write_str("cancelled"),
            CheckFailure::Error(msg) => f.write_str(msg),
        }
    }
}

impl From<ForensicsError> for CheckFailure {
    fn from(error: ForensicsError) -> Self {
        match error {
            ForensicsError::ImageLoad(e) => CheckFailure::Decode(e.to_string()),
            other => CheckFailure::Error(other.to_string()),
        }
    }
}

/// Result of one forensic check on one image: a score and map, or a
/// structured failure for the caller to merge with other checks.
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    Scored {
        check: String,
        score: f64,
        level: ConfidenceLevel,
        map: ConfidenceMap,
        status: DetectionStatus,
    },
    Failed {
        check: String,
        failure: CheckFailure,
    },
}

impl CheckOutcome {
    pub fn failed(check: &str, failure: CheckFailure) -> Self {
        CheckOutcome::Failed {
            check: check.to_string(),
            failure,
        }
    }

    pub fn check(&self) -> &str {
        match self {
            CheckOutcome::Scored { check, .. } | CheckOutcome::Failed { check, .. } => check,
        }
    }

    pub fn score(&self) -> Option<f64> {
        match self {
            CheckOutcome::Scored { score, .. } => Some(*score),
            CheckOutcome::Failed { .. } => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, CheckOutcome::Failed { .. })
    }
}

pub trait ForensicCheck: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn run(&self, image: &DynamicImage, cancel: &CancelToken) -> CheckOutcome;

    /// Decodes `path` and runs the check; decode errors become failures.
    fn run_file(&self, path: &Path, cancel: &CancelToken) -> CheckOutcome {
        match image::open(path) {
            Ok(image) => self.run(&image, cancel),
            Err(e) => {
                log::warn!("Could not decode {}: {}", path.display(), e);
                CheckOutcome::failed(self.name(), ForensicsError::from(e).into())
            }
        }
    }
}

impl ForensicCheck for CopyMoveDetector {
    fn name(&self) -> &str {
        "copy_move"
    }

    fn description(&self) -> &str {
        "Dense block DCT matching with offset clustering and affine verification"
    }

    fn run(&self, image: &DynamicImage, cancel: &CancelToken) -> CheckOutcome {
        let result = self.detect_with_cancel(image, cancel);
        if result.status == DetectionStatus::Empty(EmptyReason::Cancelled) {
            return CheckOutcome::failed(self.name(), CheckFailure::Cancelled);
        }

        CheckOutcome::Scored {
            check: self.name().to_string(),
            score: result.score,
            level: ConfidenceLevel::from_score(result.score),
            map: result.map,
            status: result.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::copy_move::CopyMoveParams;

    fn detector() -> CopyMoveDetector {
        CopyMoveDetector::new(CopyMoveParams::default()).unwrap()
    }

    #[test]
    fn test_confidence_level_bands() {
        assert_eq!(ConfidenceLevel::from_score(0.0), ConfidenceLevel::None);
        assert_eq!(ConfidenceLevel::from_score(0.5), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_score(0.95), ConfidenceLevel::VeryHigh);
    }

    #[test]
    fn test_empty_result_is_scored_zero() {
        let outcome = detector().run(&DynamicImage::new_luma8(8, 8), &CancelToken::new());
        assert_eq!(outcome.score(), Some(0.0));
        assert_eq!(outcome.check(), "copy_move");
    }

    #[test]
    fn test_cancelled_run_is_failure() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = detector().run(&DynamicImage::new_luma8(64, 64), &cancel);
        assert!(matches!(
            outcome,
            CheckOutcome::Failed {
                failure: CheckFailure::Cancelled,
                ..
            }
        ));
    }

    #[test]
    fn test_undecodable_file_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not an image").unwrap();
        let outcome = detector().run_file(&path, &CancelToken::new());
        assert!(matches!(
            outcome,
            CheckOutcome::Failed {
                failure: CheckFailure::Decode(_),
                ..
            }
        ));
    }
}
