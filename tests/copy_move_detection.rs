mod common;

use std::{sync::Arc, time::Duration};

use copymove_forensics::{
    DetectionStatus, EmptyReason, ForensicsAnalyzer,
    analysis::{
        cancel::CancelToken,
        copy_move::{CopyMoveDetector, CopyMoveParams},
        transform_cache::TransformCache,
    },
    evaluation::{
        metrics::region_iou,
        threshold::{ThresholdPolicy, binarize},
    },
};
use image::DynamicImage;

use common::{OFFSET, PATCH, SOURCE, destination, forged_image, forged_truth, noise_image};

fn detector(params: CopyMoveParams) -> CopyMoveDetector {
    CopyMoveDetector::new(params).unwrap()
}

#[test]
fn test_translated_patch_is_localized() {
    let image = forged_image(7);
    let result = detector(CopyMoveParams::default()).detect_gray(&image, &CancelToken::new());

    assert_eq!(result.stats.blocks, 3721);
    assert!(result.stats.candidates > 0);
    assert_eq!(result.status, DetectionStatus::Detected);
    assert!(!result.regions.is_empty());
    assert!(result.score > 0.0 && result.score <= 1.0);

    for region in &result.regions {
        assert!(region.inlier_count() as u64 * 16 * 16 >= 50);
        assert!(region.inlier_count() >= 20);
        for m in &region.matches {
            assert!(m.shift() >= 20.0);
            assert_eq!(m.offset.0.unsigned_abs(), OFFSET.0);
            assert_eq!(m.offset.1.unsigned_abs(), OFFSET.1);
        }
    }

    let center = PATCH / 2;
    assert!(result.map.get(SOURCE.0 + center, SOURCE.1 + center) > 0.0);
    let (dx, dy) = destination();
    assert!(result.map.get(dx + center, dy + center) > 0.0);
    assert_eq!(result.map.get(5, 250), 0.0);

    let predicted = binarize(&result.map, 0.01);
    assert!(region_iou(&forged_truth(), &predicted) >= 0.2);
}

#[test]
fn test_confidence_stays_in_unit_range() {
    let image = forged_image(11);
    for percentile in [0.5, 0.95, 0.99, 1.0] {
        let params = CopyMoveParams::default().with_norm_percentile(percentile);
        let result = detector(params).detect_gray(&image, &CancelToken::new());
        assert!(result.map.values().iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert!(result.map.values().iter().any(|&v| v == 1.0));
    }
}

#[test]
fn test_clean_noise_yields_empty_map() {
    let image = noise_image(256, 256, 3);
    let result = detector(CopyMoveParams::default()).detect_gray(&image, &CancelToken::new());

    assert_eq!(result.status, DetectionStatus::Empty(EmptyReason::NoCandidateMatches));
    assert_eq!(result.score, 0.0);
    assert!(result.map.is_all_zero());
    assert_eq!(result.map.dimensions(), (256, 256));
}

#[test]
fn test_detection_is_deterministic() {
    let image = DynamicImage::ImageLuma8(forged_image(5));
    let detector = detector(CopyMoveParams::default());

    let first = detector.detect(&image);
    let second = detector.detect(&image);

    assert_eq!(first.map, second.map);
    assert_eq!(first.raw_votes, second.raw_votes);
    assert_eq!(first.score, second.score);
    assert_eq!(first.pairs, second.pairs);
}

#[test]
fn test_concurrent_calls_agree() {
    let image = forged_image(9);
    let cache = Arc::new(TransformCache::new());
    let detector = detector(CopyMoveParams::default()).with_cache(Arc::clone(&cache));
    let reference = detector.detect_gray(&image, &CancelToken::new());

    std::thread::scope(|scope| {
        let handles = (0..4)
            .map(|_| scope.spawn(|| detector.detect_gray(&image, &CancelToken::new())))
            .collect::<Vec<_>>();
        for handle in handles {
            assert_eq!(handle.join().unwrap().map, reference.map);
        }
    });
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_large_min_shift_rejects_the_copy() {
    let image = forged_image(13);
    let params = CopyMoveParams::default().with_matching(5, 0.10, 100.0);
    let result = detector(params).detect_gray(&image, &CancelToken::new());

    assert_eq!(result.status, DetectionStatus::Empty(EmptyReason::NoCandidateMatches));
    assert!(result.map.is_all_zero());
}

#[test]
fn test_large_min_area_rejects_the_copy() {
    let image = forged_image(17);
    let params = CopyMoveParams::default().with_min_area(64 * 64);
    let result = detector(params).detect_gray(&image, &CancelToken::new());

    assert!(!result.is_detected());
    assert!(result.map.is_all_zero());
    assert_eq!(result.score, 0.0);
}

#[test]
fn test_strict_min_pts_leaves_no_clusters() {
    let image = forged_image(19);
    let params = CopyMoveParams::default().with_clustering(5.0, 200);
    let result = detector(params).detect_gray(&image, &CancelToken::new());
    assert_eq!(result.status, DetectionStatus::Empty(EmptyReason::NoClusters));
}

#[test]
fn test_expired_budget_returns_cancelled_result() {
    let image = forged_image(23);
    let cancel = CancelToken::with_budget(Duration::ZERO);
    let result = detector(CopyMoveParams::default()).detect_gray(&image, &cancel);

    assert_eq!(result.status, DetectionStatus::Empty(EmptyReason::Cancelled));
    assert!(result.map.is_all_zero());
    assert!(result.regions.is_empty());
}

#[test]
fn test_percentile_thresholds_are_monotone() {
    let result = detector(CopyMoveParams::default()).detect_gray(&forged_image(29), &CancelToken::new());
    let mut previous = usize::MAX;
    for percentile in [0.0, 0.5, 0.9, 0.97, 0.99, 1.0] {
        let (_, mask) = ThresholdPolicy::Percentile { percentile }.apply(&result.map);
        assert!(mask.count() <= previous);
        previous = mask.count();
    }
}

#[test]
fn test_analyzer_evaluates_against_truth() {
    let analyzer = ForensicsAnalyzer::from_image(DynamicImage::ImageLuma8(forged_image(31)));
    let result = analyzer.detect_copy_move().unwrap();
    let evaluation = analyzer.evaluate(&result, &forged_truth()).unwrap();

    assert!(evaluation.metrics.roc_auc > 0.9);
    assert!(evaluation.metrics.region_iou >= 0.2);
    assert!(evaluation.mask.count() > 0);
}
