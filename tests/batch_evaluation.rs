mod common;

use std::fs;

use copymove_forensics::{
    analysis::copy_move::{CopyMoveDetector, CopyMoveParams},
    evaluation::{
        batch::{BatchRunner, EvaluationConfig, discover_dataset},
        threshold::ThresholdPolicy,
    },
};

use common::{forged_image, forged_truth, noise_image};

fn write_dataset(root: &std::path::Path) {
    let forged = root.join("forged");
    let masks = root.join("mask");
    fs::create_dir_all(&forged).unwrap();
    fs::create_dir_all(&masks).unwrap();

    forged_image(41).save(forged.join("a_forged.png")).unwrap();
    forged_truth().to_gray_image().save(masks.join("a_forged.png")).unwrap();

    noise_image(64, 64, 2).save(forged.join("b_unlabelled.png")).unwrap();

    fs::write(forged.join("c_broken.png"), b"definitely not a png").unwrap();
    forged_truth().to_gray_image().save(masks.join("c_broken.png")).unwrap();
}

#[test]
fn test_dataset_discovery_pairs_masks() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path());

    let (items, missing) = discover_dataset(dir.path()).unwrap();
    let names = items.iter().map(|i| i.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, ["a_forged.png", "c_broken.png"]);
    assert_eq!(missing, ["b_unlabelled.png"]);
}

#[test]
fn test_fake_directory_fallback() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("fake")).unwrap();
    fs::create_dir_all(dir.path().join("mask")).unwrap();
    noise_image(32, 32, 1).save(dir.path().join("fake/x.png")).unwrap();
    noise_image(32, 32, 1).save(dir.path().join("mask/x.png")).unwrap();

    let (items, missing) = discover_dataset(dir.path()).unwrap();
    assert_eq!(items.len(), 1);
    assert!(missing.is_empty());
}

#[test]
fn test_batch_run_writes_reports() {
    let dataset = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_dataset(dataset.path());

    let config = EvaluationConfig {
        threshold: ThresholdPolicy::Fixed { value: 0.01 },
        workers: 2,
        save_debug_maps: true,
        ..Default::default()
    };
    let detector = CopyMoveDetector::new(CopyMoveParams::default()).unwrap();
    let runner = BatchRunner::new(detector, config).unwrap();
    let report = runner.run_to_dir(dataset.path(), output.path()).unwrap();

    assert_eq!(report.rows.len(), 1);
    assert_eq!(report.skipped, ["b_unlabelled.png"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].image, "c_broken.png");

    let row = &report.rows[0];
    assert_eq!(row.image, "a_forged.png");
    assert_eq!(row.blocks, 3721);
    assert_eq!(row.status, "detected");
    assert!(row.metrics.region_iou >= 0.2);
    assert!(row.metrics.roc_auc > 0.9);

    let csv = fs::read_to_string(output.path().join("metrics.csv")).unwrap();
    assert_eq!(csv.lines().count(), 2);
    assert!(csv.lines().nth(1).unwrap().starts_with("a_forged.png,0.010,16,4,5,0.10,50,"));

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(output.path().join("metrics.json")).unwrap()).unwrap();
    assert_eq!(json["rows"].as_array().unwrap().len(), 1);

    let debug = output.path().join("debug");
    for suffix in ["raw", "norm", "bin"] {
        assert!(debug.join(format!("a_forged_map_{suffix}.png")).is_file());
    }
}
