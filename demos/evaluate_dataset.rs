//! Dataset Evaluation Example
//!
//! Evaluates the detector over `<dataset>/forged` (or `fake`) against
//! `<dataset>/mask` and writes `metrics.csv` and `metrics.json`.
//!
//! Run with: cargo run --example evaluate_dataset -- <dataset_root> [report_dir] [config.json]

use std::{env, path::Path};

use copymove_forensics::{
    AnalysisConfig, analysis::copy_move::CopyMoveDetector, error::Result, evaluation::batch::BatchRunner,
};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        println!("Usage: {} <dataset_root> [report_dir] [config.json]", args[0]);
        return Ok(());
    }

    let root = Path::new(&args[1]);
    let report_dir = Path::new(args.get(2).map(|s| s.as_str()).unwrap_or("./report"));
    let config = match args.get(3) {
        Some(path) => AnalysisConfig::from_json_file(path)?,
        None => AnalysisConfig::default(),
    };

    let runner = BatchRunner::new(CopyMoveDetector::new(config.copy_move)?, config.evaluation)?;
    let report = runner.run_to_dir(root, report_dir)?;

    println!("Evaluated {} images", report.rows.len());
    if !report.rows.is_empty() {
        let n = report.rows.len() as f64;
        let mean = |f: fn(&copymove_forensics::evaluation::metrics::PixelMetrics) -> f64| {
            report.rows.iter().map(|r| f(&r.metrics)).sum::<f64>() / n
        };
        println!("  mean ROC-AUC:    {:.3}", mean(|m| m.roc_auc));
        println!("  mean IoU:        {:.3}", mean(|m| m.iou));
        println!("  mean region IoU: {:.3}", mean(|m| m.region_iou));
    }
    for failure in &report.failures {
        println!("  failed: {} ({})", failure.image, failure.reason);
    }
    if !report.skipped.is_empty() {
        println!("  skipped {} images without masks", report.skipped.len());
    }

    Ok(())
}
