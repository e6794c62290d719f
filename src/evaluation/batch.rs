use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    CopyMoveResult,
    analysis::{cancel::CancelToken, confidence_map::ConfidenceMap, copy_move::CopyMoveDetector},
    error::{ForensicsError, Result},
    evaluation::{
        metrics::{MapStats, MetricEvaluator, PixelMetrics},
        threshold::{BinaryMask, ThresholdPolicy},
    },
    image_utils::load_mask,
    report,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub threshold: ThresholdPolicy,
    /// Pixel tolerance of the boundary F1 score.
    pub boundary_tolerance: u32,
    pub tpr_target: f64,
    /// Worker threads; `0` uses one per core.
    pub workers: usize,
    /// Per-image detection budget in milliseconds.
    pub time_budget_ms: Option<u64>,
    /// Write raw, normalized and binarized maps under `debug/`.
    pub save_debug_maps: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            threshold: ThresholdPolicy::Otsu,
            boundary_tolerance: 1,
            tpr_target: 0.95,
            workers: 0,
            time_budget_ms: None,
            save_debug_maps: false,
        }
    }
}

impl EvaluationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.tpr_target > 0.0 && self.tpr_target <= 1.0) {
            return Err(ForensicsError::InvalidParameter(format!(
                "tpr_target must be in (0, 1], got {}",
                self.tpr_target
            )));
        }
        if let ThresholdPolicy::Percentile { percentile } = self.threshold {
            if !(0.0..=1.0).contains(&percentile) {
                return Err(ForensicsError::InvalidParameter(format!(
                    "threshold percentile must be in [0, 1], got {percentile}"
                )));
            }
        }
        Ok(())
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }
}

/// One evaluated dataset image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRow {
    pub image: String,
    pub threshold: f32,
    pub block_size: u32,
    pub stride: u32,
    pub k: usize,
    pub tau: f32,
    pub min_area: u64,
    pub metrics: PixelMetrics,
    pub map_stats: MapStats,
    pub blocks: usize,
    pub candidates: usize,
    pub kept_matches: usize,
    pub score: f64,
    pub status: String,
    pub time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFailure {
    pub image: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub rows: Vec<EvaluationRow>,
    pub failures: Vec<BatchFailure>,
    /// Images without a ground-truth mask.
    pub skipped: Vec<String>,
}

/// A forged image and its ground-truth mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetItem {
    pub name: String,
    pub image: PathBuf,
    pub mask: PathBuf,
}

/// Pairs every file of `root/forged` (or `root/fake`) with the same file name
/// in `root/mask`, sorted by name. Returns the pairs and the names that have
/// no mask.
pub fn discover_dataset(root: &Path) -> Result<(Vec<DatasetItem>, Vec<String>)> {
    let forged = root.join("forged");
    let image_dir = if forged.is_dir() { forged } else { root.join("fake") };
    let mask_dir = root.join("mask");

    let mut files = fs::read_dir(&image_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect::<Vec<_>>();
    files.sort();

    let mut items = Vec::with_capacity(files.len());
    let mut missing = Vec::new();
    for image in files {
        let Some(name) = image.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let mask = mask_dir.join(&name);
        if mask.is_file() {
            items.push(DatasetItem { name, image, mask });
        } else {
            log::warn!("Ground-truth mask not found for {}", name);
            missing.push(name);
        }
    }

    Ok((items, missing))
}

pub struct BatchRunner {
    detector: CopyMoveDetector,
    config: EvaluationConfig,
    evaluator: MetricEvaluator,
}

impl BatchRunner {
    pub fn new(detector: CopyMoveDetector, config: EvaluationConfig) -> Result<Self> {
        config.validate()?;
        let evaluator = MetricEvaluator::new(config.boundary_tolerance, config.tpr_target);
        Ok(Self {
            detector,
            config,
            evaluator,
        })
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    /// Evaluates the dataset under `root` without writing anything.
    pub fn run(&self, root: &Path) -> Result<BatchReport> {
        self.run_inner(root, None)
    }

    /// Evaluates the dataset and writes `metrics.csv`, `metrics.json` and,
    /// when enabled, debug maps into `report_dir`.
    pub fn run_to_dir(&self, root: &Path, report_dir: &Path) -> Result<BatchReport> {
        fs::create_dir_all(report_dir)?;
        let debug_dir = report_dir.join("debug");
        if self.config.save_debug_maps {
            fs::create_dir_all(&debug_dir)?;
        }

        let batch = self.run_inner(root, self.config.save_debug_maps.then_some(debug_dir.as_path()))?;
        report::write_metrics_csv(&batch.rows, report_dir.join("metrics.csv"))?;
        fs::write(report_dir.join("metrics.json"), serde_json::to_string_pretty(&batch)?)?;

        log::info!(
            "Wrote {} rows ({} failures, {} skipped) to {}",
            batch.rows.len(),
            batch.failures.len(),
            batch.skipped.len(),
            report_dir.display()
        );
        Ok(batch)
    }

    fn run_inner(&self, root: &Path, debug_dir: Option<&Path>) -> Result<BatchReport> {
        let (items, skipped) = discover_dataset(root)?;
        log::info!("Evaluating {} images from {}", items.len(), root.display());

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()
            .map_err(|e| ForensicsError::AnalysisFailed(format!("worker pool: {e}")))?;

        let outcomes = pool.install(|| {
            items
                .par_iter()
                .map(|item| self.evaluate_item(item, debug_dir))
                .collect::<Vec<_>>()
        });

        let mut batch = BatchReport {
            skipped,
            ..Default::default()
        };
        for (item, outcome) in items.iter().zip(outcomes) {
            match outcome {
                Ok(row) => batch.rows.push(row),
                Err(e) => {
                    log::warn!("Failed to evaluate {}: {}", item.name, e);
                    batch.failures.push(BatchFailure {
                        image: item.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(batch)
    }

    fn evaluate_item(&self, item: &DatasetItem, debug_dir: Option<&Path>) -> Result<EvaluationRow> {
        let started = Instant::now();
        let image = image::open(&item.image)?;
        let truth = BinaryMask::from_gray(&load_mask(&item.mask, image.width(), image.height())?);

        let cancel = match self.config.time_budget_ms {
            Some(ms) => CancelToken::with_budget(Duration::from_millis(ms)),
            None => CancelToken::new(),
        };
        let result = self.detector.detect_with_cancel(&image, &cancel);
        let (threshold, predicted) = self.config.threshold.apply(&result.map);
        let metrics = self.evaluator.evaluate(&truth, &result.map, &predicted)?;
        let time_ms = started.elapsed().as_millis() as u64;

        log::debug!(
            "{}: blocks {} candidates {} kept {} predicted {} truth {}",
            item.name,
            result.stats.blocks,
            result.stats.candidates,
            result.stats.clustered_matches,
            predicted.count(),
            truth.count()
        );

        if let Some(dir) = debug_dir {
            save_debug_maps(dir, &item.name, &result, &predicted)?;
        }

        let params = self.detector.params();
        Ok(EvaluationRow {
            image: item.name.clone(),
            threshold,
            block_size: params.block_size,
            stride: params.stride,
            k: params.k,
            tau: params.tau,
            min_area: params.min_area,
            metrics,
            map_stats: MapStats::from_map(&result.map),
            blocks: result.stats.blocks,
            candidates: result.stats.candidates,
            kept_matches: result.stats.clustered_matches,
            score: result.score,
            status: result.status.to_string(),
            time_ms,
        })
    }
}

fn save_debug_maps(dir: &Path, name: &str, result: &CopyMoveResult, predicted: &BinaryMask) -> Result<()> {
    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());

    if let Some(raw) = &result.raw_votes {
        let peak = raw.iter().copied().fold(0.0f32, f32::max);
        let scaled: Array2<f32> = if peak > 0.0 { raw / peak } else { raw.clone() };
        ConfidenceMap::from_array(scaled).save(dir.join(format!("{stem}_map_raw.png")))?;
    }
    result.map.save(dir.join(format!("{stem}_map_norm.png")))?;
    predicted.save(dir.join(format!("{stem}_map_bin.png")))?;
    Ok(())
}
