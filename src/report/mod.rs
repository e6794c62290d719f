pub mod visualization;

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use serde::Serialize;

use crate::{
    CopyMoveResult, DetectionStats, EvaluationResult,
    error::Result,
    evaluation::{
        batch::EvaluationRow,
        metrics::{MapStats, PixelMetrics},
    },
};

#[derive(Serialize)]
pub struct JsonReport {
    pub copy_move_analysis: CopyMoveReportSection,
    pub regions: Vec<RegionReportSection>,
    pub map: MapStats,
    pub evaluation: Option<EvaluationReportSection>,
}

#[derive(Serialize)]
pub struct CopyMoveReportSection {
    pub status: String,
    pub score: f64,
    pub suspicious_fraction: f64,
    pub match_count: usize,
    pub stats: DetectionStats,
}

#[derive(Serialize)]
pub struct RegionReportSection {
    pub cluster_id: usize,
    pub inlier_count: usize,
    pub inlier_ratio: f64,
    pub translation: (f64, f64),
    pub rotation_degrees: f64,
    pub scale: f64,
}

#[derive(Serialize)]
pub struct EvaluationReportSection {
    pub threshold: f32,
    pub predicted_pixels: usize,
    pub metrics: PixelMetrics,
}

impl From<&CopyMoveResult> for JsonReport {
    fn from(result: &CopyMoveResult) -> Self {
        Self {
            copy_move_analysis: CopyMoveReportSection {
                status: result.status.to_string(),
                score: result.score,
                suspicious_fraction: result.suspicious_fraction,
                match_count: result.pairs.len(),
                stats: result.stats.clone(),
            },
            regions: result
                .regions
                .iter()
                .map(|region| RegionReportSection {
                    cluster_id: region.cluster_id,
                    inlier_count: region.inlier_count(),
                    inlier_ratio: region.inlier_ratio,
                    translation: region.model.translation_components(),
                    rotation_degrees: region.model.rotation_angle().to_degrees(),
                    scale: region.model.determinant().abs().sqrt(),
                })
                .collect(),
            map: MapStats::from_map(&result.map),
            evaluation: None,
        }
    }
}

impl JsonReport {
    pub fn with_evaluation(mut self, evaluation: &EvaluationResult) -> Self {
        self.evaluation = Some(EvaluationReportSection {
            threshold: evaluation.threshold,
            predicted_pixels: evaluation.mask.count(),
            metrics: evaluation.metrics,
        });
        self
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

const CSV_HEADER: &str = "image,threshold,blockSize,stride,K,tau,minArea,ROC_AUC,PRAUC,NSS,IoU,Dice,MCC,FprAtTPR,AP,BoundaryF1,RegionIoU,blocks,candidates,kept,score,status,TimeMs";

/// Writes one CSV line per row, with a header line first.
pub fn write_metrics_table<W: Write>(rows: &[EvaluationRow], mut out: W) -> Result<()> {
    writeln!(out, "{CSV_HEADER}")?;
    for row in rows {
        let m = &row.metrics;
        writeln!(
            out,
            "{},{:.3},{},{},{},{:.2},{},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{},{},{},{:.4},{},{}",
            csv_field(&row.image),
            row.threshold,
            row.block_size,
            row.stride,
            row.k,
            row.tau,
            row.min_area,
            m.roc_auc,
            m.pr_auc,
            m.nss,
            m.iou,
            m.dice,
            m.mcc,
            m.fpr_at_tpr,
            m.average_precision,
            m.boundary_f1,
            m.region_iou,
            row.blocks,
            row.candidates,
            row.kept_matches,
            row.score,
            row.status,
            row.time_ms
        )?;
    }
    out.flush()?;
    Ok(())
}

pub fn write_metrics_csv<P: AsRef<Path>>(rows: &[EvaluationRow], path: P) -> Result<()> {
    write_metrics_table(rows, BufWriter::new(File::create(path)?))
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
