use std::{cmp::Ordering, collections::HashMap};

use image::{GrayImage, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median, OrderStatistics, Statistics};

use crate::{
    analysis::confidence_map::ConfidenceMap,
    error::{ForensicsError, Result},
    evaluation::threshold::BinaryMask,
};

/// Pixel and region quality of one confidence map against ground truth.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PixelMetrics {
    pub roc_auc: f64,
    pub pr_auc: f64,
    pub nss: f64,
    pub fpr_at_tpr: f64,
    pub average_precision: f64,
    pub iou: f64,
    pub dice: f64,
    pub mcc: f64,
    pub boundary_f1: f64,
    pub region_iou: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MapStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub q95: f64,
}

impl MapStats {
    pub fn from_map(map: &ConfidenceMap) -> Self {
        let values = map.values().iter().map(|&v| v as f64).collect::<Vec<_>>();
        if values.is_empty() {
            return Self::default();
        }

        let min = Statistics::min(&values);
        let max = Statistics::max(&values);
        let mean = Statistics::mean(&values);
        let mut data = Data::new(values);

        Self {
            min,
            max,
            mean,
            median: data.median(),
            q95: data.quantile(0.95),
        }
    }
}

pub struct MetricEvaluator {
    boundary_tolerance: u32,
    tpr_target: f64,
}

impl Default for MetricEvaluator {
    fn default() -> Self {
        Self::new(1, 0.95)
    }
}

impl MetricEvaluator {
    pub fn new(boundary_tolerance: u32, tpr_target: f64) -> Self {
        Self {
            boundary_tolerance,
            tpr_target,
        }
    }

    /// Score metrics use `map`; overlap metrics use `predicted`.
    pub fn evaluate(&self, truth: &BinaryMask, map: &ConfidenceMap, predicted: &BinaryMask) -> Result<PixelMetrics> {
        check_dimensions(truth.dimensions(), map.dimensions())?;
        check_dimensions(truth.dimensions(), predicted.dimensions())?;

        let curve = ScoreCurve::new(truth, map);
        let counts = Confusion::new(truth, predicted);

        Ok(PixelMetrics {
            roc_auc: curve.roc_auc(),
            pr_auc: curve.pr_auc(),
            nss: nss(truth, map),
            fpr_at_tpr: curve.fpr_at_tpr(self.tpr_target),
            average_precision: curve.average_precision(),
            iou: counts.iou(),
            dice: counts.dice(),
            mcc: counts.mcc(),
            boundary_f1: boundary_f1(truth, predicted, self.boundary_tolerance),
            region_iou: region_iou(truth, predicted),
        })
    }
}

fn check_dimensions(expected: (u32, u32), actual: (u32, u32)) -> Result<()> {
    if expected != actual {
        return Err(ForensicsError::DimensionMismatch { expected, actual });
    }
    Ok(())
}

/// Cumulative `(tp, fp)` after each group of tied scores, highest first.
struct ScoreCurve {
    points: Vec<(f64, f64)>,
    positives: f64,
    negatives: f64,
}

impl ScoreCurve {
    fn new(truth: &BinaryMask, map: &ConfidenceMap) -> Self {
        let mut pairs = map
            .values()
            .iter()
            .zip(truth.values().iter())
            .map(|(&score, &label)| (score, label))
            .collect::<Vec<_>>();
        pairs.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));

        let positives = pairs.iter().filter(|p| p.1).count() as f64;
        let negatives = pairs.len() as f64 - positives;

        let mut points = Vec::new();
        let (mut tp, mut fp) = (0.0, 0.0);
        for (i, &(score, label)) in pairs.iter().enumerate() {
            if label {
                tp += 1.0;
            } else {
                fp += 1.0;
            }
            let group_ends = pairs
                .get(i + 1)
                .is_none_or(|next| next.0.total_cmp(&score) != Ordering::Equal);
            if group_ends {
                points.push((tp, fp));
            }
        }

        Self {
            points,
            positives,
            negatives,
        }
    }

    fn roc_auc(&self) -> f64 {
        if self.positives == 0.0 || self.negatives == 0.0 {
            return 0.0;
        }
        let (mut auc, mut prev_tpr, mut prev_fpr) = (0.0, 0.0, 0.0);
        for &(tp, fp) in &self.points {
            let (tpr, fpr) = (tp / self.positives, fp / self.negatives);
            auc += (fpr - prev_fpr) * (tpr + prev_tpr) / 2.0;
            prev_tpr = tpr;
            prev_fpr = fpr;
        }
        auc
    }

    fn pr_auc(&self) -> f64 {
        if self.positives == 0.0 {
            return 0.0;
        }
        let (mut auc, mut prev_recall, mut prev_precision) = (0.0, 0.0, 1.0);
        for &(tp, fp) in &self.points {
            let recall = tp / self.positives;
            let precision = tp / (tp + fp);
            auc += (recall - prev_recall) * (precision + prev_precision) / 2.0;
            prev_recall = recall;
            prev_precision = precision;
        }
        auc
    }

    fn average_precision(&self) -> f64 {
        if self.positives == 0.0 {
            return 0.0;
        }
        let (mut ap, mut prev_recall) = (0.0, 0.0);
        for &(tp, fp) in &self.points {
            let recall = tp / self.positives;
            ap += tp / (tp + fp) * (recall - prev_recall);
            prev_recall = recall;
        }
        ap
    }

    /// False positive rate at the first cut reaching `target` recall; 1.0
    /// when no cut does.
    fn fpr_at_tpr(&self, target: f64) -> f64 {
        if self.positives == 0.0 || self.negatives == 0.0 {
            return 0.0;
        }
        self.points
            .iter()
            .find(|&&(tp, _)| tp / self.positives >= target)
            .map_or(1.0, |&(_, fp)| fp / self.negatives)
    }
}

pub fn roc_auc(truth: &BinaryMask, map: &ConfidenceMap) -> f64 {
    ScoreCurve::new(truth, map).roc_auc()
}

pub fn pr_auc(truth: &BinaryMask, map: &ConfidenceMap) -> f64 {
    ScoreCurve::new(truth, map).pr_auc()
}

pub fn average_precision(truth: &BinaryMask, map: &ConfidenceMap) -> f64 {
    ScoreCurve::new(truth, map).average_precision()
}

pub fn fpr_at_tpr(truth: &BinaryMask, map: &ConfidenceMap, target: f64) -> f64 {
    ScoreCurve::new(truth, map).fpr_at_tpr(target)
}

/// Normalized scanpath saliency: mean z-scored confidence over the
/// ground-truth pixels.
pub fn nss(truth: &BinaryMask, map: &ConfidenceMap) -> f64 {
    let scores = map.values().iter().map(|&v| v as f64).collect::<Vec<_>>();
    if scores.is_empty() {
        return 0.0;
    }
    let mean = Statistics::mean(&scores);
    let std = Statistics::population_std_dev(&scores);
    if !(std > 0.0) {
        return 0.0;
    }

    let (sum, count) = scores
        .iter()
        .zip(truth.values().iter())
        .filter(|(_, label)| **label)
        .fold((0.0, 0usize), |(sum, count), (score, _)| (sum + (score - mean) / std, count + 1));

    if count == 0 { 0.0 } else { sum / count as f64 }
}

#[derive(Debug, Clone, Copy, Default)]
struct Confusion {
    tp: f64,
    tn: f64,
    fp: f64,
    fn_: f64,
}

impl Confusion {
    fn new(truth: &BinaryMask, predicted: &BinaryMask) -> Self {
        let mut counts = Self::default();
        Zip::from(truth.values()).and(predicted.values()).for_each(|&gt, &pr| match (gt, pr) {
            (true, true) => counts.tp += 1.0,
            (false, true) => counts.fp += 1.0,
            (true, false) => counts.fn_ += 1.0,
            (false, false) => counts.tn += 1.0,
        });
        counts
    }

    fn iou(&self) -> f64 {
        let denom = self.tp + self.fp + self.fn_;
        if denom == 0.0 { 0.0 } else { self.tp / denom }
    }

    fn dice(&self) -> f64 {
        let denom = 2.0 * self.tp + self.fp + self.fn_;
        if denom == 0.0 { 0.0 } else { 2.0 * self.tp / denom }
    }

    fn mcc(&self) -> f64 {
        let denom = ((self.tp + self.fp) * (self.tp + self.fn_) * (self.tn + self.fp) * (self.tn + self.fn_)).sqrt();
        if denom == 0.0 {
            0.0
        } else {
            (self.tp * self.tn - self.fp * self.fn_) / denom
        }
    }
}

pub fn iou(truth: &BinaryMask, predicted: &BinaryMask) -> f64 {
    Confusion::new(truth, predicted).iou()
}

pub fn dice(truth: &BinaryMask, predicted: &BinaryMask) -> f64 {
    Confusion::new(truth, predicted).dice()
}

pub fn mcc(truth: &BinaryMask, predicted: &BinaryMask) -> f64 {
    Confusion::new(truth, predicted).mcc()
}

/// Foreground pixels on the image border or with a 4-neighbour in the
/// background.
fn edges(mask: &Array2<bool>) -> Array2<bool> {
    let (h, w) = mask.dim();
    Array2::from_shape_fn((h, w), |(y, x)| {
        mask[[y, x]]
            && (x == 0
                || y == 0
                || x == w - 1
                || y == h - 1
                || !mask[[y, x - 1]]
                || !mask[[y, x + 1]]
                || !mask[[y - 1, x]]
                || !mask[[y + 1, x]])
    })
}

/// Square dilation with a `(2r + 1)` window clipped at the border.
fn dilate(mask: &Array2<bool>, radius: usize) -> Array2<bool> {
    if radius == 0 {
        return mask.clone();
    }
    let (h, w) = mask.dim();
    let rows = Array2::from_shape_fn((h, w), |(y, x)| {
        (x.saturating_sub(radius)..=(x + radius).min(w - 1)).any(|i| mask[[y, i]])
    });
    Array2::from_shape_fn((h, w), |(y, x)| {
        (y.saturating_sub(radius)..=(y + radius).min(h - 1)).any(|j| rows[[j, x]])
    })
}

/// F1 of boundary pixels, an edge pixel counting as matched when the other
/// mask has an edge within `tolerance` pixels (Chebyshev distance).
pub fn boundary_f1(truth: &BinaryMask, predicted: &BinaryMask, tolerance: u32) -> f64 {
    let truth_edges = edges(truth.values());
    let predicted_edges = edges(predicted.values());
    let truth_near = dilate(&truth_edges, tolerance as usize);
    let predicted_near = dilate(&predicted_edges, tolerance as usize);

    let (mut tp, mut fp, mut fn_) = (0.0, 0.0, 0.0);
    Zip::from(&truth_edges).and(&predicted_near).for_each(|&edge, &near| {
        if edge {
            if near {
                tp += 1.0;
            } else {
                fn_ += 1.0;
            }
        }
    });
    Zip::from(&predicted_edges).and(&truth_near).for_each(|&edge, &near| {
        if edge && !near {
            fp += 1.0;
        }
    });

    let denom = 2.0 * tp + fp + fn_;
    if denom == 0.0 { 0.0 } else { 2.0 * tp / denom }
}

fn label_components(mask: &BinaryMask) -> (Vec<u32>, Vec<u64>) {
    let mut image = GrayImage::new(mask.width(), mask.height());
    for ((y, x), &v) in mask.values().indexed_iter() {
        if v {
            image.put_pixel(x as u32, y as u32, Luma([255]));
        }
    }

    let labels = connected_components(&image, Connectivity::Four, Luma([0u8]));
    let labels = labels.pixels().map(|p| p[0]).collect::<Vec<_>>();
    let count = labels.iter().copied().max().unwrap_or(0) as usize;
    let mut areas = vec![0u64; count + 1];
    for &label in &labels {
        areas[label as usize] += 1;
    }
    (labels, areas)
}

/// Mean over ground-truth 4-connected components of the IoU with the
/// predicted component overlapping it most. `0.0` without ground truth.
pub fn region_iou(truth: &BinaryMask, predicted: &BinaryMask) -> f64 {
    let (truth_labels, truth_areas) = label_components(truth);
    let (predicted_labels, predicted_areas) = label_components(predicted);
    let truth_count = truth_areas.len() - 1;
    if truth_count == 0 {
        return 0.0;
    }

    let mut overlaps: HashMap<(u32, u32), u64> = HashMap::new();
    for (&g, &p) in truth_labels.iter().zip(&predicted_labels) {
        if g > 0 && p > 0 {
            *overlaps.entry((g, p)).or_default() += 1;
        }
    }

    let mut best = vec![(0u64, 0u32); truth_count + 1];
    for (&(g, p), &inter) in &overlaps {
        let slot = &mut best[g as usize];
        if inter > slot.0 || (inter == slot.0 && p < slot.1) {
            *slot = (inter, p);
        }
    }

    let total = best
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, (inter, _))| *inter > 0)
        .map(|(g, &(inter, p))| {
            let union = truth_areas[g] + predicted_areas[p as usize] - inter;
            inter as f64 / union as f64
        })
        .sum::<f64>();

    total / truth_count as f64
}
