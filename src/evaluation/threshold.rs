use std::path::Path;

use image::{GrayImage, Luma};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{analysis::confidence_map::ConfidenceMap, error::Result};

const OTSU_BINS: usize = 256;

/// How a confidence map is turned into a binary mask.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ThresholdPolicy {
    /// Between-class variance maximizing threshold over a 256-bin histogram.
    #[default]
    Otsu,
    /// Value at `percentile` of all map values.
    Percentile { percentile: f64 },
    Fixed { value: f32 },
}

impl ThresholdPolicy {
    pub fn select(&self, map: &ConfidenceMap) -> f32 {
        match *self {
            ThresholdPolicy::Otsu => otsu_threshold(map.values()),
            ThresholdPolicy::Percentile { percentile } => percentile_threshold(map.values(), percentile),
            ThresholdPolicy::Fixed { value } => value,
        }
    }

    /// Selects a threshold and binarizes `map` with it.
    pub fn apply(&self, map: &ConfidenceMap) -> (f32, BinaryMask) {
        let threshold = self.select(map);
        (threshold, binarize(map, threshold))
    }
}

pub fn otsu_threshold(values: &Array2<f32>) -> f32 {
    let mut hist = [0u64; OTSU_BINS];
    for &v in values {
        let bin = (v.clamp(0.0, 1.0) * (OTSU_BINS - 1) as f32).round() as usize;
        hist[bin] += 1;
    }

    let total = values.len() as f64;
    let sum_all = hist.iter().enumerate().map(|(i, &c)| i as f64 * c as f64).sum::<f64>();

    let mut weight_bg = 0.0;
    let mut sum_bg = 0.0;
    let mut best_variance = 0.0;
    let mut best_bin = 0;

    for (i, &count) in hist.iter().enumerate() {
        weight_bg += count as f64;
        if weight_bg == 0.0 {
            continue;
        }
        let weight_fg = total - weight_bg;
        if weight_fg == 0.0 {
            break;
        }

        sum_bg += i as f64 * count as f64;
        let mean_bg = sum_bg / weight_bg;
        let mean_fg = (sum_all - sum_bg) / weight_fg;
        let between = weight_bg * weight_fg * (mean_bg - mean_fg).powi(2);

        if between > best_variance {
            best_variance = between;
            best_bin = i;
        }
    }

    best_bin as f32 / (OTSU_BINS - 1) as f32
}

/// Value at rank `floor(p * (n - 1))` of all map values, zeros included.
pub fn percentile_threshold(values: &Array2<f32>, percentile: f64) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.iter().copied().collect::<Vec<_>>();
    let rank = ((percentile.clamp(0.0, 1.0) * (sorted.len() - 1) as f64).floor() as usize).min(sorted.len() - 1);
    let (_, value, _) = sorted.select_nth_unstable_by(rank, |a, b| a.total_cmp(b));
    *value
}

/// Marks pixels with a positive confidence of at least `threshold`.
pub fn binarize(map: &ConfidenceMap, threshold: f32) -> BinaryMask {
    BinaryMask {
        values: map.values().mapv(|v| v > 0.0 && v >= threshold),
    }
}

/// Boolean pixel mask indexed `[[y, x]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMask {
    values: Array2<bool>,
}

impl BinaryMask {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            values: Array2::from_elem((height as usize, width as usize), false),
        }
    }

    pub fn from_array(values: Array2<bool>) -> Self {
        Self { values }
    }

    /// Foreground is every pixel brighter than 127.
    pub fn from_gray(image: &GrayImage) -> Self {
        let (width, height) = image.dimensions();
        let mut values = Array2::from_elem((height as usize, width as usize), false);
        for (x, y, pixel) in image.enumerate_pixels() {
            values[[y as usize, x as usize]] = pixel[0] > 127;
        }
        Self { values }
    }

    pub fn width(&self) -> u32 {
        self.values.ncols() as u32
    }

    pub fn height(&self) -> u32 {
        self.values.nrows() as u32
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        self.values[[y as usize, x as usize]]
    }

    pub fn set(&mut self, x: u32, y: u32, value: bool) {
        self.values[[y as usize, x as usize]] = value;
    }

    pub fn values(&self) -> &Array2<bool> {
        &self.values
    }

    pub fn count(&self) -> usize {
        self.values.iter().filter(|&&v| v).count()
    }

    pub fn to_gray_image(&self) -> GrayImage {
        let mut image = GrayImage::new(self.width(), self.height());
        for ((y, x), &v) in self.values.indexed_iter() {
            if v {
                image.put_pixel(x as u32, y as u32, Luma([255]));
            }
        }
        image
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.to_gray_image().save(path)?;
        Ok(())
    }
}
