use std::path::Path;

use image::{GrayImage, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};
use ndarray::{Array2, Zip};

use crate::{
    analysis::{block_features::BlockFeatures, geometric::VerifiedRegion},
    error::Result,
    image_utils::unit_array_to_gray,
};

/// Per-pixel copy-move confidence in `[0, 1]`, indexed `[[y, x]]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceMap {
    values: Array2<f32>,
}

impl ConfidenceMap {
    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            values: Array2::zeros((height as usize, width as usize)),
        }
    }

    /// Wraps `values`, clamping every entry into `[0, 1]` (NaN becomes 0).
    pub fn from_array(mut values: Array2<f32>) -> Self {
        values.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) });
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

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.values[[y as usize, x as usize]]
    }

    pub fn values(&self) -> &Array2<f32> {
        &self.values
    }

    pub fn into_array(self) -> Array2<f32> {
        self.values
    }

    pub fn is_all_zero(&self) -> bool {
        self.values.iter().all(|&v| v == 0.0)
    }

    pub fn nonzero_count(&self) -> usize {
        self.values.iter().filter(|&&v| v > 0.0).count()
    }

    /// Fraction of pixels whose confidence is at least `threshold`.
    pub fn fraction_at_least(&self, threshold: f32) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let hits = self.values.iter().filter(|&&v| v > 0.0 && v >= threshold).count();
        hits as f64 / self.values.len() as f64
    }

    pub fn to_gray_image(&self) -> GrayImage {
        unit_array_to_gray(&self.values)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.to_gray_image().save(path)?;
        Ok(())
    }
}

/// Output of [`ConfidenceMapBuilder::build`].
#[derive(Debug, Clone)]
pub struct BuiltMap {
    /// Unnormalized vote counts.
    pub raw_votes: Array2<f32>,
    pub map: ConfidenceMap,
    /// Divisor applied to the votes; `0.0` when there were none.
    pub normalization: f32,
}

pub struct ConfidenceMapBuilder {
    norm_percentile: f64,
    morph_kernel: usize,
    min_area: u64,
}

impl ConfidenceMapBuilder {
    pub fn new(norm_percentile: f64, morph_kernel: usize, min_area: u64) -> Self {
        Self {
            norm_percentile,
            morph_kernel,
            min_area,
        }
    }

    pub fn build(
        &self,
        width: u32,
        height: u32,
        regions: &[VerifiedRegion],
        features: &BlockFeatures,
    ) -> BuiltMap {
        let raw_votes = accumulate_votes(width, height, regions, features);
        let (normalized, normalization) = normalize(raw_votes.clone(), self.norm_percentile);
        let closed = close(normalized, self.morph_kernel);
        let cleaned = remove_small_components(closed, self.min_area);

        log::debug!(
            "Confidence map: normalization {:.2}, {} nonzero pixels",
            normalization,
            cleaned.iter().filter(|&&v| v > 0.0).count()
        );

        BuiltMap {
            raw_votes,
            map: ConfidenceMap::from_array(cleaned),
            normalization,
        }
    }
}

/// One vote per pixel of both the source and destination block footprint of
/// every inlier match. Rectangles are summed through a difference table.
pub fn accumulate_votes(
    width: u32,
    height: u32,
    regions: &[VerifiedRegion],
    features: &BlockFeatures,
) -> Array2<f32> {
    let (w, h) = (width as usize, height as usize);
    let size = features.block_size as usize;
    let mut diff = Array2::<i64>::zeros((h + 1, w + 1));

    let mut stamp = |index: usize| {
        let (x, y) = features.position(index);
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = ((x0 + size).min(w), (y0 + size).min(h));
        diff[[y0, x0]] += 1;
        diff[[y0, x1]] -= 1;
        diff[[y1, x0]] -= 1;
        diff[[y1, x1]] += 1;
    };

    for region in regions {
        for m in &region.matches {
            stamp(m.block_a);
            stamp(m.block_b);
        }
    }

    let mut votes = Array2::<f32>::zeros((h, w));
    let mut row_sums = vec![0i64; w];
    for y in 0..h {
        let mut running = 0i64;
        for x in 0..w {
            running += diff[[y, x]];
            row_sums[x] += running;
            votes[[y, x]] = row_sums[x] as f32;
        }
    }

    votes
}

/// Value at `percentile` of the strictly positive entries, by the
/// `floor(p * (n - 1))` rank. `0.0` when nothing is positive.
pub fn positive_percentile(values: &Array2<f32>, percentile: f64) -> f32 {
    let mut positive = values.iter().copied().filter(|&v| v > 0.0).collect::<Vec<_>>();
    if positive.is_empty() {
        return 0.0;
    }

    let rank = ((percentile.clamp(0.0, 1.0) * (positive.len() - 1) as f64).floor() as usize)
        .min(positive.len() - 1);
    let (_, value, _) = positive.select_nth_unstable_by(rank, |a, b| a.total_cmp(b));
    *value
}

/// Divides by the positive-vote percentile and clamps to `[0, 1]`. Scaling is
/// skipped when that percentile is zero.
pub fn normalize(mut votes: Array2<f32>, percentile: f64) -> (Array2<f32>, f32) {
    let divisor = positive_percentile(&votes, percentile);
    if divisor > 0.0 {
        votes.mapv_inplace(|v| (v / divisor).min(1.0));
    }
    (votes, divisor)
}

fn sliding_extremum(map: &Array2<f32>, radius: usize, take_max: bool, along_rows: bool) -> Array2<f32> {
    let (h, w) = map.dim();
    let mut out = Array2::<f32>::zeros((h, w));

    Zip::indexed(&mut out).for_each(|(y, x), slot| {
        let (lo, hi, fixed) = if along_rows {
            (x.saturating_sub(radius), (x + radius).min(w - 1), y)
        } else {
            (y.saturating_sub(radius), (y + radius).min(h - 1), x)
        };
        let mut acc = if take_max { f32::NEG_INFINITY } else { f32::INFINITY };
        for i in lo..=hi {
            let v = if along_rows { map[[fixed, i]] } else { map[[i, fixed]] };
            acc = if take_max { acc.max(v) } else { acc.min(v) };
        }
        *slot = acc;
    });

    out
}

/// Grayscale closing with a `kernel x kernel` square; windows are clipped at
/// the image border.
pub fn close(map: Array2<f32>, kernel: usize) -> Array2<f32> {
    let radius = kernel / 2;
    if radius == 0 || map.is_empty() {
        return map;
    }

    let dilated = sliding_extremum(&sliding_extremum(&map, radius, true, true), radius, true, false);
    sliding_extremum(&sliding_extremum(&dilated, radius, false, true), radius, false, false)
}

/// Zeroes 8-connected positive components with fewer than `min_area` pixels.
pub fn remove_small_components(mut map: Array2<f32>, min_area: u64) -> Array2<f32> {
    if min_area <= 1 || map.is_empty() {
        return map;
    }

    let (h, w) = map.dim();
    let mut foreground = GrayImage::new(w as u32, h as u32);
    for ((y, x), &v) in map.indexed_iter() {
        if v > 0.0 {
            foreground.put_pixel(x as u32, y as u32, Luma([255]));
        }
    }

    let labels = connected_components(&foreground, Connectivity::Eight, Luma([0u8]));
    let max_label = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
    let mut areas = vec![0u64; max_label + 1];
    for p in labels.pixels() {
        areas[p[0] as usize] += 1;
    }

    for ((y, x), v) in map.indexed_iter_mut() {
        let label = labels.get_pixel(x as u32, y as u32)[0] as usize;
        if label != 0 && areas[label] < min_area {
            *v = 0.0;
        }
    }

    map
}
