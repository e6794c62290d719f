use std::{f64::consts::PI, sync::Arc};

use ndarray::Array2;
use num_complex::Complex;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};

use crate::{analysis::cancel::CancelToken, image_utils::extract_block_into};

/// Low-frequency scan order over an `n x n` coefficient grid as `(x, y)`
/// pairs: anti-diagonals of increasing frequency, each walked from the
/// horizontal axis towards the vertical one.
pub fn zigzag_order(n: usize, len: usize) -> Vec<(usize, usize)> {
    let mut order = Vec::with_capacity(len);
    if n == 0 {
        return order;
    }

    for s in 0..(2 * n - 1) {
        for x in (0..=s).rev() {
            let y = s - x;
            if x >= n || y >= n {
                continue;
            }
            if order.len() == len {
                return order;
            }
            order.push((x, y));
        }
    }

    order
}

/// Orthonormal 2-D DCT-II for square blocks of one size, computed with a
/// mirrored length-`2n` FFT per row and column.
pub struct BlockTransform {
    size: usize,
    fft: Arc<dyn Fft<f64>>,
    twiddles: Vec<Complex<f64>>,
    zigzag: Vec<(usize, usize)>,
}

impl std::fmt::Debug for BlockTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockTransform")
            .field("size", &self.size)
            .field("descriptor_len", &self.zigzag.len())
            .finish()
    }
}

/// Per-thread buffers reused across blocks.
pub struct TransformScratch {
    patch: Vec<f64>,
    rows: Vec<f64>,
    column: Vec<f64>,
    line: Vec<f64>,
    spectrum: Vec<Complex<f64>>,
}

impl BlockTransform {
    pub fn new(size: usize, descriptor_len: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(2 * size);

        let n = size as f64;
        let twiddles = (0..size)
            .map(|k| {
                let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
                Complex::from_polar(0.5 * scale, -PI * k as f64 / (2.0 * n))
            })
            .collect();

        Self {
            size,
            fft,
            twiddles,
            zigzag: zigzag_order(size, descriptor_len),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn descriptor_len(&self) -> usize {
        self.zigzag.len()
    }

    pub fn scratch(&self) -> TransformScratch {
        let n = self.size;
        TransformScratch {
            patch: vec![0.0; n * n],
            rows: vec![0.0; n * n],
            column: vec![0.0; n],
            line: vec![0.0; n],
            spectrum: vec![Complex::new(0.0, 0.0); 2 * n],
        }
    }

    fn dct_1d(&self, input: &[f64], output: &mut [f64], spectrum: &mut [Complex<f64>]) {
        let n = self.size;
        for (i, &v) in input.iter().enumerate() {
            spectrum[i] = Complex::new(v, 0.0);
            spectrum[2 * n - 1 - i] = Complex::new(v, 0.0);
        }

        self.fft.process(spectrum);

        for k in 0..n {
            output[k] = (spectrum[k] * self.twiddles[k]).re;
        }
    }

    /// Full coefficient grid of a row-major block; coefficient `(x, y)` lands
    /// at index `y * n + x`.
    pub fn dct_2d(&self, block: &[f64], scratch: &mut TransformScratch) -> Vec<f64> {
        let n = self.size;
        let mut coeffs = vec![0.0; n * n];

        for r in 0..n {
            self.dct_1d(
                &block[r * n..(r + 1) * n],
                &mut scratch.rows[r * n..(r + 1) * n],
                &mut scratch.spectrum,
            );
        }

        for u in 0..n {
            for r in 0..n {
                scratch.column[r] = scratch.rows[r * n + u];
            }
            self.dct_1d(&scratch.column, &mut scratch.line, &mut scratch.spectrum);
            for v in 0..n {
                coeffs[v * n + u] = scratch.line[v];
            }
        }

        coeffs
    }

    /// Zig-zag truncated descriptor of the patch at `(x, y)`.
    pub fn describe(
        &self,
        pixels: &Array2<f64>,
        x: usize,
        y: usize,
        scratch: &mut TransformScratch,
    ) -> Vec<f32> {
        let n = self.size;
        let mut patch = std::mem::take(&mut scratch.patch);
        extract_block_into(pixels, x, y, n, &mut patch);
        let coeffs = self.dct_2d(&patch, scratch);
        scratch.patch = patch;

        self.zigzag
            .iter()
            .map(|&(cx, cy)| coeffs[cy * n + cx] as f32)
            .collect()
    }
}

/// One grid block, borrowed from [`BlockFeatures`].
#[derive(Debug, Clone, Copy)]
pub struct Block<'a> {
    pub x: u32,
    pub y: u32,
    pub descriptor: &'a [f32],
}

/// Descriptors of every grid block, stored flat in row-major grid order.
#[derive(Debug, Clone)]
pub struct BlockFeatures {
    pub block_size: u32,
    pub stride: u32,
    pub blocks_x: usize,
    pub blocks_y: usize,
    dim: usize,
    positions: Vec<(u32, u32)>,
    descriptors: Vec<f32>,
}

impl BlockFeatures {
    fn empty(block_size: u32, stride: u32, dim: usize) -> Self {
        Self {
            block_size,
            stride,
            blocks_x: 0,
            blocks_y: 0,
            dim,
            positions: Vec::new(),
            descriptors: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn position(&self, index: usize) -> (u32, u32) {
        self.positions[index]
    }

    pub fn descriptor(&self, index: usize) -> &[f32] {
        &self.descriptors[index * self.dim..(index + 1) * self.dim]
    }

    pub fn descriptors(&self) -> &[f32] {
        &self.descriptors
    }

    pub fn block(&self, index: usize) -> Block<'_> {
        let (x, y) = self.positions[index];
        Block {
            x,
            y,
            descriptor: self.descriptor(index),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Block<'_>> {
        (0..self.len()).map(move |i| self.block(i))
    }
}

pub struct BlockFeatureExtractor {
    transform: Arc<BlockTransform>,
    stride: usize,
}

impl BlockFeatureExtractor {
    pub fn new(transform: Arc<BlockTransform>, stride: usize) -> Self {
        Self { transform, stride }
    }

    /// Grid dimensions for an image, `(0, 0)` when a single block does not fit.
    pub fn grid_size(&self, width: usize, height: usize) -> (usize, usize) {
        let size = self.transform.size();
        if width < size || height < size {
            return (0, 0);
        }
        ((width - size) / self.stride + 1, (height - size) / self.stride + 1)
    }

    /// Returns `None` only when cancelled.
    pub fn extract(&self, pixels: &Array2<f64>, cancel: &CancelToken) -> Option<BlockFeatures> {
        let (height, width) = pixels.dim();
        let size = self.transform.size();
        let dim = self.transform.descriptor_len();
        let (blocks_x, blocks_y) = self.grid_size(width, height);

        if blocks_x == 0 || blocks_y == 0 {
            return Some(BlockFeatures::empty(size as u32, self.stride as u32, dim));
        }

        let positions = (0..blocks_y)
            .flat_map(|by| (0..blocks_x).map(move |bx| (bx, by)))
            .map(|(bx, by)| ((bx * self.stride) as u32, (by * self.stride) as u32))
            .collect::<Vec<_>>();

        let described = positions
            .par_iter()
            .map_init(
                || self.transform.scratch(),
                |scratch, &(x, y)| {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    Some(self.transform.describe(pixels, x as usize, y as usize, scratch))
                },
            )
            .collect::<Option<Vec<_>>>()?;

        let mut descriptors = Vec::with_capacity(described.len() * dim);
        for d in described {
            descriptors.extend_from_slice(&d);
        }

        Some(BlockFeatures {
            block_size: size as u32,
            stride: self.stride as u32,
            blocks_x,
            blocks_y,
            dim,
            positions,
            descriptors,
        })
    }
}
