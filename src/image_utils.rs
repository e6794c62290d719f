use std::path::Path;

use image::{DynamicImage, GrayImage, Luma, RgbImage, imageops::FilterType};
use ndarray::Array2;

use crate::error::Result;

pub fn rgb_to_gray(image: &RgbImage) -> GrayImage {
    let (width, height) = image.dimensions();
    let mut gray = GrayImage::new(width, height);

    for (x, y, pixel) in image.enumerate_pixels() {
        let lum =
            (0.299 * pixel[0] as f64 + 0.587 * pixel[1] as f64 + 0.114 * pixel[2] as f64) as u8;
        gray.put_pixel(x, y, Luma([lum]));
    }

    gray
}

/// Grayscale view of any decoded image. Single channel inputs are taken as-is.
pub fn to_gray(image: &DynamicImage) -> GrayImage {
    match image {
        DynamicImage::ImageLuma8(gray) => gray.clone(),
        other => rgb_to_gray(&other.to_rgb8()),
    }
}

pub fn gray_to_array(image: &GrayImage) -> Array2<f64> {
    let (width, height) = image.dimensions();
    let mut arr = Array2::zeros((height as usize, width as usize));

    for (x, y, pixel) in image.enumerate_pixels() {
        arr[[y as usize, x as usize]] = pixel[0] as f64;
    }

    arr
}

/// Encodes a `[0, 1]` float map as an 8-bit image, scaling by 255.
pub fn unit_array_to_gray(arr: &Array2<f32>) -> GrayImage {
    let (height, width) = arr.dim();
    let mut image = GrayImage::new(width as u32, height as u32);

    for ((y, x), &v) in arr.indexed_iter() {
        let value = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        image.put_pixel(x as u32, y as u32, Luma([value]));
    }

    image
}

/// Copies the `size x size` patch at `(x, y)` into `out` in row-major order.
/// The caller guarantees the patch lies inside the image.
pub fn extract_block_into(pixels: &Array2<f64>, x: usize, y: usize, size: usize, out: &mut [f64]) {
    for dy in 0..size {
        let row = pixels.row(y + dy);
        for dx in 0..size {
            out[dy * size + dx] = row[x + dx];
        }
    }
}

/// Binarizes a grayscale mask at 127 (foreground = 255).
pub fn binarize_mask(mask: &GrayImage) -> GrayImage {
    let mut out = mask.clone();
    for pixel in out.pixels_mut() {
        pixel[0] = if pixel[0] > 127 { 255 } else { 0 };
    }
    out
}

/// Loads a ground-truth mask, binarizes it and, when its size differs from
/// `(width, height)`, resizes it with nearest-neighbour sampling.
pub fn load_mask<P: AsRef<Path>>(path: P, width: u32, height: u32) -> Result<GrayImage> {
    let mask = image::open(path)?.to_luma8();
    let mask = if mask.dimensions() != (width, height) {
        image::imageops::resize(&mask, width, height, FilterType::Nearest)
    } else {
        mask
    };
    Ok(binarize_mask(&mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gray_passthrough_keeps_luma() {
        let mut gray = GrayImage::new(4, 3);
        gray.put_pixel(2, 1, Luma([200]));
        let out = to_gray(&DynamicImage::ImageLuma8(gray.clone()));
        assert_eq!(out, gray);
    }

    #[test]
    fn test_extract_block_into_reads_row_major() {
        let mut arr = Array2::zeros((4, 4));
        for ((y, x), v) in arr.indexed_iter_mut() {
            *v = (y * 4 + x) as f64;
        }
        let mut out = [0.0; 4];
        extract_block_into(&arr, 1, 2, 2, &mut out);
        assert_eq!(out, [9.0, 10.0, 13.0, 14.0]);
    }

    #[test]
    fn test_binarize_mask_threshold() {
        let mut mask = GrayImage::new(3, 1);
        mask.put_pixel(0, 0, Luma([127]));
        mask.put_pixel(1, 0, Luma([128]));
        mask.put_pixel(2, 0, Luma([255]));
        let bin = binarize_mask(&mask);
        assert_eq!(bin.get_pixel(0, 0)[0], 0);
        assert_eq!(bin.get_pixel(1, 0)[0], 255);
        assert_eq!(bin.get_pixel(2, 0)[0], 255);
    }
}
