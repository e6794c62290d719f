#![allow(dead_code)]

use copymove_forensics::evaluation::threshold::BinaryMask;
use image::{GrayImage, Luma};
use rand::{Rng, SeedableRng, rngs::StdRng};

pub const PATCH: u32 = 32;
pub const SOURCE: (u32, u32) = (40, 40);
pub const OFFSET: (u32, u32) = (60, 40);

pub fn noise_image(width: u32, height: u32, seed: u64) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    GrayImage::from_fn(width, height, |_, _| Luma([rng.random::<u8>()]))
}

/// Copies the `size x size` patch at `from` onto `to`.
pub fn paste(image: &mut GrayImage, from: (u32, u32), to: (u32, u32), size: u32) {
    for dy in 0..size {
        for dx in 0..size {
            let pixel = *image.get_pixel(from.0 + dx, from.1 + dy);
            image.put_pixel(to.0 + dx, to.1 + dy, pixel);
        }
    }
}

/// 256x256 noise with a 32x32 patch moved by `(60, 40)`.
pub fn forged_image(seed: u64) -> GrayImage {
    let mut image = noise_image(256, 256, seed);
    paste(&mut image, SOURCE, destination(), PATCH);
    image
}

pub fn destination() -> (u32, u32) {
    (SOURCE.0 + OFFSET.0, SOURCE.1 + OFFSET.1)
}

/// Ground truth marking both the source and the destination patch.
pub fn forged_truth() -> BinaryMask {
    let mut mask = BinaryMask::new(256, 256);
    for origin in [SOURCE, destination()] {
        for y in origin.1..origin.1 + PATCH {
            for x in origin.0..origin.0 + PATCH {
                mask.set(x, y, true);
            }
        }
    }
    mask
}
