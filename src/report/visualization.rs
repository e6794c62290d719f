use image::{Rgb, RgbImage};

use crate::{CopyMoveResult, SRegion, analysis::confidence_map::ConfidenceMap};

/// Outline and match-line colours, cycled per verified region. Kept clear of
/// the yellow-to-red confidence ramp.
const REGION_COLORS: [Rgb<u8>; 6] = [
    Rgb([0, 200, 255]),
    Rgb([0, 255, 120]),
    Rgb([255, 0, 255]),
    Rgb([80, 120, 255]),
    Rgb([255, 255, 255]),
    Rgb([160, 255, 0]),
];

/// Yellow at the weakest vote, red at full confidence, black where the map
/// is empty.
pub fn confidence_color(value: f32) -> Rgb<u8> {
    if value <= 0.0 {
        return Rgb([0, 0, 0]);
    }
    let value = value.min(1.0);
    Rgb([255, (255.0 * (1.0 - value)).round() as u8, 0])
}

#[derive(Debug, Clone)]
pub struct VisualizationConfig {
    pub overlay_opacity: f32,
    pub border_thickness: u32,
    /// Draw at most this many match pairs per verified region.
    pub max_pairs_per_region: usize,
}

impl Default for VisualizationConfig {
    fn default() -> Self {
        Self {
            overlay_opacity: 0.5,
            border_thickness: 2,
            max_pairs_per_region: 8,
        }
    }
}

pub struct Visualizer {
    config: VisualizationConfig,
}

impl Visualizer {
    pub fn new() -> Self {
        Self {
            config: VisualizationConfig::default(),
        }
    }

    pub fn with_config(config: VisualizationConfig) -> Self {
        Self { config }
    }

    pub fn create_heatmap(&self, map: &ConfidenceMap) -> RgbImage {
        let (width, height) = map.dimensions();
        let mut heatmap = RgbImage::new(width, height);

        for ((y, x), &v) in map.values().indexed_iter() {
            heatmap.put_pixel(x as u32, y as u32, confidence_color(v));
        }

        heatmap
    }

    /// Blends `heatmap` over `original` wherever `map` is positive.
    pub fn overlay_map(&self, original: &RgbImage, map: &ConfidenceMap) -> RgbImage {
        let heatmap = self.create_heatmap(map);
        let mut result = original.clone();
        let alpha = self.config.overlay_opacity;
        let (width, height) = original.dimensions();

        for y in 0..height.min(map.height()) {
            for x in 0..width.min(map.width()) {
                if map.get(x, y) <= 0.0 {
                    continue;
                }
                let orig = original.get_pixel(x, y);
                let heat = heatmap.get_pixel(x, y);
                result.put_pixel(
                    x,
                    y,
                    Rgb([
                        ((1.0 - alpha) * orig[0] as f32 + alpha * heat[0] as f32) as u8,
                        ((1.0 - alpha) * orig[1] as f32 + alpha * heat[1] as f32) as u8,
                        ((1.0 - alpha) * orig[2] as f32 + alpha * heat[2] as f32) as u8,
                    ]),
                );
            }
        }

        result
    }

    /// Map overlay plus, per verified region, the bounding boxes of its
    /// source and destination blocks and a few connecting match lines.
    pub fn visualize_copy_move(&self, original: &RgbImage, result: &CopyMoveResult) -> RgbImage {
        let mut vis = self.overlay_map(original, &result.map);

        for (i, region) in result.regions.iter().enumerate() {
            let color = REGION_COLORS[i % REGION_COLORS.len()];
            let pairs = result
                .pairs
                .iter()
                .filter(|p| p.cluster_id == region.cluster_id)
                .collect::<Vec<_>>();

            let Some(first) = pairs.first() else {
                continue;
            };
            let (source_box, target_box) = pairs.iter().fold((first.source, first.target), |(s, t), p| {
                (s.union(&p.source), t.union(&p.target))
            });
            self.draw_region_border(&mut vis, &source_box, color);
            self.draw_region_border(&mut vis, &target_box, color);

            let step = (pairs.len() / self.config.max_pairs_per_region.max(1)).max(1);
            for pair in pairs.iter().step_by(step).take(self.config.max_pairs_per_region) {
                let (x0, y0) = pair.source.center();
                let (x1, y1) = pair.target.center();
                self.draw_line(&mut vis, x0, y0, x1, y1, color);
            }
        }

        vis
    }

    fn draw_region_border(&self, image: &mut RgbImage, region: &SRegion, color: Rgb<u8>) {
        let (width, height) = image.dimensions();
        let thickness = self.config.border_thickness;

        for t in 0..thickness {
            let x_range = region.x.saturating_sub(t)..(region.x + region.width + t).min(width);
            let y_range = region.y.saturating_sub(t)..(region.y + region.height + t).min(height);

            for x in x_range.clone() {
                if region.y >= t {
                    image.put_pixel(x, region.y - t, color);
                }
                let y = region.y + region.height + t;
                if y < height {
                    image.put_pixel(x, y, color);
                }
            }

            for y in y_range {
                if region.x >= t {
                    image.put_pixel(region.x - t, y, color);
                }
                let x = region.x + region.width + t;
                if x < width {
                    image.put_pixel(x, y, color);
                }
            }
        }
    }

    fn draw_line(&self, image: &mut RgbImage, x0: u32, y0: u32, x1: u32, y1: u32, color: Rgb<u8>) {
        let (width, height) = image.dimensions();

        let dx = (x1 as i32 - x0 as i32).abs();
        let dy = -(y1 as i32 - y0 as i32).abs();
        let sx = if x0 < x1 { 1i32 } else { -1i32 };
        let sy = if y0 < y1 { 1i32 } else { -1i32 };
        let mut err = dx + dy;

        let mut x = x0 as i32;
        let mut y = y0 as i32;

        loop {
            if x >= 0 && x < width as i32 && y >= 0 && y < height as i32 {
                image.put_pixel(x as u32, y as u32, color);
            }

            if x == x1 as i32 && y == y1 as i32 {
                break;
            }

            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }
}

impl Default for Visualizer {
    fn default() -> Self {
        Self::new()
    }
}
