//! Vegetation masks: separate plants from floor and substrate.
//!
//! A pixel is vegetation when it passes both the hue/saturation window and
//! a global (Otsu) threshold on the excess-green index `2G - R - B`.

use crate::pipeline::types::Point;
use image::{GrayImage, Luma, RgbImage};
use imageproc::drawing::draw_polygon_mut;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VegetationConfig {
    /// Hue window in degrees.
    pub hue_min: f32,
    pub hue_max: f32,
    pub saturation_min: f32,
    pub value_min: f32,
    /// Upper bound for the Otsu level so plant-only crops keep their plants.
    pub exg_threshold_cap: u8,
}

impl Default for VegetationConfig {
    fn default() -> Self {
        Self {
            hue_min: 60.0,
            hue_max: 170.0,
            saturation_min: 0.2,
            value_min: 0.15,
            exg_threshold_cap: 40,
        }
    }
}

/// RGB to (hue degrees, saturation, value), all channels 0..=255 in.
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let r = r as f32 / 255.0;
    let g = g as f32 / 255.0;
    let b = b as f32 / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta <= f32::EPSILON {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta).rem_euclid(6.0))
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let saturation = if max <= f32::EPSILON { 0.0 } else { delta / max };
    (hue, saturation, max)
}

fn passes_hsv(pixel: &image::Rgb<u8>, config: &VegetationConfig) -> bool {
    let [r, g, b] = pixel.0;
    let (h, s, v) = rgb_to_hsv(r, g, b);
    h >= config.hue_min && h <= config.hue_max && s >= config.saturation_min && v >= config.value_min
}

/// Excess-green index `2G - R - B`, clamped to u8.
pub fn excess_green(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        let exg = 2 * g as i32 - r as i32 - b as i32;
        Luma([exg.clamp(0, 255) as u8])
    })
}

/// Binary vegetation mask (255 = vegetation).
pub fn vegetation_mask(image: &RgbImage, config: &VegetationConfig) -> GrayImage {
    let exg = excess_green(image);
    let level = imageproc::contrast::otsu_level(&exg).min(config.exg_threshold_cap);

    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let veg = exg.get_pixel(x, y).0[0] > level && passes_hsv(image.get_pixel(x, y), config);
        Luma([if veg { 255 } else { 0 }])
    })
}

/// Fraction of sampled pixels that look like vegetation (HSV only).
/// Cheap enough to pre-filter tiles.
pub fn vegetation_ratio(image: &RgbImage, config: &VegetationConfig, stride: u32) -> f64 {
    let stride = stride.max(1);
    let mut total = 0u64;
    let mut green = 0u64;
    for y in (0..image.height()).step_by(stride as usize) {
        for x in (0..image.width()).step_by(stride as usize) {
            total += 1;
            if passes_hsv(image.get_pixel(x, y), config) {
                green += 1;
            }
        }
    }
    if total == 0 {
        0.0
    } else {
        green as f64 / total as f64
    }
}

/// Rasterize a crop-local polygon into a 255/0 mask. Fewer than three
/// distinct vertices means "no mask": the whole crop is kept.
pub fn polygon_mask(width: u32, height: u32, polygon: &[Point]) -> GrayImage {
    let mut vertices: Vec<imageproc::point::Point<i32>> = Vec::with_capacity(polygon.len());
    for p in polygon {
        let v = imageproc::point::Point::new(p.x.round() as i32, p.y.round() as i32);
        if vertices.last() != Some(&v) {
            vertices.push(v);
        }
    }
    while vertices.len() > 1 && vertices.first() == vertices.last() {
        vertices.pop();
    }

    if vertices.len() < 3 {
        return GrayImage::from_pixel(width, height, Luma([255]));
    }

    let mut mask = GrayImage::new(width, height);
    draw_polygon_mut(&mut mask, &vertices, Luma([255]));
    mask
}

/// Pixel-wise AND of two equally sized masks.
pub fn mask_and(a: &GrayImage, b: &GrayImage) -> GrayImage {
    GrayImage::from_fn(a.width(), a.height(), |x, y| {
        let on = a.get_pixel(x, y).0[0] > 0 && b.get_pixel(x, y).0[0] > 0;
        Luma([if on { 255 } else { 0 }])
    })
}
