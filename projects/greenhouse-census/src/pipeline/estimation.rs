//! Band-based density estimation of plants the detector missed.
//!
//! The crop is cut into horizontal bands, far (top) to near (bottom). In each
//! band the residual vegetated area (vegetation minus detected footprints) is
//! divided by a per-plant area calibrated from that band's own detections,
//! then scaled by the overcount factor.

use crate::error::{PipelineError, Result};
use crate::pipeline::geometry::convex_hull;
use crate::pipeline::types::{BandReport, ContainerEstimate, CropDetection, Point};
use crate::pipeline::vegetation::{mask_and, polygon_mask, vegetation_mask, VegetationConfig};
use image::{GrayImage, Luma, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::drawing::draw_filled_circle_mut;
use serde::{Deserialize, Serialize};

pub const METHOD_TAG: &str = "band_estimation";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimationConfig {
    /// Number of horizontal bands, ordered far to near.
    pub bands: usize,
    /// Multiplier applied to each band estimate; must lie in (0, 1).
    pub overcount_factor: f64,
    /// Trimmed detections a band needs before its own calibration is trusted.
    pub min_calibration_samples: usize,
    /// Per-plant area used when a band cannot calibrate and the location
    /// has no stored parameters.
    pub default_plant_area_px: f64,
    /// Detected footprint radius relative to half the box size.
    pub footprint_scale: f32,
    pub footprint_blur_sigma: f32,
    /// Radius of the morphological opening that removes residual slivers.
    pub cleanup_radius: u8,
    /// Residual below this fraction of one plant is treated as noise.
    pub min_residual_fraction: f64,
    /// Fixed confidence attached to every estimate.
    pub confidence: f32,
    pub default_pixels_per_cm2: f64,
    /// Write learned plant areas back to the location's parameters.
    pub refine_calibration: bool,
    pub vegetation: VegetationConfig,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            bands: 4,
            overcount_factor: 0.9,
            min_calibration_samples: 10,
            default_plant_area_px: 2500.0,
            footprint_scale: 1.15,
            footprint_blur_sigma: 2.0,
            cleanup_radius: 2,
            min_residual_fraction: 0.25,
            confidence: 0.7,
            default_pixels_per_cm2: 1.0,
            refine_calibration: true,
            vegetation: VegetationConfig::default(),
        }
    }
}

impl EstimationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.overcount_factor > 0.0 && self.overcount_factor < 1.0) {
            return Err(PipelineError::validation(format!(
                "overcount_factor must be in (0, 1), got {}",
                self.overcount_factor
            )));
        }
        if self.bands == 0 {
            return Err(PipelineError::validation("bands must be at least 1"));
        }
        if !(self.default_plant_area_px > 0.0) || !(self.default_pixels_per_cm2 > 0.0) {
            return Err(PipelineError::validation(
                "default plant area and pixel density must be positive",
            ));
        }
        Ok(())
    }
}

/// Location-specific calibration, stored between runs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DensityParameters {
    pub avg_plant_area_px: f64,
    pub pixels_per_cm2: f64,
    pub samples: usize,
}

/// Mean of the values inside the Tukey fences (Q1 - 1.5 IQR, Q3 + 1.5 IQR).
/// Returns the mean and the number of retained values.
pub fn iqr_trimmed_mean(values: &[f64]) -> Option<(f64, usize)> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    let iqr = q3 - q1;
    let lo = q1 - 1.5 * iqr;
    let hi = q3 + 1.5 * iqr;

    let kept: Vec<f64> = sorted.into_iter().filter(|v| *v >= lo && *v <= hi).collect();
    if kept.is_empty() {
        return None;
    }
    Some((kept.iter().sum::<f64>() / kept.len() as f64, kept.len()))
}

/// Linear-interpolated quantile of sorted data.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Row range `[start, end)` of band `i`.
pub fn band_rows(height: u32, bands: usize, i: usize) -> (u32, u32) {
    let start = (height as u64 * i as u64 / bands as u64) as u32;
    let end = (height as u64 * (i as u64 + 1) / bands as u64) as u32;
    (start, end)
}

pub struct BandEstimator {
    config: EstimationConfig,
}

impl BandEstimator {
    pub fn new(config: EstimationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EstimationConfig {
        &self.config
    }

    /// Mask of detected plant footprints: filled circles at each centre,
    /// slightly blurred to tolerate imprecise centres.
    pub fn detected_mask(&self, width: u32, height: u32, detections: &[CropDetection]) -> GrayImage {
        let mut mask = GrayImage::new(width, height);
        for d in detections {
            let (cx, cy) = d.bbox.center();
            let radius = d.bbox.width().max(d.bbox.height()) / 2.0 * self.config.footprint_scale;
            draw_filled_circle_mut(
                &mut mask,
                (cx.round() as i32, cy.round() as i32),
                radius.ceil().max(1.0) as i32,
                Luma([255]),
            );
        }
        if self.config.footprint_blur_sigma > 0.0 {
            mask = imageproc::filter::gaussian_blur_f32(&mask, self.config.footprint_blur_sigma);
        }
        mask
    }

    /// Residual vegetation: vegetated, inside the container, not detected.
    pub fn residual_mask(
        &self,
        crop: &RgbImage,
        detections: &[CropDetection],
        region: Option<&[Point]>,
    ) -> (GrayImage, GrayImage) {
        let (w, h) = crop.dimensions();
        let mut vegetated = vegetation_mask(crop, &self.config.vegetation);
        if let Some(poly) = region {
            vegetated = mask_and(&vegetated, &polygon_mask(w, h, poly));
        }
        let detected = self.detected_mask(w, h, detections);

        let mut residual = GrayImage::from_fn(w, h, |x, y| {
            let on = vegetated.get_pixel(x, y).0[0] > 0 && detected.get_pixel(x, y).0[0] == 0;
            Luma([if on { 255 } else { 0 }])
        });
        if self.config.cleanup_radius > 0 {
            residual = imageproc::morphology::open(&residual, Norm::LInf, self.config.cleanup_radius);
        }
        (vegetated, residual)
    }

    /// Estimate undetected plants in one crop. The polygon in the result is
    /// crop-local; callers move it to image space.
    pub fn estimate(
        &self,
        crop: &RgbImage,
        detections: &[CropDetection],
        region: Option<&[Point]>,
        params: Option<&DensityParameters>,
    ) -> ContainerEstimate {
        let (w, h) = crop.dimensions();
        let (vegetated, residual) = self.residual_mask(crop, detections, region);

        let fallback_area = params
            .map(|p| p.avg_plant_area_px)
            .filter(|a| *a > 0.0)
            .unwrap_or(self.config.default_plant_area_px);
        let pixels_per_cm2 = params
            .map(|p| p.pixels_per_cm2)
            .filter(|p| *p > 0.0)
            .unwrap_or(self.config.default_pixels_per_cm2);

        let bands = self.config.bands.min(h.max(1) as usize);
        let mut reports = Vec::with_capacity(bands);
        for i in 0..bands {
            let (y_start, y_end) = band_rows(h, bands, i);
            let mut vegetated_px = 0u64;
            let mut residual_px = 0u64;
            for y in y_start..y_end {
                for x in 0..w {
                    if vegetated.get_pixel(x, y).0[0] > 0 {
                        vegetated_px += 1;
                    }
                    if residual.get_pixel(x, y).0[0] > 0 {
                        residual_px += 1;
                    }
                }
            }

            let areas: Vec<f64> = detections
                .iter()
                .filter(|d| {
                    let (_, cy) = d.bbox.center();
                    cy >= y_start as f32 && cy < y_end as f32 && !d.label.to_ascii_lowercase().contains("empty")
                })
                .map(|d| d.footprint_area())
                .collect();

            let (plant_area_px, samples, calibrated) = match iqr_trimmed_mean(&areas) {
                Some((mean, kept)) if kept >= self.config.min_calibration_samples && mean > 0.0 => {
                    (mean, kept, true)
                }
                Some((_, kept)) => (fallback_area, kept, false),
                None => (fallback_area, 0, false),
            };

            reports.push(BandReport {
                band: i,
                y_start,
                y_end,
                vegetated_px,
                residual_px,
                plant_area_px,
                samples,
                calibrated,
                estimated: 0.0,
            });
        }

        let total_residual: u64 = reports.iter().map(|b| b.residual_px).sum();
        let mean_area = reports.iter().map(|b| b.plant_area_px).sum::<f64>() / reports.len().max(1) as f64;
        let is_noise = (total_residual as f64) < self.config.min_residual_fraction * mean_area;

        let mut raw_count = 0.0;
        for band in reports.iter_mut() {
            band.estimated = if is_noise {
                0.0
            } else {
                (band.residual_px as f64 / band.plant_area_px * self.config.overcount_factor).max(0.0)
            };
            raw_count += band.estimated;
        }
        let raw_count = raw_count.max(0.0);

        let polygon = if is_noise || total_residual == 0 {
            vec![]
        } else {
            residual_outline(&residual)
        };

        ContainerEstimate {
            polygon,
            residual_area_px: total_residual as f64,
            area_cm2: total_residual as f64 / pixels_per_cm2,
            raw_count,
            estimated_count: raw_count.ceil() as u32,
            used_calibration: params.is_some() || reports.iter().any(|b| b.calibrated),
            bands: reports,
            confidence: self.config.confidence,
            method: METHOD_TAG,
        }
    }
}

/// Convex outline of every outer residual contour.
fn residual_outline(residual: &GrayImage) -> Vec<Point> {
    let points: Vec<Point> = find_contours::<i32>(residual)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .flat_map(|c| c.points.into_iter())
        .map(|p| Point {
            x: p.x as f32,
            y: p.y as f32,
        })
        .collect();
    convex_hull(&points)
}
