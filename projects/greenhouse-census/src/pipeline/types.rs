use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Instant;

/// A 2D point. Normalized [0, 1] for segmentation masks, pixels elsewhere.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// Bounding box in normalized full-image coordinates, `[x1, y1, x2, y2]`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct NormBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl NormBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Clamp into the unit square, keeping corner order.
    pub fn clamped(&self) -> Self {
        let x1 = self.x1.min(self.x2).clamp(0.0, 1.0);
        let x2 = self.x1.max(self.x2).clamp(0.0, 1.0);
        let y1 = self.y1.min(self.y2).clamp(0.0, 1.0);
        let y2 = self.y1.max(self.y2).clamp(0.0, 1.0);
        Self { x1, y1, x2, y2 }
    }

    pub fn is_degenerate(&self) -> bool {
        !(self.width() > 0.0 && self.height() > 0.0)
            || !self.x1.is_finite()
            || !self.y1.is_finite()
            || !self.x2.is_finite()
            || !self.y2.is_finite()
    }
}

/// Axis-aligned box in pixel coordinates.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PixelBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl PixelBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn translated(&self, dx: f32, dy: f32) -> Self {
        Self {
            x1: self.x1 + dx,
            y1: self.y1 + dy,
            x2: self.x2 + dx,
            y2: self.y2 + dy,
        }
    }

    /// Smallest box enclosing both.
    pub fn union(&self, other: &PixelBox) -> PixelBox {
        PixelBox {
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
            x2: self.x2.max(other.x2),
            y2: self.y2.max(other.y2),
        }
    }

    pub fn intersection_area(&self, other: &PixelBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }
        (x2 - x1) * (y2 - y1)
    }

    /// Intersection over Union
    pub fn iou(&self, other: &PixelBox) -> f32 {
        let intersection = self.intersection_area(other);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Intersection over the smaller of the two areas
    pub fn ios(&self, other: &PixelBox) -> f32 {
        let smaller = self.area().min(other.area());
        if smaller <= 0.0 {
            0.0
        } else {
            self.intersection_area(other) / smaller
        }
    }
}

/// Physical container proposed by segmentation.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ContainerCandidate {
    /// Position in the accepted, ordered candidate list.
    pub index: usize,
    pub bbox: NormBox,
    /// Mask outline in normalized full-image coordinates.
    pub mask: Vec<Point>,
    pub confidence: f32,
    pub kind: String,
    pub model_version: String,
}

/// Detection in crop-local pixel coordinates.
#[derive(Debug, Clone, Serialize)]
pub struct CropDetection {
    pub bbox: PixelBox,
    pub confidence: f32,
    pub label: String,
}

impl CropDetection {
    pub fn new(bbox: PixelBox, confidence: f32, label: impl Into<String>) -> Self {
        Self {
            bbox,
            confidence,
            label: label.into(),
        }
    }

    /// Approximate plant footprint in pixels (ellipse inscribed in the box).
    pub fn footprint_area(&self) -> f64 {
        std::f64::consts::FRAC_PI_4 * self.bbox.width() as f64 * self.bbox.height() as f64
    }
}

/// Detection in full-image pixel coordinates. Only produced by
/// [`crate::pipeline::geometry::CropOrigin::to_image_space`].
#[derive(Debug, Clone, Serialize)]
pub struct ImageDetection {
    pub center_x: f32,
    pub center_y: f32,
    pub width: f32,
    pub height: f32,
    pub bbox: PixelBox,
    pub confidence: f32,
    pub label: String,
    pub is_empty: bool,
    pub is_alive: bool,
}

/// Per-band bookkeeping of the density estimate.
#[derive(Debug, Clone, Serialize)]
pub struct BandReport {
    pub band: usize,
    pub y_start: u32,
    pub y_end: u32,
    pub vegetated_px: u64,
    pub residual_px: u64,
    pub plant_area_px: f64,
    pub samples: usize,
    pub calibrated: bool,
    pub estimated: f64,
}

/// Estimate of undetected plants in one container, full-image coordinates.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerEstimate {
    pub polygon: Vec<Point>,
    pub residual_area_px: f64,
    pub area_cm2: f64,
    /// Unrounded sum of band estimates.
    pub raw_count: f64,
    pub estimated_count: u32,
    pub bands: Vec<BandReport>,
    pub used_calibration: bool,
    pub confidence: f32,
    pub method: &'static str,
}

impl ContainerEstimate {
    /// Sample-weighted plant area over calibrated bands, with the total
    /// sample count. `None` when no band calibrated.
    pub fn calibrated_plant_area(&self) -> Option<(f64, usize)> {
        let (weighted, samples) = self
            .bands
            .iter()
            .filter(|b| b.calibrated && b.samples > 0)
            .fold((0.0, 0usize), |(w, n), b| {
                (w + b.plant_area_px * b.samples as f64, n + b.samples)
            });
        if samples == 0 {
            return None;
        }
        Some((weighted / samples as f64, samples))
    }
}

/// Pixel rectangle of a container crop within the full image.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Successful outcome of one container's detection + estimation unit.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerReport {
    pub index: usize,
    pub region: CropRegion,
    pub detections: Vec<ImageDetection>,
    pub estimate: ContainerEstimate,
    pub tiles_processed: usize,
    pub tiles_skipped: usize,
    pub attempts: u32,
}

#[derive(Debug, Serialize, Clone)]
pub struct StageProgress {
    pub current: usize,
    pub total: usize,
    pub ms_per_unit: f64,
}

pub const STAGES: [&str; 5] = [
    "segmentation",
    "detection",
    "estimation",
    "aggregation",
    "persistence",
];

/// Live progress of one session, shared between workers and the status API.
#[derive(Debug)]
pub struct ProcessingState {
    pub session_id: String,
    pub stages: RwLock<BTreeMap<String, StageProgress>>,
    pub start_time: Instant,
}

impl ProcessingState {
    pub fn new(session_id: String) -> Self {
        let stages = STAGES
            .iter()
            .map(|s| {
                (
                    s.to_string(),
                    StageProgress {
                        current: 0,
                        total: 1,
                        ms_per_unit: 0.0,
                    },
                )
            })
            .collect();

        Self {
            session_id,
            stages: RwLock::new(stages),
            start_time: Instant::now(),
        }
    }

    pub fn set_total(&self, stage: &str, total: usize) {
        if let Ok(mut stages) = self.stages.write() {
            if let Some(progress) = stages.get_mut(stage) {
                progress.total = total;
            }
        }
    }

    /// Record one finished unit of `stage`.
    pub fn advance_stage(&self, stage: &str, ms: f64) {
        if let Ok(mut stages) = self.stages.write() {
            if let Some(progress) = stages.get_mut(stage) {
                progress.current += 1;
                // Exponential moving average for smoothing durations
                if progress.ms_per_unit == 0.0 {
                    progress.ms_per_unit = ms;
                } else {
                    progress.ms_per_unit = progress.ms_per_unit * 0.9 + ms * 0.1;
                }
            }
        }
    }

    pub fn to_progress_json(&self) -> serde_json::Value {
        let stages = match self.stages.read() {
            Ok(stages) => stages.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        serde_json::json!({
            "session_id": self.session_id,
            "elapsed_ms": self.start_time.elapsed().as_secs_f64() * 1000.0,
            "stages": stages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_norm_box_clamped_and_degenerate() {
        let b = NormBox::new(0.8, -0.1, 0.2, 1.3).clamped();
        assert_eq!(b, NormBox::new(0.2, 0.0, 0.8, 1.0));
        assert!(!b.is_degenerate());
        assert!(NormBox::new(0.3, 0.3, 0.3, 0.9).is_degenerate());
        assert!(NormBox::new(f32::NAN, 0.0, 1.0, 1.0).is_degenerate());
    }

    #[test]
    fn test_iou_and_ios() {
        let a = PixelBox::new(0.0, 0.0, 10.0, 10.0);
        let b = PixelBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        let inner = PixelBox::new(2.0, 2.0, 4.0, 4.0);
        assert!((a.ios(&inner) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&PixelBox::new(20.0, 20.0, 30.0, 30.0)), 0.0);
    }

    #[test]
    fn test_progress_counts_units() {
        let state = ProcessingState::new("s".to_string());
        state.set_total("detection", 3);
        state.advance_stage("detection", 10.0);
        state.advance_stage("detection", 20.0);
        let json = state.to_progress_json();
        assert_eq!(json["stages"]["detection"]["current"], 2);
        assert_eq!(json["stages"]["detection"]["total"], 3);
    }
}
