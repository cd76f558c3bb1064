use crate::error::{PipelineError, Result};
use crate::models::DetectionModel;
use crate::pipeline::slicing::{generate_tiles, merge_detections, tile_to_crop, SliceConfig};
use crate::pipeline::types::{CropDetection, Point};
use crate::pipeline::vegetation::{vegetation_ratio, VegetationConfig};
use image::RgbImage;
use std::sync::Arc;

/// Pixel stride used when sampling a tile for the empty-tile check.
const PREFILTER_STRIDE: u32 = 4;

/// Detections for one container crop, in crop-local pixels.
#[derive(Debug, Clone)]
pub struct CropDetections {
    pub detections: Vec<CropDetection>,
    pub tiled: bool,
    pub tiles_processed: usize,
    pub tiles_skipped: usize,
}

/// Object detection over a container crop.
///
/// It can operate in two modes:
/// 1. Direct detection: crops whose shorter side is below `min_tile_size`
///    run the model once on the whole crop.
/// 2. Slicing detection: splits the crop into overlapping tiles (SAHI tactic),
///    skips background tiles, runs detection per tile and merges duplicates.
pub struct TiledDetectionStage {
    model: Arc<dyn DetectionModel>,
    slicing: SliceConfig,
    vegetation: VegetationConfig,
}

impl TiledDetectionStage {
    pub fn new(
        model: Arc<dyn DetectionModel>,
        slicing: SliceConfig,
        vegetation: VegetationConfig,
    ) -> Self {
        Self {
            model,
            slicing,
            vegetation,
        }
    }

    pub fn config(&self) -> &SliceConfig {
        &self.slicing
    }

    /// `region` is the container outline in crop-local pixels, if known.
    pub fn detect(&self, crop: &RgbImage, region: Option<&[Point]>) -> Result<CropDetections> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(PipelineError::inference("container crop is empty"));
        }

        if !self.slicing.should_tile(crop.width(), crop.height()) {
            let detections = self
                .model
                .detect(crop)?
                .into_iter()
                .filter(|d| d.confidence >= self.slicing.confidence_threshold)
                .map(|d| CropDetection::new(d.bbox, d.confidence, d.label))
                .collect();
            return Ok(CropDetections {
                detections,
                tiled: false,
                tiles_processed: 1,
                tiles_skipped: 0,
            });
        }

        let tiles = generate_tiles(crop, &self.slicing, region);
        let total = tiles.len();
        let tiles: Vec<_> = tiles
            .into_iter()
            .filter(|t| {
                vegetation_ratio(&t.image, &self.vegetation, PREFILTER_STRIDE)
                    >= self.slicing.empty_tile_vegetation_ratio
            })
            .collect();
        let skipped = total - tiles.len();
        tracing::debug!(
            "Detecting with slicing: {} tiles ({} skipped as background)",
            tiles.len(),
            skipped
        );

        if tiles.is_empty() {
            return Ok(CropDetections {
                detections: vec![],
                tiled: true,
                tiles_processed: 0,
                tiles_skipped: skipped,
            });
        }

        let tile_images: Vec<RgbImage> = tiles.iter().map(|t| t.image.clone()).collect();
        let batch_results = self.model.detect_batch(&tile_images)?;
        if batch_results.len() != tiles.len() {
            return Err(PipelineError::inference(format!(
                "detector returned {} results for {} tiles",
                batch_results.len(),
                tiles.len()
            )));
        }

        let mut all_detections = Vec::new();
        for (tile, detections) in tiles.iter().zip(batch_results) {
            for det in detections {
                if det.confidence < self.slicing.confidence_threshold {
                    continue;
                }
                all_detections.push(tile_to_crop(det, &tile.rect));
            }
        }

        let merged = merge_detections(
            all_detections,
            self.slicing.match_metric,
            self.slicing.merge_threshold,
        );
        let detections = merged
            .into_iter()
            .filter(|d| d.confidence >= self.slicing.confidence_threshold)
            .collect();

        Ok(CropDetections {
            detections,
            tiled: true,
            tiles_processed: tiles.len(),
            tiles_skipped: skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testkit::{ColorBlobDetector, LEAF, SOIL};
    use image::Rgb;
    use imageproc::drawing::draw_filled_circle_mut;
    use std::sync::atomic::Ordering;

    fn scene(w: u32, h: u32, centers: &[(i32, i32)], radius: i32) -> RgbImage {
        let mut img = RgbImage::from_pixel(w, h, SOIL);
        for &c in centers {
            draw_filled_circle_mut(&mut img, c, radius, LEAF);
        }
        img
    }

    #[test]
    fn test_small_crop_runs_single_pass() {
        let detector = Arc::new(ColorBlobDetector::new(LEAF));
        let stage = TiledDetectionStage::new(
            detector.clone(),
            SliceConfig::default(),
            VegetationConfig::default(),
        );
        let img = scene(800, 300, &[(100, 100), (400, 150)], 20);
        let out = stage.detect(&img, None).unwrap();
        assert!(!out.tiled);
        assert_eq!(out.detections.len(), 2);
        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_seam_duplicates_are_merged() {
        let detector = Arc::new(ColorBlobDetector::new(LEAF));
        let stage = TiledDetectionStage::new(
            detector,
            SliceConfig::new(200, 0.3),
            VegetationConfig::default(),
        );
        // Centres chosen so several plants sit inside tile overlaps.
        let centers = [(150, 150), (300, 80), (450, 320), (170, 420), (520, 520)];
        let img = scene(600, 600, &centers, 25);
        let out = stage.detect(&img, None).unwrap();
        assert!(out.tiled);
        assert_eq!(out.detections.len(), centers.len());

        for (cx, cy) in centers {
            let found = out.detections.iter().any(|d| {
                let (x, y) = d.bbox.center();
                (x - cx as f32).abs() < 2.0 && (y - cy as f32).abs() < 2.0
            });
            assert!(found, "plant at ({cx}, {cy}) missing or mis-centered");
        }
    }

    #[test]
    fn test_background_tiles_are_skipped() {
        let detector = Arc::new(ColorBlobDetector::new(LEAF));
        let stage = TiledDetectionStage::new(
            detector,
            SliceConfig::new(200, 0.0),
            VegetationConfig::default(),
        );
        let img = scene(600, 600, &[(100, 100)], 30);
        let out = stage.detect(&img, None).unwrap();
        assert_eq!(out.tiles_processed, 1);
        assert_eq!(out.tiles_skipped, 8);
        assert_eq!(out.detections.len(), 1);
    }

    #[test]
    fn test_confidence_threshold_applies() {
        let detector = Arc::new(ColorBlobDetector::new(LEAF).with_confidence(0.1));
        let stage = TiledDetectionStage::new(
            detector,
            SliceConfig::default(),
            VegetationConfig::default(),
        );
        let img = scene(300, 300, &[(100, 100)], 20);
        assert!(stage.detect(&img, None).unwrap().detections.is_empty());
    }

    #[test]
    fn test_empty_crop_is_an_error() {
        let detector = Arc::new(ColorBlobDetector::new(Rgb([0, 0, 0])));
        let stage = TiledDetectionStage::new(
            detector,
            SliceConfig::default(),
            VegetationConfig::default(),
        );
        let err = stage.detect(&RgbImage::new(0, 10), None).unwrap_err();
        assert!(matches!(err, PipelineError::ModelInference { .. }));
    }
}
