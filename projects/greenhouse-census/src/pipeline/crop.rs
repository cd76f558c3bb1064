use crate::error::{PipelineError, Result};
use crate::pipeline::detection::TiledDetectionStage;
use crate::pipeline::estimation::{BandEstimator, DensityParameters};
use crate::pipeline::geometry::{crop_region, mask_to_crop_local, CropOrigin};
use crate::pipeline::types::{ContainerCandidate, ContainerReport, CropRegion, ProcessingState};
use image::RgbImage;
use std::time::Instant;

/// Copy a pixel region out of the full image.
pub fn extract_crop(image: &RgbImage, region: &CropRegion) -> RgbImage {
    image::imageops::crop_imm(image, region.x, region.y, region.width, region.height).to_image()
}

/// One container's unit of work: crop, detect, then estimate.
pub struct ContainerProcessor {
    detection: TiledDetectionStage,
    estimator: BandEstimator,
}

impl ContainerProcessor {
    pub fn new(detection: TiledDetectionStage, estimator: BandEstimator) -> Self {
        Self {
            detection,
            estimator,
        }
    }

    pub fn process(
        &self,
        image: &RgbImage,
        candidate: &ContainerCandidate,
        density: Option<&DensityParameters>,
        state: Option<&ProcessingState>,
    ) -> Result<ContainerReport> {
        let (w, h) = image.dimensions();
        let region = crop_region(&candidate.bbox, w, h).ok_or_else(|| {
            PipelineError::inference(format!("container {} has an empty crop", candidate.index))
        })?;
        let crop = extract_crop(image, &region);
        let local_mask = if candidate.mask.len() >= 3 {
            Some(mask_to_crop_local(&candidate.mask, &region, w, h))
        } else {
            None
        };

        let start = Instant::now();
        let found = self.detection.detect(&crop, local_mask.as_deref())?;
        if let Some(state) = state {
            state.advance_stage("detection", start.elapsed().as_secs_f64() * 1000.0);
        }

        // Estimation consumes the crop-local detections.
        let start = Instant::now();
        let mut estimate =
            self.estimator
                .estimate(&crop, &found.detections, local_mask.as_deref(), density);
        if let Some(state) = state {
            state.advance_stage("estimation", start.elapsed().as_secs_f64() * 1000.0);
        }

        let origin = CropOrigin::from_region(&region);
        estimate.polygon = origin.to_image_points(&estimate.polygon);
        let detections = found
            .detections
            .into_iter()
            .map(|d| origin.to_image_space(d))
            .collect::<Vec<_>>();

        tracing::debug!(
            "Container {}: {} detected, {} estimated ({} tiles, {} skipped)",
            candidate.index,
            detections.len(),
            estimate.estimated_count,
            found.tiles_processed,
            found.tiles_skipped
        );

        Ok(ContainerReport {
            index: candidate.index,
            region,
            detections,
            estimate,
            tiles_processed: found.tiles_processed,
            tiles_skipped: found.tiles_skipped,
            attempts: 1,
        })
    }
}
