use crate::error::Result;
use crate::models::{SegmentCandidate, SegmentationModel};
use crate::pipeline::geometry::crop_region;
use crate::pipeline::types::{ContainerCandidate, Point};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    /// Candidates below this confidence are discarded.
    pub confidence_floor: f32,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.5,
        }
    }
}

/// Splits the full photo into physical container candidates.
/// Stateless: one inference call, no other I/O.
pub struct SegmentationStage {
    model: Arc<dyn SegmentationModel>,
    config: SegmentationConfig,
}

impl SegmentationStage {
    pub fn new(model: Arc<dyn SegmentationModel>, config: SegmentationConfig) -> Self {
        Self { model, config }
    }

    pub fn run(&self, image: &RgbImage) -> Result<Vec<ContainerCandidate>> {
        let raw = self.model.segment(image)?;
        let total = raw.len();
        let (w, h) = image.dimensions();
        let accepted = accept_candidates(raw, &self.config, self.model.version(), w, h);
        tracing::debug!(
            "Segmentation accepted {} of {} candidates",
            accepted.len(),
            total
        );
        Ok(accepted)
    }
}

/// Filter, clamp and order raw candidates (top-to-bottom, then left-to-right).
/// A box that covers no whole pixel of the `image_w` x `image_h` photo is
/// degenerate and dropped here.
pub fn accept_candidates(
    raw: Vec<SegmentCandidate>,
    config: &SegmentationConfig,
    model_version: &str,
    image_w: u32,
    image_h: u32,
) -> Vec<ContainerCandidate> {
    let mut kept: Vec<ContainerCandidate> = raw
        .into_iter()
        .filter(|c| c.confidence.is_finite() && c.confidence >= config.confidence_floor)
        .filter_map(|c| {
            let bbox = c.bbox.clamped();
            if bbox.is_degenerate() || crop_region(&bbox, image_w, image_h).is_none() {
                return None;
            }
            let mask = c
                .mask
                .iter()
                .filter(|p| p.x.is_finite() && p.y.is_finite())
                .map(|p| Point {
                    x: p.x.clamp(0.0, 1.0),
                    y: p.y.clamp(0.0, 1.0),
                })
                .collect();
            Some(ContainerCandidate {
                index: 0,
                bbox,
                mask,
                confidence: c.confidence,
                kind: c.label,
                model_version: model_version.to_string(),
            })
        })
        .collect();

    kept.sort_by(|a, b| {
        a.bbox
            .y1
            .partial_cmp(&b.bbox.y1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                a.bbox
                    .x1
                    .partial_cmp(&b.bbox.x1)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });
    for (i, c) in kept.iter_mut().enumerate() {
        c.index = i;
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::NormBox;

    fn candidate(bbox: NormBox, confidence: f32) -> SegmentCandidate {
        SegmentCandidate {
            bbox,
            mask: vec![],
            confidence,
            label: "tray".to_string(),
        }
    }

    #[test]
    fn test_floor_and_degenerate_filtering() {
        let raw = vec![
            candidate(NormBox::new(0.5, 0.0, 1.0, 0.5), 0.9),
            candidate(NormBox::new(0.0, 0.0, 0.5, 0.5), 0.3),
            candidate(NormBox::new(0.2, 0.6, 0.2, 0.9), 0.95),
            candidate(NormBox::new(0.0, 0.5, 0.5, 1.2), 0.7),
        ];
        let accepted = accept_candidates(raw, &SegmentationConfig::default(), "seg-v1", 4000, 3000);
        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted[0].bbox, NormBox::new(0.5, 0.0, 1.0, 0.5));
        assert_eq!(accepted[1].bbox, NormBox::new(0.0, 0.5, 0.5, 1.0));
        assert_eq!(accepted[0].index, 0);
        assert_eq!(accepted[1].index, 1);
        assert!(accepted.iter().all(|c| c.model_version == "seg-v1"));
    }

    #[test]
    fn test_ordering_is_reading_order() {
        let raw = vec![
            candidate(NormBox::new(0.5, 0.1, 0.9, 0.4), 0.9),
            candidate(NormBox::new(0.1, 0.1, 0.4, 0.4), 0.9),
            candidate(NormBox::new(0.1, 0.5, 0.4, 0.9), 0.9),
        ];
        let accepted = accept_candidates(raw, &SegmentationConfig::default(), "v", 4000, 3000);
        let xs: Vec<(f32, f32)> = accepted.iter().map(|c| (c.bbox.x1, c.bbox.y1)).collect();
        assert_eq!(xs, vec![(0.1, 0.1), (0.5, 0.1), (0.1, 0.5)]);
    }

    #[test]
    fn test_sub_pixel_box_is_degenerate() {
        // 0.001 of a 100px wide photo rounds to an empty crop.
        let raw = vec![
            candidate(NormBox::new(0.5, 0.5, 0.501, 0.9), 0.9),
            candidate(NormBox::new(0.1, 0.1, 0.4, 0.4), 0.9),
        ];
        let accepted = accept_candidates(raw, &SegmentationConfig::default(), "v", 100, 100);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].bbox, NormBox::new(0.1, 0.1, 0.4, 0.4));
        assert_eq!(accepted[0].index, 0);
    }
}
