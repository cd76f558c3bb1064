//! In-memory record graph for one session, built by aggregation and
//! written by the persistence writer.
//!
//! Parents are referenced by local ids handed out when they are added, so a
//! child can only name a parent that is already in the graph. The writer
//! walks the vectors in insertion order, which is therefore FK-safe.

use crate::error::{PipelineError, Result};
use crate::pipeline::types::{BandReport, ImageDetection, NormBox, Point};
use serde::Serialize;
use std::collections::BTreeMap;

pub const MOVEMENT_PHOTO_DERIVED: &str = "photo_derived";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContainerId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MovementId(pub(crate) usize);

#[derive(Debug, Clone, Serialize)]
pub struct ContainerRecord {
    pub location_id: i64,
    pub code: String,
    pub kind: String,
    pub bbox: NormBox,
    pub mask: Vec<Point>,
    pub confidence: f32,
    pub model_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchRecord {
    pub container: ContainerId,
    pub product: String,
    pub product_state: String,
    pub size: Option<String>,
    pub packaging: Option<String>,
    pub quantity: i64,
    pub empty_containers: i64,
    pub quality_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MovementRecord {
    pub batch: BatchId,
    pub movement_type: &'static str,
    pub source: Option<ContainerId>,
    pub destination: Option<ContainerId>,
    pub quantity: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionRecord {
    pub movement: MovementId,
    pub detection: ImageDetection,
}

#[derive(Debug, Clone, Serialize)]
pub struct EstimationRecord {
    pub movement: MovementId,
    pub polygon: Vec<Point>,
    pub area_cm2: f64,
    pub estimated_count: i64,
    pub raw_count: f64,
    pub method: String,
    pub confidence: f32,
    pub used_calibration: bool,
    pub bands: Vec<BandReport>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecordGraph {
    pub containers: Vec<ContainerRecord>,
    pub batches: Vec<BatchRecord>,
    pub movements: Vec<MovementRecord>,
    pub detections: Vec<DetectionRecord>,
    pub estimations: Vec<EstimationRecord>,
}

fn missing(what: &str, parent: &str, id: usize) -> PipelineError {
    PipelineError::persistence(format!("{what} references missing {parent} #{id}"))
}

impl RecordGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub fn add_container(&mut self, record: ContainerRecord) -> ContainerId {
        self.containers.push(record);
        ContainerId(self.containers.len() - 1)
    }

    pub fn add_batch(&mut self, record: BatchRecord) -> Result<BatchId> {
        self.check_container(record.container, "batch")?;
        self.batches.push(record);
        Ok(BatchId(self.batches.len() - 1))
    }

    pub fn add_movement(&mut self, record: MovementRecord) -> Result<MovementId> {
        self.check_batch(record.batch, "movement")?;
        for container in [record.source, record.destination].into_iter().flatten() {
            self.check_container(container, "movement")?;
        }
        self.movements.push(record);
        Ok(MovementId(self.movements.len() - 1))
    }

    pub fn add_detection(&mut self, movement: MovementId, detection: ImageDetection) -> Result<()> {
        self.check_movement(movement, "detection")?;
        self.detections.push(DetectionRecord {
            movement,
            detection,
        });
        Ok(())
    }

    pub fn add_estimation(&mut self, record: EstimationRecord) -> Result<()> {
        self.check_movement(record.movement, "estimation")?;
        self.estimations.push(record);
        Ok(())
    }

    /// Re-check every reference. Guards graphs assembled by hand.
    pub fn validate(&self) -> Result<()> {
        for b in &self.batches {
            self.check_container(b.container, "batch")?;
        }
        for m in &self.movements {
            self.check_batch(m.batch, "movement")?;
            for c in [m.source, m.destination].into_iter().flatten() {
                self.check_container(c, "movement")?;
            }
        }
        for d in &self.detections {
            self.check_movement(d.movement, "detection")?;
        }
        for e in &self.estimations {
            self.check_movement(e.movement, "estimation")?;
        }
        Ok(())
    }

    fn check_container(&self, id: ContainerId, what: &str) -> Result<()> {
        if id.0 < self.containers.len() {
            Ok(())
        } else {
            Err(missing(what, "container", id.0))
        }
    }

    fn check_batch(&self, id: BatchId, what: &str) -> Result<()> {
        if id.0 < self.batches.len() {
            Ok(())
        } else {
            Err(missing(what, "batch", id.0))
        }
    }

    fn check_movement(&self, id: MovementId, what: &str) -> Result<()> {
        if id.0 < self.movements.len() {
            Ok(())
        } else {
            Err(missing(what, "movement", id.0))
        }
    }
}

/// Session-level figures written together with the graph.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionTotals {
    pub total_detected: i64,
    pub total_estimated: i64,
    pub total_empty_containers: i64,
    pub avg_confidence: Option<f64>,
    pub category_counts: BTreeMap<String, i64>,
    pub warning_detail: Option<serde_json::Value>,
    pub processed_image_path: Option<String>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::types::PixelBox;

    pub(crate) fn container(code: &str) -> ContainerRecord {
        ContainerRecord {
            location_id: 1,
            code: code.to_string(),
            kind: "segment".to_string(),
            bbox: NormBox::new(0.0, 0.0, 0.5, 0.5),
            mask: vec![],
            confidence: 0.9,
            model_version: "seg-1".to_string(),
        }
    }

    pub(crate) fn batch(container: ContainerId, quantity: i64) -> BatchRecord {
        BatchRecord {
            container,
            product: "lettuce".to_string(),
            product_state: "seedling".to_string(),
            size: None,
            packaging: None,
            quantity,
            empty_containers: 0,
            quality_score: Some(0.9),
        }
    }

    pub(crate) fn movement(batch: BatchId, destination: ContainerId, quantity: i64) -> MovementRecord {
        MovementRecord {
            batch,
            movement_type: MOVEMENT_PHOTO_DERIVED,
            source: None,
            destination: Some(destination),
            quantity,
        }
    }

    pub(crate) fn detection(x: f32) -> ImageDetection {
        let bbox = PixelBox::new(x, 10.0, x + 20.0, 30.0);
        ImageDetection {
            center_x: x + 10.0,
            center_y: 20.0,
            width: 20.0,
            height: 20.0,
            bbox,
            confidence: 0.8,
            label: "plant".to_string(),
            is_empty: false,
            is_alive: true,
        }
    }

    pub(crate) fn estimation(movement: MovementId) -> EstimationRecord {
        EstimationRecord {
            movement,
            polygon: vec![],
            area_cm2: 12.0,
            estimated_count: 3,
            raw_count: 2.7,
            method: "band_estimation".to_string(),
            confidence: 0.7,
            used_calibration: false,
            bands: vec![],
        }
    }

    #[test]
    fn test_children_require_existing_parents() {
        let mut graph = RecordGraph::new();

        // Nothing exists yet.
        assert!(graph.add_batch(batch(ContainerId(0), 1)).is_err());
        assert!(graph.add_detection(MovementId(0), detection(0.0)).is_err());
        assert!(graph.add_estimation(estimation(MovementId(0))).is_err());

        let c = graph.add_container(container("L1-C00"));
        // Movement before its batch.
        assert!(graph.add_movement(movement(BatchId(0), c, 1)).is_err());

        let b = graph.add_batch(batch(c, 2)).unwrap();
        let m = graph.add_movement(movement(b, c, 2)).unwrap();
        graph.add_detection(m, detection(0.0)).unwrap();
        graph.add_estimation(estimation(m)).unwrap();

        let err = graph.add_detection(MovementId(3), detection(5.0)).unwrap_err();
        assert!(matches!(err, PipelineError::Persistence { .. }));
        assert!(graph.add_movement(movement(b, ContainerId(4), 1)).is_err());
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_validate_catches_forged_references() {
        let mut graph = RecordGraph::new();
        let c = graph.add_container(container("L1-C00"));
        let b = graph.add_batch(batch(c, 1)).unwrap();
        graph.add_movement(movement(b, c, 1)).unwrap();
        graph.detections.push(DetectionRecord {
            movement: MovementId(9),
            detection: detection(0.0),
        });
        assert!(graph.validate().is_err());
    }
}
