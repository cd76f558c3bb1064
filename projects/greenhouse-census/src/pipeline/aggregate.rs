//! Fan-in step: fold per-container outcomes into session totals and the
//! record graph handed to the persistence writer.

use crate::directory::{Classification, LocationContext};
use crate::error::{Failure, IsolatedFailure, Result};
use crate::persistence::graph::{
    BatchRecord, ContainerRecord, EstimationRecord, MovementRecord, RecordGraph, SessionTotals,
    MOVEMENT_PHOTO_DERIVED,
};
use crate::persistence::SessionStatus;
use crate::pipeline::estimation::DensityParameters;
use crate::pipeline::fanin::UnitOutcome;
use crate::pipeline::types::{ContainerCandidate, ContainerReport};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct Aggregation {
    pub totals: SessionTotals,
    pub graph: RecordGraph,
    pub reports: Vec<ContainerReport>,
    pub failures: Vec<IsolatedFailure>,
}

/// `{location}-{session}-C{index:02}`. Codes are unique across all
/// sessions, so the whole session id is kept.
pub fn container_code(location_code: &str, session_id: &str, index: usize) -> String {
    format!("{location_code}-{session_id}-C{index:02}")
}

/// Session status implied by the failures collected so far.
pub fn disposition(failures: &[Failure]) -> SessionStatus {
    let mut status = SessionStatus::Completed;
    for failure in failures {
        match failure {
            Failure::Fatal(_) => return SessionStatus::Failed,
            Failure::Isolated(_) => status = SessionStatus::Warning,
        }
    }
    status
}

pub fn warning_detail(failures: &[IsolatedFailure]) -> Option<serde_json::Value> {
    if failures.is_empty() {
        return None;
    }
    Some(serde_json::json!({ "skipped": failures }))
}

/// Plant area learned from the calibrated bands of this session, weighted
/// by sample count. The pixel scale is carried over from `prior`.
pub fn learned_density(
    reports: &[ContainerReport],
    prior: Option<&DensityParameters>,
    default_pixels_per_cm2: f64,
) -> Option<DensityParameters> {
    let mut weighted = 0.0;
    let mut samples = 0usize;
    for report in reports {
        if let Some((area, n)) = report.estimate.calibrated_plant_area() {
            weighted += area * n as f64;
            samples += n;
        }
    }
    if samples == 0 {
        return None;
    }
    Some(DensityParameters {
        avg_plant_area_px: weighted / samples as f64,
        pixels_per_cm2: prior.map_or(default_pixels_per_cm2, |p| p.pixels_per_cm2),
        samples,
    })
}

/// Aggregate outcomes. Without a location no container graph is built:
/// containers must belong to a location. Totals are computed either way.
pub fn aggregate(
    session_id: &str,
    location: Option<&LocationContext>,
    classification: &Classification,
    candidates: &[ContainerCandidate],
    outcomes: Vec<UnitOutcome>,
    mut failures: Vec<IsolatedFailure>,
) -> Result<Aggregation> {
    let mut reports = Vec::new();
    for outcome in outcomes {
        match outcome {
            UnitOutcome::Done(report) => reports.push(report),
            UnitOutcome::Failed(failure) => failures.push(failure),
        }
    }
    reports.sort_by_key(|r| r.index);

    let mut totals = SessionTotals::default();
    let mut weighted_confidence = 0.0;
    let mut weight = 0.0;
    for report in &reports {
        for det in &report.detections {
            if det.is_empty {
                totals.total_empty_containers += 1;
            } else {
                totals.total_detected += 1;
            }
            weighted_confidence += det.confidence as f64;
            weight += 1.0;
        }
        let estimated = report.estimate.estimated_count as f64;
        totals.total_estimated += report.estimate.estimated_count as i64;
        weighted_confidence += report.estimate.confidence as f64 * estimated;
        weight += estimated;
    }
    totals.avg_confidence = (weight > 0.0).then(|| weighted_confidence / weight);

    let plants = totals.total_detected + totals.total_estimated;
    let mut category_counts = BTreeMap::new();
    if plants > 0 {
        category_counts.insert(classification.category(), plants);
    }
    totals.category_counts = category_counts;

    let mut graph = RecordGraph::new();
    if let Some(location) = location {
        for candidate in candidates {
            let container = graph.add_container(ContainerRecord {
                location_id: location.id,
                code: container_code(&location.code, session_id, candidate.index),
                kind: candidate.kind.clone(),
                bbox: candidate.bbox,
                mask: candidate.mask.clone(),
                confidence: candidate.confidence,
                model_version: candidate.model_version.clone(),
            });

            let Some(report) = reports.iter().find(|r| r.index == candidate.index) else {
                continue;
            };
            let alive = report.detections.iter().filter(|d| !d.is_empty).count() as i64;
            let empty = report.detections.len() as i64 - alive;
            let estimated = report.estimate.estimated_count as i64;
            let quantity = alive + estimated;
            if quantity == 0 && empty == 0 {
                continue;
            }

            let quality_score = if report.detections.is_empty() {
                Some(report.estimate.confidence as f64)
            } else {
                Some(
                    report.detections.iter().map(|d| d.confidence as f64).sum::<f64>()
                        / report.detections.len() as f64,
                )
            };
            let batch = graph.add_batch(BatchRecord {
                container,
                product: classification.product.clone(),
                product_state: classification.product_state.clone(),
                size: classification.size.clone(),
                packaging: classification.packaging.clone(),
                quantity,
                empty_containers: empty,
                quality_score,
            })?;
            let movement = graph.add_movement(MovementRecord {
                batch,
                movement_type: MOVEMENT_PHOTO_DERIVED,
                source: None,
                destination: Some(container),
                quantity,
            })?;
            for det in &report.detections {
                graph.add_detection(movement, det.clone())?;
            }
            if estimated > 0 {
                let est = &report.estimate;
                graph.add_estimation(EstimationRecord {
                    movement,
                    polygon: est.polygon.clone(),
                    area_cm2: est.area_cm2,
                    estimated_count: estimated,
                    raw_count: est.raw_count,
                    method: est.method.to_string(),
                    confidence: est.confidence,
                    used_calibration: est.used_calibration,
                    bands: est.bands.clone(),
                })?;
            }
        }
    }

    failures.sort_by_key(|f| f.container_index);
    totals.warning_detail = warning_detail(&failures);

    Ok(Aggregation {
        totals,
        graph,
        reports,
        failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FatalFailure, PipelineError};
    use crate::pipeline::types::{
        BandReport, ContainerEstimate, CropRegion, ImageDetection, NormBox, PixelBox,
    };

    fn candidate(index: usize) -> ContainerCandidate {
        ContainerCandidate {
            index,
            bbox: NormBox::new(0.1 * index as f32, 0.0, 0.1 * index as f32 + 0.1, 0.5),
            mask: vec![],
            confidence: 0.9,
            kind: "tray".to_string(),
            model_version: "seg-1".to_string(),
        }
    }

    fn det(confidence: f32, empty: bool) -> ImageDetection {
        let bbox = PixelBox::new(0.0, 0.0, 10.0, 10.0);
        ImageDetection {
            center_x: 5.0,
            center_y: 5.0,
            width: 10.0,
            height: 10.0,
            bbox,
            confidence,
            label: if empty { "empty_pot" } else { "plant" }.to_string(),
            is_empty: empty,
            is_alive: !empty,
        }
    }

    fn report(index: usize, detections: Vec<ImageDetection>, estimated: u32) -> ContainerReport {
        ContainerReport {
            index,
            region: CropRegion {
                x: 0,
                y: 0,
                width: 10,
                height: 10,
            },
            detections,
            estimate: ContainerEstimate {
                polygon: vec![],
                residual_area_px: 0.0,
                area_cm2: 3.0,
                raw_count: estimated as f64 * 0.9,
                estimated_count: estimated,
                bands: vec![],
                used_calibration: false,
                confidence: 0.7,
                method: "band_estimation",
            },
            tiles_processed: 1,
            tiles_skipped: 0,
            attempts: 1,
        }
    }

    fn location() -> LocationContext {
        LocationContext {
            id: 4,
            code: "GH1".to_string(),
            name: "Greenhouse 1".to_string(),
            density: None,
        }
    }

    fn lettuce() -> Classification {
        Classification {
            product: "lettuce".to_string(),
            product_state: "seedling".to_string(),
            packaging: None,
            size: None,
        }
    }

    #[test]
    fn test_totals_and_weighted_confidence() {
        let outcomes = vec![
            UnitOutcome::Done(report(1, vec![det(0.9, false), det(0.5, true)], 2)),
            UnitOutcome::Done(report(0, vec![det(0.8, false)], 0)),
        ];
        let agg = aggregate(
            "0b1c2d3e-aaaa",
            Some(&location()),
            &lettuce(),
            &[candidate(0), candidate(1)],
            outcomes,
            vec![],
        )
        .unwrap();

        assert_eq!(agg.totals.total_detected, 2);
        assert_eq!(agg.totals.total_empty_containers, 1);
        assert_eq!(agg.totals.total_estimated, 2);
        let expected = (0.9 + 0.5 + 0.8 + 0.7 * 2.0) / 5.0;
        assert!((agg.totals.avg_confidence.unwrap() - expected).abs() < 1e-6);
        assert_eq!(agg.totals.category_counts["lettuce:seedling"], 4);
        assert!(agg.totals.warning_detail.is_none());

        assert_eq!(agg.graph.containers.len(), 2);
        assert_eq!(agg.graph.containers[0].code, "GH1-0b1c2d3e-aaaa-C00");
        assert_eq!(agg.graph.batches.len(), 2);
        assert_eq!(agg.graph.movements[1].quantity, 3);
        assert_eq!(agg.graph.detections.len(), 3);
        assert_eq!(agg.graph.estimations.len(), 1);
        assert!(agg.graph.validate().is_ok());
        assert_eq!(agg.reports[0].index, 0);
    }

    #[test]
    fn test_failed_container_gets_row_but_no_batch() {
        let failure = IsolatedFailure::container(1, &PipelineError::inference("corrupt"), 2);
        let outcomes = vec![
            UnitOutcome::Done(report(0, vec![det(0.9, false)], 0)),
            UnitOutcome::Failed(failure),
        ];
        let agg = aggregate(
            "s",
            Some(&location()),
            &lettuce(),
            &[candidate(0), candidate(1)],
            outcomes,
            vec![],
        )
        .unwrap();
        assert_eq!(agg.graph.containers.len(), 2);
        assert_eq!(agg.graph.batches.len(), 1);
        assert_eq!(agg.failures.len(), 1);
        let detail = agg.totals.warning_detail.unwrap();
        assert_eq!(detail["skipped"][0]["container_index"], 1);
        assert_eq!(detail["skipped"][0]["attempts"], 2);
    }

    #[test]
    fn test_missing_location_skips_graph_but_keeps_totals() {
        let outcomes = vec![UnitOutcome::Done(report(0, vec![det(0.9, false)], 3))];
        let agg = aggregate(
            "s",
            None,
            &Classification::default(),
            &[candidate(0)],
            outcomes,
            vec![IsolatedFailure::context("resource_not_found", "location unresolved")],
        )
        .unwrap();
        assert!(agg.graph.is_empty());
        assert_eq!(agg.totals.total_estimated, 3);
        assert_eq!(agg.totals.category_counts["unclassified:unknown"], 4);
        assert!(agg.totals.warning_detail.is_some());
    }

    #[test]
    fn test_disposition_is_exhaustive() {
        assert_eq!(disposition(&[]), SessionStatus::Completed);
        let isolated = Failure::Isolated(IsolatedFailure::context("x", "y"));
        assert_eq!(disposition(&[isolated.clone()]), SessionStatus::Warning);
        let fatal = Failure::Fatal(FatalFailure::new("download", PipelineError::storage("down")));
        assert_eq!(disposition(&[isolated, fatal]), SessionStatus::Failed);
    }

    #[test]
    fn test_container_code_format() {
        assert_eq!(
            container_code("GH2", "12345678-9abc-def0", 3),
            "GH2-12345678-9abc-def0-C03"
        );
        assert_ne!(
            container_code("GH1", "greenhouse-photo-001", 0),
            container_code("GH1", "greenhouse-photo-002", 0)
        );
    }

    #[test]
    fn test_learned_density_weights_by_samples() {
        let band = |area: f64, samples: usize, calibrated: bool| BandReport {
            band: 0,
            y_start: 0,
            y_end: 10,
            vegetated_px: 0,
            residual_px: 0,
            plant_area_px: area,
            samples,
            calibrated,
            estimated: 0.0,
        };
        let mut a = report(0, vec![], 0);
        a.estimate.bands = vec![band(100.0, 10, true), band(999.0, 3, false)];
        let mut b = report(1, vec![], 0);
        b.estimate.bands = vec![band(200.0, 30, true)];

        let prior = DensityParameters {
            avg_plant_area_px: 50.0,
            pixels_per_cm2: 4.0,
            samples: 1,
        };
        let learned = learned_density(&[a, b], Some(&prior), 1.0).unwrap();
        assert_eq!(learned.samples, 40);
        assert!((learned.avg_plant_area_px - 175.0).abs() < 1e-9);
        assert_eq!(learned.pixels_per_cm2, 4.0);

        assert!(learned_density(&[report(0, vec![], 1)], None, 1.0).is_none());
    }

    #[test]
    fn test_band_means_weighted_by_samples_within_container() {
        let band = |area: f64, samples: usize| BandReport {
            band: 0,
            y_start: 0,
            y_end: 10,
            vegetated_px: 0,
            residual_px: 0,
            plant_area_px: area,
            samples,
            calibrated: true,
            estimated: 0.0,
        };
        let mut a = report(0, vec![], 0);
        a.estimate.bands = vec![band(100.0, 10), band(400.0, 30)];

        let (area, samples) = a.estimate.calibrated_plant_area().unwrap();
        assert_eq!(samples, 40);
        assert!((area - 325.0).abs() < 1e-9);

        let learned = learned_density(&[a], None, 2.0).unwrap();
        assert!((learned.avg_plant_area_px - 325.0).abs() < 1e-9);
        assert_eq!(learned.pixels_per_cm2, 2.0);
    }
}
