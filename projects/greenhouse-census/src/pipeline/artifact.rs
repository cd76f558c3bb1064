//! Result artifacts: annotated image and JSON summary.

use crate::error::Result;
use crate::pipeline::aggregate::Aggregation;
use crate::pipeline::types::{ContainerCandidate, Point};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

const CONTAINER_COLOR: Rgb<u8> = Rgb([0, 120, 255]);
const DETECTION_COLOR: Rgb<u8> = Rgb([255, 40, 40]);
const ESTIMATE_COLOR: Rgb<u8> = Rgb([255, 220, 0]);

pub fn image_key(session_id: &str) -> String {
    format!("processed/{session_id}.jpg")
}

pub fn summary_key(session_id: &str) -> String {
    format!("processed/{session_id}.json")
}

fn pixel_rect(x1: f32, y1: f32, x2: f32, y2: f32) -> Option<Rect> {
    let w = (x2 - x1).round();
    let h = (y2 - y1).round();
    if w < 1.0 || h < 1.0 {
        return None;
    }
    Some(Rect::at(x1.round() as i32, y1.round() as i32).of_size(w as u32, h as u32))
}

fn draw_outline(canvas: &mut RgbImage, points: &[Point], color: Rgb<u8>) {
    if points.len() < 2 {
        return;
    }
    for (i, a) in points.iter().enumerate() {
        let b = &points[(i + 1) % points.len()];
        draw_line_segment_mut(canvas, (a.x, a.y), (b.x, b.y), color);
    }
}

/// Containers in blue, detections in red, estimated areas in yellow.
pub fn render_annotated(
    image: &RgbImage,
    candidates: &[ContainerCandidate],
    aggregation: &Aggregation,
) -> RgbImage {
    let mut canvas = image.clone();
    let (w, h) = (image.width() as f32, image.height() as f32);

    for c in candidates {
        if let Some(rect) = pixel_rect(c.bbox.x1 * w, c.bbox.y1 * h, c.bbox.x2 * w, c.bbox.y2 * h) {
            draw_hollow_rect_mut(&mut canvas, rect, CONTAINER_COLOR);
        }
    }
    for report in &aggregation.reports {
        for det in &report.detections {
            if let Some(rect) = pixel_rect(det.bbox.x1, det.bbox.y1, det.bbox.x2, det.bbox.y2) {
                draw_hollow_rect_mut(&mut canvas, rect, DETECTION_COLOR);
            }
        }
        draw_outline(&mut canvas, &report.estimate.polygon, ESTIMATE_COLOR);
    }
    canvas
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
    encoder.encode_image(image)?;
    Ok(bytes)
}

pub fn summary_json(
    session_id: &str,
    candidates: &[ContainerCandidate],
    aggregation: &Aggregation,
) -> serde_json::Value {
    let containers: Vec<_> = aggregation
        .reports
        .iter()
        .map(|r| {
            serde_json::json!({
                "index": r.index,
                "region": r.region,
                "detected": r.detections.len(),
                "estimated": r.estimate.estimated_count,
                "raw_estimate": r.estimate.raw_count,
                "bands": r.estimate.bands,
                "tiles_processed": r.tiles_processed,
                "tiles_skipped": r.tiles_skipped,
                "attempts": r.attempts,
            })
        })
        .collect();
    serde_json::json!({
        "session_id": session_id,
        "candidates": candidates.len(),
        "totals": aggregation.totals,
        "containers": containers,
        "failures": aggregation.failures,
    })
}
