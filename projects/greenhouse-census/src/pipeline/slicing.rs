use crate::models::RawDetection;
use crate::pipeline::types::{CropDetection, PixelBox, Point};
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// How two detections are compared when merging tile results
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMetric {
    /// Intersection over union
    Iou,
    /// Intersection over the smaller box; catches plants cut by a tile seam
    Ios,
}

/// Configuration for sliding window inference
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceConfig {
    /// Size of each square tile (e.g., 640)
    pub tile_size: u32,
    /// Overlap between tiles as fraction (0.0-0.5)
    pub overlap: f32,
    /// Crops whose shorter side is below this run a single direct pass
    pub min_tile_size: u32,
    /// Match threshold for merging duplicate detections
    pub merge_threshold: f32,
    pub match_metric: MatchMetric,
    /// Detections below this confidence are dropped before returning
    pub confidence_threshold: f32,
    /// Tiles with a smaller vegetation fraction are skipped
    pub empty_tile_vegetation_ratio: f64,
}

impl SliceConfig {
    pub fn new(tile_size: u32, overlap: f32) -> Self {
        Self {
            tile_size,
            overlap: overlap.clamp(0.0, 0.5),
            min_tile_size: tile_size,
            ..Self::default()
        }
    }

    /// Calculate stride between tiles based on overlap
    pub fn stride(&self) -> u32 {
        (((self.tile_size as f32) * (1.0 - self.overlap.clamp(0.0, 0.5))) as u32).max(1)
    }

    /// Whether a crop of this size is tiled or detected in one pass
    pub fn should_tile(&self, width: u32, height: u32) -> bool {
        self.tile_size > 0 && width.min(height) >= self.min_tile_size.max(1)
    }
}

impl Default for SliceConfig {
    fn default() -> Self {
        Self {
            tile_size: 640,
            overlap: 0.2,
            min_tile_size: 640,
            merge_threshold: 0.5,
            match_metric: MatchMetric::Iou,
            confidence_threshold: 0.25,
            empty_tile_vegetation_ratio: 0.001,
        }
    }
}

/// Placement of a tile inside the crop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileRect {
    pub x_offset: u32,
    pub y_offset: u32,
    pub width: u32,
    pub height: u32,
}

/// A tile extracted from a larger image
#[derive(Clone)]
pub struct Tile {
    pub image: RgbImage,
    pub rect: TileRect,
}

/// Helper to generate tile offsets along one dimension.
/// Consecutive offsets are at most `stride` apart and the final tile is
/// edge-aligned, so the tiles cover the full extent.
fn generate_offsets(total_size: u32, tile_size: u32, stride: u32) -> Vec<u32> {
    if total_size <= tile_size {
        return vec![0];
    }

    let limit = total_size - tile_size;
    let mut offsets = Vec::new();

    let mut pos = 0;
    while pos < limit {
        offsets.push(pos);
        pos += stride;
    }

    // Handle the final edge-aligned tile
    offsets.push(limit);
    offsets
}

/// Tile layout for a crop of the given size.
pub fn plan_tiles(width: u32, height: u32, config: &SliceConfig) -> Vec<TileRect> {
    if config.tile_size == 0 || width == 0 || height == 0 {
        return vec![];
    }
    let stride = config.stride();
    let x_offsets = generate_offsets(width, config.tile_size, stride);
    let y_offsets = generate_offsets(height, config.tile_size, stride);

    let mut rects = Vec::with_capacity(x_offsets.len() * y_offsets.len());
    for &y in &y_offsets {
        for &x in &x_offsets {
            rects.push(TileRect {
                x_offset: x,
                y_offset: y,
                width: config.tile_size.min(width - x),
                height: config.tile_size.min(height - y),
            });
        }
    }
    rects
}

/// Generate overlapping tiles from an image, optionally keeping only tiles
/// that touch the container outline (crop-local pixels).
pub fn generate_tiles(image: &RgbImage, config: &SliceConfig, region: Option<&[Point]>) -> Vec<Tile> {
    plan_tiles(image.width(), image.height(), config)
        .into_iter()
        .filter(|rect| match region {
            Some(poly) if poly.len() >= 3 => is_tile_overlapping_polygon(rect, poly),
            _ => true,
        })
        .map(|rect| Tile {
            image: image::imageops::crop_imm(
                image,
                rect.x_offset,
                rect.y_offset,
                rect.width,
                rect.height,
            )
            .to_image(),
            rect,
        })
        .collect()
}

/// Check if a tile overlaps with a polygon
fn is_tile_overlapping_polygon(tile: &TileRect, poly: &[Point]) -> bool {
    if poly.is_empty() {
        return false;
    }

    let left = tile.x_offset as f32;
    let top = tile.y_offset as f32;
    let right = (tile.x_offset + tile.width) as f32;
    let bottom = (tile.y_offset + tile.height) as f32;

    // 1. Fast path: Bounding box check
    let mut min_x = f32::MAX;
    let mut max_x = f32::MIN;
    let mut min_y = f32::MAX;
    let mut max_y = f32::MIN;
    for p in poly {
        min_x = min_x.min(p.x);
        max_x = max_x.max(p.x);
        min_y = min_y.min(p.y);
        max_y = max_y.max(p.y);
    }
    if max_x < left || min_x > right || max_y < top || min_y > bottom {
        return false;
    }

    // 2. Any polygon vertex inside the tile
    if poly
        .iter()
        .any(|p| p.x >= left && p.x <= right && p.y >= top && p.y <= bottom)
    {
        return true;
    }

    // 3. Any tile corner inside the polygon
    let corners = [
        Point { x: left, y: top },
        Point { x: right, y: top },
        Point {
            x: right,
            y: bottom,
        },
        Point { x: left, y: bottom },
    ];
    if corners
        .iter()
        .any(|v| crate::pipeline::geometry::is_point_in_polygon_robust(v.x, v.y, poly))
    {
        return true;
    }

    // 4. Edge intersections
    for i in 0..poly.len() {
        let p1 = poly[i];
        let p2 = poly[(i + 1) % poly.len()];
        for j in 0..4 {
            if segments_intersect(p1, p2, corners[j], corners[(j + 1) % 4]) {
                return true;
            }
        }
    }

    false
}

fn segments_intersect(p1: Point, p2: Point, p3: Point, p4: Point) -> bool {
    fn ccw(a: Point, b: Point, c: Point) -> bool {
        (c.y - a.y) * (b.x - a.x) > (b.y - a.y) * (c.x - a.x)
    }
    ccw(p1, p3, p4) != ccw(p2, p3, p4) && ccw(p1, p2, p3) != ccw(p1, p2, p4)
}

/// Transform a detection from tile coordinates to crop coordinates
pub fn tile_to_crop(detection: RawDetection, tile: &TileRect) -> CropDetection {
    CropDetection {
        bbox: detection
            .bbox
            .translated(tile.x_offset as f32, tile.y_offset as f32),
        confidence: detection.confidence,
        label: detection.label,
    }
}

fn matches(a: &PixelBox, b: &PixelBox, metric: MatchMetric, threshold: f32) -> bool {
    let score = match metric {
        MatchMetric::Iou => a.iou(b),
        MatchMetric::Ios => a.ios(b),
    };
    score > threshold
}

/// One greedy non-maximum-merge pass. Returns true if anything merged.
fn merge_pass(
    detections: &mut Vec<CropDetection>,
    metric: MatchMetric,
    threshold: f32,
) -> bool {
    // Sort by confidence (highest first)
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<CropDetection> = Vec::with_capacity(detections.len());
    let mut absorbed = vec![false; detections.len()];
    let mut merged_any = false;

    for i in 0..detections.len() {
        if absorbed[i] {
            continue;
        }
        let mut kept = detections[i].clone();
        for j in (i + 1)..detections.len() {
            if absorbed[j] {
                continue;
            }
            if matches(&detections[i].bbox, &detections[j].bbox, metric, threshold) {
                absorbed[j] = true;
                merged_any = true;
                kept.bbox = kept.bbox.union(&detections[j].bbox);
            }
        }
        keep.push(kept);
    }

    *detections = keep;
    merged_any
}

/// Merge duplicates arising from tile overlap: highest confidence wins the
/// label and score, the box grows to cover the absorbed duplicates. Passes
/// repeat until nothing merges, so merging a merged set is a no-op.
pub fn merge_detections(
    mut detections: Vec<CropDetection>,
    metric: MatchMetric,
    threshold: f32,
) -> Vec<CropDetection> {
    while merge_pass(&mut detections, metric, threshold) {}
    detections
}
