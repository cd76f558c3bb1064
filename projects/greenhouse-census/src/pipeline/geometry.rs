use crate::pipeline::types::{CropDetection, CropRegion, ImageDetection, NormBox, Point};
use geo::{Area, ConvexHull, Contains};
use geo_types::{LineString, MultiPoint, Point as GeoPoint, Polygon};

/// Convert our pipeline points to a geo_types Polygon
pub fn to_geo_polygon(points: &[Point]) -> Polygon<f64> {
    let coords: Vec<(f64, f64)> = points.iter().map(|p| (p.x as f64, p.y as f64)).collect();
    let ls = LineString::from(coords);
    Polygon::new(ls, vec![])
}

/// Exterior ring of a geo Polygon as our Points, without the closing vertex.
pub fn from_geo_polygon(poly: &Polygon<f64>) -> Vec<Point> {
    let mut points: Vec<Point> = poly
        .exterior()
        .coords()
        .map(|c| Point {
            x: c.x as f32,
            y: c.y as f32,
        })
        .collect();
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    points
}

pub fn polygon_area(points: &[Point]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    to_geo_polygon(points).unsigned_area()
}

/// Convex hull of a point cloud.
pub fn convex_hull(points: &[Point]) -> Vec<Point> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let mp: MultiPoint<f64> = points
        .iter()
        .map(|p| GeoPoint::new(p.x as f64, p.y as f64))
        .collect::<Vec<_>>()
        .into();
    from_geo_polygon(&mp.convex_hull())
}

/// Robust point-in-polygon using geo crate
pub fn is_point_in_polygon_robust(x: f32, y: f32, polygon: &[Point]) -> bool {
    let poly = to_geo_polygon(polygon);
    let point = GeoPoint::new(x as f64, y as f64);
    poly.contains(&point)
}

/// Pixel rectangle covered by a normalized box, clamped to the image.
/// Returns `None` when the clamped crop is empty.
pub fn crop_region(bbox: &NormBox, image_w: u32, image_h: u32) -> Option<CropRegion> {
    let width = image_w as f32;
    let height = image_h as f32;

    let x = (bbox.x1 * width).round() as i64;
    let y = (bbox.y1 * height).round() as i64;
    let x2 = (bbox.x2 * width).round() as i64;
    let y2 = (bbox.y2 * height).round() as i64;

    let x_clamped = x.clamp(0, image_w as i64);
    let y_clamped = y.clamp(0, image_h as i64);
    let w_clamped = (x2.clamp(0, image_w as i64) - x_clamped).max(0);
    let h_clamped = (y2.clamp(0, image_h as i64) - y_clamped).max(0);

    if w_clamped == 0 || h_clamped == 0 {
        return None;
    }

    Some(CropRegion {
        x: x_clamped as u32,
        y: y_clamped as u32,
        width: w_clamped as u32,
        height: h_clamped as u32,
    })
}

/// Transforms mask coordinates from normalized full-image to crop-local pixels.
pub fn mask_to_crop_local(
    mask: &[Point],
    region: &CropRegion,
    image_w: u32,
    image_h: u32,
) -> Vec<Point> {
    mask.iter()
        .map(|p| Point {
            x: p.x * image_w as f32 - region.x as f32,
            y: p.y * image_h as f32 - region.y as f32,
        })
        .collect()
}

/// Pixel offset of a crop's top-left corner in the full image. Always
/// taken from the [`CropRegion`] the crop was cut from, so the offset
/// matches the rounded pixel the crop starts at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropOrigin {
    pub x: f64,
    pub y: f64,
}

impl CropOrigin {
    pub fn from_region(region: &CropRegion) -> Self {
        Self {
            x: region.x as f64,
            y: region.y as f64,
        }
    }

    /// Move a crop-local detection into full-image space. Consumes the
    /// crop-local value so the offset is applied exactly once.
    pub fn to_image_space(&self, detection: CropDetection) -> ImageDetection {
        let bbox = detection
            .bbox
            .translated(self.x as f32, self.y as f32);
        let (center_x, center_y) = bbox.center();
        let is_empty = detection.label.to_ascii_lowercase().contains("empty");
        ImageDetection {
            center_x,
            center_y,
            width: bbox.width(),
            height: bbox.height(),
            bbox,
            confidence: detection.confidence,
            label: detection.label,
            is_empty,
            is_alive: !is_empty,
        }
    }

    pub fn to_image_points(&self, points: &[Point]) -> Vec<Point> {
        points
            .iter()
            .map(|p| Point {
                x: (p.x as f64 + self.x) as f32,
                y: (p.y as f64 + self.y) as f32,
            })
            .collect()
    }
}
