//! Deterministic stand-ins for the inference models and synthetic scenes.

use crate::error::{PipelineError, Result};
use crate::models::{
    Device, DetectionModel, LoadedModel, ModelKind, ModelLoader, RawDetection, SegmentCandidate,
    SegmentationModel,
};
use crate::pipeline::types::{NormBox, PixelBox, Point};
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
use imageproc::rect::Rect;
use imageproc::region_labelling::{connected_components, Connectivity};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const LEAF: Rgb<u8> = Rgb([40, 160, 40]);
/// Looks like a plant to the vegetation mask, invisible to the detector.
pub const HIDDEN_LEAF: Rgb<u8> = Rgb([40, 161, 40]);
pub const SOIL: Rgb<u8> = Rgb([120, 90, 60]);
pub const FLOOR: Rgb<u8> = Rgb([128, 128, 128]);
/// Any crop containing this colour makes [`ColorBlobDetector`] fail.
pub const POISON: Rgb<u8> = Rgb([250, 0, 250]);

/// Detects connected blobs of one exact colour. Blobs touching the image
/// border are ignored, like a detector ignoring cut-off objects.
pub struct ColorBlobDetector {
    color: Rgb<u8>,
    confidence: f32,
    transient_failures: AtomicUsize,
    delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl ColorBlobDetector {
    pub fn new(color: Rgb<u8>) -> Self {
        Self {
            color,
            confidence: 0.9,
            transient_failures: AtomicUsize::new(0),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    /// Fail the first `n` calls with a transient error.
    pub fn failing_first(self, n: usize) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl DetectionModel for ColorBlobDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<RawDetection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PipelineError::inference_transient("simulated out of memory"));
        }
        if image.pixels().any(|p| *p == POISON) {
            return Err(PipelineError::inference("crop is not decodable by the detector"));
        }

        let (w, h) = image.dimensions();
        let mask = GrayImage::from_fn(w, h, |x, y| {
            Luma([if *image.get_pixel(x, y) == self.color { 255 } else { 0 }])
        });
        let labels = connected_components(&mask, Connectivity::Eight, Luma([0]));

        let mut extents: HashMap<u32, (u32, u32, u32, u32)> = HashMap::new();
        for (x, y, label) in labels.enumerate_pixels() {
            let id = label.0[0];
            if id == 0 {
                continue;
            }
            let e = extents.entry(id).or_insert((x, y, x, y));
            e.0 = e.0.min(x);
            e.1 = e.1.min(y);
            e.2 = e.2.max(x);
            e.3 = e.3.max(y);
        }

        let mut ids: Vec<_> = extents.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids
            .into_iter()
            .filter_map(|id| {
                let (x1, y1, x2, y2) = extents[&id];
                if x1 == 0 || y1 == 0 || x2 + 1 >= w || y2 + 1 >= h {
                    return None;
                }
                Some(RawDetection {
                    bbox: PixelBox::new(x1 as f32, y1 as f32, (x2 + 1) as f32, (y2 + 1) as f32),
                    confidence: self.confidence,
                    label: "plant".to_string(),
                })
            })
            .collect())
    }

    fn name(&self) -> &str {
        "color-blob"
    }
}

/// Returns the same candidates for every image.
pub struct FixedSegmenter {
    pub candidates: Vec<SegmentCandidate>,
    pub fail: bool,
}

impl FixedSegmenter {
    /// Rectangular containers given in full-image pixels.
    pub fn from_boxes(boxes: &[PixelBox], image_w: u32, image_h: u32) -> Self {
        let (w, h) = (image_w as f32, image_h as f32);
        let candidates = boxes
            .iter()
            .map(|b| {
                let bbox = NormBox::new(b.x1 / w, b.y1 / h, b.x2 / w, b.y2 / h);
                SegmentCandidate {
                    bbox,
                    mask: vec![
                        Point { x: bbox.x1, y: bbox.y1 },
                        Point { x: bbox.x2, y: bbox.y1 },
                        Point { x: bbox.x2, y: bbox.y2 },
                        Point { x: bbox.x1, y: bbox.y2 },
                    ],
                    confidence: 0.95,
                    label: "segment".to_string(),
                }
            })
            .collect();
        Self {
            candidates,
            fail: false,
        }
    }
}

impl SegmentationModel for FixedSegmenter {
    fn segment(&self, _image: &RgbImage) -> Result<Vec<SegmentCandidate>> {
        if self.fail {
            return Err(PipelineError::inference("segmentation output malformed"));
        }
        Ok(self.candidates.clone())
    }

    fn version(&self) -> &str {
        "fixed-seg-1"
    }
}

/// Hands out prepared models and counts loads.
pub struct StubLoader {
    pub segmenter: Option<Arc<dyn SegmentationModel>>,
    pub detector: Option<Arc<dyn DetectionModel>>,
    pub loads: AtomicUsize,
    pub load_delay: Option<Duration>,
}

impl StubLoader {
    pub fn new(
        segmenter: Option<Arc<dyn SegmentationModel>>,
        detector: Option<Arc<dyn DetectionModel>>,
    ) -> Self {
        Self {
            segmenter,
            detector,
            loads: AtomicUsize::new(0),
            load_delay: None,
        }
    }
}

impl ModelLoader for StubLoader {
    fn load(&self, kind: ModelKind, _device: Device) -> Result<LoadedModel> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.load_delay {
            std::thread::sleep(delay);
        }
        match kind {
            ModelKind::Segmentation => self
                .segmenter
                .clone()
                .map(LoadedModel::Segmentation)
                .ok_or_else(|| PipelineError::model_load("segmentation weights missing")),
            ModelKind::Detection => self
                .detector
                .clone()
                .map(LoadedModel::Detection)
                .ok_or_else(|| PipelineError::model_load("detection weights missing")),
        }
    }
}

pub struct Scene {
    pub image: RgbImage,
    pub containers: Vec<PixelBox>,
    pub detectable: usize,
    pub hidden: usize,
    pub plant_radius: i32,
}

/// 4000x3000 greenhouse photo: two 2000x1500 containers with 50 plants each
/// on a jittered grid, of which `hidden` are drawn in [`HIDDEN_LEAF`].
pub fn greenhouse_scene(seed: u64, hidden: usize) -> Scene {
    const W: u32 = 4000;
    const H: u32 = 3000;
    const RADIUS: i32 = 40;
    let containers = vec![
        PixelBox::new(0.0, 750.0, 2000.0, 2250.0),
        PixelBox::new(2000.0, 750.0, 4000.0, 2250.0),
    ];

    let mut rng = StdRng::seed_from_u64(seed);
    let mut image = RgbImage::from_pixel(W, H, FLOOR);
    let mut centers = Vec::new();
    for c in &containers {
        draw_filled_rect_mut(
            &mut image,
            Rect::at(c.x1 as i32, c.y1 as i32).of_size(c.width() as u32, c.height() as u32),
            SOIL,
        );
        for row in 0..5 {
            for col in 0..10 {
                let cx = c.x1 as i32 + col * 200 + 100 + rng.gen_range(-40..=40);
                let cy = c.y1 as i32 + row * 300 + 150 + rng.gen_range(-40..=40);
                centers.push((cx, cy));
            }
        }
    }

    let hidden_set: Vec<usize> =
        rand::seq::index::sample(&mut rng, centers.len(), hidden).into_vec();
    for (i, &center) in centers.iter().enumerate() {
        let color = if hidden_set.contains(&i) { HIDDEN_LEAF } else { LEAF };
        draw_filled_circle_mut(&mut image, center, RADIUS, color);
    }

    Scene {
        image,
        containers,
        detectable: centers.len() - hidden,
        hidden,
        plant_radius: RADIUS,
    }
}

/// Uncompressed encoding so exact colours survive the round trip.
pub fn encode_lossless(image: &RgbImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Bmp)
        .expect("bmp encoding");
    bytes
}
