//! Inference model contracts and the process-wide model cache.
//!
//! Models are black boxes: segmentation proposes containers in normalized
//! coordinates, detection returns pixel boxes for whatever image it is given.

pub mod cache;
#[cfg(feature = "rtdetr")]
pub mod rtdetr;

use crate::error::{PipelineError, Result};
use crate::pipeline::types::{NormBox, PixelBox, Point};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub use cache::ModelCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Segmentation,
    Detection,
}

impl ModelKind {
    pub const ALL: [ModelKind; 2] = [ModelKind::Segmentation, ModelKind::Detection];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
    CoreMl,
}

impl Device {
    pub const ALL: [Device; 3] = [Device::Cpu, Device::Cuda, Device::CoreMl];
}

/// Raw instance-segmentation output for one object.
#[derive(Debug, Clone)]
pub struct SegmentCandidate {
    pub bbox: NormBox,
    pub mask: Vec<Point>,
    pub confidence: f32,
    pub label: String,
}

/// Raw detector output, in the pixel space of the image passed in.
#[derive(Debug, Clone)]
pub struct RawDetection {
    pub bbox: PixelBox,
    pub confidence: f32,
    pub label: String,
}

pub trait SegmentationModel: Send + Sync {
    fn segment(&self, image: &RgbImage) -> Result<Vec<SegmentCandidate>>;

    /// Version tag persisted with each container.
    fn version(&self) -> &str;
}

pub trait DetectionModel: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<RawDetection>>;

    /// Run on several images; defaults to one call per image.
    fn detect_batch(&self, images: &[RgbImage]) -> Result<Vec<Vec<RawDetection>>> {
        images.iter().map(|img| self.detect(img)).collect()
    }

    fn name(&self) -> &str;
}

/// A loaded model handle as stored in the cache.
#[derive(Clone)]
pub enum LoadedModel {
    Segmentation(Arc<dyn SegmentationModel>),
    Detection(Arc<dyn DetectionModel>),
}

impl LoadedModel {
    pub fn kind(&self) -> ModelKind {
        match self {
            LoadedModel::Segmentation(_) => ModelKind::Segmentation,
            LoadedModel::Detection(_) => ModelKind::Detection,
        }
    }
}

/// Reads weights from disk or a registry. Called at most once per key.
pub trait ModelLoader: Send + Sync {
    fn load(&self, kind: ModelKind, device: Device) -> Result<LoadedModel>;
}

/// Weight locations per model kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelPaths {
    pub segmentation: Option<PathBuf>,
    pub detection: Option<PathBuf>,
}

/// Loader used when the binary is built without an inference backend.
pub struct UnavailableLoader {
    pub paths: ModelPaths,
}

impl ModelLoader for UnavailableLoader {
    fn load(&self, kind: ModelKind, device: Device) -> Result<LoadedModel> {
        let path = match kind {
            ModelKind::Segmentation => &self.paths.segmentation,
            ModelKind::Detection => &self.paths.detection,
        };
        Err(PipelineError::model_load(format!(
            "no inference backend compiled in for {kind:?} on {device:?} (weights: {})",
            path.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "unset".to_string())
        )))
    }
}

/// Pick the loader matching the compiled feature set.
pub fn default_loader(paths: ModelPaths) -> Arc<dyn ModelLoader> {
    #[cfg(feature = "rtdetr")]
    {
        Arc::new(rtdetr::RtdetrLoader { paths })
    }
    #[cfg(not(feature = "rtdetr"))]
    {
        Arc::new(UnavailableLoader { paths })
    }
}
