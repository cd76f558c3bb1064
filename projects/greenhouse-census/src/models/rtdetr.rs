//! RT-DETR detection backend built on usls.

use crate::error::{PipelineError, Result};
use crate::models::{
    DetectionModel, Device, LoadedModel, ModelKind, ModelLoader, ModelPaths, RawDetection,
};
use crate::pipeline::types::PixelBox;
use image::{DynamicImage, RgbImage};
use std::sync::{Arc, Mutex};
use usls::models::RTDETR;
use usls::{Config, Image};

/// Wraps the usls RT-DETR model and corrects for the aspect-ratio padding
/// bug in the underlying model library.
pub struct RtdetrDetector {
    model: Mutex<RTDETR>,
}

impl RtdetrDetector {
    pub fn new(model_path: &str, device: Device) -> Result<Self> {
        let config = Config::default().with_model_file(model_path);
        let config = match device {
            Device::CoreMl => config.with_model_device(usls::Device::CoreMl),
            Device::Cuda => config.with_model_device(usls::Device::Cuda(0)),
            Device::Cpu => config,
        };
        let config = config
            .commit()
            .map_err(|e| PipelineError::model_load(format!("invalid RT-DETR config: {e}")))?;
        let model = RTDETR::new(config)
            .map_err(|e| PipelineError::model_load(format!("failed to load RT-DETR: {e}")))?;
        Ok(Self {
            model: Mutex::new(model),
        })
    }
}

impl DetectionModel for RtdetrDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<RawDetection>> {
        let results = self.detect_batch(std::slice::from_ref(image))?;
        Ok(results.into_iter().next().unwrap_or_default())
    }

    fn detect_batch(&self, images: &[RgbImage]) -> Result<Vec<Vec<RawDetection>>> {
        let mut usls_images = Vec::with_capacity(images.len());
        let mut corrections = Vec::with_capacity(images.len());

        for image in images {
            let img_w = image.width() as f32;
            let img_h = image.height() as f32;
            let (x_corr, y_corr) = if img_w > img_h {
                (img_w / img_h, 1.0)
            } else if img_h > img_w {
                (1.0, img_h / img_w)
            } else {
                (1.0, 1.0)
            };
            corrections.push((x_corr, y_corr));
            usls_images.push(Image::from(DynamicImage::ImageRgb8(image.clone())));
        }

        let mut model = self
            .model
            .lock()
            .map_err(|_| PipelineError::inference("RT-DETR model mutex poisoned"))?;
        let results = model
            .forward(&usls_images)
            .map_err(|e| PipelineError::inference(format!("RT-DETR forward failed: {e}")))?;

        Ok(results
            .into_iter()
            .zip(corrections)
            .map(|(y, (x_correction, y_correction))| {
                y.hbbs
                    .into_iter()
                    .map(|hbb| {
                        let x = hbb.xmin() * x_correction;
                        let w = hbb.width() * x_correction;
                        let y = hbb.ymin() * y_correction;
                        let h = hbb.height() * y_correction;
                        RawDetection {
                            bbox: PixelBox::new(x, y, x + w, y + h),
                            confidence: hbb.confidence().unwrap_or(0.0),
                            label: hbb.name().unwrap_or("plant").to_string(),
                        }
                    })
                    .collect()
            })
            .collect())
    }

    fn name(&self) -> &str {
        "RT-DETR"
    }
}

/// Loads detection weights through usls. Segmentation needs another backend.
pub struct RtdetrLoader {
    pub paths: ModelPaths,
}

impl ModelLoader for RtdetrLoader {
    fn load(&self, kind: ModelKind, device: Device) -> Result<LoadedModel> {
        match kind {
            ModelKind::Detection => {
                let path = self
                    .paths
                    .detection
                    .as_ref()
                    .ok_or_else(|| PipelineError::model_load("detection weights path not set"))?;
                let path = path
                    .to_str()
                    .ok_or_else(|| PipelineError::model_load("detection weights path is not UTF-8"))?;
                Ok(LoadedModel::Detection(Arc::new(RtdetrDetector::new(
                    path, device,
                )?)))
            }
            ModelKind::Segmentation => Err(PipelineError::model_load(
                "RT-DETR backend does not provide instance segmentation",
            )),
        }
    }
}
