use crate::error::{PipelineError, Result};
use crate::models::{
    DetectionModel, Device, LoadedModel, ModelKind, ModelLoader, SegmentationModel,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

const SLOTS: usize = ModelKind::ALL.len() * Device::ALL.len();

#[derive(Default)]
struct Slot {
    value: OnceLock<LoadedModel>,
    /// Serializes loads for this key only.
    load_lock: Mutex<()>,
}

fn slot_index(kind: ModelKind, device: Device) -> usize {
    let k = match kind {
        ModelKind::Segmentation => 0,
        ModelKind::Detection => 1,
    };
    let d = match device {
        Device::Cpu => 0,
        Device::Cuda => 1,
        Device::CoreMl => 2,
    };
    k * Device::ALL.len() + d
}

/// Loaded models keyed by (kind, device).
///
/// Constructed once by the binary and handed to the coordinator. The first
/// caller for a key loads the weights while holding that key's mutex;
/// every later lookup is a lock-free `OnceLock` read. Load failures are
/// not cached and not retried here.
pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    slots: [Slot; SLOTS],
    loads: AtomicUsize,
}

impl ModelCache {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            slots: std::array::from_fn(|_| Slot::default()),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, kind: ModelKind, device: Device) -> Result<LoadedModel> {
        let slot = &self.slots[slot_index(kind, device)];
        if let Some(model) = slot.value.get() {
            return Ok(model.clone());
        }

        let _guard = slot
            .load_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Another caller may have finished loading while we waited.
        if let Some(model) = slot.value.get() {
            return Ok(model.clone());
        }

        tracing::info!("Loading {:?} model on {:?}", kind, device);
        let started = std::time::Instant::now();
        let model = self.loader.load(kind, device).map_err(|e| match e {
            PipelineError::ModelLoad(_) => e,
            other => PipelineError::model_load(other.to_string()),
        })?;
        if model.kind() != kind {
            return Err(PipelineError::model_load(format!(
                "loader returned a {:?} model for a {:?} request",
                model.kind(),
                kind
            )));
        }
        self.loads.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Loaded {:?} model on {:?} in {:.1} ms",
            kind,
            device,
            started.elapsed().as_secs_f64() * 1000.0
        );

        let _ = slot.value.set(model.clone());
        Ok(model)
    }

    pub fn segmentation(&self, device: Device) -> Result<Arc<dyn SegmentationModel>> {
        match self.get(ModelKind::Segmentation, device)? {
            LoadedModel::Segmentation(model) => Ok(model),
            LoadedModel::Detection(_) => Err(PipelineError::model_load(
                "cache slot holds a detection model",
            )),
        }
    }

    pub fn detection(&self, device: Device) -> Result<Arc<dyn DetectionModel>> {
        match self.get(ModelKind::Detection, device)? {
            LoadedModel::Detection(model) => Ok(model),
            LoadedModel::Segmentation(_) => Err(PipelineError::model_load(
                "cache slot holds a segmentation model",
            )),
        }
    }

    /// Load every model kind for `device` up front.
    pub fn warm_up(&self, device: Device) -> Result<()> {
        for kind in ModelKind::ALL {
            self.get(kind, device)?;
        }
        Ok(())
    }

    pub fn is_loaded(&self, kind: ModelKind, device: Device) -> bool {
        self.slots[slot_index(kind, device)].value.get().is_some()
    }

    /// Number of successful loads performed so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    /// Drop every cached handle. Requires exclusive access, so no worker
    /// can be mid-lookup.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.value.take();
        }
        tracing::info!("Model cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RawDetection, SegmentCandidate};
    use image::RgbImage;
    use std::time::Duration;

    struct NoopDetector;

    impl DetectionModel for NoopDetector {
        fn detect(&self, _image: &RgbImage) -> Result<Vec<RawDetection>> {
            Ok(vec![])
        }
        fn name(&self) -> &str {
            "noop"
        }
    }

    struct NoopSegmenter;

    impl SegmentationModel for NoopSegmenter {
        fn segment(&self, _image: &RgbImage) -> Result<Vec<SegmentCandidate>> {
            Ok(vec![])
        }
        fn version(&self) -> &str {
            "noop-1"
        }
    }

    struct SlowLoader {
        calls: AtomicUsize,
    }

    impl ModelLoader for SlowLoader {
        fn load(&self, kind: ModelKind, _device: Device) -> Result<LoadedModel> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            Ok(match kind {
                ModelKind::Segmentation => LoadedModel::Segmentation(Arc::new(NoopSegmenter)),
                ModelKind::Detection => LoadedModel::Detection(Arc::new(NoopDetector)),
            })
        }
    }

    struct BrokenLoader {
        calls: AtomicUsize,
    }

    impl ModelLoader for BrokenLoader {
        fn load(&self, _kind: ModelKind, _device: Device) -> Result<LoadedModel> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PipelineError::model_load("weights missing"))
        }
    }

    #[test]
    fn test_concurrent_get_loads_once() {
        let loader = Arc::new(SlowLoader {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(ModelCache::new(loader.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.detection(Device::Cpu).map(|_| ()))
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }

        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.load_count(), 1);
        assert!(cache.is_loaded(ModelKind::Detection, Device::Cpu));
        assert!(!cache.is_loaded(ModelKind::Detection, Device::Cuda));
        assert!(!cache.is_loaded(ModelKind::Segmentation, Device::Cpu));
    }

    #[test]
    fn test_keys_are_independent() {
        let loader = Arc::new(SlowLoader {
            calls: AtomicUsize::new(0),
        });
        let mut cache = ModelCache::new(loader.clone());
        cache.warm_up(Device::Cpu).unwrap();
        cache.detection(Device::Cuda).unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 3);

        cache.clear();
        assert!(!cache.is_loaded(ModelKind::Segmentation, Device::Cpu));
        cache.segmentation(Device::Cpu).unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_load_failure_is_fatal_and_not_cached() {
        let loader = Arc::new(BrokenLoader {
            calls: AtomicUsize::new(0),
        });
        let cache = ModelCache::new(loader.clone());
        let err = cache.segmentation(Device::Cpu).err().unwrap();
        assert!(matches!(err, PipelineError::ModelLoad(_)));
        assert!(!err.is_transient());
        assert!(!cache.is_loaded(ModelKind::Segmentation, Device::Cpu));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }
}
