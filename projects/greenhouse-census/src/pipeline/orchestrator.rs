// Session coordinator: drives one photo through the pipeline.
//
// A session moves pending -> processing -> {completed, warning, failed}.
// The photo is downloaded and decoded, its location resolved, containers
// segmented, and one unit per container fanned out to the CPU pool. The
// fan-in barrier hands every outcome to a single aggregation step whose
// record graph goes to the persistence writer in one transaction.

use crate::config::PipelineConfig;
use crate::directory::{
    Classification, ClassificationLookup, GpsPoint, LocationContext, LocationResolver,
};
use crate::error::{Failure, FatalFailure, IsolatedFailure, PipelineError, Result};
use crate::models::cache::ModelCache;
use crate::models::{DetectionModel, SegmentationModel};
use crate::persistence::{
    persistence_error, Database, NewSession, PersistenceWriter, SessionStatus, SessionView,
};
use crate::pipeline::aggregate::{
    aggregate, disposition, learned_density, warning_detail, Aggregation,
};
use crate::pipeline::artifact::{
    encode_jpeg, image_key, render_annotated, summary_json, summary_key,
};
use crate::pipeline::crop::ContainerProcessor;
use crate::pipeline::detection::TiledDetectionStage;
use crate::pipeline::estimation::{BandEstimator, DensityParameters};
use crate::pipeline::fanin::{FanInRegistry, UnitOutcome};
use crate::pipeline::segmentation::SegmentationStage;
use crate::pipeline::types::{ContainerCandidate, ProcessingState};
use crate::pipeline::workers::{Backoff, WorkerPool};
use crate::storage::{validate_key, ObjectStore};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Collaborators the coordinator talks to, injected at construction.
#[derive(Clone)]
pub struct Services {
    pub models: Arc<ModelCache>,
    pub store: Arc<dyn ObjectStore>,
    pub locations: Arc<dyn LocationResolver>,
    pub classifications: Arc<dyn ClassificationLookup>,
    pub db: Database,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    pub image_id: String,
    /// Object-store key of the original upload.
    pub image_path: String,
    #[serde(default)]
    pub location_id: Option<i64>,
    #[serde(default)]
    pub gps: Option<GpsPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub session_id: String,
    pub images: Vec<ImageRef>,
}

impl TaskRequest {
    /// The single image of the request, checked before anything is stored.
    pub fn image(&self) -> Result<&ImageRef> {
        if self.session_id.trim().is_empty() {
            return Err(PipelineError::validation("session id is empty"));
        }
        let [image] = self.images.as_slice() else {
            return Err(PipelineError::validation(format!(
                "expected exactly one image per session, got {}",
                self.images.len()
            )));
        };
        validate_key(&image.image_path)?;
        if let Some(gps) = &image.gps {
            gps.validate()?;
        }
        Ok(image)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReceipt {
    pub session_id: String,
    pub task_id: String,
    pub status: SessionStatus,
}

struct Dispatched {
    receipt: DispatchReceipt,
    image: ImageRef,
    state: Arc<ProcessingState>,
}

/// Work for one container, run on a pool thread.
struct ContainerUnit {
    session_id: String,
    image: Arc<RgbImage>,
    candidate: ContainerCandidate,
    processor: Arc<ContainerProcessor>,
    density: Option<DensityParameters>,
    state: Arc<ProcessingState>,
    backoff: Backoff,
}

impl ContainerUnit {
    fn run(&self) -> UnitOutcome {
        let index = self.candidate.index;
        let (result, attempts) = self.backoff.retry_blocking(|_| {
            catch_unwind(AssertUnwindSafe(|| {
                self.processor.process(
                    &self.image,
                    &self.candidate,
                    self.density.as_ref(),
                    Some(&self.state),
                )
            }))
            .unwrap_or_else(|_| {
                Err(PipelineError::inference(format!(
                    "container {index} unit panicked"
                )))
            })
        });

        match result {
            Ok(mut report) => {
                report.attempts = attempts;
                UnitOutcome::Done(report)
            }
            Err(err) => {
                warn!(
                    "Session {}: container {} skipped after {} attempt(s): {}",
                    self.session_id, index, attempts, err
                );
                UnitOutcome::Failed(IsolatedFailure::container(index, &err, attempts))
            }
        }
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

fn decode(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| {
            warn!("Upload could not be decoded: {}", e);
            PipelineError::validation("image cannot be decoded")
        })?
        .to_rgb8();
    if image.width() == 0 || image.height() == 0 {
        return Err(PipelineError::validation("image has no pixels"));
    }
    Ok(image)
}

async fn blocking_io<T, F>(op: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| PipelineError::storage(format!("storage task failed: {e}")))?
}

pub struct Coordinator {
    config: PipelineConfig,
    services: Services,
    writer: PersistenceWriter,
    pool: WorkerPool,
    fanin: Arc<FanInRegistry>,
    progress: RwLock<HashMap<String, Arc<ProcessingState>>>,
}

impl Coordinator {
    pub fn new(config: PipelineConfig, services: Services) -> Result<Self> {
        let pool = WorkerPool::new("census-cpu", config.coordinator.cpu_workers)?;
        let writer = PersistenceWriter::new(services.db.clone(), config.persistence.clone());
        Ok(Self {
            config,
            services,
            writer,
            pool,
            fanin: Arc::new(FanInRegistry::new()),
            progress: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Load both models for the configured device ahead of the first session.
    pub async fn warm_up(&self) -> Result<()> {
        let models = Arc::clone(&self.services.models);
        let device = self.config.coordinator.device;
        tokio::task::spawn_blocking(move || models.warm_up(device))
            .await
            .map_err(|e| PipelineError::model_load(format!("warm-up task failed: {e}")))?
    }

    /// Validate and register a request, then process it in the background.
    pub async fn submit(self: &Arc<Self>, request: TaskRequest) -> Result<DispatchReceipt> {
        let dispatched = self.dispatch(&request).await?;
        let receipt = dispatched.receipt.clone();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.execute(dispatched).await;
        });
        Ok(receipt)
    }

    /// Like [`Coordinator::submit`], but returns only once the session has
    /// reached a terminal state.
    pub async fn run_to_completion(&self, request: TaskRequest) -> Result<SessionStatus> {
        let dispatched = self.dispatch(&request).await?;
        Ok(self.execute(dispatched).await)
    }

    pub async fn status(&self, session_id: &str) -> Result<SessionView> {
        self.services
            .db
            .session(session_id)
            .await
            .map_err(persistence_error)?
            .ok_or_else(|| PipelineError::not_found(format!("session {session_id}")))
    }

    /// Live stage progress; `None` once the session has finished.
    pub fn progress(&self, session_id: &str) -> Option<serde_json::Value> {
        let progress = self.progress.read().unwrap_or_else(|p| p.into_inner());
        progress.get(session_id).map(|state| state.to_progress_json())
    }

    async fn dispatch(&self, request: &TaskRequest) -> Result<Dispatched> {
        let image = request.image()?.clone();
        let session_id = request.session_id.clone();
        let db = &self.services.db;

        db.create_session(NewSession {
            id: session_id.clone(),
            image_id: image.image_id.clone(),
            image_path: image.image_path.clone(),
            location_id: image.location_id,
        })
        .await
        .map_err(persistence_error)?;

        let current = self.status(&session_id).await?;
        if current.status != SessionStatus::Pending {
            return Err(PipelineError::validation(format!(
                "session {} is already {}",
                session_id,
                current.status.as_str()
            )));
        }

        let task_id = Uuid::new_v4().to_string();
        db.mark_processing(&session_id, &task_id)
            .await
            .map_err(persistence_error)?;

        let state = Arc::new(ProcessingState::new(session_id.clone()));
        self.progress
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(session_id.clone(), Arc::clone(&state));
        info!("Session {} dispatched as task {}", session_id, task_id);

        Ok(Dispatched {
            receipt: DispatchReceipt {
                session_id,
                task_id,
                status: SessionStatus::Processing,
            },
            image,
            state,
        })
    }

    async fn execute(&self, dispatched: Dispatched) -> SessionStatus {
        let Dispatched {
            receipt,
            image,
            state,
        } = dispatched;
        let session_id = receipt.session_id.as_str();
        let started = Instant::now();

        let status = match self.process(session_id, &image, &state).await {
            Ok(status) => status,
            Err(fatal) => {
                error!("Session {} failed: {}", session_id, fatal);
                let message = fatal.error.public_message();
                if let Err(err) = self.services.db.mark_failed(session_id, &message).await {
                    error!("Session {} could not be marked failed: {:#}", session_id, err);
                }
                SessionStatus::Failed
            }
        };

        self.progress
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(session_id);
        info!(
            "Session {} finished as {} in {:.2}s",
            session_id,
            status.as_str(),
            started.elapsed().as_secs_f64()
        );
        status
    }

    async fn process(
        &self,
        session_id: &str,
        image_ref: &ImageRef,
        state: &Arc<ProcessingState>,
    ) -> std::result::Result<SessionStatus, FatalFailure> {
        let cfg = &self.config;
        let backoff = Backoff::new(cfg.coordinator.backoff_base_ms, cfg.coordinator.max_attempts);

        let bytes = self
            .fetch(&image_ref.image_path, &backoff)
            .await
            .map_err(|e| FatalFailure::new("download", e))?;
        let image = self
            .pool
            .run(move || decode(&bytes))
            .await
            .map_err(|e| FatalFailure::new("decode", e))?;
        let image = Arc::new(image);
        info!(
            "Session {}: decoded {}x{} photo",
            session_id,
            image.width(),
            image.height()
        );

        let mut context_failures = Vec::new();
        let location = self.resolve_location(session_id, image_ref, &mut context_failures);
        let classification = match &location {
            Some(loc) => match self.services.classifications.expected_classification(loc.id) {
                Some(classification) => classification,
                None => {
                    warn!(
                        "Session {}: no expected classification for location {}",
                        session_id, loc.code
                    );
                    context_failures.push(IsolatedFailure::context(
                        "classification_defaulted",
                        "no expected classification for the location; default product used",
                    ));
                    Classification::default()
                }
            },
            None => Classification::default(),
        };
        let density = self.density_for(location.as_ref()).await;

        let (segmenter, detector) = self
            .load_models()
            .await
            .map_err(|e| FatalFailure::new("model_load", e))?;

        let start = Instant::now();
        let stage = SegmentationStage::new(segmenter, cfg.segmentation.clone());
        let photo = Arc::clone(&image);
        let candidates = self
            .pool
            .run(move || stage.run(&photo))
            .await
            .map_err(|e| FatalFailure::new("segmentation", e))?;
        state.advance_stage("segmentation", elapsed_ms(start));
        info!("Session {}: {} containers segmented", session_id, candidates.len());

        let estimator =
            BandEstimator::new(cfg.estimation.clone()).map_err(|e| FatalFailure::new("estimation", e))?;
        let processor = Arc::new(ContainerProcessor::new(
            TiledDetectionStage::new(detector, cfg.slicing.clone(), cfg.estimation.vegetation.clone()),
            estimator,
        ));
        let outcomes = self
            .fan_out(session_id, &image, &candidates, processor, density.clone(), state, backoff)
            .await
            .map_err(|e| FatalFailure::new("fan_in", e))?;

        let start = Instant::now();
        let mut aggregation = aggregate(
            session_id,
            location.as_ref(),
            &classification,
            &candidates,
            outcomes,
            context_failures,
        )
        .map_err(|e| FatalFailure::new("aggregation", e))?;
        state.advance_stage("aggregation", elapsed_ms(start));

        match self
            .publish_artifacts(session_id, &image, &candidates, &aggregation, &backoff)
            .await
        {
            Ok(key) => aggregation.totals.processed_image_path = Some(key),
            Err(err) => {
                warn!("Session {}: result artifact not stored: {}", session_id, err);
                aggregation.failures.push(IsolatedFailure::context(
                    err.kind(),
                    "result artifact could not be stored",
                ));
                aggregation.totals.warning_detail = warning_detail(&aggregation.failures);
            }
        }

        let failures: Vec<Failure> = aggregation
            .failures
            .iter()
            .cloned()
            .map(Failure::Isolated)
            .collect();
        let status = disposition(&failures);
        let learned = learned_density(
            &aggregation.reports,
            density.as_ref(),
            cfg.estimation.default_pixels_per_cm2,
        );

        let start = Instant::now();
        let Aggregation { totals, graph, .. } = aggregation;
        self.writer
            .persist(session_id, status, graph, totals)
            .await
            .map_err(|e| FatalFailure::new("persistence", e))?;
        state.advance_stage("persistence", elapsed_ms(start));

        if cfg.estimation.refine_calibration {
            if let (Some(location), Some(params)) = (&location, learned) {
                match self
                    .services
                    .db
                    .save_density_parameters(location.id, params.clone())
                    .await
                {
                    Ok(()) => info!(
                        "Location {}: plant area refined to {:.1}px from {} samples",
                        location.code, params.avg_plant_area_px, params.samples
                    ),
                    Err(err) => warn!(
                        "Location {}: calibration not saved: {:#}",
                        location.code, err
                    ),
                }
            }
        }

        Ok(status)
    }

    #[allow(clippy::too_many_arguments)]
    async fn fan_out(
        &self,
        session_id: &str,
        image: &Arc<RgbImage>,
        candidates: &[ContainerCandidate],
        processor: Arc<ContainerProcessor>,
        density: Option<DensityParameters>,
        state: &Arc<ProcessingState>,
        backoff: Backoff,
    ) -> Result<Vec<UnitOutcome>> {
        state.set_total("detection", candidates.len());
        state.set_total("estimation", candidates.len());
        let barrier = self.fanin.open(session_id, candidates.len())?;

        for candidate in candidates {
            let index = candidate.index;
            let unit = ContainerUnit {
                session_id: session_id.to_string(),
                image: Arc::clone(image),
                candidate: candidate.clone(),
                processor: Arc::clone(&processor),
                density: density.clone(),
                state: Arc::clone(state),
                backoff,
            };
            let fanin = Arc::clone(&self.fanin);
            let queued = self.pool.submit(move || {
                let outcome = unit.run();
                fanin.signal(&unit.session_id, index, outcome);
            });
            if let Err(err) = queued {
                self.fanin.signal(
                    session_id,
                    index,
                    UnitOutcome::Failed(IsolatedFailure::container(index, &err, 0)),
                );
            }
        }

        let timeout = Duration::from_secs_f64(self.config.coordinator.aggregation_timeout_secs);
        barrier.wait(&self.fanin, timeout).await
    }

    /// Location by explicit id, else by GPS. An unresolved location is
    /// recorded as a context failure and the session continues.
    fn resolve_location(
        &self,
        session_id: &str,
        image: &ImageRef,
        failures: &mut Vec<IsolatedFailure>,
    ) -> Option<LocationContext> {
        let resolved = match (image.location_id, &image.gps) {
            (Some(id), _) => self.services.locations.by_id(id),
            (None, Some(gps)) => self.services.locations.resolve(gps),
            (None, None) => Err(PipelineError::not_found(
                "photo carries neither a location id nor gps",
            )),
        };
        match resolved {
            Ok(location) => Some(location),
            Err(err) => {
                warn!(
                    "Session {}: location unresolved, containers will not be recorded: {}",
                    session_id, err
                );
                failures.push(IsolatedFailure::context(
                    err.kind(),
                    "location could not be resolved",
                ));
                None
            }
        }
    }

    async fn density_for(&self, location: Option<&LocationContext>) -> Option<DensityParameters> {
        let location = location?;
        match self.services.db.density_parameters(location.id).await {
            Ok(Some(params)) => Some(params),
            Ok(None) => location.density.clone(),
            Err(err) => {
                warn!(
                    "Location {}: stored calibration unreadable: {:#}",
                    location.code, err
                );
                location.density.clone()
            }
        }
    }

    async fn load_models(&self) -> Result<(Arc<dyn SegmentationModel>, Arc<dyn DetectionModel>)> {
        let models = Arc::clone(&self.services.models);
        let device = self.config.coordinator.device;
        tokio::task::spawn_blocking(move || -> Result<_> {
            Ok((models.segmentation(device)?, models.detection(device)?))
        })
        .await
        .map_err(|e| PipelineError::model_load(format!("model loader task failed: {e}")))?
    }

    async fn fetch(&self, key: &str, backoff: &Backoff) -> Result<Vec<u8>> {
        let (result, attempts) = backoff
            .retry(|_| {
                let store = Arc::clone(&self.services.store);
                let key = key.to_string();
                async move { blocking_io(move || store.get(&key)).await }
            })
            .await;
        if attempts > 1 && result.is_ok() {
            info!("Fetched {} after {} attempts", key, attempts);
        }
        result
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, backoff: &Backoff) -> Result<()> {
        let bytes = Arc::new(bytes);
        let (result, _) = backoff
            .retry(|_| {
                let store = Arc::clone(&self.services.store);
                let key = key.to_string();
                let bytes = Arc::clone(&bytes);
                async move { blocking_io(move || store.put(&key, &bytes)).await }
            })
            .await;
        result
    }

    /// Store the annotated JPEG and the JSON summary. Returns the image key.
    async fn publish_artifacts(
        &self,
        session_id: &str,
        image: &Arc<RgbImage>,
        candidates: &[ContainerCandidate],
        aggregation: &Aggregation,
        backoff: &Backoff,
    ) -> Result<String> {
        let summary = serde_json::to_vec_pretty(&summary_json(session_id, candidates, aggregation))
            .map_err(|e| PipelineError::storage(format!("summary serialization failed: {e}")))?;

        let photo = Arc::clone(image);
        let drawn = candidates.to_vec();
        let agg = aggregation.clone();
        let quality = self.config.coordinator.artifact_jpeg_quality;
        let jpeg = self
            .pool
            .run(move || encode_jpeg(&render_annotated(&photo, &drawn, &agg), quality))
            .await?;

        let key = image_key(session_id);
        self.put(&key, jpeg, backoff).await?;
        self.put(&summary_key(session_id), summary, backoff).await?;
        Ok(key)
    }
}
