use crate::error::PipelineError;
use crate::persistence::SessionView;
use crate::pipeline::orchestrator::{Coordinator, DispatchReceipt, TaskRequest};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

/// Pipeline error rendered as a JSON body. Clients only ever see the
/// public message.
#[derive(Debug)]
pub struct ApiError(pub PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::ResourceNotFound(_) => StatusCode::NOT_FOUND,
            err if err.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::ModelLoad(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        let body = json!({
            "error": self.0.kind(),
            "message": self.0.public_message(),
        });
        (status, Json(body)).into_response()
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn create_task(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<TaskRequest>,
) -> Result<(StatusCode, Json<DispatchReceipt>), ApiError> {
    let receipt = coordinator.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

pub async fn get_session(
    State(coordinator): State<Arc<Coordinator>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    Ok(Json(coordinator.status(&session_id).await?))
}

pub async fn get_progress(
    State(coordinator): State<Arc<Coordinator>>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    coordinator
        .progress(&session_id)
        .map(Json)
        .ok_or_else(|| ApiError(PipelineError::not_found(format!("no running session {session_id}"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::directory::StaticDirectory;
    use crate::models::cache::ModelCache;
    use crate::persistence::{Database, SessionStatus};
    use crate::pipeline::orchestrator::{ImageRef, Services};
    use crate::pipeline::testkit::{
        encode_lossless, ColorBlobDetector, FixedSegmenter, StubLoader, LEAF, SOIL,
    };
    use crate::pipeline::types::PixelBox;
    use crate::storage::{MemoryObjectStore, ObjectStore};
    use image::RgbImage;
    use imageproc::drawing::draw_filled_circle_mut;
    use std::time::Duration;

    fn coordinator() -> Arc<Coordinator> {
        let mut image = RgbImage::from_pixel(400, 300, SOIL);
        draw_filled_circle_mut(&mut image, (200, 150), 20, LEAF);
        let store = Arc::new(MemoryObjectStore::new());
        store.put("uploads/a.bmp", &encode_lossless(&image)).unwrap();

        let segmenter = FixedSegmenter::from_boxes(&[PixelBox::new(10.0, 10.0, 390.0, 290.0)], 400, 300);
        let loader = StubLoader::new(
            Some(Arc::new(segmenter)),
            Some(Arc::new(ColorBlobDetector::new(LEAF))),
        );
        let directory = Arc::new(StaticDirectory::default());
        let services = Services {
            models: Arc::new(ModelCache::new(Arc::new(loader))),
            store,
            locations: directory.clone(),
            classifications: directory,
            db: Database::open_in_memory().unwrap(),
        };
        let mut config = PipelineConfig::default();
        config.coordinator.cpu_workers = 1;
        Arc::new(Coordinator::new(config, services).unwrap())
    }

    fn task(session_id: &str, images: usize) -> TaskRequest {
        TaskRequest {
            session_id: session_id.to_string(),
            images: (0..images)
                .map(|i| ImageRef {
                    image_id: format!("img-{i}"),
                    image_path: "uploads/a.bmp".to_string(),
                    location_id: None,
                    gps: None,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_create_task_and_poll_session() {
        let coordinator = coordinator();
        let (status, Json(receipt)) = create_task(State(coordinator.clone()), Json(task("api-1", 1)))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(receipt.session_id, "api-1");

        let mut view = None;
        for _ in 0..500 {
            let Json(current) = get_session(State(coordinator.clone()), Path("api-1".to_string()))
                .await
                .unwrap();
            if current.status.is_terminal() {
                view = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let view = view.expect("session did not finish");
        // No location is configured, so the session finishes with a warning.
        assert_eq!(view.status, SessionStatus::Warning);
        assert_eq!(view.total_detected, 1);

        let body = serde_json::to_value(&view).unwrap();
        assert_eq!(body["sessionId"], "api-1");
        assert_eq!(body["totalDetected"], 1);
    }

    #[tokio::test]
    async fn test_error_status_codes() {
        let coordinator = coordinator();

        let err = create_task(State(coordinator.clone()), Json(task("api-2", 2)))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let err = get_session(State(coordinator.clone()), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let err = get_progress(State(coordinator), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let err = ApiError(PipelineError::storage("bucket down"));
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
        let err = ApiError(PipelineError::persistence("constraint"));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
