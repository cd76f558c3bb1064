use crate::pipeline::orchestrator::Coordinator;
use crate::web::api::{create_task, get_progress, get_session, health};
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tasks", post(create_task))
        .route("/api/sessions/:session_id", get(get_session))
        .route("/api/sessions/:session_id/progress", get(get_progress))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

pub async fn run_server(host: IpAddr, port: u16, coordinator: Arc<Coordinator>) -> Result<()> {
    let mut current_port = port;
    let listener = loop {
        let addr = SocketAddr::new(host, current_port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                // Tokio requires a non-blocking socket.
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", addr);
                break listener;
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", addr, e);
                current_port = current_port.wrapping_add(1);
                if current_port == 0 {
                    return Err(anyhow::anyhow!("No available ports found"));
                }
            }
        }
    };

    let app = router(coordinator);

    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "Greenhouse census server started on http://{:?}",
        tokio_listener.local_addr()?
    );

    axum::serve(tokio_listener, app).await?;

    Ok(())
}
