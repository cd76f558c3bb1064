mod cli;

use anyhow::{Context, Result};
use cli::Args;
use greenhouse_census::config::PipelineConfig;
use greenhouse_census::directory::StaticDirectory;
use greenhouse_census::models::cache::ModelCache;
use greenhouse_census::models::default_loader;
use greenhouse_census::persistence::Database;
use greenhouse_census::pipeline::orchestrator::{Coordinator, Services};
use greenhouse_census::storage::{GuardedStore, LocalObjectStore, ObjectStore};
use greenhouse_census::web::server::run_server;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();

    let config = PipelineConfig::load(args.config.as_deref())?;
    let directory = Arc::new(match &args.locations {
        Some(path) => StaticDirectory::load(path)?,
        None => {
            warn!("No location directory configured; results will not be attached to containers");
            StaticDirectory::default()
        }
    });
    info!("Loaded {} locations", directory.len());

    let db = Database::new(args.database.clone())?;
    let local: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(args.storage_root.clone()));
    let store: Arc<dyn ObjectStore> = Arc::new(GuardedStore::new(local, config.breaker.clone()));
    let models = Arc::new(ModelCache::new(default_loader(config.models.clone())));

    let services = Services {
        models,
        store,
        locations: directory.clone(),
        classifications: directory,
        db,
    };
    let coordinator = Arc::new(Coordinator::new(config, services)?);

    if args.warm_up {
        coordinator
            .warm_up()
            .await
            .context("Failed to load inference models")?;
        info!("Inference models loaded");
    }

    run_server(args.host, args.port, coordinator).await?;

    Ok(())
}
