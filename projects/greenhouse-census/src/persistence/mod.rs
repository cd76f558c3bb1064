//! SQLite persistence on a dedicated database thread.
//!
//! All statements run on one connection owned by the DB thread; async
//! callers hand it closures and await the reply on a oneshot channel.

pub mod graph;
mod migrations;

use crate::error::{PipelineError, Result as PipelineResult};
use crate::pipeline::estimation::DensityParameters;
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use graph::{RecordGraph, SessionTotals};
use migrations::run_migrations;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Processing,
    Completed,
    Warning,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::Warning => "warning",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Warning | SessionStatus::Failed
        )
    }
}

fn status_from_str(value: &str) -> Result<SessionStatus> {
    match value {
        "pending" => Ok(SessionStatus::Pending),
        "processing" => Ok(SessionStatus::Processing),
        "completed" => Ok(SessionStatus::Completed),
        "warning" => Ok(SessionStatus::Warning),
        "failed" => Ok(SessionStatus::Failed),
        _ => Err(anyhow!("unknown session status '{value}'")),
    }
}

/// A session row as first inserted.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: String,
    pub image_id: String,
    pub image_path: String,
    pub location_id: Option<i64>,
}

/// Session-status query result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub status: SessionStatus,
    pub task_id: Option<String>,
    pub location_id: Option<i64>,
    pub total_detected: i64,
    pub total_estimated: i64,
    pub total_empty_containers: i64,
    pub avg_confidence: Option<f64>,
    pub category_counts: BTreeMap<String, i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_detail: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_image_path: Option<String>,
}

/// Row counts of one committed session write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub containers: usize,
    pub batches: usize,
    pub movements: usize,
    pub detections: usize,
    pub estimations: usize,
}

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to DB thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join DB thread: {join_err:?}");
            }
        }
    }
}

#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    db_path: Arc<Option<PathBuf>>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }
        let path_for_thread = db_path.clone();
        let db = Self::spawn(move || Connection::open(&path_for_thread), Some(db_path))?;
        if let Some(path) = db.path() {
            info!("Database initialized at {}", path.display());
        }
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::spawn(Connection::open_in_memory, None)
    }

    fn spawn<F>(open: F, db_path: Option<PathBuf>) -> Result<Self>
    where
        F: FnOnce() -> rusqlite::Result<Connection> + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();

        let worker = thread::Builder::new()
            .name("census-db".into())
            .spawn(move || {
                let mut conn = match open() {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open SQLite database")));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }
                if let Err(err) = conn.pragma_update(None, "foreign_keys", "ON") {
                    error!("Failed to enable foreign keys: {err}");
                }
                if let Err(err) = conn.busy_timeout(Duration::from_secs(5)) {
                    error!("Failed to set busy timeout: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("DB initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Database thread shutting down");
            })
            .with_context(|| "failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        (*self.db_path).as_deref()
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("DB caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to DB thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread terminated unexpectedly"))?
    }

    /// Insert a `pending` session. Returns false if the id already exists.
    pub async fn create_session(&self, session: NewSession) -> Result<bool> {
        self.execute(move |conn| {
            let now = Utc::now().to_rfc3339();
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO sessions (id, image_id, image_path, location_id, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)",
                    params![
                        session.id,
                        session.image_id,
                        session.image_path,
                        session.location_id,
                        now,
                    ],
                )
                .with_context(|| "failed to insert session")?;
            Ok(inserted == 1)
        })
        .await
    }

    /// `pending -> processing`, recording the dispatching task id.
    pub async fn mark_processing(&self, session_id: &str, task_id: &str) -> Result<()> {
        let session_id = session_id.to_string();
        let task_id = task_id.to_string();
        self.execute(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE sessions
                     SET status = 'processing', task_id = ?1, updated_at = ?2
                     WHERE id = ?3 AND status = 'pending'",
                    params![task_id, Utc::now().to_rfc3339(), session_id],
                )
                .with_context(|| "failed to mark session processing")?;
            if updated != 1 {
                bail!("session {session_id} is not pending");
            }
            Ok(())
        })
        .await
    }

    /// `processing -> failed` with a client-safe message.
    pub async fn mark_failed(&self, session_id: &str, message: &str) -> Result<()> {
        let session_id = session_id.to_string();
        let message = message.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sessions
                 SET status = 'failed', error_message = ?1, updated_at = ?2
                 WHERE id = ?3 AND status IN ('pending', 'processing')",
                params![message, Utc::now().to_rfc3339(), session_id],
            )
            .with_context(|| "failed to mark session failed")?;
            Ok(())
        })
        .await
    }

    pub async fn session(&self, session_id: &str) -> Result<Option<SessionView>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, status, task_id, location_id, total_detected, total_estimated,
                            total_empty_containers, avg_confidence, category_counts,
                            error_message, warning_detail, processed_image_path
                     FROM sessions WHERE id = ?1",
                    params![session_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<i64>>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, Option<f64>>(7)?,
                            row.get::<_, String>(8)?,
                            row.get::<_, Option<String>>(9)?,
                            row.get::<_, Option<String>>(10)?,
                            row.get::<_, Option<String>>(11)?,
                        ))
                    },
                )
                .optional()
                .with_context(|| "failed to query session")?;

            let Some((id, status, task_id, location_id, detected, estimated, empty, avg, counts, error_message, warning, processed)) = row else {
                return Ok(None);
            };
            let warning_detail = match warning {
                Some(text) => Some(
                    serde_json::from_str(&text).with_context(|| "invalid warning_detail JSON")?,
                ),
                None => None,
            };
            Ok(Some(SessionView {
                session_id: id,
                status: status_from_str(&status)?,
                task_id,
                location_id,
                total_detected: detected,
                total_estimated: estimated,
                total_empty_containers: empty,
                avg_confidence: avg,
                category_counts: serde_json::from_str(&counts)
                    .with_context(|| "invalid category_counts JSON")?,
                error_message,
                warning_detail,
                processed_image_path: processed,
            }))
        })
        .await
    }

    /// Write the whole record graph and the final session figures in one
    /// transaction. Any failure rolls everything back.
    pub async fn write_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        graph: Arc<RecordGraph>,
        totals: Arc<SessionTotals>,
    ) -> Result<WriteReport> {
        let session_id = session_id.to_string();
        self.execute(move |conn| write_graph(conn, &session_id, status, &graph, &totals))
            .await
    }

    pub async fn density_parameters(&self, location_id: i64) -> Result<Option<DensityParameters>> {
        self.execute(move |conn| {
            conn.query_row(
                "SELECT avg_plant_area_px, pixels_per_cm2, samples
                 FROM density_parameters WHERE location_id = ?1",
                params![location_id],
                |row| {
                    Ok(DensityParameters {
                        avg_plant_area_px: row.get(0)?,
                        pixels_per_cm2: row.get(1)?,
                        samples: row.get::<_, i64>(2)?.max(0) as usize,
                    })
                },
            )
            .optional()
            .with_context(|| "failed to query density parameters")
        })
        .await
    }

    pub async fn save_density_parameters(
        &self,
        location_id: i64,
        params: DensityParameters,
    ) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO density_parameters (location_id, avg_plant_area_px, pixels_per_cm2, samples, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(location_id) DO UPDATE SET
                    avg_plant_area_px = excluded.avg_plant_area_px,
                    pixels_per_cm2 = excluded.pixels_per_cm2,
                    samples = excluded.samples,
                    updated_at = excluded.updated_at",
                params![
                    location_id,
                    params.avg_plant_area_px,
                    params.pixels_per_cm2,
                    params.samples as i64,
                    Utc::now().to_rfc3339(),
                ],
            )
            .with_context(|| "failed to save density parameters")?;
            Ok(())
        })
        .await
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).with_context(|| "failed to serialize column value")
}

fn write_graph(
    conn: &mut Connection,
    session_id: &str,
    status: SessionStatus,
    graph: &RecordGraph,
    totals: &SessionTotals,
) -> Result<WriteReport> {
    let tx = conn
        .transaction()
        .context("failed to open session transaction")?;
    let now = Utc::now().to_rfc3339();

    let current: Option<String> = tx
        .query_row(
            "SELECT status FROM sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;
    match current.as_deref() {
        None => bail!("session {session_id} does not exist"),
        Some("processing") => {}
        Some(other) => bail!("session {session_id} is {other}, expected processing"),
    }

    let mut container_ids = Vec::with_capacity(graph.containers.len());
    {
        let mut stmt = tx.prepare(
            "INSERT INTO containers (session_id, location_id, code, kind, bbox, mask, confidence, model_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for c in &graph.containers {
            stmt.execute(params![
                session_id,
                c.location_id,
                c.code,
                c.kind,
                to_json(&c.bbox)?,
                to_json(&c.mask)?,
                c.confidence as f64,
                c.model_version,
                now,
            ])
            .with_context(|| format!("failed to insert container {}", c.code))?;
            container_ids.push(tx.last_insert_rowid());
        }
    }

    let mut batch_ids = Vec::with_capacity(graph.batches.len());
    {
        let mut stmt = tx.prepare(
            "INSERT INTO batches (session_id, container_id, product, product_state, size, packaging,
                                  initial_quantity, current_quantity, empty_containers, quality_score, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8, ?9, ?10)",
        )?;
        for b in &graph.batches {
            stmt.execute(params![
                session_id,
                container_ids[b.container.0],
                b.product,
                b.product_state,
                b.size,
                b.packaging,
                b.quantity,
                b.empty_containers,
                b.quality_score,
                now,
            ])
            .with_context(|| "failed to insert batch")?;
            batch_ids.push(tx.last_insert_rowid());
        }
    }

    let mut movement_ids = Vec::with_capacity(graph.movements.len());
    {
        let mut stmt = tx.prepare(
            "INSERT INTO movements (session_id, batch_id, movement_type, source_container_id,
                                    destination_container_id, quantity, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for m in &graph.movements {
            stmt.execute(params![
                session_id,
                batch_ids[m.batch.0],
                m.movement_type,
                m.source.map(|c| container_ids[c.0]),
                m.destination.map(|c| container_ids[c.0]),
                m.quantity,
                now,
            ])
            .with_context(|| "failed to insert movement")?;
            movement_ids.push(tx.last_insert_rowid());
        }
    }

    {
        let mut stmt = tx.prepare(
            "INSERT INTO detections (session_id, movement_id, center_x, center_y, width, height,
                                     bbox, confidence, label, is_empty, is_alive)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;
        for d in &graph.detections {
            let det = &d.detection;
            stmt.execute(params![
                session_id,
                movement_ids[d.movement.0],
                det.center_x as f64,
                det.center_y as f64,
                det.width as f64,
                det.height as f64,
                to_json(&det.bbox)?,
                det.confidence as f64,
                det.label,
                det.is_empty,
                det.is_alive,
            ])
            .with_context(|| "failed to insert detection")?;
        }
    }

    {
        let mut stmt = tx.prepare(
            "INSERT INTO estimations (session_id, movement_id, polygon, area_cm2, estimated_count,
                                      raw_count, method, confidence, used_calibration, bands)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        for e in &graph.estimations {
            stmt.execute(params![
                session_id,
                movement_ids[e.movement.0],
                to_json(&e.polygon)?,
                e.area_cm2,
                e.estimated_count,
                e.raw_count,
                e.method,
                e.confidence as f64,
                e.used_calibration,
                to_json(&e.bands)?,
            ])
            .with_context(|| "failed to insert estimation")?;
        }
    }

    tx.execute(
        "UPDATE sessions
         SET status = ?1, total_detected = ?2, total_estimated = ?3, total_empty_containers = ?4,
             avg_confidence = ?5, category_counts = ?6, warning_detail = ?7,
             processed_image_path = ?8, error_message = NULL, updated_at = ?9
         WHERE id = ?10",
        params![
            status.as_str(),
            totals.total_detected,
            totals.total_estimated,
            totals.total_empty_containers,
            totals.avg_confidence,
            to_json(&totals.category_counts)?,
            totals.warning_detail.as_ref().map(to_json).transpose()?,
            totals.processed_image_path,
            now,
            session_id,
        ],
    )
    .with_context(|| "failed to update session totals")?;

    tx.commit().context("failed to commit session transaction")?;

    Ok(WriteReport {
        containers: graph.containers.len(),
        batches: graph.batches.len(),
        movements: graph.movements.len(),
        detections: graph.detections.len(),
        estimations: graph.estimations.len(),
    })
}

/// Map a database error onto the pipeline taxonomy. Busy and locked
/// databases are worth another attempt; everything else is not.
pub fn persistence_error(err: anyhow::Error) -> PipelineError {
    let retryable = err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(e, _))
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    });
    PipelineError::Persistence {
        message: format!("{err:#}"),
        retryable,
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 100,
        }
    }
}

/// Transactional writer with retries on transient database errors.
#[derive(Clone)]
pub struct PersistenceWriter {
    db: Database,
    config: PersistenceConfig,
}

impl PersistenceWriter {
    pub fn new(db: Database, config: PersistenceConfig) -> Self {
        Self { db, config }
    }

    pub async fn persist(
        &self,
        session_id: &str,
        status: SessionStatus,
        graph: RecordGraph,
        totals: SessionTotals,
    ) -> PipelineResult<WriteReport> {
        graph.validate()?;
        let graph = Arc::new(graph);
        let totals = Arc::new(totals);
        let max_attempts = self.config.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .db
                .write_session(session_id, status, graph.clone(), totals.clone())
                .await
            {
                Ok(report) => {
                    info!(
                        "Session {} persisted: {} containers, {} batches, {} detections, {} estimations",
                        session_id,
                        report.containers,
                        report.batches,
                        report.detections,
                        report.estimations
                    );
                    return Ok(report);
                }
                Err(err) => {
                    let err = persistence_error(err);
                    if err.is_transient() && attempt < max_attempts {
                        let delay = self.config.backoff_base_ms * 2u64.pow(attempt - 1);
                        warn!(
                            "Session {} write attempt {} failed, retrying in {}ms: {}",
                            session_id, attempt, delay, err
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        continue;
                    }
                    error!("Session {} write failed after {} attempts: {}", session_id, attempt, err);
                    return Err(err);
                }
            }
        }
    }
}
