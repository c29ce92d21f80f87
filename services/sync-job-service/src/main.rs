//! Sync Job Service
//!
//! Owns the durable mailbox-sync job queue: creating jobs (one outstanding
//! job per mailbox), running the budgeted worker loop that claims jobs and
//! delegates them to the sync processor, and reclaiming jobs stranded by
//! crashed workers.
//!
//! Jobs live in Postgres and the database is the only coordination state,
//! so any number of overlapping invocations (scheduled, manual, or woken by
//! job creation) converge the queue safely: every state transition is a
//! single conditional UPDATE.

use axum::{extract::State, response::Json, routing::{get, post}, Router};
use common::{config::ServiceConfig, http_client::HttpClient, HealthResponse, ServiceError, ServiceResult};
use models::{
    CreateJobsRequest, CreateJobsResponse, Mailbox, ReclaimResponse, SyncJob, WorkerResponse,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, instrument, warn};

mod store;
mod worker;

use store::JobStore;
use worker::{WorkerBudget, STALE_AFTER};

const DEFAULT_BATCH_SIZE: i32 = 20;
const DEFAULT_JOB_TYPE: &str = "incremental_sync";

#[derive(Clone)]
struct AppState {
    config: ServiceConfig,
    http_client: HttpClient,
    store: JobStore,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = ServiceConfig::from_env("sync-job-service", 8001);

    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .init();

    let database_url = config
        .database_url
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL environment variable is required"))?;

    let store = JobStore::new(database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize database: {}", e))?;
    store
        .migrate()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    let state = AppState {
        config: config.clone(),
        http_client: HttpClient::new(),
        store,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/sync/jobs", post(create_jobs))
        .route("/api/v1/sync/worker", post(run_worker))
        .route("/api/v1/sync/reclaim", post(reclaim_stale))
        .with_state(Arc::new(state))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        );

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Sync Job Service listening on port {}", config.port);

    axum::serve(listener, app).await?;
    Ok(())
}

#[instrument]
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse::new("sync-job-service"))
}

/// Job Creator: materialize at most one outstanding sync job per eligible
/// mailbox. Idempotent: calling it again before the worker drains the
/// queue returns the same jobs instead of duplicating them.
#[instrument(skip(state))]
async fn create_jobs(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateJobsRequest>,
) -> ServiceResult<Json<CreateJobsResponse>> {
    let batch_size = request.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
    if batch_size <= 0 {
        return Err(ServiceError::BadRequest("batch_size must be positive".to_string()));
    }
    let job_type = request
        .job_type
        .unwrap_or_else(|| DEFAULT_JOB_TYPE.to_string());

    let mailboxes = match request.mailbox_id {
        Some(id) => {
            let mailbox = state.store.get_mailbox(id).await?;
            if !mailbox.is_active {
                return Err(ServiceError::NotFound(format!("Mailbox {} is inactive", id)));
            }
            vec![mailbox]
        }
        None => {
            let all = state.store.list_active_mailboxes().await?;
            if all.is_empty() {
                return Err(ServiceError::NotFound("No active mailboxes".to_string()));
            }
            all
        }
    };

    let considered = mailboxes.len();
    let mut jobs: Vec<SyncJob> = Vec::new();
    for mailbox in mailboxes {
        // One bad mailbox must not block the rest of the sweep.
        match prepare_job(&state.store, &mailbox, &job_type, batch_size).await {
            Ok(Some(job)) => jobs.push(job),
            Ok(None) => info!("Mailbox {} already syncing, skipped", mailbox.id),
            Err(e) => warn!("Job creation failed for mailbox {}: {}", mailbox.id, e),
        }
    }

    if !jobs.is_empty() {
        wake_worker(&state);
    }

    let message = format!("{} jobs for {} mailboxes considered", jobs.len(), considered);
    info!("{}", message);

    Ok(Json(CreateJobsResponse {
        success: true,
        jobs,
        message,
    }))
}

/// Per-mailbox creation step. Returns None when the mailbox is skipped
/// because a sync is already running.
async fn prepare_job(
    store: &JobStore,
    mailbox: &Mailbox,
    job_type: &str,
    batch_size: i32,
) -> ServiceResult<Option<SyncJob>> {
    // First job for a mailbox also materializes its zeroed cursor row.
    let sync_state = store.ensure_sync_state(mailbox.id).await?;
    if sync_state.is_syncing {
        return Ok(None);
    }

    if let Some(existing) = store.find_active_job(mailbox.id).await? {
        return Ok(Some(existing));
    }

    match store.create_job(mailbox.id, job_type, batch_size).await? {
        Some(job) => Ok(Some(job)),
        // Lost the insert race against a concurrent creator; the unique
        // index kept exactly one job, so return the winner.
        None => store.find_active_job(mailbox.id).await,
    }
}

/// Best-effort wake of the worker so freshly created jobs start without
/// waiting for the next scheduled run. Failure is logged and swallowed:
/// the scheduled poll is the authoritative driver of progress.
fn wake_worker(state: &Arc<AppState>) {
    let state = state.clone();
    tokio::spawn(async move {
        let url = format!("{}/api/v1/sync/worker", state.config.service_url("sync-job"));
        if let Err(e) = state
            .http_client
            .post::<_, WorkerResponse>(&url, &serde_json::json!({}))
            .await
        {
            warn!("Worker wake-up failed (will run on next schedule): {}", e);
        }
    });
}

/// Job Worker: one budgeted dispatch run over the pending queue.
#[instrument(skip(state))]
async fn run_worker(State(state): State<Arc<AppState>>) -> ServiceResult<Json<WorkerResponse>> {
    let response = worker::run_worker(
        &state.store,
        &state.http_client,
        &state.config,
        WorkerBudget::default(),
    )
    .await?;

    info!(
        "Worker run finished: {} jobs in {}ms",
        response.jobs_processed, response.time_elapsed_ms
    );
    Ok(Json(response))
}

/// Staleness Reclaimer, exposed for manual and scheduled invocation. The
/// worker also runs the same sweep at the start of every run.
#[instrument(skip(state))]
async fn reclaim_stale(State(state): State<Arc<AppState>>) -> ServiceResult<Json<ReclaimResponse>> {
    let reclaimed = state.store.reclaim_stale(STALE_AFTER).await?;
    if reclaimed > 0 {
        info!("Reclaimed {} stale jobs", reclaimed);
    }
    Ok(Json(ReclaimResponse {
        success: true,
        reclaimed,
    }))
}
