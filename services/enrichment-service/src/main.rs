//! Enrichment Service
//!
//! Runs the classification and draft-generation queues: an at-least-once
//! retry queue per enrichment type, sharing one claim/attempt/retry shape.
//! A sweep claims a bounded batch of pending items (most urgent first),
//! attempts each through the LLM client, and records completion or a
//! counted failure; items are terminally failed once retries are spent.
//! One bad item never aborts a sweep.

use axum::{extract::State, response::Json, routing::{get, post}, Router};
use common::{config::ServiceConfig, HealthResponse, ServiceError, ServiceResult};
use models::{
    EnqueueEnrichmentRequest, ItemOutcome, QueueItem, QueueKind, SweepResponse,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, instrument, warn};

mod llm_client;
mod store;

use llm_client::LLMClient;
use store::QueueStore;

/// Items claimed per sweep.
const SWEEP_BATCH_SIZE: i64 = 10;

/// An item stuck in processing longer than this was claimed by a sweep
/// that died before recording an outcome; hand it back to the queue.
const STALE_AFTER: std::time::Duration = std::time::Duration::from_secs(15 * 60);

#[derive(Clone)]
struct AppState {
    store: QueueStore,
    llm: LLMClient,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = ServiceConfig::from_env("enrichment-service", 8003);

    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .init();

    let database_url = config
        .database_url
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL environment variable is required"))?;

    let store = QueueStore::new(database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize database: {}", e))?;
    store
        .migrate()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    if config.openai_api_key.is_none() {
        info!("No OPENAI_API_KEY set; enrichment will use keyword/template fallbacks");
    }
    let llm = LLMClient::new(config.openai_api_key.clone());

    let state = AppState { store, llm };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/enrichment/queue", post(enqueue_item))
        .route("/api/v1/enrichment/classify", post(sweep_classification))
        .route("/api/v1/enrichment/drafts", post(sweep_drafts))
        .with_state(Arc::new(state))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        );

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Enrichment Service listening on port {}", config.port);

    axum::serve(listener, app).await?;
    Ok(())
}

#[instrument]
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse::new("enrichment-service"))
}

/// Queue intake: create a pending item in the requested queue.
#[instrument(skip(state, request))]
async fn enqueue_item(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EnqueueEnrichmentRequest>,
) -> ServiceResult<Json<QueueItem>> {
    if request.from_address.is_empty() {
        return Err(ServiceError::BadRequest("from_address is required".to_string()));
    }

    let kind = request.queue;
    let item = state.store.enqueue(kind, request).await?;
    info!("Enqueued {:?} item {} for email {}", kind, item.id, item.email_id);
    Ok(Json(item))
}

#[instrument(skip(state))]
async fn sweep_classification(
    State(state): State<Arc<AppState>>,
) -> ServiceResult<Json<SweepResponse>> {
    sweep(state, QueueKind::Classification).await
}

#[instrument(skip(state))]
async fn sweep_drafts(State(state): State<Arc<AppState>>) -> ServiceResult<Json<SweepResponse>> {
    sweep(state, QueueKind::Draft).await
}

/// One queue sweep: claim, attempt, record, item by item. Recording is
/// per item too: a store write that fails leaves that item in processing
/// for a later staleness sweep and never ends the loop early.
async fn sweep(state: Arc<AppState>, kind: QueueKind) -> ServiceResult<Json<SweepResponse>> {
    let reclaimed = state.store.reclaim_stale(kind, STALE_AFTER).await?;
    if reclaimed > 0 {
        info!("Reclaimed {} stale {:?} items back to pending", reclaimed, kind);
    }

    let items = state.store.claim_batch(kind, SWEEP_BATCH_SIZE).await?;
    info!("Claimed {} {:?} items", items.len(), kind);

    let mut outcomes = Vec::with_capacity(items.len());
    for item in items {
        let attempt: Result<serde_json::Value, String> = match kind {
            QueueKind::Classification => state
                .llm
                .classify_email(&item)
                .await
                .map_err(|e| e.to_string())
                .and_then(|c| serde_json::to_value(c).map_err(|e| e.to_string())),
            QueueKind::Draft => state
                .llm
                .draft_reply(&item)
                .await
                .map(serde_json::Value::String)
                .map_err(|e| e.to_string()),
        };

        let outcome = match attempt {
            Ok(result) => match state.store.complete_item(kind, item.id).await {
                Ok(()) => ItemOutcome {
                    item_id: item.id,
                    status: "completed".to_string(),
                    retry_count: item.retry_count,
                    result: Some(result),
                    error: None,
                },
                Err(e) => store_error_outcome(&item, &e),
            },
            Err(message) => {
                warn!("{:?} item {} failed: {}", kind, item.id, message);
                match state.store.record_failure(kind, item.id, &message).await {
                    Ok((retry_count, status)) => ItemOutcome {
                        item_id: item.id,
                        status: status.to_string(),
                        retry_count,
                        result: None,
                        error: Some(message),
                    },
                    Err(e) => store_error_outcome(&item, &e),
                }
            }
        };
        outcomes.push(outcome);
    }

    Ok(Json(SweepResponse {
        success: true,
        items: outcomes,
    }))
}

/// Summary entry for an item whose outcome could not be written. The row
/// stays in processing until the staleness sweep hands it back.
fn store_error_outcome(item: &QueueItem, error: &ServiceError) -> ItemOutcome {
    warn!("Failed to record outcome for item {}: {}", item.id, error);
    ItemOutcome {
        item_id: item.id,
        status: "error".to_string(),
        retry_count: item.retry_count,
        result: None,
        error: Some(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use models::JobStatus;
    use uuid::Uuid;

    #[test]
    fn test_store_write_failure_becomes_an_error_outcome() {
        let item = QueueItem {
            id: Uuid::new_v4(),
            email_id: Uuid::new_v4(),
            ticket_id: Uuid::new_v4(),
            subject: "Refund request".to_string(),
            body: "Please refund order #4411".to_string(),
            from_address: "customer@example.com".to_string(),
            from_name: None,
            status: JobStatus::Processing,
            retry_count: 1,
            max_retries: 3,
            priority: 100,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            error_message: None,
        };

        let error = ServiceError::Internal(anyhow::anyhow!("connection reset"));
        let outcome = store_error_outcome(&item, &error);

        assert_eq!(outcome.item_id, item.id);
        assert_eq!(outcome.status, "error");
        assert_eq!(outcome.retry_count, 1);
        assert!(outcome.result.is_none());
        assert!(outcome.error.unwrap().contains("connection reset"));
    }
}
