//! Sync Processor Service
//!
//! Performs one bounded batch of mailbox synchronization per call. The
//! worker claims a job and delegates it here by id; this service fetches a
//! batch from the mail relay, forwards each message to the enrichment
//! intake, advances the mailbox cursors, and either completes the job or
//! returns it to pending with its progress so a later worker run continues
//! where this one stopped.

use axum::{extract::State, response::Json, routing::{get, post}, Router};
use common::{config::ServiceConfig, http_client::HttpClient, HealthResponse, ServiceError, ServiceResult};
use models::{
    EnqueueEnrichmentRequest, MailMessage, Mailbox, JobStatus, ProcessJobRequest,
    ProcessJobResponse, QueueItem, QueueKind, SyncJob, SyncProgress, SyncState,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, instrument, warn};

mod provider;
mod store;

use provider::{MailBatch, MailProvider, RelayMailProvider};
use store::ProcessorStore;

#[derive(Clone)]
struct AppState {
    config: ServiceConfig,
    http_client: HttpClient,
    store: ProcessorStore,
    provider: Arc<dyn MailProvider>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = ServiceConfig::from_env("sync-processor-service", 8002);

    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .init();

    let database_url = config
        .database_url
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL environment variable is required"))?;

    let store = ProcessorStore::new(database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize database: {}", e))?;

    let provider = Arc::new(RelayMailProvider::new(config.service_url("mail-relay")));

    let state = AppState {
        config: config.clone(),
        http_client: HttpClient::new(),
        store,
        provider,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/sync/process", post(process_job))
        .with_state(Arc::new(state))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        );

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Sync Processor Service listening on port {}", config.port);

    axum::serve(listener, app).await?;
    Ok(())
}

#[instrument]
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse::new("sync-processor-service"))
}

#[instrument(skip(state))]
async fn process_job(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ProcessJobRequest>,
) -> ServiceResult<Json<ProcessJobResponse>> {
    let job = state.store.get_job(request.job_id).await?;
    if job.status != JobStatus::Processing {
        return Err(ServiceError::BadRequest(format!(
            "Job {} is {}, expected processing",
            job.id, job.status
        )));
    }

    let mailbox = state.store.get_mailbox(job.mailbox_id).await?;
    let sync_state = state.store.get_sync_state(job.mailbox_id).await?;

    state.store.set_is_syncing(job.mailbox_id, true).await?;
    let outcome = run_batch(&state, &job, &mailbox, &sync_state).await;
    // The guard must clear even when the batch failed, or the creator would
    // skip this mailbox forever.
    if let Err(e) = state.store.set_is_syncing(job.mailbox_id, false).await {
        error!("Failed to clear is_syncing for mailbox {}: {}", job.mailbox_id, e);
    }

    let (completed, progress) = outcome?;
    info!(
        "Job {}: batch of {} processed, completed={}",
        job.id, progress.processed, completed
    );
    Ok(Json(ProcessJobResponse { completed, progress }))
}

/// One bounded unit of work. On a provider failure the job row is left in
/// processing and the error propagates; the worker releases the claim and
/// the attempt counter decides when to stop retrying.
async fn run_batch(
    state: &Arc<AppState>,
    job: &SyncJob,
    mailbox: &Mailbox,
    sync_state: &SyncState,
) -> ServiceResult<(bool, SyncProgress)> {
    let batch = state
        .provider
        .fetch_batch(mailbox, sync_state, job.batch_size)
        .await
        .map_err(ServiceError::Internal)?;

    let mut progress = job.progress;
    let mut synced_now = 0i64;

    for message in &batch.messages {
        progress.processed += 1;

        if message.body.trim().is_empty() {
            progress.skipped += 1;
            continue;
        }

        match forward_to_enrichment(state, message).await {
            Ok(()) => {
                progress.synced += 1;
                synced_now += 1;
            }
            Err(e) => {
                warn!("Failed to hand message uid {} to enrichment: {}", message.uid, e);
                progress.errors += 1;
            }
        }
    }

    progress.total = running_total(progress.processed, batch.remaining);

    let (last_sequence, last_uid) = cursor_advance(sync_state, &batch);
    state
        .store
        .advance_cursors(mailbox.id, last_sequence, last_uid, synced_now)
        .await?;

    let completed = batch.remaining == 0;
    if completed {
        state.store.complete_job(job.id, &progress).await?;
    } else {
        state.store.return_job_pending(job.id, &progress).await?;
    }

    Ok((completed, progress))
}

/// Running total on the job: what this run processed plus the provider's
/// count of what is left, saturating instead of wrapping when a provider
/// reports a remainder past the column range.
fn running_total(processed: i32, remaining: i64) -> i32 {
    i32::try_from(remaining)
        .ok()
        .and_then(|r| processed.checked_add(r))
        .unwrap_or(i32::MAX)
}

/// New cursor positions after a batch. Cursors only move forward.
fn cursor_advance(sync_state: &SyncState, batch: &MailBatch) -> (i64, i64) {
    let mut last_sequence = sync_state.last_sequence_number;
    let mut last_uid = sync_state.last_uid;
    for message in &batch.messages {
        last_sequence = last_sequence.max(message.sequence_number);
        last_uid = last_uid.max(message.uid);
    }
    (last_sequence, last_uid)
}

/// Queue the message for classification. Identity for the email/ticket is
/// minted at the enrichment intake, the same way replies without a known
/// ticket are handled.
async fn forward_to_enrichment(
    state: &Arc<AppState>,
    message: &MailMessage,
) -> Result<(), reqwest::Error> {
    let url = format!(
        "{}/api/v1/enrichment/queue",
        state.config.service_url("enrichment")
    );
    let request = EnqueueEnrichmentRequest {
        queue: QueueKind::Classification,
        email_id: None,
        ticket_id: None,
        subject: message.subject.clone(),
        body: message.body.clone(),
        from_address: message.from_address.clone(),
        from_name: message.from_name.clone(),
        priority: None,
        max_retries: None,
    };

    state
        .http_client
        .post::<_, QueueItem>(&url, &request)
        .await
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn sync_state(last_sequence: i64, last_uid: i64) -> SyncState {
        SyncState {
            mailbox_id: Uuid::new_v4(),
            last_sequence_number: last_sequence,
            last_uid,
            total_emails_synced: 0,
            is_syncing: false,
        }
    }

    fn message(sequence_number: i64, uid: i64) -> MailMessage {
        MailMessage {
            uid,
            sequence_number,
            subject: "Order update".to_string(),
            body: "Where is my order #1234?".to_string(),
            from_address: "customer@example.com".to_string(),
            from_name: None,
        }
    }

    #[test]
    fn test_running_total_adds_remainder() {
        assert_eq!(running_total(20, 5), 25);
        assert_eq!(running_total(0, 0), 0);
    }

    #[test]
    fn test_running_total_saturates_on_huge_remainder() {
        assert_eq!(running_total(20, i64::MAX), i32::MAX);
        assert_eq!(running_total(i32::MAX, 1), i32::MAX);
    }

    #[test]
    fn test_cursor_advance_takes_batch_maximum() {
        let state = sync_state(10, 100);
        let batch = MailBatch {
            messages: vec![message(11, 101), message(13, 104), message(12, 102)],
            remaining: 5,
        };
        assert_eq!(cursor_advance(&state, &batch), (13, 104));
    }

    #[test]
    fn test_cursor_advance_never_rewinds() {
        let state = sync_state(50, 500);
        let batch = MailBatch {
            messages: vec![message(3, 30)],
            remaining: 0,
        };
        assert_eq!(cursor_advance(&state, &batch), (50, 500));
    }

    #[test]
    fn test_cursor_advance_empty_batch() {
        let state = sync_state(7, 70);
        let batch = MailBatch::default();
        assert_eq!(cursor_advance(&state, &batch), (7, 70));
    }

    #[tokio::test]
    async fn test_scripted_provider_plays_batches_in_order() {
        use crate::provider::testing::ScriptedProvider;

        let provider = ScriptedProvider::new(vec![
            MailBatch {
                messages: vec![message(1, 1)],
                remaining: 1,
            },
            MailBatch {
                messages: vec![message(2, 2)],
                remaining: 0,
            },
        ]);

        let mailbox = Mailbox {
            id: Uuid::new_v4(),
            address: "support@example.com".to_string(),
            display_name: None,
            is_active: true,
            created_at: Utc::now(),
        };
        let state = sync_state(0, 0);

        let first = provider.fetch_batch(&mailbox, &state, 20).await.unwrap();
        assert_eq!(first.remaining, 1);
        assert_eq!(first.messages[0].uid, 1);

        let second = provider.fetch_batch(&mailbox, &state, 20).await.unwrap();
        assert_eq!(second.remaining, 0);

        assert!(provider.fetch_batch(&mailbox, &state, 20).await.is_err());
    }
}
