use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Re-export common types
pub use chrono;
pub use serde;
pub use uuid;

/// A connected mailbox whose messages are synced into the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: Uuid,
    pub address: String,
    pub display_name: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle status shared by sync jobs and enrichment queue items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress counters accumulated across the batches of one sync job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub processed: i32,
    pub total: i32,
    pub synced: i32,
    pub skipped: i32,
    pub errors: i32,
}

/// A unit of mailbox synchronization work. Jobs are durable rows: created
/// pending, claimed into processing by the worker, finished as completed or
/// failed. Never deleted; terminal rows are the sync audit history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub mailbox_id: Uuid,
    pub job_type: String,
    pub status: JobStatus,
    pub batch_size: i32,
    pub progress: SyncProgress,
    pub attempts: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Per-mailbox incremental sync cursors. Mutated only by the sync processor
/// while a job for that mailbox is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub mailbox_id: Uuid,
    pub last_sequence_number: i64,
    pub last_uid: i64,
    pub total_emails_synced: i64,
    pub is_syncing: bool,
}

/// Which enrichment queue an item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Classification,
    Draft,
}

impl QueueKind {
    /// Table backing this queue. Both tables share one schema.
    pub fn table(&self) -> &'static str {
        match self {
            QueueKind::Classification => "classification_queue",
            QueueKind::Draft => "draft_queue",
        }
    }
}

/// An enrichment work item (classification or draft generation) with its
/// denormalized email context, captured at enqueue time so the sweep does
/// not need a join per attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub email_id: Uuid,
    pub ticket_id: Uuid,
    pub subject: String,
    pub body: String,
    pub from_address: String,
    pub from_name: Option<String>,
    pub status: JobStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// LLM classification output, persisted verbatim as the public schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailClassification {
    pub category: String,
    pub priority: String,
    pub intent: String,
    pub sentiment: String,
    pub entities: Vec<String>,
    pub recommended_actions: Vec<String>,
    pub suggested_assignee: Option<String>,
    pub confidence: f32,
}

/// One message as handed over by the mail relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub uid: i64,
    pub sequence_number: i64,
    pub subject: String,
    pub body: String,
    pub from_address: String,
    pub from_name: Option<String>,
}

// API Request/Response models

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateJobsRequest {
    /// Target a single mailbox; omitted means "all active mailboxes".
    pub mailbox_id: Option<Uuid>,
    pub batch_size: Option<i32>,
    pub job_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateJobsResponse {
    pub success: bool,
    pub jobs: Vec<SyncJob>,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<SyncProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub success: bool,
    pub jobs_processed: usize,
    pub time_elapsed_ms: u64,
    pub jobs: Vec<JobOutcome>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReclaimResponse {
    pub success: bool,
    pub reclaimed: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessJobRequest {
    pub job_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessJobResponse {
    /// False means the job was returned to pending with remaining work and
    /// a later worker run will continue it.
    pub completed: bool,
    pub progress: SyncProgress,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueEnrichmentRequest {
    pub queue: QueueKind,
    /// Omitted when the email/ticket identity is minted at intake, e.g. for
    /// messages arriving fresh from a mailbox sync.
    pub email_id: Option<Uuid>,
    pub ticket_id: Option<Uuid>,
    pub subject: String,
    pub body: String,
    pub from_address: String,
    pub from_name: Option<String>,
    pub priority: Option<i32>,
    pub max_retries: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub item_id: Uuid,
    pub status: String,
    pub retry_count: i32,
    /// Enrichment output for completed items: the classification object or
    /// the generated draft.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SweepResponse {
    pub success: bool,
    pub items: Vec<ItemOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoOperation {
    Encrypt,
    Decrypt,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CryptoRequest {
    pub operation: CryptoOperation,
    pub data: String,
    #[serde(alias = "mailboxId")]
    pub mailbox_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CryptoResponse {
    /// Base64 payload for encrypt, UTF-8 plaintext for decrypt.
    pub result: String,
    /// 0 signals the derived fallback key, >=1 an explicitly configured key.
    pub version: u32,
}

// Error types
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_crypto_operation_wire_format() {
        let req: CryptoRequest =
            serde_json::from_str(r#"{"operation":"encrypt","data":"secret"}"#).unwrap();
        assert_eq!(req.operation, CryptoOperation::Encrypt);
        assert!(req.mailbox_id.is_none());
    }

    #[test]
    fn test_crypto_request_accepts_camel_case_mailbox_id() {
        let id = Uuid::new_v4();
        let json = format!(r#"{{"operation":"decrypt","data":"x","mailboxId":"{}"}}"#, id);
        let req: CryptoRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(req.mailbox_id, Some(id));

        let json = format!(r#"{{"operation":"decrypt","data":"x","mailbox_id":"{}"}}"#, id);
        let req: CryptoRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(req.mailbox_id, Some(id));
    }

    #[test]
    fn test_queue_kind_tables() {
        assert_eq!(QueueKind::Classification.table(), "classification_queue");
        assert_eq!(QueueKind::Draft.table(), "draft_queue");
    }

    #[test]
    fn test_job_outcome_omits_empty_fields() {
        let outcome = JobOutcome {
            job_id: Uuid::new_v4(),
            status: "completed".to_string(),
            progress: None,
            error: None,
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(!json.contains("progress"));
        assert!(!json.contains("error"));
    }
}
