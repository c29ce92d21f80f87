use chrono::Utc;
use common::{ServiceError, ServiceResult};
use models::{JobStatus, Mailbox, SyncJob, SyncProgress, SyncState};
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Read/write access to the job and cursor rows the processor touches.
/// The sync-job-service owns the schema; this store assumes it exists.
#[derive(Clone)]
pub struct ProcessorStore {
    pool: PgPool,
}

impl ProcessorStore {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn get_job(&self, id: Uuid) -> ServiceResult<SyncJob> {
        let row = sqlx::query(
            "SELECT id, mailbox_id, job_type, status, batch_size, processed, total, synced, skipped, errors, attempts, max_attempts, created_at, started_at, completed_at, error_message FROM sync_jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Job {} not found", id)))?;

        let status: String = row.get("status");
        let status: JobStatus = status
            .parse()
            .map_err(|e: String| ServiceError::Internal(anyhow::anyhow!(e)))?;

        Ok(SyncJob {
            id: row.get("id"),
            mailbox_id: row.get("mailbox_id"),
            job_type: row.get("job_type"),
            status,
            batch_size: row.get("batch_size"),
            progress: SyncProgress {
                processed: row.get("processed"),
                total: row.get("total"),
                synced: row.get("synced"),
                skipped: row.get("skipped"),
                errors: row.get("errors"),
            },
            attempts: row.get("attempts"),
            max_attempts: row.get("max_attempts"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            error_message: row.get("error_message"),
        })
    }

    pub async fn get_mailbox(&self, id: Uuid) -> ServiceResult<Mailbox> {
        let row = sqlx::query(
            "SELECT id, address, display_name, is_active, created_at FROM mailboxes WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Mailbox {} not found", id)))?;

        Ok(Mailbox {
            id: row.get("id"),
            address: row.get("address"),
            display_name: row.get("display_name"),
            is_active: row.get("is_active"),
            created_at: row.get("created_at"),
        })
    }

    pub async fn get_sync_state(&self, mailbox_id: Uuid) -> ServiceResult<SyncState> {
        let row = sqlx::query(
            "SELECT mailbox_id, last_sequence_number, last_uid, total_emails_synced, is_syncing FROM sync_state WHERE mailbox_id = $1",
        )
        .bind(mailbox_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("Sync state for mailbox {} not found", mailbox_id))
        })?;

        Ok(SyncState {
            mailbox_id: row.get("mailbox_id"),
            last_sequence_number: row.get("last_sequence_number"),
            last_uid: row.get("last_uid"),
            total_emails_synced: row.get("total_emails_synced"),
            is_syncing: row.get("is_syncing"),
        })
    }

    pub async fn set_is_syncing(&self, mailbox_id: Uuid, is_syncing: bool) -> ServiceResult<()> {
        sqlx::query("UPDATE sync_state SET is_syncing = $1 WHERE mailbox_id = $2")
            .bind(is_syncing)
            .bind(mailbox_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Move the cursors forward and count the newly synced messages.
    /// GREATEST keeps a delayed write from ever rewinding a cursor.
    pub async fn advance_cursors(
        &self,
        mailbox_id: Uuid,
        last_sequence_number: i64,
        last_uid: i64,
        synced_delta: i64,
    ) -> ServiceResult<()> {
        sqlx::query(
            r#"
            UPDATE sync_state
            SET last_sequence_number = GREATEST(last_sequence_number, $1),
                last_uid = GREATEST(last_uid, $2),
                total_emails_synced = total_emails_synced + $3
            WHERE mailbox_id = $4
            "#,
        )
        .bind(last_sequence_number)
        .bind(last_uid)
        .bind(synced_delta)
        .bind(mailbox_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn complete_job(&self, id: Uuid, progress: &SyncProgress) -> ServiceResult<()> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'completed', completed_at = $1,
                processed = $2, total = $3, synced = $4, skipped = $5, errors = $6
            WHERE id = $7
            "#,
        )
        .bind(Utc::now())
        .bind(progress.processed)
        .bind(progress.total)
        .bind(progress.synced)
        .bind(progress.skipped)
        .bind(progress.errors)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record the batch's progress and leave the job pending so a later
    /// worker run continues it. This is the resumable-continuation path.
    /// The batch succeeded, so the attempt counter restarts: the ceiling
    /// bounds consecutive failed claims, not the number of batches a large
    /// mailbox needs.
    pub async fn return_job_pending(&self, id: Uuid, progress: &SyncProgress) -> ServiceResult<()> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'pending', started_at = NULL, attempts = 0,
                processed = $1, total = $2, synced = $3, skipped = $4, errors = $5
            WHERE id = $6
            "#,
        )
        .bind(progress.processed)
        .bind(progress.total)
        .bind(progress.synced)
        .bind(progress.skipped)
        .bind(progress.errors)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
