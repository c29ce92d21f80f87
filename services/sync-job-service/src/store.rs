use chrono::Utc;
use common::{ServiceError, ServiceResult};
use models::{JobStatus, Mailbox, SyncJob, SyncProgress, SyncState};
use sqlx::{postgres::PgRow, PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

/// Default attempt ceiling for sync jobs. Claiming increments the counter
/// and a successful batch resets it, so the ceiling bounds consecutive
/// claims that never complete a batch, not the length of a sync.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 10;

#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mailboxes (
                id UUID PRIMARY KEY,
                address VARCHAR NOT NULL,
                display_name VARCHAR,
                is_active BOOLEAN NOT NULL DEFAULT true,
                created_at TIMESTAMPTZ NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_jobs (
                id UUID PRIMARY KEY,
                mailbox_id UUID NOT NULL REFERENCES mailboxes(id),
                job_type VARCHAR NOT NULL,
                status VARCHAR NOT NULL,
                batch_size INTEGER NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                total INTEGER NOT NULL DEFAULT 0,
                synced INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                errors INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                error_message TEXT
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        // One outstanding job per mailbox, enforced by the database rather
        // than by a read-then-decide check in the creator.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS sync_jobs_one_active_per_mailbox
            ON sync_jobs (mailbox_id)
            WHERE status IN ('pending', 'processing')
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                mailbox_id UUID PRIMARY KEY REFERENCES mailboxes(id),
                last_sequence_number BIGINT NOT NULL DEFAULT 0,
                last_uid BIGINT NOT NULL DEFAULT 0,
                total_emails_synced BIGINT NOT NULL DEFAULT 0,
                is_syncing BOOLEAN NOT NULL DEFAULT false
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // Mailbox lookups

    pub async fn get_mailbox(&self, id: Uuid) -> ServiceResult<Mailbox> {
        let row = sqlx::query(
            "SELECT id, address, display_name, is_active, created_at FROM mailboxes WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Mailbox {} not found", id)))?;

        Ok(mailbox_from_row(&row))
    }

    pub async fn list_active_mailboxes(&self) -> ServiceResult<Vec<Mailbox>> {
        let rows = sqlx::query(
            "SELECT id, address, display_name, is_active, created_at FROM mailboxes WHERE is_active = true ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(mailbox_from_row).collect())
    }

    // Sync state

    /// Create the sync state row with zeroed cursors if the mailbox has
    /// never been synced, then return the current row either way.
    pub async fn ensure_sync_state(&self, mailbox_id: Uuid) -> ServiceResult<SyncState> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (mailbox_id, last_sequence_number, last_uid, total_emails_synced, is_syncing)
            VALUES ($1, 0, 0, 0, false)
            ON CONFLICT (mailbox_id) DO NOTHING
            "#,
        )
        .bind(mailbox_id)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT mailbox_id, last_sequence_number, last_uid, total_emails_synced, is_syncing FROM sync_state WHERE mailbox_id = $1",
        )
        .bind(mailbox_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(SyncState {
            mailbox_id: row.get("mailbox_id"),
            last_sequence_number: row.get("last_sequence_number"),
            last_uid: row.get("last_uid"),
            total_emails_synced: row.get("total_emails_synced"),
            is_syncing: row.get("is_syncing"),
        })
    }

    // Job lifecycle

    pub async fn find_active_job(&self, mailbox_id: Uuid) -> ServiceResult<Option<SyncJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE mailbox_id = $1 AND status IN ('pending', 'processing')",
        ))
        .bind(mailbox_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Insert a pending job for the mailbox. Returns None when another
    /// pending/processing job already holds the partial unique index slot;
    /// the insert and the duplicate check are one atomic statement.
    pub async fn create_job(
        &self,
        mailbox_id: Uuid,
        job_type: &str,
        batch_size: i32,
    ) -> ServiceResult<Option<SyncJob>> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO sync_jobs (id, mailbox_id, job_type, status, batch_size, attempts, max_attempts, created_at)
            VALUES ($1, $2, $3, 'pending', $4, 0, $5, $6)
            ON CONFLICT (mailbox_id) WHERE status IN ('pending', 'processing') DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4())
        .bind(mailbox_id)
        .bind(job_type)
        .bind(batch_size)
        .bind(DEFAULT_MAX_ATTEMPTS)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Claim the oldest pending job by flipping it to processing in a single
    /// conditional update. Two concurrent workers cannot claim the same row:
    /// SKIP LOCKED makes the loser see the next candidate (or none).
    pub async fn claim_next_job(&self) -> ServiceResult<Option<SyncJob>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE sync_jobs
            SET status = 'processing', started_at = $1, attempts = attempts + 1
            WHERE id = (
                SELECT id FROM sync_jobs
                WHERE status = 'pending'
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Hand a claimed job back to the queue, e.g. when the delegated
    /// processor call never went through. No-op if the processor already
    /// moved the job on.
    pub async fn release_job(&self, id: Uuid) -> ServiceResult<()> {
        sqlx::query(
            "UPDATE sync_jobs SET status = 'pending', started_at = NULL WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail_job(&self, id: Uuid, message: &str) -> ServiceResult<()> {
        sqlx::query(
            "UPDATE sync_jobs SET status = 'failed', completed_at = $1, error_message = $2 WHERE id = $3",
        )
        .bind(Utc::now())
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reset jobs stranded in processing past the timeout back to pending.
    /// Models crash recovery for a worker that claimed a job and died.
    /// Idempotent; a sweep that finds nothing stale changes nothing.
    pub async fn reclaim_stale(&self, stale_after: Duration) -> ServiceResult<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after)
                .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Invalid stale timeout: {}", e)))?;

        let result = sqlx::query(
            "UPDATE sync_jobs SET status = 'pending', started_at = NULL WHERE status = 'processing' AND started_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

const JOB_COLUMNS: &str = "id, mailbox_id, job_type, status, batch_size, processed, total, synced, skipped, errors, attempts, max_attempts, created_at, started_at, completed_at, error_message";

fn mailbox_from_row(row: &PgRow) -> Mailbox {
    Mailbox {
        id: row.get("id"),
        address: row.get("address"),
        display_name: row.get("display_name"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
    }
}

pub fn job_from_row(row: &PgRow) -> ServiceResult<SyncJob> {
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
