use chrono::Utc;
use common::{ServiceError, ServiceResult};
use models::{EnqueueEnrichmentRequest, JobStatus, QueueItem, QueueKind};
use sqlx::{postgres::PgRow, PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_MAX_RETRIES: i32 = 3;
/// Lower value is serviced first; 100 leaves headroom on both sides.
pub const DEFAULT_PRIORITY: i32 = 100;

const ITEM_COLUMNS: &str = "id, email_id, ticket_id, subject, body, from_address, from_name, status, retry_count, max_retries, priority, created_at, started_at, completed_at, error_message";

/// The classification and draft queues: two tables, one schema, one
/// claim/attempt/retry pattern.
#[derive(Clone)]
pub struct QueueStore {
    pool: PgPool,
}

impl QueueStore {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        for kind in [QueueKind::Classification, QueueKind::Draft] {
            let table = kind.table();
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id UUID PRIMARY KEY,
                    email_id UUID NOT NULL,
                    ticket_id UUID NOT NULL,
                    subject TEXT NOT NULL,
                    body TEXT NOT NULL,
                    from_address VARCHAR NOT NULL,
                    from_name VARCHAR,
                    status VARCHAR NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    max_retries INTEGER NOT NULL,
                    priority INTEGER NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    started_at TIMESTAMPTZ,
                    completed_at TIMESTAMPTZ,
                    error_message TEXT
                )
            "#
            ))
            .execute(&self.pool)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {table}_pending_order ON {table} (priority, created_at) WHERE status = 'pending'"
            ))
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    pub async fn enqueue(
        &self,
        kind: QueueKind,
        request: EnqueueEnrichmentRequest,
    ) -> ServiceResult<QueueItem> {
        let item = QueueItem {
            id: Uuid::new_v4(),
            email_id: request.email_id.unwrap_or_else(Uuid::new_v4),
            ticket_id: request.ticket_id.unwrap_or_else(Uuid::new_v4),
            subject: request.subject,
            body: request.body,
            from_address: request.from_address,
            from_name: request.from_name,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            priority: request.priority.unwrap_or(DEFAULT_PRIORITY),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        };

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (id, email_id, ticket_id, subject, body, from_address, from_name, status, retry_count, max_retries, priority, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', 0, $8, $9, $10)
            "#,
            kind.table()
        ))
        .bind(item.id)
        .bind(item.email_id)
        .bind(item.ticket_id)
        .bind(&item.subject)
        .bind(&item.body)
        .bind(&item.from_address)
        .bind(&item.from_name)
        .bind(item.max_retries)
        .bind(item.priority)
        .bind(item.created_at)
        .execute(&self.pool)
        .await?;

        Ok(item)
    }

    /// Claim up to `limit` pending items, most urgent first, flipping them
    /// to processing in a single statement. SKIP LOCKED keeps concurrent
    /// sweeps from ever claiming the same item.
    pub async fn claim_batch(&self, kind: QueueKind, limit: i64) -> ServiceResult<Vec<QueueItem>> {
        let table = kind.table();
        let rows = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET status = 'processing', started_at = $1
            WHERE id IN (
                SELECT id FROM {table}
                WHERE status = 'pending'
                ORDER BY priority ASC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(Utc::now())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut items = rows
            .iter()
            .map(item_from_row)
            .collect::<ServiceResult<Vec<_>>>()?;
        // RETURNING does not preserve the subquery order.
        items.sort_by(|a, b| (a.priority, a.created_at).cmp(&(b.priority, b.created_at)));
        Ok(items)
    }

    pub async fn complete_item(&self, kind: QueueKind, id: Uuid) -> ServiceResult<()> {
        sqlx::query(&format!(
            "UPDATE {} SET status = 'completed', completed_at = $1 WHERE id = $2",
            kind.table()
        ))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count a failed attempt: back to pending while retries remain,
    /// terminal failed once they are spent. One atomic statement, so the
    /// retry_count/max_retries invariant holds under concurrent sweeps.
    pub async fn record_failure(
        &self,
        kind: QueueKind,
        id: Uuid,
        error_message: &str,
    ) -> ServiceResult<(i32, JobStatus)> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET retry_count = retry_count + 1,
                status = CASE WHEN retry_count + 1 >= max_retries THEN 'failed' ELSE 'pending' END,
                completed_at = CASE WHEN retry_count + 1 >= max_retries THEN $1 ELSE NULL END,
                started_at = NULL,
                error_message = $2
            WHERE id = $3
            RETURNING retry_count, max_retries
            "#,
            kind.table()
        ))
        .bind(Utc::now())
        .bind(error_message)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Queue item {} not found", id)))?;

        let retry_count: i32 = row.get("retry_count");
        let max_retries: i32 = row.get("max_retries");

        Ok((retry_count, status_after_failure(retry_count, max_retries)))
    }

    /// Hand items stranded in processing past the timeout back to the
    /// queue. Covers a sweep that claimed a batch and died before
    /// recording outcomes; nothing else ever leaves processing.
    pub async fn reclaim_stale(
        &self,
        kind: QueueKind,
        stale_after: Duration,
    ) -> ServiceResult<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after)
                .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Invalid stale timeout: {}", e)))?;

        let result = sqlx::query(&format!(
            "UPDATE {} SET status = 'pending', started_at = NULL WHERE status = 'processing' AND started_at < $1",
            kind.table()
        ))
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Status a queue item lands in after a failed attempt, given the
/// post-increment retry count. The CASE in `record_failure` writes the
/// same transition; keeping it here makes the arithmetic testable.
pub fn status_after_failure(retry_count: i32, max_retries: i32) -> JobStatus {
    if retry_count >= max_retries {
        JobStatus::Failed
    } else {
        JobStatus::Pending
    }
}

fn item_from_row(row: &PgRow) -> ServiceResult<QueueItem> {
    let status: String = row.get("status");
    let status: JobStatus = status
        .parse()
        .map_err(|e: String| ServiceError::Internal(anyhow::anyhow!(e)))?;

    Ok(QueueItem {
        id: row.get("id"),
        email_id: row.get("email_id"),
        ticket_id: row.get("ticket_id"),
        subject: row.get("subject"),
        body: row.get("body"),
        from_address: row.get("from_address"),
        from_name: row.get("from_name"),
        status,
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        priority: row.get("priority"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        error_message: row.get("error_message"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_retries_until_spent() {
        // Default budget: three attempts, terminal on the third failure.
        assert_eq!(status_after_failure(1, DEFAULT_MAX_RETRIES), JobStatus::Pending);
        assert_eq!(status_after_failure(2, DEFAULT_MAX_RETRIES), JobStatus::Pending);
        assert_eq!(status_after_failure(3, DEFAULT_MAX_RETRIES), JobStatus::Failed);
    }

    #[test]
    fn test_single_attempt_budget_fails_on_first_failure() {
        assert_eq!(status_after_failure(1, 1), JobStatus::Failed);
    }

    #[test]
    fn test_zero_retry_budget_is_terminal_immediately() {
        assert_eq!(status_after_failure(1, 0), JobStatus::Failed);
    }
}
