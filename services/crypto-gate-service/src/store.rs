use chrono::{DateTime, TimeZone, Utc};
use common::ServiceResult;
use models::CryptoOperation;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Audit trail and rate-limit counters for the crypto gate.
#[derive(Clone)]
pub struct GateStore {
    pool: PgPool,
}

impl GateStore {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS crypto_audit_log (
                id UUID PRIMARY KEY,
                actor VARCHAR NOT NULL,
                operation VARCHAR NOT NULL,
                target UUID,
                created_at TIMESTAMPTZ NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rate_limit_counters (
                actor VARCHAR NOT NULL,
                window_start TIMESTAMPTZ NOT NULL,
                count INTEGER NOT NULL,
                PRIMARY KEY (actor, window_start)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append one audit row. Callers treat this as best-effort.
    pub async fn record_audit(
        &self,
        actor: &str,
        operation: CryptoOperation,
        target: Option<Uuid>,
    ) -> ServiceResult<()> {
        let operation = match operation {
            CryptoOperation::Encrypt => "encrypt",
            CryptoOperation::Decrypt => "decrypt",
        };

        sqlx::query(
            "INSERT INTO crypto_audit_log (id, actor, operation, target, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(actor)
        .bind(operation)
        .bind(target)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fixed-window rate limit: bump the counter for the actor's current
    /// window and compare against the limit, all in one statement.
    pub async fn check_rate_limit(
        &self,
        actor: &str,
        limit: i32,
        window_secs: i64,
    ) -> ServiceResult<bool> {
        let window = window_start(Utc::now(), window_secs);

        let row = sqlx::query(
            r#"
            INSERT INTO rate_limit_counters (actor, window_start, count)
            VALUES ($1, $2, 1)
            ON CONFLICT (actor, window_start)
            DO UPDATE SET count = rate_limit_counters.count + 1
            RETURNING count
            "#,
        )
        .bind(actor)
        .bind(window)
        .fetch_one(&self.pool)
        .await?;

        let count: i32 = row.get("count");
        Ok(count <= limit)
    }
}

/// Start of the fixed window containing `now`.
fn window_start(now: DateTime<Utc>, window_secs: i64) -> DateTime<Utc> {
    let epoch_secs = now.timestamp();
    let start = epoch_secs - epoch_secs.rem_euclid(window_secs);
    Utc.timestamp_opt(start, 0).single().unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_start_truncates() {
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 12, 34, 56).unwrap();
        let start = window_start(now, 60);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 8, 30, 12, 34, 0).unwrap());
    }

    #[test]
    fn test_window_start_is_stable_within_window() {
        let a = Utc.with_ymd_and_hms(2026, 8, 30, 12, 34, 1).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 8, 30, 12, 34, 59).unwrap();
        assert_eq!(window_start(a, 60), window_start(b, 60));
    }

    #[test]
    fn test_window_start_changes_across_windows() {
        let a = Utc.with_ymd_and_hms(2026, 8, 30, 12, 34, 59).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 8, 30, 12, 35, 0).unwrap();
        assert_ne!(window_start(a, 60), window_start(b, 60));
    }
}
