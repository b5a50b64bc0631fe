use std::time::{SystemTime, UNIX_EPOCH};

use {async_trait::async_trait, sqlx::SqlitePool};

use crate::{
    audit::{AuditEvent, AuditSink},
    error::AuditError,
};

/// A stored audit row.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub id: i64,
    pub event: AuditEvent,
    pub created_at: i64,
}

/// SQLite-backed audit sink, one JSON row per event in `outbox_audit`.
pub struct SqliteAuditSink {
    pool: SqlitePool,
}

impl SqliteAuditSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect and create the table if needed.
    pub async fn connect(url: &str) -> Result<Self, AuditError> {
        let pool = SqlitePool::connect(url).await?;
        Self::init(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Create the `outbox_audit` table.
    pub async fn init(pool: &SqlitePool) -> Result<(), AuditError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS outbox_audit (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                kind        TEXT    NOT NULL,
                entry_id    INTEGER NOT NULL,
                destination TEXT    NOT NULL,
                payload     TEXT    NOT NULL,
                created_at  INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outbox_audit_entry
             ON outbox_audit (entry_id, id)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Most recent events first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<AuditRecord>, AuditError> {
        let rows = sqlx::query_as::<_, (i64, String, i64)>(
            "SELECT id, payload, created_at
             FROM outbox_audit
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, payload, created_at)| -> Result<AuditRecord, AuditError> {
                Ok(AuditRecord {
                    id,
                    event: serde_json::from_str(&payload)?,
                    created_at,
                })
            })
            .collect()
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[async_trait]
impl AuditSink for SqliteAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let payload = serde_json::to_string(&event)?;
        let entry_id = i64::try_from(event.entry_id().0).unwrap_or(i64::MAX);
        sqlx::query(
            "INSERT INTO outbox_audit (kind, entry_id, destination, payload, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(event.kind())
        .bind(entry_id)
        .bind(event.destination())
        .bind(payload)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::entry::EntryId};

    async fn sink() -> SqliteAuditSink {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        SqliteAuditSink::init(&pool).await.unwrap();
        SqliteAuditSink::new(pool)
    }

    #[tokio::test]
    async fn records_and_lists_events() {
        let sink = sink().await;
        sink.record(AuditEvent::Enqueued {
            entry_id: EntryId(1),
            destination: "-100".into(),
            thread: None,
            text_len: 3,
            coalesced: false,
        })
        .await
        .unwrap();
        sink.record(AuditEvent::SendFailed {
            entry_id: EntryId(1),
            destination: "-100".into(),
            thread: Some("9".into()),
            error: "boom".into(),
        })
        .await
        .unwrap();

        let recent = sink.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event.kind(), "send_failed");
        assert_eq!(recent[1].event.kind(), "enqueued");
        assert!(recent[0].created_at > 0);
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        SqliteAuditSink::init(&pool).await.unwrap();
        SqliteAuditSink::init(&pool).await.unwrap();
    }
}
