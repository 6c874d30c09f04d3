//! Postgres 版发件箱存储（PostgresOutboxStore）
//!
//! 表 `outbox_event`：`event_id` 唯一索引用于重复检测，`(status, created_at)` 索引服务拉取。
//!
//! 锁语义：`fetch_pending_batch` 在事务内执行 `SELECT ... FOR UPDATE`（不带 `SKIP LOCKED`），
//! 事务由 `PendingBatch` 持有直至提交。并发的第二个拉取者会阻塞在行锁上，而非拿到不相交批次。
//!
//! 错误映射：
//!
//! | sqlx 错误 | SQLSTATE | RelayError |
//! |-----------|----------|------------|
//! | 唯一约束冲突（append） | `23505` | `DuplicateEvent` |
//! | 表/列不存在（verify） | `42P01` / `42703` | `Schema` |
//! | 其它 | - | `Storage` |
//!
use super::{BatchLease, OutboxStore, PendingBatch, StatusCounts, Transition};
use crate::error::{RelayError, RelayResult as Result};
use crate::model::{NewOutboxEvent, OutboxEvent, OutboxStatus};
use crate::retry::{RetryDecision, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Transaction};
use tracing::{debug, info};

const COLUMNS: &str = "id, event_id, event_type, aggregate_type, aggregate_id, payload, status, \
     created_at, retry_count, last_attempt_at, next_attempt_at, sent_at, last_error";

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_event (
    id              BIGSERIAL PRIMARY KEY,
    event_id        TEXT        NOT NULL,
    event_type      TEXT        NOT NULL,
    aggregate_type  TEXT        NOT NULL,
    aggregate_id    TEXT        NOT NULL,
    payload         BYTEA       NOT NULL,
    status          TEXT        NOT NULL DEFAULT 'PENDING',
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    retry_count     INTEGER     NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    last_attempt_at TIMESTAMPTZ,
    next_attempt_at TIMESTAMPTZ,
    sent_at         TIMESTAMPTZ,
    last_error      TEXT
)
"#;

const CREATE_EVENT_ID_INDEX: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_outbox_event_event_id ON outbox_event (event_id)";

const CREATE_PENDING_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_outbox_event_status_created_at \
     ON outbox_event (status, created_at)";

#[derive(Debug, FromRow)]
struct OutboxRow {
    id: i64,
    event_id: String,
    event_type: String,
    aggregate_type: String,
    aggregate_id: String,
    payload: Vec<u8>,
    status: String,
    created_at: DateTime<Utc>,
    retry_count: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl TryFrom<OutboxRow> for OutboxEvent {
    type Error = RelayError;

    fn try_from(row: OutboxRow) -> Result<Self> {
        Ok(OutboxEvent {
            id: row.id,
            event_id: row.event_id,
            event_type: row.event_type,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            payload: row.payload,
            status: row.status.parse()?,
            created_at: row.created_at,
            retry_count: u32::try_from(row.retry_count).map_err(|_| RelayError::Schema {
                reason: format!("negative retry_count for id={}", row.id),
            })?,
            last_attempt_at: row.last_attempt_at,
            next_attempt_at: row.next_attempt_at,
            sent_at: row.sent_at,
            last_error: row.last_error,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 建表与索引（幂等）
    pub async fn migrate(&self) -> Result<()> {
        for statement in [CREATE_TABLE, CREATE_EVENT_ID_INDEX, CREATE_PENDING_INDEX] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("outbox_event table initialized");
        Ok(())
    }

    /// 在调用方已开启的事务中追加事件，与领域写入一同提交或回滚，
    /// `created_at` 取数据库事务时间：
    ///
    /// ```ignore
    /// let mut tx = pool.begin().await?;
    /// sqlx::query("INSERT INTO score ...").execute(&mut *tx).await?;
    /// PostgresOutboxStore::append_in(&mut tx, event).await?;
    /// tx.commit().await?;
    /// ```
    pub async fn append_in(conn: &mut PgConnection, event: NewOutboxEvent) -> Result<OutboxEvent> {
        let sql = format!(
            "INSERT INTO outbox_event \
             (event_id, event_type, aggregate_type, aggregate_id, payload, status, created_at, retry_count) \
             VALUES ($1, $2, $3, $4, $5, 'PENDING', now(), 0) \
             RETURNING {COLUMNS}"
        );

        let row = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(event.event_id())
            .bind(event.event_type())
            .bind(event.aggregate_type())
            .bind(event.aggregate_id())
            .bind(event.payload())
            .fetch_one(conn)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    RelayError::DuplicateEvent {
                        event_id: event.event_id().to_string(),
                    }
                }
                other => other.into(),
            })?;

        row.try_into()
    }

    async fn current_status(&self, id: i64) -> Result<OutboxStatus> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM outbox_event WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        status.ok_or(RelayError::NotFound { id })?.parse()
    }
}

struct PostgresLease {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl BatchLease for PostgresLease {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn append(&self, event: NewOutboxEvent) -> Result<OutboxEvent> {
        let mut conn = self.pool.acquire().await?;
        Self::append_in(&mut conn, event).await
    }

    async fn fetch_pending_batch(&self, limit: usize, now: DateTime<Utc>) -> Result<PendingBatch> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {COLUMNS} FROM outbox_event \
             WHERE status = 'PENDING' AND (next_attempt_at IS NULL OR next_attempt_at <= $1) \
             ORDER BY created_at ASC, id ASC \
             LIMIT $2 \
             FOR UPDATE"
        );
        let rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&mut *tx)
            .await?;

        let events = rows
            .into_iter()
            .map(OutboxEvent::try_from)
            .collect::<Result<Vec<_>>>()?;
        debug!(count = events.len(), "locked pending outbox batch");

        Ok(PendingBatch::new(events, Box::new(PostgresLease { tx })))
    }

    async fn mark_sent(&self, id: i64, now: DateTime<Utc>) -> Result<Transition> {
        let sql = format!(
            "UPDATE outbox_event SET status = 'SENT', sent_at = $2, next_attempt_at = NULL \
             WHERE id = $1 AND status = 'PENDING' \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Transition::Sent(row.try_into()?)),
            None => Ok(Transition::Unchanged(self.current_status(id).await?)),
        }
    }

    async fn record_failure(
        &self,
        id: i64,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<Transition> {
        let mut tx = self.pool.begin().await?;

        let select = format!("SELECT {COLUMNS} FROM outbox_event WHERE id = $1 FOR UPDATE");
        let row = sqlx::query_as::<_, OutboxRow>(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(RelayError::NotFound { id })?;
        let mut event = OutboxEvent::try_from(row)?;

        if event.status().is_terminal() {
            return Ok(Transition::Unchanged(event.status()));
        }

        let decision = policy.apply_failure(&mut event, now, reason);
        let retry_count = i32::try_from(event.retry_count()).unwrap_or(i32::MAX);

        sqlx::query(
            "UPDATE outbox_event \
             SET retry_count = $2, last_attempt_at = $3, last_error = $4, status = $5, next_attempt_at = $6 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(retry_count)
        .bind(event.last_attempt_at())
        .bind(event.last_error())
        .bind(event.status().as_str())
        .bind(event.next_attempt_at())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(match decision {
            RetryDecision::Retry { .. } => Transition::Retrying(event),
            RetryDecision::Exhausted { .. } => Transition::Failed(event),
        })
    }

    async fn get(&self, id: i64) -> Result<Option<OutboxEvent>> {
        let sql = format!("SELECT {COLUMNS} FROM outbox_event WHERE id = $1");
        sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(OutboxEvent::try_from)
            .transpose()
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outbox_event GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or_default();
            match status.parse::<OutboxStatus>()? {
                OutboxStatus::Pending => counts.pending = count,
                OutboxStatus::Sent => counts.sent = count,
                OutboxStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }

    async fn verify(&self) -> Result<()> {
        let sql = format!("SELECT {COLUMNS} FROM outbox_event LIMIT 0");
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db)
                    if matches!(db.code().as_deref(), Some("42P01") | Some("42703")) =>
                {
                    RelayError::Schema {
                        reason: db.message().to_string(),
                    }
                }
                other => other.into(),
            })?;
        Ok(())
    }
}
