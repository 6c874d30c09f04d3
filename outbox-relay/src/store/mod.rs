//! 发件箱存储（OutboxStore）
//!
//! 事件表的追加、带锁批量拉取与逐条状态更新协议：
//! - `append`：在生产方事务内插入 PENDING 事件，重复 `event_id` 被拒绝；
//! - `fetch_pending_batch`：按 `created_at` 升序拉取可投递事件，持有**阻塞**排他锁
//!   直至 `PendingBatch::commit`（或被丢弃）。并发的第二个调用者会等待，而不是拿到
//!   不相交的批次，因此多个中继实例在此串行；
//! - `mark_sent`/`record_failure`：单事件原子读-改-写，终态行上的更新为空操作。
//!
//! 具体实现：`InMemoryOutboxStore`（测试、示例），`PostgresOutboxStore`（`postgres` 特性）。
//!
mod in_memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use in_memory::InMemoryOutboxStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresOutboxStore;

use crate::error::RelayResult as Result;
use crate::model::{NewOutboxEvent, OutboxEvent, OutboxStatus};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// 追加新事件（PENDING, retry_count=0）
    async fn append(&self, event: NewOutboxEvent) -> Result<OutboxEvent>;

    /// 加锁拉取至多 `limit` 条在 `now` 可投递的事件，最早的在前
    async fn fetch_pending_batch(&self, limit: usize, now: DateTime<Utc>) -> Result<PendingBatch>;

    /// PENDING → SENT
    async fn mark_sent(&self, id: i64, now: DateTime<Utc>) -> Result<Transition>;

    /// 记录一次失败，由 `policy` 决定回到 PENDING 还是转入 FAILED
    async fn record_failure(
        &self,
        id: i64,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<Transition>;

    async fn get(&self, id: i64) -> Result<Option<OutboxEvent>>;

    async fn status_counts(&self) -> Result<StatusCounts>;

    /// 启动前的可达性与表结构检查
    async fn verify(&self) -> Result<()>;
}

#[async_trait]
impl<T> OutboxStore for Arc<T>
where
    T: OutboxStore + ?Sized,
{
    async fn append(&self, event: NewOutboxEvent) -> Result<OutboxEvent> {
        (**self).append(event).await
    }

    async fn fetch_pending_batch(&self, limit: usize, now: DateTime<Utc>) -> Result<PendingBatch> {
        (**self).fetch_pending_batch(limit, now).await
    }

    async fn mark_sent(&self, id: i64, now: DateTime<Utc>) -> Result<Transition> {
        (**self).mark_sent(id, now).await
    }

    async fn record_failure(
        &self,
        id: i64,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<Transition> {
        (**self).record_failure(id, policy, now, reason).await
    }

    async fn get(&self, id: i64) -> Result<Option<OutboxEvent>> {
        (**self).get(id).await
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        (**self).status_counts().await
    }

    async fn verify(&self) -> Result<()> {
        (**self).verify().await
    }
}

/// 批次锁：提交即释放；未提交直接丢弃等价于回滚
#[async_trait]
pub trait BatchLease: Send {
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// 加锁拉取的一批待投递事件
pub struct PendingBatch {
    events: Vec<OutboxEvent>,
    lease: Box<dyn BatchLease>,
}

impl PendingBatch {
    pub fn new(events: Vec<OutboxEvent>, lease: Box<dyn BatchLease>) -> Self {
        Self { events, lease }
    }

    pub fn events(&self) -> &[OutboxEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// 提交拉取事务，释放行锁
    pub async fn commit(self) -> Result<()> {
        self.lease.commit().await
    }
}

impl std::fmt::Debug for PendingBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingBatch")
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}

/// 单事件状态更新的结果
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Sent(OutboxEvent),
    /// 失败但仍在重试预算内
    Retrying(OutboxEvent),
    /// 本次调用完成了 → FAILED 的转换（死信只在此时触发）
    Failed(OutboxEvent),
    /// 行已处于终态，未作修改
    Unchanged(OutboxStatus),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.sent + self.failed
    }

    pub(crate) fn bump(&mut self, status: OutboxStatus) {
        match status {
            OutboxStatus::Pending => self.pending += 1,
            OutboxStatus::Sent => self.sent += 1,
            OutboxStatus::Failed => self.failed += 1,
        }
    }
}
