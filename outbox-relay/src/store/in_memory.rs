//! 内存版发件箱存储（InMemoryOutboxStore）
//!
//! - 行数据由 `std::sync::Mutex` 保护，单事件更新在锁内完成读-改-写；
//! - 批量拉取使用 `tokio::sync::Mutex` 的 owned guard 作为阻塞排他锁，
//!   guard 随 `PendingBatch` 提交或丢弃而释放；
//! - `created_at` 在追加时取自注入的 `Clock`（缺省系统时钟），不接受调用方传入；
//! - `set_available(false)` 可模拟存储不可达，所有操作返回 `Storage` 错误。
//!
//! 典型用途：测试、示例与本地开发。
use super::{BatchLease, OutboxStore, PendingBatch, StatusCounts, Transition};
use crate::error::{RelayError, RelayResult as Result};
use crate::model::{NewOutboxEvent, OutboxEvent, OutboxStatus};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
struct Table {
    next_id: i64,
    rows: BTreeMap<i64, OutboxEvent>,
    event_ids: HashSet<String>,
}

#[derive(Clone)]
pub struct InMemoryOutboxStore {
    table: Arc<Mutex<Table>>,
    batch_lock: Arc<tokio::sync::Mutex<()>>,
    available: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用指定时钟为追加的事件写入 `created_at`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            batch_lock: Arc::new(tokio::sync::Mutex::new(())),
            available: Arc::new(AtomicBool::new(true)),
            clock,
        }
    }

    /// 模拟存储宕机/恢复
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// 模拟人工删除行
    pub fn remove(&self, id: i64) -> Option<OutboxEvent> {
        let mut table = self.table();
        let removed = table.rows.remove(&id)?;
        table.event_ids.remove(removed.event_id());
        Some(removed)
    }

    /// 全部行，按 id 升序
    pub fn all(&self) -> Vec<OutboxEvent> {
        self.table().rows.values().cloned().collect()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RelayError::storage("in-memory store unavailable"))
        }
    }
}

struct InMemoryLease {
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl BatchLease for InMemoryLease {
    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(&self, event: NewOutboxEvent) -> Result<OutboxEvent> {
        self.ensure_available()?;
        let mut table = self.table();

        if table.event_ids.contains(event.event_id()) {
            return Err(RelayError::DuplicateEvent {
                event_id: event.event_id().to_string(),
            });
        }

        table.next_id += 1;
        let id = table.next_id;
        let stored = OutboxEvent::pending(id, event, self.clock.now());
        table.event_ids.insert(stored.event_id().to_string());
        table.rows.insert(id, stored.clone());

        Ok(stored)
    }

    async fn fetch_pending_batch(&self, limit: usize, now: DateTime<Utc>) -> Result<PendingBatch> {
        // 阻塞等待上一批次释放，而非跳过已锁定的行
        let guard = self.batch_lock.clone().lock_owned().await;
        self.ensure_available()?;

        let events = {
            let table = self.table();
            let mut events: Vec<OutboxEvent> = table
                .rows
                .values()
                .filter(|e| e.is_eligible(now))
                .cloned()
                .collect();
            events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            events.truncate(limit);
            events
        };

        Ok(PendingBatch::new(
            events,
            Box::new(InMemoryLease { _guard: guard }),
        ))
    }

    async fn mark_sent(&self, id: i64, now: DateTime<Utc>) -> Result<Transition> {
        self.ensure_available()?;
        let mut table = self.table();
        let row = table.rows.get_mut(&id).ok_or(RelayError::NotFound { id })?;

        if row.status.is_terminal() {
            return Ok(Transition::Unchanged(row.status));
        }

        row.status = OutboxStatus::Sent;
        row.sent_at = Some(now);
        row.next_attempt_at = None;
        Ok(Transition::Sent(row.clone()))
    }

    async fn record_failure(
        &self,
        id: i64,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<Transition> {
        self.ensure_available()?;
        let mut table = self.table();
        let row = table.rows.get_mut(&id).ok_or(RelayError::NotFound { id })?;

        if row.status.is_terminal() {
            return Ok(Transition::Unchanged(row.status));
        }

        match policy.apply_failure(row, now, reason) {
            RetryDecision::Retry { .. } => Ok(Transition::Retrying(row.clone())),
            RetryDecision::Exhausted { .. } => Ok(Transition::Failed(row.clone())),
        }
    }

    async fn get(&self, id: i64) -> Result<Option<OutboxEvent>> {
        self.ensure_available()?;
        Ok(self.table().rows.get(&id).cloned())
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        self.ensure_available()?;
        let mut counts = StatusCounts::default();
        for row in self.table().rows.values() {
            counts.bump(row.status);
        }
        Ok(counts)
    }

    async fn verify(&self) -> Result<()> {
        self.ensure_available()
    }
}
