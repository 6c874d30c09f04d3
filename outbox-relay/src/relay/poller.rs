//! 轮询器（Poller）
//!
//! 每轮：加锁拉取一批可投递事件 → 逐条交给发布器（不等待结果）→ 提交批次释放锁。
//! 相邻两轮不重叠，下一轮在上一轮结束后间隔 `poll_interval` 开始；首轮立即执行。
//! 取消可打断仍在等待批次锁的拉取，此时尚未派发任何事件。
//!
use super::publisher::{PublishHandle, Publisher};
use crate::clock::Clock;
use crate::error::RelayResult;
use crate::store::{OutboxStore, PendingBatch};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 单轮结果；`handles` 可等待以观察本轮派发的每个发送
#[derive(Debug, Default)]
pub struct TickReport {
    pub fetched: usize,
    pub dispatched: usize,
    /// 仍有在途发送而被跳过的事件数
    pub skipped: usize,
    pub handles: Vec<PublishHandle>,
}

#[derive(Clone)]
pub struct Poller {
    store: Arc<dyn OutboxStore>,
    publisher: Publisher,
    clock: Arc<dyn Clock>,
    batch_size: usize,
}

impl Poller {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Publisher,
        clock: Arc<dyn Clock>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            publisher,
            clock,
            batch_size,
        }
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// 执行一轮；存储错误会中止本轮，已派发的发送不受影响
    pub async fn tick(&self) -> RelayResult<TickReport> {
        let batch = self.fetch().await?;
        self.dispatch(batch).await
    }

    async fn fetch(&self) -> RelayResult<PendingBatch> {
        self.store
            .fetch_pending_batch(self.batch_size, self.clock.now())
            .await
    }

    async fn dispatch(&self, batch: PendingBatch) -> RelayResult<TickReport> {
        let mut report = TickReport {
            fetched: batch.len(),
            handles: Vec::with_capacity(batch.len()),
            ..Default::default()
        };

        for event in batch.events() {
            match self.publisher.publish(event.clone()) {
                Some(handle) => {
                    report.dispatched += 1;
                    report.handles.push(handle);
                }
                None => report.skipped += 1,
            }
        }

        batch.commit().await?;

        if report.fetched > 0 {
            debug!(
                fetched = report.fetched,
                dispatched = report.dispatched,
                skipped = report.skipped,
                "poll tick dispatched batch"
            );
        }
        Ok(report)
    }

    /// 周期执行直至取消；派发一旦开始即完成本轮
    pub(crate) async fn run(self, token: CancellationToken, interval: Duration) {
        let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        info!(interval_ms, "outbox poller started");

        loop {
            let fetched = tokio::select! {
                _ = token.cancelled() => break,
                fetched = self.fetch() => fetched,
            };

            let tick = match fetched {
                Ok(batch) => self.dispatch(batch).await,
                Err(e) => Err(e),
            };
            if let Err(e) = tick {
                warn!(error = %e, "poll tick aborted, retrying next interval");
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("outbox poller stopped");
    }
}
