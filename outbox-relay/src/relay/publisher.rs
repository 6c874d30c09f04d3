//! 发布器（Publisher）
//!
//! `publish` 为事件派生一个发送任务并立即返回其句柄，不阻塞轮询器：
//! - 发送受 `publish_timeout` 约束，超时按失败处理；
//! - 任务结束时经由 `Acknowledger` 回写状态；
//! - 本进程内同一事件至多一个在途发送（`DashSet` 去重）。
//!
use super::completion::Acknowledger;
use crate::channel::{ChannelMessage, MessageChannel};
use crate::error::{RelayError, RelayResult};
use crate::model::OutboxEvent;
use crate::store::Transition;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// 发送任务句柄，结果为该事件本次的状态转换
pub type PublishHandle = JoinHandle<RelayResult<Transition>>;

#[derive(Clone)]
pub struct Publisher {
    channel: Arc<dyn MessageChannel>,
    topic: String,
    timeout: Duration,
    acknowledger: Acknowledger,
    in_flight: Arc<DashSet<i64>>,
    tracker: TaskTracker,
}

impl Publisher {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        topic: impl Into<String>,
        timeout: Duration,
        acknowledger: Acknowledger,
    ) -> Self {
        Self {
            channel,
            topic: topic.into(),
            timeout,
            acknowledger,
            in_flight: Arc::new(DashSet::new()),
            tracker: TaskTracker::new(),
        }
    }

    /// 派发一次发送；该事件已有在途发送时返回 `None`
    pub fn publish(&self, event: OutboxEvent) -> Option<PublishHandle> {
        if !self.in_flight.insert(event.id()) {
            debug!(
                event_id = %event.event_id(),
                "previous dispatch still in flight, skipping"
            );
            return None;
        }

        let guard = InFlightGuard {
            set: self.in_flight.clone(),
            id: event.id(),
        };
        let channel = self.channel.clone();
        let acknowledger = self.acknowledger.clone();
        let message = ChannelMessage::for_event(&self.topic, &event);
        let timeout = self.timeout;

        Some(self.tracker.spawn(async move {
            let _guard = guard;
            debug!(
                event_id = %event.event_id(),
                aggregate_id = %event.aggregate_id(),
                topic = %message.topic,
                retry_count = event.retry_count(),
                "publishing outbox event"
            );
            match send_bounded(channel.as_ref(), &message, timeout).await {
                Ok(()) => acknowledger.on_success(&event).await,
                Err(e) => acknowledger.on_failure(&event, &e).await,
            }
        }))
    }

    pub fn acknowledger(&self) -> &Acknowledger {
        &self.acknowledger
    }

    /// 在途发送数
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// 等待在途发送全部结束，超时返回 `false`（剩余任务被放弃，事件保持 PENDING）
    pub async fn drain(&self, deadline: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(deadline, self.tracker.wait())
            .await
            .is_ok()
    }
}

/// 任务结束（含 panic、被取消）时移出在途集合
struct InFlightGuard {
    set: Arc<DashSet<i64>>,
    id: i64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

/// 带超时的单次发送
pub(crate) async fn send_bounded(
    channel: &dyn MessageChannel,
    message: &ChannelMessage,
    timeout: Duration,
) -> RelayResult<()> {
    match tokio::time::timeout(timeout, channel.send(message)).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::PublishTimeout {
            topic: message.topic.clone(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}
