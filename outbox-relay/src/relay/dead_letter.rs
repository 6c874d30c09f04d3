//! 死信发送（DeadLetterSender）
//!
//! 仅在事件刚转入 FAILED 且已持久化后被调用一次。尽力而为：
//! 发送失败只记日志，不重试，也不回写事件状态。
//!
use super::publisher::send_bounded;
use crate::channel::{ChannelMessage, MessageChannel};
use crate::model::OutboxEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

#[derive(Clone)]
pub struct DeadLetterSender {
    channel: Arc<dyn MessageChannel>,
    topic: String,
    timeout: Duration,
    tracker: TaskTracker,
}

impl DeadLetterSender {
    pub fn new(channel: Arc<dyn MessageChannel>, topic: impl Into<String>, timeout: Duration) -> Self {
        Self {
            channel,
            topic: topic.into(),
            timeout,
            tracker: TaskTracker::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 异步转发到死信主题，立即返回
    pub fn forward(&self, event: &OutboxEvent) -> JoinHandle<()> {
        let channel = self.channel.clone();
        let timeout = self.timeout;
        let message = ChannelMessage::for_event(&self.topic, event);
        let event_id = event.event_id().to_string();
        let retry_count = event.retry_count();

        self.tracker.spawn(async move {
            match send_bounded(channel.as_ref(), &message, timeout).await {
                Ok(()) => info!(
                    event_id = %event_id,
                    aggregate_id = %message.key,
                    topic = %message.topic,
                    retry_count,
                    "event forwarded to dead-letter topic"
                ),
                Err(e) => error!(
                    event_id = %event_id,
                    aggregate_id = %message.key,
                    topic = %message.topic,
                    error = %e,
                    "dead-letter publish failed, event stays FAILED"
                ),
            }
        })
    }

    /// 尚未结束的死信发送数
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// 等待已发起的死信发送结束，超时返回 `false`
    pub async fn drain(&self, deadline: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(deadline, self.tracker.wait())
            .await
            .is_ok()
    }
}
