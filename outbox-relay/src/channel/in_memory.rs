//! 内存版消息通道（InMemoryChannel）
//!
//! 基于 `tokio::sync::broadcast` 的轻量通道，满足 `MessageChannel` 协议：
//! - `send`：记录确认的消息并广播给订阅者；
//! - `subscribe`：返回 `'static` 生命周期的消息流，便于在 `tokio::spawn` 中消费；
//! - 故障注入：整体不可用、按主题不可用、接下来 N 次失败、固定延迟。
//!
//! 典型用途：测试、示例与本地开发。
use super::{ChannelMessage, MessageChannel};
use crate::error::{RelayError, RelayResult as Result};
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

#[derive(Default)]
struct State {
    delivered: Vec<ChannelMessage>,
    attempts: HashMap<String, usize>,
    all_down: bool,
    down_topics: HashSet<String>,
    fail_next: usize,
    latency: Option<Duration>,
}

#[derive(Clone)]
pub struct InMemoryChannel {
    tx: broadcast::Sender<ChannelMessage>,
    state: Arc<Mutex<State>>,
}

impl InMemoryChannel {
    /// `capacity` 为广播缓冲区容量
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// 整体不可用/恢复
    pub fn set_available(&self, available: bool) {
        self.state().all_down = !available;
    }

    pub fn fail_topic(&self, topic: impl Into<String>) {
        self.state().down_topics.insert(topic.into());
    }

    pub fn restore_topic(&self, topic: &str) {
        self.state().down_topics.remove(topic);
    }

    /// 接下来的 `n` 次发送失败（不区分主题）
    pub fn fail_next(&self, n: usize) {
        self.state().fail_next = n;
    }

    /// 每次发送前等待 `latency`，用于触发发布超时
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    /// 已确认送达 `topic` 的消息
    pub fn delivered(&self, topic: &str) -> Vec<ChannelMessage> {
        self.state()
            .delivered
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// 向 `topic` 发起的发送次数（含失败）
    pub fn attempts(&self, topic: &str) -> usize {
        self.state().attempts.get(topic).copied().unwrap_or_default()
    }

    pub fn subscribe(&self) -> BoxStream<'static, Result<ChannelMessage>> {
        let rx = self.tx.subscribe();
        Box::pin(BroadcastStream::new(rx).map(|r| {
            r.map_err(|e| RelayError::ChannelUnavailable {
                topic: "*".to_string(),
                reason: e.to_string(),
            })
        }))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl MessageChannel for InMemoryChannel {
    async fn send(&self, message: &ChannelMessage) -> Result<()> {
        let latency = {
            let mut state = self.state();
            *state.attempts.entry(message.topic.clone()).or_default() += 1;
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        let failure = if state.all_down {
            Some("channel down")
        } else if state.down_topics.contains(&message.topic) {
            Some("topic down")
        } else if state.fail_next > 0 {
            state.fail_next -= 1;
            Some("injected failure")
        } else {
            None
        };

        if let Some(reason) = failure {
            return Err(RelayError::ChannelUnavailable {
                topic: message.topic.clone(),
                reason: reason.to_string(),
            });
        }

        state.delivered.push(message.clone());
        // 若当前无订阅者，broadcast 的 send 会返回错误，这里视为非致命并忽略
        let _ = self.tx.send(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(topic: &str, key: &str) -> ChannelMessage {
        ChannelMessage {
            topic: topic.into(),
            key: key.into(),
            payload: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn records_and_broadcasts_acknowledged_messages() {
        let channel = InMemoryChannel::new(16);
        let mut stream = channel.subscribe();

        channel.send(&msg("scores", "42")).await.unwrap();

        assert_eq!(channel.delivered("scores"), vec![msg("scores", "42")]);
        assert!(channel.delivered("other").is_empty());
        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received.key, "42");
    }

    #[tokio::test]
    async fn injected_failures_are_counted_but_not_delivered() {
        let channel = InMemoryChannel::default();
        channel.fail_next(2);

        assert!(channel.send(&msg("scores", "1")).await.is_err());
        assert!(channel.send(&msg("scores", "1")).await.is_err());
        assert!(channel.send(&msg("scores", "1")).await.is_ok());

        assert_eq!(channel.attempts("scores"), 3);
        assert_eq!(channel.delivered("scores").len(), 1);
    }

    #[tokio::test]
    async fn topic_outage_only_affects_that_topic() {
        let channel = InMemoryChannel::default();
        channel.fail_topic("scores");

        let err = channel.send(&msg("scores", "1")).await.unwrap_err();
        assert!(matches!(err, RelayError::ChannelUnavailable { ref topic, .. } if topic == "scores"));
        assert!(channel.send(&msg("scores.dlq", "1")).await.is_ok());

        channel.restore_topic("scores");
        assert!(channel.send(&msg("scores", "1")).await.is_ok());
    }
}
