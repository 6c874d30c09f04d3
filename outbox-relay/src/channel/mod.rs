//! 消息通道（MessageChannel）协议
//!
//! 中继只向通道发送 `(topic, key=aggregate_id, value=payload)`，不关心负载结构；
//! 主通道与死信通道共用同一协议，仅主题不同。
//!
mod in_memory;
#[cfg(feature = "kafka")]
mod kafka;

pub use in_memory::InMemoryChannel;
#[cfg(feature = "kafka")]
pub use kafka::{KafkaChannel, KafkaChannelConfig};

use crate::{error::RelayResult as Result, model::OutboxEvent};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub topic: String,
    /// 分区键，保证同一聚合内有序
    pub key: String,
    pub payload: Vec<u8>,
}

impl ChannelMessage {
    pub fn for_event(topic: impl Into<String>, event: &OutboxEvent) -> Self {
        Self {
            topic: topic.into(),
            key: event.aggregate_id().to_string(),
            payload: event.payload().to_vec(),
        }
    }
}

/// 消息通道：返回 `Ok` 即代表 broker 已确认
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn send(&self, message: &ChannelMessage) -> Result<()>;
}

#[async_trait]
impl<T> MessageChannel for Arc<T>
where
    T: MessageChannel + ?Sized,
{
    async fn send(&self, message: &ChannelMessage) -> Result<()> {
        (**self).send(message).await
    }
}
