//! Kafka 消息通道（`kafka` 特性）
//!
//! 幂等生产者、`acks=all`；消息键为聚合 ID，保证同一聚合在分区内有序。
//! `send` 在 broker 确认（或 librdkafka 投递超时）后返回。
//!
use super::{ChannelMessage, MessageChannel};
use crate::error::{RelayError, RelayResult as Result};
use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct KafkaChannelConfig {
    /// 逗号分隔的 broker 列表
    pub bootstrap_servers: String,
    /// librdkafka 内部的投递超时（`message.timeout.ms`）
    pub message_timeout: Duration,
    /// 本地发送队列已满时的等待上限
    pub queue_timeout: Duration,
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
}

impl KafkaChannelConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            message_timeout: Duration::from_secs(10),
            queue_timeout: Duration::from_secs(1),
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
        }
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self.sasl_mechanism = Some(mechanism.into());
        self.security_protocol = Some("SASL_SSL".to_string());
        self
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set(
            "message.timeout.ms",
            self.message_timeout.as_millis().to_string(),
        );
        config.set("acks", "all");
        config.set("enable.idempotence", "true");

        let optional = [
            ("security.protocol", &self.security_protocol),
            ("sasl.mechanism", &self.sasl_mechanism),
            ("sasl.username", &self.sasl_username),
            ("sasl.password", &self.sasl_password),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                config.set(key, value);
            }
        }
        config
    }
}

pub struct KafkaChannel {
    producer: FutureProducer,
    config: KafkaChannelConfig,
}

impl KafkaChannel {
    pub fn new(config: KafkaChannelConfig) -> Result<Self> {
        let producer: FutureProducer =
            config
                .client_config()
                .create()
                .map_err(|e| RelayError::ChannelUnavailable {
                    topic: "*".to_string(),
                    reason: format!("failed to create kafka producer: {e}"),
                })?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            "kafka producer created"
        );
        Ok(Self { producer, config })
    }
}

#[async_trait]
impl MessageChannel for KafkaChannel {
    async fn send(&self, message: &ChannelMessage) -> Result<()> {
        let record = FutureRecord::to(&message.topic)
            .key(&message.key)
            .payload(&message.payload);

        let (partition, offset) = self
            .producer
            .send(record, self.config.queue_timeout)
            .await
            .map_err(|(e, _)| RelayError::ChannelUnavailable {
                topic: message.topic.clone(),
                reason: e.to_string(),
            })?;

        debug!(
            topic = %message.topic,
            key = %message.key,
            partition,
            offset,
            "message acknowledged by kafka"
        );
        Ok(())
    }
}
