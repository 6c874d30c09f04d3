//! 中继配置
//!
//! 默认值与环境变量覆盖：
//!
//! | 字段 | 环境变量 | 默认 |
//! |------|----------|------|
//! | `poll_interval_ms` | `OUTBOX_POLL_INTERVAL_MS` | 2000 |
//! | `batch_size` | `OUTBOX_BATCH_SIZE` | 20 |
//! | `max_retries` | `OUTBOX_MAX_RETRIES` | 5 |
//! | `primary_topic` | `OUTBOX_PRIMARY_TOPIC` | `user-scores.v1` |
//! | `dead_letter_topic` | `OUTBOX_DEAD_LETTER_TOPIC` | `user-scores.dlq` |
//! | `publish_timeout_ms` | `OUTBOX_PUBLISH_TIMEOUT_MS` | 10000 |
//! | `backoff_base_ms` | `OUTBOX_BACKOFF_BASE_MS` | 2000（0 关闭退避） |
//! | `backoff_max_ms` | `OUTBOX_BACKOFF_MAX_MS` | 60000 |
//! | `drain_timeout_ms` | `OUTBOX_DRAIN_TIMEOUT_MS` | 30000 |
//!
use crate::error::{RelayError, RelayResult};
use crate::retry::{Backoff, RetryPolicy};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// 两轮轮询之间的间隔（上一轮结束后计时）
    pub poll_interval_ms: u64,
    /// 单轮最多拉取的事件数
    pub batch_size: usize,
    /// 最大重试次数，超过后转 FAILED
    pub max_retries: u32,
    pub primary_topic: String,
    pub dead_letter_topic: String,
    /// 单次发布超时，超时视为失败
    pub publish_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// 关闭时等待在途投递的上限
    pub drain_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            batch_size: 20,
            max_retries: 5,
            primary_topic: "user-scores.v1".to_string(),
            dead_letter_topic: "user-scores.dlq".to_string(),
            publish_timeout_ms: 10_000,
            backoff_base_ms: 2000,
            backoff_max_ms: 60_000,
            drain_timeout_ms: 30_000,
        }
    }
}

impl RelayConfig {
    /// 以默认值为基础，叠加 `OUTBOX_*` 环境变量
    pub fn from_env() -> RelayResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 以任意键值来源叠加配置（便于测试，不触碰进程环境）
    pub fn from_lookup<F>(lookup: F) -> RelayResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        override_parsed(&lookup, "OUTBOX_POLL_INTERVAL_MS", &mut config.poll_interval_ms)?;
        override_parsed(&lookup, "OUTBOX_BATCH_SIZE", &mut config.batch_size)?;
        override_parsed(&lookup, "OUTBOX_MAX_RETRIES", &mut config.max_retries)?;
        override_parsed(&lookup, "OUTBOX_PUBLISH_TIMEOUT_MS", &mut config.publish_timeout_ms)?;
        override_parsed(&lookup, "OUTBOX_BACKOFF_BASE_MS", &mut config.backoff_base_ms)?;
        override_parsed(&lookup, "OUTBOX_BACKOFF_MAX_MS", &mut config.backoff_max_ms)?;
        override_parsed(&lookup, "OUTBOX_DRAIN_TIMEOUT_MS", &mut config.drain_timeout_ms)?;

        if let Some(topic) = lookup("OUTBOX_PRIMARY_TOPIC") {
            config.primary_topic = topic;
        }
        if let Some(topic) = lookup("OUTBOX_DEAD_LETTER_TOPIC") {
            config.dead_letter_topic = topic;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RelayResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(RelayError::config("poll_interval_ms must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(RelayError::config("batch_size must be > 0"));
        }
        if self.publish_timeout_ms == 0 {
            return Err(RelayError::config("publish_timeout_ms must be > 0"));
        }
        if self.primary_topic.trim().is_empty() || self.dead_letter_topic.trim().is_empty() {
            return Err(RelayError::config("topic names must not be empty"));
        }
        if self.primary_topic == self.dead_letter_topic {
            return Err(RelayError::config(
                "dead_letter_topic must differ from primary_topic",
            ));
        }
        if self.backoff_base_ms > 0 && self.backoff_max_ms < self.backoff_base_ms {
            return Err(RelayError::config("backoff_max_ms must be >= backoff_base_ms"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = if self.backoff_base_ms == 0 {
            Backoff::None
        } else {
            Backoff::Exponential {
                base: Duration::from_millis(self.backoff_base_ms),
                max: Duration::from_millis(self.backoff_max_ms),
            }
        };
        RetryPolicy::new(self.max_retries, backoff)
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T) -> RelayResult<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| RelayError::config(format!("{key}={raw}: {e}")))?;
    }
    Ok(())
}
