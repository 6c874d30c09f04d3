//! 中继统一错误定义
//!
//! 按处理方式划分：
//! - 生产方可见：`DuplicateEvent`；
//! - 本轮中止、下轮自然重试：`Storage`；
//! - 驱动重试策略、不会逃逸到轮询器：`ChannelUnavailable`、`PublishTimeout`；
//! - 记录后忽略：`NotFound`；
//! - 启动期致命：`Schema`、`Config`。
//!
use thiserror::Error;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum RelayError {
    // --- 存储 ---
    #[error("duplicate event: event_id={event_id}")]
    DuplicateEvent { event_id: String },
    #[error("storage error: {reason}")]
    Storage { reason: String },
    #[error("outbox event not found: id={id}")]
    NotFound { id: i64 },
    #[error("schema mismatch: {reason}")]
    Schema { reason: String },

    // --- 消息通道 ---
    #[error("channel unavailable: topic={topic}, reason={reason}")]
    ChannelUnavailable { topic: String, reason: String },
    #[error("publish timed out: topic={topic}, timeout_ms={timeout_ms}")]
    PublishTimeout { topic: String, timeout_ms: u64 },

    // --- 配置 ---
    #[error("invalid config: {reason}")]
    Config { reason: String },
}

impl RelayError {
    /// 投递失败类错误：交给重试策略处理
    pub fn is_publish_failure(&self) -> bool {
        matches!(
            self,
            RelayError::ChannelUnavailable { .. } | RelayError::PublishTimeout { .. }
        )
    }

    pub(crate) fn storage(reason: impl Into<String>) -> Self {
        RelayError::Storage {
            reason: reason.into(),
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        RelayError::Config {
            reason: reason.into(),
        }
    }
}

/// 统一 Result 类型别名
pub type RelayResult<T> = Result<T, RelayError>;

// 允许在 Postgres 实现中直接使用 `?` 将 sqlx 错误转换为 RelayError
#[cfg(feature = "postgres")]
impl From<sqlx::Error> for RelayError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnNotFound(column) => RelayError::Schema {
                reason: format!("missing column: {column}"),
            },
            other => RelayError::Storage {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_failures_are_classified() {
        let unavailable = RelayError::ChannelUnavailable {
            topic: "t".into(),
            reason: "down".into(),
        };
        let timeout = RelayError::PublishTimeout {
            topic: "t".into(),
            timeout_ms: 10,
        };
        assert!(unavailable.is_publish_failure());
        assert!(timeout.is_publish_failure());
        assert!(!RelayError::storage("db down").is_publish_failure());
        assert!(!RelayError::NotFound { id: 1 }.is_publish_failure());
    }

    #[test]
    fn messages_carry_context() {
        let err = RelayError::DuplicateEvent {
            event_id: "evt-1".into(),
        };
        assert_eq!(err.to_string(), "duplicate event: event_id=evt-1");
    }
}
