use crate::error::RelayError;
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 事件状态：`Sent` 与 `Failed` 为终态，只有 `Pending` 会被再次拉取
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Sent | OutboxStatus::Failed)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "SENT" => Ok(OutboxStatus::Sent),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(RelayError::Schema {
                reason: format!("unknown outbox status: {other}"),
            }),
        }
    }
}

/// 生产方提交的新事件（与领域写入处于同一事务）
#[derive(Debug, Clone, Builder)]
pub struct NewOutboxEvent {
    /// 调用方生成的全局唯一事件 ID，消费方据此去重
    #[builder(into)]
    event_id: String,
    #[builder(into)]
    event_type: String,
    #[builder(into)]
    aggregate_type: String,
    /// 聚合 ID，同时作为消息分区键
    #[builder(into)]
    aggregate_id: String,
    /// 已序列化的负载，中继不做解析
    #[builder(into)]
    payload: Vec<u8>,
}

impl NewOutboxEvent {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// 发件箱事件记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// 存储分配的代理主键
    pub(crate) id: i64,
    pub(crate) event_id: String,
    pub(crate) event_type: String,
    pub(crate) aggregate_type: String,
    pub(crate) aggregate_id: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) status: OutboxStatus,
    /// 由存储在追加时写入，FIFO 排序键
    pub(crate) created_at: DateTime<Utc>,
    /// 每次失败 +1，从不回退
    pub(crate) retry_count: u32,
    pub(crate) last_attempt_at: Option<DateTime<Utc>>,
    /// 退避窗口结束时间，之前不会被再次拉取
    pub(crate) next_attempt_at: Option<DateTime<Utc>>,
    /// 仅在转入 SENT 时写入一次
    pub(crate) sent_at: Option<DateTime<Utc>>,
    pub(crate) last_error: Option<String>,
}

impl OutboxEvent {
    /// 以追加语义构造：PENDING、retry_count=0，`created_at` 取存储时钟
    pub(crate) fn pending(id: i64, new: NewOutboxEvent, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            event_id: new.event_id,
            event_type: new.event_type,
            aggregate_type: new.aggregate_type,
            aggregate_id: new.aggregate_id,
            payload: new.payload,
            status: OutboxStatus::Pending,
            created_at,
            retry_count: 0,
            last_attempt_at: None,
            next_attempt_at: None,
            sent_at: None,
            last_error: None,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn status(&self) -> OutboxStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.last_attempt_at
    }

    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.next_attempt_at
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.sent_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// 是否可在 `now` 被拉取
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.next_attempt_at.is_none_or(|at| at <= now)
    }
}
