//! 重试策略（RetryPolicy）
//!
//! 纯决策函数：根据当前失败次数给出下一状态。
//! - `PENDING(n)` 失败且 `n+1 <= max_retries` → `PENDING(n+1)`，在退避窗口后重新可拉取；
//! - `PENDING(n)` 失败且 `n+1 > max_retries` → `FAILED`（主通道终态，随后转死信）。
//!
//! `Backoff::None` 等价于“下一轮轮询即重试”。
//!
use crate::model::{OutboxEvent, OutboxStatus};
use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    Fixed(Duration),
    /// base * 2^(n-1)，上限 max
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// 第 `retry_count` 次失败后的等待时长（retry_count 从 1 开始）
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential { base, max } => {
                let exp = retry_count.saturating_sub(1).min(31);
                base.saturating_mul(1u32 << exp).min(*max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 保持 PENDING，`delay` 后可再次投递
    Retry { retry_count: u32, delay: Duration },
    /// 重试预算耗尽，转入 FAILED
    Exhausted { retry_count: u32 },
}

impl RetryDecision {
    pub fn retry_count(&self) -> u32 {
        match self {
            RetryDecision::Retry { retry_count, .. } | RetryDecision::Exhausted { retry_count } => {
                *retry_count
            }
        }
    }

    pub fn status(&self) -> OutboxStatus {
        match self {
            RetryDecision::Retry { .. } => OutboxStatus::Pending,
            RetryDecision::Exhausted { .. } => OutboxStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// 无退避：失败事件在下一轮轮询即重新可拉取
    pub fn without_backoff(max_retries: u32) -> Self {
        Self::new(max_retries, Backoff::None)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn on_failure(&self, retry_count: u32) -> RetryDecision {
        let next = retry_count.saturating_add(1);
        if next > self.max_retries {
            RetryDecision::Exhausted { retry_count: next }
        } else {
            RetryDecision::Retry {
                retry_count: next,
                delay: self.backoff.delay_for(next),
            }
        }
    }

    /// 将一次失败写入记录（存储层在行锁/互斥内调用，保证读-改-写原子）
    pub(crate) fn apply_failure(
        &self,
        event: &mut OutboxEvent,
        now: DateTime<Utc>,
        reason: &str,
    ) -> RetryDecision {
        let decision = self.on_failure(event.retry_count);

        event.retry_count = decision.retry_count();
        event.last_attempt_at = Some(now);
        event.last_error = Some(reason.to_string());
        event.status = decision.status();
        event.next_attempt_at = match decision {
            RetryDecision::Retry { delay, .. } => Some(eligible_at(now, delay)),
            RetryDecision::Exhausted { .. } => None,
        };

        decision
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            5,
            Backoff::Exponential {
                base: Duration::from_secs(2),
                max: Duration::from_secs(60),
            },
        )
    }
}

fn eligible_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
