//! 投递结果回写（Acknowledger）
//!
//! 每次发布结束后由发布任务调用：成功 → `mark_sent`；失败 → `record_failure`，
//! 若本次调用完成了 → FAILED 的转换，再交给死信发送。
//!
use super::dead_letter::DeadLetterSender;
use crate::clock::Clock;
use crate::error::{RelayError, RelayResult};
use crate::model::OutboxEvent;
use crate::retry::RetryPolicy;
use crate::store::{OutboxStore, Transition};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct Acknowledger {
    store: Arc<dyn OutboxStore>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    dead_letter: DeadLetterSender,
}

impl Acknowledger {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        dead_letter: DeadLetterSender,
    ) -> Self {
        Self {
            store,
            clock,
            policy,
            dead_letter,
        }
    }

    pub fn dead_letter(&self) -> &DeadLetterSender {
        &self.dead_letter
    }

    pub async fn on_success(&self, event: &OutboxEvent) -> RelayResult<Transition> {
        let result = self.store.mark_sent(event.id(), self.clock.now()).await;
        self.log_store_error(event, &result);
        let transition = result?;

        match &transition {
            Transition::Sent(sent) => info!(
                event_id = %sent.event_id(),
                aggregate_id = %sent.aggregate_id(),
                retry_count = sent.retry_count(),
                "event marked SENT"
            ),
            Transition::Unchanged(status) => debug!(
                event_id = %event.event_id(),
                %status,
                "ack ignored, event already terminal"
            ),
            _ => {}
        }
        Ok(transition)
    }

    pub async fn on_failure(&self, event: &OutboxEvent, cause: &RelayError) -> RelayResult<Transition> {
        let reason = cause.to_string();
        let result = self
            .store
            .record_failure(event.id(), &self.policy, self.clock.now(), &reason)
            .await;
        self.log_store_error(event, &result);
        let transition = result?;

        match &transition {
            Transition::Retrying(retrying) => warn!(
                event_id = %retrying.event_id(),
                aggregate_id = %retrying.aggregate_id(),
                retry_count = retrying.retry_count(),
                next_attempt_at = ?retrying.next_attempt_at(),
                error = %reason,
                "publish failed, will retry"
            ),
            Transition::Failed(failed) => {
                error!(
                    event_id = %failed.event_id(),
                    aggregate_id = %failed.aggregate_id(),
                    retry_count = failed.retry_count(),
                    error = %reason,
                    "retries exhausted, event marked FAILED"
                );
                self.dead_letter.forward(failed);
            }
            Transition::Unchanged(status) => debug!(
                event_id = %event.event_id(),
                %status,
                "failure ignored, event already terminal"
            ),
            Transition::Sent(_) => {}
        }
        Ok(transition)
    }

    fn log_store_error(&self, event: &OutboxEvent, result: &RelayResult<Transition>) {
        match result {
            Err(RelayError::NotFound { id }) => warn!(
                id,
                event_id = %event.event_id(),
                "outbox row vanished before completion"
            ),
            // 行保持 PENDING，下一轮会重新拉取（至少一次）
            Err(e) => error!(
                event_id = %event.event_id(),
                error = %e,
                "failed to record publish outcome"
            ),
            Ok(_) => {}
        }
    }
}
