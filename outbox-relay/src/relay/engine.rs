//! 中继引擎（OutboxRelay）
//!
//! 组装存储、通道、时钟与配置，启动长驻轮询任务并返回 `RelayHandle`：
//! - 启动前校验配置并调用 `OutboxStore::verify`，失败即返回错误；
//! - `shutdown()` 停止新的轮询并打断仍在等待批次锁的拉取；`join()` 等待轮询任务退出后，在 `drain_timeout`
//!   内排空在途发送与死信发送，超时未完成的发送被放弃（事件保持 PENDING）。
//!
use super::completion::Acknowledger;
use super::dead_letter::DeadLetterSender;
use super::poller::Poller;
use super::publisher::Publisher;
use crate::channel::MessageChannel;
use crate::clock::{Clock, SystemClock};
use crate::config::RelayConfig;
use crate::error::RelayResult;
use crate::store::OutboxStore;
use bon::Builder;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

#[derive(Builder)]
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    /// 主通道
    channel: Arc<dyn MessageChannel>,
    /// 死信通道，缺省复用主通道
    dead_letter_channel: Option<Arc<dyn MessageChannel>>,
    #[builder(default = system_clock())]
    clock: Arc<dyn Clock>,
    #[builder(default)]
    config: RelayConfig,
}

impl OutboxRelay {
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// 组装一条独立的投递流水线（轮询器、发布器、回写与死信）
    ///
    /// 每次调用得到各自的在途集合与任务追踪器；`start` 内部也经由此方法组装。
    pub fn poller(&self) -> Poller {
        let timeout = self.config.publish_timeout();
        let dead_letter = DeadLetterSender::new(
            self.dead_letter_channel
                .clone()
                .unwrap_or_else(|| self.channel.clone()),
            &self.config.dead_letter_topic,
            timeout,
        );
        let acknowledger = Acknowledger::new(
            self.store.clone(),
            self.clock.clone(),
            self.config.retry_policy(),
            dead_letter,
        );
        let publisher = Publisher::new(
            self.channel.clone(),
            &self.config.primary_topic,
            timeout,
            acknowledger,
        );
        Poller::new(
            self.store.clone(),
            publisher,
            self.clock.clone(),
            self.config.batch_size,
        )
    }

    /// 启动中继，返回可用于关闭/等待的句柄
    pub async fn start(self) -> RelayResult<RelayHandle> {
        self.config.validate()?;
        self.store.verify().await?;

        let poller = self.poller();
        let token = CancellationToken::new();
        let poll_task = tokio::spawn(
            poller
                .clone()
                .run(token.clone(), self.config.poll_interval()),
        );

        info!(
            primary_topic = %self.config.primary_topic,
            dead_letter_topic = %self.config.dead_letter_topic,
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            "outbox relay started"
        );

        Ok(RelayHandle {
            token,
            poll_task: Some(poll_task),
            poller,
            drain_timeout: self.config.drain_timeout(),
        })
    }
}

/// 关闭结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// 超时后被放弃的主通道发送数
    pub abandoned_publishes: usize,
    /// 超时后被放弃的死信发送数
    pub abandoned_dead_letters: usize,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned_publishes == 0 && self.abandoned_dead_letters == 0
    }
}

/// 中继运行句柄：用于优雅关闭与等待任务结束
pub struct RelayHandle {
    token: CancellationToken,
    poll_task: Option<JoinHandle<()>>,
    poller: Poller,
    drain_timeout: Duration,
}

impl RelayHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 当前在途的主通道发送数
    pub fn in_flight(&self) -> usize {
        self.poller.publisher().in_flight()
    }

    pub async fn join(mut self) -> DrainReport {
        if let Some(task) = self.poll_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "poll task ended abnormally");
            }
        }

        let deadline = Instant::now() + self.drain_timeout;
        let publisher = self.poller.publisher();
        let dead_letter = publisher.acknowledger().dead_letter();

        // 先排空主通道发送：其完成回调可能产生新的死信发送
        let mut report = DrainReport::default();
        if !publisher.drain(remaining(deadline)).await {
            report.abandoned_publishes = publisher.in_flight();
        }
        if !dead_letter.drain(remaining(deadline)).await {
            report.abandoned_dead_letters = dead_letter.in_flight();
        }

        if report.is_clean() {
            info!("outbox relay stopped");
        } else {
            warn!(
                abandoned_publishes = report.abandoned_publishes,
                abandoned_dead_letters = report.abandoned_dead_letters,
                "drain timeout elapsed, abandoned sends stay PENDING"
            );
        }
        report
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryChannel;
    use crate::error::RelayError;
    use crate::model::NewOutboxEvent;
    use crate::store::InMemoryOutboxStore;
    use std::time::Duration;

    fn fast_config() -> RelayConfig {
        RelayConfig {
            poll_interval_ms: 20,
            backoff_base_ms: 0,
            drain_timeout_ms: 1000,
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn engine_delivers_then_drains_on_shutdown() {
        let store = InMemoryOutboxStore::new();
        let channel = InMemoryChannel::default();
        store
            .append(
                NewOutboxEvent::builder()
                    .event_id("evt-1")
                    .event_type("SCORE_CREATED")
                    .aggregate_type("SCORE")
                    .aggregate_id("42")
                    .payload(r#"{"runs":50}"#)
                    .build(),
            )
            .await
            .unwrap();

        let handle = OutboxRelay::builder()
            .store(Arc::new(store.clone()))
            .channel(Arc::new(channel.clone()))
            .config(fast_config())
            .build()
            .start()
            .await
            .unwrap();

        // 使用 timeout + 条件轮询，减少固定 sleep 的脆弱性
        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            while store.status_counts().await.unwrap().sent < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        handle.shutdown();
        let report = handle.join().await;

        assert!(report.is_clean());
        assert_eq!(store.status_counts().await.unwrap().sent, 1);
        assert_eq!(channel.delivered("user-scores.v1").len(), 1);
    }

    #[tokio::test]
    async fn shutdown_interrupts_fetch_waiting_on_batch_lock() {
        let store = InMemoryOutboxStore::new();
        // 另一实例持有批次锁，轮询任务的拉取会一直等待
        let held = store
            .fetch_pending_batch(10, chrono::Utc::now())
            .await
            .unwrap();

        let handle = OutboxRelay::builder()
            .store(Arc::new(store.clone()))
            .channel(Arc::new(InMemoryChannel::default()))
            .config(fast_config())
            .build()
            .start()
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        handle.shutdown();
        let report = tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .expect("join must not wait for the held batch lock");
        assert!(report.is_clean());
        held.commit().await.unwrap();
    }

    #[tokio::test]
    async fn start_fails_when_store_is_unreachable() {
        let store = InMemoryOutboxStore::new();
        store.set_available(false);

        let result = OutboxRelay::builder()
            .store(Arc::new(store))
            .channel(Arc::new(InMemoryChannel::default()))
            .build()
            .start()
            .await;

        assert!(matches!(result, Err(RelayError::Storage { .. })));
    }

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let result = OutboxRelay::builder()
            .store(Arc::new(InMemoryOutboxStore::new()))
            .channel(Arc::new(InMemoryChannel::default()))
            .config(RelayConfig {
                batch_size: 0,
                ..Default::default()
            })
            .build()
            .start()
            .await;

        assert!(matches!(result, Err(RelayError::Config { .. })));
    }
}
