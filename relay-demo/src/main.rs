//! 发件箱中继演示
//!
//! 模拟记分服务：每记录一条比分，同时追加一条 `SCORE_CREATED` 发件箱事件；
//! 中继以内存存储与偶发故障的内存通道运行，消费者订阅主题并打印收到的消息。
//!
//! 环境变量：`RELAY_LOG`（日志过滤，默认 `info`）、`RELAY_LOG_JSON=1`（JSON 输出）、
//! `DEMO_RUN_SECS`（运行时长，默认 20 秒），以及 `OUTBOX_*` 中继配置。
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use outbox_relay::channel::InMemoryChannel;
use outbox_relay::store::InMemoryOutboxStore;
use outbox_relay::{NewOutboxEvent, OutboxRelay, OutboxStore, RelayConfig};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let filter = EnvFilter::try_from_env("RELAY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("RELAY_LOG_JSON").is_ok_and(|v| v == "1");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[derive(Debug, Serialize)]
struct ScoreCreated<'a> {
    #[serde(rename = "eventId")]
    event_id: &'a str,
    score: u32,
    #[serde(rename = "match")]
    match_name: &'a str,
    result: &'a str,
    user: &'a str,
    #[serde(rename = "recordedAt")]
    recorded_at: DateTime<Utc>,
}

/// 记分服务：比分写入与发件箱追加位于同一“事务”
struct ScoreService {
    outbox: Arc<dyn OutboxStore>,
    next_score_id: u64,
}

impl ScoreService {
    async fn add_score(&mut self, user: &str, runs: u32, match_name: &str, result: &str) -> Result<()> {
        self.next_score_id += 1;
        let score_id = self.next_score_id;
        let event_id = uuid::Uuid::new_v4().to_string();

        let payload = serde_json::to_vec(&ScoreCreated {
            event_id: &event_id,
            score: runs,
            match_name,
            result,
            user,
            recorded_at: Utc::now(),
        })?;

        let event = NewOutboxEvent::builder()
            .event_id(event_id)
            .event_type("SCORE_CREATED")
            .aggregate_type("SCORE")
            .aggregate_id(score_id.to_string())
            .payload(payload)
            .build();
        self.outbox.append(event).await?;

        info!(score_id, user, runs, "score recorded");
        Ok(())
    }
}

fn run_duration() -> Duration {
    std::env::var("DEMO_RUN_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(20))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = RelayConfig::from_env()?;
    let primary_topic = config.primary_topic.clone();

    let store = InMemoryOutboxStore::new();
    let channel = InMemoryChannel::default();

    // 消费者：打印主题上的消息
    let mut stream = channel.subscribe();
    let consumer_topic = primary_topic.clone();
    let consumer = tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(message) if message.topic == consumer_topic => info!(
                    key = %message.key,
                    payload = %String::from_utf8_lossy(&message.payload),
                    "consumer received score"
                ),
                Ok(message) => warn!(topic = %message.topic, key = %message.key, "consumer saw dead letter"),
                Err(e) => warn!(error = %e, "consumer lagged"),
            }
        }
    });

    let handle = OutboxRelay::builder()
        .store(Arc::new(store.clone()))
        .channel(Arc::new(channel.clone()))
        .config(config)
        .build()
        .start()
        .await?;

    let mut scores = ScoreService {
        outbox: Arc::new(store.clone()),
        next_score_id: 0,
    };
    let plays = [
        ("alice", 50, "IND vs AUS", "WON"),
        ("bob", 12, "ENG vs NZ", "LOST"),
        ("alice", 101, "IND vs SA", "WON"),
        ("carol", 0, "PAK vs SL", "DRAW"),
        ("bob", 77, "ENG vs WI", "WON"),
    ];

    let producer = async {
        for (i, (user, runs, match_name, result)) in plays.iter().cycle().enumerate() {
            // 间歇性 broker 故障
            if i % 4 == 2 {
                channel.fail_next(2);
            }
            scores.add_score(user, *runs, match_name, result).await?;
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        Ok::<(), anyhow::Error>(())
    };

    tokio::select! {
        result = producer => result?,
        _ = tokio::signal::ctrl_c() => info!("ctrl-c received"),
        _ = tokio::time::sleep(run_duration()) => info!("demo run time elapsed"),
    }

    handle.shutdown();
    let report = handle.join().await;
    consumer.abort();

    let counts = store.status_counts().await?;
    info!(
        pending = counts.pending,
        sent = counts.sent,
        failed = counts.failed,
        delivered = channel.delivered(&primary_topic).len(),
        clean_shutdown = report.is_clean(),
        "demo finished"
    );
    Ok(())
}
