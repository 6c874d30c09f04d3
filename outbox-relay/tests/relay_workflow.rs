use anyhow::Result;
use chrono::TimeDelta;
use futures_util::StreamExt;
use outbox_relay::channel::InMemoryChannel;
use outbox_relay::relay::Poller;
use outbox_relay::store::InMemoryOutboxStore;
use outbox_relay::{
    Clock, ManualClock, NewOutboxEvent, OutboxEvent, OutboxRelay, OutboxStatus, OutboxStore, RelayConfig,
    RelayError, Transition,
};
use std::sync::Arc;
use std::time::Duration;

const PRIMARY: &str = "user-scores.v1";
const DLQ: &str = "user-scores.dlq";

struct Harness {
    store: InMemoryOutboxStore,
    channel: InMemoryChannel,
    clock: ManualClock,
    poller: Poller,
}

fn harness(config: RelayConfig) -> Harness {
    let clock = ManualClock::default();
    let store = InMemoryOutboxStore::with_clock(Arc::new(clock.clone()));
    let channel = InMemoryChannel::default();
    let relay = OutboxRelay::builder()
        .store(Arc::new(store.clone()))
        .channel(Arc::new(channel.clone()))
        .clock(Arc::new(clock.clone()))
        .config(config)
        .build();
    let poller = relay.poller();
    Harness {
        store,
        channel,
        clock,
        poller,
    }
}

fn no_backoff(max_retries: u32) -> RelayConfig {
    RelayConfig {
        max_retries,
        backoff_base_ms: 0,
        ..Default::default()
    }
}

fn score_event(event_id: &str, aggregate_id: &str, runs: u32) -> NewOutboxEvent {
    NewOutboxEvent::builder()
        .event_id(event_id)
        .event_type("SCORE_CREATED")
        .aggregate_type("SCORE")
        .aggregate_id(aggregate_id)
        .payload(serde_json::to_vec(&serde_json::json!({ "runs": runs })).unwrap())
        .build()
}

/// 执行一轮并等待本轮所有发送完成
async fn tick_and_settle(poller: &Poller) -> Result<Vec<Transition>> {
    let report = poller.tick().await?;
    let mut transitions = Vec::with_capacity(report.handles.len());
    for handle in report.handles {
        transitions.push(handle.await??);
    }
    Ok(transitions)
}

async fn reload(store: &InMemoryOutboxStore, event: &OutboxEvent) -> Result<OutboxEvent> {
    store
        .get(event.id())
        .await?
        .ok_or_else(|| anyhow::anyhow!("row {} missing", event.id()))
}

#[tokio::test]
async fn successful_publish_marks_event_sent() -> Result<()> {
    let h = harness(no_backoff(5));
    let event = h.store.append(score_event("evt-a", "42", 50)).await?;

    let transitions = tick_and_settle(&h.poller).await?;
    assert_eq!(transitions.len(), 1);

    let row = reload(&h.store, &event).await?;
    assert_eq!(row.status(), OutboxStatus::Sent);
    assert_eq!(row.sent_at(), Some(h.clock.now()));
    assert_eq!(row.retry_count(), 0);

    let delivered = h.channel.delivered(PRIMARY);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].key, "42");
    let payload: serde_json::Value = serde_json::from_slice(&delivered[0].payload)?;
    assert_eq!(payload, serde_json::json!({ "runs": 50 }));

    // SENT 之后不再被拉取
    assert!(tick_and_settle(&h.poller).await?.is_empty());
    assert_eq!(h.channel.attempts(PRIMARY), 1);
    Ok(())
}

#[tokio::test]
async fn failing_broker_exhausts_retries_and_dead_letters_once() -> Result<()> {
    let h = harness(no_backoff(2));
    h.channel.fail_topic(PRIMARY);
    let event = h.store.append(score_event("evt-b", "7", 10)).await?;

    tick_and_settle(&h.poller).await?;
    let row = reload(&h.store, &event).await?;
    assert_eq!((row.status(), row.retry_count()), (OutboxStatus::Pending, 1));

    tick_and_settle(&h.poller).await?;
    let row = reload(&h.store, &event).await?;
    assert_eq!((row.status(), row.retry_count()), (OutboxStatus::Pending, 2));
    assert_eq!(h.channel.attempts(DLQ), 0);

    let transitions = tick_and_settle(&h.poller).await?;
    assert!(matches!(transitions.as_slice(), [Transition::Failed(_)]));
    let row = reload(&h.store, &event).await?;
    assert_eq!((row.status(), row.retry_count()), (OutboxStatus::Failed, 3));
    assert!(row.last_error().is_some());

    let dead_letter = h.poller.publisher().acknowledger().dead_letter();
    assert!(dead_letter.drain(Duration::from_secs(1)).await);
    assert_eq!(h.channel.attempts(DLQ), 1);
    assert_eq!(h.channel.delivered(DLQ)[0].key, "7");

    // FAILED 不再被拉取，死信也不会重复
    assert!(tick_and_settle(&h.poller).await?.is_empty());
    assert_eq!(h.channel.attempts(DLQ), 1);
    Ok(())
}

#[tokio::test]
async fn six_consecutive_failures_with_five_retries() -> Result<()> {
    let h = harness(no_backoff(5));
    h.channel.fail_topic(PRIMARY);
    let event = h.store.append(score_event("evt-6", "1", 0)).await?;

    let mut last_retry_count = 0;
    for attempt in 1..=6u32 {
        tick_and_settle(&h.poller).await?;
        let row = reload(&h.store, &event).await?;
        // retry_count 单调不减，且只在失败时增加
        assert!(row.retry_count() >= last_retry_count);
        last_retry_count = row.retry_count();
        assert_eq!(row.retry_count(), attempt);
        let expected = if attempt <= 5 {
            OutboxStatus::Pending
        } else {
            OutboxStatus::Failed
        };
        assert_eq!(row.status(), expected);
    }

    let dead_letter = h.poller.publisher().acknowledger().dead_letter();
    assert!(dead_letter.drain(Duration::from_secs(1)).await);
    assert_eq!(h.channel.attempts(PRIMARY), 6);
    assert_eq!(h.channel.attempts(DLQ), 1);
    Ok(())
}

#[tokio::test]
async fn recovery_after_transient_failure() -> Result<()> {
    let h = harness(no_backoff(5));
    h.channel.fail_next(1);
    let event = h.store.append(score_event("evt-r", "3", 4)).await?;

    tick_and_settle(&h.poller).await?;
    tick_and_settle(&h.poller).await?;

    let row = reload(&h.store, &event).await?;
    assert_eq!(row.status(), OutboxStatus::Sent);
    assert_eq!(row.retry_count(), 1);
    assert_eq!(h.channel.delivered(PRIMARY).len(), 1);
    Ok(())
}

#[tokio::test]
async fn backoff_gates_reeligibility() -> Result<()> {
    let h = harness(RelayConfig {
        max_retries: 5,
        backoff_base_ms: 1000,
        backoff_max_ms: 8000,
        ..Default::default()
    });
    h.channel.fail_next(1);
    let event = h.store.append(score_event("evt-bo", "9", 1)).await?;

    tick_and_settle(&h.poller).await?;
    let row = reload(&h.store, &event).await?;
    assert_eq!(row.retry_count(), 1);

    // 退避窗口内：不可拉取
    assert!(tick_and_settle(&h.poller).await?.is_empty());

    h.clock.advance(TimeDelta::milliseconds(1000));
    assert_eq!(tick_and_settle(&h.poller).await?.len(), 1);
    assert_eq!(reload(&h.store, &event).await?.status(), OutboxStatus::Sent);
    Ok(())
}

#[tokio::test]
async fn publish_timeout_counts_as_failure() -> Result<()> {
    let h = harness(RelayConfig {
        publish_timeout_ms: 20,
        ..no_backoff(5)
    });
    h.channel.set_latency(Some(Duration::from_millis(500)));
    let event = h.store.append(score_event("evt-t", "5", 2)).await?;

    tick_and_settle(&h.poller).await?;

    let row = reload(&h.store, &event).await?;
    assert_eq!((row.status(), row.retry_count()), (OutboxStatus::Pending, 1));
    assert!(row.last_error().unwrap_or_default().contains("timed out"));
    Ok(())
}

#[tokio::test]
async fn batch_takes_oldest_events_first() -> Result<()> {
    let h = harness(no_backoff(5));
    // created_at 由存储时钟写入，追加顺序即拉取顺序
    for i in 0..25 {
        let stored = h
            .store
            .append(score_event(&format!("evt-{i}"), &i.to_string(), 1))
            .await?;
        assert_eq!(stored.created_at(), h.clock.now());
        h.clock.advance(TimeDelta::seconds(1));
    }

    let batch = h.store.fetch_pending_batch(20, h.clock.now()).await?;
    let keys: Vec<i64> = batch
        .events()
        .iter()
        .map(|e| e.aggregate_id().parse().unwrap())
        .collect();
    assert_eq!(keys, (0..20).collect::<Vec<i64>>());
    batch.commit().await?;
    Ok(())
}

#[tokio::test]
async fn duplicate_event_id_is_rejected() -> Result<()> {
    let h = harness(no_backoff(5));
    h.store.append(score_event("evt-dup", "1", 1)).await?;

    let err = h
        .store
        .append(score_event("evt-dup", "2", 2))
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::DuplicateEvent { ref event_id } if event_id == "evt-dup"));
    assert_eq!(h.store.status_counts().await?.total(), 1);
    Ok(())
}

#[tokio::test]
async fn vanished_row_does_not_stop_the_relay() -> Result<()> {
    let h = harness(no_backoff(5));
    h.channel.set_latency(Some(Duration::from_millis(50)));
    let gone = h.store.append(score_event("evt-gone", "1", 1)).await?;
    let kept = h.store.append(score_event("evt-kept", "2", 2)).await?;

    let report = h.poller.tick().await?;
    h.store.remove(gone.id());

    let mut not_found = 0;
    for handle in report.handles {
        if let Err(RelayError::NotFound { .. }) = handle.await? {
            not_found += 1;
        }
    }
    assert_eq!(not_found, 1);
    assert_eq!(reload(&h.store, &kept).await?.status(), OutboxStatus::Sent);
    Ok(())
}

#[tokio::test]
async fn storage_outage_during_completion_leaves_event_pending() -> Result<()> {
    let h = harness(no_backoff(5));
    h.channel.set_latency(Some(Duration::from_millis(100)));
    let event = h.store.append(score_event("evt-outage", "4", 8)).await?;

    let report = h.poller.tick().await?;
    assert_eq!(report.dispatched, 1);
    // 发送尚未完成时存储宕机，回写失败
    h.store.set_available(false);
    for handle in report.handles {
        assert!(matches!(handle.await?, Err(RelayError::Storage { .. })));
    }
    assert_eq!(h.poller.publisher().in_flight(), 0);

    h.store.set_available(true);
    let row = reload(&h.store, &event).await?;
    assert_eq!((row.status(), row.retry_count()), (OutboxStatus::Pending, 0));
    assert!(row.sent_at().is_none());

    // 下一轮重新派发，消息至少投递一次
    h.channel.set_latency(None);
    let transitions = tick_and_settle(&h.poller).await?;
    assert!(matches!(transitions.as_slice(), [Transition::Sent(_)]));
    assert_eq!(h.channel.attempts(PRIMARY), 2);
    assert_eq!(reload(&h.store, &event).await?.status(), OutboxStatus::Sent);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn relay_runs_until_shutdown() -> Result<()> {
    let store = InMemoryOutboxStore::new();
    let channel = InMemoryChannel::default();
    let mut consumer = channel.subscribe();

    let handle = OutboxRelay::builder()
        .store(Arc::new(store.clone()))
        .channel(Arc::new(channel.clone()))
        .config(RelayConfig {
            poll_interval_ms: 20,
            ..no_backoff(5)
        })
        .build()
        .start()
        .await?;

    for i in 0..3 {
        store
            .append(score_event(&format!("evt-live-{i}"), &i.to_string(), i))
            .await?;
    }

    let received = tokio::time::timeout(Duration::from_secs(2), async {
        let mut keys = Vec::new();
        while keys.len() < 3 {
            match consumer.next().await {
                Some(Ok(message)) => keys.push(message.key),
                _ => break,
            }
        }
        keys
    })
    .await?;
    assert_eq!(received.len(), 3);

    handle.shutdown();
    let report = handle.join().await;
    assert!(report.is_clean());

    // 回写发生在发送确认之后，停机排空后必然可见
    let counts = store.status_counts().await?;
    assert_eq!((counts.sent, counts.pending, counts.failed), (3, 0, 0));
    Ok(())
}

#[tokio::test]
async fn shutdown_abandons_sends_past_drain_timeout() -> Result<()> {
    let store = InMemoryOutboxStore::new();
    let channel = InMemoryChannel::default();
    channel.set_latency(Some(Duration::from_secs(30)));
    let event = store.append(score_event("evt-slow", "1", 1)).await?;

    let handle = OutboxRelay::builder()
        .store(Arc::new(store.clone()))
        .channel(Arc::new(channel.clone()))
        .config(RelayConfig {
            poll_interval_ms: 1000,
            publish_timeout_ms: 60_000,
            drain_timeout_ms: 50,
            ..no_backoff(5)
        })
        .build()
        .start()
        .await?;

    // 首轮立即执行
    tokio::time::timeout(Duration::from_secs(2), async {
        while handle.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    handle.shutdown();
    let report = handle.join().await;
    assert_eq!(report.abandoned_publishes, 1);
    assert_eq!(reload(&store, &event).await?.status(), OutboxStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn start_aborts_when_verify_fails() {
    let store = InMemoryOutboxStore::new();
    store.set_available(false);

    let result = OutboxRelay::builder()
        .store(Arc::new(store))
        .channel(Arc::new(InMemoryChannel::default()))
        .build()
        .start()
        .await;

    assert!(result.is_err());
}
