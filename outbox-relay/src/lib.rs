//! 事务性发件箱中继（outbox-relay）
//!
//! 解决“双写”问题：业务写入与消息通知无法在同一事务中提交时，
//! 由业务事务同时写入一条发件箱事件（`model::OutboxEvent`），再由本 crate 的中继
//! 异步、至少一次地投递到消息通道：
//! - `store`：发件箱事件表的追加/批量拉取（带阻塞锁）/状态更新；
//! - `channel`：消息通道协议及内存、Kafka 实现；
//! - `retry`：失败重试的纯决策函数与退避策略；
//! - `relay`：轮询器、发布器、确认回调、死信发送与运行句柄；
//! - `config`/`clock`/`error`：配置、可注入时钟与统一错误类型。
//!
//! 典型用法：
//! 1. 业务代码在同一事务内完成领域写入并调用 `OutboxStore::append`；
//! 2. 进程启动时通过 `OutboxRelay::builder()` 注入存储、通道、时钟与配置；
//! 3. `start()` 返回 `RelayHandle`，退出前调用 `shutdown()` 与 `join()` 排空在途投递。
//!
pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod model;
pub mod relay;
pub mod retry;
pub mod store;

pub use channel::{ChannelMessage, MessageChannel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use model::{NewOutboxEvent, OutboxEvent, OutboxStatus};
pub use relay::{DrainReport, OutboxRelay, RelayHandle, TickReport};
pub use retry::{Backoff, RetryDecision, RetryPolicy};
pub use store::{OutboxStore, PendingBatch, StatusCounts, Transition};
