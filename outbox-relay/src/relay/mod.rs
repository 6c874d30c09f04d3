//! 中继（Relay）
//!
//! 轮询器周期拉取待投递事件并交给发布器；发布任务结束后由 `Acknowledger`
//! 回写状态，转入 FAILED 的事件再交给 `DeadLetterSender`。
//! `OutboxRelay` 负责组装与启动，`RelayHandle` 负责关闭与排空。
//!
mod completion;
mod dead_letter;
mod engine;
mod poller;
mod publisher;

pub use completion::Acknowledger;
pub use dead_letter::DeadLetterSender;
pub use engine::{DrainReport, OutboxRelay, OutboxRelayBuilder, RelayHandle};
pub use poller::{Poller, TickReport};
pub use publisher::{PublishHandle, Publisher};
