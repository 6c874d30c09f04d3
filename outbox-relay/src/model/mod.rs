//! 发件箱数据模型
//!
//! `OutboxEvent` 为存储返回的不可变记录；`NewOutboxEvent` 为生产方在业务事务内
//! 追加时提交的输入。
//!
mod outbox_event;

pub use outbox_event::{NewOutboxEvent, OutboxEvent, OutboxStatus};
