//! 事件系统定义
//!
//! 配置变更通知：显式注册订阅者 (UI / 隧道协调器)，在存储写入完成后投递。

use std::sync::Arc;

use flume::{Receiver, Sender};
use parking_lot::Mutex;
use strum::Display;
use tracing::debug;

use crate::core::model::ConfigurationId;

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    Created,
    Updated,
    Renamed,
    Deleted,
}

/// 配置变更事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationEvent {
    pub kind: EventKind,
    pub id: ConfigurationId,
}

impl ConfigurationEvent {
    pub fn new(kind: EventKind, id: ConfigurationId) -> Self {
        Self { kind, id }
    }
}

/// 事件接收器
pub struct EventReceiver {
    rx: Receiver<ConfigurationEvent>,
}

impl EventReceiver {
    pub fn new(rx: Receiver<ConfigurationEvent>) -> Self {
        Self { rx }
    }

    /// 非阻塞接收事件
    #[cfg(test)]
    pub fn try_recv(&self) -> Option<ConfigurationEvent> {
        self.rx.try_recv().ok()
    }

    /// 异步接收事件，所有发送端关闭后返回 None
    pub async fn recv_async(&self) -> Option<ConfigurationEvent> {
        self.rx.recv_async().await.ok()
    }

    /// 取出当前已排队的全部事件
    #[cfg(test)]
    pub fn drain(&self) -> Vec<ConfigurationEvent> {
        self.rx.drain().collect()
    }
}

/// 事件总线
///
/// 每个订阅者独占一条无界通道；已丢弃的订阅者在下一次投递时被清理。
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<ConfigurationEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册新的订阅者
    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        EventReceiver::new(rx)
    }

    /// 向所有订阅者投递事件
    pub fn emit(&self, event: ConfigurationEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        debug!(
            "Event {} for {} delivered to {} subscriber(s)",
            event.kind,
            event.id,
            subscribers.len()
        );
    }
}
