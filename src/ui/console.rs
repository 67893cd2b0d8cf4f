//! 终端事件输出 (Console Event Printer)
//!
//! 订阅配置变更与隧道状态，将其转换为可读的生命周期日志。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::event::{ConfigurationEvent, EventKind, EventReceiver};
use crate::core::model::TunnelStatus;
use crate::core::store::ConfigurationStore;

pub struct Ui;

impl Ui {
    /// 激活事件监听循环，所有发送端关闭后退出
    pub fn run(receiver: EventReceiver, store: Arc<ConfigurationStore>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = receiver.recv_async().await {
                info!("{}", describe(&event, &store));
            }
        })
    }

    /// 跟踪隧道状态变化
    pub fn watch_status(mut rx: watch::Receiver<TunnelStatus>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let status = *rx.borrow_and_update();
                match status {
                    TunnelStatus::Error => warn!("🔴 Tunnel: {}", status),
                    TunnelStatus::Connected => info!("🟢 Tunnel: {}", status),
                    _ => info!("⚪ Tunnel: {}", status),
                }
            }
        })
    }
}

fn describe(event: &ConfigurationEvent, store: &ConfigurationStore) -> String {
    let name = store
        .get(&event.id)
        .map(|c| format!("\"{}\"", truncate_string(&c.alias, 30)))
        .unwrap_or_else(|_| event.id.to_string());

    match event.kind {
        EventKind::Created => format!("➕ CREATED: {}", name),
        EventKind::Updated => format!("🔄 UPDATED: {}", name),
        EventKind::Renamed => format!("✏️ RENAMED: {}", name),
        EventKind::Deleted => format!("🗑️ DELETED: {}", name),
    }
}

/// 执行语义化字符串截断
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::ConfigurationId;
    use crate::testing::remote_configuration;

    #[test]
    fn truncates_by_characters() {
        assert_eq!(truncate_string("东京节点", 10), "东京节点");
        assert_eq!(truncate_string("abcdefghij", 6), "abc...");
    }

    #[test]
    fn describes_known_and_deleted_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigurationStore::open(dir.path()).unwrap();
        let cfg = remote_configuration("Tokyo");
        store.insert(cfg.clone()).unwrap();

        let created = ConfigurationEvent::new(EventKind::Created, cfg.id.clone());
        assert_eq!(describe(&created, &store), "➕ CREATED: \"Tokyo\"");

        let gone = ConfigurationEvent::new(EventKind::Deleted, ConfigurationId::from("gone"));
        assert_eq!(describe(&gone, &store), "🗑️ DELETED: gone");
    }
}
