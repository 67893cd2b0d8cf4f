//! 当前配置指针 (Active Configuration Reference)
//!
//! 以 `tokio::sync::watch` 保存当前选中的配置，所有依赖旧值的写入均为比较并交换。

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::core::model::ConfigurationId;

/// 当前配置共享单元
///
/// 写入方：用户选择 (UI) 与删除流程 (隧道协调器)。
#[derive(Clone)]
pub struct ActiveSelection {
    tx: Arc<watch::Sender<Option<ConfigurationId>>>,
}

impl Default for ActiveSelection {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ActiveSelection {
    pub fn new(initial: Option<ConfigurationId>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> Option<ConfigurationId> {
        self.tx.borrow().clone()
    }

    pub fn is_active(&self, id: &ConfigurationId) -> bool {
        self.tx.borrow().as_ref() == Some(id)
    }

    /// 无条件写入，返回旧值
    pub fn set(&self, id: Option<ConfigurationId>) -> Option<ConfigurationId> {
        let previous = self.tx.send_replace(id.clone());
        if previous != id {
            info!("Active configuration: {:?} -> {:?}", previous, id);
        }
        previous
    }

    /// 比较并交换：仅当当前值等于 `expected` 时写入 `new`
    pub fn compare_and_set(
        &self,
        expected: Option<&ConfigurationId>,
        new: Option<ConfigurationId>,
    ) -> bool {
        let swapped = self.tx.send_if_modified(|current| {
            if current.as_ref() != expected {
                return false;
            }
            if *current == new {
                return false;
            }
            *current = new.clone();
            true
        });

        if swapped {
            info!("Active configuration: {:?} -> {:?}", expected, new);
        } else {
            debug!("Active configuration unchanged (expected {:?})", expected);
        }
        swapped
    }

    /// 仅当当前值仍为 `id` 时清空
    pub fn clear_if(&self, id: &ConfigurationId) -> bool {
        self.compare_and_set(Some(id), None)
    }
}
