//! 进行中的下载集合 (In-flight Downloads)
//!
//! 原子的测试并设置 + RAII 守卫，保证同一配置同一时刻至多一个拉取任务。

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::core::model::ConfigurationId;

/// 正在拉取的配置 ID 集合
///
/// 锁只在成员变更时短暂持有，不会跨越 await。
#[derive(Clone, Default)]
pub struct DownloadSet {
    inner: Arc<Mutex<HashSet<ConfigurationId>>>,
}

impl DownloadSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试占用 `id`，已被占用时返回 None
    pub fn try_acquire(&self, id: &ConfigurationId) -> Option<DownloadGuard> {
        if !self.inner.lock().insert(id.clone()) {
            return None;
        }
        debug!("Download slot acquired: {}", id);
        Some(DownloadGuard {
            set: self.inner.clone(),
            id: id.clone(),
        })
    }

    pub fn contains(&self, id: &ConfigurationId) -> bool {
        self.inner.lock().contains(id)
    }
}

/// 占用凭证，析构时释放 (包括 future 被丢弃或 panic)
pub struct DownloadGuard {
    set: Arc<Mutex<HashSet<ConfigurationId>>>,
    id: ConfigurationId,
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
        debug!("Download slot released: {}", self.id);
    }
}
