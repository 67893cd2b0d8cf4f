//! 配置列表管理器 (Configuration List Manager)
//!
//! 所有变更操作的唯一入口：负责按 ID 串行化下载、写入存储，并在写入落盘后广播变更事件。

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::core::error::{MangoError, Result};
use crate::core::event::{ConfigurationEvent, EventBus, EventKind, EventReceiver};
use crate::core::form::FormInput;
use crate::core::model::{Configuration, ConfigurationId, ProtocolType, Source};
use crate::core::store::ConfigurationStore;
use crate::engine::DownloadSet;
use crate::interfaces::{Notification, NotificationSink};
use crate::network::SubscriptionFetcher;
use crate::utils::format::ParsedBody;

/// 配置列表管理器
pub struct ConfigurationListManager {
    store: Arc<ConfigurationStore>,
    fetcher: Arc<dyn SubscriptionFetcher>,
    downloads: DownloadSet,
    events: EventBus,
    notifier: Option<Arc<dyn NotificationSink>>,
}

impl ConfigurationListManager {
    pub fn new(store: Arc<ConfigurationStore>, fetcher: Arc<dyn SubscriptionFetcher>) -> Self {
        Self {
            store,
            fetcher,
            downloads: DownloadSet::new(),
            events: EventBus::new(),
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn store(&self) -> &Arc<ConfigurationStore> {
        &self.store
    }

    // --- Queries ---

    pub fn list(&self) -> Vec<Configuration> {
        self.store.list()
    }

    pub fn get(&self, id: &ConfigurationId) -> Result<Configuration> {
        self.store.get(id)
    }

    pub fn is_downloading(&self, id: &ConfigurationId) -> bool {
        self.downloads.contains(id)
    }

    /// 注册变更订阅者
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    // --- Mutations ---

    /// 由表单手动创建配置 (不涉及网络)
    pub fn create(&self, protocol_type: ProtocolType, form: &FormInput) -> Result<Configuration> {
        let body = form.build(protocol_type);
        body.validate()?;

        let id = ConfigurationId::generate();
        let source = form
            .source
            .clone()
            .unwrap_or_else(|| Source::Local(self.store.record_path(&id)));

        let configuration = Configuration::builder()
            .id(id)
            .alias(form.alias(protocol_type))
            .source(source)
            .body(body)
            .build();
        self.insert(configuration)
    }

    /// 从远程订阅导入
    pub async fn import_remote(
        &self,
        url: Url,
        cancel: &CancellationToken,
    ) -> Result<Configuration> {
        self.import(Source::Remote(url), cancel).await
    }

    /// 从本地文件导入
    pub async fn import_local(
        &self,
        path: PathBuf,
        cancel: &CancellationToken,
    ) -> Result<Configuration> {
        self.import(Source::Local(path), cancel).await
    }

    async fn import(&self, source: Source, cancel: &CancellationToken) -> Result<Configuration> {
        let ParsedBody {
            body, alias_hint, ..
        } = self.fetcher.fetch(&source, cancel).await?;

        let alias = alias_hint
            .or_else(|| default_alias(&source))
            .unwrap_or_else(|| body.protocol_type().to_string());

        let configuration = Configuration::builder()
            .alias(alias)
            .source(source)
            .body(body)
            .build();
        self.insert(configuration)
    }

    fn insert(&self, configuration: Configuration) -> Result<Configuration> {
        self.store.insert(configuration.clone())?;
        info!(
            "Created configuration \"{}\" ({})",
            configuration.alias, configuration.id
        );
        self.events
            .emit(ConfigurationEvent::new(EventKind::Created, configuration.id.clone()));
        Ok(configuration)
    }

    /// 重新拉取远程订阅并替换配置负载
    ///
    /// 同一 ID 同时只允许一个下载；失败或取消时存储保持不变。
    pub async fn update(
        &self,
        id: &ConfigurationId,
        cancel: &CancellationToken,
    ) -> Result<Configuration> {
        let current = self.store.get(id)?;

        match self.refresh(&current, cancel).await {
            Ok(updated) => {
                self.notify(format!("\"{}\"更新成功", updated.alias));
                Ok(updated)
            }
            Err(e) => {
                warn!("Update failed for \"{}\" ({}): {}", current.alias, id, e);
                self.notify(format!("\"{}\"更新失败, 原因: {}", current.alias, e));
                Err(e.with_context(id, &current.alias))
            }
        }
    }

    async fn refresh(
        &self,
        current: &Configuration,
        cancel: &CancellationToken,
    ) -> Result<Configuration> {
        let id = &current.id;
        if current.source.is_file_url() {
            return Err(MangoError::UnsupportedSource(id.clone()));
        }

        // 删除流程也会短暂占用下载槽，此时记录已不存在
        let guard = self.downloads.try_acquire(id).ok_or_else(|| {
            if self.store.contains(id) {
                MangoError::AlreadyInProgress(id.clone())
            } else {
                MangoError::NotFound(id.clone())
            }
        })?;

        let parsed = self.fetcher.fetch(&current.source, cancel).await?;

        // 别名与来源以写入时刻为准，保留并发的重命名
        let updated = self.store.modify(id, |cfg| {
            cfg.body = parsed.body;
            cfg.least_updated = Utc::now();
        })?;
        drop(guard);

        info!("Updated configuration \"{}\" ({})", updated.alias, id);
        self.events
            .emit(ConfigurationEvent::new(EventKind::Updated, id.clone()));
        Ok(updated)
    }

    /// 重命名，名称去除首尾空白后不得为空或与当前相同
    pub fn rename(&self, id: &ConfigurationId, name: &str) -> Result<Configuration> {
        let result = self.rename_inner(id, name);
        if let Err(e) = &result {
            self.notify(format!("重命名失败, 原因: {}", e));
        }
        result.map_err(|e| self.annotate(id, e))
    }

    fn rename_inner(&self, id: &ConfigurationId, name: &str) -> Result<Configuration> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MangoError::InvalidName(name.to_string()));
        }
        if self.store.get(id)?.alias == name {
            return Err(MangoError::InvalidName(name.to_string()));
        }

        let updated = self.store.modify(id, |cfg| cfg.alias = name.to_string())?;
        info!("Renamed configuration {} to \"{}\"", id, updated.alias);
        self.events
            .emit(ConfigurationEvent::new(EventKind::Renamed, id.clone()));
        Ok(updated)
    }

    /// 删除配置，下载进行中时拒绝 (`InUse`)
    ///
    /// 删除期间占用该 ID 的下载槽，`is_downloading` 在此窗口内同样为真。
    pub fn delete(&self, id: &ConfigurationId) -> Result<Configuration> {
        let alias = self.store.get(id).map(|c| c.alias).ok();

        let result = self
            .downloads
            .try_acquire(id)
            .ok_or_else(|| MangoError::InUse(id.clone()))
            .and_then(|_guard| self.store.remove(id));

        match result {
            Ok(removed) => {
                info!("Deleted configuration \"{}\" ({})", removed.alias, id);
                self.events
                    .emit(ConfigurationEvent::new(EventKind::Deleted, id.clone()));
                self.notify(format!("\"{}\"删除成功", removed.alias));
                Ok(removed)
            }
            Err(e) => match alias {
                Some(alias) => {
                    self.notify(format!("\"{}\"删除失败, 原因: {}", alias, e));
                    Err(e.with_context(id, &alias))
                }
                None => Err(e),
            },
        }
    }

    fn annotate(&self, id: &ConfigurationId, error: MangoError) -> MangoError {
        match self.store.get(id) {
            Ok(configuration) => error.with_context(id, &configuration.alias),
            Err(_) => error,
        }
    }

    fn notify(&self, body: String) {
        if let Some(notifier) = &self.notifier {
            notifier.send(Notification::new("", "", body));
        }
    }
}

/// 来源推导的默认别名：URL 主机名或文件名
fn default_alias(source: &Source) -> Option<String> {
    match source {
        Source::Remote(url) => url.host_str().map(String::from),
        Source::Local(path) => path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(String::from),
    }
}
