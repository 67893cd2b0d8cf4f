//! 隧道协调器 (Tunnel Coordinator)
//!
//! 订阅配置变更事件：当前配置被更新且隧道已连接时重启隧道，被删除时清空当前配置并停止隧道。

use std::sync::Arc;
use std::time::Duration;

use strum::Display;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::core::error::{MangoError, Result};
use crate::core::event::{ConfigurationEvent, EventKind, EventReceiver};
use crate::core::model::{Configuration, ConfigurationId, TunnelStatus};
use crate::core::selection::ActiveSelection;
use crate::core::store::ConfigurationStore;
use crate::interfaces::{Notification, NotificationSink, TunnelTransport};

/// 事件处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TunnelAction {
    /// 事件与当前配置无关
    Ignored,
    /// 当前配置变更，但隧道未连接
    Unchanged,
    Restarted,
    Stopped,
}

pub struct TunnelCoordinator {
    transport: Arc<dyn TunnelTransport>,
    selection: ActiveSelection,
    store: Arc<ConfigurationStore>,
    notifier: Option<Arc<dyn NotificationSink>>,
    quiescence_timeout: Duration,
    /// 串行化所有启停操作
    op_lock: Mutex<()>,
}

impl TunnelCoordinator {
    pub fn new(
        transport: Arc<dyn TunnelTransport>,
        selection: ActiveSelection,
        store: Arc<ConfigurationStore>,
        quiescence_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            selection,
            store,
            notifier: None,
            quiescence_timeout,
            op_lock: Mutex::new(()),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn status(&self) -> TunnelStatus {
        self.transport.status()
    }

    /// 启动事件循环，所有发送端关闭后退出
    pub fn spawn(self: Arc<Self>, receiver: EventReceiver) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = receiver.recv_async().await {
                match self.handle(&event).await {
                    Ok(action) => debug!("Event {} for {}: {}", event.kind, event.id, action),
                    Err(e) => warn!(
                        "Event {} for {} failed ({}): {}",
                        event.kind,
                        event.id,
                        e.kind(),
                        e
                    ),
                }
            }
            debug!("Tunnel coordinator stopped: event channel closed");
        })
    }

    /// 处理单个配置变更事件
    pub async fn handle(&self, event: &ConfigurationEvent) -> Result<TunnelAction> {
        match event.kind {
            EventKind::Updated => self.on_updated(&event.id).await,
            EventKind::Deleted => self.on_deleted(&event.id).await,
            EventKind::Created | EventKind::Renamed => Ok(TunnelAction::Ignored),
        }
    }

    async fn on_updated(&self, id: &ConfigurationId) -> Result<TunnelAction> {
        if !self.selection.is_active(id) {
            return Ok(TunnelAction::Ignored);
        }

        let _op = self.op_lock.lock().await;
        if self.transport.status() != TunnelStatus::Connected {
            debug!("Active configuration {} updated while tunnel is idle", id);
            return Ok(TunnelAction::Unchanged);
        }

        let refreshed = match self.store.get(id) {
            Ok(configuration) => configuration,
            Err(MangoError::NotFound(_)) => {
                debug!("Configuration {} vanished before restart", id);
                return Ok(TunnelAction::Ignored);
            }
            Err(e) => return Err(e),
        };

        info!("Restarting tunnel with updated \"{}\"", refreshed.alias);
        self.transport.stop().await;
        if let Err(e) = self.wait_quiescent().await {
            return Err(self.report(&refreshed, e));
        }
        self.start_or_stop(&refreshed).await?;
        Ok(TunnelAction::Restarted)
    }

    async fn on_deleted(&self, id: &ConfigurationId) -> Result<TunnelAction> {
        if !self.selection.clear_if(id) {
            return Ok(TunnelAction::Ignored);
        }

        let _op = self.op_lock.lock().await;
        info!("Active configuration {} deleted, stopping tunnel", id);
        self.transport.stop().await;
        Ok(TunnelAction::Stopped)
    }

    /// 选中配置 (记录必须存在)
    ///
    /// 先写入再确认记录存在：与删除交错时要么由删除事件清空，要么在此撤销，不会留下悬空引用。
    pub fn select(&self, id: &ConfigurationId) -> Result<Configuration> {
        let previous = self.selection.set(Some(id.clone()));
        match self.store.get(id) {
            Ok(configuration) => Ok(configuration),
            Err(e) => {
                self.selection.compare_and_set(Some(id), previous);
                Err(e)
            }
        }
    }

    /// 以当前配置启动隧道
    pub async fn connect(&self) -> Result<()> {
        let id = self
            .selection
            .get()
            .ok_or_else(|| MangoError::Tunnel("No active configuration selected".to_string()))?;
        let configuration = self.store.get(&id)?;

        let _op = self.op_lock.lock().await;
        info!("Connecting with \"{}\"", configuration.alias);
        self.start_or_stop(&configuration).await
    }

    pub async fn disconnect(&self) {
        let _op = self.op_lock.lock().await;
        self.transport.stop().await;
    }

    /// 启动失败时停止隧道，保证不残留半启动状态
    async fn start_or_stop(&self, configuration: &Configuration) -> Result<()> {
        match self.transport.start(configuration).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.transport.stop().await;
                Err(self.report(configuration, e))
            }
        }
    }

    async fn wait_quiescent(&self) -> Result<()> {
        let mut rx = self.transport.subscribe_status();
        timeout(self.quiescence_timeout, rx.wait_for(TunnelStatus::is_quiescent))
            .await
            .map_err(|_| {
                MangoError::Tunnel(format!(
                    "tunnel did not stop within {:?}",
                    self.quiescence_timeout
                ))
            })?
            .map(|_| ())
            .map_err(|_| MangoError::Tunnel("tunnel status channel closed".to_string()))
    }

    fn report(&self, configuration: &Configuration, e: MangoError) -> MangoError {
        let e = match e {
            MangoError::Tunnel(_) | MangoError::Context { .. } => e,
            other => MangoError::Tunnel(other.to_string()),
        }
        .with_context(&configuration.id, &configuration.alias);

        error!("Tunnel failed: {}", e);
        if let Some(notifier) = &self.notifier {
            notifier.send(Notification::new(
                "",
                "",
                format!("\"{}\"连接失败, 原因: {}", configuration.alias, e),
            ));
        }
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::core::event::EventBus;
    use crate::engine::ConfigurationListManager;
    use crate::testing::{
        RecordingNotifier, RecordingTunnel, ScriptedFetcher, TunnelCall, remote_configuration,
        sample_body,
    };
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        _dir: tempfile::TempDir,
        configuration: Configuration,
        store: Arc<ConfigurationStore>,
        selection: ActiveSelection,
        tunnel: Arc<RecordingTunnel>,
        notifier: Arc<RecordingNotifier>,
        coordinator: Arc<TunnelCoordinator>,
    }

    fn fixture(status: TunnelStatus, active: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigurationStore::open(dir.path()).unwrap());
        let configuration = remote_configuration("active");
        store.insert(configuration.clone()).unwrap();

        let tunnel = Arc::new(RecordingTunnel::new(status));
        let notifier = Arc::new(RecordingNotifier::default());
        let selection = ActiveSelection::new(active.then(|| configuration.id.clone()));
        let coordinator = Arc::new(
            TunnelCoordinator::new(
                tunnel.clone(),
                selection.clone(),
                store.clone(),
                Duration::from_millis(200),
            )
            .with_notifier(notifier.clone()),
        );

        Fixture {
            _dir: dir,
            configuration,
            store,
            selection,
            tunnel,
            notifier,
            coordinator,
        }
    }

    fn event(kind: EventKind, id: &ConfigurationId) -> ConfigurationEvent {
        ConfigurationEvent::new(kind, id.clone())
    }

    #[tokio::test]
    async fn update_of_active_connected_restarts_with_new_body() {
        let fx = fixture(TunnelStatus::Connected, true);
        let id = fx.configuration.id.clone();
        let refreshed = fx
            .store
            .modify(&id, |cfg| cfg.body = sample_body("new.example.com"))
            .unwrap();

        let action = fx.coordinator.handle(&event(EventKind::Updated, &id)).await.unwrap();

        assert_eq!(action, TunnelAction::Restarted);
        assert_eq!(fx.tunnel.calls(), [TunnelCall::Stop, TunnelCall::start(&refreshed)]);
        assert_eq!(fx.coordinator.status(), TunnelStatus::Connected);
    }

    #[tokio::test]
    async fn restart_follows_only_successful_updates() {
        let fx = fixture(TunnelStatus::Connected, true);
        let id = fx.configuration.id.clone();
        let fetcher = Arc::new(ScriptedFetcher::failing());
        let manager = ConfigurationListManager::new(fx.store.clone(), fetcher.clone());
        let handle = fx.coordinator.clone().spawn(manager.subscribe());
        let cancel = CancellationToken::new();

        let err = manager.update(&id, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);

        fetcher.respond_with(sample_body("new.example.com"));
        manager.update(&id, &cancel).await.unwrap();

        // 关闭事件通道，等待协调器处理完积压事件
        drop(manager);
        handle.await.unwrap();

        assert_eq!(
            fx.tunnel.calls(),
            [
                TunnelCall::Stop,
                TunnelCall::Start {
                    id: id.clone(),
                    address: "new.example.com".to_string(),
                },
            ]
        );
        assert_eq!(fx.coordinator.status(), TunnelStatus::Connected);
    }

    #[tokio::test]
    async fn restart_abandoned_when_tunnel_never_quiesces() {
        let fx = fixture(TunnelStatus::Connected, true);
        let id = fx.configuration.id.clone();
        fx.tunnel.hang_on_stop();

        let err = fx
            .coordinator
            .handle(&event(EventKind::Updated, &id))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Tunnel);
        assert_eq!(fx.tunnel.calls(), [TunnelCall::Stop]);
        assert_eq!(fx.coordinator.status(), TunnelStatus::Disconnecting);
        assert_eq!(fx.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn failed_restart_leaves_tunnel_disconnected() {
        let fx = fixture(TunnelStatus::Connected, true);
        let id = fx.configuration.id.clone();
        fx.tunnel.fail_next_start();

        let err = fx
            .coordinator
            .handle(&event(EventKind::Updated, &id))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Tunnel);
        assert_eq!(fx.coordinator.status(), TunnelStatus::Disconnected);
        assert_eq!(
            fx.tunnel.calls(),
            [
                TunnelCall::Stop,
                TunnelCall::start(&fx.configuration),
                TunnelCall::Stop
            ]
        );
        assert_eq!(fx.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn update_while_disconnected_does_not_start() {
        let fx = fixture(TunnelStatus::Disconnected, true);
        let action = fx
            .coordinator
            .handle(&event(EventKind::Updated, &fx.configuration.id))
            .await
            .unwrap();

        assert_eq!(action, TunnelAction::Unchanged);
        assert!(fx.tunnel.calls().is_empty());
    }

    #[tokio::test]
    async fn events_for_other_ids_are_ignored() {
        let fx = fixture(TunnelStatus::Connected, true);
        let other = ConfigurationId::from("other");

        for kind in [EventKind::Updated, EventKind::Deleted, EventKind::Renamed] {
            let action = fx.coordinator.handle(&event(kind, &other)).await.unwrap();
            assert_eq!(action, TunnelAction::Ignored);
        }
        assert!(fx.tunnel.calls().is_empty());
        assert!(fx.selection.is_active(&fx.configuration.id));
    }

    #[tokio::test]
    async fn delete_of_active_clears_and_stops_even_when_idle() {
        let fx = fixture(TunnelStatus::Disconnected, true);
        let id = fx.configuration.id.clone();

        let action = fx.coordinator.handle(&event(EventKind::Deleted, &id)).await.unwrap();

        assert_eq!(action, TunnelAction::Stopped);
        assert_eq!(fx.selection.get(), None);
        assert_eq!(fx.tunnel.calls(), [TunnelCall::Stop]);
    }

    #[tokio::test]
    async fn spawned_loop_consumes_bus_events() {
        let fx = fixture(TunnelStatus::Connected, true);
        let bus = EventBus::new();
        let handle = fx.coordinator.clone().spawn(bus.subscribe());

        bus.emit(event(EventKind::Deleted, &fx.configuration.id));
        drop(bus);
        handle.await.unwrap();

        assert_eq!(fx.selection.get(), None);
        assert_eq!(fx.tunnel.calls(), [TunnelCall::Stop]);
    }

    #[tokio::test]
    async fn connect_requires_selection() {
        let fx = fixture(TunnelStatus::Disconnected, false);
        assert_eq!(fx.coordinator.connect().await.unwrap_err().kind(), ErrorKind::Tunnel);

        let missing = ConfigurationId::from("missing");
        assert_eq!(fx.coordinator.select(&missing).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(fx.selection.get(), None);

        fx.coordinator.select(&fx.configuration.id).unwrap();
        fx.coordinator.connect().await.unwrap();
        assert_eq!(fx.coordinator.status(), TunnelStatus::Connected);

        fx.coordinator.disconnect().await;
        assert_eq!(
            fx.tunnel.calls(),
            [TunnelCall::start(&fx.configuration), TunnelCall::Stop]
        );
    }

    #[tokio::test]
    async fn select_of_removed_record_restores_previous_reference() {
        let fx = fixture(TunnelStatus::Disconnected, true);
        let removed = remote_configuration("removed");
        fx.store.insert(removed.clone()).unwrap();
        fx.store.remove(&removed.id).unwrap();

        let err = fx.coordinator.select(&removed.id).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(fx.selection.get(), Some(fx.configuration.id.clone()));
    }
}
