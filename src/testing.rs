//! 测试辅助：样例配置与各 Trait 的记录型替身

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::error::{MangoError, Result};
use crate::core::model::{
    Body, Configuration, ConfigurationId, Outbound, Security, Source, TlsSettings, Transport,
    TunnelStatus, Vless, WsSettings,
};
use crate::interfaces::{Notification, NotificationSink, TunnelTransport};
use crate::network::SubscriptionFetcher;
use crate::utils::format::{ParsedBody, PayloadFormat};

pub fn sample_body(address: &str) -> Body {
    Body {
        protocol: Outbound::Vless(Vless {
            address: address.to_string(),
            port: 443,
            id: "b831381d-6324-4d53-ad4f-8cda48b30811".to_string(),
            ..Default::default()
        }),
        transport: Some(Transport::Ws(WsSettings {
            path: "/ws".to_string(),
            host: address.to_string(),
        })),
        security: Security::Tls(TlsSettings {
            server_name: address.to_string(),
            ..Default::default()
        }),
    }
}

pub fn remote_configuration(alias: &str) -> Configuration {
    Configuration::builder()
        .alias(alias)
        .source(Source::Remote(
            Url::parse(&format!("https://sub.example.com/{alias}")).unwrap(),
        ))
        .body(sample_body("old.example.com"))
        .build()
}

pub fn local_configuration(alias: &str) -> Configuration {
    Configuration::builder()
        .alias(alias)
        .source(Source::Local(PathBuf::from(format!("/tmp/{alias}.json"))))
        .body(sample_body("local.example.com"))
        .build()
}

/// 拉取结果脚本
#[derive(Clone)]
pub enum FetchOutcome {
    Body(Body),
    ParseError,
}

/// 按脚本返回结果的拉取器，可选地在返回前等待放行
pub struct ScriptedFetcher {
    outcome: Mutex<FetchOutcome>,
    calls: AtomicUsize,
    gate: Option<Arc<Notify>>,
    entered: Arc<Notify>,
}

impl ScriptedFetcher {
    pub fn returning(body: Body) -> Self {
        Self::new(FetchOutcome::Body(body), None)
    }

    pub fn failing() -> Self {
        Self::new(FetchOutcome::ParseError, None)
    }

    /// 进入 fetch 后阻塞，直到 `gate` 被通知
    pub fn gated(body: Body, gate: Arc<Notify>) -> Self {
        Self::new(FetchOutcome::Body(body), Some(gate))
    }

    fn new(outcome: FetchOutcome, gate: Option<Arc<Notify>>) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            calls: AtomicUsize::new(0),
            gate,
            entered: Arc::new(Notify::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 之后的 fetch 返回 `body`
    pub fn respond_with(&self, body: Body) {
        *self.outcome.lock() = FetchOutcome::Body(body);
    }

    /// 等待某次 fetch 调用开始
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }
}

#[async_trait]
impl SubscriptionFetcher for ScriptedFetcher {
    async fn fetch(&self, _source: &Source, cancel: &CancellationToken) -> Result<ParsedBody> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();

        if let Some(gate) = &self.gate {
            tokio::select! {
                _ = cancel.cancelled() => return Err(MangoError::Cancelled),
                _ = gate.notified() => {}
            }
        }

        match self.outcome.lock().clone() {
            FetchOutcome::Body(body) => Ok(ParsedBody {
                body,
                alias_hint: Some("Fetched".to_string()),
                format: PayloadFormat::Json,
            }),
            FetchOutcome::ParseError => Err(MangoError::Parse("unexpected token".to_string())),
        }
    }
}

/// 隧道调用记录，启动时记下所用负载的服务器地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelCall {
    Start { id: ConfigurationId, address: String },
    Stop,
}

impl TunnelCall {
    pub fn start(configuration: &Configuration) -> Self {
        Self::Start {
            id: configuration.id.clone(),
            address: configuration.body.protocol.address().to_string(),
        }
    }
}

/// 记录调用序列的隧道替身
pub struct RecordingTunnel {
    status: watch::Sender<TunnelStatus>,
    calls: Mutex<Vec<TunnelCall>>,
    fail_start: AtomicBool,
    stuck_stopping: AtomicBool,
}

impl RecordingTunnel {
    pub fn new(initial: TunnelStatus) -> Self {
        let (status, _) = watch::channel(initial);
        Self {
            status,
            calls: Mutex::new(Vec::new()),
            fail_start: AtomicBool::new(false),
            stuck_stopping: AtomicBool::new(false),
        }
    }

    pub fn fail_next_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    /// `stop` 之后停留在 `Disconnecting`
    pub fn hang_on_stop(&self) {
        self.stuck_stopping.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<TunnelCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl TunnelTransport for RecordingTunnel {
    async fn start(&self, configuration: &Configuration) -> Result<()> {
        self.calls.lock().push(TunnelCall::start(configuration));
        if self.fail_start.swap(false, Ordering::SeqCst) {
            self.status.send_replace(TunnelStatus::Error);
            return Err(MangoError::Tunnel("handshake failed".to_string()));
        }
        self.status.send_replace(TunnelStatus::Connected);
        Ok(())
    }

    async fn stop(&self) {
        self.calls.lock().push(TunnelCall::Stop);
        let next = if self.stuck_stopping.load(Ordering::SeqCst) {
            TunnelStatus::Disconnecting
        } else {
            TunnelStatus::Disconnected
        };
        self.status.send_replace(next);
    }

    fn status(&self) -> TunnelStatus {
        *self.status.borrow()
    }

    fn subscribe_status(&self) -> watch::Receiver<TunnelStatus> {
        self.status.subscribe()
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

impl NotificationSink for RecordingNotifier {
    fn send(&self, notification: Notification) {
        self.sent.lock().push(notification);
    }
}
