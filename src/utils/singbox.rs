//! sing-box 隧道进程管理
//!
//! 将配置负载渲染为 sing-box 运行时配置，托管子进程生命周期，并通过 `watch` 通道发布隧道状态。

use std::collections::HashMap;
use std::env::consts::EXE_SUFFIX;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::json;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::core::config::SingboxConfig;
use crate::core::error::{MangoError, Result};
use crate::core::model::{Body, Configuration, Outbound, Security, Transport, TunnelStatus};
use crate::interfaces::TunnelTransport;

const PROXY_TAG: &str = "proxy";

/// sing-box 出站 (Protocol Variants)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum SingBoxOutbound {
    Shadowsocks {
        tag: String,
        server: String,
        server_port: u16,
        method: String,
        password: String,
    },
    Vmess {
        tag: String,
        server: String,
        server_port: u16,
        uuid: String,
        security: String,
        alter_id: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        transport: Option<V2RayTransport>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tls: Option<TlsOutbound>,
    },
    Vless {
        tag: String,
        server: String,
        server_port: u16,
        uuid: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        flow: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        transport: Option<V2RayTransport>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tls: Option<TlsOutbound>,
    },
    Trojan {
        tag: String,
        server: String,
        server_port: u16,
        password: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        transport: Option<V2RayTransport>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tls: Option<TlsOutbound>,
    },
}

/// 传输层封装协议 (Transport Layer)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum V2RayTransport {
    Http {
        #[serde(skip_serializing_if = "Vec::is_empty")]
        host: Vec<String>,
        path: String,
    },
    #[serde(rename = "ws")]
    Websocket {
        path: String,
        #[serde(skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    Quic {},
    Grpc {
        service_name: String,
    },
}

/// 安全传输配置 (TLS/uTLS/REALITY)
#[derive(Debug, Clone, Serialize)]
struct TlsOutbound {
    enabled: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    server_name: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    insecure: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    alpn: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    utls: Option<UtlsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reality: Option<RealityOutbound>,
}

#[derive(Debug, Clone, Serialize)]
struct UtlsConfig {
    enabled: bool,
    fingerprint: String,
}

#[derive(Debug, Clone, Serialize)]
struct RealityOutbound {
    enabled: bool,
    public_key: String,
    short_id: String,
}

fn utls(fingerprint: &str) -> Option<UtlsConfig> {
    (!fingerprint.is_empty()).then(|| UtlsConfig {
        enabled: true,
        fingerprint: fingerprint.to_string(),
    })
}

fn render_transport(transport: Option<&Transport>) -> Result<Option<V2RayTransport>> {
    let rendered = match transport {
        None | Some(Transport::Tcp(_)) => None,
        Some(Transport::Kcp(_)) => {
            return Err(MangoError::Tunnel(
                "mKCP transport is not supported by sing-box".to_string(),
            ));
        }
        Some(Transport::Ws(ws)) => Some(V2RayTransport::Websocket {
            path: ws.path.clone(),
            headers: (!ws.host.is_empty())
                .then(|| HashMap::from([("Host".to_string(), ws.host.clone())]))
                .unwrap_or_default(),
        }),
        Some(Transport::Http(http)) => Some(V2RayTransport::Http {
            host: http.hosts.clone(),
            path: http.path.clone(),
        }),
        Some(Transport::Quic(_)) => Some(V2RayTransport::Quic {}),
        Some(Transport::Grpc(grpc)) => Some(V2RayTransport::Grpc {
            service_name: grpc.service_name.clone(),
        }),
    };
    Ok(rendered)
}

fn render_tls(security: &Security) -> Option<TlsOutbound> {
    match security {
        Security::None => None,
        Security::Tls(tls) => Some(TlsOutbound {
            enabled: true,
            server_name: tls.server_name.clone(),
            insecure: tls.allow_insecure,
            alpn: tls.alpn.clone(),
            utls: utls(&tls.fingerprint),
            reality: None,
        }),
        Security::Reality(reality) => Some(TlsOutbound {
            enabled: true,
            server_name: reality.server_name.clone(),
            insecure: false,
            alpn: Vec::new(),
            utls: utls(&reality.fingerprint),
            reality: Some(RealityOutbound {
                enabled: true,
                public_key: reality.public_key.clone(),
                short_id: reality.short_id.clone(),
            }),
        }),
    }
}

fn render_outbound(body: &Body) -> Result<SingBoxOutbound> {
    let tag = PROXY_TAG.to_string();
    let transport = render_transport(body.transport.as_ref())?;
    let tls = render_tls(&body.security);

    let outbound = match &body.protocol {
        Outbound::Vless(v) => SingBoxOutbound::Vless {
            tag,
            server: v.address.clone(),
            server_port: v.port,
            uuid: v.id.clone(),
            flow: v.flow.clone(),
            transport,
            tls,
        },
        Outbound::Vmess(v) => SingBoxOutbound::Vmess {
            tag,
            server: v.address.clone(),
            server_port: v.port,
            uuid: v.id.clone(),
            security: v.security.clone(),
            alter_id: v.alter_id,
            transport,
            tls,
        },
        Outbound::Trojan(t) => SingBoxOutbound::Trojan {
            tag,
            server: t.address.clone(),
            server_port: t.port,
            password: t.password.clone(),
            transport,
            tls,
        },
        Outbound::Shadowsocks(s) => SingBoxOutbound::Shadowsocks {
            tag,
            server: s.address.clone(),
            server_port: s.port,
            method: s.method.clone(),
            password: s.password.clone(),
        },
    };
    Ok(outbound)
}

/// 生成完整的 sing-box 运行时配置
pub fn generate_singbox_config(
    body: &Body,
    settings: &SingboxConfig,
    runtime_dir: &Path,
) -> Result<String> {
    let outbound = serde_json::to_value(render_outbound(body)?)?;
    let cache_path = runtime_dir.join("cache.db");

    let config = json!({
        "log": { "level": settings.log_level },
        "inbounds": [{
            "type": "mixed",
            "tag": "mixed-in",
            "listen": settings.listen,
            "listen_port": settings.proxy_port
        }],
        "outbounds": [
            outbound,
            { "type": "direct", "tag": "direct" }
        ],
        "route": {
            "final": PROXY_TAG,
            "auto_detect_interface": true
        },
        "experimental": {
            "clash_api": {
                "external_controller": format!("127.0.0.1:{}", settings.api_port),
                "secret": settings.api_secret
            },
            "cache_file": {
                "enabled": true,
                "path": cache_path.to_string_lossy()
            }
        }
    });

    Ok(serde_json::to_string_pretty(&config)?)
}

/// sing-box 隧道
pub struct SingBoxTunnel {
    executable: PathBuf,
    runtime_dir: PathBuf,
    settings: SingboxConfig,
    api_base: Url,
    child: Mutex<Option<Child>>,
    status: watch::Sender<TunnelStatus>,
    client: Client,
}

impl SingBoxTunnel {
    pub fn new(settings: &SingboxConfig, runtime_dir: &Path) -> Result<Self> {
        // 自动处理不同系统的扩展名 (Windows 为 .exe，Linux/Mac 为空)
        let executable = Path::new(&settings.bin_path).join(format!("sing-box{}", EXE_SUFFIX));

        let api_base = Url::parse(&format!("http://127.0.0.1:{}", settings.api_port))
            .map_err(|e| MangoError::Tunnel(format!("invalid API address: {}", e)))?;

        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()?;

        let (status, _) = watch::channel(TunnelStatus::Disconnected);

        Ok(Self {
            executable,
            runtime_dir: runtime_dir.to_path_buf(),
            settings: settings.clone(),
            api_base,
            child: Mutex::new(None),
            status,
            client,
        })
    }

    fn config_path(&self) -> PathBuf {
        self.runtime_dir.join("sing-box.json")
    }

    async fn write_config(&self, content: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.runtime_dir).await?;
        tokio::fs::write(self.config_path(), content).await?;
        Ok(())
    }

    async fn launch(&self, configuration: &Configuration) -> Result<Child> {
        let content = generate_singbox_config(&configuration.body, &self.settings, &self.runtime_dir)?;
        self.write_config(&content).await?;

        if !self.executable.exists() {
            return Err(MangoError::Tunnel(format!(
                "sing-box executable not found: {}",
                self.executable.display()
            )));
        }

        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.runtime_dir.join("sing-box.log"))?;

        info!("Starting sing-box for \"{}\"", configuration.alias);
        let mut child = Command::new(&self.executable)
            .arg("run")
            .arg("-c")
            .arg(self.config_path())
            .stdout(Stdio::from(log_file.try_clone()?))
            .stderr(Stdio::from(log_file))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MangoError::Tunnel(format!("failed to spawn sing-box: {}", e)))?;

        if let Err(e) = self.wait_for_api(&mut child).await {
            let _ = child.kill().await;
            return Err(e);
        }
        Ok(child)
    }

    async fn wait_for_api(&self, child: &mut Child) -> Result<()> {
        let url = self
            .api_base
            .join("proxies")
            .map_err(|e| MangoError::Tunnel(e.to_string()))?;
        let limit = Duration::from_secs(self.settings.ready_timeout_secs);

        timeout(limit, async {
            loop {
                if let Ok(Some(exit)) = child.try_wait() {
                    return Err(MangoError::Tunnel(format!("sing-box exited early: {}", exit)));
                }
                match self
                    .client
                    .get(url.clone())
                    .bearer_auth(&self.settings.api_secret)
                    .send()
                    .await
                {
                    Ok(resp) if resp.status().is_success() => {
                        debug!("sing-box API ready");
                        return Ok(());
                    }
                    _ => debug!("Waiting for sing-box API..."),
                }
                sleep(Duration::from_millis(500)).await;
            }
        })
        .await
        .map_err(|_| MangoError::Tunnel("timed out waiting for sing-box API".to_string()))?
    }

    fn publish(&self, status: TunnelStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!("Tunnel status: {} -> {}", previous, status);
        }
    }
}

#[async_trait]
impl TunnelTransport for SingBoxTunnel {
    async fn start(&self, configuration: &Configuration) -> Result<()> {
        let mut child_guard = self.child.lock().await;
        if let Some(mut previous) = child_guard.take() {
            debug!("Replacing running sing-box instance");
            let _ = previous.kill().await;
        }

        self.publish(TunnelStatus::Connecting);
        match self.launch(configuration).await {
            Ok(child) => {
                *child_guard = Some(child);
                self.publish(TunnelStatus::Connected);
                info!("Tunnel connected: \"{}\"", configuration.alias);
                Ok(())
            }
            Err(e) => {
                self.publish(TunnelStatus::Error);
                Err(e)
            }
        }
    }

    async fn stop(&self) {
        let mut child_guard = self.child.lock().await;
        if let Some(mut child) = child_guard.take() {
            self.publish(TunnelStatus::Disconnecting);
            if let Err(e) = child.kill().await {
                warn!("Failed to stop sing-box: {}", e);
            }
            info!("sing-box stopped");
        }
        self.publish(TunnelStatus::Disconnected);
    }

    fn status(&self) -> TunnelStatus {
        *self.status.borrow()
    }

    fn subscribe_status(&self) -> watch::Receiver<TunnelStatus> {
        self.status.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::core::error::ErrorKind;
    use crate::core::model::{KcpSettings, Shadowsocks};
    use crate::testing::{remote_configuration, sample_body};

    fn render(body: &Body) -> Result<Value> {
        let dir = Path::new("/tmp/mango-runtime");
        let content = generate_singbox_config(body, &SingboxConfig::default(), dir)?;
        Ok(serde_json::from_str(&content).unwrap())
    }

    #[test]
    fn renders_vless_with_ws_and_tls() {
        let config = render(&sample_body("node.example.com")).unwrap();
        let outbound = &config["outbounds"][0];

        assert_eq!(outbound["type"], "vless");
        assert_eq!(outbound["tag"], PROXY_TAG);
        assert_eq!(outbound["server_port"], 443);
        assert_eq!(outbound["transport"]["type"], "ws");
        assert_eq!(outbound["transport"]["headers"]["Host"], "node.example.com");
        assert_eq!(outbound["tls"]["server_name"], "node.example.com");
        assert_eq!(outbound["tls"]["utls"]["fingerprint"], "chrome");
        assert!(outbound.get("flow").is_none());

        assert_eq!(config["inbounds"][0]["listen_port"], 7890);
        assert_eq!(config["route"]["final"], PROXY_TAG);
        assert_eq!(config["experimental"]["clash_api"]["external_controller"], "127.0.0.1:9090");
    }

    #[test]
    fn renders_shadowsocks_without_layers() {
        let body = Body::new(Outbound::Shadowsocks(Shadowsocks {
            address: "1.2.3.4".into(),
            password: "pw".into(),
            ..Default::default()
        }));
        let outbound = render(&body).unwrap()["outbounds"][0].clone();

        assert_eq!(outbound["type"], "shadowsocks");
        assert_eq!(outbound["method"], "aes-128-gcm");
        assert!(outbound.get("tls").is_none());
    }

    #[test]
    fn kcp_is_rejected() {
        let mut body = sample_body("node.example.com");
        body.transport = Some(Transport::Kcp(KcpSettings::default()));
        assert_eq!(render(&body).unwrap_err().kind(), ErrorKind::Tunnel);
    }

    #[tokio::test]
    async fn missing_binary_reports_error_status() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SingboxConfig {
            bin_path: dir.path().join("absent").to_string_lossy().into_owned(),
            ..Default::default()
        };
        let tunnel = SingBoxTunnel::new(&settings, &dir.path().join("runtime")).unwrap();

        let err = tunnel.start(&remote_configuration("a")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Tunnel);
        assert_eq!(tunnel.status(), TunnelStatus::Error);
        assert!(dir.path().join("runtime/sing-box.json").exists());

        tunnel.stop().await;
        tunnel.stop().await;
        assert_eq!(tunnel.status(), TunnelStatus::Disconnected);
    }
}
