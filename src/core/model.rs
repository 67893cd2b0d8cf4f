//! 配置数据模型 (Configuration Data Model)
//!
//! 协议负载 (VLESS/VMess/Trojan/Shadowsocks)、传输层与安全层的内部统一表示。

use std::fmt;
use std::path::PathBuf;

use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use url::Url;
use uuid::Uuid;

use crate::core::error::{MangoError, Result};

/// 配置唯一标识，重命名与更新时保持不变
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigurationId(String);

impl ConfigurationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigurationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConfigurationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConfigurationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// 配置来源：远程订阅地址或本地文件，二者互斥
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Source {
    Remote(Url),
    Local(PathBuf),
}

impl Source {
    pub fn is_file_url(&self) -> bool {
        matches!(self, Source::Local(_))
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Remote(url) => write!(f, "{}", url),
            Source::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// 协议类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum ProtocolType {
    #[strum(to_string = "VLESS")]
    Vless,
    #[strum(to_string = "VMess")]
    Vmess,
    #[strum(to_string = "Trojan")]
    Trojan,
    #[strum(serialize = "ss", to_string = "Shadowsocks")]
    Shadowsocks,
}

impl ProtocolType {
    pub fn is_transport_available(&self) -> bool {
        !matches!(self, ProtocolType::Shadowsocks)
    }

    pub fn is_security_available(&self) -> bool {
        !matches!(self, ProtocolType::Shadowsocks)
    }
}

// --- Protocol Payloads ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vless {
    pub address: String,
    pub port: u16,
    pub id: String,
    #[serde(default = "default_encryption")]
    pub encryption: String,
    #[serde(default)]
    pub flow: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vmess {
    pub address: String,
    pub port: u16,
    pub id: String,
    #[serde(default)]
    pub alter_id: u16,
    #[serde(default = "default_vmess_security")]
    pub security: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trojan {
    pub address: String,
    pub port: u16,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shadowsocks {
    pub address: String,
    pub port: u16,
    pub method: String,
    pub password: String,
}

fn default_encryption() -> String {
    "none".to_string()
}
fn default_vmess_security() -> String {
    "auto".to_string()
}

impl Default for Vless {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 443,
            id: String::new(),
            encryption: default_encryption(),
            flow: String::new(),
        }
    }
}

impl Default for Vmess {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 443,
            id: String::new(),
            alter_id: 0,
            security: default_vmess_security(),
        }
    }
}

impl Default for Trojan {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 443,
            password: String::new(),
        }
    }
}

impl Default for Shadowsocks {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 8388,
            method: "aes-128-gcm".to_string(),
            password: String::new(),
        }
    }
}

/// 支持的代理协议变体 (Protocol Variants)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Vless(Vless),
    Vmess(Vmess),
    Trojan(Trojan),
    Shadowsocks(Shadowsocks),
}

impl Outbound {
    pub fn protocol_type(&self) -> ProtocolType {
        match self {
            Outbound::Vless(_) => ProtocolType::Vless,
            Outbound::Vmess(_) => ProtocolType::Vmess,
            Outbound::Trojan(_) => ProtocolType::Trojan,
            Outbound::Shadowsocks(_) => ProtocolType::Shadowsocks,
        }
    }

    pub fn address(&self) -> &str {
        match self {
            Outbound::Vless(v) => &v.address,
            Outbound::Vmess(v) => &v.address,
            Outbound::Trojan(v) => &v.address,
            Outbound::Shadowsocks(v) => &v.address,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Outbound::Vless(v) => v.port,
            Outbound::Vmess(v) => v.port,
            Outbound::Trojan(v) => v.port,
            Outbound::Shadowsocks(v) => v.port,
        }
    }

    /// 协议必填字段
    fn credentials(&self) -> Vec<(&'static str, &str)> {
        match self {
            Outbound::Vless(v) => vec![("id", v.id.as_str())],
            Outbound::Vmess(v) => vec![("id", v.id.as_str())],
            Outbound::Trojan(v) => vec![("password", v.password.as_str())],
            Outbound::Shadowsocks(v) => {
                vec![("method", v.method.as_str()), ("password", v.password.as_str())]
            }
        }
    }
}

// --- Transport Layer ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSettings {
    pub header_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KcpSettings {
    pub mtu: u32,
    pub tti: u32,
    pub uplink_capacity: u32,
    pub downlink_capacity: u32,
    pub congestion: bool,
    pub header_type: String,
    pub seed: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WsSettings {
    pub path: String,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub path: String,
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuicSettings {
    pub security: String,
    pub key: String,
    pub header_type: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GrpcSettings {
    pub service_name: String,
    pub multi_mode: bool,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            header_type: "none".to_string(),
        }
    }
}

impl Default for KcpSettings {
    fn default() -> Self {
        Self {
            mtu: 1350,
            tti: 50,
            uplink_capacity: 5,
            downlink_capacity: 20,
            congestion: false,
            header_type: "none".to_string(),
            seed: String::new(),
        }
    }
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            host: String::new(),
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            hosts: Vec::new(),
        }
    }
}

impl Default for QuicSettings {
    fn default() -> Self {
        Self {
            security: "none".to_string(),
            key: String::new(),
            header_type: "none".to_string(),
        }
    }
}

/// 传输层封装协议 (Transport Layer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "network", rename_all = "lowercase")]
pub enum Transport {
    Tcp(TcpSettings),
    Kcp(KcpSettings),
    Ws(WsSettings),
    Http(HttpSettings),
    Quic(QuicSettings),
    Grpc(GrpcSettings),
}

// --- Security Layer ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub server_name: String,
    pub alpn: Vec<String>,
    pub fingerprint: String,
    pub allow_insecure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealitySettings {
    pub server_name: String,
    pub fingerprint: String,
    pub public_key: String,
    pub short_id: String,
    pub spider_x: String,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            alpn: Vec::new(),
            fingerprint: "chrome".to_string(),
            allow_insecure: false,
        }
    }
}

impl Default for RealitySettings {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            fingerprint: "chrome".to_string(),
            public_key: String::new(),
            short_id: String::new(),
            spider_x: String::new(),
        }
    }
}

/// 安全传输配置 (TLS/Reality)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Security {
    #[default]
    None,
    Tls(TlsSettings),
    Reality(RealitySettings),
}

/// 配置负载：协议 + 可选传输层 + 安全层
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    pub protocol: Outbound,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
    #[serde(default)]
    pub security: Security,
}

impl Body {
    pub fn new(protocol: Outbound) -> Self {
        Self {
            protocol,
            transport: None,
            security: Security::None,
        }
    }

    pub fn protocol_type(&self) -> ProtocolType {
        self.protocol.protocol_type()
    }

    /// 校验协议必填字段
    pub fn validate(&self) -> Result<()> {
        let protocol = self.protocol_type();

        if self.protocol.address().trim().is_empty() {
            return Err(MangoError::Validation(format!("{} address is empty", protocol)));
        }
        if self.protocol.port() == 0 {
            return Err(MangoError::Validation(format!("{} port must be non-zero", protocol)));
        }
        if let Some((field, _)) = self
            .protocol
            .credentials()
            .into_iter()
            .find(|(_, value)| value.trim().is_empty())
        {
            return Err(MangoError::Validation(format!("{} {} is empty", protocol, field)));
        }
        if let Security::Reality(reality) = &self.security
            && reality.public_key.is_empty()
        {
            return Err(MangoError::Validation("reality public key is empty".to_string()));
        }
        Ok(())
    }
}

/// 配置记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
pub struct Configuration {
    #[builder(default = ConfigurationId::generate())]
    pub id: ConfigurationId,
    #[builder(into)]
    pub alias: String,
    pub source: Source,
    pub body: Body,
    #[builder(default = Utc::now())]
    pub least_updated: DateTime<Utc>,
}

/// 隧道状态，由隧道传输层独占维护
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TunnelStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl TunnelStatus {
    /// 隧道已停止活动 (可安全重新启动)
    pub fn is_quiescent(&self) -> bool {
        matches!(self, TunnelStatus::Disconnected | TunnelStatus::Error)
    }
}
