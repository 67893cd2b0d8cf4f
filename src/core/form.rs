//! 表单输入 (Form Input)
//!
//! 手动创建配置时的内存表单状态，按协议类型合成配置负载。

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::core::model::{
    Body, GrpcSettings, HttpSettings, KcpSettings, Outbound, ProtocolType, QuicSettings,
    RealitySettings, Security, Shadowsocks, Source, TcpSettings, TlsSettings, Transport, Trojan,
    Vless, Vmess, WsSettings,
};

/// 传输层选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Kcp,
    Ws,
    Http,
    Quic,
    Grpc,
}

/// 安全层选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SecurityKind {
    #[default]
    None,
    Tls,
    Reality,
}

/// 创建表单状态
///
/// 每个协议/传输/安全变体各自保留一份设置，合成时只取选中的那一份。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FormInput {
    pub descriptive: String,
    /// 缺省时使用配置记录自身的存储路径作为本地来源
    pub source: Option<Source>,

    pub vless: Vless,
    pub vmess: Vmess,
    pub trojan: Trojan,
    pub shadowsocks: Shadowsocks,

    pub network: Network,
    pub tcp: TcpSettings,
    pub kcp: KcpSettings,
    pub ws: WsSettings,
    pub http: HttpSettings,
    pub quic: QuicSettings,
    pub grpc: GrpcSettings,

    pub security: SecurityKind,
    pub tls: TlsSettings,
    pub reality: RealitySettings,
}

impl FormInput {
    /// 显示名称，空白时回退为协议名
    pub fn alias(&self, protocol_type: ProtocolType) -> String {
        let name = self.descriptive.trim();
        if name.is_empty() {
            protocol_type.to_string()
        } else {
            name.to_string()
        }
    }

    /// 按协议类型合成配置负载
    ///
    /// 协议不支持的传输层/安全层设置会被丢弃。
    pub fn build(&self, protocol_type: ProtocolType) -> Body {
        let protocol = match protocol_type {
            ProtocolType::Vless => Outbound::Vless(self.vless.clone()),
            ProtocolType::Vmess => Outbound::Vmess(self.vmess.clone()),
            ProtocolType::Trojan => Outbound::Trojan(self.trojan.clone()),
            ProtocolType::Shadowsocks => Outbound::Shadowsocks(self.shadowsocks.clone()),
        };

        let transport = protocol_type
            .is_transport_available()
            .then(|| match self.network {
                Network::Tcp => Transport::Tcp(self.tcp.clone()),
                Network::Kcp => Transport::Kcp(self.kcp.clone()),
                Network::Ws => Transport::Ws(self.ws.clone()),
                Network::Http => Transport::Http(self.http.clone()),
                Network::Quic => Transport::Quic(self.quic.clone()),
                Network::Grpc => Transport::Grpc(self.grpc.clone()),
            });

        let security = if protocol_type.is_security_available() {
            match self.security {
                SecurityKind::None => Security::None,
                SecurityKind::Tls => Security::Tls(self.tls.clone()),
                SecurityKind::Reality => Security::Reality(self.reality.clone()),
            }
        } else {
            Security::None
        };

        Body {
            protocol,
            transport,
            security,
        }
    }
}
