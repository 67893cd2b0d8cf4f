//! 载荷格式识别与归一化 (Payload Format & Normalization)
//!
//! 支持 JSON / YAML / TOML 文档与分享链接，统一转换为内部配置负载。

use std::path::Path;

use serde_json::Value;
use strum::Display;
use tracing::debug;

use crate::core::error::{MangoError, Result};
use crate::core::model::{
    Body, GrpcSettings, HttpSettings, KcpSettings, Outbound, QuicSettings,
    RealitySettings, Security, Shadowsocks, TcpSettings, TlsSettings, Transport, Trojan, Vless,
    Vmess, WsSettings,
};
use crate::utils::share_link;

/// 载荷格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum PayloadFormat {
    Json,
    Yaml,
    Toml,
    #[strum(to_string = "share link")]
    ShareLink,
}

impl PayloadFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    /// 由 HTTP `Content-Type` 推断，`text/plain` 等通用类型不作判断
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
        match mime.as_str() {
            "application/json" => Some(Self::Json),
            "application/yaml" | "application/x-yaml" | "text/yaml" | "text/x-yaml" => {
                Some(Self::Yaml)
            }
            "application/toml" | "text/x-toml" => Some(Self::Toml),
            _ => None,
        }
    }

    /// 按内容嗅探格式
    pub fn detect(content: &str) -> Self {
        let trimmed = content.trim_start();
        if trimmed.starts_with('{') || (trimmed.starts_with('[') && !looks_like_toml(trimmed)) {
            return Self::Json;
        }
        if share_link::looks_like_link(trimmed) {
            return Self::ShareLink;
        }
        if let Ok(decoded) = share_link::decode_base64_auto(trimmed)
            && share_link::looks_like_link(&decoded)
        {
            return Self::ShareLink;
        }
        if looks_like_toml(trimmed) {
            return Self::Toml;
        }
        Self::Yaml
    }
}

fn looks_like_toml(content: &str) -> bool {
    content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .is_some_and(|line| {
            let is_table = line.starts_with('[')
                && line.ends_with(']')
                && is_bare_key(line.trim_matches(|c| c == '[' || c == ']'));
            let is_assignment = line
                .split_once('=')
                .is_some_and(|(key, _)| is_bare_key(key.trim()));
            is_table || is_assignment
        })
}

fn is_bare_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '"'))
}

/// 归一化后的配置负载
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBody {
    pub body: Body,
    /// 载荷中携带的名称 (remarks / tag / 链接片段)
    pub alias_hint: Option<String>,
    pub format: PayloadFormat,
}

/// 解析并归一化载荷
///
/// `declared` 为空时按内容嗅探。
pub fn parse_payload(content: &str, declared: Option<PayloadFormat>) -> Result<ParsedBody> {
    if content.trim().is_empty() {
        return Err(MangoError::Parse("Empty payload".to_string()));
    }

    let format = declared.unwrap_or_else(|| PayloadFormat::detect(content));
    debug!("Parsing payload as {}", format);

    let (body, alias_hint) = match format {
        PayloadFormat::ShareLink => {
            let (body, tag) = share_link::parse_links(content)?;
            (body, Some(tag))
        }
        _ => normalize(&parse_document(content, format)?)?,
    };

    Ok(ParsedBody {
        body,
        alias_hint: alias_hint.filter(|s| !s.trim().is_empty()),
        format,
    })
}

/// 将文档解析为通用 JSON 值
pub fn parse_document(content: &str, format: PayloadFormat) -> Result<Value> {
    let invalid = |e: &dyn std::fmt::Display| MangoError::Parse(format!("Invalid {}: {}", format, e));
    match format {
        PayloadFormat::Json => serde_json::from_str(content).map_err(|e| invalid(&e)),
        PayloadFormat::Yaml => serde_yml::from_str(content).map_err(|e| invalid(&e)),
        PayloadFormat::Toml => {
            let table: toml::Table = toml::from_str(content).map_err(|e| invalid(&e))?;
            serde_json::to_value(table).map_err(|e| invalid(&e))
        }
        PayloadFormat::ShareLink => Err(MangoError::Parse(
            "Share links are not a document format".to_string(),
        )),
    }
}

/// 识别文档结构并转换为内部负载
///
/// 依次尝试：Xray `outbounds` 列表、单个 Xray 出站、内部格式、Clash `proxies` 列表。
pub fn normalize(value: &Value) -> Result<(Body, Option<String>)> {
    let Some(root) = value.as_object() else {
        return Err(MangoError::Parse(
            "Unsupported schema: expected a document object".to_string(),
        ));
    };
    let remarks = root.get("remarks").and_then(Value::as_str).map(String::from);

    if let Some(outbounds) = root.get("outbounds").and_then(Value::as_array) {
        let outbound = outbounds
            .iter()
            .find(|o| {
                o.get("protocol")
                    .and_then(Value::as_str)
                    .is_some_and(is_supported_protocol)
            })
            .ok_or_else(|| MangoError::Parse("No supported outbound found".to_string()))?;
        let (body, tag) = xray_outbound(outbound)?;
        return Ok((body, remarks.or(tag)));
    }

    match root.get("protocol") {
        Some(Value::String(_)) => {
            let (body, tag) = xray_outbound(value)?;
            return Ok((body, remarks.or(tag)));
        }
        Some(Value::Object(_)) => {
            let body: Body = serde_json::from_value(value.clone()).map_err(|e| {
                let message = e.to_string();
                if message.contains("missing field") {
                    MangoError::Validation(message)
                } else {
                    MangoError::Parse(message)
                }
            })?;
            body.validate()?;
            let alias = root
                .get("alias")
                .or_else(|| root.get("name"))
                .and_then(Value::as_str)
                .map(String::from);
            return Ok((body, alias.or(remarks)));
        }
        _ => {}
    }

    if let Some(proxies) = root.get("proxies").and_then(Value::as_array) {
        let (body, tag) = proxies
            .iter()
            .find_map(share_link::parse_clash_proxy)
            .ok_or_else(|| MangoError::Parse("No supported proxy found".to_string()))?;
        body.validate()?;
        return Ok((body, Some(tag)));
    }

    Err(MangoError::Parse(
        "Unsupported schema: no outbound, protocol or proxies".to_string(),
    ))
}

fn is_supported_protocol(protocol: &str) -> bool {
    matches!(protocol, "vless" | "vmess" | "trojan" | "shadowsocks")
}

// --- Xray Outbound Mapping ---

fn str_of(v: &Value, key: &str) -> String {
    v.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn str_or(v: &Value, key: &str, default: &str) -> String {
    v.get(key).and_then(Value::as_str).unwrap_or(default).to_string()
}

fn u64_of(v: &Value, key: &str) -> Option<u64> {
    let field = v.get(key)?;
    field.as_u64().or_else(|| field.as_str()?.parse().ok())
}

fn port_of(v: &Value) -> u16 {
    u64_of(v, "port")
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(0)
}

fn header_type(settings: Option<&Value>) -> String {
    settings
        .and_then(|s| s.get("header"))
        .and_then(|h| h.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("none")
        .to_string()
}

fn xray_outbound(outbound: &Value) -> Result<(Body, Option<String>)> {
    let protocol = outbound
        .get("protocol")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let settings = outbound.get("settings").unwrap_or(&Value::Null);
    let first = |key: &str| {
        settings
            .get(key)
            .and_then(Value::as_array)
            .and_then(|list| list.first())
            .ok_or_else(|| {
                MangoError::Validation(format!("{} outbound has no {} entry", protocol, key))
            })
    };

    let outbound_body = match protocol {
        "vless" | "vmess" => {
            let server = first("vnext")?;
            let user = server
                .get("users")
                .and_then(Value::as_array)
                .and_then(|users| users.first())
                .ok_or_else(|| {
                    MangoError::Validation(format!("{} outbound has no users", protocol))
                })?;
            if protocol == "vless" {
                Outbound::Vless(Vless {
                    address: str_of(server, "address"),
                    port: port_of(server),
                    id: str_of(user, "id"),
                    encryption: str_or(user, "encryption", "none"),
                    flow: str_of(user, "flow"),
                })
            } else {
                Outbound::Vmess(Vmess {
                    address: str_of(server, "address"),
                    port: port_of(server),
                    id: str_of(user, "id"),
                    alter_id: u64_of(user, "alterId")
                        .and_then(|n| u16::try_from(n).ok())
                        .unwrap_or(0),
                    security: str_or(user, "security", "auto"),
                })
            }
        }
        "trojan" => {
            let server = first("servers")?;
            Outbound::Trojan(Trojan {
                address: str_of(server, "address"),
                port: port_of(server),
                password: str_of(server, "password"),
            })
        }
        "shadowsocks" => {
            let server = first("servers")?;
            Outbound::Shadowsocks(Shadowsocks {
                address: str_of(server, "address"),
                port: port_of(server),
                method: str_of(server, "method"),
                password: str_of(server, "password"),
            })
        }
        other => {
            return Err(MangoError::Parse(format!("Unsupported protocol: {:?}", other)));
        }
    };

    let protocol_type = outbound_body.protocol_type();
    let (transport, security) = match outbound.get("streamSettings") {
        Some(stream) => (xray_transport(stream)?, xray_security(stream)?),
        None => (None, Security::None),
    };

    let body = Body {
        protocol: outbound_body,
        transport: transport.filter(|_| protocol_type.is_transport_available()),
        security: if protocol_type.is_security_available() {
            security
        } else {
            Security::None
        },
    };
    body.validate()?;

    let tag = outbound
        .get("tag")
        .and_then(Value::as_str)
        .filter(|t| *t != "proxy")
        .map(String::from);
    Ok((body, tag))
}

fn xray_transport(stream: &Value) -> Result<Option<Transport>> {
    let network = stream.get("network").and_then(Value::as_str).unwrap_or("tcp");
    let transport = match network {
        "tcp" | "raw" => Transport::Tcp(TcpSettings {
            header_type: header_type(stream.get("tcpSettings")),
        }),
        "kcp" | "mkcp" => {
            let kcp = stream.get("kcpSettings").unwrap_or(&Value::Null);
            let defaults = KcpSettings::default();
            Transport::Kcp(KcpSettings {
                mtu: u64_of(kcp, "mtu").map_or(defaults.mtu, |v| v as u32),
                tti: u64_of(kcp, "tti").map_or(defaults.tti, |v| v as u32),
                uplink_capacity: u64_of(kcp, "uplinkCapacity")
                    .map_or(defaults.uplink_capacity, |v| v as u32),
                downlink_capacity: u64_of(kcp, "downlinkCapacity")
                    .map_or(defaults.downlink_capacity, |v| v as u32),
                congestion: kcp.get("congestion").and_then(Value::as_bool).unwrap_or(false),
                header_type: header_type(Some(kcp)),
                seed: str_of(kcp, "seed"),
            })
        }
        "ws" | "websocket" => {
            let ws = stream.get("wsSettings").unwrap_or(&Value::Null);
            let host = ws
                .get("headers")
                .and_then(|h| h.get("Host"))
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| str_of(ws, "host"));
            Transport::Ws(WsSettings {
                path: str_or(ws, "path", "/"),
                host,
            })
        }
        "http" | "h2" => {
            let http = stream.get("httpSettings").unwrap_or(&Value::Null);
            Transport::Http(HttpSettings {
                path: str_or(http, "path", "/"),
                hosts: http
                    .get("host")
                    .and_then(|h| serde_json::from_value(h.clone()).ok())
                    .unwrap_or_default(),
            })
        }
        "quic" => {
            let quic = stream.get("quicSettings").unwrap_or(&Value::Null);
            Transport::Quic(QuicSettings {
                security: str_or(quic, "security", "none"),
                key: str_of(quic, "key"),
                header_type: header_type(Some(quic)),
            })
        }
        "grpc" | "gun" => {
            let grpc = stream.get("grpcSettings").unwrap_or(&Value::Null);
            Transport::Grpc(GrpcSettings {
                service_name: str_of(grpc, "serviceName"),
                multi_mode: grpc.get("multiMode").and_then(Value::as_bool).unwrap_or(false),
            })
        }
        other => {
            return Err(MangoError::Parse(format!("Unsupported network: {:?}", other)));
        }
    };
    Ok(Some(transport))
}

fn xray_security(stream: &Value) -> Result<Security> {
    match stream.get("security").and_then(Value::as_str).unwrap_or("none") {
        "none" | "" => Ok(Security::None),
        "tls" => {
            let tls = stream.get("tlsSettings").unwrap_or(&Value::Null);
            Ok(Security::Tls(TlsSettings {
                server_name: str_of(tls, "serverName"),
                alpn: tls
                    .get("alpn")
                    .and_then(|a| serde_json::from_value(a.clone()).ok())
                    .unwrap_or_default(),
                fingerprint: str_or(tls, "fingerprint", "chrome"),
                allow_insecure: tls
                    .get("allowInsecure")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }))
        }
        "reality" => {
            let reality = stream.get("realitySettings").unwrap_or(&Value::Null);
            Ok(Security::Reality(RealitySettings {
                server_name: str_of(reality, "serverName"),
                fingerprint: str_or(reality, "fingerprint", "chrome"),
                public_key: str_of(reality, "publicKey"),
                short_id: str_of(reality, "shortId"),
                spider_x: str_of(reality, "spiderX"),
            }))
        }
        other => Err(MangoError::Parse(format!("Unsupported security: {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    const XRAY_JSON: &str = r#"{
        "remarks": "Xray Tokyo",
        "outbounds": [
            { "protocol": "freedom", "tag": "direct" },
            {
                "protocol": "vless",
                "tag": "proxy",
                "settings": {
                    "vnext": [{
                        "address": "tokyo.example.com",
                        "port": 443,
                        "users": [{ "id": "b831381d-6324-4d53-ad4f-8cda48b30811", "flow": "xtls-rprx-vision" }]
                    }]
                },
                "streamSettings": {
                    "network": "tcp",
                    "security": "reality",
                    "realitySettings": {
                        "serverName": "www.example.com",
                        "publicKey": "PUBKEY",
                        "shortId": "6ba85179e30d4fc2"
                    }
                }
            }
        ]
    }"#;

    #[test]
    fn detects_formats_from_content() {
        assert_eq!(PayloadFormat::detect(XRAY_JSON), PayloadFormat::Json);
        assert_eq!(PayloadFormat::detect("protocol: vless\n"), PayloadFormat::Yaml);
        assert_eq!(PayloadFormat::detect("protocol = \"vless\"\n"), PayloadFormat::Toml);
        assert_eq!(PayloadFormat::detect("[settings]\nport = 1\n"), PayloadFormat::Toml);
        assert_eq!(PayloadFormat::detect("[{\"a\":1}]"), PayloadFormat::Json);
        assert_eq!(
            PayloadFormat::detect("trojan://pw@1.1.1.1:443#a"),
            PayloadFormat::ShareLink
        );
    }

    #[test]
    fn declared_format_from_extension_and_mime() {
        assert_eq!(PayloadFormat::from_path(Path::new("a/b.YML")), Some(PayloadFormat::Yaml));
        assert_eq!(PayloadFormat::from_path(Path::new("a/b")), None);
        assert_eq!(
            PayloadFormat::from_content_type("application/json; charset=utf-8"),
            Some(PayloadFormat::Json)
        );
        assert_eq!(PayloadFormat::from_content_type("text/plain"), None);
    }

    #[test]
    fn normalizes_xray_document() {
        let parsed = parse_payload(XRAY_JSON, None).unwrap();

        assert_eq!(parsed.format, PayloadFormat::Json);
        assert_eq!(parsed.alias_hint.as_deref(), Some("Xray Tokyo"));
        assert!(matches!(parsed.body.protocol, Outbound::Vless(ref v) if v.flow == "xtls-rprx-vision"));
        assert!(matches!(parsed.body.transport, Some(Transport::Tcp(_))));
        assert!(matches!(parsed.body.security, Security::Reality(ref r) if r.public_key == "PUBKEY"));
    }

    #[test]
    fn normalizes_yaml_outbound() {
        let yaml = "\
protocol: trojan
settings:
  servers:
    - address: trojan.example.com
      port: 443
      password: secret
streamSettings:
  network: ws
  security: tls
  wsSettings:
    path: /tj
  tlsSettings:
    serverName: trojan.example.com
    alpn: [h2, http/1.1]
";
        let parsed = parse_payload(yaml, Some(PayloadFormat::Yaml)).unwrap();
        assert!(matches!(parsed.body.transport, Some(Transport::Ws(ref ws)) if ws.path == "/tj"));
        assert!(matches!(parsed.body.security, Security::Tls(ref t) if t.alpn.len() == 2));
        assert_eq!(parsed.alias_hint, None);
    }

    #[test]
    fn normalizes_toml_internal_schema() {
        let toml = r#"
alias = "Home SS"

[protocol]
type = "shadowsocks"
address = "10.0.0.1"
port = 8388
method = "aes-256-gcm"
password = "pw"
"#;
        let parsed = parse_payload(toml, None).unwrap();
        assert_eq!(parsed.format, PayloadFormat::Toml);
        assert_eq!(parsed.alias_hint.as_deref(), Some("Home SS"));
        assert!(matches!(parsed.body.protocol, Outbound::Shadowsocks(ref s) if s.port == 8388));
    }

    #[test]
    fn normalizes_clash_document() {
        let yaml = "\
proxies:
  - name: Info
    type: http
    server: 1.1.1.1
    port: 80
  - name: SG
    type: ss
    server: sg.example.com
    port: 8388
    cipher: aes-128-gcm
    password: pw
";
        let parsed = parse_payload(yaml, None).unwrap();
        assert_eq!(parsed.alias_hint.as_deref(), Some("SG"));
        assert!(matches!(parsed.body.protocol, Outbound::Shadowsocks(_)));
    }

    #[test]
    fn malformed_payloads_are_parse_errors() {
        for content in ["{\"outbounds\": [", "just some words", "protocol = = broken"] {
            let err = parse_payload(content, None).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Parse, "content: {content}");
        }

        let err = parse_payload(r#"{"protocol": "wireguard"}"#, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn missing_required_fields_are_validation_errors() {
        let missing_user = r#"{"protocol": "vmess", "settings": {"vnext": [{"address": "a.com", "port": 443, "users": []}]}}"#;
        assert_eq!(
            parse_payload(missing_user, None).unwrap_err().kind(),
            ErrorKind::Validation
        );

        let missing_port = r#"{"protocol": {"type": "trojan", "address": "a.com", "password": "x"}}"#;
        assert_eq!(
            parse_payload(missing_port, None).unwrap_err().kind(),
            ErrorKind::Validation
        );

        let empty_address = r#"{"protocol": "trojan", "settings": {"servers": [{"address": "", "port": 443, "password": "x"}]}}"#;
        assert_eq!(
            parse_payload(empty_address, None).unwrap_err().kind(),
            ErrorKind::Validation
        );
    }
}
