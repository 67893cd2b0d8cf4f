//! 分享链接与 Clash 节点解析 (Share Link Ingestion)
//!
//! 解析 `vless://`、`vmess://`、`trojan://`、`ss://` 链接 (含 Base64 包装的链接列表)
//! 以及 Clash `proxies` 条目，归一化为内部配置负载。

use std::borrow::Cow;
use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::core::error::{MangoError, Result};
use crate::core::model::{
    Body, GrpcSettings, HttpSettings, KcpSettings, Outbound, QuicSettings, RealitySettings,
    Security, Shadowsocks, TcpSettings, TlsSettings, Transport, Trojan, Vless, Vmess, WsSettings,
};

const SCHEMES: &[&str] = &["vless", "vmess", "trojan", "ss"];

type Query<'a> = HashMap<Cow<'a, str>, Cow<'a, str>>;

/// 执行启发式 Base64 解码 (Heuristic Decoding)
pub fn decode_base64_auto(input: &str) -> Result<String> {
    let clean: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let engines = [
        &general_purpose::STANDARD,
        &general_purpose::STANDARD_NO_PAD,
        &general_purpose::URL_SAFE_NO_PAD,
        &general_purpose::URL_SAFE,
    ];

    for engine in engines {
        if let Ok(b) = engine.decode(&clean) {
            return Ok(String::from_utf8_lossy(&b).to_string());
        }
    }
    Err(MangoError::Parse("Base64 decode failed".to_string()))
}

/// 判断文本首行是否为受支持的分享链接
pub fn looks_like_link(text: &str) -> bool {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.split_once("://"))
        .is_some_and(|(scheme, _)| SCHEMES.contains(&scheme))
}

/// 订阅中的提示类伪节点 (流量、到期等)
fn is_informational(tag: &str) -> bool {
    const BLOCKLIST: &[&str] = &[
        "广告", "官网", "流量", "重置", "群", "客服", "更新", "订阅", "到期", "expire",
    ];
    BLOCKLIST.iter().any(|&k| tag.contains(k))
}

/// 从链接列表中取第一个有效节点
///
/// 没有可识别的链接时返回 `Parse`；识别出的链接均缺少必填字段时返回首个 `Validation`。
pub fn parse_links(content: &str) -> Result<(Body, String)> {
    let content = content.trim();
    let decoded = if looks_like_link(content) {
        content.to_string()
    } else {
        decode_base64_auto(content)?
    };

    let mut first_invalid = None;
    for line in decoded.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((protocol, rest)) = line.split_once("://") else {
            continue;
        };
        let parsed = match protocol {
            "vmess" => parse_vmess(rest),
            "vless" => parse_vless(line),
            "ss" => parse_ss(line),
            "trojan" => parse_trojan(line),
            _ => None,
        };
        let Some((body, tag)) = parsed else {
            debug!("Skipping unparsable {} link", protocol);
            continue;
        };
        if is_informational(&tag) {
            continue;
        }
        match body.validate() {
            Ok(()) => return Ok((body, tag)),
            Err(e) => {
                first_invalid.get_or_insert(e);
            }
        }
    }

    Err(first_invalid
        .unwrap_or_else(|| MangoError::Parse("No valid share link discovered".to_string())))
}

// --- Protocol-specific Deserializers ---

fn json_as_u64(v: &Value) -> Option<u64> {
    v.as_u64().or_else(|| v.as_str()?.parse().ok())
}

/// 越界端口归零，交由 `Body::validate` 报告
fn json_as_port(v: &Value) -> Option<u16> {
    json_as_u64(v).map(|p| u16::try_from(p).unwrap_or(0))
}

fn json_as_u16(v: &Value) -> Option<u16> {
    json_as_u64(v).and_then(|n| u16::try_from(n).ok())
}

fn fragment_tag(url: &Url, fallback: &str) -> String {
    percent_encoding::percent_decode_str(url.fragment().unwrap_or(fallback))
        .decode_utf8_lossy()
        .to_string()
}

fn parse_vmess(body: &str) -> Option<(Body, String)> {
    let decoded = decode_base64_auto(body).ok()?;
    let v: Value = serde_json::from_str(&decoded).ok()?;
    let field = |key: &str| v.get(key).and_then(|s| s.as_str()).unwrap_or_default().to_string();

    let header_type = v.get("type").and_then(|s| s.as_str()).unwrap_or("none").to_string();
    let transport = match v.get("net").and_then(|s| s.as_str()).unwrap_or("tcp") {
        "tcp" => Some(Transport::Tcp(TcpSettings { header_type })),
        "kcp" => Some(Transport::Kcp(KcpSettings {
            header_type,
            seed: field("path"),
            ..Default::default()
        })),
        "ws" => Some(Transport::Ws(WsSettings {
            path: v.get("path").and_then(|s| s.as_str()).unwrap_or("/").to_string(),
            host: field("host"),
        })),
        "h2" | "http" => Some(Transport::Http(HttpSettings {
            path: v.get("path").and_then(|s| s.as_str()).unwrap_or("/").to_string(),
            hosts: split_list(&field("host")),
        })),
        "quic" => Some(Transport::Quic(QuicSettings {
            security: v.get("host").and_then(|s| s.as_str()).unwrap_or("none").to_string(),
            key: field("path"),
            header_type,
        })),
        "grpc" => Some(Transport::Grpc(GrpcSettings {
            service_name: field("path"),
            multi_mode: header_type == "multi",
        })),
        _ => return None,
    };

    let security = match v.get("tls").and_then(|s| s.as_str()) {
        Some("tls") => Security::Tls(TlsSettings {
            server_name: field("sni"),
            alpn: split_list(&field("alpn")),
            fingerprint: v.get("fp").and_then(|s| s.as_str()).unwrap_or("chrome").to_string(),
            allow_insecure: false,
        }),
        _ => Security::None,
    };

    let tag = v.get("ps").and_then(|s| s.as_str()).unwrap_or("vmess").to_string();
    let outbound = Outbound::Vmess(Vmess {
        address: v.get("add")?.as_str()?.to_string(),
        port: json_as_port(v.get("port")?)?,
        id: field("id"),
        alter_id: v.get("aid").and_then(json_as_u16).unwrap_or(0),
        security: v.get("scy").and_then(|s| s.as_str()).unwrap_or("auto").to_string(),
    });

    Some((
        Body {
            protocol: outbound,
            transport,
            security,
        },
        tag,
    ))
}

fn parse_ss(line: &str) -> Option<(Body, String)> {
    let (link, fragment) = line.split_once('#').unwrap_or((line, "ss"));
    let tag = percent_encoding::percent_decode_str(fragment)
        .decode_utf8_lossy()
        .to_string();

    // SIP002: ss://base64(method:password)@host:port
    if let Ok(url) = Url::parse(link)
        && let (Some(host), Some(port)) = (url.host_str(), url.port())
    {
        let username = percent_encoding::percent_decode_str(url.username())
            .decode_utf8_lossy()
            .to_string();
        let user_info = decode_base64_auto(&username).unwrap_or(username);
        let (method, password) = user_info.split_once(':')?;
        let outbound = Outbound::Shadowsocks(Shadowsocks {
            address: host.to_string(),
            port,
            method: method.to_string(),
            password: password.to_string(),
        });
        return Some((Body::new(outbound), tag));
    }

    // 旧格式: ss://base64(method:password@host:port)
    let body = link.strip_prefix("ss://")?;
    let decoded = decode_base64_auto(body).ok()?;
    let (auth, addr) = decoded.rsplit_once('@')?;
    let (method, password) = auth.split_once(':')?;
    let (host, port_str) = addr.rsplit_once(':')?;

    let outbound = Outbound::Shadowsocks(Shadowsocks {
        address: host.to_string(),
        port: port_str.parse().ok()?,
        method: method.to_string(),
        password: password.to_string(),
    });
    Some((Body::new(outbound), tag))
}

fn parse_trojan(line: &str) -> Option<(Body, String)> {
    let url = Url::parse(line).ok()?;
    let query: Query = url.query_pairs().collect();

    // trojan 默认走 TLS
    let security = match query.get("security").map(|s| s.as_ref()) {
        Some("none") => Security::None,
        Some("reality") => reality_from_query(&query, &url),
        _ => tls_from_query(&query, &url),
    };

    let outbound = Outbound::Trojan(Trojan {
        address: url.host_str()?.to_string(),
        port: url.port()?,
        password: percent_encoding::percent_decode_str(url.username())
            .decode_utf8_lossy()
            .to_string(),
    });

    Some((
        Body {
            protocol: outbound,
            transport: transport_from_query(&query),
            security,
        },
        fragment_tag(&url, "trojan"),
    ))
}

fn parse_vless(line: &str) -> Option<(Body, String)> {
    let url = Url::parse(line).ok()?;
    let query: Query = url.query_pairs().collect();

    let security = match query.get("security").map(|s| s.as_ref()) {
        Some("tls") | Some("xtls") => tls_from_query(&query, &url),
        Some("reality") => reality_from_query(&query, &url),
        _ => Security::None,
    };

    let outbound = Outbound::Vless(Vless {
        address: url.host_str()?.to_string(),
        port: url.port()?,
        id: url.username().to_string(),
        encryption: query
            .get("encryption")
            .map(|s| s.to_string())
            .unwrap_or_else(|| "none".to_string()),
        flow: query.get("flow").map(|s| s.to_string()).unwrap_or_default(),
    });

    Some((
        Body {
            protocol: outbound,
            transport: transport_from_query(&query),
            security,
        },
        fragment_tag(&url, "vless"),
    ))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn server_name(query: &Query, url: &Url) -> String {
    query
        .get("sni")
        .or_else(|| query.get("peer"))
        .map(|s| s.to_string())
        .or_else(|| url.host_str().map(|s| s.to_string()))
        .unwrap_or_default()
}

fn tls_from_query(query: &Query, url: &Url) -> Security {
    Security::Tls(TlsSettings {
        server_name: server_name(query, url),
        alpn: query.get("alpn").map(|s| split_list(s)).unwrap_or_default(),
        fingerprint: query
            .get("fp")
            .map(|s| s.to_string())
            .unwrap_or_else(|| "chrome".to_string()),
        allow_insecure: query
            .get("allowInsecure")
            .is_some_and(|s| s == "1" || s == "true"),
    })
}

fn reality_from_query(query: &Query, url: &Url) -> Security {
    Security::Reality(RealitySettings {
        server_name: server_name(query, url),
        fingerprint: query
            .get("fp")
            .map(|s| s.to_string())
            .unwrap_or_else(|| "chrome".to_string()),
        public_key: query.get("pbk").map(|s| s.to_string()).unwrap_or_default(),
        short_id: query.get("sid").map(|s| s.to_string()).unwrap_or_default(),
        spider_x: query.get("spx").map(|s| s.to_string()).unwrap_or_default(),
    })
}

fn transport_from_query(query: &Query) -> Option<Transport> {
    let get = |key: &str| query.get(key).map(|s| s.to_string());
    let header_type = get("headerType").unwrap_or_else(|| "none".to_string());

    match query.get("type").map(|s| s.as_ref()) {
        Some("tcp") => Some(Transport::Tcp(TcpSettings { header_type })),
        Some("kcp") => Some(Transport::Kcp(KcpSettings {
            header_type,
            seed: get("seed").unwrap_or_default(),
            ..Default::default()
        })),
        Some("ws") => Some(Transport::Ws(WsSettings {
            path: get("path").unwrap_or_else(|| "/".to_string()),
            host: get("host").unwrap_or_default(),
        })),
        Some("http") | Some("h2") => Some(Transport::Http(HttpSettings {
            path: get("path").unwrap_or_else(|| "/".to_string()),
            hosts: get("host").map(|h| split_list(&h)).unwrap_or_default(),
        })),
        Some("quic") => Some(Transport::Quic(QuicSettings {
            security: get("quicSecurity").unwrap_or_else(|| "none".to_string()),
            key: get("key").unwrap_or_default(),
            header_type,
        })),
        Some("grpc") => Some(Transport::Grpc(GrpcSettings {
            service_name: get("serviceName").unwrap_or_default(),
            multi_mode: query.get("mode").is_some_and(|m| m == "multi"),
        })),
        _ => None,
    }
}

/// 解析单个 Clash `proxies` 条目
pub fn parse_clash_proxy(p: &Value) -> Option<(Body, String)> {
    let tag = p.get("name")?.as_str()?.to_string();
    let address = p.get("server")?.as_str()?.to_string();
    let port = json_as_port(p.get("port")?)?;
    let str_of = |key: &str| p.get(key).and_then(|v| v.as_str()).unwrap_or_default().to_string();

    let transport = match p.get("network").and_then(|v| v.as_str()) {
        Some("ws") => Some(Transport::Ws(WsSettings {
            path: p
                .get("ws-opts")
                .and_then(|o| o.get("path"))
                .and_then(|v| v.as_str())
                .unwrap_or("/")
                .to_string(),
            host: p
                .get("ws-opts")
                .and_then(|o| o.get("headers"))
                .and_then(|h| h.get("Host"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        })),
        Some("h2") | Some("http") => Some(Transport::Http(HttpSettings {
            path: p
                .get("h2-opts")
                .and_then(|o| o.get("path"))
                .and_then(|v| v.as_str())
                .unwrap_or("/")
                .to_string(),
            hosts: p
                .get("h2-opts")
                .and_then(|o| o.get("host"))
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default(),
        })),
        Some("grpc") => Some(Transport::Grpc(GrpcSettings {
            service_name: p
                .get("grpc-opts")
                .and_then(|o| o.get("grpc-service-name"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            multi_mode: false,
        })),
        _ => None,
    };

    let server_name = p
        .get("servername")
        .or_else(|| p.get("sni"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let fingerprint = p
        .get("client-fingerprint")
        .and_then(|v| v.as_str())
        .unwrap_or("chrome")
        .to_string();

    let security = if let Some(reality) = p.get("reality-opts") {
        Security::Reality(RealitySettings {
            server_name,
            fingerprint,
            public_key: reality
                .get("public-key")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            short_id: reality
                .get("short-id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            spider_x: String::new(),
        })
    } else if p.get("tls").and_then(|v| v.as_bool()).unwrap_or(false)
        || p.get("type").and_then(|v| v.as_str()) == Some("trojan")
    {
        Security::Tls(TlsSettings {
            server_name,
            alpn: p
                .get("alpn")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default(),
            fingerprint,
            allow_insecure: p
                .get("skip-cert-verify")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        })
    } else {
        Security::None
    };

    let outbound = match p.get("type")?.as_str()? {
        "ss" => Outbound::Shadowsocks(Shadowsocks {
            address,
            port,
            method: str_of("cipher"),
            password: str_of("password"),
        }),
        "vmess" => Outbound::Vmess(Vmess {
            address,
            port,
            id: str_of("uuid"),
            alter_id: p.get("alterId").and_then(json_as_u16).unwrap_or(0),
            security: p
                .get("cipher")
                .and_then(|v| v.as_str())
                .unwrap_or("auto")
                .to_string(),
        }),
        "vless" => Outbound::Vless(Vless {
            address,
            port,
            id: str_of("uuid"),
            encryption: "none".to_string(),
            flow: str_of("flow"),
        }),
        "trojan" => Outbound::Trojan(Trojan {
            address,
            port,
            password: str_of("password"),
        }),
        _ => return None,
    };

    let protocol_type = outbound.protocol_type();
    Some((
        Body {
            protocol: outbound,
            transport: transport.filter(|_| protocol_type.is_transport_available()),
            security: if protocol_type.is_security_available() {
                security
            } else {
                Security::None
            },
        },
        tag,
    ))
}
