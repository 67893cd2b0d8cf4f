//! 配置管理系统 (Configuration Management)
//!
//! 负责 `mango.toml` 的反序列化及其层级结构映射，支持环境变量与默认值回退机制。

use std::path::{Path, PathBuf};
use std::time::Duration;

use bon::Builder;
use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::Deserialize;

use crate::core::error::{MangoError, Result};

const DEFAULT_CONFIG_FILE: &str = "mango.toml";

/// 全局应用配置
#[derive(Debug, Deserialize, Builder, Clone)]
pub struct AppConfig {
    /// 配置记录持久化根目录
    #[serde(default = "default_data_dir")]
    #[builder(default = default_data_dir())]
    pub data_dir: PathBuf,

    /// 订阅拉取参数
    #[serde(default)]
    #[builder(default)]
    pub subscription: SubscriptionConfig,

    /// 隧道进程 (sing-box) 相关配置
    #[serde(default)]
    #[builder(default)]
    pub singbox: SingboxConfig,

    /// 隧道协调参数
    #[serde(default)]
    #[builder(default)]
    pub tunnel: TunnelConfig,
}

/// 订阅拉取配置
#[derive(Debug, Deserialize, Builder, Clone)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// 单次请求超时 (秒)
    pub timeout_secs: u64,
    pub user_agent: String,
}

/// 隧道进程配置
#[derive(Debug, Deserialize, Builder, Clone)]
#[serde(default)]
pub struct SingboxConfig {
    /// 二进制执行文件搜索路径
    pub bin_path: String,
    /// 本地混合入站监听地址
    pub listen: String,
    pub proxy_port: u16,
    pub api_port: u16,
    pub api_secret: String,
    pub log_level: String,
    /// 等待控制 API 就绪的上限 (秒)
    pub ready_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Builder, Clone)]
#[serde(default)]
pub struct TunnelConfig {
    /// 重启前等待隧道静止的上限 (秒)
    pub quiescence_timeout_secs: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            user_agent: format!("mango/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for SingboxConfig {
    fn default() -> Self {
        Self {
            bin_path: "bin".to_string(),
            listen: "127.0.0.1".to_string(),
            proxy_port: 7890,
            api_port: 9090,
            api_secret: String::new(),
            log_level: "info".to_string(),
            ready_timeout_secs: 10,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            quiescence_timeout_secs: 10,
        }
    }
}

impl SubscriptionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl TunnelConfig {
    pub fn quiescence_timeout(&self) -> Duration {
        Duration::from_secs(self.quiescence_timeout_secs)
    }
}

fn default_data_dir() -> PathBuf {
    ProjectDirs::from("", "", "mango")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("data"))
}

impl AppConfig {
    /// 加载配置：配置文件 (可选) + `MANGO_` 前缀环境变量
    ///
    /// 显式指定的路径必须存在；默认的 `mango.toml` 缺失时使用内置默认值。
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix("MANGO").separator("__"))
            .build()
            .map_err(MangoError::Config)?;
        settings.try_deserialize().map_err(MangoError::Config)
    }

    /// 配置记录存放目录
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("configurations")
    }

    /// 隧道运行时文件目录 (生成的配置与日志)
    pub fn runtime_dir(&self) -> PathBuf {
        self.data_dir.join("runtime")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mango.toml");
        std::fs::write(
            &path,
            "data_dir = \"/tmp/mango\"\n[singbox]\nproxy_port = 1080\n",
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/mango"));
        assert_eq!(config.singbox.proxy_port, 1080);
        assert_eq!(config.singbox.api_port, 9090);
        assert_eq!(config.subscription.timeout_secs, 15);
        assert_eq!(config.tunnel.quiescence_timeout(), Duration::from_secs(10));
        assert_eq!(config.store_dir(), PathBuf::from("/tmp/mango/configurations"));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = AppConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, MangoError::Config(_)));
    }

    #[test]
    fn builder_defaults_match_serde_defaults() {
        let config = AppConfig::builder().data_dir(PathBuf::from("x")).build();
        assert_eq!(config.singbox.listen, "127.0.0.1");
        assert_eq!(config.tunnel.quiescence_timeout_secs, 10);
        assert!(config.subscription.user_agent.starts_with("mango/"));
    }
}
