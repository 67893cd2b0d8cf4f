//! 错误处理体系 (Error Handling System)
//!
//! 定义配置生命周期相关的错误类型、错误分类以及全局 Result 别名。

use std::path::PathBuf;

use strum::Display;
use thiserror::Error;

use crate::core::model::ConfigurationId;

/// 错误分类 (Error Taxonomy)
///
/// 不携带数据，便于调用方穿透上下文包装进行匹配。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ErrorKind {
    NotFound,
    DuplicateId,
    AlreadyInProgress,
    InUse,
    InvalidName,
    UnsupportedSource,
    Network,
    Parse,
    Validation,
    Tunnel,
    Cancelled,
    Io,
    Serialization,
    StoreCorrupted,
    Config,
}

/// 全局错误定义 (Mango Domain Errors)
#[derive(Error, Debug)]
pub enum MangoError {
    #[error("Configuration not found: {0}")]
    NotFound(ConfigurationId),

    #[error("Duplicate configuration id: {0}")]
    DuplicateId(ConfigurationId),

    #[error("Download already in progress: {0}")]
    AlreadyInProgress(ConfigurationId),

    #[error("Configuration is in use by an in-flight download: {0}")]
    InUse(ConfigurationId),

    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    /// 本地文件来源的配置不支持远程刷新
    #[error("Local configuration cannot be refreshed remotely: {0}")]
    UnsupportedSource(ConfigurationId),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Parsing error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 持久化数据无法解析，禁止自动修复
    #[error("Store corrupted at {}: {reason}", path.display())]
    StoreCorrupted { path: PathBuf, reason: String },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// 附带配置上下文 (ID, 别名) 的错误包装
    #[error("\"{alias}\" ({id}): {source}")]
    Context {
        id: ConfigurationId,
        alias: String,
        #[source]
        source: Box<MangoError>,
    },
}

/// 全局 Result 别名
pub type Result<T> = std::result::Result<T, MangoError>;

impl MangoError {
    /// 提取错误分类
    ///
    /// 对 `Context` 包装逐层解包。
    pub fn kind(&self) -> ErrorKind {
        match self {
            MangoError::NotFound(_) => ErrorKind::NotFound,
            MangoError::DuplicateId(_) => ErrorKind::DuplicateId,
            MangoError::AlreadyInProgress(_) => ErrorKind::AlreadyInProgress,
            MangoError::InUse(_) => ErrorKind::InUse,
            MangoError::InvalidName(_) => ErrorKind::InvalidName,
            MangoError::UnsupportedSource(_) => ErrorKind::UnsupportedSource,
            MangoError::Network(_) => ErrorKind::Network,
            MangoError::Parse(_) => ErrorKind::Parse,
            MangoError::Validation(_) => ErrorKind::Validation,
            MangoError::Tunnel(_) => ErrorKind::Tunnel,
            MangoError::Cancelled => ErrorKind::Cancelled,
            MangoError::Io(_) => ErrorKind::Io,
            MangoError::Serialization(_) => ErrorKind::Serialization,
            MangoError::StoreCorrupted { .. } => ErrorKind::StoreCorrupted,
            MangoError::Config(_) => ErrorKind::Config,
            MangoError::Context { source, .. } => source.kind(),
        }
    }

    /// 附加配置上下文，已包装的错误保持原样
    pub fn with_context(self, id: &ConfigurationId, alias: &str) -> Self {
        match self {
            MangoError::Context { .. } => self,
            other => MangoError::Context {
                id: id.clone(),
                alias: alias.to_string(),
                source: Box::new(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_reaches_through_context() {
        let id = ConfigurationId::from("abc");
        let err = MangoError::InUse(id.clone()).with_context(&id, "Home");
        assert_eq!(err.kind(), ErrorKind::InUse);
        assert!(err.to_string().contains("\"Home\""));
    }

    #[test]
    fn context_is_not_nested_twice() {
        let id = ConfigurationId::from("abc");
        let err = MangoError::Cancelled
            .with_context(&id, "first")
            .with_context(&id, "second");
        match err {
            MangoError::Context { alias, source, .. } => {
                assert_eq!(alias, "first");
                assert!(matches!(*source, MangoError::Cancelled));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
