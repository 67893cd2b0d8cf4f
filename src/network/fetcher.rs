//! 订阅拉取服务 (Subscription Fetcher)
//!
//! 从远程地址或本地文件获取配置载荷，完成格式识别、解析与校验。不写入任何持久化状态。

use std::path::Path;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::core::config::SubscriptionConfig;
use crate::core::error::{MangoError, Result};
use crate::core::model::Source;
use crate::utils::format::{self, ParsedBody, PayloadFormat};

/// 订阅拉取 Trait
#[async_trait]
pub trait SubscriptionFetcher: Send + Sync {
    /// 获取并解析来源对应的配置负载
    ///
    /// 令牌取消时返回 `Cancelled`。
    async fn fetch(&self, source: &Source, cancel: &CancellationToken) -> Result<ParsedBody>;
}

/// 基于 reqwest 的默认实现
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &SubscriptionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(MangoError::Network)?;
        Ok(Self { client })
    }

    async fn fetch_remote(&self, url: &Url) -> Result<ParsedBody> {
        info!("Fetching subscription: {}", url);
        let resp = self.client.get(url.clone()).send().await?.error_for_status()?;

        let declared = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(PayloadFormat::from_content_type)
            .or_else(|| PayloadFormat::from_path(Path::new(url.path())));
        let content = resp.text().await?;
        debug!("Received {} bytes from {}", content.len(), url);

        format::parse_payload(&content, declared)
    }

    async fn fetch_local(&self, path: &Path) -> Result<ParsedBody> {
        info!("Reading configuration file: {}", path.display());
        let content = tokio::fs::read_to_string(path).await?;
        format::parse_payload(&content, PayloadFormat::from_path(path))
    }
}

#[async_trait]
impl SubscriptionFetcher for HttpFetcher {
    async fn fetch(&self, source: &Source, cancel: &CancellationToken) -> Result<ParsedBody> {
        let work = async {
            match source {
                Source::Remote(url) => self.fetch_remote(url).await,
                Source::Local(path) => self.fetch_local(path).await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Fetch cancelled: {}", source);
                Err(MangoError::Cancelled)
            }
            result = work => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::SubscriptionConfig;
    use crate::core::error::ErrorKind;
    use crate::core::model::Outbound;

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(&SubscriptionConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn reads_local_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");
        std::fs::write(
            &path,
            "protocol:\n  type: trojan\n  address: t.example.com\n  port: 443\n  password: pw\n",
        )
        .unwrap();

        let parsed = fetcher()
            .fetch(&Source::Local(path), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(parsed.format, PayloadFormat::Yaml);
        assert!(matches!(parsed.body.protocol, Outbound::Trojan(_)));
    }

    #[tokio::test]
    async fn missing_local_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = fetcher()
            .fetch(&Source::Local(dir.path().join("nope.json")), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        // 不可路由地址，仅依赖取消分支返回
        let source = Source::Remote(Url::parse("http://10.255.255.1/sub").unwrap());
        let err = fetcher().fetch(&source, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
