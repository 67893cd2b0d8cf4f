//! 隧道传输接口
//!
//! 核心层只通过此 Trait 驱动隧道，状态由实现方独占维护。

use async_trait::async_trait;
use tokio::sync::watch;

use crate::core::error::Result;
use crate::core::model::{Configuration, TunnelStatus};

/// 隧道传输 Trait
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    /// 以给定配置启动隧道
    async fn start(&self, configuration: &Configuration) -> Result<()>;

    /// 停止隧道，空闲时调用为无操作
    async fn stop(&self);

    /// 当前状态快照
    fn status(&self) -> TunnelStatus;

    /// 订阅状态变化
    fn subscribe_status(&self) -> watch::Receiver<TunnelStatus>;
}
