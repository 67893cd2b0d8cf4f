//! 用户通知接口

/// 提示消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub subtitle: String,
    pub body: String,
}

impl Notification {
    pub fn new(
        title: impl Into<String>,
        subtitle: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            subtitle: subtitle.into(),
            body: body.into(),
        }
    }
}

/// 通知投递 Trait (即发即弃)
pub trait NotificationSink: Send + Sync {
    fn send(&self, notification: Notification);
}
