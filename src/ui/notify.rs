use tracing::{info, warn};

use crate::interfaces::{Notification, NotificationSink};

/// 通过日志输出提示消息，失败类消息使用 warn 级别
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn send(&self, notification: Notification) {
        let heading: Vec<&str> = [notification.title.as_str(), notification.subtitle.as_str()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();
        let message = if heading.is_empty() {
            notification.body
        } else {
            format!("[{}] {}", heading.join(" / "), notification.body)
        };

        if message.contains("失败") {
            warn!("🔔 {}", message);
        } else {
            info!("🔔 {}", message);
        }
    }
}
