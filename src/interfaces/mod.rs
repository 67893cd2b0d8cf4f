pub mod notify;
pub mod tunnel;

pub use notify::{Notification, NotificationSink};
pub use tunnel::TunnelTransport;
