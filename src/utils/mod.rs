pub mod format;
pub mod share_link;
pub mod singbox;
