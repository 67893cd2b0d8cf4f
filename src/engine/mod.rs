pub mod downloads;
pub mod manager;

pub use downloads::DownloadSet;
pub use manager::ConfigurationListManager;
