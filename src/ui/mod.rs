pub mod console;
pub mod notify;

pub use console::Ui;
pub use notify::LogNotifier;
