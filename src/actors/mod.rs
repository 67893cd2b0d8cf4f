pub mod tunnel;

pub use tunnel::TunnelCoordinator;
