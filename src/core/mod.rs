pub mod config;
pub mod error;
pub mod event;
pub mod form;
pub mod model;
pub mod selection;
pub mod store;
