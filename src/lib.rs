pub mod app;
pub mod bot;
pub mod client;
pub mod config;
pub mod error;
pub mod exchange;
pub mod notifications;
pub mod store;
pub mod types;
