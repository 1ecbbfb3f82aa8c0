pub mod client;
pub mod config;

pub use client::{ClientEvent, ReadyState, TunnelClient};
pub use config::ClientConfig;
