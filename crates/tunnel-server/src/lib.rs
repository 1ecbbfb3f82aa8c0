pub mod allocator;
pub mod config;
pub mod gateway;
pub mod server;

pub use config::ServerConfig;
pub use server::{CreatedGateway, ServerEvent, TunnelServer};
