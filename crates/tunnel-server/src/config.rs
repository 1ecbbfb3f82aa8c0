//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::Path;
use tracing::info;
use tunnel_core::{TunnelError, TunnelResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub gateway: GatewaySection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_true")]
    pub auto_bind_server: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            server_port: default_server_port(),
            auto_bind_server: true,
        }
    }
}

/// `[gateway]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_max_tunnels")]
    pub max_tunnels: usize,
    /// `None` means "use an ephemeral port for every gateway".
    #[serde(default = "default_port_min")]
    pub port_range_min: Option<u16>,
    #[serde(default = "default_port_max")]
    pub port_range_max: u16,
    #[serde(default = "default_max_channels_per_tunnel")]
    pub max_channels_per_tunnel: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            max_tunnels: default_max_tunnels(),
            port_range_min: default_port_min(),
            port_range_max: default_port_max(),
            max_channels_per_tunnel: default_max_channels_per_tunnel(),
        }
    }
}

fn default_server_port() -> u16 {
    4001
}
fn default_max_tunnels() -> usize {
    3
}
fn default_port_min() -> Option<u16> {
    Some(4002)
}
fn default_port_max() -> u16 {
    4003
}
fn default_max_channels_per_tunnel() -> usize {
    256
}
fn default_true() -> bool {
    true
}

/// Resolved server configuration (TOML file values merged with CLI
/// overrides).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen port when no external transport is provided.
    pub server_port: u16,
    /// If false, the caller must invoke `TunnelServer::run` explicitly
    /// rather than having it start automatically.
    pub auto_bind_server: bool,
    /// Hard cap on concurrent gateways.
    pub max_tunnels: usize,
    /// Inclusive range for gateway port leasing. `None` min means ephemeral.
    pub port_range_min: Option<u16>,
    pub port_range_max: u16,
    /// Bound on live `quid`s per tunnel (resource-exhaustion guard).
    pub max_channels_per_tunnel: usize,
}

impl ServerConfig {
    /// Load configuration from a TOML file, then apply CLI overrides. If
    /// `config_path` does not exist, defaults are used silently.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_max_tunnels: Option<usize>,
    ) -> TunnelResult<Self> {
        let file_config = if let Some(path) = config_path {
            if path.exists() {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(path)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| TunnelError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        Ok(Self {
            server_port: cli_port.unwrap_or(file_config.server.server_port),
            auto_bind_server: file_config.server.auto_bind_server,
            max_tunnels: cli_max_tunnels.unwrap_or(file_config.gateway.max_tunnels),
            port_range_min: file_config.gateway.port_range_min,
            port_range_max: file_config.gateway.port_range_max,
            max_channels_per_tunnel: file_config.gateway.max_channels_per_tunnel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = ServerConfig::load(None, None, None).unwrap();
        assert_eq!(config.server_port, 4001);
        assert_eq!(config.max_tunnels, 3);
        assert_eq!(config.port_range_min, Some(4002));
        assert_eq!(config.port_range_max, 4003);
        assert!(config.auto_bind_server);
    }

    #[test]
    fn cli_overrides_file_defaults() {
        let config = ServerConfig::load(None, Some(9999), Some(10)).unwrap();
        assert_eq!(config.server_port, 9999);
        assert_eq!(config.max_tunnels, 10);
    }
}
