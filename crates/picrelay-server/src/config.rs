//! Server configuration: TOML file + CLI overrides.

use picrelay_core::{RelayError, RelayResult};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub cors: CorsSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_frame_size: default_max_frame_size(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// `[cors]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CorsSection {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_port() -> u16 {
    5001
}
fn default_max_frame_size() -> usize {
    1_048_576
}
fn default_outbound_queue() -> usize {
    64
}

/// Values given on the command line; `None` keeps the file/default value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub allowed_origins: Vec<String>,
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub max_frame_size: usize,
    pub outbound_queue: usize,
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), CliOverrides::default())
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// A missing file falls back to defaults; an unreadable or invalid one is
    /// an error.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| RelayError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let config = Self::resolve(file_config, cli);
        if config.outbound_queue == 0 {
            return Err(RelayError::Config("outbound_queue must be at least 1".into()));
        }
        Ok(config)
    }

    fn resolve(file_config: ConfigFile, cli: CliOverrides) -> Self {
        let bind = cli.bind.unwrap_or(file_config.server.bind);
        let port = cli.port.unwrap_or(file_config.server.port);
        let allowed_origins = if cli.allowed_origins.is_empty() {
            file_config.cors.allowed_origins
        } else {
            cli.allowed_origins
        };

        Self {
            bind_addr: SocketAddr::new(bind, port),
            max_frame_size: file_config.server.max_frame_size,
            outbound_queue: file_config.server.outbound_queue,
            allowed_origins,
        }
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
