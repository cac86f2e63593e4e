//! Server configuration management

use crate::network::ReactorConfig;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address the USB/IP listener binds on link-up
    #[serde(default = "ServerSettings::default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "ServerSettings::default_log_level")]
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: Self::default_bind_addr(),
            log_level: Self::default_log_level(),
        }
    }
}

impl ServerSettings {
    fn default_bind_addr() -> String {
        "0.0.0.0:3240".to_string()
    }

    fn default_log_level() -> String {
        "info".to_string()
    }
}

/// Connection and session limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Concurrent client connections; further clients are closed on accept
    #[serde(default = "SessionSettings::default_max_connections")]
    pub max_connections: usize,
    /// Seconds without socket activity before a connection is closed
    #[serde(default = "SessionSettings::default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Seconds between idle sweeps
    #[serde(default = "SessionSettings::default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "SessionSettings::default_read_chunk_size")]
    pub read_chunk_size: usize,
    /// Largest transfer buffer accepted in CMD_SUBMIT (bytes)
    #[serde(default = "SessionSettings::default_max_transfer_buffer")]
    pub max_transfer_buffer: u32,
    /// Unsent reply bytes at which a connection stops reading
    #[serde(default = "SessionSettings::default_max_send_buffer")]
    pub max_send_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_connections: Self::default_max_connections(),
            idle_timeout_secs: Self::default_idle_timeout(),
            sweep_interval_secs: Self::default_sweep_interval(),
            read_chunk_size: Self::default_read_chunk_size(),
            max_transfer_buffer: Self::default_max_transfer_buffer(),
            max_send_buffer: Self::default_max_send_buffer(),
        }
    }
}

impl SessionSettings {
    fn default_max_connections() -> usize {
        64
    }

    fn default_idle_timeout() -> u64 {
        60
    }

    fn default_sweep_interval() -> u64 {
        10
    }

    fn default_read_chunk_size() -> usize {
        1536
    }

    fn default_max_transfer_buffer() -> u32 {
        protocol::MAX_TRANSFER_BUFFER_LENGTH
    }

    fn default_max_send_buffer() -> usize {
        4 * 1024 * 1024
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// `VID:PID` filters for exported host devices; empty exports all
    #[serde(default)]
    pub filters: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            session: SessionSettings::default(),
            usb: UsbSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbip-bridge/server.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbip-bridge").join("server.toml")
        } else {
            PathBuf::from(".config/usbip-bridge/server.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            ));
        }

        self.bind_addr()?;

        let session = &self.session;
        for (name, value) in [
            ("max_connections", session.max_connections as u64),
            ("idle_timeout_secs", session.idle_timeout_secs),
            ("sweep_interval_secs", session.sweep_interval_secs),
            ("read_chunk_size", session.read_chunk_size as u64),
            ("max_transfer_buffer", u64::from(session.max_transfer_buffer)),
            ("max_send_buffer", session.max_send_buffer as u64),
        ] {
            if value == 0 {
                return Err(anyhow!("Invalid session.{}: must be greater than 0", name));
            }
        }

        if session.max_transfer_buffer > protocol::MAX_TRANSFER_BUFFER_LENGTH {
            return Err(anyhow!(
                "Invalid session.max_transfer_buffer {}: the protocol limit is {}",
                session.max_transfer_buffer,
                protocol::MAX_TRANSFER_BUFFER_LENGTH
            ));
        }

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind_addr
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", self.server.bind_addr))
    }

    /// Reactor settings derived from this configuration
    pub fn reactor_config(&self) -> Result<ReactorConfig> {
        Ok(ReactorConfig {
            bind_addr: self.bind_addr()?,
            max_connections: self.session.max_connections,
            idle_timeout: Duration::from_secs(self.session.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.session.sweep_interval_secs),
            read_chunk_size: self.session.read_chunk_size,
            max_transfer_buffer: self.session.max_transfer_buffer,
            max_send_buffer: self.session.max_send_buffer,
        })
    }

    /// Validate a USB filter (VID:PID format)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);
        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }
        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        if !id.starts_with("0x") && !id.starts_with("0X") {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            ));
        }

        let hex_part = &id[2..];
        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}

/// Load a configuration file, expanding a leading `~`
pub fn load_config(path: &str) -> Result<ServerConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    ServerConfig::load(Some(path_buf))
}
