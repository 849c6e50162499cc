//! Configuration handling for the wharf diagnostic tool.
//!
//! Defaults come first, then an optional YAML config file, then
//! environment-variable overrides, so a deployment can pin values without
//! editing files.

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

use wharf_wire::DEFAULT_MAX_FRAME_SIZE;

/// Tool configuration.
#[derive(Debug, Clone)]
pub struct WharfConfig {
    /// Port the echo server listens on
    pub listen_port: u16,
    /// Address the echo server binds to
    pub listen_address: String,
    /// Cap on accepted incoming frames
    pub max_frame_size: usize,
    /// Default log level
    pub log_level: String,
}

impl Default for WharfConfig {
    fn default() -> Self {
        Self {
            listen_port: 7100,
            listen_address: "0.0.0.0".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            log_level: "info".to_string(),
        }
    }
}

/// Root structure of the YAML config file.
#[derive(Debug, Deserialize)]
struct RootConfig {
    transport: Option<TransportSection>,
}

#[derive(Debug, Deserialize)]
struct TransportSection {
    listen_port: Option<u16>,
    listen_address: Option<String>,
    max_frame_size: Option<usize>,
    log_level: Option<String>,
}

impl WharfConfig {
    /// Load configuration from a file and the environment.
    ///
    /// A missing or unparsable file falls back to defaults with a warning;
    /// environment variables win over everything.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    config.apply_root_config(root);
                    info!("loaded configuration from {:?}", config_path.as_ref());
                }
                Err(err) => {
                    warn!(
                        "failed to parse config file {:?}: {err}; using defaults",
                        config_path.as_ref()
                    );
                }
            }
        }

        config.apply_environment_overrides();
        Ok(config)
    }

    fn apply_root_config(&mut self, root: RootConfig) {
        let Some(section) = root.transport else {
            return;
        };
        if let Some(port) = section.listen_port {
            self.listen_port = port;
        }
        if let Some(address) = section.listen_address {
            self.listen_address = address;
        }
        if let Some(size) = section.max_frame_size {
            self.max_frame_size = size;
        }
        if let Some(level) = section.log_level {
            self.log_level = level;
        }
    }

    fn apply_environment_overrides(&mut self) {
        if let Ok(port) = std::env::var("WHARF_LISTEN_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.listen_port = port;
                info!("listen port overridden by environment: {port}");
            }
        }

        if let Ok(address) = std::env::var("WHARF_LISTEN_ADDRESS") {
            info!("listen address overridden by environment: {address}");
            self.listen_address = address;
        }

        if let Ok(size) = std::env::var("WHARF_MAX_FRAME_SIZE") {
            if let Ok(size) = size.parse::<usize>() {
                self.max_frame_size = size;
                info!("max frame size overridden by environment: {size}");
            }
        }

        if let Ok(level) = std::env::var("WHARF_LOG_LEVEL") {
            self.log_level = level;
        }
    }
}
