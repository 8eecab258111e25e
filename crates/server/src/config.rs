//! Server configuration management

use anyhow::{Context, Result, anyhow};
use crate::engine::TransferTimeouts;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub limits: LimitSettings,
    pub timeouts: TimeoutSettings,
    pub state: StateSettings,
    pub health: HealthSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub listen_address: String,
    pub listen_port: u16,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    pub max_in_flight_per_device: usize,
    pub max_transfer_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    pub control_timeout_ms: u64,
    pub bulk_timeout_ms: u64,
    pub interrupt_timeout_ms: u64,
    pub iso_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSettings {
    pub state_file_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    pub probe_interval_secs: u64,
    pub urb_table_ceiling: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                listen_address: "0.0.0.0".to_string(),
                listen_port: 3240,
                log_level: "info".to_string(),
            },
            limits: LimitSettings {
                max_in_flight_per_device: 64,
                max_transfer_bytes: 1_048_576,
            },
            timeouts: TimeoutSettings {
                control_timeout_ms: 2_000,
                bulk_timeout_ms: 10_000,
                interrupt_timeout_ms: 1_000,
                iso_timeout_ms: 100,
            },
            state: StateSettings {
                state_file_path: PathBuf::from("/var/lib/usbipd/bindings"),
            },
            health: HealthSettings {
                probe_interval_secs: 30,
                urb_table_ceiling: 4096,
            },
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
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/usbipd/usbipd.toml")];

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
            config_dir.join("usbipd").join("usbipd.toml")
        } else {
            PathBuf::from(".config/usbipd/usbipd.toml")
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

        self.server
            .listen_address
            .parse::<std::net::IpAddr>()
            .map_err(|_| {
                anyhow!(
                    "Invalid listen_address '{}', expected an IPv4 or IPv6 address",
                    self.server.listen_address
                )
            })?;

        if self.limits.max_in_flight_per_device == 0 {
            return Err(anyhow!("max_in_flight_per_device must be at least 1"));
        }

        // The wire decoder enforces its own hard bound; a larger configured
        // value would silently never apply.
        let wire_max = protocol::MAX_TRANSFER_WIRE as usize;
        if self.limits.max_transfer_bytes == 0 || self.limits.max_transfer_bytes > wire_max {
            return Err(anyhow!(
                "max_transfer_bytes must be between 1 and {}",
                wire_max
            ));
        }

        for (name, value) in [
            ("control_timeout_ms", self.timeouts.control_timeout_ms),
            ("bulk_timeout_ms", self.timeouts.bulk_timeout_ms),
            ("interrupt_timeout_ms", self.timeouts.interrupt_timeout_ms),
            ("iso_timeout_ms", self.timeouts.iso_timeout_ms),
        ] {
            if value == 0 {
                return Err(anyhow!("{} must be at least 1", name));
            }
        }

        if self.health.probe_interval_secs == 0 {
            return Err(anyhow!("probe_interval_secs must be at least 1"));
        }

        Ok(())
    }

    /// The socket address the daemon listens on
    pub fn listen_addr(&self) -> Result<std::net::SocketAddr> {
        let ip: std::net::IpAddr = self
            .server
            .listen_address
            .parse()
            .map_err(|_| anyhow!("invalid listen_address"))?;
        Ok(std::net::SocketAddr::new(ip, self.server.listen_port))
    }

    /// Per-transfer-type deadlines for the engine
    pub fn transfer_timeouts(&self) -> TransferTimeouts {
        TransferTimeouts {
            control: Duration::from_millis(self.timeouts.control_timeout_ms),
            bulk: Duration::from_millis(self.timeouts.bulk_timeout_ms),
            interrupt: Duration::from_millis(self.timeouts.interrupt_timeout_ms),
            iso: Duration::from_millis(self.timeouts.iso_timeout_ms),
        }
    }

    /// Expand a user-supplied state file path (`~` allowed)
    pub fn expanded_state_path(&self) -> PathBuf {
        let raw = self.state.state_file_path.to_string_lossy();
        PathBuf::from(shellexpand::tilde(raw.as_ref()).as_ref())
    }
}
