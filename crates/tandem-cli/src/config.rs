//! Configuration file for the tandem CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tandem_core::{ConnectionOptions, SlicOptions};

/// tandem configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Connection configuration
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Slic configuration
    #[serde(default)]
    pub slic: SlicConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Ping while idle even without dispatches in progress
    #[serde(default)]
    pub keep_alive: bool,
    /// Graceful close timeout in seconds
    #[serde(default = "default_close_timeout")]
    pub close_timeout_secs: u64,
    /// Connection establishment timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Dispatch one request at a time
    #[serde(default)]
    pub serialize_dispatch: bool,
    /// Largest request or response in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Slic configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlicConfig {
    /// Supported Slic versions, most preferred first
    #[serde(default = "default_versions")]
    pub versions: Vec<u64>,
    /// Application protocol name
    #[serde(default = "default_application_protocol")]
    pub application_protocol: String,
    /// Incoming bidirectional streams allowed at once
    #[serde(default = "default_max_streams")]
    pub max_bidirectional_streams: u64,
    /// Incoming unidirectional streams allowed at once
    #[serde(default = "default_max_streams")]
    pub max_unidirectional_streams: u64,
    /// Largest stream frame payload wanted from the peer, in bytes
    #[serde(default = "default_packet_max_size")]
    pub packet_max_size: u64,
    /// Largest frame accepted from the peer, in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_idle_timeout() -> u64 {
    60
}

fn default_close_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_message_size() -> usize {
    16 * 1024 * 1024
}

fn default_versions() -> Vec<u64> {
    vec![1]
}

fn default_application_protocol() -> String {
    "ice2".to_string()
}

fn default_max_streams() -> u64 {
    100
}

fn default_packet_max_size() -> u64 {
    32 * 1024
}

fn default_max_frame_size() -> usize {
    1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            keep_alive: false,
            close_timeout_secs: default_close_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            serialize_dispatch: false,
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for SlicConfig {
    fn default() -> Self {
        Self {
            versions: default_versions(),
            application_protocol: default_application_protocol(),
            max_bidirectional_streams: default_max_streams(),
            max_unidirectional_streams: default_max_streams(),
            packet_max_size: default_packet_max_size(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("tandem/config.toml")
    }

    /// Load config from the default path, or create a default one there
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Connection options described by this configuration
    #[must_use]
    pub fn connection_options(&self) -> ConnectionOptions {
        let connection = &self.connection;
        let slic = &self.slic;
        ConnectionOptions {
            idle_timeout: Duration::from_secs(connection.idle_timeout_secs),
            keep_alive: connection.keep_alive,
            close_timeout: Duration::from_secs(connection.close_timeout_secs),
            connect_timeout: Duration::from_secs(connection.connect_timeout_secs),
            serialize_dispatch: connection.serialize_dispatch,
            max_message_size: connection.max_message_size,
            dispatch_runtime: None,
            slic: SlicOptions {
                versions: slic.versions.clone(),
                application_protocol: slic.application_protocol.clone(),
                max_bidirectional_streams: slic.max_bidirectional_streams,
                max_unidirectional_streams: slic.max_unidirectional_streams,
                packet_max_size: slic.packet_max_size,
                max_frame_size: slic.max_frame_size,
            },
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.connection.idle_timeout_secs > 24 * 60 * 60 {
            anyhow::bail!("Idle timeout must not exceed one day");
        }

        self.connection_options()
            .validate()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.connection.idle_timeout_secs, 60);
        assert_eq!(config.slic.versions, vec![1]);
        assert_eq!(config.slic.application_protocol, "ice2");
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());

        let options = config.connection_options();
        assert_eq!(options.idle_timeout, Duration::from_secs(60));
        assert_eq!(options.slic.packet_max_size, 32 * 1024);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "DEBUG".to_string();
        config.slic.max_bidirectional_streams = 0;
        assert!(config.validate().is_err());

        config.slic.max_bidirectional_streams = 10;
        config.connection.close_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[connection]\nidle_timeout_secs = 5\nkeep_alive = true\n").unwrap();
        writeln!(file, "[slic]\nmax_unidirectional_streams = 4").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.connection.idle_timeout_secs, 5);
        assert!(config.connection.keep_alive);
        assert_eq!(config.connection.close_timeout_secs, 10);
        assert_eq!(config.slic.max_unidirectional_streams, 4);
        assert_eq!(config.slic.max_bidirectional_streams, 100);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.slic.application_protocol = "custom".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.slic.application_protocol, "custom");
        assert_eq!(loaded.connection.max_message_size, config.connection.max_message_size);
    }

    #[test]
    fn test_malformed_file_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[connection\nidle_timeout_secs = ").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
