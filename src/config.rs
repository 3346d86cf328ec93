//! YAML configuration for both binaries.
//!
//! Parsed once at startup into immutable structs that are handed to
//! component constructors; nothing here is process-global.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::Deserialize;
use slog::Level;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Configuration for the `no-dozed` daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub logging_level: String,
    pub base_dir: PathBuf,
    /// FIFO mode bits as an octal string, e.g. `"666"`.
    pub fifo_permissions: String,
}

impl Default for DaemonConfig {
    fn default() -> DaemonConfig {
        DaemonConfig {
            logging_level: "INFO".to_string(),
            base_dir: PathBuf::from("./"),
            fifo_permissions: "666".to_string(),
        }
    }
}

impl DaemonConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<DaemonConfig, ConfigError> {
        load_yaml(path.as_ref())
    }

    pub fn log_level(&self) -> Result<Level, ConfigError> {
        parse_level(&self.logging_level)
    }

    pub fn permissions(&self) -> Result<u32, ConfigError> {
        let mode = u32::from_str_radix(&self.fifo_permissions, 8).map_err(|_| {
            ConfigError::InvalidValue {
                key: "fifo_permissions",
                reason: format!("{:?} is not an octal mode", self.fifo_permissions),
            }
        })?;
        if mode > 0o777 {
            return Err(ConfigError::InvalidValue {
                key: "fifo_permissions",
                reason: format!("{:o} has bits outside the permission mask", mode),
            });
        }
        Ok(mode)
    }
}

/// Configuration for the `no-doze-client` binary.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    pub active_process: Option<ActiveProcessConfig>,
    pub sshd: Option<SshdConfig>,
    pub qbittorrent: Option<QbittorrentConfig>,
}

impl ClientConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ClientConfig, ConfigError> {
        load_yaml(path.as_ref())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub logging_level: String,
    pub base_dir: PathBuf,
    pub retry_delay_sec: f64,
    pub startup_delay_min: f64,
}

impl Default for GeneralConfig {
    fn default() -> GeneralConfig {
        GeneralConfig {
            logging_level: "INFO".to_string(),
            base_dir: PathBuf::from("./"),
            retry_delay_sec: 1.0,
            startup_delay_min: 0.0,
        }
    }
}

impl GeneralConfig {
    pub fn log_level(&self) -> Result<Level, ConfigError> {
        parse_level(&self.logging_level)
    }

    pub fn retry_delay(&self) -> Result<Duration, ConfigError> {
        if !self.retry_delay_sec.is_finite() || self.retry_delay_sec <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "general.retry_delay_sec",
                reason: format!("{} is not a positive duration", self.retry_delay_sec),
            });
        }
        Ok(Duration::milliseconds((self.retry_delay_sec * 1_000.0) as i64))
    }

    pub fn startup_delay(&self) -> Result<Duration, ConfigError> {
        if !self.startup_delay_min.is_finite() || self.startup_delay_min < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "general.startup_delay_min",
                reason: format!("{} is not a non-negative duration", self.startup_delay_min),
            });
        }
        Ok(Duration::milliseconds(
            (self.startup_delay_min * 60_000.0) as i64,
        ))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActiveProcessConfig {
    pub processes: Vec<WatchedProcess>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchedProcess {
    pub name: String,
    pub period_min: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshdConfig {
    #[serde(default = "SshdConfig::default_period_min")]
    pub period_min: f64,
    /// Upper bound on consecutive inhibited periods, guarding against an
    /// idle session that never disconnects.
    #[serde(default = "SshdConfig::default_max_periods")]
    pub max_periods: u32,
}

impl SshdConfig {
    fn default_period_min() -> f64 {
        5.0
    }

    fn default_max_periods() -> u32 {
        u32::MAX
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QbittorrentConfig {
    pub host_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub downloading: Option<TransferChannelConfig>,
    pub seeding: Option<TransferChannelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferChannelConfig {
    pub period_min: f64,
    pub min_speed_kbps: f64,
}

/// Converts a `period_min` config value into a positive duration.
pub fn period_from_minutes(key: &'static str, minutes: f64) -> Result<Duration, ConfigError> {
    if !minutes.is_finite() || minutes <= 0.0 {
        return Err(ConfigError::InvalidValue {
            key,
            reason: format!("{} is not a positive number of minutes", minutes),
        });
    }
    Ok(Duration::milliseconds((minutes * 60_000.0) as i64))
}

fn load_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_level(raw: &str) -> Result<Level, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "critical" => Ok(Level::Critical),
        "error" => Ok(Level::Error),
        "warning" | "warn" => Ok(Level::Warning),
        "info" => Ok(Level::Info),
        "debug" => Ok(Level::Debug),
        "trace" => Ok(Level::Trace),
        _ => Err(ConfigError::InvalidValue {
            key: "logging_level",
            reason: format!("unknown level {:?}", raw),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn daemon_config_parses_with_defaults() {
        let file = write_config("base_dir: /run/no-doze\n");
        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/run/no-doze"));
        assert_eq!(config.log_level().unwrap(), Level::Info);
        assert_eq!(config.permissions().unwrap(), 0o666);
    }

    #[test]
    fn fifo_permissions_parse_as_octal() {
        let file = write_config("fifo_permissions: \"660\"\n");
        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.permissions().unwrap(), 0o660);
    }

    #[test]
    fn bad_fifo_permissions_are_rejected() {
        let file = write_config("fifo_permissions: \"rw-rw-rw-\"\n");
        let config = DaemonConfig::load(file.path()).unwrap();
        assert!(matches!(
            config.permissions(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn client_config_parses_general_and_plugins() {
        let file = write_config(
            "general:\n  logging_level: debug\n  base_dir: /tmp/nd\n  retry_delay_sec: 2.5\n  startup_delay_min: 1\nactive_process:\n  processes:\n    - name: ffmpeg\n      period_min: 2\nsshd:\n  period_min: 5\n  max_periods: 3\n",
        );
        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.general.log_level().unwrap(), Level::Debug);
        assert_eq!(
            config.general.retry_delay().unwrap(),
            Duration::milliseconds(2_500)
        );
        assert_eq!(config.general.startup_delay().unwrap(), Duration::minutes(1));
        assert_eq!(config.active_process.unwrap().processes[0].name, "ffmpeg");
        assert_eq!(config.sshd.unwrap().max_periods, 3);
        assert!(config.qbittorrent.is_none());
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let file = write_config("{}\n");
        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.general.retry_delay_sec, 1.0);
        assert!(config.active_process.is_none());
    }

    #[test]
    fn non_positive_periods_are_rejected() {
        assert!(period_from_minutes("sshd.period_min", 0.0).is_err());
        assert!(period_from_minutes("sshd.period_min", -2.0).is_err());
        assert_eq!(
            period_from_minutes("sshd.period_min", 0.5).unwrap(),
            Duration::seconds(30)
        );
    }

    #[test]
    fn unknown_logging_level_is_rejected() {
        let file = write_config("logging_level: verbose\n");
        let config = DaemonConfig::load(file.path()).unwrap();
        assert!(config.log_level().is_err());
    }
}
