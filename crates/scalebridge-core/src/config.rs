//! Application configuration management.
//!
//! Handles loading, saving, and validating scalebridge configuration:
//! - The bound scale address and its bind key
//! - Scan, connect and read timeouts
//! - Auto-connect, auto-reconnect and duplicate-advertisement behavior
//! - Retry/backoff settings
//! - Which Bluetooth backend to drive
//!
//! Configuration is layered: built-in defaults, then a TOML file, then
//! `SCALEBRIDGE_*` environment variables (`__` separates nested keys, e.g.
//! `SCALEBRIDGE_DEVICE__ADDRESS`).

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryConfig;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "SCALEBRIDGE";

static MAC_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:(?:[0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}|(?:[0-9A-Fa-f]{2}-){5}[0-9A-Fa-f]{2}|[0-9A-Fa-f]{12})$",
    )
    .expect("MAC address pattern is valid")
});

static BIND_KEY_SEPARATORS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s:\-]").expect("separator pattern is valid"));

/// Check whether a string is a Bluetooth address.
///
/// Accepts colon-separated, dash-separated, or unseparated hex.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS_RE.is_match(address)
}

/// Strip grouping separators from a bind key string.
#[must_use]
pub fn normalize_bind_key(key: &str) -> String {
    BIND_KEY_SEPARATORS_RE.replace_all(key.trim(), "").into_owned()
}

/// Check whether a string is a 16-byte hex bind key.
#[must_use]
pub fn is_valid_bind_key(key: &str) -> bool {
    let normalized = normalize_bind_key(key);
    normalized.len() == 32 && normalized.chars().all(|c| c.is_ascii_hexdigit())
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Configuration file not found at: {0}")]
    NotFound(String),

    /// The configuration file could not be read.
    #[error("Failed to read {path}: {source}")]
    ReadError {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The configuration file could not be written.
    #[error("Failed to write {path}: {source}")]
    WriteError {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Layered sources could not be merged or deserialized.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// The configuration could not be serialized to TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field has an invalid value.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields have invalid values.
    #[error("Configuration validation failed: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// A specialized result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The scale this installation is bound to.
    pub device: DeviceConfig,

    /// Timeouts and lifecycle behavior.
    pub scan: ScanConfig,

    /// Retry/backoff for connection operations.
    pub retry: RetryConfig,

    /// Bluetooth backend selection.
    pub backend: BackendConfig,
}

/// Bound device configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Scale address. `None` until first-time setup selects a scale.
    pub address: Option<String>,

    /// 32-hex-character bind key for encrypted advertisements.
    pub bind_key: Option<String>,
}

/// Scan/connect/read lifecycle configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// How long `start_scanning` waits for the scale.
    pub scan_timeout_ms: u64,

    /// How long a single connection handshake may take.
    pub connect_timeout_ms: u64,

    /// How long `read_measurement` waits for a stable reading.
    pub read_timeout_ms: u64,

    /// Connect automatically once the filter selects a scale.
    pub auto_connect: bool,

    /// Ask the radio to report repeated advertisements.
    pub allow_duplicates: bool,

    /// Re-scan periodically after a disconnect or recoverable error.
    pub auto_reconnect: bool,

    /// Fixed delay before a reconnect scan.
    pub reconnect_interval_ms: u64,

    /// Window in which repeated measurements are suppressed.
    pub dedup_window_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 30_000,
            connect_timeout_ms: 15_000,
            read_timeout_ms: 60_000,
            auto_connect: true,
            allow_duplicates: true,
            auto_reconnect: true,
            reconnect_interval_ms: 10_000,
            dedup_window_ms: 1_000,
        }
    }
}

/// Which platform binding drives the radio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// BlueZ over D-Bus (Linux, requires the `bluetooth` feature).
    #[default]
    Bluez,
    /// An external helper process speaking line-delimited JSON.
    Helper,
}

/// Backend configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Selected backend.
    pub kind: BackendKind,

    /// Helper process settings, used when `kind = "helper"`.
    pub helper: HelperConfig,
}

/// Helper process command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    /// Program to run.
    pub program: String,

    /// Arguments passed to the program.
    pub args: Vec<String>,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            program: "scalebridge-helper".to_string(),
            args: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file plus environment overrides.
    ///
    /// A missing file is an error only when `path` was given explicitly.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound(path.display().to_string()));
                }
                builder = builder.add_source(
                    config::File::from(path.to_path_buf()).format(config::FileFormat::Toml),
                );
            }
            None => {
                if let Some(default_path) = default_config_path() {
                    builder = builder.add_source(
                        config::File::from(default_path)
                            .format(config::FileFormat::Toml)
                            .required(false),
                    );
                }
            }
        }

        let merged = builder
            .add_source(environment())
            .build()?;

        let config: Self = merged.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file is invalid.
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(Some(path))
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.display().to_string(),
            source,
        })
    }

    /// Validate every field, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns the single error, or `MultipleValidationErrors` if several fields are invalid.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut invalid = |field: &str, message: &str| {
            errors.push(ConfigError::ValidationError {
                field: field.to_string(),
                message: message.to_string(),
            });
        };

        if let Some(address) = &self.device.address {
            if !is_valid_mac_address(address) {
                invalid(
                    "device.address",
                    "must be a Bluetooth address like AA:BB:CC:DD:EE:FF",
                );
            }
        }
        if let Some(key) = &self.device.bind_key {
            if !is_valid_bind_key(key) {
                invalid("device.bind_key", "must be 32 hexadecimal characters");
            }
        }

        for (field, value) in [
            ("scan.scan_timeout_ms", self.scan.scan_timeout_ms),
            ("scan.connect_timeout_ms", self.scan.connect_timeout_ms),
            ("scan.read_timeout_ms", self.scan.read_timeout_ms),
            ("scan.reconnect_interval_ms", self.scan.reconnect_interval_ms),
        ] {
            if value == 0 {
                invalid(field, "must be greater than zero");
            }
        }

        if self.retry.max_attempts == 0 {
            invalid("retry.max_attempts", "must be at least 1");
        }
        if self.retry.backoff_multiplier < 1.0 {
            invalid("retry.backoff_multiplier", "must be at least 1.0");
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            invalid("retry.max_delay_ms", "must not be below retry.base_delay_ms");
        }

        if self.backend.kind == BackendKind::Helper && self.backend.helper.program.trim().is_empty()
        {
            invalid("backend.helper.program", "must name the helper executable");
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

/// `SCALEBRIDGE_*` overrides, `__` separating nested keys.
///
/// Values stay strings until deserialization so all-digit addresses and
/// keys keep their leading zeros.
fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
}

/// Returns the default configuration file location.
///
/// On Linux: `/etc/scalebridge/config.toml` when it exists, otherwise the
/// per-user config directory.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let system = PathBuf::from("/etc/scalebridge/config.toml");
        if system.exists() {
            return Some(system);
        }
    }
    directories::ProjectDirs::from("", "", "scalebridge")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_address_validation() {
        assert!(is_valid_mac_address("AA:BB:CC:DD:EE:FF"));
        assert!(is_valid_mac_address("aa-bb-cc-dd-ee-ff"));
        assert!(is_valid_mac_address("AABBCCDDEEFF"));
        assert!(!is_valid_mac_address("AA:BB-CC:DD:EE:FF"));
        assert!(!is_valid_mac_address("AA:BB:CC:DD:EE"));
        assert!(!is_valid_mac_address("ZZ:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn test_bind_key_validation() {
        assert!(is_valid_bind_key("00112233445566778899aabbccddeeff"));
        assert!(is_valid_bind_key("0011 2233 4455 6677 8899 AABB CCDD EEFF"));
        assert!(is_valid_bind_key("00:11:22:33:44:55:66:77:88:99:aa:bb:cc:dd:ee:ff"));
        assert!(!is_valid_bind_key("00112233"));
        assert!(!is_valid_bind_key("zz112233445566778899aabbccddeeff"));
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scan.dedup_window_ms, 1_000);
        assert!(config.scan.auto_connect);
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = Config::default();
        config.device.address = Some("not-an-address".into());
        config.device.bind_key = Some("short".into());
        config.scan.read_timeout_ms = 0;

        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_single_validation_error_is_not_wrapped() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "retry.max_attempts"
        ));
    }

    #[test]
    fn test_env_overrides_keep_digit_strings_intact() {
        let mut vars = config::Map::new();
        vars.insert("SCALEBRIDGE_DEVICE__ADDRESS".to_string(), "001122334455".to_string());
        vars.insert("SCALEBRIDGE_SCAN__SCAN_TIMEOUT_MS".to_string(), "5000".to_string());
        vars.insert("SCALEBRIDGE_SCAN__AUTO_CONNECT".to_string(), "false".to_string());

        let merged = config::Config::builder()
            .add_source(environment().source(Some(vars)))
            .build()
            .unwrap();
        let config: Config = merged.try_deserialize().unwrap();

        assert_eq!(config.device.address.as_deref(), Some("001122334455"));
        assert_eq!(config.scan.scan_timeout_ms, 5000);
        assert!(!config.scan.auto_connect);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.device.address = Some("AA:BB:CC:DD:EE:FF".into());
        config.device.bind_key = Some("00112233445566778899aabbccddeeff".into());
        config.scan.auto_connect = false;
        config.backend.kind = BackendKind::Helper;
        config.backend.helper.args = vec!["--json".into()];
        config.save(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[scan]\nscan_timeout_ms = 5000\n").unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.scan.scan_timeout_ms, 5_000);
        assert_eq!(loaded.scan.connect_timeout_ms, 15_000);
        assert_eq!(loaded.backend.kind, BackendKind::Bluez);
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(matches!(
            Config::load(Some(&path)),
            Err(ConfigError::NotFound(_))
        ));
        assert_eq!(Config::load_or_default(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_invalid_file_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[device]\naddress = \"nope\"\n").unwrap();
        assert!(matches!(
            Config::load(Some(&path)),
            Err(ConfigError::ValidationError { .. })
        ));
    }
}
