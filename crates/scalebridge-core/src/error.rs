//! Error types and failure classification for the scalebridge core library.
//!
//! Two layers live here:
//!
//! - [`ScaleError`] is the crate-wide error enum returned by fallible
//!   functions (key parsing, decryption, configuration, adapter calls).
//! - [`BleError`] is the closed, user-facing taxonomy emitted to
//!   subscribers. Every `BleError` carries a machine-readable
//!   [`BleErrorCode`], a recoverability flag and a remediation suggestion.
//!
//! [`to_ble_error`] classifies any failure onto the taxonomy.
//!
//! # Example
//!
//! ```rust
//! use scalebridge_core::error::{to_ble_error, BleErrorCode};
//!
//! let err = to_ble_error(anyhow::anyhow!("Operation timed out"), None);
//! assert_eq!(err.code, BleErrorCode::ConnectionTimeout);
//! assert!(err.recoverable);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bluetooth::AdapterError;
use crate::config::ConfigError;

/// The unified error type for scalebridge operations.
#[derive(Debug, Error)]
pub enum ScaleError {
    // =========================================================================
    // CRYPTO ERRORS
    // =========================================================================
    /// The bind key is not 16 bytes of hex.
    #[error("Invalid bind key: {0}. Expected 32 hexadecimal characters (separators allowed).")]
    InvalidKey(String),

    /// The payload failed authentication under the configured key.
    #[error("Failed to decrypt advertisement payload: integrity check did not match the bind key")]
    DecryptionFailed,

    /// The encrypted payload cannot hold ciphertext, extension counter and MIC.
    #[error("Encrypted payload too short: {len} bytes (minimum {min})")]
    PayloadTooShort {
        /// Actual payload length.
        len: usize,
        /// Minimum acceptable length.
        min: usize,
    },

    // =========================================================================
    // DEVICE ERRORS
    // =========================================================================
    /// The string is not a Bluetooth address.
    #[error("Invalid Bluetooth address: '{0}'. Expected format XX:XX:XX:XX:XX:XX.")]
    InvalidAddress(String),

    /// The platform binding reported a failure.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// The connection manager task is no longer running.
    #[error("Connection manager is not running")]
    ManagerStopped,

    // =========================================================================
    // CONFIGURATION & I/O ERRORS
    // =========================================================================
    /// Configuration could not be loaded or failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for scalebridge operations.
pub type Result<T> = std::result::Result<T, ScaleError>;

impl ScaleError {
    /// Returns `true` if this error came from the cryptographic layer.
    #[inline]
    #[must_use]
    pub const fn is_crypto_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidKey(_) | Self::DecryptionFailed | Self::PayloadTooShort { .. }
        )
    }

    /// The taxonomy code this error maps onto, if it has a fixed one.
    #[must_use]
    pub const fn ble_code(&self) -> Option<BleErrorCode> {
        match self {
            Self::InvalidKey(_) | Self::DecryptionFailed => Some(BleErrorCode::DecryptionFailed),
            Self::PayloadTooShort { .. } | Self::InvalidAddress(_) | Self::Config(_) => {
                Some(BleErrorCode::InvalidData)
            }
            Self::Adapter(err) => err.ble_code(),
            Self::ManagerStopped | Self::IoError(_) => None,
        }
    }
}

// =============================================================================
// BLE ERROR TAXONOMY
// =============================================================================

/// Closed set of error codes surfaced to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BleErrorCode {
    /// The Bluetooth adapter is powered off or unavailable.
    BluetoothOff,
    /// The scale was not seen within the scan window.
    DeviceNotFound,
    /// The connection handshake did not complete in time.
    ConnectionTimeout,
    /// Reading or notification delivery failed.
    ReadFailed,
    /// The payload could not be decrypted with the configured key.
    DecryptionFailed,
    /// The received data is structurally invalid.
    InvalidData,
}

struct CodeInfo {
    message: &'static str,
    recoverable: bool,
    suggestion: &'static str,
}

impl BleErrorCode {
    /// Every code, in table order.
    pub const ALL: [Self; 6] = [
        Self::BluetoothOff,
        Self::DeviceNotFound,
        Self::ConnectionTimeout,
        Self::ReadFailed,
        Self::DecryptionFailed,
        Self::InvalidData,
    ];

    const fn info(self) -> CodeInfo {
        match self {
            Self::BluetoothOff => CodeInfo {
                message: "Bluetooth is turned off",
                recoverable: true,
                suggestion: "Turn on Bluetooth and try again.",
            },
            Self::DeviceNotFound => CodeInfo {
                message: "Scale not found",
                recoverable: true,
                suggestion: "Step on the scale to wake it up and keep it within range.",
            },
            Self::ConnectionTimeout => CodeInfo {
                message: "Connection to the scale timed out",
                recoverable: true,
                suggestion: "Move closer to the scale and try again.",
            },
            Self::ReadFailed => CodeInfo {
                message: "Failed to read measurement",
                recoverable: true,
                suggestion: "Step off the scale, wait a moment and step on again.",
            },
            Self::DecryptionFailed => CodeInfo {
                message: "Failed to decrypt scale data",
                recoverable: false,
                suggestion: "Check the bind key for this scale and enter it again.",
            },
            Self::InvalidData => CodeInfo {
                message: "Received invalid data from the scale",
                recoverable: true,
                suggestion: "Try the measurement again; update the scale firmware if it persists.",
            },
        }
    }

    /// Machine-readable code string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BluetoothOff => "BLUETOOTH_OFF",
            Self::DeviceNotFound => "DEVICE_NOT_FOUND",
            Self::ConnectionTimeout => "CONNECTION_TIMEOUT",
            Self::ReadFailed => "READ_FAILED",
            Self::DecryptionFailed => "DECRYPTION_FAILED",
            Self::InvalidData => "INVALID_DATA",
        }
    }

    /// Whether errors with this code are expected to clear on retry.
    #[must_use]
    pub const fn is_recoverable(self) -> bool {
        self.info().recoverable
    }
}

impl fmt::Display for BleErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure, as delivered to error subscribers.
///
/// Built once and cloned to each consumer; fields are never rewritten after
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct BleError {
    /// Taxonomy code.
    pub code: BleErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Whether automatic retry/reconnect may succeed.
    pub recoverable: bool,
    /// What the user can do about it.
    pub suggestion: String,
    /// Underlying failure text, when the error was classified from another error.
    pub details: Option<String>,
}

impl BleError {
    /// Create an error with the table message for `code`.
    #[must_use]
    pub fn new(code: BleErrorCode) -> Self {
        let info = code.info();
        Self {
            code,
            message: info.message.to_string(),
            recoverable: info.recoverable,
            suggestion: info.suggestion.to_string(),
            details: None,
        }
    }

    /// Create an error for `code` carrying underlying details.
    #[must_use]
    pub fn with_details(code: BleErrorCode, details: impl Into<String>) -> Self {
        Self {
            details: Some(details.into()),
            ..Self::new(code)
        }
    }
}

impl From<ScaleError> for BleError {
    fn from(err: ScaleError) -> Self {
        to_ble_error(err.into(), None)
    }
}

impl From<AdapterError> for BleError {
    fn from(err: AdapterError) -> Self {
        to_ble_error(err.into(), None)
    }
}

// =============================================================================
// CLASSIFICATION
// =============================================================================

/// Classify an arbitrary failure onto the [`BleError`] taxonomy.
///
/// An error that already is a `BleError` is returned as-is. Known typed
/// errors map directly; anything else is matched on its lowered message,
/// falling back to `default` (or [`BleErrorCode::ReadFailed`]).
#[must_use]
pub fn to_ble_error(error: anyhow::Error, default: Option<BleErrorCode>) -> BleError {
    let error = match error.downcast::<BleError>() {
        Ok(classified) => return classified,
        Err(other) => other,
    };

    let details = format!("{error:#}");

    let typed = error
        .downcast_ref::<ScaleError>()
        .and_then(ScaleError::ble_code)
        .or_else(|| error.downcast_ref::<AdapterError>().and_then(AdapterError::ble_code));

    let code = typed.unwrap_or_else(|| classify_message(&details, default));
    BleError::with_details(code, details)
}

/// Keyword classification of an error message.
#[must_use]
pub fn classify_message(message: &str, default: Option<BleErrorCode>) -> BleErrorCode {
    let lowered = message.to_lowercase();

    if lowered.contains("bluetooth") && lowered.contains("off") {
        BleErrorCode::BluetoothOff
    } else if lowered.contains("not found") || lowered.contains("no device") {
        BleErrorCode::DeviceNotFound
    } else if lowered.contains("timeout") || lowered.contains("timed out") {
        BleErrorCode::ConnectionTimeout
    } else if lowered.contains("decrypt") {
        BleErrorCode::DecryptionFailed
    } else {
        default.unwrap_or(BleErrorCode::ReadFailed)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MacAddress;
    use std::time::Duration;

    #[test]
    fn test_only_decryption_failure_is_terminal() {
        for code in BleErrorCode::ALL {
            assert_eq!(
                code.is_recoverable(),
                code != BleErrorCode::DecryptionFailed,
                "{code}"
            );
        }
    }

    #[test]
    fn test_every_code_has_message_and_suggestion() {
        for code in BleErrorCode::ALL {
            let err = BleError::new(code);
            assert!(!err.message.is_empty());
            assert!(!err.suggestion.is_empty());
            assert_eq!(err.code, code);
        }
    }

    #[test]
    fn test_keyword_classification() {
        assert_eq!(
            classify_message("Bluetooth is powered off", None),
            BleErrorCode::BluetoothOff
        );
        assert_eq!(
            classify_message("Peripheral not found", None),
            BleErrorCode::DeviceNotFound
        );
        assert_eq!(
            classify_message("no device in range", None),
            BleErrorCode::DeviceNotFound
        );
        assert_eq!(
            classify_message("Operation Timed Out", None),
            BleErrorCode::ConnectionTimeout
        );
        assert_eq!(
            classify_message("could not decrypt frame", None),
            BleErrorCode::DecryptionFailed
        );
        assert_eq!(classify_message("weird", None), BleErrorCode::ReadFailed);
        assert_eq!(
            classify_message("weird", Some(BleErrorCode::InvalidData)),
            BleErrorCode::InvalidData
        );
    }

    #[test]
    fn test_classified_error_passes_through_unchanged() {
        let original = BleError {
            code: BleErrorCode::DeviceNotFound,
            message: "custom message mentioning timeout".to_string(),
            recoverable: true,
            suggestion: "custom suggestion".to_string(),
            details: Some("kept".to_string()),
        };
        let again = to_ble_error(original.clone().into(), Some(BleErrorCode::InvalidData));
        assert_eq!(again, original);

        let twice = to_ble_error(again.into(), None);
        assert_eq!(twice, original);
    }

    #[test]
    fn test_typed_errors_map_directly() {
        let err: BleError = ScaleError::DecryptionFailed.into();
        assert_eq!(err.code, BleErrorCode::DecryptionFailed);
        assert!(!err.recoverable);

        let err: BleError = ScaleError::InvalidKey("too short".into()).into();
        assert_eq!(err.code, BleErrorCode::DecryptionFailed);

        let err: BleError = AdapterError::PoweredOff.into();
        assert_eq!(err.code, BleErrorCode::BluetoothOff);

        let err: BleError = AdapterError::Timeout(Duration::from_secs(5)).into();
        assert_eq!(err.code, BleErrorCode::ConnectionTimeout);

        let mac: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let err: BleError = AdapterError::PeripheralNotFound(mac).into();
        assert_eq!(err.code, BleErrorCode::DeviceNotFound);
    }

    #[test]
    fn test_default_code_applies_to_unknown_errors() {
        let err = to_ble_error(
            anyhow::anyhow!("GATT write rejected"),
            Some(BleErrorCode::ConnectionTimeout),
        );
        assert_eq!(err.code, BleErrorCode::ConnectionTimeout);
        assert_eq!(err.details.as_deref(), Some("GATT write rejected"));
    }

    #[test]
    fn test_error_display_is_message() {
        let err = BleError::new(BleErrorCode::BluetoothOff);
        assert_eq!(err.to_string(), "Bluetooth is turned off");
        assert_eq!(err.code.as_str(), "BLUETOOTH_OFF");
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<ScaleError>();
        assert_sync::<ScaleError>();
        assert_send::<BleError>();
        assert_sync::<BleError>();
    }

    #[test]
    fn test_crypto_error_classification() {
        assert!(ScaleError::DecryptionFailed.is_crypto_error());
        assert!(ScaleError::PayloadTooShort { len: 3, min: 8 }.is_crypto_error());
        assert!(!ScaleError::ManagerStopped.is_crypto_error());
    }
}
