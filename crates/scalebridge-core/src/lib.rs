//! # scalebridge-core
//!
//! Core logic for acquiring weight and impedance readings from Xiaomi-family
//! Bluetooth LE body-composition scales.
//!
//! This crate provides:
//! - MiBeacon advertisement decoding, including AES-CCM decryption with a bind key
//! - Decoding of the standard GATT weight and body-composition characteristics
//! - Scale selection among nearby peripherals
//! - A connection manager driving scan, connect, reconnect and read
//! - Configuration loading and a classified error taxonomy
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`frame`] - MiBeacon envelope decoding
//! - [`objects`] - TLV measurement objects carried inside a MiBeacon payload
//! - [`characteristic`] - GATT characteristic decoding and the well-known UUIDs
//! - [`crypto`] - nonce/AAD construction and AES-CCM payload decryption
//! - [`filter`] - deciding which visible peripheral is the scale
//! - [`retry`] - exponential backoff for flaky radio operations
//! - [`bluetooth`] - the platform binding trait and its BlueZ, helper and mock backends
//! - [`manager`] - the [`ConnectionManager`] actor and its public handle
//! - [`config`] - configuration loading, saving, and validation
//! - [`error`] - crate errors plus the user-facing [`BleError`]
//! - [`types`] - shared value types

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod bluetooth;
pub mod characteristic;
pub mod config;
pub mod crypto;
pub mod error;
pub mod filter;
pub mod frame;
pub mod manager;
pub mod objects;
pub mod retry;
pub mod types;

// Re-export primary types for convenience
pub use bluetooth::{AdapterError, AdapterEvent, AdapterResult, Advertisement, BluetoothAdapter};
pub use config::{
    is_valid_bind_key, is_valid_mac_address, BackendConfig, BackendKind, Config, ConfigError,
    ConfigResult, DeviceConfig, HelperConfig, ScanConfig,
};
pub use crypto::{decrypt_payload, test_key, BindKey, KeySample};
pub use error::{to_ble_error, BleError, BleErrorCode, Result, ScaleError};
pub use filter::{select_device, Selection, VisiblePeripheral};
pub use frame::{decode_frame, AdvertisementFrame};
pub use manager::{ConnectionManager, ManagerOptions, ScalePort, ScanOutcome, Subscription};
pub use objects::{extract_objects, ObjectSet};
pub use retry::{with_conditional_retry, RetryConfig};
pub use types::{
    AdapterPower, ConnectionState, DiscoveredDevice, MacAddress, MeasurementSource, RawMeasurement,
};
