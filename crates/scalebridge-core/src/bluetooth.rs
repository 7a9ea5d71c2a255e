//! Platform Bluetooth binding.
//!
//! The connection manager talks to the radio only through the
//! [`BluetoothAdapter`] trait plus a stream of [`AdapterEvent`]s. Three
//! implementations exist:
//! - [`bluez::BluezAdapter`] - BlueZ over D-Bus via `bluer` (feature `bluetooth`)
//! - [`helper::HelperAdapter`] - a supervised helper process speaking JSON lines
//! - [`mock::MockAdapter`] - in-memory adapter for tests (feature `mock-bluetooth`)

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::error::BleErrorCode;
use crate::types::{AdapterPower, MacAddress};

#[cfg(feature = "bluetooth")]
pub mod bluez;
pub mod helper;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub mod mock;

/// Capacity of the adapter event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors reported by a platform binding.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    /// The radio is switched off.
    #[error("Bluetooth is powered off")]
    PoweredOff,

    /// No usable adapter exists on this host.
    #[error("Bluetooth adapter not available")]
    NotAvailable,

    /// The peripheral is unknown to the adapter.
    #[error("Peripheral {0} not found")]
    PeripheralNotFound(MacAddress),

    /// An operation did not complete in time.
    #[error("Operation timeout after {0:?}")]
    Timeout(Duration),

    /// Any other failure from the platform stack.
    #[error("Bluetooth transport error: {0}")]
    Transport(String),

    /// The helper process is missing, crashed, or answered with an error.
    #[error("Helper process error: {0}")]
    Helper(String),
}

impl AdapterError {
    /// The classified code for this failure, when it maps to one directly.
    ///
    /// Transport and helper failures carry free text and are classified by
    /// keyword instead.
    #[must_use]
    pub const fn ble_code(&self) -> Option<BleErrorCode> {
        match self {
            Self::PoweredOff | Self::NotAvailable => Some(BleErrorCode::BluetoothOff),
            Self::PeripheralNotFound(_) => Some(BleErrorCode::DeviceNotFound),
            Self::Timeout(_) => Some(BleErrorCode::ConnectionTimeout),
            Self::Transport(_) | Self::Helper(_) => None,
        }
    }
}

/// A specialized result type for adapter operations.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// One received advertisement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    /// Advertiser address.
    pub address: MacAddress,

    /// Complete or shortened local name.
    pub local_name: Option<String>,

    /// Received signal strength in dBm.
    pub rssi: Option<i16>,

    /// Advertised service UUIDs.
    pub service_uuids: Vec<Uuid>,

    /// Service data keyed by service UUID.
    pub service_data: HashMap<Uuid, Vec<u8>>,

    /// Manufacturer data keyed by company identifier.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

/// Events pushed by a platform binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// The radio power state changed.
    PowerChanged(AdapterPower),

    /// An advertisement was received while scanning.
    Advertisement(Advertisement),

    /// A subscribed characteristic sent a notification.
    Notification {
        /// Peripheral address.
        address: MacAddress,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Notified value.
        value: Vec<u8>,
    },

    /// A connected peripheral went away.
    Disconnected(MacAddress),
}

/// Radio capability injected into the connection manager.
#[async_trait]
pub trait BluetoothAdapter: Send + Sync + 'static {
    /// Current radio power state.
    async fn power_state(&self) -> AdapterPower;

    /// Start an LE scan, optionally filtered by service UUIDs.
    async fn start_scanning(&self, services: &[Uuid], allow_duplicates: bool) -> AdapterResult<()>;

    /// Stop the LE scan. Stopping an idle radio is not an error.
    async fn stop_scanning(&self) -> AdapterResult<()>;

    /// Open a connection to a peripheral.
    async fn connect(&self, address: MacAddress) -> AdapterResult<()>;

    /// Close a connection. Disconnecting an unconnected peripheral is not an error.
    async fn disconnect(&self, address: MacAddress) -> AdapterResult<()>;

    /// Discover services and return the UUIDs of notifiable characteristics.
    async fn discover_services(&self, address: MacAddress) -> AdapterResult<Vec<Uuid>>;

    /// Enable notifications on one characteristic.
    async fn subscribe(&self, address: MacAddress, characteristic: Uuid) -> AdapterResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_error_codes() {
        assert_eq!(
            AdapterError::PoweredOff.ble_code(),
            Some(BleErrorCode::BluetoothOff)
        );
        assert_eq!(
            AdapterError::Timeout(Duration::from_secs(1)).ble_code(),
            Some(BleErrorCode::ConnectionTimeout)
        );
        assert_eq!(
            AdapterError::PeripheralNotFound(MacAddress([1, 2, 3, 4, 5, 6])).ble_code(),
            Some(BleErrorCode::DeviceNotFound)
        );
        assert_eq!(AdapterError::Transport("boom".into()).ble_code(), None);
    }

    #[test]
    fn test_adapter_error_messages_feed_keyword_matching() {
        let message = AdapterError::Timeout(Duration::from_millis(1500))
            .to_string()
            .to_lowercase();
        assert!(message.contains("timeout"));
    }
}
