//! Shared value types.
//!
//! These types cross module boundaries: the decoders produce them, the
//! connection manager routes them, and the application layer consumes them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::is_valid_mac_address;
use crate::error::ScaleError;

/// A Bluetooth device address in canonical (display) byte order.
///
/// MiBeacon frames carry the address least-significant byte first; use
/// [`MacAddress::from_wire`] and [`MacAddress::to_wire`] to convert.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Build an address from radio wire order (reversed).
    #[must_use]
    pub fn from_wire(mut bytes: [u8; 6]) -> Self {
        bytes.reverse();
        Self(bytes)
    }

    /// The address in radio wire order (reversed).
    #[must_use]
    pub fn to_wire(self) -> [u8; 6] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }
}

impl FromStr for MacAddress {
    type Err = ScaleError;

    /// Accepts `AA:BB:CC:DD:EE:FF`, `AA-BB-CC-DD-EE-FF` and `AABBCCDDEEFF`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if !is_valid_mac_address(trimmed) {
            return Err(ScaleError::InvalidAddress(s.to_string()));
        }
        let digits: String = trimmed.chars().filter(char::is_ascii_hexdigit).collect();
        let mut bytes = [0u8; 6];
        hex::decode_to_slice(&digits, &mut bytes)
            .map_err(|_| ScaleError::InvalidAddress(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({self})")
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Where a measurement was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementSource {
    /// A MiBeacon (or legacy service-data) advertisement.
    Advertisement,
    /// A GATT characteristic notification.
    Gatt,
}

/// A validated, stable measurement handed to the application layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMeasurement {
    /// The scale that produced the reading.
    pub address: MacAddress,

    /// Body weight in kilograms.
    pub weight_kg: f64,

    /// Bio-impedance in ohms, present only for a complete reading.
    pub impedance_ohm: Option<u16>,

    /// Heart rate in beats per minute, when the scale reports one.
    pub heart_rate_bpm: Option<u16>,

    /// When the reading was received.
    pub timestamp: DateTime<Utc>,

    /// Decode path that produced the reading.
    pub source: MeasurementSource,
}

/// Connection lifecycle state of a [`crate::ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Nothing running.
    #[default]
    Idle,
    /// Radio scan active, waiting for the target device.
    Scanning,
    /// A connection attempt is in flight.
    Connecting,
    /// Connected and subscribed to measurement characteristics.
    Connected,
    /// Connected with at least one caller waiting for a measurement.
    Reading,
    /// The link was closed by the peer or by the caller.
    Disconnected,
    /// The last operation failed; see the error subscription.
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reading => "reading",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Power state reported by the platform adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterPower {
    /// Not yet reported.
    #[default]
    Unknown,
    /// Ready for scanning.
    PoweredOn,
    /// Radio disabled.
    PoweredOff,
}

/// Summary of a discovered peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Device address.
    pub address: MacAddress,

    /// Advertised local name, if any.
    pub name: Option<String>,

    /// Last received signal strength in dBm.
    pub rssi: Option<i16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_formats() {
        let expected = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!("AA:BB:CC:DD:EE:FF".parse::<MacAddress>().unwrap(), expected);
        assert_eq!("aa-bb-cc-dd-ee-ff".parse::<MacAddress>().unwrap(), expected);
        assert_eq!("aabbccddeeff".parse::<MacAddress>().unwrap(), expected);
    }

    #[test]
    fn test_reject_bad_addresses() {
        assert!("AA:BB:CC:DD:EE".parse::<MacAddress>().is_err());
        assert!("AA:BB-CC:DD:EE:FF".parse::<MacAddress>().is_err());
        assert!("GG:BB:CC:DD:EE:FF".parse::<MacAddress>().is_err());
        assert!("".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_wire_order_is_reversed() {
        let mac = MacAddress::from_wire([0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(mac.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(mac.to_wire(), [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
    }

    #[test]
    fn test_address_serde_as_string() {
        let mac: MacAddress = "11:22:33:44:55:66".parse().unwrap();
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"11:22:33:44:55:66\"");
        let back: MacAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
    }

    #[test]
    fn test_measurement_serialization() {
        let measurement = RawMeasurement {
            address: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
            weight_kg: 70.0,
            impedance_ohm: None,
            heart_rate_bpm: None,
            timestamp: Utc::now(),
            source: MeasurementSource::Advertisement,
        };
        let json = serde_json::to_string(&measurement).unwrap();
        assert!(json.contains("\"weight_kg\":70.0"));
        assert!(json.contains("\"impedance_ohm\":null"));
        assert!(json.contains("\"source\":\"advertisement\""));
    }
}
