//! JSON-line event output.
//!
//! Stdout carries exactly one JSON object per line so another process can
//! consume it; logs go to stderr. Every object has an `event` tag.

use std::io::Write;

use scalebridge_core::{BleError, ConnectionState, DiscoveredDevice, RawMeasurement};
use serde::Serialize;
use thiserror::Error;

/// One line of daemon output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DaemonEvent {
    /// The connection state changed.
    State {
        /// New state.
        state: ConnectionState,
    },
    /// A blocking failure surfaced by the manager.
    Error {
        /// The classified error.
        #[serde(flatten)]
        error: BleError,
    },
    /// A scale was seen during a scan.
    Discovered {
        /// The device summary.
        #[serde(flatten)]
        device: DiscoveredDevice,
    },
    /// A stable measurement.
    Measurement {
        /// The reading.
        #[serde(flatten)]
        measurement: RawMeasurement,
    },
    /// A device scan ended.
    ScanFinished {
        /// Number of scales found.
        devices: usize,
    },
    /// Result of checking a bind key.
    KeyCheck {
        /// Whether the key decrypted the sample.
        matches: bool,
    },
}

/// Errors writing an event line.
#[derive(Debug, Error)]
pub enum EventError {
    /// The event could not be encoded.
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    /// The output stream rejected the write.
    #[error("failed to write event: {0}")]
    Write(#[from] std::io::Error),
}

/// Writes [`DaemonEvent`]s as newline-delimited JSON.
#[derive(Debug)]
pub struct EventSink<W> {
    out: W,
}

impl<W: Write> EventSink<W> {
    /// Wrap an output stream.
    pub const fn new(out: W) -> Self {
        Self { out }
    }

    /// Write one event and flush, so consumers see it immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    pub fn emit(&mut self, event: &DaemonEvent) -> Result<(), EventError> {
        serde_json::to_writer(&mut self.out, event)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }

    /// Recover the wrapped stream.
    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use scalebridge_core::{BleErrorCode, MacAddress, MeasurementSource};
    use serde_json::Value;

    fn lines(sink: EventSink<Vec<u8>>) -> Vec<Value> {
        String::from_utf8(sink.into_inner())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_one_object_per_line() {
        let mut sink = EventSink::new(Vec::new());
        sink.emit(&DaemonEvent::State {
            state: ConnectionState::Scanning,
        })
        .unwrap();
        sink.emit(&DaemonEvent::KeyCheck { matches: true }).unwrap();

        let events = lines(sink);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"], "state");
        assert_eq!(events[0]["state"], "scanning");
        assert_eq!(events[1]["event"], "key_check");
        assert_eq!(events[1]["matches"], true);
    }

    #[test]
    fn test_measurement_fields_are_flattened() {
        let mut sink = EventSink::new(Vec::new());
        sink.emit(&DaemonEvent::Measurement {
            measurement: RawMeasurement {
                address: MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
                weight_kg: 70.5,
                impedance_ohm: Some(500),
                heart_rate_bpm: None,
                timestamp: Utc.with_ymd_and_hms(2025, 1, 15, 7, 30, 0).unwrap(),
                source: MeasurementSource::Advertisement,
            },
        })
        .unwrap();

        let event = &lines(sink)[0];
        assert_eq!(event["event"], "measurement");
        assert_eq!(event["address"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(event["weight_kg"], 70.5);
        assert_eq!(event["impedance_ohm"], 500);
        assert_eq!(event["source"], "advertisement");
    }

    #[test]
    fn test_error_carries_code() {
        let mut sink = EventSink::new(Vec::new());
        sink.emit(&DaemonEvent::Error {
            error: BleError::new(BleErrorCode::BluetoothOff),
        })
        .unwrap();

        let event = &lines(sink)[0];
        assert_eq!(event["event"], "error");
        assert_eq!(event["code"], "BLUETOOTH_OFF");
        assert_eq!(event["recoverable"], true);
    }
}
