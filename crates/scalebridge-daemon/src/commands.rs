//! Command runners.
//!
//! Each runner drives a [`ScalePort`] and reports through an [`EventSink`],
//! so the binary only parses arguments and wires the backend.

use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Context;
use scalebridge_core::{
    BleError, BleErrorCode, DiscoveredDevice, KeySample, MacAddress, RawMeasurement, ScalePort,
    ScanOutcome,
};
use tracing::{debug, info, warn};

use crate::events::{DaemonEvent, EventSink};

/// Pause before scanning again when the adapter was not ready.
pub const ADAPTER_RETRY_INTERVAL: Duration = Duration::from_secs(5);

type ScanFuture<'a> = Pin<Box<dyn Future<Output = Result<ScanOutcome, BleError>> + Send + 'a>>;

/// Scan for `duration` and report every scale seen.
///
/// # Errors
///
/// Returns an error if an event cannot be written.
pub async fn scan<W: Write>(
    port: &dyn ScalePort,
    duration: Duration,
    sink: &mut EventSink<W>,
) -> anyhow::Result<Vec<DiscoveredDevice>> {
    info!(?duration, "scanning for scales");
    let devices = port.scan_for_devices(Some(duration)).await;
    for device in &devices {
        sink.emit(&DaemonEvent::Discovered {
            device: device.clone(),
        })?;
    }
    sink.emit(&DaemonEvent::ScanFinished {
        devices: devices.len(),
    })?;
    Ok(devices)
}

/// Locate the scale, then wait for one stable measurement.
///
/// # Errors
///
/// Returns an error if the adapter is off, no scale is found, or no
/// measurement arrives in time. The classified error is also written to
/// `sink`.
pub async fn read<W: Write>(
    port: &dyn ScalePort,
    timeout: Option<Duration>,
    sink: &mut EventSink<W>,
) -> anyhow::Result<RawMeasurement> {
    let outcome = port.scan(None).await;
    let result = match outcome {
        Ok(ScanOutcome::Selected(address)) => {
            info!(%address, "scale located, waiting for a measurement");
            port.read_measurement(timeout).await
        }
        Ok(ScanOutcome::AdapterNotReady) => Err(BleError::new(BleErrorCode::BluetoothOff)),
        Err(error) => Err(error),
    };

    match result {
        Ok(measurement) => {
            sink.emit(&DaemonEvent::Measurement {
                measurement: measurement.clone(),
            })?;
            Ok(measurement)
        }
        Err(error) => {
            sink.emit(&DaemonEvent::Error {
                error: error.clone(),
            })?;
            Err(error).context("no measurement received")
        }
    }
}

/// Stream state changes, errors, discoveries and measurements until
/// `shutdown` resolves.
///
/// The scan is restarted whenever the adapter was not ready. Connection
/// loss and scan timeouts are handled by the manager's own reconnect.
///
/// # Errors
///
/// Returns an error if an event cannot be written.
pub async fn listen<W, F>(port: &dyn ScalePort, sink: &mut EventSink<W>, shutdown: F) -> anyhow::Result<()>
where
    W: Write,
    F: Future<Output = ()>,
{
    let mut states = port.subscribe_state();
    let mut errors = port.subscribe_errors();
    let mut discovered = port.subscribe_discovered();
    let mut measurements = port.subscribe_measurements();

    let mut scan: ScanFuture<'_> = port.scan(None);
    let mut scanning = true;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("shutting down");
                break;
            }
            outcome = &mut scan, if scanning => match outcome {
                Ok(ScanOutcome::Selected(address)) => {
                    info!(%address, "scale selected");
                    scanning = false;
                }
                Ok(ScanOutcome::AdapterNotReady) => {
                    warn!("Bluetooth adapter not ready, retrying");
                    scan = Box::pin(async move {
                        tokio::time::sleep(ADAPTER_RETRY_INTERVAL).await;
                        port.scan(None).await
                    });
                }
                Err(error) => {
                    // Already delivered on the error subscription.
                    debug!(code = %error.code, "initial scan ended without a scale");
                    scanning = false;
                }
            },
            Some(state) = states.recv() => sink.emit(&DaemonEvent::State { state })?,
            Some(error) = errors.recv() => sink.emit(&DaemonEvent::Error { error })?,
            Some(device) = discovered.recv() => sink.emit(&DaemonEvent::Discovered { device })?,
            Some(measurement) = measurements.recv() => {
                sink.emit(&DaemonEvent::Measurement { measurement })?;
            }
        }
    }

    if let Err(error) = port.disconnect().await {
        debug!(%error, "disconnect during shutdown failed");
    }
    Ok(())
}

/// Check `key` against a hex-encoded MiBeacon service-data capture.
///
/// `address` is only needed when the frame itself carries none.
///
/// # Errors
///
/// Returns an error if the capture is not hex or the address is malformed.
pub fn test_key(key: &str, advertisement_hex: &str, address: Option<&str>) -> anyhow::Result<bool> {
    let service_data =
        hex::decode(advertisement_hex.trim()).context("advertisement must be hexadecimal")?;
    let address = address
        .map(str::parse::<MacAddress>)
        .transpose()
        .context("invalid scale address")?;

    Ok(scalebridge_core::test_key(
        key,
        &KeySample {
            service_data: &service_data,
            address,
            plaintext: None,
        },
    ))
}
