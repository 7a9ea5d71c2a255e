//! Scan/connect/read lifecycle for a single bound scale.
//!
//! [`ConnectionManager`] is a cloneable handle onto one actor task that owns
//! every piece of mutable state: the radio scan, the in-flight connection
//! attempt, the bound address, timers and pending readers. Handles send
//! commands over a channel and receive replies on oneshots; the platform
//! binding feeds [`AdapterEvent`]s in over its own channel. The actor handles
//! one message at a time, so no state is shared behind locks.
//!
//! ```text
//! Idle -> Scanning -> Connecting -> Connected <-> Reading
//!            ^                          |
//!            +---- reconnect timer <- Disconnected / Error
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use scalebridge_core::bluetooth::{AdapterEvent, BluetoothAdapter};
//! use scalebridge_core::manager::{ConnectionManager, ManagerOptions, ScanOutcome};
//! use tokio::sync::mpsc;
//!
//! async fn first_reading(
//!     adapter: Arc<dyn BluetoothAdapter>,
//!     events: mpsc::Receiver<AdapterEvent>,
//! ) -> Result<f64, scalebridge_core::error::BleError> {
//!     let manager = ConnectionManager::new(adapter, events, ManagerOptions::default());
//!     if manager.start_scanning(None).await? == ScanOutcome::AdapterNotReady {
//!         manager.wait_for_adapter(std::time::Duration::from_secs(10)).await;
//!         manager.start_scanning(None).await?;
//!     }
//!     let measurement = manager.read_measurement(None).await?;
//!     Ok(measurement.weight_kg)
//! }
//! ```

mod actor;
mod subscription;

pub use subscription::Subscription;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use uuid::Uuid;

use crate::bluetooth::{AdapterEvent, BluetoothAdapter};
use crate::characteristic::SCALE_SERVICES;
use crate::config::{Config, ScanConfig};
use crate::crypto::BindKey;
use crate::error::{BleError, ScaleError};
use crate::retry::RetryConfig;
use crate::types::{AdapterPower, ConnectionState, DiscoveredDevice, MacAddress, RawMeasurement};

use actor::Command;
use subscription::SUBSCRIPTION_CAPACITY;

const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Runtime settings for a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Default wait for [`ConnectionManager::start_scanning`].
    pub scan_timeout: Duration,
    /// Limit on a single connection handshake.
    pub connect_timeout: Duration,
    /// Default wait for [`ConnectionManager::read_measurement`].
    pub read_timeout: Duration,
    /// Connect as soon as the filter selects a scale.
    pub auto_connect: bool,
    /// Ask the radio to report repeated advertisements.
    pub allow_duplicates: bool,
    /// Re-scan after a dropped link or failed connection.
    pub auto_reconnect: bool,
    /// Fixed delay before a reconnect scan.
    pub reconnect_interval: Duration,
    /// Measurements arriving closer together than this are suppressed.
    pub dedup_window: Duration,
    /// Backoff for connection attempts.
    pub retry: RetryConfig,
    /// Scale this manager is bound to, if setup already happened.
    pub bound_address: Option<MacAddress>,
    /// Key for encrypted advertisements.
    pub bind_key: Option<BindKey>,
    /// Service UUIDs passed to the radio scan filter. Empty scans everything.
    pub service_filter: Vec<Uuid>,
}

impl ManagerOptions {
    fn from_parts(scan: &ScanConfig, retry: RetryConfig) -> Self {
        Self {
            scan_timeout: Duration::from_millis(scan.scan_timeout_ms),
            connect_timeout: Duration::from_millis(scan.connect_timeout_ms),
            read_timeout: Duration::from_millis(scan.read_timeout_ms),
            auto_connect: scan.auto_connect,
            allow_duplicates: scan.allow_duplicates,
            auto_reconnect: scan.auto_reconnect,
            reconnect_interval: Duration::from_millis(scan.reconnect_interval_ms),
            dedup_window: Duration::from_millis(scan.dedup_window_ms),
            retry,
            bound_address: None,
            bind_key: None,
            service_filter: SCALE_SERVICES.to_vec(),
        }
    }

    /// Build options from loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured address or bind key is malformed.
    pub fn from_config(config: &Config) -> crate::Result<Self> {
        let mut options = Self::from_parts(&config.scan, config.retry);
        options.bound_address = config.device.address.as_deref().map(str::parse).transpose()?;
        options.bind_key = config.device.bind_key.as_deref().map(str::parse).transpose()?;
        Ok(options)
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from_parts(&ScanConfig::default(), RetryConfig::default())
    }
}

/// Successful outcome of [`ConnectionManager::start_scanning`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The filter selected this scale.
    Selected(MacAddress),
    /// The adapter is not powered on; nothing was started. Retry after
    /// [`ConnectionManager::wait_for_adapter`].
    AdapterNotReady,
}

/// Fan-out senders for the four event streams.
#[derive(Debug)]
pub(crate) struct EventHub {
    pub(crate) state: broadcast::Sender<ConnectionState>,
    pub(crate) errors: broadcast::Sender<BleError>,
    pub(crate) discovered: broadcast::Sender<DiscoveredDevice>,
    pub(crate) measurements: broadcast::Sender<RawMeasurement>,
}

impl EventHub {
    fn new() -> Self {
        Self {
            state: broadcast::channel(SUBSCRIPTION_CAPACITY).0,
            errors: broadcast::channel(SUBSCRIPTION_CAPACITY).0,
            discovered: broadcast::channel(SUBSCRIPTION_CAPACITY).0,
            measurements: broadcast::channel(SUBSCRIPTION_CAPACITY).0,
        }
    }
}

/// Operations the application layer drives a scale through.
#[async_trait]
pub trait ScalePort: Send + Sync {
    /// Scan until the filter selects a scale.
    async fn scan(&self, timeout: Option<Duration>) -> Result<ScanOutcome, BleError>;
    /// Collect nearby scales for `timeout`; never fails.
    async fn scan_for_devices(&self, timeout: Option<Duration>) -> Vec<DiscoveredDevice>;
    /// Stop the radio scan.
    async fn stop_scan(&self) -> Result<(), BleError>;
    /// Connect to `address`, optionally replacing the bind key.
    async fn connect(&self, address: &str, key: Option<&str>) -> Result<(), BleError>;
    /// Drop the link and stop reconnecting.
    async fn disconnect(&self) -> Result<(), BleError>;
    /// Wait for the next stable measurement.
    async fn read_measurement(&self, timeout: Option<Duration>) -> Result<RawMeasurement, BleError>;
    /// Whether the bound scale was seen recently.
    async fn is_device_available(&self) -> bool;
    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;
    /// State transitions.
    fn subscribe_state(&self) -> Subscription<ConnectionState>;
    /// Classified failures.
    fn subscribe_errors(&self) -> Subscription<BleError>;
    /// Newly seen scales.
    fn subscribe_discovered(&self) -> Subscription<DiscoveredDevice>;
    /// Delivered measurements.
    fn subscribe_measurements(&self) -> Subscription<RawMeasurement>;
}

/// Handle onto the connection actor.
///
/// Cloning is cheap; all clones drive the same actor. The actor stops after
/// [`ConnectionManager::shutdown`] or once every handle is dropped.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    power: watch::Receiver<AdapterPower>,
    hub: Arc<EventHub>,
    scan_timeout: Duration,
    read_timeout: Duration,
}

impl ConnectionManager {
    /// Spawn the actor on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new(
        adapter: Arc<dyn BluetoothAdapter>,
        events: mpsc::Receiver<AdapterEvent>,
        options: ManagerOptions,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (state_tx, state) = watch::channel(ConnectionState::Idle);
        let (power_tx, power) = watch::channel(AdapterPower::Unknown);
        let hub = Arc::new(EventHub::new());
        let scan_timeout = options.scan_timeout;
        let read_timeout = options.read_timeout;

        actor::spawn(
            adapter,
            options,
            Arc::clone(&hub),
            state_tx,
            power_tx,
            command_rx,
            events,
        );

        Self {
            commands,
            state,
            power,
            hub,
            scan_timeout,
            read_timeout,
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, BleError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| BleError::from(ScaleError::ManagerStopped))?;
        response
            .await
            .map_err(|_| BleError::from(ScaleError::ManagerStopped))
    }

    /// Start scanning and wait until the filter selects a scale.
    ///
    /// With auto-connect enabled the selected scale is connected in the
    /// background; watch [`ConnectionManager::subscribe_state`] for progress.
    ///
    /// # Errors
    ///
    /// Returns `DEVICE_NOT_FOUND` when no scale is selected within `timeout`
    /// (the radio scan is stopped first), or a classified adapter failure.
    pub async fn start_scanning(&self, timeout: Option<Duration>) -> Result<ScanOutcome, BleError> {
        let timeout = timeout.unwrap_or(self.scan_timeout);
        self.request(|reply| Command::StartScanning { timeout, reply })
            .await?
    }

    /// Collect the scales advertising within `timeout`.
    ///
    /// An unpowered adapter or a stopped manager yields an empty list.
    pub async fn scan_for_devices(&self, timeout: Option<Duration>) -> Vec<DiscoveredDevice> {
        let timeout = timeout.unwrap_or(self.scan_timeout);
        self.request(|reply| Command::ScanForDevices { timeout, reply })
            .await
            .unwrap_or_default()
    }

    /// Stop the radio scan and cancel every scan-dependent waiter.
    ///
    /// # Errors
    ///
    /// Returns a classified error if the adapter refuses to stop.
    pub async fn stop_scanning(&self) -> Result<(), BleError> {
        self.request(|reply| Command::StopScanning { reply }).await?
    }

    /// Bind to `address` and connect, scanning for it first if it has not
    /// been seen recently. Concurrent calls for the same address share one
    /// connection attempt.
    ///
    /// # Errors
    ///
    /// - `INVALID_DATA` for a malformed address
    /// - `DECRYPTION_FAILED` for a malformed key
    /// - `DEVICE_NOT_FOUND`, `CONNECTION_TIMEOUT` or `BLUETOOTH_OFF` when the
    ///   connection cannot be established
    pub async fn connect(&self, address: &str, key: Option<&str>) -> Result<(), BleError> {
        let address: MacAddress = address.parse().map_err(BleError::from)?;
        let key = key
            .map(str::parse::<BindKey>)
            .transpose()
            .map_err(BleError::from)?;
        self.request(|reply| Command::Connect {
            address,
            key,
            reply,
        })
        .await?
    }

    /// Drop the link, cancel any pending reconnect and stop auto-connecting.
    ///
    /// # Errors
    ///
    /// Returns a classified error if the adapter fails to disconnect.
    pub async fn disconnect(&self) -> Result<(), BleError> {
        self.request(|reply| Command::Disconnect { reply }).await?
    }

    /// Wait for the next stable, non-duplicate measurement from the bound scale.
    ///
    /// # Errors
    ///
    /// Returns `READ_FAILED` if none arrives within `timeout`.
    pub async fn read_measurement(&self, timeout: Option<Duration>) -> Result<RawMeasurement, BleError> {
        let timeout = timeout.unwrap_or(self.read_timeout);
        self.request(|reply| Command::ReadMeasurement { timeout, reply })
            .await?
    }

    /// Whether the bound scale is connected or was seen recently. Without a
    /// binding, whether exactly one scale is in range.
    pub async fn is_device_available(&self) -> bool {
        self.request(|reply| Command::IsDeviceAvailable { reply })
            .await
            .unwrap_or(false)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Last reported adapter power state.
    #[must_use]
    pub fn adapter_power(&self) -> AdapterPower {
        *self.power.borrow()
    }

    /// Wait up to `timeout` for the adapter to report powered on.
    pub async fn wait_for_adapter(&self, timeout: Duration) -> bool {
        let mut power = self.power.clone();
        let powered = matches!(
            tokio::time::timeout(timeout, power.wait_for(|p| *p == AdapterPower::PoweredOn)).await,
            Ok(Ok(_))
        );
        powered
    }

    /// Stop the actor, the radio scan and any open link.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }

    /// Subscribe to state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> Subscription<ConnectionState> {
        Subscription::new(self.hub.state.subscribe())
    }

    /// Subscribe to classified failures.
    #[must_use]
    pub fn subscribe_errors(&self) -> Subscription<BleError> {
        Subscription::new(self.hub.errors.subscribe())
    }

    /// Subscribe to scales seen for the first time (or again after going stale).
    #[must_use]
    pub fn subscribe_discovered(&self) -> Subscription<DiscoveredDevice> {
        Subscription::new(self.hub.discovered.subscribe())
    }

    /// Subscribe to delivered measurements.
    #[must_use]
    pub fn subscribe_measurements(&self) -> Subscription<RawMeasurement> {
        Subscription::new(self.hub.measurements.subscribe())
    }
}

#[async_trait]
impl ScalePort for ConnectionManager {
    async fn scan(&self, timeout: Option<Duration>) -> Result<ScanOutcome, BleError> {
        self.start_scanning(timeout).await
    }

    async fn scan_for_devices(&self, timeout: Option<Duration>) -> Vec<DiscoveredDevice> {
        Self::scan_for_devices(self, timeout).await
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.stop_scanning().await
    }

    async fn connect(&self, address: &str, key: Option<&str>) -> Result<(), BleError> {
        Self::connect(self, address, key).await
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        Self::disconnect(self).await
    }

    async fn read_measurement(&self, timeout: Option<Duration>) -> Result<RawMeasurement, BleError> {
        Self::read_measurement(self, timeout).await
    }

    async fn is_device_available(&self) -> bool {
        Self::is_device_available(self).await
    }

    fn state(&self) -> ConnectionState {
        Self::state(self)
    }

    fn subscribe_state(&self) -> Subscription<ConnectionState> {
        Self::subscribe_state(self)
    }

    fn subscribe_errors(&self) -> Subscription<BleError> {
        Self::subscribe_errors(self)
    }

    fn subscribe_discovered(&self) -> Subscription<DiscoveredDevice> {
        Self::subscribe_discovered(self)
    }

    fn subscribe_measurements(&self) -> Subscription<RawMeasurement> {
        Self::subscribe_measurements(self)
    }
}
