//! In-memory adapter for tests.
//!
//! Records every call, lets tests inject advertisements, notifications and
//! power changes, and can hold connection attempts open until released.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{AdapterError, AdapterEvent, AdapterResult, Advertisement, BluetoothAdapter, EVENT_CHANNEL_CAPACITY};
use crate::characteristic::MEASUREMENT_CHARACTERISTICS;
use crate::types::{AdapterPower, MacAddress};

#[derive(Debug, Default)]
struct MockState {
    power: AdapterPower,
    scanning: bool,
    scan_filter: Vec<Uuid>,
    start_scan_calls: u32,
    stop_scan_calls: u32,
    connect_calls: u32,
    disconnect_calls: u32,
    connected: HashSet<MacAddress>,
    characteristics: Vec<Uuid>,
    subscriptions: Vec<(MacAddress, Uuid)>,
    connect_error: Option<AdapterError>,
}

/// A scriptable [`BluetoothAdapter`].
#[derive(Debug)]
pub struct MockAdapter {
    state: Mutex<MockState>,
    events: mpsc::Sender<AdapterEvent>,
    connect_gate: watch::Sender<bool>,
    discovery_gate: watch::Sender<bool>,
}

impl MockAdapter {
    /// Create a powered-on adapter exposing the standard measurement characteristics.
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::Receiver<AdapterEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (connect_gate, _) = watch::channel(true);
        let (discovery_gate, _) = watch::channel(true);
        let adapter = Self {
            state: Mutex::new(MockState {
                power: AdapterPower::PoweredOn,
                characteristics: MEASUREMENT_CHARACTERISTICS.to_vec(),
                ..MockState::default()
            }),
            events,
            connect_gate,
            discovery_gate,
        };
        (Arc::new(adapter), rx)
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push an event to the manager.
    pub async fn emit(&self, event: AdapterEvent) {
        // A closed receiver just means the manager has shut down.
        let _ = self.events.send(event).await;
    }

    /// Deliver an advertisement.
    pub async fn advertise(&self, advertisement: Advertisement) {
        self.emit(AdapterEvent::Advertisement(advertisement)).await;
    }

    /// Deliver a characteristic notification.
    pub async fn notify(&self, address: MacAddress, characteristic: Uuid, value: Vec<u8>) {
        self.emit(AdapterEvent::Notification {
            address,
            characteristic,
            value,
        })
        .await;
    }

    /// Change the power state and announce it.
    pub async fn set_power(&self, power: AdapterPower) {
        self.state().power = power;
        self.emit(AdapterEvent::PowerChanged(power)).await;
    }

    /// Drop a link from the peripheral side.
    pub async fn drop_link(&self, address: MacAddress) {
        self.state().connected.remove(&address);
        self.emit(AdapterEvent::Disconnected(address)).await;
    }

    /// Make `connect` block until [`MockAdapter::release_connects`].
    pub fn hold_connects(&self) {
        self.connect_gate.send_replace(false);
    }

    /// Let held `connect` calls complete.
    pub fn release_connects(&self) {
        self.connect_gate.send_replace(true);
    }

    /// Make `discover_services` stall until [`MockAdapter::release_discovery`].
    pub fn hold_discovery(&self) {
        self.discovery_gate.send_replace(false);
    }

    /// Let held `discover_services` calls complete.
    pub fn release_discovery(&self) {
        self.discovery_gate.send_replace(true);
    }

    /// Make every `connect` fail with `error` (or succeed again with `None`).
    pub fn fail_connects_with(&self, error: Option<AdapterError>) {
        self.state().connect_error = error;
    }

    /// Characteristics reported by `discover_services`.
    pub fn set_characteristics(&self, characteristics: Vec<Uuid>) {
        self.state().characteristics = characteristics;
    }

    /// Number of `start_scanning` calls.
    #[must_use]
    pub fn start_scan_calls(&self) -> u32 {
        self.state().start_scan_calls
    }

    /// Number of `stop_scanning` calls.
    #[must_use]
    pub fn stop_scan_calls(&self) -> u32 {
        self.state().stop_scan_calls
    }

    /// Number of `connect` calls.
    #[must_use]
    pub fn connect_calls(&self) -> u32 {
        self.state().connect_calls
    }

    /// Number of `disconnect` calls.
    #[must_use]
    pub fn disconnect_calls(&self) -> u32 {
        self.state().disconnect_calls
    }

    /// Whether a scan is running.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.state().scanning
    }

    /// Service filter passed to the last `start_scanning`.
    #[must_use]
    pub fn scan_filter(&self) -> Vec<Uuid> {
        self.state().scan_filter.clone()
    }

    /// Characteristics subscribed so far.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<(MacAddress, Uuid)> {
        self.state().subscriptions.clone()
    }
}

#[async_trait]
impl BluetoothAdapter for MockAdapter {
    async fn power_state(&self) -> AdapterPower {
        self.state().power
    }

    async fn start_scanning(&self, services: &[Uuid], _allow_duplicates: bool) -> AdapterResult<()> {
        let mut state = self.state();
        if state.power != AdapterPower::PoweredOn {
            return Err(AdapterError::PoweredOff);
        }
        state.start_scan_calls += 1;
        state.scanning = true;
        state.scan_filter = services.to_vec();
        Ok(())
    }

    async fn stop_scanning(&self) -> AdapterResult<()> {
        let mut state = self.state();
        state.stop_scan_calls += 1;
        state.scanning = false;
        Ok(())
    }

    async fn connect(&self, address: MacAddress) -> AdapterResult<()> {
        self.state().connect_calls += 1;

        let mut gate = self.connect_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let mut state = self.state();
        if let Some(error) = state.connect_error.clone() {
            return Err(error);
        }
        state.connected.insert(address);
        Ok(())
    }

    async fn disconnect(&self, address: MacAddress) -> AdapterResult<()> {
        let mut state = self.state();
        state.disconnect_calls += 1;
        state.connected.remove(&address);
        Ok(())
    }

    async fn discover_services(&self, address: MacAddress) -> AdapterResult<Vec<Uuid>> {
        let mut gate = self.discovery_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let state = self.state();
        if !state.connected.contains(&address) {
            return Err(AdapterError::PeripheralNotFound(address));
        }
        Ok(state.characteristics.clone())
    }

    async fn subscribe(&self, address: MacAddress, characteristic: Uuid) -> AdapterResult<()> {
        let mut state = self.state();
        if !state.characteristics.contains(&characteristic) {
            return Err(AdapterError::Transport(format!(
                "characteristic {characteristic} not exposed"
            )));
        }
        state.subscriptions.push((address, characteristic));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls() {
        let (adapter, _events) = MockAdapter::new();
        let address = MacAddress([1, 2, 3, 4, 5, 6]);

        adapter.start_scanning(&[], true).await.unwrap();
        assert!(adapter.is_scanning());
        adapter.stop_scanning().await.unwrap();
        assert!(!adapter.is_scanning());

        adapter.connect(address).await.unwrap();
        let characteristics = adapter.discover_services(address).await.unwrap();
        assert_eq!(characteristics.len(), 3);
        adapter.subscribe(address, characteristics[0]).await.unwrap();

        assert_eq!(adapter.start_scan_calls(), 1);
        assert_eq!(adapter.stop_scan_calls(), 1);
        assert_eq!(adapter.connect_calls(), 1);
        assert_eq!(adapter.subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_powered_off_rejects_scan() {
        let (adapter, mut events) = MockAdapter::new();
        adapter.set_power(AdapterPower::PoweredOff).await;
        assert_eq!(
            events.recv().await,
            Some(AdapterEvent::PowerChanged(AdapterPower::PoweredOff))
        );
        assert_eq!(
            adapter.start_scanning(&[], false).await,
            Err(AdapterError::PoweredOff)
        );
    }

    #[tokio::test]
    async fn test_held_connect_waits_for_release() {
        let (adapter, _events) = MockAdapter::new();
        adapter.hold_connects();

        let pending = {
            let adapter = Arc::clone(&adapter);
            tokio::spawn(async move { adapter.connect(MacAddress([1; 6])).await })
        };
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        adapter.release_connects();
        assert_eq!(pending.await.unwrap(), Ok(()));
    }
}
