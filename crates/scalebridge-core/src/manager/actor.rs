//! The task that owns all connection state.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{EventHub, ManagerOptions, ScanOutcome};
use crate::bluetooth::{AdapterError, AdapterEvent, AdapterResult, Advertisement, BluetoothAdapter};
use crate::characteristic::{
    parse_body_composition, NotificationDecoder, BODY_COMPOSITION_SERVICE, MEASUREMENT_CHARACTERISTICS,
    MIBEACON_SERVICE, WEIGHT_SCALE_SERVICE,
};
use crate::crypto::{decrypt_payload, BindKey};
use crate::error::{to_ble_error, BleError, BleErrorCode, ScaleError};
use crate::filter::{is_scale_candidate, select_device, Selection, VisiblePeripheral};
use crate::frame::decode_frame;
use crate::objects::extract_objects;
use crate::retry::{is_retryable, with_conditional_retry, RetryConfig};
use crate::types::{
    AdapterPower, ConnectionState, DiscoveredDevice, MacAddress, MeasurementSource, RawMeasurement,
};

/// A sighting older than this no longer counts as "in range".
pub(super) const SIGHTING_TTL: Duration = Duration::from_secs(30);

/// Sightings kept before stale entries are pruned.
const MAX_SIGHTINGS: usize = 256;

type Reply<T> = oneshot::Sender<T>;

pub(super) enum Command {
    StartScanning {
        timeout: Duration,
        reply: Reply<Result<ScanOutcome, BleError>>,
    },
    ScanForDevices {
        timeout: Duration,
        reply: Reply<Vec<DiscoveredDevice>>,
    },
    StopScanning {
        reply: Reply<Result<(), BleError>>,
    },
    Connect {
        address: MacAddress,
        key: Option<BindKey>,
        reply: Reply<Result<(), BleError>>,
    },
    Disconnect {
        reply: Reply<Result<(), BleError>>,
    },
    ReadMeasurement {
        timeout: Duration,
        reply: Reply<Result<RawMeasurement, BleError>>,
    },
    IsDeviceAvailable {
        reply: Reply<bool>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    ScanDeadline,
    ConnectDeadline,
    Discovery,
    ReadDeadline,
    Reconnect,
}

enum Internal {
    TimerFired {
        id: u64,
        kind: TimerKind,
    },
    ConnectFinished {
        attempt: u64,
        address: MacAddress,
        result: Result<Vec<Uuid>, AdapterError>,
    },
}

struct Sighting {
    peripheral: VisiblePeripheral,
    rssi: Option<i16>,
    seen_at: Instant,
}

impl Sighting {
    fn is_fresh(&self) -> bool {
        self.seen_at.elapsed() < SIGHTING_TTL
    }

    fn summary(&self) -> DiscoveredDevice {
        DiscoveredDevice {
            address: self.peripheral.address,
            name: self.peripheral.name.clone(),
            rssi: self.rssi,
        }
    }
}

struct ConnectAttempt {
    id: u64,
    address: MacAddress,
    task: JoinHandle<()>,
    waiters: Vec<Reply<Result<(), BleError>>>,
}

/// An explicit `connect` for a scale that has not been seen yet.
struct PendingConnect {
    address: MacAddress,
    deadline: u64,
    waiters: Vec<Reply<Result<(), BleError>>>,
}

struct DiscoverySession {
    found: BTreeMap<MacAddress, DiscoveredDevice>,
    reply: Reply<Vec<DiscoveredDevice>>,
}

impl DiscoverySession {
    fn finish(self) {
        let _ = self.reply.send(self.found.into_values().collect());
    }
}

struct Actor {
    adapter: Arc<dyn BluetoothAdapter>,
    options: ManagerOptions,
    hub: Arc<EventHub>,
    state: watch::Sender<ConnectionState>,
    power: watch::Sender<AdapterPower>,
    internal: mpsc::UnboundedSender<Internal>,

    bound: Option<MacAddress>,
    key: Option<BindKey>,
    scanning: bool,
    /// Keep (re)connecting to the bound scale until `disconnect`.
    want_connection: bool,
    sightings: HashMap<MacAddress, Sighting>,
    scan_waiters: Vec<Reply<Result<ScanOutcome, BleError>>>,
    scan_deadline: Option<u64>,
    discoveries: HashMap<u64, DiscoverySession>,
    pending_connect: Option<PendingConnect>,
    connecting: Option<ConnectAttempt>,
    connected: Option<MacAddress>,
    /// Keyed by the id of each reader's deadline timer.
    readers: HashMap<u64, Reply<Result<RawMeasurement, BleError>>>,
    reconnect_timer: Option<u64>,
    timers: HashMap<u64, JoinHandle<()>>,
    next_id: u64,
    last_measurement_at: Option<Instant>,
    decrypt_failure_reported: bool,
    gatt: NotificationDecoder,
}

pub(super) fn spawn(
    adapter: Arc<dyn BluetoothAdapter>,
    options: ManagerOptions,
    hub: Arc<EventHub>,
    state: watch::Sender<ConnectionState>,
    power: watch::Sender<AdapterPower>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Receiver<AdapterEvent>,
) {
    let (internal, internal_rx) = mpsc::unbounded_channel();
    let actor = Actor {
        adapter,
        bound: options.bound_address,
        key: options.bind_key.clone(),
        options,
        hub,
        state,
        power,
        internal,
        scanning: false,
        want_connection: false,
        sightings: HashMap::new(),
        scan_waiters: Vec::new(),
        scan_deadline: None,
        discoveries: HashMap::new(),
        pending_connect: None,
        connecting: None,
        connected: None,
        readers: HashMap::new(),
        reconnect_timer: None,
        timers: HashMap::new(),
        next_id: 0,
        last_measurement_at: None,
        decrypt_failure_reported: false,
        gatt: NotificationDecoder::default(),
    };
    tokio::spawn(actor.run(commands, events, internal_rx));
}

/// Run one adapter step, failing with [`AdapterError::Timeout`] after `limit`.
async fn bounded<T>(
    limit: Duration,
    step: impl Future<Output = AdapterResult<T>> + Send,
) -> AdapterResult<T> {
    time::timeout(limit, step)
        .await
        .unwrap_or_else(|_| Err(AdapterError::Timeout(limit)))
}

/// Connect with retry, then subscribe to whichever measurement
/// characteristics the scale exposes.
async fn establish(
    adapter: &dyn BluetoothAdapter,
    address: MacAddress,
    connect_timeout: Duration,
    retry: &RetryConfig,
) -> Result<Vec<Uuid>, AdapterError> {
    with_conditional_retry(
        || async move {
            bounded(connect_timeout, adapter.connect(address)).await
        },
        |err: &AdapterError| is_retryable(err),
        |attempt, err, delay| {
            warn!(%address, attempt, error = %err, ?delay, "connection attempt failed, retrying");
        },
        retry,
    )
    .await?;

    let exposed = match bounded(connect_timeout, adapter.discover_services(address)).await {
        Ok(exposed) => exposed,
        Err(err) => {
            if let Err(disconnect) = bounded(connect_timeout, adapter.disconnect(address)).await {
                debug!(%address, error = %disconnect, "disconnect after failed discovery failed");
            }
            return Err(err);
        }
    };
    let mut subscribed = Vec::new();
    for characteristic in MEASUREMENT_CHARACTERISTICS {
        if !exposed.contains(&characteristic) {
            continue;
        }
        match bounded(connect_timeout, adapter.subscribe(address, characteristic)).await {
            Ok(()) => subscribed.push(characteristic),
            Err(err) => warn!(%address, %characteristic, error = %err, "subscribe failed"),
        }
    }
    Ok(subscribed)
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<AdapterEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let initial = self.adapter.power_state().await;
        self.power.send_replace(initial);
        debug!(power = ?initial, bound = ?self.bound, "connection manager started");

        let mut events_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("adapter event stream closed");
                        events_open = false;
                    }
                },
                Some(message) = internal.recv() => self.handle_internal(message).await,
            }
        }

        self.teardown().await;
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartScanning { timeout, reply } => self.start_scanning(timeout, reply).await,
            Command::ScanForDevices { timeout, reply } => self.scan_for_devices(timeout, reply).await,
            Command::StopScanning { reply } => {
                let result = self.stop_scanning().await;
                let _ = reply.send(result);
            }
            Command::Connect {
                address,
                key,
                reply,
            } => self.connect(address, key, reply).await,
            Command::Disconnect { reply } => {
                let result = self.disconnect().await;
                let _ = reply.send(result);
            }
            Command::ReadMeasurement { timeout, reply } => self.read_measurement(timeout, reply).await,
            Command::IsDeviceAvailable { reply } => {
                let _ = reply.send(self.is_device_available());
            }
            Command::Shutdown { reply } => {
                // Handled in `run`; kept exhaustive.
                let _ = reply.send(());
            }
        }
    }

    async fn handle_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::PowerChanged(power) => self.power_changed(power).await,
            AdapterEvent::Advertisement(advertisement) => self.advertisement(&advertisement).await,
            AdapterEvent::Notification {
                address,
                characteristic,
                value,
            } => {
                if self.connected != Some(address) {
                    trace!(%address, "notification from a peripheral we are not connected to");
                    return;
                }
                if let Some(sample) = self.gatt.decode(characteristic, &value) {
                    self.deliver(
                        address,
                        sample.weight_kg,
                        sample.impedance_ohm,
                        MeasurementSource::Gatt,
                    );
                }
            }
            AdapterEvent::Disconnected(address) => self.link_lost(address).await,
        }
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::TimerFired { id, kind } => {
                if self.timers.remove(&id).is_none() {
                    trace!(id, ?kind, "ignoring cancelled timer");
                    return;
                }
                match kind {
                    TimerKind::ScanDeadline => self.scan_timed_out(id).await,
                    TimerKind::ConnectDeadline => self.pending_connect_timed_out(id).await,
                    TimerKind::Discovery => self.discovery_finished(id).await,
                    TimerKind::ReadDeadline => self.read_timed_out(id).await,
                    TimerKind::Reconnect => {
                        if self.reconnect_timer == Some(id) {
                            self.reconnect_timer = None;
                            self.reconnect().await;
                        }
                    }
                }
            }
            Internal::ConnectFinished {
                attempt,
                address,
                result,
            } => self.connect_finished(attempt, address, result).await,
        }
    }

    // =========================================================================
    // BOOKKEEPING
    // =========================================================================

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn start_timer(&mut self, delay: Duration, kind: TimerKind) -> u64 {
        let id = self.next_id();
        let internal = self.internal.clone();
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = internal.send(Internal::TimerFired { id, kind });
        });
        self.timers.insert(id, handle);
        id
    }

    fn cancel_timer(&mut self, id: Option<u64>) {
        if let Some(handle) = id.and_then(|id| self.timers.remove(&id)) {
            handle.abort();
        }
    }

    fn cancel_reconnect(&mut self) {
        let timer = self.reconnect_timer.take();
        self.cancel_timer(timer);
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&mut self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "connection state changed");
            let _ = self.hub.state.send(next);
        }
    }

    /// Derive the state from what is currently running.
    fn settle_state(&mut self) {
        let next = if self.connecting.is_some() {
            ConnectionState::Connecting
        } else if self.connected.is_some() {
            if self.readers.is_empty() {
                ConnectionState::Connected
            } else {
                ConnectionState::Reading
            }
        } else if self.scanning {
            ConnectionState::Scanning
        } else {
            return;
        };
        self.set_state(next);
    }

    fn raise(&self, error: BleError) {
        warn!(code = %error.code, details = ?error.details, "{}", error.message);
        let _ = self.hub.errors.send(error);
    }

    fn fail(&mut self, error: BleError) {
        self.raise(error);
        self.set_state(ConnectionState::Error);
    }

    fn bind(&mut self, address: MacAddress) {
        if self.bound == Some(address) {
            return;
        }
        info!(%address, "bound to scale");
        self.bound = Some(address);
        self.last_measurement_at = None;
        self.decrypt_failure_reported = false;
    }

    fn is_fresh(&self, address: MacAddress) -> bool {
        self.sightings.get(&address).is_some_and(Sighting::is_fresh)
    }

    fn visible(&self) -> Vec<VisiblePeripheral> {
        self.sightings
            .values()
            .filter(|sighting| sighting.is_fresh())
            .map(|sighting| sighting.peripheral.clone())
            .collect()
    }

    /// Once bound, only the bound scale is ever reported.
    fn reportable(&self, peripheral: &VisiblePeripheral) -> bool {
        match self.bound {
            Some(bound) => peripheral.address == bound,
            None => is_scale_candidate(peripheral),
        }
    }

    async fn refresh_power(&mut self) -> AdapterPower {
        let power = self.adapter.power_state().await;
        self.power.send_replace(power);
        power
    }

    // =========================================================================
    // RADIO SCAN
    // =========================================================================

    async fn ensure_scanning(&mut self) -> Result<(), AdapterError> {
        if self.scanning {
            return Ok(());
        }
        self.adapter
            .start_scanning(&self.options.service_filter, self.options.allow_duplicates)
            .await?;
        self.scanning = true;
        debug!(filter = ?self.options.service_filter, "radio scan started");
        Ok(())
    }

    async fn halt_scan(&mut self) {
        if !self.scanning {
            return;
        }
        self.scanning = false;
        if let Err(err) = self.adapter.stop_scanning().await {
            warn!(error = %err, "failed to stop radio scan");
        } else {
            debug!("radio scan stopped");
        }
    }

    fn scan_needed(&self) -> bool {
        !self.scan_waiters.is_empty()
            || self.pending_connect.is_some()
            || !self.discoveries.is_empty()
            || !self.readers.is_empty()
            || self.want_connection
    }

    /// Stop the radio once nothing depends on it.
    async fn release_scan(&mut self) {
        if self.scanning && !self.scan_needed() {
            self.halt_scan().await;
            if self.current_state() == ConnectionState::Scanning {
                self.set_state(ConnectionState::Idle);
            }
        }
    }

    async fn start_scanning(&mut self, timeout: Duration, reply: Reply<Result<ScanOutcome, BleError>>) {
        if self.refresh_power().await != AdapterPower::PoweredOn {
            debug!("adapter not powered on, scan not started");
            let _ = reply.send(Ok(ScanOutcome::AdapterNotReady));
            return;
        }
        if let Some(address) = self.connected {
            let _ = reply.send(Ok(ScanOutcome::Selected(address)));
            return;
        }

        self.want_connection |= self.options.auto_connect;
        self.cancel_reconnect();

        if let Err(err) = self.ensure_scanning().await {
            let error = to_ble_error(err.into(), Some(BleErrorCode::DeviceNotFound));
            let _ = reply.send(Err(error.clone()));
            self.fail(error);
            return;
        }

        self.scan_waiters.push(reply);
        if self.scan_deadline.is_none() {
            self.scan_deadline = Some(self.start_timer(timeout, TimerKind::ScanDeadline));
        }
        self.settle_state();
        self.evaluate_selection().await;
    }

    async fn scan_timed_out(&mut self, id: u64) {
        if self.scan_deadline != Some(id) {
            return;
        }
        self.scan_deadline = None;
        if self.scan_waiters.is_empty() {
            return;
        }

        let error = BleError::new(BleErrorCode::DeviceNotFound);
        for waiter in self.scan_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        if let Some(pending) = self.pending_connect.take() {
            self.cancel_timer(Some(pending.deadline));
            for waiter in pending.waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
        self.fail(error);
        self.schedule_reconnect();
        // Readers and discovery windows keep the radio until their own
        // deadlines; a wanted connection re-arms it from the reconnect timer.
        if self.readers.is_empty() && self.discoveries.is_empty() {
            self.halt_scan().await;
        }
    }

    async fn stop_scanning(&mut self) -> Result<(), BleError> {
        let deadline = self.scan_deadline.take();
        self.cancel_timer(deadline);

        let result = if self.scanning {
            self.scanning = false;
            self.adapter.stop_scanning().await.map_err(BleError::from)
        } else {
            Ok(())
        };

        let cancelled = BleError::with_details(BleErrorCode::DeviceNotFound, "scan cancelled");
        for waiter in self.scan_waiters.drain(..) {
            let _ = waiter.send(Err(cancelled.clone()));
        }
        if let Some(pending) = self.pending_connect.take() {
            self.cancel_timer(Some(pending.deadline));
            for waiter in pending.waiters {
                let _ = waiter.send(Err(cancelled.clone()));
            }
        }
        self.finish_discoveries();

        if self.connected.is_none() && self.connecting.is_none() {
            self.want_connection = false;
            self.set_state(ConnectionState::Idle);
        }
        result
    }

    // =========================================================================
    // DISCOVERY
    // =========================================================================

    async fn scan_for_devices(&mut self, timeout: Duration, reply: Reply<Vec<DiscoveredDevice>>) {
        if self.refresh_power().await != AdapterPower::PoweredOn {
            debug!("adapter not powered on, discovery returns nothing");
            let _ = reply.send(Vec::new());
            return;
        }
        if let Err(err) = self.ensure_scanning().await {
            warn!(error = %err, "discovery scan failed to start");
            let _ = reply.send(Vec::new());
            return;
        }

        let found = self
            .sightings
            .values()
            .filter(|sighting| sighting.is_fresh() && self.reportable(&sighting.peripheral))
            .map(|sighting| (sighting.peripheral.address, sighting.summary()))
            .collect();
        let id = self.start_timer(timeout, TimerKind::Discovery);
        self.discoveries.insert(id, DiscoverySession { found, reply });
        self.settle_state();
    }

    async fn discovery_finished(&mut self, id: u64) {
        if let Some(session) = self.discoveries.remove(&id) {
            debug!(found = session.found.len(), "discovery window closed");
            session.finish();
        }
        self.release_scan().await;
    }

    fn finish_discoveries(&mut self) {
        let sessions: Vec<(u64, DiscoverySession)> = self.discoveries.drain().collect();
        for (id, session) in sessions {
            self.cancel_timer(Some(id));
            session.finish();
        }
    }

    async fn advertisement(&mut self, advertisement: &Advertisement) {
        let address = advertisement.address;
        let previous = self.sightings.get(&address);
        let newly_seen = previous.map_or(true, |sighting| !sighting.is_fresh());

        let mut service_uuids = advertisement.service_uuids.clone();
        for uuid in advertisement.service_data.keys() {
            if !service_uuids.contains(uuid) {
                service_uuids.push(*uuid);
            }
        }
        let peripheral = VisiblePeripheral {
            address,
            // Names often arrive only in scan responses.
            name: advertisement
                .local_name
                .clone()
                .or_else(|| previous.and_then(|sighting| sighting.peripheral.name.clone())),
            service_uuids,
        };
        let sighting = Sighting {
            peripheral,
            rssi: advertisement.rssi,
            seen_at: Instant::now(),
        };

        if self.reportable(&sighting.peripheral) {
            let summary = sighting.summary();
            for session in self.discoveries.values_mut() {
                session.found.insert(address, summary.clone());
            }
            if newly_seen {
                debug!(%address, name = ?summary.name, rssi = ?summary.rssi, "scale discovered");
                let _ = self.hub.discovered.send(summary);
            }
        }

        if self.sightings.len() >= MAX_SIGHTINGS {
            self.sightings.retain(|_, sighting| sighting.is_fresh());
        }
        self.sightings.insert(address, sighting);

        self.evaluate_selection().await;

        if self.bound == Some(address) {
            self.decode_advertisement(advertisement);
        }
        self.release_scan().await;
    }

    /// Run the device filter and act on its decision.
    async fn evaluate_selection(&mut self) {
        let idle = self.connected.is_none() && self.connecting.is_none();
        let auto_connect = self.want_connection && idle && self.reconnect_timer.is_none();
        if self.scan_waiters.is_empty() && self.pending_connect.is_none() && !auto_connect {
            return;
        }

        let Selection::Select(address) = select_device(&self.visible(), self.bound) else {
            return;
        };
        self.bind(address);

        let deadline = self.scan_deadline.take();
        self.cancel_timer(deadline);
        for waiter in self.scan_waiters.drain(..) {
            let _ = waiter.send(Ok(ScanOutcome::Selected(address)));
        }

        if let Some(pending) = self.pending_connect.take() {
            self.cancel_timer(Some(pending.deadline));
            self.begin_connect(address, pending.waiters);
        } else if auto_connect {
            self.begin_connect(address, Vec::new());
        } else if self.connecting.is_some() {
            trace!(%address, "connection already in flight, discovery ignored");
        }
    }

    // =========================================================================
    // CONNECTION
    // =========================================================================

    fn begin_connect(&mut self, address: MacAddress, waiters: Vec<Reply<Result<(), BleError>>>) {
        if let Some(attempt) = &mut self.connecting {
            trace!(%address, joined = waiters.len(), "joining in-flight connection attempt");
            attempt.waiters.extend(waiters);
            return;
        }
        if self.connected == Some(address) {
            for waiter in waiters {
                let _ = waiter.send(Ok(()));
            }
            return;
        }

        let id = self.next_id();
        let adapter = Arc::clone(&self.adapter);
        let internal = self.internal.clone();
        let connect_timeout = self.options.connect_timeout;
        let retry = self.options.retry;
        info!(%address, "connecting");

        let task = tokio::spawn(async move {
            let result = establish(adapter.as_ref(), address, connect_timeout, &retry).await;
            let _ = internal.send(Internal::ConnectFinished {
                attempt: id,
                address,
                result,
            });
        });

        self.connecting = Some(ConnectAttempt {
            id,
            address,
            task,
            waiters,
        });
        self.set_state(ConnectionState::Connecting);
    }

    async fn connect_finished(
        &mut self,
        attempt: u64,
        address: MacAddress,
        result: Result<Vec<Uuid>, AdapterError>,
    ) {
        if self.connecting.as_ref().map(|current| current.id) != Some(attempt) {
            trace!(attempt, "ignoring result of an abandoned connection attempt");
            return;
        }
        let Some(current) = self.connecting.take() else {
            return;
        };

        match result {
            Ok(subscribed) => {
                if subscribed.is_empty() {
                    debug!(%address, "no measurement characteristics exposed, using advertisements only");
                }
                info!(%address, characteristics = subscribed.len(), "connected");
                self.connected = Some(address);
                self.gatt.reset();
                for waiter in current.waiters {
                    let _ = waiter.send(Ok(()));
                }
                self.settle_state();
            }
            Err(err) => {
                let error = to_ble_error(err.into(), Some(BleErrorCode::ConnectionTimeout));
                for waiter in current.waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
                self.fail(error);
                self.schedule_reconnect();
                self.release_scan().await;
            }
        }
    }

    async fn connect(&mut self, address: MacAddress, key: Option<BindKey>, reply: Reply<Result<(), BleError>>) {
        if let Some(attempt) = &self.connecting {
            if attempt.address != address {
                let _ = reply.send(Err(BleError::with_details(
                    BleErrorCode::ConnectionTimeout,
                    format!("a connection to {} is already in progress", attempt.address),
                )));
                return;
            }
        }

        if let Some(key) = key {
            self.key = Some(key);
            self.decrypt_failure_reported = false;
        }
        self.bind(address);
        self.want_connection = true;
        self.cancel_reconnect();

        if self.connected == Some(address) {
            let _ = reply.send(Ok(()));
            return;
        }
        if let Some(other) = self.connected.take() {
            info!(%other, "leaving previously connected scale");
            if let Err(err) = self.adapter.disconnect(other).await {
                warn!(%other, error = %err, "disconnect failed");
            }
        }
        if self.connecting.is_some() || self.is_fresh(address) {
            self.begin_connect(address, vec![reply]);
            return;
        }

        // Not seen recently: scan for it first.
        if let Some(pending) = &mut self.pending_connect {
            if pending.address == address {
                pending.waiters.push(reply);
                return;
            }
        }
        if self.refresh_power().await != AdapterPower::PoweredOn {
            let _ = reply.send(Err(BleError::new(BleErrorCode::BluetoothOff)));
            return;
        }
        if let Err(err) = self.ensure_scanning().await {
            let _ = reply.send(Err(to_ble_error(err.into(), Some(BleErrorCode::DeviceNotFound))));
            return;
        }
        if let Some(stale) = self.pending_connect.take() {
            self.cancel_timer(Some(stale.deadline));
            let superseded = BleError::with_details(
                BleErrorCode::DeviceNotFound,
                format!("superseded by a connection to {address}"),
            );
            for waiter in stale.waiters {
                let _ = waiter.send(Err(superseded.clone()));
            }
        }
        let deadline = self.start_timer(self.options.scan_timeout, TimerKind::ConnectDeadline);
        self.pending_connect = Some(PendingConnect {
            address,
            deadline,
            waiters: vec![reply],
        });
        self.set_state(ConnectionState::Scanning);
    }

    async fn pending_connect_timed_out(&mut self, id: u64) {
        if self.pending_connect.as_ref().map(|pending| pending.deadline) != Some(id) {
            return;
        }
        let Some(pending) = self.pending_connect.take() else {
            return;
        };
        let error = BleError::new(BleErrorCode::DeviceNotFound);
        for waiter in pending.waiters {
            let _ = waiter.send(Err(error.clone()));
        }
        self.fail(error);
        self.schedule_reconnect();
        self.release_scan().await;
    }

    async fn disconnect(&mut self) -> Result<(), BleError> {
        self.cancel_reconnect();
        self.want_connection = false;

        let cancelled = BleError::with_details(BleErrorCode::ConnectionTimeout, "cancelled by disconnect");
        if let Some(attempt) = self.connecting.take() {
            attempt.task.abort();
            for waiter in attempt.waiters {
                let _ = waiter.send(Err(cancelled.clone()));
            }
            if let Err(err) = self.adapter.disconnect(attempt.address).await {
                debug!(address = %attempt.address, error = %err, "cleanup after cancelled connect failed");
            }
        }
        if let Some(pending) = self.pending_connect.take() {
            self.cancel_timer(Some(pending.deadline));
            for waiter in pending.waiters {
                let _ = waiter.send(Err(cancelled.clone()));
            }
        }

        let result = match self.connected.take() {
            Some(address) => {
                info!(%address, "disconnecting");
                self.adapter.disconnect(address).await.map_err(BleError::from)
            }
            None => Ok(()),
        };
        self.gatt.reset();
        self.release_scan().await;
        self.set_state(ConnectionState::Disconnected);
        result
    }

    async fn link_lost(&mut self, address: MacAddress) {
        if self.connected != Some(address) {
            trace!(%address, "disconnect event for a peripheral we are not connected to");
            return;
        }
        info!(%address, "link lost");
        self.connected = None;
        self.gatt.reset();
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect();
        self.release_scan().await;
    }

    fn schedule_reconnect(&mut self) {
        if !self.options.auto_reconnect || !self.want_connection {
            self.want_connection = false;
            return;
        }
        self.cancel_reconnect();
        let delay = self.options.reconnect_interval;
        self.reconnect_timer = Some(self.start_timer(delay, TimerKind::Reconnect));
        info!(?delay, "reconnect scheduled");
    }

    async fn reconnect(&mut self) {
        if !self.want_connection || self.connected.is_some() || self.connecting.is_some() {
            return;
        }
        if self.refresh_power().await != AdapterPower::PoweredOn {
            debug!("adapter not powered on, waiting for power before reconnecting");
            return;
        }
        if let Err(err) = self.ensure_scanning().await {
            warn!(error = %err, "reconnect scan failed to start");
            self.schedule_reconnect();
            return;
        }
        info!(bound = ?self.bound, "reconnect scan");
        self.set_state(ConnectionState::Scanning);
        self.evaluate_selection().await;
    }

    fn is_device_available(&self) -> bool {
        match self.bound {
            Some(bound) => self.connected == Some(bound) || self.is_fresh(bound),
            None => matches!(select_device(&self.visible(), None), Selection::Select(_)),
        }
    }

    // =========================================================================
    // POWER
    // =========================================================================

    async fn power_changed(&mut self, power: AdapterPower) {
        let previous = self.power.send_replace(power);
        if previous == power {
            return;
        }
        info!(?previous, ?power, "adapter power changed");

        match power {
            AdapterPower::PoweredOff => self.power_lost(),
            AdapterPower::PoweredOn => {
                if self.want_connection && self.connected.is_none() {
                    self.reconnect().await;
                } else if self.scan_needed() {
                    if let Err(err) = self.ensure_scanning().await {
                        warn!(error = %err, "could not resume scan after power on");
                    }
                    self.settle_state();
                }
            }
            AdapterPower::Unknown => self.backend_lost(),
        }
    }

    /// The backend went away without reporting power, e.g. a restarted
    /// helper process. Nothing it held survives, so forget the radio scan
    /// and the link and let the next power-on rebuild them.
    fn backend_lost(&mut self) {
        self.scanning = false;
        self.cancel_reconnect();
        if let Some(address) = self.connected.take() {
            warn!(%address, "adapter state lost, treating link as dropped");
            self.gatt.reset();
            if !self.options.auto_reconnect {
                self.want_connection = false;
            }
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn power_lost(&mut self) {
        let active = self.scanning
            || self.connecting.is_some()
            || self.connected.is_some()
            || self.pending_connect.is_some()
            || !self.scan_waiters.is_empty();

        let error = BleError::new(BleErrorCode::BluetoothOff);
        self.scanning = false;
        self.cancel_reconnect();

        if let Some(attempt) = self.connecting.take() {
            attempt.task.abort();
            for waiter in attempt.waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
        if let Some(pending) = self.pending_connect.take() {
            self.cancel_timer(Some(pending.deadline));
            for waiter in pending.waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
        let deadline = self.scan_deadline.take();
        self.cancel_timer(deadline);
        for waiter in self.scan_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        self.finish_discoveries();
        self.connected = None;
        self.gatt.reset();

        if active {
            self.fail(error);
        }
    }

    // =========================================================================
    // MEASUREMENTS
    // =========================================================================

    async fn read_measurement(&mut self, timeout: Duration, reply: Reply<Result<RawMeasurement, BleError>>) {
        let id = self.start_timer(timeout, TimerKind::ReadDeadline);
        self.readers.insert(id, reply);

        if self.connected.is_none()
            && !self.scanning
            && self.refresh_power().await == AdapterPower::PoweredOn
        {
            if let Err(err) = self.ensure_scanning().await {
                warn!(error = %err, "could not start scan for reading");
            }
        }
        self.settle_state();
    }

    async fn read_timed_out(&mut self, id: u64) {
        let Some(reply) = self.readers.remove(&id) else {
            return;
        };
        let error = BleError::with_details(
            BleErrorCode::ReadFailed,
            "no stable measurement arrived before the read timeout",
        );
        let _ = reply.send(Err(error.clone()));
        self.raise(error);

        if self.readers.is_empty() && self.current_state() == ConnectionState::Reading {
            self.set_state(ConnectionState::Connected);
        }
        self.release_scan().await;
    }

    fn decode_advertisement(&mut self, advertisement: &Advertisement) {
        let address = advertisement.address;

        if let Some(data) = advertisement.service_data.get(&MIBEACON_SERVICE) {
            if let Some((weight_kg, impedance_ohm)) = self.decode_mibeacon(address, data) {
                self.deliver(address, weight_kg, impedance_ohm, MeasurementSource::Advertisement);
            }
            return;
        }

        for service in [BODY_COMPOSITION_SERVICE, WEIGHT_SCALE_SERVICE] {
            if let Some(reading) = advertisement
                .service_data
                .get(&service)
                .and_then(|data| parse_body_composition(data))
            {
                self.deliver(
                    address,
                    reading.weight_kg,
                    reading.impedance_ohm,
                    MeasurementSource::Advertisement,
                );
                return;
            }
        }
    }

    fn decode_mibeacon(&mut self, address: MacAddress, data: &[u8]) -> Option<(f64, Option<u16>)> {
        let Some(frame) = decode_frame(data) else {
            trace!(%address, len = data.len(), "not a MiBeacon frame");
            return None;
        };
        if !frame.frame_control.has_object {
            return None;
        }

        let plaintext = if frame.frame_control.is_encrypted {
            let Some(key) = self.key.clone() else {
                self.report_decrypt_failure("encrypted advertisement but no bind key is configured");
                return None;
            };
            match decrypt_payload(&key, &frame, frame.address.unwrap_or(address)) {
                Ok(plaintext) => plaintext,
                Err(ScaleError::DecryptionFailed) => {
                    self.report_decrypt_failure("integrity check failed under the configured bind key");
                    return None;
                }
                Err(err) => {
                    debug!(%address, error = %err, "dropping encrypted frame");
                    return None;
                }
            }
        } else {
            frame.payload?
        };

        let objects = extract_objects(&plaintext);
        let Some(weight) = objects.weight else {
            trace!(%address, counter = frame.frame_counter, "frame carries no stable weight");
            return None;
        };
        let impedance_ohm = objects.impedance.and_then(|impedance| impedance.usable_ohm());
        Some((weight.weight_kg, impedance_ohm))
    }

    fn report_decrypt_failure(&mut self, details: &str) {
        if self.decrypt_failure_reported {
            trace!(details, "decryption still failing");
            return;
        }
        self.decrypt_failure_reported = true;
        self.fail(BleError::with_details(BleErrorCode::DecryptionFailed, details));
    }

    fn deliver(
        &mut self,
        address: MacAddress,
        weight_kg: f64,
        impedance_ohm: Option<u16>,
        source: MeasurementSource,
    ) {
        let now = Instant::now();
        let duplicate = self
            .last_measurement_at
            .is_some_and(|last| now.duration_since(last) < self.options.dedup_window);
        if duplicate {
            trace!(%address, weight_kg, "duplicate measurement suppressed");
            return;
        }
        self.last_measurement_at = Some(now);

        let measurement = RawMeasurement {
            address,
            weight_kg,
            impedance_ohm,
            heart_rate_bpm: None,
            timestamp: Utc::now(),
            source,
        };
        info!(%address, weight_kg, ?impedance_ohm, ?source, "measurement received");
        let _ = self.hub.measurements.send(measurement.clone());

        let readers: Vec<_> = self.readers.drain().collect();
        for (id, reply) in readers {
            self.cancel_timer(Some(id));
            let _ = reply.send(Ok(measurement.clone()));
        }
        if self.current_state() == ConnectionState::Reading {
            self.set_state(ConnectionState::Connected);
        }
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    async fn teardown(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
        if let Some(attempt) = self.connecting.take() {
            attempt.task.abort();
        }
        self.halt_scan().await;
        if let Some(address) = self.connected.take() {
            if let Err(err) = self.adapter.disconnect(address).await {
                warn!(%address, error = %err, "disconnect during shutdown failed");
            }
        }
        self.set_state(ConnectionState::Idle);
        debug!("connection manager stopped");
    }
}
