//! BlueZ backend.
//!
//! Talks to `bluetoothd` over D-Bus through `bluer`. Discovery, power
//! changes, link loss and notifications are each pumped by a small task
//! into the shared event channel.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{
    AdapterProperty, Address, DeviceEvent, DeviceProperty, DiscoveryFilter, DiscoveryTransport,
    ErrorKind, Session,
};
use futures::{pin_mut, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{AdapterError, AdapterEvent, AdapterResult, Advertisement, BluetoothAdapter, EVENT_CHANNEL_CAPACITY};
use crate::types::{AdapterPower, MacAddress};

impl From<bluer::Error> for AdapterError {
    fn from(err: bluer::Error) -> Self {
        match err.kind {
            ErrorKind::NotReady => Self::PoweredOff,
            ErrorKind::NotAvailable => Self::NotAvailable,
            _ => Self::Transport(err.to_string()),
        }
    }
}

impl From<Address> for MacAddress {
    fn from(address: Address) -> Self {
        Self(address.0)
    }
}

impl From<MacAddress> for Address {
    fn from(address: MacAddress) -> Self {
        Self(address.0)
    }
}

const fn power_from(powered: bool) -> AdapterPower {
    if powered {
        AdapterPower::PoweredOn
    } else {
        AdapterPower::PoweredOff
    }
}

#[derive(Default)]
struct Tasks {
    discovery: Option<JoinHandle<()>>,
    links: HashMap<MacAddress, Vec<JoinHandle<()>>>,
}

/// A [`BluetoothAdapter`] driving the default BlueZ adapter.
pub struct BluezAdapter {
    _session: Session,
    adapter: bluer::Adapter,
    events: mpsc::Sender<AdapterEvent>,
    power: watch::Receiver<AdapterPower>,
    tasks: Mutex<Tasks>,
    power_task: JoinHandle<()>,
}

impl BluezAdapter {
    /// Open the default adapter and start watching its power state.
    ///
    /// # Errors
    ///
    /// Returns an error if `bluetoothd` is unreachable or no adapter exists.
    pub async fn new() -> AdapterResult<(Self, mpsc::Receiver<AdapterEvent>)> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!(adapter = adapter.name(), "using BlueZ adapter");

        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let initial = power_from(adapter.is_powered().await?);
        let (power_tx, power) = watch::channel(initial);

        let adapter_events = adapter.events().await?;
        let power_events = events.clone();
        let power_task = tokio::spawn(async move {
            pin_mut!(adapter_events);
            while let Some(event) = adapter_events.next().await {
                if let bluer::AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                    let state = power_from(powered);
                    info!(?state, "adapter power changed");
                    power_tx.send_replace(state);
                    if power_events.send(AdapterEvent::PowerChanged(state)).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok((
            Self {
                _session: session,
                adapter,
                events,
                power,
                tasks: Mutex::new(Tasks::default()),
                power_task,
            },
            rx,
        ))
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn find_characteristic(
        &self,
        address: MacAddress,
        uuid: Uuid,
    ) -> AdapterResult<Option<Characteristic>> {
        let device = self.adapter.device(address.into())?;
        for service in device.services().await? {
            for characteristic in service.characteristics().await? {
                if characteristic.uuid().await? == uuid {
                    return Ok(Some(characteristic));
                }
            }
        }
        Ok(None)
    }

    fn abort_link_tasks(&self, address: MacAddress) {
        if let Some(handles) = self.tasks().links.remove(&address) {
            for handle in handles {
                handle.abort();
            }
        }
    }
}

impl Drop for BluezAdapter {
    fn drop(&mut self) {
        self.power_task.abort();
        let mut tasks = self.tasks();
        if let Some(discovery) = tasks.discovery.take() {
            discovery.abort();
        }
        for handle in tasks.links.drain().flat_map(|(_, handles)| handles) {
            handle.abort();
        }
    }
}

async fn read_advertisement(adapter: &bluer::Adapter, address: Address) -> bluer::Result<Advertisement> {
    let device = adapter.device(address)?;
    Ok(Advertisement {
        address: address.into(),
        local_name: device.name().await?,
        rssi: device.rssi().await?,
        service_uuids: device
            .uuids()
            .await?
            .unwrap_or_default()
            .into_iter()
            .collect(),
        service_data: device.service_data().await?.unwrap_or_default(),
        manufacturer_data: device.manufacturer_data().await?.unwrap_or_default(),
    })
}

#[async_trait]
impl BluetoothAdapter for BluezAdapter {
    async fn power_state(&self) -> AdapterPower {
        *self.power.borrow()
    }

    async fn start_scanning(&self, services: &[Uuid], allow_duplicates: bool) -> AdapterResult<()> {
        if *self.power.borrow() != AdapterPower::PoweredOn {
            return Err(AdapterError::PoweredOff);
        }

        self.adapter
            .set_discovery_filter(DiscoveryFilter {
                uuids: services.iter().copied().collect::<HashSet<_>>(),
                duplicate_data: allow_duplicates,
                transport: DiscoveryTransport::Le,
                ..DiscoveryFilter::default()
            })
            .await?;

        let discovery = self.adapter.discover_devices_with_changes().await?;
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            pin_mut!(discovery);
            while let Some(event) = discovery.next().await {
                let bluer::AdapterEvent::DeviceAdded(address) = event else {
                    continue;
                };
                match read_advertisement(&adapter, address).await {
                    Ok(advertisement) => {
                        if events.send(AdapterEvent::Advertisement(advertisement)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => trace!(%address, error = %err, "could not read advertisement"),
                }
            }
            debug!("discovery stream ended");
        });

        if let Some(previous) = self.tasks().discovery.replace(handle) {
            previous.abort();
        }
        debug!(?services, allow_duplicates, "LE discovery started");
        Ok(())
    }

    async fn stop_scanning(&self) -> AdapterResult<()> {
        // Dropping the discovery stream ends the BlueZ discovery session.
        if let Some(handle) = self.tasks().discovery.take() {
            handle.abort();
            debug!("LE discovery stopped");
        }
        Ok(())
    }

    async fn connect(&self, address: MacAddress) -> AdapterResult<()> {
        let device = self.adapter.device(address.into())?;
        if !device.is_connected().await? {
            device.connect().await?;
        }

        let device_events = device.events().await?;
        let events = self.events.clone();
        let watcher = tokio::spawn(async move {
            pin_mut!(device_events);
            while let Some(event) = device_events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    let _ = events.send(AdapterEvent::Disconnected(address)).await;
                    break;
                }
            }
        });

        self.abort_link_tasks(address);
        self.tasks().links.entry(address).or_default().push(watcher);
        Ok(())
    }

    async fn disconnect(&self, address: MacAddress) -> AdapterResult<()> {
        self.abort_link_tasks(address);
        let device = self.adapter.device(address.into())?;
        if device.is_connected().await? {
            device.disconnect().await?;
        }
        Ok(())
    }

    async fn discover_services(&self, address: MacAddress) -> AdapterResult<Vec<Uuid>> {
        let device = self.adapter.device(address.into())?;
        let mut notifiable = Vec::new();
        for service in device.services().await? {
            for characteristic in service.characteristics().await? {
                let flags = characteristic.flags().await?;
                if flags.notify || flags.indicate {
                    notifiable.push(characteristic.uuid().await?);
                }
            }
        }
        Ok(notifiable)
    }

    async fn subscribe(&self, address: MacAddress, characteristic: Uuid) -> AdapterResult<()> {
        let Some(remote) = self.find_characteristic(address, characteristic).await? else {
            return Err(AdapterError::Transport(format!(
                "characteristic {characteristic} not found on {address}"
            )));
        };

        let notifications = remote.notify().await?;
        let events = self.events.clone();
        let pump = tokio::spawn(async move {
            pin_mut!(notifications);
            while let Some(value) = notifications.next().await {
                let event = AdapterEvent::Notification {
                    address,
                    characteristic,
                    value,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            warn!(%address, %characteristic, "notification stream ended");
        });

        self.tasks().links.entry(address).or_default().push(pump);
        Ok(())
    }
}
