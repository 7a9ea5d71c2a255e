//! Helper-process Bluetooth backend.
//!
//! Some platforms expose BLE only through a native helper. The helper runs
//! as a child process and speaks line-delimited JSON:
//!
//! - requests on stdin: `{"id": 7, "cmd": "connect", "address": "AA:BB:..."}`
//! - messages on stdout: `{"type": "advertisement", ...}`,
//!   `{"type": "response", "id": 7, "ok": true}`, and so on
//!
//! The child is supervised: when it exits, pending requests fail, the power
//! state drops to unknown, and it is restarted with exponential backoff.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{AdapterError, AdapterEvent, AdapterResult, Advertisement, BluetoothAdapter, EVENT_CHANNEL_CAPACITY};
use crate::characteristic::uuid16;
use crate::config::HelperConfig;
use crate::retry::{calculate_delay, RetryConfig};
use crate::types::{AdapterPower, MacAddress};

/// How long a request may wait for its response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// A request written to the helper's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct HelperRequest {
    id: u64,
    #[serde(flatten)]
    command: HelperCommand,
}

/// Commands understood by the helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum HelperCommand {
    /// Start an LE scan.
    StartScan {
        /// Service UUID filter.
        services: Vec<String>,
        /// Report repeated advertisements.
        allow_duplicates: bool,
    },
    /// Stop the LE scan.
    StopScan,
    /// Connect to a peripheral.
    Connect {
        /// Peripheral address.
        address: String,
    },
    /// Disconnect from a peripheral.
    Disconnect {
        /// Peripheral address.
        address: String,
    },
    /// Discover notifiable characteristics.
    DiscoverServices {
        /// Peripheral address.
        address: String,
    },
    /// Enable notifications.
    Subscribe {
        /// Peripheral address.
        address: String,
        /// Characteristic UUID.
        characteristic: String,
    },
    /// Ask for the current power state.
    State,
}

/// Messages read from the helper's stdout.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperMessage {
    /// Radio power state.
    State {
        /// `poweredOn`, `poweredOff`, or anything else for unknown.
        state: String,
    },
    /// One advertisement.
    Advertisement {
        /// Advertiser address.
        address: String,
        /// Local name.
        #[serde(default, alias = "localName")]
        name: Option<String>,
        /// Signal strength.
        #[serde(default)]
        rssi: Option<i16>,
        /// Advertised services.
        #[serde(default, alias = "serviceUuids")]
        service_uuids: Vec<String>,
        /// Service data as hex strings keyed by UUID.
        #[serde(default, alias = "serviceData")]
        service_data: HashMap<String, String>,
        /// Manufacturer data as hex strings keyed by company id.
        #[serde(default, alias = "manufacturerData")]
        manufacturer_data: HashMap<String, String>,
    },
    /// A characteristic notification.
    Notification {
        /// Peripheral address.
        address: String,
        /// Characteristic UUID.
        characteristic: String,
        /// Value as hex.
        value: String,
    },
    /// A peripheral disconnected.
    Disconnected {
        /// Peripheral address.
        address: String,
    },
    /// Reply to a request.
    Response {
        /// Request id.
        id: u64,
        /// Whether the command succeeded.
        ok: bool,
        /// Failure description.
        #[serde(default)]
        error: Option<String>,
        /// Command-specific result.
        #[serde(default)]
        result: serde_json::Value,
    },
    /// Informational status line.
    Status {
        /// Text.
        message: String,
    },
    /// Debug line.
    Debug {
        /// Text.
        message: String,
    },
    /// Unsolicited error.
    Error {
        /// Text.
        message: String,
    },
}

type PendingMap = HashMap<u64, oneshot::Sender<AdapterResult<serde_json::Value>>>;

struct HelperShared {
    next_id: AtomicU64,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pending: Mutex<PendingMap>,
    power: watch::Sender<AdapterPower>,
    events: mpsc::Sender<AdapterEvent>,
    request_timeout: Duration,
}

impl HelperShared {
    fn pending(&self) -> std::sync::MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail_pending(&self, reason: &str) {
        for (_, reply) in self.pending().drain() {
            let _ = reply.send(Err(AdapterError::Helper(reason.to_string())));
        }
    }

    async fn set_power(&self, power: AdapterPower) {
        let changed = self.power.send_if_modified(|current| {
            let changed = *current != power;
            *current = power;
            changed
        });
        if changed {
            // Power changes are never dropped, even with the channel full.
            let _ = self.events.send(AdapterEvent::PowerChanged(power)).await;
        }
    }

    async fn dispatch(&self, message: HelperMessage) {
        match message {
            HelperMessage::State { state } => self.set_power(parse_power(&state)).await,
            HelperMessage::Response {
                id,
                ok,
                error,
                result,
            } => {
                let Some(reply) = self.pending().remove(&id) else {
                    trace!(id, "response for unknown or expired request");
                    return;
                };
                let outcome = if ok {
                    Ok(result)
                } else {
                    Err(AdapterError::Helper(
                        error.unwrap_or_else(|| "request failed".to_string()),
                    ))
                };
                let _ = reply.send(outcome);
            }
            HelperMessage::Status { message } => info!(target: "helper", "{message}"),
            HelperMessage::Debug { message } => debug!(target: "helper", "{message}"),
            HelperMessage::Error { message } => warn!(target: "helper", "{message}"),
            other => match convert_event(other) {
                Some(event) => {
                    let _ = self.events.send(event).await;
                }
                None => debug!("dropping malformed helper event"),
            },
        }
    }
}

/// A [`BluetoothAdapter`] backed by a supervised helper process.
pub struct HelperAdapter {
    shared: Arc<HelperShared>,
    shutdown: watch::Sender<bool>,
}

impl HelperAdapter {
    /// Spawn the helper supervisor.
    ///
    /// Returns immediately; the power state stays unknown until the helper
    /// reports one.
    #[must_use]
    pub fn spawn(config: HelperConfig, retry: RetryConfig) -> (Self, mpsc::Receiver<AdapterEvent>) {
        Self::spawn_with_timeout(config, retry, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Spawn with a custom per-request timeout.
    #[must_use]
    pub fn spawn_with_timeout(
        config: HelperConfig,
        retry: RetryConfig,
        request_timeout: Duration,
    ) -> (Self, mpsc::Receiver<AdapterEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (power, _) = watch::channel(AdapterPower::Unknown);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(HelperShared {
            next_id: AtomicU64::new(1),
            stdin: tokio::sync::Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            power,
            events,
            request_timeout,
        });

        tokio::spawn(supervise(Arc::clone(&shared), config, retry, shutdown_rx));

        (Self { shared, shutdown }, rx)
    }

    /// Stop the helper process and the supervisor.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    async fn request(&self, command: HelperCommand) -> AdapterResult<serde_json::Value> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&HelperRequest { id, command })
            .map_err(|e| AdapterError::Helper(e.to_string()))?;
        line.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending().insert(id, reply_tx);

        let written = {
            let mut stdin = self.shared.stdin.lock().await;
            match stdin.as_mut() {
                Some(stdin) => stdin.write_all(line.as_bytes()).await.map_err(|e| e.to_string()),
                None => Err("helper process is not running".to_string()),
            }
        };
        if let Err(reason) = written {
            self.shared.pending().remove(&id);
            return Err(AdapterError::Helper(reason));
        }

        match tokio::time::timeout(self.shared.request_timeout, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AdapterError::Helper("helper dropped the request".to_string())),
            Err(_) => {
                self.shared.pending().remove(&id);
                Err(AdapterError::Timeout(self.shared.request_timeout))
            }
        }
    }
}

impl Drop for HelperAdapter {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

#[async_trait]
impl BluetoothAdapter for HelperAdapter {
    async fn power_state(&self) -> AdapterPower {
        *self.shared.power.borrow()
    }

    async fn start_scanning(&self, services: &[Uuid], allow_duplicates: bool) -> AdapterResult<()> {
        self.request(HelperCommand::StartScan {
            services: services.iter().map(ToString::to_string).collect(),
            allow_duplicates,
        })
        .await
        .map(drop)
    }

    async fn stop_scanning(&self) -> AdapterResult<()> {
        self.request(HelperCommand::StopScan).await.map(drop)
    }

    async fn connect(&self, address: MacAddress) -> AdapterResult<()> {
        self.request(HelperCommand::Connect {
            address: address.to_string(),
        })
        .await
        .map(drop)
    }

    async fn disconnect(&self, address: MacAddress) -> AdapterResult<()> {
        self.request(HelperCommand::Disconnect {
            address: address.to_string(),
        })
        .await
        .map(drop)
    }

    async fn discover_services(&self, address: MacAddress) -> AdapterResult<Vec<Uuid>> {
        let result = self
            .request(HelperCommand::DiscoverServices {
                address: address.to_string(),
            })
            .await?;
        let listed = result
            .get("characteristics")
            .and_then(serde_json::Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(listed
            .iter()
            .filter_map(serde_json::Value::as_str)
            .filter_map(parse_uuid)
            .collect())
    }

    async fn subscribe(&self, address: MacAddress, characteristic: Uuid) -> AdapterResult<()> {
        self.request(HelperCommand::Subscribe {
            address: address.to_string(),
            characteristic: characteristic.to_string(),
        })
        .await
        .map(drop)
    }
}

async fn supervise(
    shared: Arc<HelperShared>,
    config: HelperConfig,
    retry: RetryConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures = 0u32;

    while !*shutdown.borrow() {
        match spawn_child(&config) {
            Ok(mut child) => {
                info!(program = %config.program, pid = ?child.id(), "helper process started");
                *shared.stdin.lock().await = child.stdin.take();
                if let Some(stderr) = child.stderr.take() {
                    tokio::spawn(async move {
                        let mut lines = BufReader::new(stderr).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            debug!(target: "helper", "stderr: {line}");
                        }
                    });
                }

                let healthy = run_child(&shared, &mut child, &mut shutdown).await;
                if healthy {
                    failures = 0;
                }

                *shared.stdin.lock().await = None;
                let _ = child.kill().await;
                shared.fail_pending("helper process exited");
                shared.set_power(AdapterPower::Unknown).await;
            }
            Err(err) => warn!(program = %config.program, error = %err, "failed to start helper process"),
        }

        if *shutdown.borrow() {
            break;
        }

        failures += 1;
        let delay = calculate_delay(failures, &retry);
        warn!(attempt = failures, delay_ms = delay.as_millis(), "restarting helper process");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
    }

    debug!("helper supervisor stopped");
}

fn spawn_child(config: &HelperConfig) -> std::io::Result<Child> {
    Command::new(&config.program)
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// Pump stdout until the child exits or shutdown is requested.
///
/// Returns `true` if at least one message was received.
async fn run_child(
    shared: &HelperShared,
    child: &mut Child,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let Some(stdout) = child.stdout.take() else {
        return false;
    };
    let mut lines = BufReader::new(stdout).lines();
    let mut healthy = false;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<HelperMessage>(&line) {
                        Ok(message) => {
                            healthy = true;
                            shared.dispatch(message).await;
                        }
                        Err(err) => debug!(error = %err, line = %line, "unparseable helper output"),
                    }
                }
                Ok(None) => {
                    match child.wait().await {
                        Ok(status) => warn!(%status, "helper process exited"),
                        Err(err) => warn!(error = %err, "helper process exited"),
                    }
                    return healthy;
                }
                Err(err) => {
                    warn!(error = %err, "failed reading helper output");
                    return healthy;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return healthy;
                }
            }
        }
    }
}

fn parse_power(state: &str) -> AdapterPower {
    let normalized: String = state
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_lowercase();
    match normalized.as_str() {
        "poweredon" | "on" => AdapterPower::PoweredOn,
        "poweredoff" | "off" | "unauthorized" | "unsupported" => AdapterPower::PoweredOff,
        _ => AdapterPower::Unknown,
    }
}

/// Parse a UUID given in 16-bit short form (`fe95`, `0xFE95`) or in full.
fn parse_uuid(text: &str) -> Option<Uuid> {
    let text = text.trim();
    let short = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if short.len() == 4 {
        return u16::from_str_radix(short, 16).ok().map(uuid16);
    }
    Uuid::parse_str(text).ok()
}

fn convert_event(message: HelperMessage) -> Option<AdapterEvent> {
    match message {
        HelperMessage::Advertisement {
            address,
            name,
            rssi,
            service_uuids,
            service_data,
            manufacturer_data,
        } => Some(AdapterEvent::Advertisement(Advertisement {
            address: address.parse().ok()?,
            local_name: name.filter(|n| !n.is_empty()),
            rssi,
            service_uuids: service_uuids.iter().filter_map(|u| parse_uuid(u)).collect(),
            service_data: service_data
                .iter()
                .filter_map(|(uuid, data)| Some((parse_uuid(uuid)?, hex::decode(data).ok()?)))
                .collect(),
            manufacturer_data: manufacturer_data
                .iter()
                .filter_map(|(id, data)| {
                    let id = id.trim_start_matches("0x");
                    let company = u16::from_str_radix(id, 16)
                        .ok()
                        .or_else(|| id.parse().ok())?;
                    Some((company, hex::decode(data).ok()?))
                })
                .collect(),
        })),
        HelperMessage::Notification {
            address,
            characteristic,
            value,
        } => Some(AdapterEvent::Notification {
            address: address.parse().ok()?,
            characteristic: parse_uuid(&characteristic)?,
            value: hex::decode(value).ok()?,
        }),
        HelperMessage::Disconnected { address } => {
            Some(AdapterEvent::Disconnected(address.parse().ok()?))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characteristic::{MIBEACON_SERVICE, WEIGHT_MEASUREMENT};

    #[test]
    fn test_request_serialization() {
        let request = HelperRequest {
            id: 3,
            command: HelperCommand::Connect {
                address: "AA:BB:CC:DD:EE:FF".into(),
            },
        };
        let json: serde_json::Value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": 3, "cmd": "connect", "address": "AA:BB:CC:DD:EE:FF"})
        );

        let stop = serde_json::to_value(HelperRequest {
            id: 4,
            command: HelperCommand::StopScan,
        })
        .unwrap();
        assert_eq!(stop, serde_json::json!({"id": 4, "cmd": "stop_scan"}));
    }

    #[test]
    fn test_advertisement_message_conversion() {
        let line = r#"{"type":"advertisement","address":"AA:BB:CC:DD:EE:FF","localName":"MIBFS","rssi":-60,"serviceData":{"fe95":"0030341207"},"manufacturerData":{"0x0157":"01"}}"#;
        let message: HelperMessage = serde_json::from_str(line).unwrap();
        let Some(AdapterEvent::Advertisement(adv)) = convert_event(message) else {
            panic!("expected an advertisement");
        };
        assert_eq!(adv.address.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(adv.local_name.as_deref(), Some("MIBFS"));
        assert_eq!(adv.rssi, Some(-60));
        assert_eq!(
            adv.service_data.get(&MIBEACON_SERVICE),
            Some(&vec![0x00, 0x30, 0x34, 0x12, 0x07])
        );
        assert_eq!(adv.manufacturer_data.get(&0x0157), Some(&vec![0x01]));
    }

    #[test]
    fn test_notification_message_conversion() {
        let line = r#"{"type":"notification","address":"AA:BB:CC:DD:EE:FF","characteristic":"00002a9d-0000-1000-8000-00805f9b34fb","value":"00b036"}"#;
        let message: HelperMessage = serde_json::from_str(line).unwrap();
        assert_eq!(
            convert_event(message),
            Some(AdapterEvent::Notification {
                address: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
                characteristic: WEIGHT_MEASUREMENT,
                value: vec![0x00, 0xB0, 0x36],
            })
        );
    }

    #[test]
    fn test_malformed_event_is_dropped() {
        let message = HelperMessage::Disconnected {
            address: "nope".into(),
        };
        assert_eq!(convert_event(message), None);
    }

    #[test]
    fn test_power_parsing() {
        assert_eq!(parse_power("poweredOn"), AdapterPower::PoweredOn);
        assert_eq!(parse_power("powered_off"), AdapterPower::PoweredOff);
        assert_eq!(parse_power("resetting"), AdapterPower::Unknown);
    }

    #[test]
    fn test_uuid_parsing() {
        assert_eq!(parse_uuid("fe95"), Some(MIBEACON_SERVICE));
        assert_eq!(parse_uuid("0xFE95"), Some(MIBEACON_SERVICE));
        assert_eq!(
            parse_uuid("0000fe95-0000-1000-8000-00805f9b34fb"),
            Some(MIBEACON_SERVICE)
        );
        assert_eq!(parse_uuid("zz"), None);
    }

    #[tokio::test]
    async fn test_power_change_waits_for_room_in_a_full_channel() {
        let (events, mut rx) = mpsc::channel(1);
        let (power, _) = watch::channel(AdapterPower::PoweredOn);
        let shared = Arc::new(HelperShared {
            next_id: AtomicU64::new(1),
            stdin: tokio::sync::Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            power,
            events,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        });
        let busy = AdapterEvent::Disconnected(MacAddress([1; 6]));
        shared.events.send(busy.clone()).await.unwrap();

        let writer = Arc::clone(&shared);
        let change = tokio::spawn(async move { writer.set_power(AdapterPower::Unknown).await });

        assert_eq!(rx.recv().await, Some(busy));
        change.await.unwrap();
        assert_eq!(*shared.power.borrow(), AdapterPower::Unknown);
        assert_eq!(
            rx.recv().await,
            Some(AdapterEvent::PowerChanged(AdapterPower::Unknown))
        );
    }

    fn shell_helper(script: &str) -> HelperConfig {
        HelperConfig {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    #[tokio::test]
    async fn test_helper_process_round_trip() {
        let script = r#"
            echo '{"type":"state","state":"poweredOn"}'
            read request
            id=$(echo "$request" | sed 's/.*"id":\([0-9]*\).*/\1/')
            echo "{\"type\":\"response\",\"id\":$id,\"ok\":true}"
            echo '{"type":"advertisement","address":"AA:BB:CC:DD:EE:FF","name":"MIBFS"}'
            sleep 5
        "#;
        let (adapter, mut events) = HelperAdapter::spawn(shell_helper(script), RetryConfig::default());

        let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert_eq!(first, Some(AdapterEvent::PowerChanged(AdapterPower::PoweredOn)));
        assert_eq!(adapter.power_state().await, AdapterPower::PoweredOn);

        adapter.start_scanning(&[MIBEACON_SERVICE], true).await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert!(matches!(next, Some(AdapterEvent::Advertisement(adv)) if adv.local_name.as_deref() == Some("MIBFS")));

        adapter.shutdown();
    }

    #[tokio::test]
    async fn test_helper_error_response() {
        let script = r#"
            echo '{"type":"state","state":"poweredOn"}'
            read request
            id=$(echo "$request" | sed 's/.*"id":\([0-9]*\).*/\1/')
            echo "{\"type\":\"response\",\"id\":$id,\"ok\":false,\"error\":\"device busy\"}"
            sleep 5
        "#;
        let (adapter, mut events) = HelperAdapter::spawn(shell_helper(script), RetryConfig::default());

        // The state line means stdin is connected.
        let ready = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert!(ready.is_some());

        let result = adapter.connect(MacAddress([1; 6])).await;
        assert_eq!(result, Err(AdapterError::Helper("device busy".into())));
        adapter.shutdown();
    }

    #[tokio::test]
    async fn test_missing_helper_reports_not_running() {
        let config = HelperConfig {
            program: "/nonexistent/scalebridge-helper".into(),
            args: Vec::new(),
        };
        let (adapter, _events) = HelperAdapter::spawn(config, RetryConfig::default());
        assert!(matches!(
            adapter.stop_scanning().await,
            Err(AdapterError::Helper(_))
        ));
        assert_eq!(adapter.power_state().await, AdapterPower::Unknown);
    }
}
