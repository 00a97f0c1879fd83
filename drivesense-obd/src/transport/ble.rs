//! Bluetooth Low Energy link to ELM327 dongles.
//!
//! The common clones expose service `FFF0` with a write characteristic
//! (`FFF2`) and a notify characteristic (`FFF1`); [`BleProfile`] carries
//! other layouts. Some only accept write-without-response, so the write
//! type follows the characteristic's properties.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::bleuuid::uuid_from_u16;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use super::{ChunkReceiver, Transport};
use crate::error::{ConnectionError, TransportError};

/// 16-bit UUIDs of the adapter's serial service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BleProfile {
    pub service: u16,
    pub write: u16,
    pub notify: u16,
}

impl Default for BleProfile {
    fn default() -> Self {
        Self {
            service: 0xFFF0,
            write: 0xFFF2,
            notify: 0xFFF1,
        }
    }
}

impl BleProfile {
    pub fn service_uuid(&self) -> Uuid {
        uuid_from_u16(self.service)
    }

    pub fn write_uuid(&self) -> Uuid {
        uuid_from_u16(self.write)
    }

    pub fn notify_uuid(&self) -> Uuid {
        uuid_from_u16(self.notify)
    }
}

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Pause after connect before discovery on BlueZ, which reports the link
/// up before the GATT cache is populated
#[cfg(target_os = "linux")]
const BLUEZ_SETTLE: Duration = Duration::from_millis(600);

/// A peripheral seen while scanning
#[derive(Debug, Clone)]
pub struct DiscoveredPeripheral {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub advertises_obd_service: bool,
}

async fn first_adapter() -> Result<Adapter, ConnectionError> {
    let manager = Manager::new()
        .await
        .map_err(|e| ConnectionError::Unavailable(e.to_string()))?;
    manager
        .adapters()
        .await
        .map_err(|e| ConnectionError::Unavailable(e.to_string()))?
        .into_iter()
        .next()
        .ok_or_else(|| ConnectionError::Unavailable("no Bluetooth adapter found".to_string()))
}

fn failed(e: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::Failed(e.to_string())
}

/// Scan for `duration`, calling `on_found` the first time each peripheral
/// is seen. Returns everything seen.
pub async fn scan<F>(
    duration: Duration,
    profile: BleProfile,
    mut on_found: F,
) -> Result<Vec<DiscoveredPeripheral>, ConnectionError>
where
    F: FnMut(&DiscoveredPeripheral),
{
    let adapter = first_adapter().await?;
    info!("Scanning for {} s", duration.as_secs());
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| ConnectionError::Unavailable(e.to_string()))?;

    let service = profile.service_uuid();
    let deadline = tokio::time::Instant::now() + duration;
    let mut found: Vec<DiscoveredPeripheral> = Vec::new();
    while tokio::time::Instant::now() < deadline {
        for p in adapter.peripherals().await.unwrap_or_default() {
            let id = p.id().to_string();
            if found.iter().any(|d| d.id == id) {
                continue;
            }
            let Ok(Some(props)) = p.properties().await else {
                continue;
            };
            let discovered = DiscoveredPeripheral {
                id,
                name: props.local_name,
                rssi: props.rssi,
                advertises_obd_service: props.services.contains(&service),
            };
            debug!("Discovered {discovered:?}");
            on_found(&discovered);
            found.push(discovered);
        }
        tokio::time::sleep(SCAN_POLL_INTERVAL).await;
    }
    adapter.stop_scan().await.ok();

    info!("Scan found {} peripheral(s)", found.len());
    Ok(found)
}

pub struct BleTransport {
    name: String,
    peripheral: Peripheral,
    write_char: Characteristic,
    write_type: WriteType,
    receiver: Mutex<Option<ChunkReceiver>>,
    connected: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BleTransport {
    /// Scan until a peripheral whose id equals `target`, or whose local
    /// name starts with it, appears; then connect, discover and subscribe.
    pub async fn connect(
        target: &str,
        profile: BleProfile,
        scan_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let adapter = first_adapter().await?;
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| ConnectionError::Unavailable(e.to_string()))?;
        let found = find_peripheral(&adapter, target, scan_timeout).await;
        adapter.stop_scan().await.ok();
        let peripheral = found?;

        let name = match peripheral.properties().await {
            Ok(Some(props)) => props.local_name.unwrap_or_else(|| target.to_string()),
            _ => target.to_string(),
        };
        Self::setup(adapter, peripheral, name, profile, connect_timeout).await
    }

    async fn setup(
        adapter: Adapter,
        peripheral: Peripheral,
        name: String,
        profile: BleProfile,
        connect_timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        tokio::time::timeout(connect_timeout, peripheral.connect())
            .await
            .map_err(|_| ConnectionError::Failed(format!("connect to {name} timed out")))?
            .map_err(failed)?;

        #[cfg(target_os = "linux")]
        tokio::time::sleep(BLUEZ_SETTLE).await;

        tokio::time::timeout(connect_timeout, peripheral.discover_services())
            .await
            .map_err(|_| ConnectionError::Failed("service discovery timed out".to_string()))?
            .map_err(failed)?;

        let service = profile.service_uuid();
        let notify_uuid = profile.notify_uuid();
        let chars: BTreeSet<Characteristic> = peripheral.characteristics();
        let find = |uuid: Uuid| {
            chars
                .iter()
                .find(|c| c.service_uuid == service && c.uuid == uuid)
                .cloned()
        };
        let (Some(write_char), Some(notify_char)) = (find(profile.write_uuid()), find(notify_uuid))
        else {
            peripheral.disconnect().await.ok();
            return Err(ConnectionError::MissingCharacteristics {
                service: service.to_string(),
            });
        };

        let write_type = if write_char.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        debug!("Write characteristic {} uses {write_type:?}", write_char.uuid);

        peripheral.subscribe(&notify_char).await.map_err(failed)?;
        let mut notifications = peripheral.notifications().await.map_err(failed)?;

        let connected = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded_channel();

        let notify_connected = connected.clone();
        let notify_task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != notify_uuid {
                    continue;
                }
                if tx.send(notification.value).is_err() {
                    break;
                }
            }
            info!("Notification stream ended");
            notify_connected.store(false, Ordering::SeqCst);
        });

        let notify_abort = notify_task.abort_handle();
        let watch_connected = connected.clone();
        let peripheral_id = peripheral.id();
        let watch_task = tokio::spawn(async move {
            match adapter.events().await {
                Ok(events) => {
                    let ours = move |event: &CentralEvent| {
                        matches!(event, CentralEvent::DeviceDisconnected(id) if *id == peripheral_id)
                    };
                    watch_disconnect(events, ours, &watch_connected, &notify_abort).await;
                }
                Err(e) => warn!("Could not subscribe to Bluetooth events: {e}"),
            }
        });

        info!("Connected to {name}");
        Ok(Self {
            name,
            peripheral,
            write_char,
            write_type,
            receiver: Mutex::new(Some(rx)),
            connected,
            tasks: vec![notify_task, watch_task],
        })
    }
}

async fn find_peripheral(
    adapter: &Adapter,
    target: &str,
    timeout: Duration,
) -> Result<Peripheral, ConnectionError> {
    let search = async {
        loop {
            for p in adapter.peripherals().await.unwrap_or_default() {
                if p.id().to_string().eq_ignore_ascii_case(target) {
                    return p;
                }
                if let Ok(Some(props)) = p.properties().await {
                    if props.local_name.is_some_and(|name| name.starts_with(target)) {
                        return p;
                    }
                }
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        }
    };
    tokio::time::timeout(timeout, search)
        .await
        .map_err(|_| ConnectionError::PeripheralNotFound(target.to_string()))
}

#[async_trait]
impl Transport for BleTransport {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.peripheral
            .write(&self.write_char, bytes, self.write_type)
            .await
            .map_err(|e| TransportError::WriteRejected(e.to_string()))
    }

    fn take_chunks(&self) -> Option<ChunkReceiver> {
        self.receiver.lock().ok().and_then(|mut r| r.take())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        for task in &self.tasks {
            task.abort();
        }
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| TransportError::Disconnect(e.to_string()))
    }

    fn describe(&self) -> String {
        format!("ble://{}", self.name)
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Wait for the event marking our peripheral's disconnect, then mark the link
/// down and stop the notification task so the chunk stream ends.
async fn watch_disconnect<S, F>(
    events: S,
    is_disconnect: F,
    connected: &AtomicBool,
    notify_task: &AbortHandle,
) where
    S: Stream + Unpin,
    S::Item: std::fmt::Debug,
    F: Fn(&S::Item) -> bool,
{
    let mut events = events;
    while let Some(event) = events.next().await {
        if is_disconnect(&event) {
            info!("Adapter disconnected: {event:?}");
            connected.store(false, Ordering::SeqCst);
            notify_task.abort();
            return;
        }
    }
}
