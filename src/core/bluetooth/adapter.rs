//! bluest implementation of the platform boundary
//! Keeps the `Device` and `Characteristic` handles the platform hands out,
//! keyed by identifier, so the rest of the crate only deals in strings and UUIDs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bluest::error::ErrorKind as BluestErrorKind;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device, DeviceId};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    CHANNEL_CAPACITY, REQUIRED_WRITE_CHARS, TELEMETRY_CHARS, UUID_BIOAGE_SERVICE,
};
use crate::core::bluetooth::error::{BleError, BleResult};
use crate::core::bluetooth::platform::{BlePlatform, DisconnectWatch};
use crate::core::bluetooth::types::Advertisement;

type DeviceMap = Arc<Mutex<HashMap<String, Device>>>;

pub struct BluestPlatform {
    adapter: Adapter,
    /// Devices seen by scans or resolved by identifier
    devices: DeviceMap,
    /// Characteristics found by discovery, per device
    characteristics: Mutex<HashMap<String, HashMap<Uuid, Characteristic>>>,
}

impl BluestPlatform {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            characteristics: Mutex::new(HashMap::new()),
        }
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<String, Device>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn characteristics(&self) -> MutexGuard<'_, HashMap<String, HashMap<Uuid, Characteristic>>> {
        self.characteristics.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn device(&self, device_id: &str) -> BleResult<Device> {
        self.devices()
            .get(device_id)
            .cloned()
            .ok_or_else(|| BleError::DeviceNotFound(device_id.to_string()))
    }

    fn characteristic(&self, device_id: &str, uuid: Uuid) -> Option<Characteristic> {
        self.characteristics()
            .get(device_id)
            .and_then(|chars| chars.get(&uuid))
            .cloned()
    }

    /// Resolves an identifier not seen in this process: reopens it from its
    /// persisted `DeviceId`, else looks through the devices the system
    /// already holds a connection to.
    async fn resolve_device(
        &self,
        device_id: &str,
        platform_key: Option<&str>,
    ) -> BleResult<Device> {
        if let Ok(device) = self.device(device_id) {
            return Ok(device);
        }
        if let Some(key) = platform_key {
            match serde_json::from_str::<DeviceId>(key) {
                Ok(id) => match self.adapter.open_device(&id).await {
                    Ok(device) => {
                        info!("Reopened device {} from its stored identifier", device_id);
                        self.devices().insert(device_id.to_string(), device.clone());
                        return Ok(device);
                    }
                    Err(e) => debug!("Cannot reopen {}: {}", device_id, e),
                },
                Err(e) => warn!("Stored key for {} is unreadable: {}", device_id, e),
            }
        }
        let connected = self
            .adapter
            .connected_devices_with_services(&[UUID_BIOAGE_SERVICE])
            .await
            .map_err(|e| radio_error(&e, BleError::ConnectFailed))?;
        let device = connected
            .into_iter()
            .find(|device| device.id().to_string() == device_id)
            .ok_or_else(|| BleError::DeviceNotFound(device_id.to_string()))?;
        self.devices().insert(device_id.to_string(), device.clone());
        Ok(device)
    }

    async fn internal_scan_task(
        adapter: Adapter,
        devices: DeviceMap,
        services: Vec<Uuid>,
        tx: mpsc::Sender<Advertisement>,
        ready: oneshot::Sender<BleResult<()>>,
        cancel: CancellationToken,
    ) {
        // Devices the system is already connected to do not advertise.
        match adapter.connected_devices_with_services(&[UUID_BIOAGE_SERVICE]).await {
            Ok(connected) => {
                for device in connected {
                    let adv = Advertisement {
                        id: device.id().to_string(),
                        name: device.name().ok(),
                        rssi: None,
                        services: vec![UUID_BIOAGE_SERVICE],
                        platform_key: device_key(&device),
                    };
                    info!("Already connected device: {} ({:?})", adv.id, adv.name);
                    devices
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(adv.id.clone(), device);
                    if tx.send(adv).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => debug!("Could not list connected devices: {}", e),
        }

        info!("Starting bluetooth scan");
        let mut scan_stream = match adapter.scan(&services).await {
            Ok(stream) => {
                let _ = ready.send(Ok(()));
                stream
            }
            Err(e) => {
                error!("Failed to start scan: {}", e);
                let _ = ready.send(Err(radio_error(&e, BleError::ConnectFailed)));
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                found = scan_stream.next() => {
                    let Some(found) = found else {
                        info!("Bluetooth scan stream has ended.");
                        break;
                    };
                    let id = found.device.id().to_string();
                    let adv = Advertisement {
                        name: found.adv_data.local_name.clone().or_else(|| found.device.name().ok()),
                        rssi: found.rssi,
                        services: found.adv_data.services.clone(),
                        platform_key: device_key(&found.device),
                        id: id.clone(),
                    };
                    devices
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(id, found.device);
                    if tx.send(adv).await.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Bluetooth scan stopped.");
    }

    async fn process_notifications(
        characteristic: Characteristic,
        tx: mpsc::Sender<Vec<u8>>,
        ready: oneshot::Sender<BleResult<()>>,
        cancel: CancellationToken,
    ) {
        let mut notification_stream = match characteristic.notify().await {
            Ok(stream) => {
                let _ = ready.send(Ok(()));
                stream
            }
            Err(e) => {
                error!("Failed to subscribe to notifications: {}", e);
                let _ = ready.send(Err(radio_error(&e, BleError::DiscoveryFailed)));
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = notification_stream.next() => match result {
                    Some(Ok(value)) => {
                        debug!("Received notification from {}: {:?}", characteristic.uuid(), value);
                        if tx.send(value).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!("Error in notification stream: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
        info!("Notification stream for {} ended", characteristic.uuid());
    }
}

#[async_trait::async_trait]
impl BlePlatform for BluestPlatform {
    async fn scan(
        &self,
        services: &[Uuid],
        cancel: CancellationToken,
    ) -> BleResult<mpsc::Receiver<Advertisement>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(Self::internal_scan_task(
            self.adapter.clone(),
            self.devices.clone(),
            services.to_vec(),
            tx,
            ready_tx,
            cancel,
        ));
        match ready_rx.await {
            Ok(result) => result.map(|()| rx),
            // Task ended before starting the scan: the consumer is gone.
            Err(_) => Ok(rx),
        }
    }

    fn supports_connect_by_id(&self) -> bool {
        true
    }

    async fn connect(&self, device_id: &str, platform_key: Option<&str>) -> BleResult<()> {
        let device = self.resolve_device(device_id, platform_key).await?;
        if device.is_connected().await {
            info!("Device {} already connected at the radio level.", device_id);
            return Ok(());
        }
        info!("Initiating connection to {}...", device_id);
        self.adapter
            .connect_device(&device)
            .await
            .map_err(|e| radio_error(&e, BleError::ConnectFailed))
    }

    async fn discover(&self, device_id: &str) -> BleResult<()> {
        let device = self.device(device_id)?;
        let services = device
            .discover_services_with_uuid(UUID_BIOAGE_SERVICE)
            .await
            .map_err(|e| BleError::DiscoveryFailed(e.to_string()))?;
        let service = services.into_iter().next().ok_or_else(|| {
            BleError::DiscoveryFailed(format!("service {} not found", UUID_BIOAGE_SERVICE))
        })?;
        info!("Found primary service: {}", service.uuid());

        let found: HashMap<Uuid, Characteristic> = service
            .discover_characteristics()
            .await
            .map_err(|e| BleError::DiscoveryFailed(e.to_string()))?
            .into_iter()
            .map(|characteristic| (characteristic.uuid(), characteristic))
            .collect();

        for required in REQUIRED_WRITE_CHARS {
            if !found.contains_key(&required) {
                return Err(BleError::DiscoveryFailed(format!(
                    "characteristic {} not found",
                    required
                )));
            }
        }
        for uuid in found.keys() {
            debug!("Found characteristic: {}", uuid);
        }
        self.characteristics().insert(device_id.to_string(), found);
        Ok(())
    }

    async fn write(&self, device_id: &str, characteristic: Uuid, data: &[u8]) -> BleResult<()> {
        let target = self.characteristic(device_id, characteristic).ok_or_else(|| {
            BleError::WriteFailed(format!("characteristic {} missing", characteristic))
        })?;
        target
            .write(data)
            .await
            .map_err(|e| BleError::WriteFailed(e.to_string()))
    }

    async fn notify_characteristics(&self, device_id: &str) -> Vec<Uuid> {
        self.characteristics()
            .get(device_id)
            .map(|chars| {
                TELEMETRY_CHARS
                    .iter()
                    .filter(|uuid| chars.contains_key(uuid))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn subscribe(
        &self,
        device_id: &str,
        characteristic: Uuid,
        cancel: CancellationToken,
    ) -> BleResult<mpsc::Receiver<Vec<u8>>> {
        let target = self
            .characteristic(device_id, characteristic)
            .ok_or(BleError::NotConnected)?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(Self::process_notifications(target, tx, ready_tx, cancel));
        match ready_rx.await {
            Ok(result) => result.map(|()| rx),
            Err(_) => Err(BleError::NotConnected),
        }
    }

    async fn watch_disconnect(&self, device_id: &str) -> BleResult<DisconnectWatch> {
        let device = self.device(device_id)?;
        let adapter = self.adapter.clone();
        let (tx, rx) = oneshot::channel();
        let id = device_id.to_string();
        tokio::spawn(async move {
            let mut events = match adapter.device_connection_events(&device).await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Connection events unavailable for {}: {}", id, e);
                    return;
                }
            };
            while let Some(event) = events.next().await {
                if matches!(event, ConnectionEvent::Disconnected) {
                    info!("Device {} reported disconnected", id);
                    let _ = tx.send(());
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn disconnect(&self, device_id: &str) -> BleResult<()> {
        self.characteristics().remove(device_id);
        let Ok(device) = self.device(device_id) else {
            return Ok(());
        };
        if device.is_connected().await {
            info!("Disconnecting from device {}", device_id);
            self.adapter
                .disconnect_device(&device)
                .await
                .map_err(|e| radio_error(&e, BleError::ConnectFailed))?;
            info!("Successfully disconnected");
        } else {
            info!("Device {} not connected", device_id);
        }
        Ok(())
    }
}

/// `DeviceId` as JSON, the form `Adapter::open_device` can be fed from later
fn device_key(device: &Device) -> Option<String> {
    serde_json::to_string(&device.id()).ok()
}

/// Maps adapter-level conditions onto the taxonomy, everything else onto `fallback`
fn radio_error(e: &bluest::Error, fallback: fn(String) -> BleError) -> BleError {
    match e.kind() {
        BluestErrorKind::AdapterUnavailable => BleError::RadioOff,
        BluestErrorKind::NotAuthorized => BleError::PermissionDenied,
        BluestErrorKind::NotSupported => BleError::PlatformUnsupported,
        _ => fallback(e.to_string()),
    }
}
