//! Scripted in-memory BLE platform for driving the sync layer in tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bioage_sync_lib::config::sync_config::SyncConfig;
use bioage_sync_lib::core::bluetooth::{
    Advertisement, BleError, BlePlatform, BleResult, ConnectionManager, DisconnectWatch,
    LastDeviceStore, MemoryStore, PermissionGate, PermissionOutcome, Readiness, StatusSnapshot,
    TELEMETRY_CHARS, UUID_BIOAGE_SERVICE,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Default)]
struct FakeState {
    script: Vec<(Duration, Advertisement)>,
    connect_by_id: bool,
    known: HashSet<String>,
    seen: HashSet<String>,
    reopenable: HashMap<String, String>,
    close_scan_after_script: bool,
    disconnect_delay: Duration,
    connect_delay: Duration,
    connect_error: Option<BleError>,
    discover_error: Option<BleError>,
    write_error: Option<BleError>,
    write_delay: Duration,
    connected: HashSet<String>,
    connect_calls: usize,
    disconnect_calls: usize,
    scan_tokens: Vec<CancellationToken>,
    writes: Vec<(Uuid, Vec<u8>)>,
    in_flight: usize,
    max_in_flight: usize,
    telemetry: Vec<Uuid>,
    notify_senders: HashMap<Uuid, mpsc::Sender<Vec<u8>>>,
    subscription_tokens: Vec<CancellationToken>,
    link_watchers: HashMap<String, oneshot::Sender<()>>,
}

pub struct FakePlatform {
    state: Mutex<FakeState>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                connect_by_id: true,
                telemetry: TELEMETRY_CHARS.to_vec(),
                ..FakeState::default()
            }),
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Queues an advertisement, emitted `after` the previous one in every scan
    pub fn advertise(&self, after: Duration, adv: Advertisement) {
        self.with(|s| s.script.push((after, adv)));
    }

    /// Lets `connect` resolve this identifier without a scan
    pub fn remember(&self, id: &str) {
        self.with(|s| s.known.insert(id.to_string()));
    }

    /// Lets `connect` reopen this identifier when called with `key`,
    /// the way a persisted platform handle survives a restart
    pub fn reopenable(&self, id: &str, key: &str) {
        self.with(|s| s.reopenable.insert(id.to_string(), key.to_string()));
    }

    /// Makes every scan end on its own once the script has played,
    /// as when the radio is switched off mid-scan
    pub fn close_scan_after_script(&self) {
        self.with(|s| s.close_scan_after_script = true);
    }

    pub fn set_disconnect_delay(&self, delay: Duration) {
        self.with(|s| s.disconnect_delay = delay);
    }

    pub fn set_connect_by_id(&self, supported: bool) {
        self.with(|s| s.connect_by_id = supported);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.with(|s| s.connect_delay = delay);
    }

    pub fn fail_connect(&self, error: BleError) {
        self.with(|s| s.connect_error = Some(error));
    }

    pub fn fail_discovery(&self, reason: &str) {
        self.with(|s| s.discover_error = Some(BleError::DiscoveryFailed(reason.to_string())));
    }

    pub fn fail_writes(&self, error: BleError) {
        self.with(|s| s.write_error = Some(error));
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.with(|s| s.write_delay = delay);
    }

    pub fn scans_started(&self) -> usize {
        self.with(|s| s.scan_tokens.len())
    }

    pub fn all_scans_stopped(&self) -> bool {
        self.with(|s| s.scan_tokens.iter().all(CancellationToken::is_cancelled))
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.with(|s| s.connected.contains(id))
    }

    pub fn connect_calls(&self) -> usize {
        self.with(|s| s.connect_calls)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.with(|s| s.disconnect_calls)
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.with(|s| s.writes.clone())
    }

    pub fn max_in_flight(&self) -> usize {
        self.with(|s| s.max_in_flight)
    }

    pub fn subscriptions(&self) -> usize {
        self.with(|s| s.subscription_tokens.len())
    }

    pub fn subscriptions_released(&self) -> bool {
        self.with(|s| s.subscription_tokens.iter().all(CancellationToken::is_cancelled))
    }

    /// Pushes a notification; false when nobody is listening any more
    pub async fn notify(&self, characteristic: Uuid, payload: &[u8]) -> bool {
        let sender = self.with(|s| s.notify_senders.get(&characteristic).cloned());
        match sender {
            Some(sender) => sender.send(payload.to_vec()).await.is_ok(),
            None => false,
        }
    }

    /// Simulates the device walking out of range
    pub fn drop_link(&self, id: &str) {
        let watcher = self.with(|s| {
            s.connected.remove(id);
            s.link_watchers.remove(id)
        });
        if let Some(watcher) = watcher {
            let _ = watcher.send(());
        }
    }
}

#[async_trait::async_trait]
impl BlePlatform for FakePlatform {
    async fn scan(
        &self,
        _services: &[Uuid],
        cancel: CancellationToken,
    ) -> BleResult<mpsc::Receiver<Advertisement>> {
        let (tx, rx) = mpsc::channel(32);
        let (script, close_after_script) = self.with(|s| {
            s.scan_tokens.push(cancel.clone());
            (s.script.clone(), s.close_scan_after_script)
        });
        let seen: Vec<String> = script.iter().map(|(_, adv)| adv.id.clone()).collect();
        tokio::spawn(async move {
            for (delay, adv) in script {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if tx.send(adv).await.is_err() {
                    return;
                }
            }
            if close_after_script {
                return;
            }
            // A real radio keeps listening until told to stop.
            cancel.cancelled().await;
        });
        self.with(|s| s.seen.extend(seen));
        Ok(rx)
    }

    fn supports_connect_by_id(&self) -> bool {
        self.with(|s| s.connect_by_id)
    }

    async fn connect(&self, device_id: &str, platform_key: Option<&str>) -> BleResult<()> {
        let (delay, error) = self.with(|s| {
            s.connect_calls += 1;
            (s.connect_delay, s.connect_error.clone())
        });
        tokio::time::sleep(delay).await;
        if let Some(error) = error {
            return Err(error);
        }
        self.with(|s| {
            let reopened = platform_key.is_some()
                && s.reopenable.get(device_id).map(String::as_str) == platform_key;
            if !s.known.contains(device_id) && !s.seen.contains(device_id) && !reopened {
                return Err(BleError::DeviceNotFound(device_id.to_string()));
            }
            s.connected.insert(device_id.to_string());
            Ok(())
        })
    }

    async fn discover(&self, _device_id: &str) -> BleResult<()> {
        match self.with(|s| s.discover_error.clone()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn write(&self, device_id: &str, characteristic: Uuid, data: &[u8]) -> BleResult<()> {
        let (delay, error) = self.with(|s| {
            s.in_flight += 1;
            s.max_in_flight = s.max_in_flight.max(s.in_flight);
            (s.write_delay, s.write_error.clone())
        });
        tokio::time::sleep(delay).await;
        self.with(|s| {
            s.in_flight -= 1;
            if let Some(error) = error {
                return Err(error);
            }
            if !s.connected.contains(device_id) {
                return Err(BleError::NotConnected);
            }
            s.writes.push((characteristic, data.to_vec()));
            Ok(())
        })
    }

    async fn notify_characteristics(&self, _device_id: &str) -> Vec<Uuid> {
        self.with(|s| s.telemetry.clone())
    }

    async fn subscribe(
        &self,
        _device_id: &str,
        characteristic: Uuid,
        cancel: CancellationToken,
    ) -> BleResult<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(32);
        self.with(|s| {
            s.notify_senders.insert(characteristic, tx);
            s.subscription_tokens.push(cancel);
        });
        Ok(rx)
    }

    async fn watch_disconnect(&self, device_id: &str) -> BleResult<DisconnectWatch> {
        let (tx, rx) = oneshot::channel();
        self.with(|s| s.link_watchers.insert(device_id.to_string(), tx));
        Ok(rx)
    }

    async fn disconnect(&self, device_id: &str) -> BleResult<()> {
        let delay = self.with(|s| s.disconnect_delay);
        tokio::time::sleep(delay).await;
        self.with(|s| {
            s.disconnect_calls += 1;
            s.connected.remove(device_id);
            s.link_watchers.remove(device_id);
        });
        Ok(())
    }
}

pub struct FakeGate {
    readiness: Mutex<Readiness>,
}

impl FakeGate {
    pub fn ready() -> Arc<Self> {
        Arc::new(Self {
            readiness: Mutex::new(Readiness::Ready),
        })
    }

    pub fn set(&self, readiness: Readiness) {
        *self.readiness.lock().unwrap() = readiness;
    }
}

#[async_trait::async_trait]
impl PermissionGate for FakeGate {
    async fn check_ready(&self) -> Readiness {
        *self.readiness.lock().unwrap()
    }

    async fn request_permissions(&self) -> PermissionOutcome {
        PermissionOutcome::Granted
    }
}

pub fn advertisement(id: &str, name: &str, rssi: i16) -> Advertisement {
    Advertisement {
        id: id.to_string(),
        name: Some(name.to_string()),
        rssi: Some(rssi),
        services: vec![UUID_BIOAGE_SERVICE],
        platform_key: Some(format!("key-{}", id)),
    }
}

pub struct Harness {
    pub platform: Arc<FakePlatform>,
    pub gate: Arc<FakeGate>,
    pub store: Arc<MemoryStore>,
    pub config: SyncConfig,
    pub manager: ConnectionManager,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(MemoryStore::default())
    }

    pub fn with_store(store: MemoryStore) -> Self {
        let platform = FakePlatform::new();
        let gate = FakeGate::ready();
        let store = Arc::new(store);
        let config = SyncConfig::default();
        let manager = ConnectionManager::new(
            platform.clone(),
            gate.clone(),
            store.clone() as Arc<dyn LastDeviceStore>,
            &config,
        );
        Self {
            platform,
            gate,
            store,
            config,
            manager,
        }
    }

    /// Waits (in paused time) until the published status satisfies `predicate`
    pub async fn wait_for_status(
        &self,
        predicate: impl FnMut(&StatusSnapshot) -> bool,
    ) -> StatusSnapshot {
        let mut status = self.manager.subscribe_status();
        tokio::time::timeout(Duration::from_secs(120), status.wait_for(predicate))
            .await
            .expect("status never reached the expected state")
            .expect("status channel closed")
            .clone()
    }
}
