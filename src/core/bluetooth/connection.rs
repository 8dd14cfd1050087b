//! Connection manager
//! Owns the single connection session and drives the state machine
//! `Idle -> Scanning -> Connecting -> Connected -> Disconnecting -> Idle`,
//! with `Error` reachable from Scanning, Connecting and Connected and
//! always followed by `Idle`. Nothing here retries; failures are returned
//! to the caller and recorded in the published status.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::sync_config::SyncConfig;
use crate::core::bluetooth::constants::{UUID_BIOAGE_CHAR, UUID_HEALTH_DATA_CHAR};
use crate::core::bluetooth::error::{BleError, BleResult, ErrorKind};
use crate::core::bluetooth::permission::{PermissionGate, PermissionOutcome, Readiness};
use crate::core::bluetooth::platform::BlePlatform;
use crate::core::bluetooth::protocol::{HealthReport, encode_bio_age};
use crate::core::bluetooth::scanner::{
    DeviceScanner, ScanEnd, ScanFilter, ScanOutcome, ScanSession, wait_for_outcome,
};
use crate::core::bluetooth::store::LastDeviceStore;
use crate::core::bluetooth::types::{
    ConnectionState, DeviceHandle, DisconnectCause, DisconnectInitiator, LastDeviceRecord,
    StatusSnapshot, extract_mac_address,
};

/// How long a connect waits for a scan it interrupted to wind down
const SCAN_STOP_GRACE: Duration = Duration::from_secs(2);

struct ActiveScan {
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<ScanOutcome>>,
}

struct Session {
    state: ConnectionState,
    session_id: u64,
    device: Option<DeviceHandle>,
    established_at: Option<chrono::DateTime<Utc>>,
    last_activity: Option<chrono::DateTime<Utc>>,
    last_error: Option<ErrorKind>,
    last_disconnect: Option<DisconnectCause>,
    scan: Option<ActiveScan>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            session_id: 0,
            device: None,
            established_at: None,
            last_activity: None,
            last_error: None,
            last_disconnect: None,
            scan: None,
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state,
            session_id: self.session_id,
            device: self.device.clone(),
            established_at: self.established_at,
            last_activity: self.last_activity,
            last_error: self.last_error,
            last_disconnect: self.last_disconnect,
        }
    }

    fn is_busy(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnecting
        )
    }

    /// Ends the current session; the new id invalidates anything bound to the old one
    fn reset_to_idle(&mut self) {
        self.state = ConnectionState::Idle;
        self.session_id += 1;
        self.device = None;
        self.established_at = None;
        self.scan = None;
    }
}

struct Inner {
    platform: Arc<dyn BlePlatform>,
    gate: Arc<dyn PermissionGate>,
    store: Arc<dyn LastDeviceStore>,
    scanner: DeviceScanner,
    connect_timeout: Duration,
    write_timeout: Duration,
    session: Mutex<Session>,
    status: watch::Sender<StatusSnapshot>,
    /// Held across a write so at most one is in flight per session
    write_lock: tokio::sync::Mutex<()>,
}

/// Handle to the single connection session; clones share it
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        gate: Arc<dyn PermissionGate>,
        store: Arc<dyn LastDeviceStore>,
        config: &SyncConfig,
    ) -> Self {
        let (status, _) = watch::channel(StatusSnapshot::idle());
        Self {
            inner: Arc::new(Inner {
                scanner: DeviceScanner::new(platform.clone()),
                platform,
                gate,
                store,
                connect_timeout: config.connect_timeout(),
                write_timeout: config.write_timeout(),
                session: Mutex::new(Session::new()),
                status,
                write_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Current status
    pub fn status(&self) -> StatusSnapshot {
        self.inner.status.borrow().clone()
    }

    /// Live status updates for the UI and the telemetry listener
    pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.inner.status.subscribe()
    }

    pub async fn check_ready(&self) -> Readiness {
        self.inner.gate.check_ready().await
    }

    /// Asks the platform for missing runtime permissions. Never called implicitly.
    pub async fn request_permissions(&self) -> PermissionOutcome {
        self.inner.gate.request_permissions().await
    }

    pub(crate) fn platform(&self) -> Arc<dyn BlePlatform> {
        self.inner.platform.clone()
    }

    pub(crate) fn store(&self) -> Arc<dyn LastDeviceStore> {
        self.inner.store.clone()
    }

    /// Starts a time-boxed scan. Only valid from `Idle` with the radio ready.
    pub async fn start_scan(&self, filter: ScanFilter, timeout: Duration) -> BleResult<ScanSession> {
        if self.session().is_busy() {
            return Err(BleError::AlreadyBusy);
        }
        self.inner.gate.check_ready().await.into_result()?;

        let session_id = self.update(|s| {
            if s.state != ConnectionState::Idle && !matches!(s.state, ConnectionState::Error(_)) {
                return Err(BleError::AlreadyBusy);
            }
            s.state = ConnectionState::Scanning;
            s.session_id += 1;
            s.last_error = None;
            Ok(s.session_id)
        })?;
        info!("Scanning for devices (session {}).", session_id);

        let scan = match self.inner.scanner.scan(filter, timeout).await {
            Ok(scan) => scan,
            Err(e) => {
                self.fail(session_id, &e);
                return Err(e);
            }
        };

        let registered = self.update(|s| {
            if s.session_id == session_id && s.state == ConnectionState::Scanning {
                s.scan = Some(ActiveScan {
                    cancel: scan.cancel_token(),
                    outcome: scan.outcome_watch(),
                });
                true
            } else {
                false
            }
        });
        if !registered {
            scan.cancel();
        }

        let manager = self.clone();
        let outcome = scan.outcome_watch();
        tokio::spawn(async move {
            let outcome = wait_for_outcome(outcome).await;
            manager.finish_scan(session_id, &outcome).await;
        });

        Ok(scan)
    }

    /// Cancels the running scan, if any, and returns what it found
    pub async fn stop_scan(&self) -> Option<ScanOutcome> {
        let (session_id, scan) = {
            let mut s = self.session();
            if s.state != ConnectionState::Scanning {
                return None;
            }
            (s.session_id, s.scan.take()?)
        };
        info!("Stopping Bluetooth scan.");
        scan.cancel.cancel();
        let outcome = wait_for_outcome(scan.outcome).await;
        self.finish_scan(session_id, &outcome).await;
        Some(outcome)
    }

    /// `Scanning -> Idle`, or `Scanning -> Error -> Idle` when the platform
    /// closed the scan because the radio went away.
    async fn finish_scan(&self, session_id: u64, outcome: &ScanOutcome) {
        if outcome.end == ScanEnd::StreamEnded {
            if let Err(e) = self.inner.gate.check_ready().await.into_result() {
                warn!("Scan stream closed by the platform: {}", e);
                self.fail(session_id, &e);
                return;
            }
        }
        self.update(|s| {
            if s.session_id == session_id && s.state == ConnectionState::Scanning {
                info!(
                    "Scan finished ({:?}), {} device(s) found.",
                    outcome.end,
                    outcome.devices.len()
                );
                s.reset_to_idle();
            }
        });
    }

    /// Connects to a scanned device. Stops an active scan first; rejects
    /// with `AlreadyBusy` while another session is connecting or connected.
    pub async fn connect_requested(&self, handle: DeviceHandle) -> BleResult<StatusSnapshot> {
        if self.session().is_busy() {
            return Err(BleError::AlreadyBusy);
        }
        self.inner.gate.check_ready().await.into_result()?;

        let (session_id, interrupted_scan) = self.update(|s| {
            if s.is_busy() {
                return Err(BleError::AlreadyBusy);
            }
            let scan = s.scan.take();
            s.state = ConnectionState::Connecting;
            s.session_id += 1;
            s.device = Some(handle.clone());
            s.last_error = None;
            Ok((s.session_id, scan))
        })?;

        // Runs detached so a caller that stops waiting cannot strand the
        // session in `Connecting`; the attempt is bounded by the connect timeout.
        let manager = self.clone();
        let attempt = tokio::spawn(async move {
            manager
                .run_connect(session_id, handle, interrupted_scan)
                .await
        });
        match attempt.await {
            Ok(result) => result,
            Err(e) => {
                let error = BleError::ConnectFailed(format!("connect attempt aborted: {}", e));
                self.fail(session_id, &error);
                Err(error)
            }
        }
    }

    async fn run_connect(
        &self,
        session_id: u64,
        handle: DeviceHandle,
        interrupted_scan: Option<ActiveScan>,
    ) -> BleResult<StatusSnapshot> {
        if let Some(scan) = interrupted_scan {
            info!("Stopping scan before connecting.");
            scan.cancel.cancel();
            if tokio::time::timeout(SCAN_STOP_GRACE, wait_for_outcome(scan.outcome))
                .await
                .is_err()
            {
                warn!("Scan did not stop within {:?}", SCAN_STOP_GRACE);
            }
        }

        info!("Connecting to {} ({}), session {}", handle.name, handle.id, session_id);
        let result = match tokio::time::timeout(
            self.inner.connect_timeout,
            self.establish(&handle),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BleError::ConnectTimeout),
        };

        match result {
            Ok(()) => self.complete_connect(session_id, &handle).await,
            Err(e) => {
                warn!("Connection to {} failed: {}", handle.id, e);
                if let Err(cleanup) = self.inner.platform.disconnect(&handle.id).await {
                    debug!("Cleanup disconnect after failure: {}", cleanup);
                }
                self.fail(session_id, &e);
                Err(e)
            }
        }
    }

    /// Connects straight to a remembered identifier, without scanning
    pub async fn connect_to_record(&self, record: &LastDeviceRecord) -> BleResult<StatusSnapshot> {
        let handle = DeviceHandle {
            id: record.id.clone(),
            name: record.name.clone(),
            address: extract_mac_address(&record.id),
            rssi: 0,
            discovered_at: Utc::now(),
            platform_key: record.platform_key.clone(),
        };
        self.connect_requested(handle).await
    }

    /// Radio connect followed by full service discovery; both must succeed
    async fn establish(&self, handle: &DeviceHandle) -> BleResult<()> {
        self.inner
            .platform
            .connect(&handle.id, handle.platform_key.as_deref())
            .await?;
        info!("Connection successful, discovering services...");
        self.inner
            .platform
            .discover(&handle.id)
            .await
            .map_err(|e| match e {
                BleError::DiscoveryFailed(_) => e,
                other => BleError::DiscoveryFailed(other.to_string()),
            })
    }

    async fn complete_connect(
        &self,
        session_id: u64,
        handle: &DeviceHandle,
    ) -> BleResult<StatusSnapshot> {
        let link_watch = self.inner.platform.watch_disconnect(&handle.id).await;

        let now = Utc::now();
        let snapshot = self.update(|s| {
            if s.session_id != session_id || s.state != ConnectionState::Connecting {
                return None;
            }
            s.state = ConnectionState::Connected;
            s.established_at = Some(now);
            s.last_activity = Some(now);
            Some(s.snapshot())
        });
        let Some(snapshot) = snapshot else {
            warn!("Session {} was superseded while connecting", session_id);
            return Err(BleError::NotConnected);
        };

        if let Err(e) = self.inner.store.save(&LastDeviceRecord::from(handle)).await {
            warn!("Failed to remember {}: {}", handle.id, e);
        }

        match link_watch {
            Ok(link_watch) => {
                let manager = self.clone();
                tokio::spawn(async move {
                    if link_watch.await.is_ok() {
                        manager.handle_link_lost(session_id);
                    }
                });
            }
            Err(e) => warn!("Cannot watch link state of {}: {}", handle.id, e),
        }

        info!("Device {} connected (session {}).", handle.id, session_id);
        Ok(snapshot)
    }

    /// Unsolicited disconnect: `Connected -> Error(LinkLost) -> Idle`.
    /// Keeps the last device record so a silent reconnect can follow.
    pub fn handle_link_lost(&self, session_id: u64) {
        let lost = self.update(|s| {
            if s.session_id != session_id || s.state != ConnectionState::Connected {
                return false;
            }
            s.state = ConnectionState::Error(ErrorKind::LinkLost);
            s.last_error = Some(ErrorKind::LinkLost);
            s.last_disconnect = Some(DisconnectCause::LinkLost);
            true
        });
        if lost {
            warn!("Link lost (session {}).", session_id);
            self.update(|s| s.reset_to_idle());
        }
    }

    /// `Connected -> Disconnecting -> Idle`. A user-initiated disconnect
    /// also forgets the device.
    pub async fn disconnect_requested(&self, initiator: DisconnectInitiator) -> BleResult<()> {
        let (session_id, device) = self.update(|s| {
            if s.state != ConnectionState::Connected {
                return Err(BleError::NotConnected);
            }
            s.state = ConnectionState::Disconnecting;
            s.session_id += 1;
            Ok((s.session_id, s.device.clone()))
        })?;
        info!("Disconnecting ({:?}).", initiator);

        let manager = self.clone();
        let teardown = tokio::spawn(async move {
            manager.run_disconnect(session_id, device, initiator).await
        });
        match teardown.await {
            Ok(result) => result,
            Err(e) => {
                warn!("Disconnect task aborted: {}", e);
                self.update(|s| {
                    if s.session_id == session_id {
                        s.last_disconnect = Some(DisconnectCause::Requested(initiator));
                        s.reset_to_idle();
                    }
                });
                Ok(())
            }
        }
    }

    async fn run_disconnect(
        &self,
        session_id: u64,
        device: Option<DeviceHandle>,
        initiator: DisconnectInitiator,
    ) -> BleResult<()> {
        // Let an in-flight write complete first.
        let _write_guard = self.inner.write_lock.lock().await;

        let result = match &device {
            Some(device) => self.inner.platform.disconnect(&device.id).await,
            None => Ok(()),
        };
        if let Err(e) = &result {
            warn!("Platform disconnect reported: {}", e);
        }

        if initiator == DisconnectInitiator::User {
            if let Err(e) = self.inner.store.clear().await {
                warn!("Failed to forget last device: {}", e);
            }
        }

        self.update(|s| {
            if s.session_id == session_id {
                s.last_disconnect = Some(DisconnectCause::Requested(initiator));
                s.reset_to_idle();
            }
        });
        info!("Disconnected.");
        result
    }

    /// Forgets the remembered device, disconnecting first when it is connected
    pub async fn forget_last_device(&self) -> anyhow::Result<()> {
        if self.status().is_connected() {
            self.disconnect_requested(DisconnectInitiator::User).await?;
            return Ok(());
        }
        self.inner.store.clear().await
    }

    /// Encodes and writes the 5-byte health packet. Encoding errors are
    /// returned before anything touches the radio.
    pub async fn write_health_data(&self, report: &HealthReport) -> BleResult<()> {
        let packet = report.to_bytes()?;
        self.write_packet(UUID_HEALTH_DATA_CHAR, &packet).await
    }

    pub async fn write_bio_age(&self, age_years: f64) -> BleResult<()> {
        let packet = encode_bio_age(age_years)?;
        self.write_packet(UUID_BIOAGE_CHAR, &packet).await
    }

    async fn write_packet(&self, characteristic: Uuid, data: &[u8]) -> BleResult<()> {
        let _write_guard = self.inner.write_lock.lock().await;

        let (session_id, device_id) = {
            let s = self.session();
            match (&s.state, &s.device) {
                (ConnectionState::Connected, Some(device)) => (s.session_id, device.id.clone()),
                _ => return Err(BleError::NotConnected),
            }
        };

        debug!("Writing {:02X?} to {}", data, characteristic);
        let result = tokio::time::timeout(
            self.inner.write_timeout,
            self.inner.platform.write(&device_id, characteristic, data),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                self.update(|s| {
                    if s.session_id == session_id {
                        s.last_activity = Some(Utc::now());
                    }
                });
                Ok(())
            }
            Ok(Err(BleError::WriteFailed(reason))) => Err(BleError::WriteFailed(reason)),
            Ok(Err(other)) => Err(BleError::WriteFailed(other.to_string())),
            Err(_) => Err(BleError::WriteFailed(format!(
                "no response within {:?}",
                self.inner.write_timeout
            ))),
        }
    }

    /// `Error` is reported, then the session returns to `Idle`
    fn fail(&self, session_id: u64, error: &BleError) {
        let kind = error.kind();
        let reported = self.update(|s| {
            if s.session_id != session_id {
                return false;
            }
            s.state = ConnectionState::Error(kind);
            s.last_error = Some(kind);
            true
        });
        if reported {
            self.update(|s| s.reset_to_idle());
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mutates the session and publishes the resulting snapshot
    fn update<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut session = self.session();
        let result = f(&mut session);
        self.inner.status.send_replace(session.snapshot());
        result
    }
}
