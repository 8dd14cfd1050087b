//! Silent reconnection
//! One attempt per lifecycle event (app start, foreground resume) to get
//! back to the last connected device. Never loops; the outcome goes to the
//! UI, which may offer a manual retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;

use crate::config::sync_config::SyncConfig;
use crate::core::bluetooth::connection::ConnectionManager;
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::scanner::ScanFilter;
use crate::core::bluetooth::types::{ConnectionState, LastDeviceRecord, StatusSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleEvent {
    AppStart,
    ForegroundResume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    /// No device has been connected yet, or the user forgot it
    NoRecord,
    /// A scan or session is already running
    Busy,
    /// Another reconnect attempt has not finished yet
    InProgress,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectOutcome {
    Connected(StatusSnapshot),
    NotAttempted(SkipReason),
    Failed(BleError),
}

pub struct ReconnectionPolicy {
    manager: ConnectionManager,
    filter: ScanFilter,
    fallback_scan_timeout: Duration,
    in_progress: AtomicBool,
}

impl ReconnectionPolicy {
    pub fn new(manager: ConnectionManager, config: &SyncConfig) -> Self {
        Self {
            manager,
            filter: config.scan_filter(),
            fallback_scan_timeout: config.reconnect_scan_timeout(),
            in_progress: AtomicBool::new(false),
        }
    }

    /// Tries once to reconnect to the remembered device
    pub async fn attempt_silent_reconnect(&self, trigger: LifecycleEvent) -> ReconnectOutcome {
        if self.in_progress.swap(true, Ordering::AcqRel) {
            return ReconnectOutcome::NotAttempted(SkipReason::InProgress);
        }
        let _in_progress = InProgress(&self.in_progress);
        self.attempt(trigger).await
    }

    async fn attempt(&self, trigger: LifecycleEvent) -> ReconnectOutcome {
        let record = match self.manager.store().load().await {
            Ok(Some(record)) => record,
            Ok(None) => return ReconnectOutcome::NotAttempted(SkipReason::NoRecord),
            Err(e) => {
                warn!("Cannot read last device record: {}", e);
                return ReconnectOutcome::NotAttempted(SkipReason::NoRecord);
            }
        };

        let status = self.manager.status();
        if !matches!(status.state, ConnectionState::Idle | ConnectionState::Error(_)) {
            return ReconnectOutcome::NotAttempted(SkipReason::Busy);
        }

        info!(
            "Silent reconnect to {} ({}) on {:?}",
            record.name, record.id, trigger
        );

        if self.manager.platform().supports_connect_by_id() {
            match self.manager.connect_to_record(&record).await {
                Ok(snapshot) => return ReconnectOutcome::Connected(snapshot),
                Err(BleError::DeviceNotFound(_)) => {
                    info!("Device {} not known to the platform, scanning for it", record.id);
                }
                Err(e) => return ReconnectOutcome::Failed(e),
            }
        }

        match self.scan_and_connect(&record).await {
            Ok(snapshot) => ReconnectOutcome::Connected(snapshot),
            Err(e) => ReconnectOutcome::Failed(e),
        }
    }

    async fn scan_and_connect(&self, record: &LastDeviceRecord) -> Result<StatusSnapshot, BleError> {
        // Weak advertisements still count for the remembered device.
        let filter = ScanFilter {
            min_rssi: None,
            ..self.filter.clone()
        };
        let mut scan = self
            .manager
            .start_scan(filter, self.fallback_scan_timeout)
            .await?;

        while let Some(handle) = scan.next_device().await {
            if handle.id == record.id {
                return self.manager.connect_requested(handle).await;
            }
        }
        warn!("Device {} not seen within {:?}", record.id, self.fallback_scan_timeout);
        Err(BleError::ScanTimeout)
    }
}

/// Clears the in-progress flag however the attempt ends, including when
/// the caller drops it halfway.
struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for ReconnectionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectionPolicy")
            .field("fallback_scan_timeout", &self.fallback_scan_timeout)
            .field("in_progress", &self.in_progress.load(Ordering::Relaxed))
            .finish()
    }
}
