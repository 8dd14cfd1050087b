//! Device scanner
//! Time-boxed discovery with name/service filtering and per-session
//! deduplication. A scan always ends, either on timeout or on cancel.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::error::BleResult;
use crate::core::bluetooth::platform::BlePlatform;
use crate::core::bluetooth::types::{Advertisement, DeviceHandle};

/// Which advertisements count as candidates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceFilter {
    /// Any of these service UUIDs is advertised
    Services(Vec<Uuid>),
    /// Case-insensitive substring of the advertised name
    NameContains(String),
    /// Either of the above; real units are inconsistently configured
    Any {
        services: Vec<Uuid>,
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanFilter {
    pub device: DeviceFilter,
    /// Advertisements weaker than this are ignored
    pub min_rssi: Option<i16>,
}

impl ScanFilter {
    pub fn new(device: DeviceFilter) -> Self {
        Self {
            device,
            min_rssi: None,
        }
    }

    pub fn with_min_rssi(mut self, min_rssi: Option<i16>) -> Self {
        self.min_rssi = min_rssi;
        self
    }

    pub fn matches(&self, adv: &Advertisement) -> bool {
        if let (Some(floor), Some(rssi)) = (self.min_rssi, adv.rssi) {
            if rssi < floor {
                return false;
            }
        }
        match &self.device {
            DeviceFilter::Services(services) => Self::matches_services(services, adv),
            DeviceFilter::NameContains(name) => Self::matches_name(name, adv),
            DeviceFilter::Any { services, name } => {
                Self::matches_services(services, adv) || Self::matches_name(name, adv)
            }
        }
    }

    /// Service UUIDs the platform may filter on natively. Empty when the
    /// name alone can qualify a device, since the platform filter would hide it.
    pub fn platform_services(&self) -> Vec<Uuid> {
        match &self.device {
            DeviceFilter::Services(services) => services.clone(),
            _ => Vec::new(),
        }
    }

    fn matches_services(services: &[Uuid], adv: &Advertisement) -> bool {
        adv.services.iter().any(|s| services.contains(s))
    }

    fn matches_name(pattern: &str, adv: &Advertisement) -> bool {
        let pattern = pattern.to_lowercase();
        adv.name
            .as_ref()
            .map(|name| name.to_lowercase().contains(&pattern))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanEnd {
    TimedOut,
    Cancelled,
    /// The platform closed its advertisement stream
    StreamEnded,
}

/// Final result of a scan session; an empty `devices` list is not an error
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanOutcome {
    pub end: ScanEnd,
    /// Every reported device, with the freshest RSSI seen
    pub devices: Vec<DeviceHandle>,
}

/// A running scan. Yields each matching device once; ends on timeout or cancel.
pub struct ScanSession {
    devices: mpsc::UnboundedReceiver<DeviceHandle>,
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<ScanOutcome>>,
}

impl ScanSession {
    pub async fn next_device(&mut self) -> Option<DeviceHandle> {
        self.devices.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn outcome_watch(&self) -> watch::Receiver<Option<ScanOutcome>> {
        self.outcome.clone()
    }

    /// Waits for the scan to end and returns everything it found
    pub async fn finish(self) -> ScanOutcome {
        // Keeps the receiver alive so the scan runs to its timeout.
        let outcome = wait_for_outcome(self.outcome.clone()).await;
        drop(self);
        outcome
    }
}

impl Stream for ScanSession {
    type Item = DeviceHandle;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.devices.poll_recv(cx)
    }
}

pub(crate) async fn wait_for_outcome(mut outcome: watch::Receiver<Option<ScanOutcome>>) -> ScanOutcome {
    match outcome.wait_for(|o| o.is_some()).await {
        Ok(guard) => guard.clone().unwrap_or_else(cancelled_outcome),
        Err(_) => cancelled_outcome(),
    }
}

fn cancelled_outcome() -> ScanOutcome {
    ScanOutcome {
        end: ScanEnd::Cancelled,
        devices: Vec::new(),
    }
}

#[derive(Clone)]
pub struct DeviceScanner {
    platform: Arc<dyn BlePlatform>,
}

impl DeviceScanner {
    pub fn new(platform: Arc<dyn BlePlatform>) -> Self {
        Self { platform }
    }

    /// Starts a time-boxed scan
    pub async fn scan(&self, filter: ScanFilter, timeout: Duration) -> BleResult<ScanSession> {
        let cancel = CancellationToken::new();
        let advertisements = self
            .platform
            .scan(&filter.platform_services(), cancel.child_token())
            .await?;

        let (device_tx, device_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let cancel_for_task = cancel.clone();

        tokio::spawn(async move {
            let outcome =
                Self::internal_scan_task(advertisements, device_tx, filter, timeout, cancel_for_task)
                    .await;
            info!(
                "Scan ended ({:?}) with {} device(s)",
                outcome.end,
                outcome.devices.len()
            );
            let _ = outcome_tx.send(Some(outcome));
        });

        info!("Device scan task started ({:?} timeout).", timeout);
        Ok(ScanSession {
            devices: device_rx,
            cancel,
            outcome: outcome_rx,
        })
    }

    async fn internal_scan_task(
        mut advertisements: mpsc::Receiver<Advertisement>,
        device_tx: mpsc::UnboundedSender<DeviceHandle>,
        filter: ScanFilter,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> ScanOutcome {
        let mut seen: HashMap<String, DeviceHandle> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => break ScanEnd::Cancelled,
                _ = &mut deadline => break ScanEnd::TimedOut,
                adv = advertisements.recv() => {
                    let Some(adv) = adv else {
                        break ScanEnd::StreamEnded;
                    };
                    debug!("Advertisement - ID: {}, Name: {:?}, RSSI: {:?}", adv.id, adv.name, adv.rssi);
                    if !filter.matches(&adv) {
                        continue;
                    }
                    if let Some(known) = seen.get_mut(&adv.id) {
                        if let Some(rssi) = adv.rssi {
                            known.rssi = rssi;
                        }
                        continue;
                    }
                    let handle = DeviceHandle::from_advertisement(&adv);
                    info!(
                        "Found device: ID: {}, Name: {}, Address: {:?}, RSSI: {}",
                        handle.id, handle.name, handle.address, handle.rssi
                    );
                    order.push(handle.id.clone());
                    seen.insert(handle.id.clone(), handle.clone());
                    if device_tx.send(handle).is_err() {
                        debug!("Scan consumer went away");
                        break ScanEnd::Cancelled;
                    }
                }
            }
        };

        // Stops the platform scan as well (child token).
        cancel.cancel();

        let devices = order
            .into_iter()
            .filter_map(|id| seen.remove(&id))
            .collect();
        ScanOutcome { end, devices }
    }
}

impl std::fmt::Debug for DeviceScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceScanner").finish_non_exhaustive()
    }
}
