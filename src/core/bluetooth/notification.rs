//! Telemetry listener
//! Subscribes to the device's notify characteristics while a session is
//! connected and forwards decoded [`TelemetryEvent`]s to the consumer.
//! A subscription is bound to the session it was created in and is
//! released as soon as that session ends, requested or not.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::connection::ConnectionManager;
use crate::core::bluetooth::error::{BleError, BleResult};
use crate::core::bluetooth::protocol::{TelemetryEvent, decode_telemetry};
use crate::core::bluetooth::types::{ConnectionState, StatusSnapshot};

type EventCallback = Arc<dyn Fn(TelemetryEvent) + Send + Sync>;

/// Active notification registrations. Dropping it releases them.
pub struct Subscription {
    session_id: u64,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// False once cancelled or once the session it belonged to has ended
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && self.tasks.iter().any(|task| !task.is_finished())
    }

    /// Cancels the subscription and waits until every registration is released
    pub async fn unsubscribe(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("Telemetry subscription released.");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
pub struct TelemetryListener {
    manager: ConnectionManager,
}

impl TelemetryListener {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Subscribes to every telemetry characteristic of the connected device.
    /// Fails with `NotConnected` outside a connected session.
    pub async fn subscribe<F>(&self, on_event: F) -> BleResult<Subscription>
    where
        F: Fn(TelemetryEvent) + Send + Sync + 'static,
    {
        let status = self.manager.status();
        let (session_id, device_id) = match (&status.state, &status.device) {
            (ConnectionState::Connected, Some(device)) => (status.session_id, device.id.clone()),
            _ => return Err(BleError::NotConnected),
        };

        let platform = self.manager.platform();
        let characteristics = platform.notify_characteristics(&device_id).await;
        if characteristics.is_empty() {
            warn!("Device {} exposes no telemetry characteristics", device_id);
        }

        let cancel = CancellationToken::new();
        let on_event: EventCallback = Arc::new(on_event);
        let mut tasks = Vec::with_capacity(characteristics.len());

        for characteristic in characteristics {
            let char_cancel = cancel.child_token();
            let payloads = match platform
                .subscribe(&device_id, characteristic, char_cancel.clone())
                .await
            {
                Ok(payloads) => payloads,
                Err(e) => {
                    warn!("Failed to subscribe to {}: {}", characteristic, e);
                    cancel.cancel();
                    return Err(e);
                }
            };
            info!("Subscribed to telemetry characteristic {}", characteristic);
            tasks.push(tokio::spawn(Self::process_notifications(
                characteristic,
                payloads,
                self.manager.subscribe_status(),
                session_id,
                char_cancel,
                on_event.clone(),
            )));
        }

        Ok(Subscription {
            session_id,
            cancel,
            tasks,
        })
    }

    async fn process_notifications(
        characteristic: Uuid,
        mut payloads: mpsc::Receiver<Vec<u8>>,
        mut status: watch::Receiver<StatusSnapshot>,
        session_id: u64,
        cancel: CancellationToken,
        on_event: EventCallback,
    ) {
        loop {
            if !Self::session_is_current(&mut status, session_id) {
                info!("Session {} ended; releasing {}", session_id, characteristic);
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                payload = payloads.recv() => {
                    let Some(payload) = payload else {
                        debug!("Notification stream for {} ended", characteristic);
                        break;
                    };
                    if !Self::session_is_current(&mut status, session_id) {
                        break;
                    }
                    match decode_telemetry(characteristic, &payload, Utc::now()) {
                        Ok(event) => {
                            debug!("Telemetry: {:?}", event.reading);
                            on_event(event);
                        }
                        Err(e) => warn!("Dropping notification from {}: {}", characteristic, e),
                    }
                }
            }
        }
        // Releases the platform-level registration.
        cancel.cancel();
    }

    fn session_is_current(status: &mut watch::Receiver<StatusSnapshot>, session_id: u64) -> bool {
        let snapshot = status.borrow_and_update();
        snapshot.session_id == session_id && snapshot.is_connected()
    }
}
