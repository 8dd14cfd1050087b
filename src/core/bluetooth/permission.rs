//! Permission gate
//! Answers "can we use the radio right now". Re-checked before every scan
//! because the radio can be switched off between calls. Requesting missing
//! permissions is a separate, explicit operation and is never triggered
//! from inside scan or connect.

use std::time::Duration;

use bluest::{Adapter, error::ErrorKind as BluestErrorKind};
use log::{info, warn};
use serde::Serialize;

use crate::core::bluetooth::error::BleError;

/// How long a readiness check waits for the adapter before calling the radio off
const ADAPTER_READY_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NotReadyReason {
    RadioOff,
    PermissionDenied,
    PlatformUnsupported,
}

impl From<NotReadyReason> for BleError {
    fn from(reason: NotReadyReason) -> Self {
        match reason {
            NotReadyReason::RadioOff => BleError::RadioOff,
            NotReadyReason::PermissionDenied => BleError::PermissionDenied,
            NotReadyReason::PlatformUnsupported => BleError::PlatformUnsupported,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Readiness {
    Ready,
    NotReady(NotReadyReason),
}

impl Readiness {
    /// Converts to a result so callers can use `?`
    pub fn into_result(self) -> Result<(), BleError> {
        match self {
            Readiness::Ready => Ok(()),
            Readiness::NotReady(reason) => Err(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PermissionOutcome {
    Granted,
    Denied,
}

#[async_trait::async_trait]
pub trait PermissionGate: Send + Sync {
    async fn check_ready(&self) -> Readiness;

    async fn request_permissions(&self) -> PermissionOutcome;
}

/// Gate backed by the bluest adapter.
///
/// Desktop stacks grant access implicitly (macOS prompts on first use), so
/// requesting permissions can only report what the stack already decided.
/// Android 12+ needs `BLUETOOTH_SCAN`/`BLUETOOTH_CONNECT`, Android 11 and
/// older need fine location; mobile shells provide their own gate.
pub struct BluestPermissionGate {
    adapter: Option<Adapter>,
}

impl BluestPermissionGate {
    pub fn new(adapter: Option<Adapter>) -> Self {
        Self { adapter }
    }
}

#[async_trait::async_trait]
impl PermissionGate for BluestPermissionGate {
    async fn check_ready(&self) -> Readiness {
        let Some(adapter) = &self.adapter else {
            return Readiness::NotReady(NotReadyReason::PlatformUnsupported);
        };
        // `wait_available` parks until the radio is powered; a powered radio answers at once.
        let availability =
            match tokio::time::timeout(ADAPTER_READY_TIMEOUT, adapter.wait_available()).await {
                Ok(Ok(())) => Some(Ok(())),
                Ok(Err(e)) => {
                    warn!("Adapter availability check failed: {}", e);
                    Some(Err(e.kind()))
                }
                Err(_) => None,
            };
        readiness_from(availability)
    }

    async fn request_permissions(&self) -> PermissionOutcome {
        let outcome = match self.check_ready().await {
            Readiness::NotReady(NotReadyReason::PermissionDenied)
            | Readiness::NotReady(NotReadyReason::PlatformUnsupported) => {
                PermissionOutcome::Denied
            }
            _ => PermissionOutcome::Granted,
        };
        info!("Bluetooth permission request resolved: {:?}", outcome);
        outcome
    }
}

/// Maps the result of waiting for the adapter; `None` means the wait timed out
fn readiness_from(availability: Option<Result<(), BluestErrorKind>>) -> Readiness {
    match availability {
        Some(Ok(())) => Readiness::Ready,
        None => Readiness::NotReady(NotReadyReason::RadioOff),
        Some(Err(BluestErrorKind::NotAuthorized)) => {
            Readiness::NotReady(NotReadyReason::PermissionDenied)
        }
        Some(Err(BluestErrorKind::NotSupported)) => {
            Readiness::NotReady(NotReadyReason::PlatformUnsupported)
        }
        Some(Err(_)) => Readiness::NotReady(NotReadyReason::RadioOff),
    }
}
