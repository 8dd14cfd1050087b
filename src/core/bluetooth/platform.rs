//! Platform adapter boundary
//! Everything that touches the host BLE stack goes through [`BlePlatform`],
//! so the state machine, scanner and codec never branch on the OS.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::error::BleResult;
use crate::core::bluetooth::types::Advertisement;

/// Fires once when the platform reports the link as dropped
pub type DisconnectWatch = oneshot::Receiver<()>;

/// Host BLE stack operations used by the sync layer.
///
/// Streams are handed out as channels fed by platform-owned tasks; the
/// task stops when `cancel` fires or the receiver is dropped.
#[async_trait::async_trait]
pub trait BlePlatform: Send + Sync {
    /// Starts a discovery. An empty `services` slice scans for everything.
    async fn scan(
        &self,
        services: &[Uuid],
        cancel: CancellationToken,
    ) -> BleResult<mpsc::Receiver<Advertisement>>;

    /// Whether [`BlePlatform::connect`] can resolve identifiers not seen in the current scan
    fn supports_connect_by_id(&self) -> bool;

    /// Radio-level connect. `platform_key` is the handle this platform attached
    /// to the device's advertisement, when known. `DeviceNotFound` when the
    /// device cannot be resolved.
    async fn connect(&self, device_id: &str, platform_key: Option<&str>) -> BleResult<()>;

    /// Discovers the primary service and the characteristics the session needs
    async fn discover(&self, device_id: &str) -> BleResult<()>;

    /// Write with response; completes once the peripheral acknowledged it
    async fn write(&self, device_id: &str, characteristic: Uuid, data: &[u8]) -> BleResult<()>;

    /// Telemetry characteristics found during discovery
    async fn notify_characteristics(&self, device_id: &str) -> Vec<Uuid>;

    /// Enables notifications and forwards each payload into the returned channel
    async fn subscribe(
        &self,
        device_id: &str,
        characteristic: Uuid,
        cancel: CancellationToken,
    ) -> BleResult<mpsc::Receiver<Vec<u8>>>;

    async fn watch_disconnect(&self, device_id: &str) -> BleResult<DisconnectWatch>;

    async fn disconnect(&self, device_id: &str) -> BleResult<()>;
}
