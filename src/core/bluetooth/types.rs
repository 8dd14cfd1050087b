//! Defines shared data structures for the Bluetooth module.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::error::ErrorKind;

static MAC_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").expect("static MAC pattern")
});

/// A single advertisement reported by the platform during a scan
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// Platform-assigned identifier
    pub id: String,
    /// Advertised local name, or the cached device name
    pub name: Option<String>,
    /// Signal strength in dBm
    pub rssi: Option<i16>,
    /// Service UUIDs present in the advertisement
    pub services: Vec<Uuid>,
    /// Opaque platform handle that can reopen the device in a later process
    pub platform_key: Option<String>,
}

/// Represents a discovered device, reported once per scan session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceHandle {
    /// Platform-specific unique identifier for the device
    pub id: String,
    /// The advertised name of the device
    pub name: String,
    /// MAC address when the platform identifier carries one (not on macOS/iOS)
    pub address: Option<String>,
    /// The signal strength (RSSI) of the device
    pub rssi: i16,
    /// When the device was first reported in this scan
    pub discovered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_key: Option<String>,
}

impl DeviceHandle {
    pub fn from_advertisement(adv: &Advertisement) -> Self {
        Self {
            id: adv.id.clone(),
            name: adv.name.clone().unwrap_or_else(|| "Unknown".to_string()),
            address: extract_mac_address(&adv.id),
            rssi: adv.rssi.unwrap_or(0),
            discovered_at: Utc::now(),
            platform_key: adv.platform_key.clone(),
        }
    }
}

/// Pulls the last MAC-looking token out of a platform identifier
pub fn extract_mac_address(device_id: &str) -> Option<String> {
    MAC_ADDRESS
        .find_iter(device_id)
        .last()
        .map(|m| m.as_str().to_uppercase())
}

/// States of the connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Disconnecting,
    Error(ErrorKind),
}

/// Who asked for a disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisconnectInitiator {
    /// The user pressed "disconnect"; forgets the device
    User,
    /// The app tore the link down (shutdown, account switch); keeps the device
    App,
}

/// Why the last session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisconnectCause {
    Requested(DisconnectInitiator),
    LinkLost,
}

/// Read-only view of the connection session published to consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    /// Incremented on every connect attempt and on every session teardown
    pub session_id: u64,
    pub device: Option<DeviceHandle>,
    pub established_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorKind>,
    pub last_disconnect: Option<DisconnectCause>,
}

impl StatusSnapshot {
    pub fn idle() -> Self {
        Self {
            state: ConnectionState::Idle,
            session_id: 0,
            device: None,
            established_at: None,
            last_activity: None,
            last_error: None,
            last_disconnect: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// The most recently connected device, persisted for silent reconnection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastDeviceRecord {
    pub id: String,
    pub name: String,
    /// Lets connect-by-identifier reopen a device the OS no longer holds.
    /// Absent in records written before it existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_key: Option<String>,
}

impl LastDeviceRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            platform_key: None,
        }
    }

    pub fn with_platform_key(mut self, platform_key: Option<String>) -> Self {
        self.platform_key = platform_key;
        self
    }
}

impl From<&DeviceHandle> for LastDeviceRecord {
    fn from(handle: &DeviceHandle) -> Self {
        Self::new(handle.id.clone(), handle.name.clone())
            .with_platform_key(handle.platform_key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_address_is_extracted_from_platform_id() {
        assert_eq!(
            extract_mac_address("BluetoothLE#BluetoothLEe0:d4:64:1a:2b:3c-c4:aa:01:02:0f:ee"),
            Some("C4:AA:01:02:0F:EE".to_string())
        );
        assert_eq!(extract_mac_address("6F1C0E5A-3C0B-4D3E-9F43-0F5E1A2B3C4D"), None);
    }

    #[test]
    fn unnamed_advertisement_gets_placeholder_name() {
        let handle = DeviceHandle::from_advertisement(&Advertisement {
            id: "dev-1".into(),
            name: None,
            rssi: Some(-60),
            services: vec![],
            platform_key: None,
        });
        assert_eq!(handle.name, "Unknown");
        assert_eq!(handle.rssi, -60);
        assert_eq!(handle.address, None);
    }

    #[test]
    fn record_keeps_the_platform_key_of_the_handle() {
        let handle = DeviceHandle::from_advertisement(&Advertisement {
            id: "dev-1".into(),
            name: Some("BioAge Band".into()),
            rssi: Some(-60),
            services: vec![],
            platform_key: Some("\"dev-1\"".into()),
        });
        let record = LastDeviceRecord::from(&handle);
        assert_eq!(record.platform_key.as_deref(), Some("\"dev-1\""));
    }

    #[test]
    fn records_without_platform_key_still_load() {
        let record: LastDeviceRecord =
            serde_json::from_str(r#"{"id": "dev-1", "name": "BioAge Band"}"#).unwrap();
        assert_eq!(record, LastDeviceRecord::new("dev-1", "BioAge Band"));
        assert!(!serde_json::to_string(&record).unwrap().contains("platform_key"));
    }
}
