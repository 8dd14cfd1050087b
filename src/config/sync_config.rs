use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_RECONNECT_SCAN_TIMEOUT_SECS, DEFAULT_SCAN_TIMEOUT_SECS,
    DEFAULT_WRITE_TIMEOUT_SECS, DEVICE_NAME_PATTERN, DeviceFilter, MAX_SCAN_TIMEOUT_SECS,
    MIN_SCAN_TIMEOUT_SECS, ScanFilter, UUID_BIOAGE_SERVICE,
};

const LAST_DEVICE_FILE_NAME: &str = "last_device.json";

/// Sync layer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Duration of a user-initiated scan. Clamped to 10..=30 seconds.
    pub scan_timeout_secs: u64,
    /// Upper bound on connect plus service discovery
    pub connect_timeout_secs: u64,
    /// Upper bound on a single write
    pub write_timeout_secs: u64,
    /// Duration of the fallback scan during a silent reconnect
    pub reconnect_scan_timeout_secs: u64,
    /// Name fragment advertised by the firmware. `None` disables name matching.
    pub name_pattern: Option<String>,
    /// Service UUIDs advertised by the firmware. Empty disables service matching.
    pub service_uuids: Vec<Uuid>,
    /// Weakest RSSI (dBm) still reported by a scan
    pub min_rssi: Option<i16>,
    /// Where the last connected device is remembered. Defaults next to the config file.
    pub last_device_file: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            scan_timeout_secs: DEFAULT_SCAN_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            write_timeout_secs: DEFAULT_WRITE_TIMEOUT_SECS,
            reconnect_scan_timeout_secs: DEFAULT_RECONNECT_SCAN_TIMEOUT_SECS,
            name_pattern: Some(DEVICE_NAME_PATTERN.to_string()),
            service_uuids: vec![UUID_BIOAGE_SERVICE],
            min_rssi: None,
            last_device_file: None,
        }
    }
}

impl SyncConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(
            self.scan_timeout_secs
                .clamp(MIN_SCAN_TIMEOUT_SECS, MAX_SCAN_TIMEOUT_SECS),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs.max(1))
    }

    pub fn reconnect_scan_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_scan_timeout_secs.max(1))
    }

    /// Builds the scan filter; falls back to the firmware name when both
    /// matchers are disabled so a scan never reports every device around.
    pub fn scan_filter(&self) -> ScanFilter {
        let name = self.name_pattern.clone().filter(|n| !n.trim().is_empty());
        let device = match (name, self.service_uuids.is_empty()) {
            (Some(name), false) => DeviceFilter::Any {
                services: self.service_uuids.clone(),
                name,
            },
            (Some(name), true) => DeviceFilter::NameContains(name),
            (None, false) => DeviceFilter::Services(self.service_uuids.clone()),
            (None, true) => DeviceFilter::NameContains(DEVICE_NAME_PATTERN.to_string()),
        };
        ScanFilter::new(device).with_min_rssi(self.min_rssi)
    }

    pub fn last_device_path(&self, config_dir: &std::path::Path) -> PathBuf {
        self.last_device_file
            .clone()
            .unwrap_or_else(|| config_dir.join(LAST_DEVICE_FILE_NAME))
    }
}
