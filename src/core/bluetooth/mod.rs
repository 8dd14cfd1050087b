//! Bluetooth functionality for the BioAge sync layer
//! This module handles all bluetooth operations including scanning,
//! connecting, writing health packets and receiving telemetry from the
//! wearable.

mod adapter;
mod connection;
mod constants;
mod error;
mod notification;
mod permission;
mod platform;
mod protocol;
mod reconnect;
mod scanner;
mod store;
mod types;

// Re-export types that should be publicly accessible
pub use adapter::BluestPlatform;
pub use connection::ConnectionManager;
pub use constants::*; // Re-export all constants
pub use error::{BleError, BleResult, CodecError, ErrorKind};
pub use notification::{Subscription, TelemetryListener};
pub use permission::{
    BluestPermissionGate, NotReadyReason, PermissionGate, PermissionOutcome, Readiness,
};
pub use platform::{BlePlatform, DisconnectWatch};
pub use protocol::{
    DecodedHealthData, HealthReport, TelemetryEvent, TelemetryMetric, TelemetryReading,
    decode_bio_age, decode_health_data, decode_telemetry, encode_bio_age, encode_health_data,
};
pub use reconnect::{LifecycleEvent, ReconnectOutcome, ReconnectionPolicy, SkipReason};
pub use scanner::{DeviceFilter, DeviceScanner, ScanEnd, ScanFilter, ScanOutcome, ScanSession};
pub use store::{JsonFileStore, LastDeviceStore, MemoryStore};
pub use types::{
    Advertisement, ConnectionState, DeviceHandle, DisconnectCause, DisconnectInitiator,
    LastDeviceRecord, StatusSnapshot,
};
