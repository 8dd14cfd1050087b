//! Constants used throughout the sync layer
//! GATT layout of the BioAge firmware, default timeouts and the
//! advertised name pattern.

use uuid::Uuid;

/// Name fragment the firmware advertises (matched case-insensitively)
pub const DEVICE_NAME_PATTERN: &str = "BioAge";

/// Primary vendor service advertised by the firmware
pub const UUID_BIOAGE_SERVICE: Uuid = Uuid::from_u128(0xb10a6e00_0001_4c4e_9d1f_5a3c0e7f2b10);

/// Bio-Age characteristic, write with response, 2 bytes (u16 LE age x10)
pub const UUID_BIOAGE_CHAR: Uuid = Uuid::from_u128(0xb10a6e00_0002_4c4e_9d1f_5a3c0e7f2b10);

/// Health-data characteristic, write with response, 5 bytes
pub const UUID_HEALTH_DATA_CHAR: Uuid = Uuid::from_u128(0xb10a6e00_0003_4c4e_9d1f_5a3c0e7f2b10);

/// Telemetry characteristics (notify)
pub const UUID_HEART_RATE_CHAR: Uuid = Uuid::from_u128(0xb10a6e00_0010_4c4e_9d1f_5a3c0e7f2b10);
pub const UUID_STEPS_CHAR: Uuid = Uuid::from_u128(0xb10a6e00_0011_4c4e_9d1f_5a3c0e7f2b10);
pub const UUID_SPO2_CHAR: Uuid = Uuid::from_u128(0xb10a6e00_0012_4c4e_9d1f_5a3c0e7f2b10);

/// Standard Heart Rate Measurement characteristic, accepted from older firmware
pub const UUID_HEART_RATE_MEASUREMENT: Uuid =
    Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

/// Characteristics that must be present for a session to count as connected
pub const REQUIRED_WRITE_CHARS: [Uuid; 2] = [UUID_BIOAGE_CHAR, UUID_HEALTH_DATA_CHAR];

/// Telemetry characteristics subscribed by the listener, when present
pub const TELEMETRY_CHARS: [Uuid; 3] = [UUID_HEART_RATE_CHAR, UUID_STEPS_CHAR, UUID_SPO2_CHAR];

/// Scan duration in seconds
pub const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 15;

/// Bounds applied to a configured scan duration
pub const MIN_SCAN_TIMEOUT_SECS: u64 = 10;
pub const MAX_SCAN_TIMEOUT_SECS: u64 = 30;

/// Timeout for a connect attempt, including service discovery
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Timeout for a single characteristic write
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 5;

/// Scan duration used when a silent reconnect has to fall back to scanning
pub const DEFAULT_RECONNECT_SCAN_TIMEOUT_SECS: u64 = 8;

/// Bio-Age packet size in bytes
pub const BIOAGE_PACKET_SIZE: usize = 2;

/// Health-data packet size in bytes
pub const HEALTH_DATA_PACKET_SIZE: usize = 5;

/// Upper bound of a health score
pub const MAX_SCORE: u8 = 100;

/// Capacity of the per-scan and per-characteristic channels
pub const CHANNEL_CAPACITY: usize = 32;
