//! BioAge sync library
//! BLE device-sync layer between the BioAge companion app and the
//! wearable: discovery, connection supervision, the fixed binary
//! health-data protocol and live telemetry.

// Module declarations
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod utils;
