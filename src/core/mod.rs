//! Core functionality for the BioAge sync layer
//! The Bluetooth stack lives here; the scoring engine and the UI are
//! external collaborators.

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{ConnectionManager, ReconnectionPolicy, TelemetryListener};
