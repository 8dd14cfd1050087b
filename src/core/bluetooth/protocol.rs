//! BioAge wire protocol
//! Pure encoders/decoders for the fixed-layout packets written to the
//! device and the telemetry notifications it pushes back. No I/O here.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    BIOAGE_PACKET_SIZE, HEALTH_DATA_PACKET_SIZE, MAX_SCORE, UUID_HEART_RATE_CHAR,
    UUID_HEART_RATE_MEASUREMENT, UUID_SPO2_CHAR, UUID_STEPS_CHAR,
};
use crate::core::bluetooth::error::CodecError;

/// Values produced by the scoring engine for one sync
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthReport {
    pub age_years: f64,
    pub oral: f64,
    pub systemic: f64,
    pub fitness: f64,
}

impl HealthReport {
    pub fn to_bytes(&self) -> Result<[u8; HEALTH_DATA_PACKET_SIZE], CodecError> {
        encode_health_data(self.age_years, self.oral, self.systemic, self.fitness)
    }
}

/// Health-data packet as read back from the wire
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DecodedHealthData {
    pub age_years: f64,
    pub oral: u8,
    pub systemic: u8,
    pub fitness: u8,
}

/// Encodes an age in years as u16 LE tenths of a year.
/// Out-of-range (or non-finite) ages are rejected, never wrapped.
pub fn encode_bio_age(age_years: f64) -> Result<[u8; BIOAGE_PACKET_SIZE], CodecError> {
    let tenths = (age_years * 10.0).round();
    if !tenths.is_finite() || tenths < 0.0 || tenths > f64::from(u16::MAX) {
        return Err(CodecError::OutOfRange { value: age_years });
    }
    Ok((tenths as u16).to_le_bytes())
}

/// Encodes the 5-byte health-data packet: age-low, age-high, oral, systemic, fitness.
/// Scores are clamped to 0..=100.
pub fn encode_health_data(
    age_years: f64,
    oral: f64,
    systemic: f64,
    fitness: f64,
) -> Result<[u8; HEALTH_DATA_PACKET_SIZE], CodecError> {
    let [lo, hi] = encode_bio_age(age_years)?;
    Ok([lo, hi, clamp_score(oral), clamp_score(systemic), clamp_score(fitness)])
}

fn clamp_score(score: f64) -> u8 {
    if score.is_nan() {
        return 0;
    }
    score.round().clamp(0.0, f64::from(MAX_SCORE)) as u8
}

pub fn decode_bio_age(bytes: &[u8]) -> Result<f64, CodecError> {
    let raw: [u8; BIOAGE_PACKET_SIZE] =
        bytes.try_into().map_err(|_| CodecError::InvalidLength {
            expected: BIOAGE_PACKET_SIZE,
            actual: bytes.len(),
        })?;
    Ok(f64::from(u16::from_le_bytes(raw)) / 10.0)
}

pub fn decode_health_data(bytes: &[u8]) -> Result<DecodedHealthData, CodecError> {
    if bytes.len() != HEALTH_DATA_PACKET_SIZE {
        return Err(CodecError::InvalidLength {
            expected: HEALTH_DATA_PACKET_SIZE,
            actual: bytes.len(),
        });
    }
    Ok(DecodedHealthData {
        age_years: decode_bio_age(&bytes[..BIOAGE_PACKET_SIZE])?,
        oral: bytes[2],
        systemic: bytes[3],
        fitness: bytes[4],
    })
}

/// Metric carried by a telemetry characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TelemetryMetric {
    HeartRate,
    Steps,
    SpO2,
}

impl TelemetryMetric {
    pub fn for_characteristic(uuid: Uuid) -> Option<Self> {
        match uuid {
            u if u == UUID_HEART_RATE_CHAR || u == UUID_HEART_RATE_MEASUREMENT => {
                Some(Self::HeartRate)
            }
            u if u == UUID_STEPS_CHAR => Some(Self::Steps),
            u if u == UUID_SPO2_CHAR => Some(Self::SpO2),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TelemetryReading {
    HeartRate { bpm: u16 },
    Steps { count: u32 },
    SpO2 { percent: u8 },
    /// Characteristic this build does not know; payload kept for diagnostics
    Unknown { payload: Vec<u8> },
}

/// One decoded notification, tagged with its source characteristic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub characteristic: Uuid,
    pub received_at: DateTime<Utc>,
    pub reading: TelemetryReading,
}

/// Decodes a notification by source characteristic.
/// Unknown characteristics decode to [`TelemetryReading::Unknown`].
pub fn decode_telemetry(
    characteristic: Uuid,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<TelemetryEvent, CodecError> {
    let reading = match TelemetryMetric::for_characteristic(characteristic) {
        Some(TelemetryMetric::HeartRate) => decode_heart_rate(payload)?,
        Some(TelemetryMetric::Steps) => decode_steps(payload)?,
        Some(TelemetryMetric::SpO2) => decode_spo2(payload)?,
        None => TelemetryReading::Unknown {
            payload: payload.to_vec(),
        },
    };
    Ok(TelemetryEvent {
        characteristic,
        received_at,
        reading,
    })
}

// Heart Rate Measurement layout: flags byte, bit 0 set means u16 LE bpm.
fn decode_heart_rate(payload: &[u8]) -> Result<TelemetryReading, CodecError> {
    let (&flags, rest) = payload
        .split_first()
        .ok_or_else(|| CodecError::Malformed("empty heart rate payload".into()))?;
    let bpm = if flags & 0x01 != 0 {
        match rest {
            [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
            _ => return Err(CodecError::Malformed("heart rate missing u16 value".into())),
        }
    } else {
        match rest {
            [value, ..] => u16::from(*value),
            _ => return Err(CodecError::Malformed("heart rate missing u8 value".into())),
        }
    };
    Ok(TelemetryReading::HeartRate { bpm })
}

fn decode_steps(payload: &[u8]) -> Result<TelemetryReading, CodecError> {
    let count = match payload {
        [a, b, c, d, ..] => u32::from_le_bytes([*a, *b, *c, *d]),
        [a, b] => u32::from(u16::from_le_bytes([*a, *b])),
        _ => {
            return Err(CodecError::Malformed(format!(
                "steps payload of {} bytes",
                payload.len()
            )));
        }
    };
    Ok(TelemetryReading::Steps { count })
}

fn decode_spo2(payload: &[u8]) -> Result<TelemetryReading, CodecError> {
    match payload.first() {
        Some(&percent) if percent <= 100 => Ok(TelemetryReading::SpO2 { percent }),
        Some(&percent) => Err(CodecError::Malformed(format!("SpO2 of {percent}%"))),
        None => Err(CodecError::Malformed("empty SpO2 payload".into())),
    }
}
