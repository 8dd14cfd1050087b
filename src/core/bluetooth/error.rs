//! Error taxonomy of the sync layer
//! Every radio or codec failure surfaces as one of these kinds so the UI
//! can tell "Bluetooth is off" apart from "watch not found" and
//! "lost connection".

use serde::Serialize;
use thiserror::Error;

/// Errors raised by the protocol codec
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("value {value} is outside the encodable range")]
    OutOfRange { value: f64 },
    #[error("expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("malformed telemetry payload: {0}")]
    Malformed(String),
}

/// Errors raised by the radio layer and the components built on it
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BleError {
    #[error("Bluetooth radio is off")]
    RadioOff,
    #[error("Bluetooth permission denied")]
    PermissionDenied,
    #[error("Bluetooth is not supported on this platform")]
    PlatformUnsupported,
    #[error("scan finished without finding the device")]
    ScanTimeout,
    #[error("connect attempt timed out")]
    ConnectTimeout,
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("service discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("link to the device was lost")]
    LinkLost,
    #[error("a connection is already in progress or established")]
    AlreadyBusy,
    #[error("no device connected")]
    NotConnected,
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Fieldless mirror of [`BleError`], published in status snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    RadioOff,
    PermissionDenied,
    PlatformUnsupported,
    ScanTimeout,
    ConnectTimeout,
    ConnectFailed,
    DiscoveryFailed,
    WriteFailed,
    LinkLost,
    AlreadyBusy,
    NotConnected,
    DeviceNotFound,
    OutOfRange,
    Malformed,
}

impl BleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RadioOff => ErrorKind::RadioOff,
            Self::PermissionDenied => ErrorKind::PermissionDenied,
            Self::PlatformUnsupported => ErrorKind::PlatformUnsupported,
            Self::ScanTimeout => ErrorKind::ScanTimeout,
            Self::ConnectTimeout => ErrorKind::ConnectTimeout,
            Self::ConnectFailed(_) => ErrorKind::ConnectFailed,
            Self::DiscoveryFailed(_) => ErrorKind::DiscoveryFailed,
            Self::WriteFailed(_) => ErrorKind::WriteFailed,
            Self::LinkLost => ErrorKind::LinkLost,
            Self::AlreadyBusy => ErrorKind::AlreadyBusy,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            Self::Codec(CodecError::OutOfRange { .. }) => ErrorKind::OutOfRange,
            Self::Codec(_) => ErrorKind::Malformed,
        }
    }
}

pub type BleResult<T> = std::result::Result<T, BleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_errors_map_to_their_kind() {
        let err: BleError = CodecError::OutOfRange { value: 7000.0 }.into();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);

        let err: BleError = CodecError::InvalidLength { expected: 2, actual: 1 }.into();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[test]
    fn messages_are_user_presentable() {
        assert_eq!(BleError::RadioOff.to_string(), "Bluetooth radio is off");
        assert_eq!(
            BleError::WriteFailed("characteristic missing".into()).to_string(),
            "write failed: characteristic missing"
        );
    }
}
