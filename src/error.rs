//! Error taxonomy shared by the protocol clients and device services.

use std::fmt;

/// Why a pairing attempt was rejected by the TV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingFailure {
    InvalidPin,
    InvalidParameter,
    Other(String),
}

impl fmt::Display for PairingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingFailure::InvalidPin => write!(f, "the PIN was rejected by the TV"),
            PairingFailure::InvalidParameter => write!(f, "the TV rejected the pairing request"),
            PairingFailure::Other(msg) => write!(f, "{}", msg),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("authentication rejected by device (HTTP {status})")]
    Auth { status: u16 },

    #[error("no pairing credential available")]
    NotPaired,

    #[error("unexpected HTTP status {status}")]
    Http { status: u16 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid value: {0}")]
    Validation(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("pairing failed: {0}")]
    Pairing(PairingFailure),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl DeviceError {
    /// Credential failures need re-pairing rather than a retry.
    pub fn is_auth(&self) -> bool {
        matches!(self, DeviceError::Auth { .. } | DeviceError::NotPaired)
    }

    /// Stable code surfaced to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            DeviceError::Transport(_) | DeviceError::Io(_) => "TRANSPORT_ERROR",
            DeviceError::Timeout => "TIMEOUT",
            DeviceError::Auth { .. } | DeviceError::NotPaired => "AUTH_FAILED",
            DeviceError::Http { .. } | DeviceError::Protocol(_) => "PROTOCOL_ERROR",
            DeviceError::Validation(_) => "INVALID_VALUE",
            DeviceError::UnknownCommand(_) => "UNKNOWN_COMMAND",
            DeviceError::Pairing(PairingFailure::InvalidPin) => "INVALID_PIN",
            DeviceError::Pairing(PairingFailure::InvalidParameter) => "INVALID_PARAMETER",
            DeviceError::Pairing(PairingFailure::Other(_)) => "PAIRING_FAILED",
            DeviceError::Storage(_) => "STORAGE_ERROR",
        }
    }
}

impl From<reqwest::Error> for DeviceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DeviceError::Timeout
        } else {
            DeviceError::Transport(e.to_string())
        }
    }
}

pub type Result<T, E = DeviceError> = std::result::Result<T, E>;
