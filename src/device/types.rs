//! Shared types for the device services. Defines device kinds, status records,
//! connection descriptors, discovery candidates and the connection state machine.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

pub const TV_VOLUME_MAX: u8 = 100;
pub const AVR_VOLUME_MAX: f64 = 99.0;

/// The two appliances this panel controls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Tv,
    Avr,
}

impl DeviceKind {
    pub fn default_port(&self) -> u16 {
        match self {
            DeviceKind::Tv => 7345,
            DeviceKind::Avr => 23,
        }
    }

    /// Pub/sub channel carrying this device's status changes
    pub fn status_channel(&self) -> &'static str {
        match self {
            DeviceKind::Tv => "TV_STATUS_CHANGED",
            DeviceKind::Avr => "AVR_STATUS_CHANGED",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Tv => "tv",
            DeviceKind::Avr => "avr",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tv" | "vizio" => Ok(DeviceKind::Tv),
            "avr" | "denon" | "receiver" => Ok(DeviceKind::Avr),
            other => Err(DeviceError::Validation(format!("unknown device: {}", other))),
        }
    }
}

/// Observable TV state. `Default` is the canonical powered-off tuple.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TvStatus {
    pub is_powered_on: bool,
    pub volume: u8,
    pub is_muted: bool,
    pub input: String,
    pub channel: String,
    pub current_app: Option<String>,
    pub speakers_enabled: bool,
}

impl TvStatus {
    pub fn powered_off() -> Self {
        Self::default()
    }

    /// Collapse to the powered-off tuple when the set is off
    pub fn canonical(self) -> Self {
        if self.is_powered_on {
            self
        } else {
            Self::powered_off()
        }
    }
}

/// Observable receiver state. `Default` is the canonical powered-off tuple.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AvrStatus {
    pub is_powered_on: bool,
    pub volume: f64,
    pub is_muted: bool,
    pub input: String,
    pub sound_mode: String,
}

impl AvrStatus {
    pub fn powered_off() -> Self {
        Self::default()
    }

    pub fn canonical(self) -> Self {
        if self.is_powered_on {
            self
        } else {
            Self::powered_off()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "device", rename_all = "lowercase")]
pub enum DeviceStatus {
    Tv(TvStatus),
    Avr(AvrStatus),
}

impl DeviceStatus {
    pub fn is_powered_on(&self) -> bool {
        match self {
            DeviceStatus::Tv(s) => s.is_powered_on,
            DeviceStatus::Avr(s) => s.is_powered_on,
        }
    }
}

/// How to reach one physical unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub ip: String,
    pub port: u16,
    pub auth_token: Option<String>,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub mac_address: Option<String>,
}

impl ConnectionInfo {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            auth_token: None,
            device_id: None,
            device_name: None,
            mac_address: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// A host that answered on a device's default port during a LAN scan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryCandidate {
    pub ip: IpAddr,
    pub port: u16,
    pub response_time_ms: u64,
    pub device_info: Option<String>,
    pub auth_required: Option<bool>,
    pub mac_address: Option<String>,
}

impl DiscoveryCandidate {
    pub fn new(ip: IpAddr, port: u16, response_time_ms: u64) -> Self {
        Self {
            ip,
            port,
            response_time_ms,
            device_info: None,
            auth_required: None,
            mac_address: None,
        }
    }

    pub fn to_connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            ip: self.ip.to_string(),
            port: self.port,
            auth_token: None,
            device_id: None,
            device_name: self.device_info.clone(),
            mac_address: self.mac_address.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationReason {
    NoDeviceFound,
    AuthRequired,
    AuthRejected,
}

/// Connection lifecycle of one device service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Uninitialized,
    Connected,
    Simulated { reason: SimulationReason },
    Resetting,
}

impl ConnectionState {
    pub fn is_simulated(&self) -> bool {
        matches!(self, ConnectionState::Simulated { .. })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Connected => "connected",
            ConnectionState::Simulated { .. } => "simulated",
            ConnectionState::Resetting => "resetting",
        }
    }
}

/// Flags reported to API callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub device: DeviceKind,
    pub state: ConnectionState,
    pub simulation_mode: bool,
    pub is_connected: bool,
    pub has_valid_credential: Option<bool>,
    pub monitoring: Option<bool>,
    pub ip: Option<String>,
    pub port: Option<u16>,
}
