//! Device-integration core for a home control panel: a Vizio SmartCast TV
//! over HTTPS and a Denon receiver over Telnet, with LAN discovery, per-device
//! connection state machines and deduplicated status broadcasts.

pub mod api;
pub mod config;
pub mod db;
pub mod device;
pub mod error;
pub mod protocol;
pub mod pubsub;
pub mod scanner;
pub mod service;

pub use api::{Api, ApiError};
pub use config::Settings;
pub use error::{DeviceError, Result};
