//! Wire protocols for the two devices: Denon Telnet lines and SmartCast HTTPS.

pub mod denon;
pub mod denon_monitor;
pub mod transport;
pub mod vizio;
pub mod vizio_keys;

pub use denon::{AvrChange, DenonClient, DenonConfig, DenonReply};
pub use denon_monitor::{DenonMonitor, MonitorEvent};
pub use transport::{HttpReply, HttpRequest, HttpTransport, ReqwestTransport};
pub use vizio::{PairingChallenge, PairingOutcome, VizioClient, VizioConfig};
