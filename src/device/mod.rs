mod commands;
mod types;

pub use commands::{AVR_INPUTS, AVR_SOUND_MODES, AvrCommand, RemoteKey, TvCommand};
pub use types::{
    AVR_VOLUME_MAX, AvrStatus, ConnectionInfo, ConnectionState, ConnectionStatus, DeviceKind,
    DeviceStatus, DiscoveryCandidate, SimulationReason, TV_VOLUME_MAX, TvStatus,
};
