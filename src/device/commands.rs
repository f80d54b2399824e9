//! Closed command sets for both devices. Command names arriving from the API
//! boundary are parsed once into these enums; dispatch below is exhaustive.

use serde::Serialize;

use super::types::{AVR_VOLUME_MAX, AvrStatus, TV_VOLUME_MAX};
use crate::error::DeviceError;

/// Logical remote-control keys understood by the TV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RemoteKey {
    PowerOn,
    PowerOff,
    PowerToggle,
    VolumeUp,
    VolumeDown,
    MuteOn,
    MuteOff,
    MuteToggle,
    InputNext,
    ChannelUp,
    ChannelDown,
    ChannelPrevious,
    Up,
    Down,
    Left,
    Right,
    Ok,
    Back,
    Menu,
    Home,
    Exit,
    Info,
    Play,
    Pause,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TvCommand {
    PowerOn,
    PowerOff,
    PowerToggle,
    VolumeUp,
    VolumeDown,
    SetVolume(u8),
    MuteOn,
    MuteOff,
    MuteToggle,
    SetInput(String),
    NextInput,
    ChannelUp,
    ChannelDown,
    PreviousChannel,
    LaunchApp(String),
    SpeakersOn,
    SpeakersOff,
    Key(RemoteKey),
}

/// Normalise "volume-up" / "Volume_Up" to "VOLUME_UP"
fn normalise(name: &str) -> String {
    name.trim().to_ascii_uppercase().replace(['-', ' '], "_")
}

fn required<'a>(name: &str, value: Option<&'a str>) -> Result<&'a str, DeviceError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| DeviceError::Validation(format!("{} requires a value", name)))
}

impl TvCommand {
    pub fn parse(name: &str, value: Option<&str>) -> Result<Self, DeviceError> {
        let name = normalise(name);
        let cmd = match name.as_str() {
            "POWER" | "POWER_TOGGLE" => TvCommand::PowerToggle,
            "POWER_ON" => TvCommand::PowerOn,
            "POWER_OFF" => TvCommand::PowerOff,
            "VOLUME_UP" => TvCommand::VolumeUp,
            "VOLUME_DOWN" => TvCommand::VolumeDown,
            "SET_VOLUME" | "VOLUME" => {
                let raw = required(&name, value)?;
                let v: f64 = raw
                    .parse()
                    .map_err(|_| DeviceError::Validation(format!("bad volume: {}", raw)))?;
                if !(0.0..=TV_VOLUME_MAX as f64).contains(&v) {
                    return Err(DeviceError::Validation(format!(
                        "volume {} outside 0-{}",
                        v, TV_VOLUME_MAX
                    )));
                }
                TvCommand::SetVolume(v.round() as u8)
            }
            "MUTE" | "MUTE_TOGGLE" => TvCommand::MuteToggle,
            "MUTE_ON" => TvCommand::MuteOn,
            "MUTE_OFF" | "UNMUTE" => TvCommand::MuteOff,
            "INPUT" | "SET_INPUT" => TvCommand::SetInput(required(&name, value)?.to_string()),
            "INPUT_NEXT" | "NEXT_INPUT" => TvCommand::NextInput,
            "CHANNEL_UP" => TvCommand::ChannelUp,
            "CHANNEL_DOWN" => TvCommand::ChannelDown,
            "CHANNEL_PREV" | "PREVIOUS_CHANNEL" => TvCommand::PreviousChannel,
            "LAUNCH_APP" | "APP" => TvCommand::LaunchApp(required(&name, value)?.to_string()),
            "SPEAKERS_ON" => TvCommand::SpeakersOn,
            "SPEAKERS_OFF" => TvCommand::SpeakersOff,
            "UP" => TvCommand::Key(RemoteKey::Up),
            "DOWN" => TvCommand::Key(RemoteKey::Down),
            "LEFT" => TvCommand::Key(RemoteKey::Left),
            "RIGHT" => TvCommand::Key(RemoteKey::Right),
            "OK" | "SELECT" | "ENTER" => TvCommand::Key(RemoteKey::Ok),
            "BACK" => TvCommand::Key(RemoteKey::Back),
            "MENU" => TvCommand::Key(RemoteKey::Menu),
            "HOME" => TvCommand::Key(RemoteKey::Home),
            "EXIT" => TvCommand::Key(RemoteKey::Exit),
            "INFO" => TvCommand::Key(RemoteKey::Info),
            "PLAY" => TvCommand::Key(RemoteKey::Play),
            "PAUSE" => TvCommand::Key(RemoteKey::Pause),
            _ => return Err(DeviceError::UnknownCommand(name)),
        };
        Ok(cmd)
    }

    /// Power commands run regardless of the cached power state
    pub fn requires_power(&self) -> bool {
        !matches!(
            self,
            TvCommand::PowerOn | TvCommand::PowerOff | TvCommand::PowerToggle
        )
    }
}

/// Source names the receiver accepts after `SI`
pub const AVR_INPUTS: &[&str] = &[
    "CD", "DVD", "BD", "TV", "SAT/CBL", "MPLAY", "GAME", "TUNER", "AUX1", "AUX2", "NET", "BT",
    "PHONO", "USB/IPOD",
];

/// Surround modes the receiver accepts after `MS`
pub const AVR_SOUND_MODES: &[&str] = &[
    "STEREO",
    "DIRECT",
    "PURE DIRECT",
    "AUTO",
    "MOVIE",
    "MUSIC",
    "GAME",
    "DOLBY DIGITAL",
    "DTS SURROUND",
    "MCH STEREO",
    "VIRTUAL",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AvrCommand {
    PowerOn,
    PowerOff,
    PowerToggle,
    VolumeUp,
    VolumeDown,
    SetVolume(f64),
    MuteOn,
    MuteOff,
    MuteToggle,
    SelectInput(String),
    SetSoundMode(String),
}

impl AvrCommand {
    pub fn parse(name: &str, value: Option<&str>) -> Result<Self, DeviceError> {
        let name = normalise(name);
        let cmd = match name.as_str() {
            "POWER" | "POWER_TOGGLE" => AvrCommand::PowerToggle,
            "POWER_ON" => AvrCommand::PowerOn,
            "POWER_OFF" | "STANDBY" => AvrCommand::PowerOff,
            "VOLUME_UP" => AvrCommand::VolumeUp,
            "VOLUME_DOWN" => AvrCommand::VolumeDown,
            "SET_VOLUME" | "VOLUME" => {
                let raw = required(&name, value)?;
                let v: f64 = raw
                    .parse()
                    .map_err(|_| DeviceError::Validation(format!("bad volume: {}", raw)))?;
                if !v.is_finite() || !(0.0..=AVR_VOLUME_MAX).contains(&v) {
                    return Err(DeviceError::Validation(format!(
                        "volume {} outside 0-{}",
                        v, AVR_VOLUME_MAX
                    )));
                }
                AvrCommand::SetVolume(v)
            }
            "MUTE" | "MUTE_TOGGLE" => AvrCommand::MuteToggle,
            "MUTE_ON" => AvrCommand::MuteOn,
            "MUTE_OFF" | "UNMUTE" => AvrCommand::MuteOff,
            "INPUT" | "SET_INPUT" | "SELECT_INPUT" => {
                let raw = required(&name, value)?.to_ascii_uppercase();
                if !AVR_INPUTS.contains(&raw.as_str()) {
                    return Err(DeviceError::Validation(format!("unknown input: {}", raw)));
                }
                AvrCommand::SelectInput(raw)
            }
            "SOUND_MODE" | "SET_SOUND_MODE" => {
                let raw = required(&name, value)?.to_ascii_uppercase();
                if !AVR_SOUND_MODES.contains(&raw.as_str()) {
                    return Err(DeviceError::Validation(format!(
                        "unknown sound mode: {}",
                        raw
                    )));
                }
                AvrCommand::SetSoundMode(raw)
            }
            _ => return Err(DeviceError::UnknownCommand(name)),
        };
        Ok(cmd)
    }

    pub fn requires_power(&self) -> bool {
        !matches!(
            self,
            AvrCommand::PowerOn | AvrCommand::PowerOff | AvrCommand::PowerToggle
        )
    }

    /// Resolve toggles against the cached state into a concrete command
    pub fn resolve(self, current: &AvrStatus) -> Self {
        match self {
            AvrCommand::PowerToggle if current.is_powered_on => AvrCommand::PowerOff,
            AvrCommand::PowerToggle => AvrCommand::PowerOn,
            AvrCommand::MuteToggle if current.is_muted => AvrCommand::MuteOff,
            AvrCommand::MuteToggle => AvrCommand::MuteOn,
            other => other,
        }
    }
}
