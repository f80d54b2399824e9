//! SmartCast remote key codes and the request-body encodings tried in order
//! when sending a key press. Firmware revisions disagree on the body shape.

use serde_json::{Value, json};

use crate::device::RemoteKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyCode {
    /// Wire name used by the name-based encodings
    pub name: &'static str,
    pub codeset: u8,
    pub code: u8,
}

const fn key(name: &'static str, codeset: u8, code: u8) -> KeyCode {
    KeyCode {
        name,
        codeset,
        code,
    }
}

pub fn key_code(remote: RemoteKey) -> KeyCode {
    match remote {
        RemoteKey::VolumeDown => key("VOL_DOWN", 5, 0),
        RemoteKey::VolumeUp => key("VOL_UP", 5, 1),
        RemoteKey::MuteOff => key("MUTE_OFF", 5, 2),
        RemoteKey::MuteOn => key("MUTE_ON", 5, 3),
        RemoteKey::MuteToggle => key("MUTE_TOGGLE", 5, 4),
        RemoteKey::PowerOff => key("POW_OFF", 11, 0),
        RemoteKey::PowerOn => key("POW_ON", 11, 1),
        RemoteKey::PowerToggle => key("POW_TOGGLE", 11, 2),
        // A bare INPUT key does nothing on most sets
        RemoteKey::InputNext => key("INPUT_NEXT", 7, 1),
        RemoteKey::ChannelDown => key("CH_DOWN", 8, 0),
        RemoteKey::ChannelUp => key("CH_UP", 8, 1),
        RemoteKey::ChannelPrevious => key("CH_PREV", 8, 2),
        RemoteKey::Down => key("DOWN", 3, 0),
        RemoteKey::Left => key("LEFT", 3, 1),
        RemoteKey::Ok => key("OK", 3, 2),
        RemoteKey::Right => key("RIGHT", 3, 7),
        RemoteKey::Up => key("UP", 3, 8),
        RemoteKey::Back => key("BACK", 4, 0),
        RemoteKey::Info => key("INFO", 4, 6),
        RemoteKey::Menu => key("MENU", 4, 8),
        RemoteKey::Home => key("HOME", 4, 15),
        RemoteKey::Exit => key("EXIT", 9, 0),
        RemoteKey::Pause => key("PAUSE", 2, 2),
        RemoteKey::Play => key("PLAY", 2, 3),
    }
}

pub struct KeyEncoding {
    pub name: &'static str,
    pub encode: fn(&KeyCode) -> Value,
}

fn encode_key_list(k: &KeyCode) -> Value {
    json!({"KEYLIST": [{"CODESET": k.codeset, "CODE": k.code, "ACTION": "KEYPRESS"}]})
}

fn encode_codeset(k: &KeyCode) -> Value {
    json!({"CODESET": k.codeset, "CODE": k.code, "ACTION": "KEYPRESS"})
}

fn encode_lowercase_name(k: &KeyCode) -> Value {
    json!({"key": k.name.to_ascii_lowercase()})
}

fn encode_uppercase_name(k: &KeyCode) -> Value {
    json!({"KEY": k.name})
}

pub const KEY_ENCODINGS: &[KeyEncoding] = &[
    KeyEncoding {
        name: "keylist",
        encode: encode_key_list,
    },
    KeyEncoding {
        name: "codeset",
        encode: encode_codeset,
    },
    KeyEncoding {
        name: "lowercase-name",
        encode: encode_lowercase_name,
    },
    KeyEncoding {
        name: "uppercase-name",
        encode: encode_uppercase_name,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_key_uses_input_next() {
        let k = key_code(RemoteKey::InputNext);
        assert_eq!((k.name, k.codeset, k.code), ("INPUT_NEXT", 7, 1));
    }

    #[test]
    fn test_encodings_in_order() {
        let k = key_code(RemoteKey::VolumeUp);
        let bodies: Vec<Value> = KEY_ENCODINGS.iter().map(|e| (e.encode)(&k)).collect();
        assert_eq!(bodies[0]["KEYLIST"][0]["CODESET"], 5);
        assert_eq!(bodies[0]["KEYLIST"][0]["CODE"], 1);
        assert_eq!(bodies[1]["ACTION"], "KEYPRESS");
        assert!(bodies[1].get("KEYLIST").is_none());
        assert_eq!(bodies[2]["key"], "vol_up");
        assert_eq!(bodies[3]["KEY"], "VOL_UP");
    }
}
