//! SmartCast controller. Talks the TV's HTTPS/JSON API on port 7345 for
//! status reads, settings writes, app launches, key presses and PIN pairing.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::Method;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::transport::{HttpRequest, HttpTransport};
use super::vizio_keys::{KEY_ENCODINGS, key_code};
use crate::device::{RemoteKey, TV_VOLUME_MAX};
use crate::error::{DeviceError, PairingFailure, Result};

const POWER_ENDPOINT: &str = "/state/device/power_mode";
const DEVICE_INFO_ENDPOINT: &str = "/state/device/deviceinfo";
const VOLUME_ENDPOINT: &str = "/menu_native/dynamic/tv_settings/audio/volume";
const MUTE_ENDPOINT: &str = "/menu_native/dynamic/tv_settings/audio/mute";
const SPEAKERS_ENDPOINT: &str = "/menu_native/dynamic/tv_settings/audio/tv_speakers";
const CURRENT_INPUT_ENDPOINT: &str = "/menu_native/dynamic/tv_settings/devices/current_input";
const INPUT_LIST_ENDPOINT: &str = "/menu_native/dynamic/tv_settings/devices/name_input";
const CHANNEL_ENDPOINT: &str = "/menu_native/dynamic/tv_settings/channels/current_channel";
const CURRENT_APP_ENDPOINT: &str = "/app/current";
const LAUNCH_APP_ENDPOINT: &str = "/app/launch";
const KEY_ENDPOINT: &str = "/key_command/";
const PAIRING_START_ENDPOINT: &str = "/pairing/start";
const PAIRING_PAIR_ENDPOINT: &str = "/pairing/pair";
const PAIRING_CANCEL_ENDPOINT: &str = "/pairing/cancel";

/// Apps launchable by name: (display name, NAME_SPACE, APP_ID)
const KNOWN_APPS: &[(&str, i64, &str)] = &[
    ("Netflix", 3, "1"),
    ("YouTube", 5, "1"),
    ("Prime Video", 3, "4"),
    ("Hulu", 2, "3"),
    ("Disney+", 4, "75"),
    ("Plex", 2, "9"),
    ("Pluto TV", 0, "E6F74C01"),
    ("WatchFree", 3, "E2"),
];

#[derive(Debug, Clone)]
pub struct VizioConfig {
    pub request_timeout: Duration,
    /// HTTP 500 retries wait `retry_delay_unit * attempt`
    pub retry_delay_unit: Duration,
    pub http_retries: u32,
    pub device_name: String,
}

impl Default for VizioConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            retry_delay_unit: Duration::from_millis(1000),
            http_retries: 2,
            device_name: "Home Panel".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PairingSession {
    request_token: i64,
    challenge_type: i64,
}

impl Default for PairingSession {
    fn default() -> Self {
        Self {
            request_token: 0,
            challenge_type: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairingChallenge {
    /// None when the TV shows a PIN without handing out a challenge code
    pub challenge_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairingOutcome {
    pub success: bool,
    pub auth_token: Option<String>,
}

/// A settings value together with the hash the TV requires to modify it
#[derive(Debug, Clone, PartialEq)]
pub struct Hashed<T> {
    pub value: T,
    pub hash: Option<i64>,
}

fn result_code(body: &Value) -> Option<&str> {
    body.get("STATUS")
        .and_then(|s| s.get("RESULT"))
        .and_then(Value::as_str)
}

fn is_success(body: &Value) -> bool {
    result_code(body).is_none_or(|code| code.eq_ignore_ascii_case("SUCCESS"))
}

fn first_item(body: &Value) -> Option<&Value> {
    body.get("ITEMS")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .or_else(|| body.get("ITEM"))
}

fn item_value(body: &Value) -> Option<&Value> {
    first_item(body).and_then(|item| item.get("VALUE"))
}

fn item_hash(body: &Value) -> Option<i64> {
    first_item(body)
        .and_then(|item| item.get("HASHVAL"))
        .and_then(Value::as_i64)
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn switch_is_on(value: &Value) -> bool {
    match value {
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "on" | "auto"),
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    }
}

fn missing(what: &str) -> DeviceError {
    DeviceError::Protocol(format!("response has no {}", what))
}

/// Map a pairing RESULT code to a classified failure
pub fn classify_pairing_result(code: &str) -> PairingFailure {
    match code.to_ascii_uppercase().as_str() {
        "INVALID_PIN" | "CHALLENGE_INCORRECT" => PairingFailure::InvalidPin,
        "INVALID_PARAMETER" => PairingFailure::InvalidParameter,
        other => PairingFailure::Other(format!("TV answered {}", other)),
    }
}

pub struct VizioClient {
    base_url: String,
    ip: String,
    port: u16,
    transport: Arc<dyn HttpTransport>,
    config: VizioConfig,
    device_id: String,
    auth_token: RwLock<Option<String>>,
    pairing: Mutex<Option<PairingSession>>,
}

impl VizioClient {
    pub fn new(
        ip: impl Into<String>,
        port: u16,
        transport: Arc<dyn HttpTransport>,
        config: VizioConfig,
        device_id: impl Into<String>,
    ) -> Self {
        let ip = ip.into();
        Self {
            base_url: format!("https://{}:{}", ip, port),
            ip,
            port,
            transport,
            config,
            device_id: device_id.into(),
            auth_token: RwLock::new(None),
            pairing: Mutex::new(None),
        }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn auth_token(&self) -> Option<String> {
        self.auth_token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_auth_token(&self, token: Option<String>) {
        *self.auth_token.write().unwrap_or_else(|e| e.into_inner()) =
            token.filter(|t| !t.is_empty());
    }

    pub fn has_auth_token(&self) -> bool {
        self.auth_token().is_some()
    }

    /// One API call. 500s are retried with a linearly growing delay; 401/403
    /// become `DeviceError::Auth`.
    pub async fn send_request(
        &self,
        endpoint: &str,
        method: Method,
        body: Option<Value>,
        requires_auth: bool,
    ) -> Result<Value> {
        let auth_token = if requires_auth {
            Some(self.auth_token().ok_or(DeviceError::NotPaired)?)
        } else {
            None
        };
        let request = HttpRequest {
            method,
            url: format!("{}{}", self.base_url, endpoint),
            auth_token,
            body,
        };

        let mut attempt: u32 = 0;
        loop {
            let reply = self.transport.execute(request.clone()).await?;
            match reply.status {
                200..=299 => return Ok(reply.body),
                401 | 403 => return Err(DeviceError::Auth {
                    status: reply.status,
                }),
                500 if attempt < self.config.http_retries => {
                    attempt += 1;
                    let delay = self.config.retry_delay_unit * attempt;
                    tracing::debug!(
                        "TV returned 500 for {}, retry {} in {:?}",
                        endpoint,
                        attempt,
                        delay
                    );
                    sleep(delay).await;
                }
                status => return Err(DeviceError::Http { status }),
            }
        }
    }

    async fn read(&self, endpoint: &str, requires_auth: bool) -> Result<Value> {
        self.send_request(endpoint, Method::GET, None, requires_auth)
            .await
    }

    async fn modify(&self, endpoint: &str, hash: Option<i64>, value: Value) -> Result<()> {
        let body = json!({
            "REQUEST": "MODIFY",
            "HASHVAL": hash,
            "VALUE": value,
        });
        let resp = self
            .send_request(endpoint, Method::PUT, Some(body), true)
            .await?;
        if is_success(&resp) {
            Ok(())
        } else {
            Err(DeviceError::Protocol(format!(
                "{} rejected: {}",
                endpoint,
                result_code(&resp).unwrap_or("unknown")
            )))
        }
    }

    /// Power mode needs no pairing token
    pub async fn power_state(&self) -> Result<bool> {
        let resp = self.read(POWER_ENDPOINT, false).await?;
        let value = item_value(&resp).ok_or_else(|| missing("power mode"))?;
        Ok(switch_is_on(value))
    }

    pub async fn device_info(&self) -> Result<Option<String>> {
        let resp = self.read(DEVICE_INFO_ENDPOINT, false).await?;
        let Some(value) = item_value(&resp) else {
            return Ok(None);
        };
        Ok(["MODEL_NAME", "NAME", "SYSTEM_INFO"]
            .iter()
            .find_map(|k| value.get(*k).and_then(value_as_string)))
    }

    pub async fn volume(&self) -> Result<Hashed<u8>> {
        let resp = self.read(VOLUME_ENDPOINT, true).await?;
        let value = item_value(&resp)
            .and_then(Value::as_f64)
            .ok_or_else(|| missing("volume"))?;
        Ok(Hashed {
            value: value.clamp(0.0, TV_VOLUME_MAX as f64).round() as u8,
            hash: item_hash(&resp),
        })
    }

    pub async fn set_volume(&self, volume: u8) -> Result<()> {
        if volume > TV_VOLUME_MAX {
            return Err(DeviceError::Validation(format!(
                "volume {} outside 0-{}",
                volume, TV_VOLUME_MAX
            )));
        }
        let current = self.volume().await?;
        self.modify(VOLUME_ENDPOINT, current.hash, json!(volume))
            .await
    }

    pub async fn mute(&self) -> Result<bool> {
        let resp = self.read(MUTE_ENDPOINT, true).await?;
        item_value(&resp)
            .map(switch_is_on)
            .ok_or_else(|| missing("mute"))
    }

    pub async fn current_input(&self) -> Result<Hashed<String>> {
        let resp = self.read(CURRENT_INPUT_ENDPOINT, true).await?;
        let value = item_value(&resp)
            .and_then(value_as_string)
            .ok_or_else(|| missing("input"))?;
        Ok(Hashed {
            value,
            hash: item_hash(&resp),
        })
    }

    pub async fn input_list(&self) -> Result<Vec<String>> {
        let resp = self.read(INPUT_LIST_ENDPOINT, true).await?;
        let items = resp
            .get("ITEMS")
            .and_then(Value::as_array)
            .ok_or_else(|| missing("input list"))?;
        Ok(items
            .iter()
            .filter_map(|item| item.get("NAME").and_then(Value::as_str))
            .filter(|name| !name.eq_ignore_ascii_case("current input"))
            .map(str::to_string)
            .collect())
    }

    pub async fn set_input(&self, name: &str) -> Result<()> {
        let current = self.current_input().await?;
        self.modify(CURRENT_INPUT_ENDPOINT, current.hash, json!(name))
            .await
    }

    pub async fn channel(&self) -> Result<String> {
        let resp = self.read(CHANNEL_ENDPOINT, true).await?;
        item_value(&resp)
            .and_then(value_as_string)
            .ok_or_else(|| missing("channel"))
    }

    pub async fn speakers(&self) -> Result<bool> {
        let resp = self.read(SPEAKERS_ENDPOINT, true).await?;
        item_value(&resp)
            .map(switch_is_on)
            .ok_or_else(|| missing("speaker setting"))
    }

    pub async fn set_speakers(&self, on: bool) -> Result<()> {
        let resp = self.read(SPEAKERS_ENDPOINT, true).await?;
        let value = if on { "Auto" } else { "Off" };
        self.modify(SPEAKERS_ENDPOINT, item_hash(&resp), json!(value))
            .await
    }

    /// Name of the running app, None on the plain input
    pub async fn current_app(&self) -> Result<Option<String>> {
        let resp = self.read(CURRENT_APP_ENDPOINT, true).await?;
        let Some(value) = item_value(&resp).filter(|v| !v.is_null()) else {
            return Ok(None);
        };
        let namespace = value.get("NAME_SPACE").and_then(Value::as_i64);
        let app_id = value.get("APP_ID").and_then(value_as_string);
        let known = KNOWN_APPS
            .iter()
            .find(|(_, ns, id)| Some(*ns) == namespace && app_id.as_deref() == Some(*id))
            .map(|(name, _, _)| name.to_string());
        Ok(known.or(app_id))
    }

    pub async fn launch_app(&self, name: &str) -> Result<()> {
        let (_, namespace, app_id) = KNOWN_APPS
            .iter()
            .find(|(n, _, _)| n.eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| DeviceError::Validation(format!("unknown app: {}", name)))?;
        let body = json!({
            "VALUE": {"MESSAGE": null, "NAME_SPACE": namespace, "APP_ID": app_id}
        });
        let resp = self
            .send_request(LAUNCH_APP_ENDPOINT, Method::PUT, Some(body), true)
            .await?;
        if is_success(&resp) {
            Ok(())
        } else {
            Err(DeviceError::Protocol(format!("launch of {} rejected", name)))
        }
    }

    /// Try each key body encoding until the TV accepts one. Returns the name
    /// of the encoding that worked.
    pub async fn send_key_press(&self, key: RemoteKey) -> Result<&'static str> {
        let code = key_code(key);
        let mut last_error = None;

        for encoding in KEY_ENCODINGS {
            let body = (encoding.encode)(&code);
            match self
                .send_request(KEY_ENDPOINT, Method::PUT, Some(body), true)
                .await
            {
                Ok(resp) if is_success(&resp) => {
                    tracing::debug!("Key {} accepted with {} encoding", code.name, encoding.name);
                    return Ok(encoding.name);
                }
                Ok(resp) => {
                    tracing::debug!(
                        "Key {} rejected with {} encoding: {:?}",
                        code.name,
                        encoding.name,
                        result_code(&resp)
                    );
                    last_error = Some(DeviceError::Protocol(format!(
                        "key {} rejected",
                        code.name
                    )));
                }
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    tracing::debug!("Key {} failed with {} encoding: {}", code.name, encoding.name, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DeviceError::Protocol("no key encodings".into())))
    }

    /// Ask the TV to show a PIN. Any earlier session is cancelled first.
    pub async fn initiate_pairing(&self) -> Result<PairingChallenge> {
        if let Err(e) = self.cancel_pairing().await {
            tracing::debug!("Cancelling previous pairing failed: {}", e);
        }

        let body = json!({
            "DEVICE_ID": self.device_id,
            "DEVICE_NAME": self.config.device_name,
        });
        let resp = self
            .send_request(PAIRING_START_ENDPOINT, Method::PUT, Some(body), false)
            .await?;

        let code = result_code(&resp).unwrap_or("SUCCESS").to_ascii_uppercase();
        let session = match code.as_str() {
            "SUCCESS" => {
                let item = resp.get("ITEM");
                let request_token = item
                    .and_then(|i| i.get("PAIRING_REQ_TOKEN"))
                    .and_then(Value::as_i64);
                let challenge_type = item
                    .and_then(|i| i.get("CHALLENGE_TYPE"))
                    .and_then(Value::as_i64)
                    .unwrap_or(1);
                match request_token {
                    Some(request_token) => PairingSession {
                        request_token,
                        challenge_type,
                    },
                    None => PairingSession::default(),
                }
            }
            // Already showing a PIN from an earlier request
            "BLOCKED" => PairingSession::default(),
            other => return Err(DeviceError::Pairing(classify_pairing_result(other))),
        };

        *self.pairing.lock().await = Some(session);
        let challenge_code = (session.request_token != 0).then(|| session.request_token.to_string());
        tracing::info!(
            "Pairing started with {} (challenge code: {})",
            self.ip,
            challenge_code.as_deref().unwrap_or("none")
        );
        Ok(PairingChallenge { challenge_code })
    }

    /// Submit the on-screen PIN. The returned token is verified with one
    /// authenticated read before it is kept.
    pub async fn complete_pairing(&self, pin: &str) -> Result<PairingOutcome> {
        let pin = pin.trim();
        if pin.is_empty() || !pin.chars().all(|c| c.is_ascii_digit()) {
            return Err(DeviceError::Pairing(PairingFailure::InvalidParameter));
        }

        let session = self.pairing.lock().await.unwrap_or_default();
        let body = json!({
            "DEVICE_ID": self.device_id,
            "CHALLENGE_TYPE": session.challenge_type,
            "RESPONSE_VALUE": pin,
            "PAIRING_REQ_TOKEN": session.request_token,
        });
        let resp = self
            .send_request(PAIRING_PAIR_ENDPOINT, Method::PUT, Some(body), false)
            .await?;

        if let Some(code) = result_code(&resp).filter(|c| !c.eq_ignore_ascii_case("SUCCESS")) {
            return Err(DeviceError::Pairing(classify_pairing_result(code)));
        }
        let token = resp
            .get("ITEM")
            .and_then(|i| i.get("AUTH_TOKEN"))
            .and_then(value_as_string)
            .ok_or_else(|| {
                DeviceError::Pairing(PairingFailure::Other("no token in reply".into()))
            })?;

        let previous = self.auth_token();
        self.set_auth_token(Some(token.clone()));
        if let Err(e) = self.volume().await {
            tracing::warn!("New pairing token failed verification: {}", e);
            self.set_auth_token(previous);
            return Ok(PairingOutcome {
                success: false,
                auth_token: None,
            });
        }

        *self.pairing.lock().await = None;
        tracing::info!("Paired with TV at {}", self.ip);
        Ok(PairingOutcome {
            success: true,
            auth_token: Some(token),
        })
    }

    pub async fn cancel_pairing(&self) -> Result<()> {
        let session = self.pairing.lock().await.take().unwrap_or_default();
        let body = json!({
            "DEVICE_ID": self.device_id,
            "DEVICE_NAME": self.config.device_name,
            "CHALLENGE_TYPE": session.challenge_type,
            "RESPONSE_VALUE": "1111",
            "PAIRING_REQ_TOKEN": session.request_token,
        });
        self.send_request(PAIRING_CANCEL_ENDPOINT, Method::PUT, Some(body), false)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::transport::HttpReply;
    use crate::protocol::transport::tests::StubTransport;

    pub(crate) fn fast_config() -> VizioConfig {
        VizioConfig {
            retry_delay_unit: Duration::from_millis(1),
            ..VizioConfig::default()
        }
    }

    pub(crate) fn client_with(transport: Arc<StubTransport>, token: Option<&str>) -> VizioClient {
        let client = VizioClient::new("10.0.0.5", 7345, transport, fast_config(), "test-device");
        client.set_auth_token(token.map(str::to_string));
        client
    }

    pub(crate) fn items(value: Value, hash: i64) -> Value {
        json!({
            "STATUS": {"RESULT": "SUCCESS"},
            "ITEMS": [{"NAME": "item", "VALUE": value, "HASHVAL": hash}]
        })
    }

    #[tokio::test]
    async fn test_key_press_falls_through_to_third_encoding() {
        let stub = StubTransport::new(|_, index| match index {
            0 | 1 => Err(DeviceError::Transport("connection reset".into())),
            _ => Ok(HttpReply::ok(json!({"STATUS": {"RESULT": "SUCCESS"}}))),
        });
        let client = client_with(stub.clone(), Some("token"));

        let used = client.send_key_press(RemoteKey::VolumeUp).await.unwrap();

        assert_eq!(used, "lowercase-name");
        assert_eq!(stub.calls(), 3);
        let requests = stub.requests();
        assert_eq!(requests[2].body.as_ref().unwrap()["key"], "vol_up");
        assert_eq!(requests[2].auth_token.as_deref(), Some("token"));
        assert!(requests[2].url.ends_with("/key_command/"));
    }

    #[tokio::test]
    async fn test_key_press_auth_error_stops_fallback() {
        let stub = StubTransport::new(|_, _| Ok(HttpReply::status(403)));
        let client = client_with(stub.clone(), Some("token"));

        let err = client.send_key_press(RemoteKey::Home).await.unwrap_err();
        assert!(err.is_auth());
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn test_key_press_without_token_never_hits_wire() {
        let stub = StubTransport::new(|_, _| Ok(HttpReply::ok(Value::Null)));
        let client = client_with(stub.clone(), None);

        assert!(matches!(
            client.send_key_press(RemoteKey::Ok).await,
            Err(DeviceError::NotPaired)
        ));
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_server_error_retried_twice() {
        let stub = StubTransport::new(|_, index| match index {
            0 | 1 => Ok(HttpReply::status(500)),
            _ => Ok(HttpReply::ok(items(json!(1), 0))),
        });
        let client = client_with(stub.clone(), None);

        assert!(client.power_state().await.unwrap());
        assert_eq!(stub.calls(), 3);
    }

    #[tokio::test]
    async fn test_server_error_gives_up_after_retries() {
        let stub = StubTransport::new(|_, _| Ok(HttpReply::status(500)));
        let client = client_with(stub.clone(), None);

        assert!(matches!(
            client.power_state().await,
            Err(DeviceError::Http { status: 500 })
        ));
        assert_eq!(stub.calls(), 3);
    }

    #[tokio::test]
    async fn test_forbidden_is_auth_error() {
        let stub = StubTransport::new(|_, _| Ok(HttpReply::status(403)));
        let client = client_with(stub.clone(), Some("stale"));

        let err = client.volume().await.unwrap_err();
        assert!(matches!(err, DeviceError::Auth { status: 403 }));
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn test_set_volume_sends_hash() {
        let stub = StubTransport::new(|req, _| {
            if req.method == Method::GET {
                Ok(HttpReply::ok(items(json!(20), 4242)))
            } else {
                Ok(HttpReply::ok(json!({"STATUS": {"RESULT": "SUCCESS"}})))
            }
        });
        let client = client_with(stub.clone(), Some("token"));

        client.set_volume(35).await.unwrap();

        let requests = stub.requests();
        let put = requests.last().unwrap();
        assert_eq!(put.method, Method::PUT);
        let body = put.body.as_ref().unwrap();
        assert_eq!(body["REQUEST"], "MODIFY");
        assert_eq!(body["HASHVAL"], 4242);
        assert_eq!(body["VALUE"], 35);
    }

    #[tokio::test]
    async fn test_reads_items_values() {
        let stub = StubTransport::new(|req, _| {
            let body = if req.url.ends_with("/mute") {
                items(json!("On"), 1)
            } else if req.url.ends_with("/current_input") {
                items(json!("HDMI-2"), 7)
            } else if req.url.ends_with("/app/current") {
                json!({"STATUS": {"RESULT": "SUCCESS"},
                       "ITEM": {"VALUE": {"NAME_SPACE": 3, "APP_ID": "1"}}})
            } else {
                json!({"STATUS": {"RESULT": "SUCCESS"}, "ITEMS": [
                    {"NAME": "CURRENT INPUT", "VALUE": "HDMI-2"},
                    {"NAME": "HDMI-1", "VALUE": ""},
                    {"NAME": "HDMI-2", "VALUE": ""}
                ]})
            };
            Ok(HttpReply::ok(body))
        });
        let client = client_with(stub, Some("token"));

        assert!(client.mute().await.unwrap());
        let input = client.current_input().await.unwrap();
        assert_eq!(input.value, "HDMI-2");
        assert_eq!(input.hash, Some(7));
        assert_eq!(client.current_app().await.unwrap().as_deref(), Some("Netflix"));
        assert_eq!(client.input_list().await.unwrap(), vec!["HDMI-1", "HDMI-2"]);
    }

    #[tokio::test]
    async fn test_launch_unknown_app_rejected_locally() {
        let stub = StubTransport::new(|_, _| Ok(HttpReply::ok(Value::Null)));
        let client = client_with(stub.clone(), Some("token"));

        assert!(matches!(
            client.launch_app("Not An App").await,
            Err(DeviceError::Validation(_))
        ));
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_blocked_pairing_shows_pin_without_challenge() {
        let stub = StubTransport::new(|req, _| {
            if req.url.ends_with("/pairing/start") {
                Ok(HttpReply::ok(json!({"STATUS": {"RESULT": "BLOCKED"}})))
            } else {
                Ok(HttpReply::ok(json!({"STATUS": {"RESULT": "SUCCESS"}})))
            }
        });
        let client = client_with(stub.clone(), None);

        let challenge = client.initiate_pairing().await.unwrap();
        assert_eq!(challenge.challenge_code, None);
        // cancel, then start
        let urls: Vec<String> = stub.requests().into_iter().map(|r| r.url).collect();
        assert!(urls[0].ends_with("/pairing/cancel"));
        assert!(urls[1].ends_with("/pairing/start"));
    }

    #[tokio::test]
    async fn test_pairing_round_trip() {
        let stub = StubTransport::new(|req, _| {
            let body = if req.url.ends_with("/pairing/start") {
                json!({"STATUS": {"RESULT": "SUCCESS"},
                       "ITEM": {"PAIRING_REQ_TOKEN": 81, "CHALLENGE_TYPE": 1}})
            } else if req.url.ends_with("/pairing/pair") {
                let sent = req.body.as_ref().unwrap();
                assert_eq!(sent["PAIRING_REQ_TOKEN"], 81);
                assert_eq!(sent["RESPONSE_VALUE"], "1234");
                json!({"STATUS": {"RESULT": "SUCCESS"}, "ITEM": {"AUTH_TOKEN": "Zabc"}})
            } else if req.url.ends_with("/audio/volume") {
                assert_eq!(req.auth_token.as_deref(), Some("Zabc"));
                items(json!(10), 1)
            } else {
                json!({"STATUS": {"RESULT": "SUCCESS"}})
            };
            Ok(HttpReply::ok(body))
        });
        let client = client_with(stub, None);

        let challenge = client.initiate_pairing().await.unwrap();
        assert_eq!(challenge.challenge_code.as_deref(), Some("81"));

        let outcome = client.complete_pairing("1234").await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.auth_token.as_deref(), Some("Zabc"));
        assert_eq!(client.auth_token().as_deref(), Some("Zabc"));
    }

    #[tokio::test]
    async fn test_wrong_pin_classified() {
        let stub = StubTransport::new(|_, _| {
            Ok(HttpReply::ok(json!({"STATUS": {"RESULT": "CHALLENGE_INCORRECT"}})))
        });
        let client = client_with(stub, None);

        let err = client.complete_pairing("0000").await.unwrap_err();
        assert_eq!(err.code(), "INVALID_PIN");
    }

    #[tokio::test]
    async fn test_pairing_fails_when_token_does_not_verify() {
        let stub = StubTransport::new(|req, _| {
            if req.url.ends_with("/pairing/pair") {
                Ok(HttpReply::ok(
                    json!({"STATUS": {"RESULT": "SUCCESS"}, "ITEM": {"AUTH_TOKEN": "bad"}}),
                ))
            } else {
                Ok(HttpReply::status(403))
            }
        });
        let client = client_with(stub, None);

        let outcome = client.complete_pairing("1234").await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.auth_token, None);
        assert!(!client.has_auth_token());
    }

    #[tokio::test]
    async fn test_non_numeric_pin_never_sent() {
        let stub = StubTransport::new(|_, _| Ok(HttpReply::ok(Value::Null)));
        let client = client_with(stub.clone(), None);

        let err = client.complete_pairing("12a4").await.unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETER");
        assert_eq!(stub.calls(), 0);
    }

    #[test]
    fn test_classify_results() {
        assert_eq!(classify_pairing_result("INVALID_PIN"), PairingFailure::InvalidPin);
        assert_eq!(
            classify_pairing_result("invalid_parameter"),
            PairingFailure::InvalidParameter
        );
        assert!(matches!(
            classify_pairing_result("MAX_CHALLENGES_EXCEEDED"),
            PairingFailure::Other(_)
        ));
    }
}
