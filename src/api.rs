//! Operations exposed to the outer query layer. Thin: validates input, tags
//! errors with a stable code and delegates to the device services.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::device::{ConnectionStatus, DeviceKind, DeviceStatus};
use crate::error::DeviceError;
use crate::protocol::{PairingChallenge, PairingOutcome};
use crate::pubsub::ERROR_LOG_CHANNEL;
use crate::service::{Controllers, DeviceController};

const MAX_COMMAND_LEN: usize = 64;
const MAX_VALUE_LEN: usize = 128;
const MAX_PIN_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: "INVALID_INPUT",
            message: message.into(),
        }
    }
}

impl From<DeviceError> for ApiError {
    fn from(e: DeviceError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    pub device: DeviceKind,
    pub command: String,
    pub success: bool,
}

#[derive(Clone)]
pub struct Api {
    controllers: Controllers,
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), ApiError> {
    if value.chars().count() > max {
        return Err(ApiError::invalid(format!(
            "{} longer than {} characters",
            field, max
        )));
    }
    Ok(())
}

impl Api {
    pub fn new(controllers: Controllers) -> Self {
        Self { controllers }
    }

    pub fn controllers(&self) -> &Controllers {
        &self.controllers
    }

    pub async fn current_status(&self, kind: DeviceKind) -> DeviceStatus {
        self.controllers.get(kind).current_status().await
    }

    pub async fn connection_status(&self, kind: DeviceKind) -> ConnectionStatus {
        self.controllers.get(kind).connection_status().await
    }

    pub async fn reachable(&self, kind: DeviceKind) -> bool {
        self.controllers.get(kind).is_reachable().await
    }

    pub async fn send_command(
        &self,
        kind: DeviceKind,
        command: &str,
        value: Option<&str>,
    ) -> Result<CommandResponse, ApiError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(ApiError::invalid("command is empty"));
        }
        check_len("command", command, MAX_COMMAND_LEN)?;
        if let Some(value) = value {
            check_len("value", value, MAX_VALUE_LEN)?;
        }

        let success = self.controllers.get(kind).send_command(command, value).await;
        Ok(CommandResponse {
            device: kind,
            command: command.to_string(),
            success,
        })
    }

    pub async fn initiate_pairing(&self) -> Result<PairingChallenge, ApiError> {
        Ok(self.controllers.tv.initiate_pairing().await?)
    }

    pub async fn complete_pairing(&self, pin: &str) -> Result<PairingOutcome, ApiError> {
        let pin = pin.trim();
        if pin.is_empty() {
            return Err(ApiError::invalid("PIN is empty"));
        }
        check_len("PIN", pin, MAX_PIN_LEN)?;
        Ok(self.controllers.tv.complete_pairing(pin).await?)
    }

    /// Forget the TV credential and walk the connection tiers again
    pub async fn reset_connection(&self) -> ConnectionStatus {
        self.controllers.tv.reset().await;
        self.controllers.tv.init().await
    }

    /// Full-status messages for one device, in publish order
    pub fn subscribe_status(&self, kind: DeviceKind) -> broadcast::Receiver<Value> {
        self.controllers.hub.subscribe(kind.status_channel())
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<Value> {
        self.controllers.hub.subscribe(ERROR_LOG_CHANNEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::device::ConnectionInfo;
    use crate::protocol::denon::tests::fast_config as denon_config;
    use crate::protocol::transport::HttpReply;
    use crate::protocol::transport::tests::StubTransport;
    use crate::protocol::vizio::tests::fast_config as vizio_config;
    use crate::pubsub::{Hub, StatusPublisher};
    use crate::service::{AvrService, AvrSettings, TvService, TvSettings};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    /// TV reachable at 10.0.0.5 that rejects every authenticated call
    fn api() -> Api {
        let hub = Arc::new(Hub::new());
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let transport = StubTransport::new(|req, _| {
            let url = req.url.as_str();
            if url.ends_with("/power_mode") {
                return Ok(HttpReply::ok(json!({
                    "STATUS": {"RESULT": "SUCCESS"},
                    "ITEMS": [{"VALUE": 1, "HASHVAL": 0}]
                })));
            }
            if url.ends_with("/pairing/start") {
                return Ok(HttpReply::ok(json!({
                    "STATUS": {"RESULT": "SUCCESS"},
                    "ITEM": {"PAIRING_REQ_TOKEN": 9, "CHALLENGE_TYPE": 1}
                })));
            }
            if url.ends_with("/pairing/pair") {
                return Ok(HttpReply::ok(json!({"STATUS": {"RESULT": "INVALID_PIN"}})));
            }
            if url.ends_with("/pairing/cancel") {
                return Ok(HttpReply::ok(json!({"STATUS": {"RESULT": "SUCCESS"}})));
            }
            Ok(HttpReply::status(403))
        });
        let tv = TvService::new(
            transport,
            store.clone(),
            StatusPublisher::new(hub.clone(), DeviceKind::Tv.status_channel()),
            None,
            TvSettings {
                static_target: Some(ConnectionInfo::new("10.0.0.5", 7345)),
                poll_interval: Duration::from_secs(3600),
                client: vizio_config(),
            },
        );
        let avr = AvrService::new(
            store,
            StatusPublisher::new(hub.clone(), DeviceKind::Avr.status_channel()),
            None,
            AvrSettings {
                static_target: None,
                poll_interval: Duration::from_secs(3600),
                client: denon_config(),
                monitor: false,
            },
        );
        Api::new(Controllers::new(Arc::new(tv), Arc::new(avr), hub))
    }

    #[tokio::test]
    async fn test_command_input_validation() {
        let api = api();
        let err = api.send_command(DeviceKind::Avr, "  ", None).await.unwrap_err();
        assert_eq!(err.code, "INVALID_INPUT");

        let long = "X".repeat(MAX_COMMAND_LEN + 1);
        let err = api.send_command(DeviceKind::Avr, &long, None).await.unwrap_err();
        assert_eq!(err.code, "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_simulated_receiver_commands() {
        let api = api();
        api.controllers().init_all().await;

        let mut rx = api.subscribe_status(DeviceKind::Avr);
        let response = api.send_command(DeviceKind::Avr, "POWER_ON", None).await.unwrap();
        assert!(response.success);
        assert_eq!(rx.recv().await.unwrap()["is_powered_on"], true);

        let response = api.send_command(DeviceKind::Avr, "FLY", None).await.unwrap();
        assert!(!response.success);
        assert!(!api.reachable(DeviceKind::Avr).await);
    }

    #[tokio::test]
    async fn test_pairing_error_codes() {
        let api = api();
        let status = api.connection_status(DeviceKind::Tv).await;
        assert!(!status.is_connected);

        api.controllers().tv.init().await;
        let status = api.connection_status(DeviceKind::Tv).await;
        assert!(status.simulation_mode);
        assert_eq!(status.has_valid_credential, Some(false));

        let challenge = api.initiate_pairing().await.unwrap();
        assert_eq!(challenge.challenge_code.as_deref(), Some("9"));

        let err = api.complete_pairing("1234").await.unwrap_err();
        assert_eq!(err.code, "INVALID_PIN");

        let err = api.complete_pairing("").await.unwrap_err();
        assert_eq!(err.code, "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_reset_reinitialises_tv() {
        let api = api();
        api.controllers().tv.init().await;
        let status = api.reset_connection().await;
        assert!(status.simulation_mode);
        assert_eq!(status.ip.as_deref(), Some("10.0.0.5"));
    }
}
