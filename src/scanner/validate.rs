//! Confirms that a host answering on a device port is actually the device.
//! Probes are read-only: they never change power, volume or input.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;

use crate::device::DiscoveryCandidate;
use crate::error::DeviceError;
use crate::protocol::denon::{DenonClient, DenonConfig, RESPONSE_PREFIXES};
use crate::protocol::{HttpTransport, VizioClient, VizioConfig};

const PROBE_DEVICE_ID: &str = "home-panel-probe";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub candidate: DiscoveryCandidate,
    pub valid: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl ValidationResult {
    fn valid(candidate: DiscoveryCandidate, started: Instant) -> Self {
        Self {
            response_time_ms: started.elapsed().as_millis() as u64,
            candidate,
            valid: true,
            error: None,
        }
    }

    fn invalid(candidate: DiscoveryCandidate, started: Instant, error: impl ToString) -> Self {
        Self {
            response_time_ms: started.elapsed().as_millis() as u64,
            candidate,
            valid: false,
            error: Some(error.to_string()),
        }
    }
}

#[async_trait]
pub trait DeviceProbe: Send + Sync {
    async fn validate(&self, candidate: &DiscoveryCandidate) -> ValidationResult;
}

/// Sends `PW?` and expects a recognisable status line back
pub struct AvrProbe {
    config: DenonConfig,
}

impl AvrProbe {
    pub fn new(config: DenonConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DeviceProbe for AvrProbe {
    async fn validate(&self, candidate: &DiscoveryCandidate) -> ValidationResult {
        let started = Instant::now();
        let client = DenonClient::with_config(
            &candidate.ip.to_string(),
            candidate.port,
            self.config.clone(),
        );

        match client.send_command("PW?").await {
            Ok(reply)
                if reply
                    .lines()
                    .any(|line| RESPONSE_PREFIXES.iter().any(|p| line.starts_with(p))) =>
            {
                ValidationResult::valid(candidate.clone(), started)
            }
            Ok(reply) => ValidationResult::invalid(
                candidate.clone(),
                started,
                format!("unexpected reply {:?}", reply.data.trim()),
            ),
            Err(e) => ValidationResult::invalid(candidate.clone(), started, e),
        }
    }
}

/// Reads unauthenticated SmartCast state, then one authenticated setting
/// when a token is known. A 401/403 still identifies a SmartCast set.
pub struct TvProbe {
    transport: Arc<dyn HttpTransport>,
    config: VizioConfig,
    auth_token: Option<String>,
}

impl TvProbe {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        config: VizioConfig,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            transport,
            config,
            auth_token,
        }
    }
}

#[async_trait]
impl DeviceProbe for TvProbe {
    async fn validate(&self, candidate: &DiscoveryCandidate) -> ValidationResult {
        let started = Instant::now();
        let client = VizioClient::new(
            candidate.ip.to_string(),
            candidate.port,
            self.transport.clone(),
            self.config.clone(),
            PROBE_DEVICE_ID,
        );
        let mut found = candidate.clone();

        match client.device_info().await {
            Ok(info) => found.device_info = info.or(found.device_info),
            Err(e) if e.is_auth() => {
                found.auth_required = Some(true);
                return ValidationResult::valid(found, started);
            }
            Err(_) => {
                if let Err(e) = client.power_state().await {
                    if !e.is_auth() {
                        return ValidationResult::invalid(found, started, e);
                    }
                    found.auth_required = Some(true);
                    return ValidationResult::valid(found, started);
                }
            }
        }

        found.auth_required = Some(match &self.auth_token {
            Some(token) => {
                client.set_auth_token(Some(token.clone()));
                matches!(client.volume().await, Err(DeviceError::Auth { .. }))
            }
            None => true,
        });
        ValidationResult::valid(found, started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::denon::tests::{fast_config, spawn_fake_avr};
    use crate::protocol::transport::HttpReply;
    use crate::protocol::transport::tests::StubTransport;
    use crate::protocol::vizio::tests::{fast_config as fast_tv_config, items};
    use serde_json::json;
    use std::collections::HashMap;

    fn local(port: u16) -> DiscoveryCandidate {
        DiscoveryCandidate::new("127.0.0.1".parse().unwrap(), port, 3)
    }

    #[tokio::test]
    async fn test_avr_probe_accepts_power_reply() {
        let (port, _) = spawn_fake_avr(HashMap::from([("PW?", "PWSTANDBY\r")])).await;
        let result = AvrProbe::new(fast_config()).validate(&local(port)).await;
        assert!(result.valid);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_avr_probe_rejects_other_services() {
        let (port, _) = spawn_fake_avr(HashMap::from([("PW?", "SSH-2.0-OpenSSH_9.6\r")])).await;
        let result = AvrProbe::new(fast_config()).validate(&local(port)).await;
        assert!(!result.valid);
    }

    #[tokio::test]
    async fn test_tv_probe_forbidden_means_auth_required() {
        let stub = StubTransport::new(|_, _| Ok(HttpReply::status(403)));
        let probe = TvProbe::new(stub, fast_tv_config(), None);
        let result = probe.validate(&local(7345)).await;
        assert!(result.valid);
        assert_eq!(result.candidate.auth_required, Some(true));
    }

    #[tokio::test]
    async fn test_tv_probe_with_working_token() {
        let stub = StubTransport::new(|req, _| {
            if req.url.ends_with("/deviceinfo") {
                Ok(HttpReply::ok(json!({
                    "STATUS": {"RESULT": "SUCCESS"},
                    "ITEMS": [{"VALUE": {"MODEL_NAME": "P65Q9-J01"}}]
                })))
            } else {
                Ok(HttpReply::ok(items(json!(12), 3)))
            }
        });
        let probe = TvProbe::new(stub.clone(), fast_tv_config(), Some("token".into()));
        let result = probe.validate(&local(7345)).await;

        assert!(result.valid);
        assert_eq!(result.candidate.auth_required, Some(false));
        assert_eq!(result.candidate.device_info.as_deref(), Some("P65Q9-J01"));
        // Only reads were issued
        assert!(stub.requests().iter().all(|r| r.method == reqwest::Method::GET));
    }

    #[tokio::test]
    async fn test_tv_probe_unreachable_is_invalid() {
        let stub = StubTransport::new(|_, _| Err(DeviceError::Transport("refused".into())));
        let probe = TvProbe::new(stub, fast_tv_config(), None);
        assert!(!probe.validate(&local(7345)).await.valid);
    }
}
