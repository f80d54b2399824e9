//! SmartCast TV service: connection tiers, status polling, command dispatch,
//! simulated mode and PIN pairing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use uuid::Uuid;

use super::{DeviceController, tcp_reachable};
use crate::db::ConnectionStore;
use crate::device::{
    ConnectionInfo, ConnectionState, ConnectionStatus, DeviceKind, DeviceStatus, RemoteKey,
    SimulationReason, TV_VOLUME_MAX, TvCommand, TvStatus,
};
use crate::error::{DeviceError, PairingFailure, Result};
use crate::protocol::{HttpTransport, PairingChallenge, PairingOutcome, VizioClient, VizioConfig};
use crate::pubsub::StatusPublisher;
use crate::scanner::Discovery;

const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct TvSettings {
    pub static_target: Option<ConnectionInfo>,
    pub poll_interval: Duration,
    pub client: VizioConfig,
}

enum TierOutcome {
    Connected(Arc<VizioClient>),
    /// Answers, but the credential is missing or refused
    NeedsPairing(Arc<VizioClient>),
    Unreachable,
}

/// Fold one field read into the next status; failures keep the cached value
fn merge<T>(field: &mut T, read: Result<T>, name: &str, auth_error: &mut Option<DeviceError>) {
    match read {
        Ok(value) => *field = value,
        Err(e) if e.is_auth() => {
            auth_error.get_or_insert(e);
        }
        Err(e) => tracing::debug!("Keeping cached TV {}: {}", name, e),
    }
}

/// Cache update a successful (or simulated) command implies
fn apply_command(status: &mut TvStatus, cmd: &TvCommand) {
    match cmd {
        TvCommand::PowerOn => status.is_powered_on = true,
        TvCommand::PowerOff => status.is_powered_on = false,
        TvCommand::PowerToggle => status.is_powered_on = !status.is_powered_on,
        TvCommand::VolumeUp => status.volume = status.volume.saturating_add(1).min(TV_VOLUME_MAX),
        TvCommand::VolumeDown => status.volume = status.volume.saturating_sub(1),
        TvCommand::SetVolume(v) => status.volume = (*v).min(TV_VOLUME_MAX),
        TvCommand::MuteOn => status.is_muted = true,
        TvCommand::MuteOff => status.is_muted = false,
        TvCommand::MuteToggle => status.is_muted = !status.is_muted,
        TvCommand::SetInput(name) => status.input = name.clone(),
        TvCommand::LaunchApp(name) => status.current_app = Some(name.clone()),
        TvCommand::SpeakersOn => status.speakers_enabled = true,
        TvCommand::SpeakersOff => status.speakers_enabled = false,
        TvCommand::NextInput
        | TvCommand::ChannelUp
        | TvCommand::ChannelDown
        | TvCommand::PreviousChannel
        | TvCommand::Key(_) => {}
    }
}

struct TvInner {
    transport: Arc<dyn HttpTransport>,
    store: Arc<dyn ConnectionStore>,
    publisher: StatusPublisher,
    discovery: Option<Arc<Discovery>>,
    settings: TvSettings,
    device_id: String,
    /// Set by a reset so the configured token is not silently reused
    static_token_revoked: AtomicBool,
    state: RwLock<ConnectionState>,
    status: RwLock<TvStatus>,
    client: RwLock<Option<Arc<VizioClient>>>,
    poll: Mutex<Option<JoinHandle<()>>>,
}

pub struct TvService {
    inner: Arc<TvInner>,
}

impl TvService {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn ConnectionStore>,
        publisher: StatusPublisher,
        discovery: Option<Arc<Discovery>>,
        settings: TvSettings,
    ) -> Self {
        Self {
            inner: Arc::new(TvInner {
                transport,
                store,
                publisher,
                discovery,
                settings,
                device_id: format!("home-panel-{}", Uuid::new_v4()),
                static_token_revoked: AtomicBool::new(false),
                state: RwLock::new(ConnectionState::Uninitialized),
                status: RwLock::new(TvStatus::powered_off()),
                client: RwLock::new(None),
                poll: Mutex::new(None),
            }),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    /// Ask the TV to show a pairing PIN
    pub async fn initiate_pairing(&self) -> Result<PairingChallenge> {
        let client = self.inner.pairing_client().await?;
        client.initiate_pairing().await
    }

    /// Submit the PIN; success persists the token and connects the service
    pub async fn complete_pairing(&self, pin: &str) -> Result<PairingOutcome> {
        let client = self.inner.pairing_client().await?;
        let outcome = client.complete_pairing(pin).await?;
        if outcome.success {
            self.inner.static_token_revoked.store(false, Ordering::SeqCst);
            self.inner.connected(client).await;
        }
        Ok(outcome)
    }

    /// Drop the credential everywhere and return to Uninitialized
    pub async fn reset(&self) {
        self.inner.reset().await;
    }
}

impl TvInner {
    async fn pairing_client(&self) -> Result<Arc<VizioClient>> {
        self.client.read().await.clone().ok_or_else(|| {
            DeviceError::Pairing(PairingFailure::Other("no TV address known".into()))
        })
    }

    async fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().await;
        if *state != next {
            tracing::info!("TV connection {} -> {}", state.label(), next.label());
        }
        *state = next;
    }

    /// Swap in a new status, publishing when it differs
    async fn replace_status(&self, next: TvStatus) -> bool {
        let next = next.canonical();
        let mut guard = self.status.write().await;
        let prev = std::mem::replace(&mut *guard, next.clone());
        self.publisher.publish_if_changed(&prev, &next)
    }

    async fn update_status(&self, f: impl FnOnce(&mut TvStatus)) -> bool {
        let mut guard = self.status.write().await;
        let prev = guard.clone();
        let mut next = prev.clone();
        f(&mut next);
        let next = next.canonical();
        *guard = next.clone();
        self.publisher.publish_if_changed(&prev, &next)
    }

    fn stop_polling(&self) {
        if let Some(handle) = self.poll.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    fn start_polling(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.settings.poll_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if !inner.state.read().await.is_connected() {
                    break;
                }
                inner.refresh_status(true).await;
            }
        });
        if let Some(old) = self
            .poll
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle)
        {
            old.abort();
        }
    }

    fn new_client(&self, info: &ConnectionInfo) -> Arc<VizioClient> {
        let client = VizioClient::new(
            info.ip.clone(),
            info.port,
            self.transport.clone(),
            self.settings.client.clone(),
            info.device_id.clone().unwrap_or_else(|| self.device_id.clone()),
        );
        client.set_auth_token(info.auth_token.clone());
        Arc::new(client)
    }

    async fn try_target(&self, tier: &str, info: &ConnectionInfo) -> TierOutcome {
        tracing::debug!("Trying {} TV address {}", tier, info.address());
        let client = self.new_client(info);

        if let Err(e) = client.power_state().await
            && !e.is_auth()
        {
            tracing::info!("TV at {} ({}) unreachable: {}", info.address(), tier, e);
            if let Err(e) = self.store.record_failure(DeviceKind::Tv, &info.ip, info.port) {
                tracing::warn!("Failed to record TV failure: {}", e);
            }
            return TierOutcome::Unreachable;
        }

        if !client.has_auth_token() {
            tracing::info!("TV at {} answers but is not paired", info.address());
            return TierOutcome::NeedsPairing(client);
        }

        match client.volume().await {
            Err(e) if e.is_auth() => {
                tracing::warn!("TV at {} refused the stored token", info.address());
                client.set_auth_token(None);
                TierOutcome::NeedsPairing(client)
            }
            _ => TierOutcome::Connected(client),
        }
    }

    async fn init(self: &Arc<Self>) -> ConnectionStatus {
        self.stop_polling();

        let stored = match self.store.get_active(DeviceKind::Tv) {
            Ok(stored) => stored.map(|s| s.info),
            Err(e) => {
                tracing::warn!("Failed to load persisted TV record: {}", e);
                None
            }
        };

        let mut targets = Vec::new();
        if let Some(info) = stored.clone() {
            targets.push(("persisted", info));
        }
        if let Some(mut info) = self.settings.static_target.clone() {
            if self.static_token_revoked.load(Ordering::SeqCst) {
                info.auth_token = None;
            }
            if let Some(stored) = stored.as_ref().filter(|s| s.ip == info.ip && s.port == info.port) {
                info.auth_token = info.auth_token.or_else(|| stored.auth_token.clone());
                info.device_id = stored.device_id.clone();
            }
            targets.push(("configured", info));
        }

        let mut pairing_target = None;
        for (tier, info) in &targets {
            match self.try_target(tier, info).await {
                TierOutcome::Connected(client) => {
                    self.connected(client).await;
                    return self.connection_status().await;
                }
                TierOutcome::NeedsPairing(client) => {
                    pairing_target.get_or_insert(client);
                }
                TierOutcome::Unreachable => {}
            }
        }

        if pairing_target.is_none()
            && let Some(discovery) = &self.discovery
            && let Some(best) = discovery.discover().await
        {
            let mut info = best.candidate.to_connection_info();
            info.auth_token = stored
                .as_ref()
                .and_then(|s| s.auth_token.clone())
                .or_else(|| {
                    self.settings
                        .static_target
                        .as_ref()
                        .filter(|_| !self.static_token_revoked.load(Ordering::SeqCst))
                        .and_then(|t| t.auth_token.clone())
                });
            match self.try_target("discovered", &info).await {
                TierOutcome::Connected(client) => {
                    self.connected(client).await;
                    return self.connection_status().await;
                }
                TierOutcome::NeedsPairing(client) => pairing_target = Some(client),
                TierOutcome::Unreachable => {}
            }
        }

        let reason = match pairing_target {
            Some(client) => {
                *self.client.write().await = Some(client);
                SimulationReason::AuthRequired
            }
            None => {
                *self.client.write().await = None;
                SimulationReason::NoDeviceFound
            }
        };
        tracing::warn!("TV running in simulation mode ({:?})", reason);
        self.set_state(ConnectionState::Simulated { reason }).await;
        self.connection_status().await
    }

    /// Adopt a client whose credential works: persist, refresh, poll
    async fn connected(self: &Arc<Self>, client: Arc<VizioClient>) {
        let info = ConnectionInfo {
            device_id: Some(client.device_id().to_string()),
            ..ConnectionInfo::new(client.ip(), client.port()).with_token(client.auth_token())
        };
        if let Err(e) = self.store.upsert(DeviceKind::Tv, &info) {
            tracing::warn!("Failed to persist TV connection: {}", e);
        }
        if let Err(e) = self.store.record_success(DeviceKind::Tv, &info.ip, info.port) {
            tracing::warn!("Failed to record TV success: {}", e);
        }

        *self.client.write().await = Some(client);
        self.set_state(ConnectionState::Connected).await;
        tracing::info!("Connected to TV at {}", info.address());
        self.refresh_status(true).await;
        if self.state.read().await.is_connected() {
            self.start_polling();
        }
    }

    async fn connected_client(&self) -> Option<Arc<VizioClient>> {
        if !self.state.read().await.is_connected() {
            return None;
        }
        self.client.read().await.clone()
    }

    /// A refused credential needs re-pairing, not retries
    async fn auth_rejected(&self, e: &DeviceError) {
        tracing::warn!("TV rejected credential ({}); switching to simulation mode", e);
        self.stop_polling();
        if let Some(client) = self.client.read().await.as_ref() {
            client.set_auth_token(None);
        }
        self.set_state(ConnectionState::Simulated {
            reason: SimulationReason::AuthRejected,
        })
        .await;
    }

    async fn refresh_status(&self, silent: bool) -> DeviceStatus {
        let Some(client) = self.connected_client().await else {
            return DeviceStatus::Tv(self.status.read().await.clone());
        };
        let previous = self.status.read().await.clone();

        let powered = match client.power_state().await {
            Ok(powered) => powered,
            Err(e) if e.is_auth() => {
                self.auth_rejected(&e).await;
                return DeviceStatus::Tv(previous);
            }
            Err(e) => {
                tracing::warn!("TV power read failed, keeping cached value: {}", e);
                previous.is_powered_on
            }
        };

        let next = if powered {
            let (volume, mute, input, channel, app, speakers) = tokio::join!(
                client.volume(),
                client.mute(),
                client.current_input(),
                client.channel(),
                client.current_app(),
                client.speakers()
            );
            let mut next = TvStatus {
                is_powered_on: true,
                ..previous.clone()
            };
            let mut auth_error = None;
            merge(&mut next.volume, volume.map(|v| v.value), "volume", &mut auth_error);
            merge(&mut next.is_muted, mute, "mute", &mut auth_error);
            merge(&mut next.input, input.map(|i| i.value), "input", &mut auth_error);
            merge(&mut next.channel, channel, "channel", &mut auth_error);
            merge(&mut next.current_app, app, "app", &mut auth_error);
            merge(&mut next.speakers_enabled, speakers, "speakers", &mut auth_error);
            if let Some(e) = auth_error {
                self.auth_rejected(&e).await;
                return DeviceStatus::Tv(previous);
            }
            next
        } else {
            TvStatus::powered_off()
        };

        if !self.replace_status(next).await && !silent {
            tracing::debug!("TV status unchanged");
        }
        DeviceStatus::Tv(self.status.read().await.clone())
    }

    async fn execute(&self, client: &VizioClient, cmd: &TvCommand) -> Result<()> {
        match cmd {
            TvCommand::PowerOn => client.send_key_press(RemoteKey::PowerOn).await.map(drop),
            TvCommand::PowerOff => client.send_key_press(RemoteKey::PowerOff).await.map(drop),
            TvCommand::PowerToggle => client.send_key_press(RemoteKey::PowerToggle).await.map(drop),
            TvCommand::VolumeUp => client.send_key_press(RemoteKey::VolumeUp).await.map(drop),
            TvCommand::VolumeDown => client.send_key_press(RemoteKey::VolumeDown).await.map(drop),
            TvCommand::SetVolume(v) => client.set_volume(*v).await,
            TvCommand::MuteOn => client.send_key_press(RemoteKey::MuteOn).await.map(drop),
            TvCommand::MuteOff => client.send_key_press(RemoteKey::MuteOff).await.map(drop),
            TvCommand::MuteToggle => client.send_key_press(RemoteKey::MuteToggle).await.map(drop),
            TvCommand::SetInput(name) => client.set_input(name).await,
            TvCommand::NextInput => client.send_key_press(RemoteKey::InputNext).await.map(drop),
            TvCommand::ChannelUp => client.send_key_press(RemoteKey::ChannelUp).await.map(drop),
            TvCommand::ChannelDown => client.send_key_press(RemoteKey::ChannelDown).await.map(drop),
            TvCommand::PreviousChannel => {
                client.send_key_press(RemoteKey::ChannelPrevious).await.map(drop)
            }
            TvCommand::LaunchApp(name) => client.launch_app(name).await,
            TvCommand::SpeakersOn => client.set_speakers(true).await,
            TvCommand::SpeakersOff => client.set_speakers(false).await,
            TvCommand::Key(key) => client.send_key_press(*key).await.map(drop),
        }
    }

    /// Fields a key press changed in a way only the TV knows
    async fn read_back(&self, client: &VizioClient, cmd: &TvCommand) {
        match cmd {
            TvCommand::NextInput => {
                if let Ok(input) = client.current_input().await {
                    self.update_status(|s| s.input = input.value).await;
                }
            }
            TvCommand::ChannelUp | TvCommand::ChannelDown | TvCommand::PreviousChannel => {
                if let Ok(channel) = client.channel().await {
                    self.update_status(|s| s.channel = channel).await;
                }
            }
            _ => {}
        }
    }

    async fn send_command(&self, command: &str, value: Option<&str>) -> bool {
        let cmd = match TvCommand::parse(command, value) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::warn!("Rejected TV command {}: {}", command, e);
                self.publisher.publish_error("tv", &e.to_string());
                return false;
            }
        };

        if cmd.requires_power() && !self.status.read().await.is_powered_on {
            tracing::debug!("Ignoring {:?}: TV is off", cmd);
            return false;
        }

        let state = *self.state.read().await;
        match state {
            ConnectionState::Simulated { .. } => {
                self.update_status(|s| apply_command(s, &cmd)).await;
                true
            }
            ConnectionState::Connected => {
                let Some(client) = self.client.read().await.clone() else {
                    return false;
                };
                match self.execute(&client, &cmd).await {
                    Ok(()) => {
                        self.update_status(|s| apply_command(s, &cmd)).await;
                        self.read_back(&client, &cmd).await;
                        true
                    }
                    Err(e) => {
                        if e.is_auth() {
                            self.auth_rejected(&e).await;
                        }
                        tracing::warn!("TV command {:?} failed: {}", cmd, e);
                        self.publisher
                            .publish_error("tv", &format!("{:?} failed: {}", cmd, e));
                        false
                    }
                }
            }
            ConnectionState::Uninitialized | ConnectionState::Resetting => {
                tracing::debug!("TV not initialised; dropping {:?}", cmd);
                false
            }
        }
    }

    async fn connection_status(&self) -> ConnectionStatus {
        let state = *self.state.read().await;
        let client = self.client.read().await.clone();
        ConnectionStatus {
            device: DeviceKind::Tv,
            state,
            simulation_mode: state.is_simulated(),
            is_connected: state.is_connected(),
            has_valid_credential: Some(
                state.is_connected() && client.as_ref().is_some_and(|c| c.has_auth_token()),
            ),
            monitoring: None,
            ip: client.as_ref().map(|c| c.ip().to_string()),
            port: client.as_ref().map(|c| c.port()),
        }
    }

    async fn reset(&self) {
        self.set_state(ConnectionState::Resetting).await;
        self.stop_polling();
        self.static_token_revoked.store(true, Ordering::SeqCst);

        let client = self.client.write().await.take();
        if let Some(client) = client {
            if let Err(e) = client.cancel_pairing().await {
                tracing::debug!("Cancel pairing during reset failed: {}", e);
            }
            client.set_auth_token(None);
        }
        if let Err(e) = self.store.clear_token(DeviceKind::Tv) {
            tracing::warn!("Failed to erase persisted TV token: {}", e);
        }
        self.set_state(ConnectionState::Uninitialized).await;
    }
}

#[async_trait]
impl DeviceController for TvService {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Tv
    }

    async fn init(&self) -> ConnectionStatus {
        self.inner.init().await
    }

    async fn current_status(&self) -> DeviceStatus {
        DeviceStatus::Tv(self.inner.status.read().await.clone())
    }

    async fn connection_status(&self) -> ConnectionStatus {
        self.inner.connection_status().await
    }

    async fn send_command(&self, command: &str, value: Option<&str>) -> bool {
        self.inner.send_command(command, value).await
    }

    async fn refresh_status(&self, silent: bool) -> DeviceStatus {
        self.inner.refresh_status(silent).await
    }

    async fn is_reachable(&self) -> bool {
        let target = self
            .inner
            .client
            .read()
            .await
            .as_ref()
            .map(|c| (c.ip().to_string(), c.port()));
        match target {
            Some((ip, port)) => tcp_reachable(&ip, port, REACHABILITY_TIMEOUT).await,
            None => false,
        }
    }

    async fn cleanup(&self) {
        self.inner.stop_polling();
    }
}
