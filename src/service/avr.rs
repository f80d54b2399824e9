//! Denon receiver service. Status arrives from the monitor connection while
//! it is up; polling covers the gaps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use super::DeviceController;
use crate::db::ConnectionStore;
use crate::device::{
    AVR_VOLUME_MAX, AvrCommand, AvrStatus, ConnectionInfo, ConnectionState, ConnectionStatus,
    DeviceKind, DeviceStatus, SimulationReason,
};
use crate::error::Result;
use crate::protocol::denon::{encode_volume, mute_command, power_command, round_volume};
use crate::protocol::{AvrChange, DenonClient, DenonConfig, DenonMonitor, MonitorEvent};
use crate::pubsub::StatusPublisher;
use crate::scanner::Discovery;

/// Receiver volume moves in half-decibel steps
const VOLUME_STEP: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct AvrSettings {
    pub static_target: Option<ConnectionInfo>,
    pub poll_interval: Duration,
    pub client: DenonConfig,
    /// Keep the long-lived monitor connection open while connected
    pub monitor: bool,
}

fn merge<T>(field: &mut T, read: Result<T>, name: &str) {
    match read {
        Ok(value) => *field = value,
        Err(e) => tracing::debug!("Keeping cached receiver {}: {}", name, e),
    }
}

/// Telnet line for a command; toggles must be resolved first
fn wire_command(cmd: &AvrCommand) -> Option<String> {
    let line = match cmd {
        AvrCommand::PowerOn => power_command(true).to_string(),
        AvrCommand::PowerOff => power_command(false).to_string(),
        AvrCommand::VolumeUp => "MVUP".to_string(),
        AvrCommand::VolumeDown => "MVDOWN".to_string(),
        AvrCommand::SetVolume(v) => encode_volume(*v),
        AvrCommand::MuteOn => mute_command(true).to_string(),
        AvrCommand::MuteOff => mute_command(false).to_string(),
        AvrCommand::SelectInput(source) => format!("SI{}", source),
        AvrCommand::SetSoundMode(mode) => format!("MS{}", mode),
        AvrCommand::PowerToggle | AvrCommand::MuteToggle => return None,
    };
    Some(line)
}

fn apply_command(status: &mut AvrStatus, cmd: &AvrCommand) {
    match cmd {
        AvrCommand::PowerOn => status.is_powered_on = true,
        AvrCommand::PowerOff => status.is_powered_on = false,
        AvrCommand::PowerToggle => status.is_powered_on = !status.is_powered_on,
        AvrCommand::VolumeUp => {
            status.volume = round_volume((status.volume + VOLUME_STEP).min(AVR_VOLUME_MAX))
        }
        AvrCommand::VolumeDown => status.volume = round_volume(status.volume - VOLUME_STEP),
        AvrCommand::SetVolume(v) => status.volume = round_volume(*v),
        AvrCommand::MuteOn => status.is_muted = true,
        AvrCommand::MuteOff => status.is_muted = false,
        AvrCommand::MuteToggle => status.is_muted = !status.is_muted,
        AvrCommand::SelectInput(source) => status.input = source.clone(),
        AvrCommand::SetSoundMode(mode) => status.sound_mode = mode.clone(),
    }
}

struct AvrInner {
    store: Arc<dyn ConnectionStore>,
    publisher: StatusPublisher,
    discovery: Option<Arc<Discovery>>,
    settings: AvrSettings,
    state: RwLock<ConnectionState>,
    status: RwLock<AvrStatus>,
    client: RwLock<Option<Arc<DenonClient>>>,
    /// True while the monitor connection is up and owns the status fields
    monitoring: AtomicBool,
    monitor: Mutex<Option<DenonMonitor>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct AvrService {
    inner: Arc<AvrInner>,
}

impl AvrService {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        publisher: StatusPublisher,
        discovery: Option<Arc<Discovery>>,
        settings: AvrSettings,
    ) -> Self {
        Self {
            inner: Arc::new(AvrInner {
                store,
                publisher,
                discovery,
                settings,
                state: RwLock::new(ConnectionState::Uninitialized),
                status: RwLock::new(AvrStatus::powered_off()),
                client: RwLock::new(None),
                monitoring: AtomicBool::new(false),
                monitor: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner.monitoring.load(Ordering::SeqCst)
    }
}

impl AvrInner {
    async fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().await;
        if *state != next {
            tracing::info!("Receiver connection {} -> {}", state.label(), next.label());
        }
        *state = next;
    }

    async fn update_status(&self, f: impl FnOnce(&mut AvrStatus)) -> bool {
        let mut guard = self.status.write().await;
        let prev = guard.clone();
        let mut next = prev.clone();
        f(&mut next);
        let next = next.canonical();
        *guard = next.clone();
        self.publisher.publish_if_changed(&prev, &next)
    }

    fn stop_tasks(&self) {
        self.monitoring.store(false, Ordering::SeqCst);
        if let Some(monitor) = self.monitor.lock().unwrap_or_else(|e| e.into_inner()).take() {
            monitor.stop();
        }
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    fn start_polling(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.settings.poll_interval;
        self.track(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.monitoring.load(Ordering::SeqCst) {
                    tracing::trace!("Monitor active; skipping receiver poll");
                    continue;
                }
                inner.refresh_status(true).await;
            }
        }));
    }

    fn start_monitor(self: &Arc<Self>, client: &DenonClient) {
        let (monitor, events) =
            DenonMonitor::spawn(client.address().to_string(), self.settings.client.clone());
        if let Some(old) = self
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(monitor)
        {
            old.stop();
        }
        self.track(tokio::spawn(consume_events(Arc::downgrade(self), events)));
    }

    async fn apply_change(&self, change: AvrChange) {
        if self.update_status(|s| {
            change.apply(s);
        })
        .await
        {
            tracing::debug!("Receiver {} updated from monitor", change.field());
        }
    }

    async fn try_target(&self, tier: &str, info: &ConnectionInfo) -> Option<Arc<DenonClient>> {
        tracing::debug!("Trying {} receiver address {}", tier, info.address());
        let client = DenonClient::with_config(&info.ip, info.port, self.settings.client.clone());
        match client.power().await {
            Ok(_) => Some(Arc::new(client)),
            Err(e) => {
                tracing::info!("Receiver at {} ({}) unreachable: {}", info.address(), tier, e);
                if let Err(e) = self.store.record_failure(DeviceKind::Avr, &info.ip, info.port) {
                    tracing::warn!("Failed to record receiver failure: {}", e);
                }
                None
            }
        }
    }

    async fn init(self: &Arc<Self>) -> ConnectionStatus {
        self.stop_tasks();

        let mut targets = Vec::new();
        match self.store.get_active(DeviceKind::Avr) {
            Ok(Some(stored)) => targets.push(("persisted", stored.info)),
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to load persisted receiver record: {}", e),
        }
        if let Some(info) = self.settings.static_target.clone() {
            targets.push(("configured", info));
        }

        for (tier, info) in &targets {
            if let Some(client) = self.try_target(tier, info).await {
                self.connected(info, client).await;
                return self.connection_status().await;
            }
        }

        if let Some(discovery) = &self.discovery
            && let Some(best) = discovery.discover().await
        {
            let info = best.candidate.to_connection_info();
            if let Some(client) = self.try_target("discovered", &info).await {
                self.connected(&info, client).await;
                return self.connection_status().await;
            }
        }

        *self.client.write().await = None;
        tracing::warn!("No receiver found; running in simulation mode");
        self.set_state(ConnectionState::Simulated {
            reason: SimulationReason::NoDeviceFound,
        })
        .await;
        self.connection_status().await
    }

    async fn connected(self: &Arc<Self>, info: &ConnectionInfo, client: Arc<DenonClient>) {
        if let Err(e) = self.store.upsert(DeviceKind::Avr, info) {
            tracing::warn!("Failed to persist receiver connection: {}", e);
        }
        if let Err(e) = self.store.record_success(DeviceKind::Avr, &info.ip, info.port) {
            tracing::warn!("Failed to record receiver success: {}", e);
        }

        *self.client.write().await = Some(client.clone());
        self.set_state(ConnectionState::Connected).await;
        tracing::info!("Connected to receiver at {}", info.address());

        self.refresh_status(true).await;
        if self.settings.monitor {
            self.start_monitor(&client);
        }
        self.start_polling();
    }

    async fn connected_client(&self) -> Option<Arc<DenonClient>> {
        if !self.state.read().await.is_connected() {
            return None;
        }
        self.client.read().await.clone()
    }

    async fn refresh_status(&self, silent: bool) -> DeviceStatus {
        let Some(client) = self.connected_client().await else {
            return DeviceStatus::Avr(self.status.read().await.clone());
        };
        let previous = self.status.read().await.clone();

        let powered = match client.power().await {
            // A single standby reading right after "on" is re-checked once
            Ok(false) if previous.is_powered_on => match client.power().await {
                Ok(powered) => powered,
                Err(e) => {
                    tracing::debug!("Receiver power re-check failed: {}", e);
                    true
                }
            },
            Ok(powered) => powered,
            Err(e) => {
                tracing::warn!("Receiver power read failed, keeping cached value: {}", e);
                previous.is_powered_on
            }
        };

        let next = if powered {
            let (volume, mute, input, sound_mode) = tokio::join!(
                client.volume(),
                client.mute(),
                client.input(),
                client.sound_mode()
            );
            let mut next = AvrStatus {
                is_powered_on: true,
                ..previous
            };
            merge(&mut next.volume, volume, "volume");
            merge(&mut next.is_muted, mute, "mute");
            merge(&mut next.input, input, "input");
            merge(&mut next.sound_mode, sound_mode, "sound mode");
            next
        } else {
            AvrStatus::powered_off()
        };

        if !self.update_status(|s| *s = next).await && !silent {
            tracing::debug!("Receiver status unchanged");
        }
        DeviceStatus::Avr(self.status.read().await.clone())
    }

    async fn send_command(&self, command: &str, value: Option<&str>) -> bool {
        let cmd = match AvrCommand::parse(command, value) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::warn!("Rejected receiver command {}: {}", command, e);
                self.publisher.publish_error("avr", &e.to_string());
                return false;
            }
        };

        let current = self.status.read().await.clone();
        if cmd.requires_power() && !current.is_powered_on {
            tracing::debug!("Ignoring {:?}: receiver is off", cmd);
            return false;
        }
        let cmd = cmd.resolve(&current);

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
                let Some(line) = wire_command(&cmd) else {
                    tracing::warn!("Unresolved receiver command {:?}", cmd);
                    return false;
                };
                match client.send_command(&line).await {
                    Ok(reply) if reply.success => {
                        // The monitor sees the echo and owns the fields while it runs
                        if !self.monitoring.load(Ordering::SeqCst) {
                            let changes = reply.changes();
                            self.update_status(|s| {
                                if changes.is_empty() {
                                    apply_command(s, &cmd);
                                } else {
                                    for change in &changes {
                                        change.apply(s);
                                    }
                                }
                            })
                            .await;
                        }
                        true
                    }
                    Ok(_) => {
                        tracing::warn!("Receiver gave no response to {}", line);
                        self.publisher
                            .publish_error("avr", &format!("no response to {}", line));
                        false
                    }
                    Err(e) => {
                        tracing::warn!("Receiver command {} failed: {}", line, e);
                        self.publisher
                            .publish_error("avr", &format!("{} failed: {}", line, e));
                        false
                    }
                }
            }
            ConnectionState::Uninitialized | ConnectionState::Resetting => {
                tracing::debug!("Receiver not initialised; dropping {:?}", cmd);
                false
            }
        }
    }

    async fn connection_status(&self) -> ConnectionStatus {
        let state = *self.state.read().await;
        let client = self.client.read().await.clone();
        let (ip, port) = client
            .as_ref()
            .and_then(|c| c.address().rsplit_once(':'))
            .map(|(ip, port)| (Some(ip.to_string()), port.parse().ok()))
            .unwrap_or((None, None));
        ConnectionStatus {
            device: DeviceKind::Avr,
            state,
            simulation_mode: state.is_simulated(),
            is_connected: state.is_connected(),
            has_valid_credential: None,
            monitoring: Some(self.monitoring.load(Ordering::SeqCst)),
            ip,
            port,
        }
    }
}

/// Single consumer of monitor events, applied in arrival order
async fn consume_events(weak: Weak<AvrInner>, mut events: mpsc::Receiver<MonitorEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        match event {
            MonitorEvent::Connected => {
                inner.monitoring.store(true, Ordering::SeqCst);
            }
            MonitorEvent::Change(change) => inner.apply_change(change).await,
            MonitorEvent::Reconnecting { attempt, delay } => {
                inner.monitoring.store(false, Ordering::SeqCst);
                tracing::info!("Receiver monitor reconnecting in {:?} (attempt {})", delay, attempt);
            }
            MonitorEvent::Disconnected => {
                inner.monitoring.store(false, Ordering::SeqCst);
                tracing::warn!("Receiver monitor gave up; relying on polling");
            }
        }
    }
}

#[async_trait]
impl DeviceController for AvrService {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Avr
    }

    async fn init(&self) -> ConnectionStatus {
        self.inner.init().await
    }

    async fn current_status(&self) -> DeviceStatus {
        DeviceStatus::Avr(self.inner.status.read().await.clone())
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
        let client = self.inner.client.read().await.clone();
        match client {
            Some(client) => client.is_reachable().await,
            None => false,
        }
    }

    async fn cleanup(&self) {
        self.inner.stop_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::device::DiscoveryCandidate;
    use crate::protocol::denon::tests::{fast_config, spawn_fake_avr};
    use crate::pubsub::Hub;
    use crate::scanner::discovery::tests::{EchoProbe, FixedScanner};
    use std::collections::{HashMap, VecDeque};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};

    fn receiver_replies(power: &'static str) -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("PW?", power),
            ("MV?", "MV40\rMVMAX 98\r"),
            ("MU?", "MUOFF\r"),
            ("SI?", "SITV\r"),
            ("MS?", "MSSTEREO\r"),
            ("MV505", "MV505\r"),
            ("MVUP", "MV405\r"),
            ("SIGAME", "SIGAME\r"),
            ("PWSTANDBY", "PWSTANDBY\r"),
        ])
    }

    fn service(port: Option<u16>, monitor: bool) -> (AvrService, Arc<Hub>, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let (service, hub) = service_with(store.clone(), port, monitor, None);
        (service, hub, store)
    }

    fn service_with(
        store: Arc<SqliteStore>,
        port: Option<u16>,
        monitor: bool,
        discovery: Option<Arc<Discovery>>,
    ) -> (AvrService, Arc<Hub>) {
        let hub = Arc::new(Hub::new());
        let service = AvrService::new(
            store,
            StatusPublisher::new(hub.clone(), DeviceKind::Avr.status_channel()),
            discovery,
            AvrSettings {
                static_target: port.map(|p| ConnectionInfo::new("127.0.0.1", p)),
                poll_interval: Duration::from_secs(3600),
                client: fast_config(),
                monitor,
            },
        );
        (service, hub)
    }

    /// Port nothing listens on
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Receiver that keeps every connection open and answers each line.
    /// `PW?` answers are taken from `power` in order, the last one repeating.
    /// With `cycle`, a `MU?` that is not the first line of its connection
    /// (only the monitor sends several) is followed once by a standby and
    /// power-on, after which the volume reads 50.5.
    struct ScriptedAvr {
        power: Mutex<VecDeque<&'static str>>,
        cycle: bool,
        cycled: AtomicBool,
    }

    impl ScriptedAvr {
        fn new(power: &[&'static str], cycle: bool) -> Self {
            Self {
                power: Mutex::new(power.iter().copied().collect()),
                cycle,
                cycled: AtomicBool::new(false),
            }
        }

        fn reply(&self, cmd: &str, line_no: usize) -> String {
            match cmd {
                "PW?" => {
                    let mut power = self.power.lock().unwrap();
                    if power.len() > 1 {
                        power.pop_front().unwrap().to_string()
                    } else {
                        power.front().copied().unwrap_or("PWON\r").to_string()
                    }
                }
                "MV?" if self.cycled.load(Ordering::SeqCst) => "MV505\r".to_string(),
                "MU?" if self.cycle && line_no > 0 && !self.cycled.swap(true, Ordering::SeqCst) => {
                    "MUOFF\rPWSTANDBY\rPWON\rMV505\r".to_string()
                }
                other => receiver_replies("PWON\r")
                    .get(other)
                    .copied()
                    .unwrap_or_default()
                    .to_string(),
            }
        }
    }

    async fn spawn_scripted_avr(script: ScriptedAvr) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let script = Arc::new(script);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let script = script.clone();
                tokio::spawn(async move {
                    let (reader, mut writer) = stream.into_split();
                    let mut reader = BufReader::new(reader);
                    let mut buf = Vec::new();
                    let mut line_no = 0;
                    loop {
                        buf.clear();
                        if reader.read_until(b'\r', &mut buf).await.unwrap_or(0) == 0 {
                            break;
                        }
                        let cmd = String::from_utf8_lossy(&buf).trim().to_string();
                        let reply = script.reply(&cmd, line_no);
                        line_no += 1;
                        if !reply.is_empty() && writer.write_all(reply.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    async fn wait_for_status(service: &AvrService, expected: &AvrStatus) -> bool {
        timeout(Duration::from_secs(2), async {
            while avr_status(service).await != *expected {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    async fn avr_status(service: &AvrService) -> AvrStatus {
        match service.current_status().await {
            DeviceStatus::Avr(status) => status,
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_init_reads_full_status() {
        let (port, _) = spawn_fake_avr(receiver_replies("PWON\r")).await;
        let (service, _hub, store) = service(Some(port), false);

        let status = service.init().await;
        assert!(status.is_connected);
        assert_eq!(status.port, Some(port));

        let avr = avr_status(&service).await;
        assert!(avr.is_powered_on);
        assert_eq!(avr.volume, 40.0);
        assert_eq!(avr.input, "TV");
        assert_eq!(avr.sound_mode, "STEREO");

        let stored = store.get_active(DeviceKind::Avr).unwrap().unwrap();
        assert_eq!(stored.info.port, port);
        assert_eq!(stored.failure_count, 0);
        service.cleanup().await;
    }

    #[tokio::test]
    async fn test_set_volume_applies_echo() {
        let (port, _) = spawn_fake_avr(receiver_replies("PWON\r")).await;
        let (service, _hub, _store) = service(Some(port), false);
        assert!(service.init().await.is_connected);

        assert!(service.send_command("SET_VOLUME", Some("50.5")).await);
        assert_eq!(avr_status(&service).await.volume, 50.5);

        assert!(service.send_command("input", Some("game")).await);
        assert_eq!(avr_status(&service).await.input, "GAME");
        service.cleanup().await;
    }

    #[tokio::test]
    async fn test_volume_up_while_off_is_refused() {
        let (port, connections) = spawn_fake_avr(receiver_replies("PWSTANDBY\r")).await;
        let (service, _hub, _store) = service(Some(port), false);
        assert!(service.init().await.is_connected);

        let before = connections.load(Ordering::SeqCst);
        assert!(!service.send_command("VOLUME_UP", None).await);
        assert_eq!(connections.load(Ordering::SeqCst), before);
        assert_eq!(avr_status(&service).await, AvrStatus::powered_off());
        service.cleanup().await;
    }

    #[tokio::test]
    async fn test_off_refresh_is_canonical() {
        let (port, _) = spawn_fake_avr(receiver_replies("PWSTANDBY\r")).await;
        let (service, _hub, _store) = service(Some(port), false);
        service.init().await;
        service
            .inner
            .update_status(|s| {
                s.is_powered_on = true;
                s.volume = 70.0;
                s.is_muted = true;
            })
            .await;

        // Standby is re-checked once, then trusted
        let status = service.refresh_status(true).await;
        assert_eq!(status, DeviceStatus::Avr(AvrStatus::powered_off()));
        service.cleanup().await;
    }

    #[tokio::test]
    async fn test_repeated_refresh_publishes_once() {
        let (port, _) = spawn_fake_avr(receiver_replies("PWON\r")).await;
        let (service, hub, _store) = service(Some(port), false);
        service.init().await;

        let mut rx = hub.subscribe(DeviceKind::Avr.status_channel());
        service.inner.update_status(|s| s.volume = 10.0).await;
        let first = service.refresh_status(false).await;
        let second = service.refresh_status(false).await;
        assert_eq!(first, second);

        assert_eq!(rx.recv().await.unwrap()["volume"], 10.0);
        assert_eq!(rx.recv().await.unwrap()["volume"], 40.0);
        assert!(rx.try_recv().is_err());
        service.cleanup().await;
    }

    #[tokio::test]
    async fn test_monitor_changes_reach_cache() {
        let (port, _) = spawn_fake_avr(receiver_replies("PWON\rMV455\r")).await;
        let (service, _hub, _store) = service(Some(port), true);
        assert!(service.init().await.is_connected);

        let updated = timeout(Duration::from_secs(2), async {
            loop {
                if avr_status(&service).await.volume == 45.5 {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(updated.is_ok());
        service.cleanup().await;
        assert!(!service.is_monitoring());
    }

    #[tokio::test]
    async fn test_monitor_restores_status_after_power_cycle() {
        let port = spawn_scripted_avr(ScriptedAvr::new(&["PWON\r"], true)).await;
        let (service, _hub, _store) = service(Some(port), true);
        assert!(service.init().await.is_connected);

        let expected = AvrStatus {
            is_powered_on: true,
            volume: 50.5,
            is_muted: false,
            input: "TV".into(),
            sound_mode: "STEREO".into(),
        };
        let restored = wait_for_status(&service, &expected).await;
        assert!(restored, "status after power cycle: {:?}", avr_status(&service).await);
        service.cleanup().await;
    }

    #[tokio::test]
    async fn test_failed_field_read_keeps_cached_value() {
        let mut replies = receiver_replies("PWON\r");
        replies.remove("MS?");
        let (port, _) = spawn_fake_avr(replies).await;
        let (service, _hub, _store) = service(Some(port), false);
        assert!(service.init().await.is_connected);

        service
            .inner
            .update_status(|s| {
                s.volume = 10.0;
                s.sound_mode = "MOVIE".into();
            })
            .await;
        service.refresh_status(true).await;

        let avr = avr_status(&service).await;
        assert!(avr.is_powered_on);
        assert_eq!(avr.volume, 40.0);
        assert_eq!(avr.input, "TV");
        assert_eq!(avr.sound_mode, "MOVIE");
        service.cleanup().await;
    }

    #[tokio::test]
    async fn test_single_standby_reading_is_rechecked() {
        // Two reads during init, then standby followed by on
        let script = ScriptedAvr::new(&["PWON\r", "PWON\r", "PWSTANDBY\r", "PWON\r"], false);
        let port = spawn_scripted_avr(script).await;
        let (service, _hub, _store) = service(Some(port), false);
        assert!(service.init().await.is_connected);
        assert!(avr_status(&service).await.is_powered_on);

        service.refresh_status(true).await;
        let avr = avr_status(&service).await;
        assert!(avr.is_powered_on);
        assert_eq!(avr.volume, 40.0);
        assert_eq!(avr.input, "TV");
        service.cleanup().await;
    }

    #[tokio::test]
    async fn test_unreachable_persisted_record_falls_back_to_configured() {
        let (port, _) = spawn_fake_avr(receiver_replies("PWON\r")).await;
        let dead = closed_port().await;
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .upsert(DeviceKind::Avr, &ConnectionInfo::new("127.0.0.1", dead))
            .unwrap();
        let (service, _hub) = service_with(store.clone(), Some(port), false, None);

        let status = service.init().await;
        assert!(status.is_connected);
        assert_eq!(status.port, Some(port));

        let stale = store.get(DeviceKind::Avr, "127.0.0.1", dead).unwrap().unwrap();
        assert_eq!(stale.failure_count, 1);
        let active = store.get_active(DeviceKind::Avr).unwrap().unwrap();
        assert_eq!(active.info.port, port);
        service.cleanup().await;
    }

    #[tokio::test]
    async fn test_discovery_used_when_known_addresses_fail() {
        let (port, _) = spawn_fake_avr(receiver_replies("PWON\r")).await;
        let dead = closed_port().await;
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let discovery = Discovery::new(
            DeviceKind::Avr,
            Arc::new(FixedScanner(vec![DiscoveryCandidate::new(
                "127.0.0.1".parse().unwrap(),
                port,
                5,
            )])),
            Arc::new(EchoProbe::accepting()),
            store.clone(),
        );
        let (service, _hub) =
            service_with(store.clone(), Some(dead), false, Some(Arc::new(discovery)));

        let status = service.init().await;
        assert!(status.is_connected);
        assert!(!status.simulation_mode);
        assert_eq!(status.port, Some(port));

        let active = store.get_active(DeviceKind::Avr).unwrap().unwrap();
        assert_eq!(active.info.port, port);
        assert_eq!(store.history(DeviceKind::Avr, 10).unwrap().len(), 1);
        service.cleanup().await;
    }

    #[tokio::test]
    async fn test_unreachable_receiver_simulates() {
        let port = closed_port().await;
        let (service, _hub, store) = service(Some(port), true);

        let status = service.init().await;
        assert!(status.simulation_mode);
        assert_eq!(status.monitoring, Some(false));
        let stored = store.get_active(DeviceKind::Avr).unwrap();
        assert!(stored.is_none());

        // Simulated commands mutate the cache without I/O
        assert!(service.send_command("POWER", None).await);
        assert!(service.send_command("VOLUME_UP", None).await);
        assert!(service.send_command("MUTE", None).await);
        let avr = avr_status(&service).await;
        assert!(avr.is_powered_on);
        assert_eq!(avr.volume, 0.5);
        assert!(avr.is_muted);
    }

    #[test]
    fn test_wire_commands() {
        assert_eq!(wire_command(&AvrCommand::SetVolume(50.5)).as_deref(), Some("MV505"));
        assert_eq!(
            wire_command(&AvrCommand::SetSoundMode("PURE DIRECT".into())).as_deref(),
            Some("MSPURE DIRECT")
        );
        assert_eq!(wire_command(&AvrCommand::PowerToggle), None);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let (service, _hub, _store) = service(None, true);
        service.init().await;
        service.cleanup().await;
        service.cleanup().await;
        assert!(!service.is_reachable().await);
    }
}
