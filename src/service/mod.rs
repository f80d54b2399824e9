//! Device services. Each one owns the connection state machine, status cache
//! and background tasks for a single physical appliance.

pub mod avr;
pub mod tv;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Settings;
use crate::db::{ConnectionStore, SqliteStore};
use crate::device::{ConnectionStatus, DeviceKind, DeviceStatus};
use crate::error::Result;
use crate::protocol::{DenonConfig, ReqwestTransport, VizioConfig};
use crate::pubsub::{Hub, StatusPublisher};
use crate::scanner::{AvrProbe, Discovery, LanScanner, TvProbe};

pub use avr::{AvrService, AvrSettings};
pub use tv::{TvService, TvSettings};

/// Uniform surface both services expose to the API layer
#[async_trait]
pub trait DeviceController: Send + Sync {
    fn kind(&self) -> DeviceKind;

    /// Walk the connection tiers; ends Connected or Simulated
    async fn init(&self) -> ConnectionStatus;

    async fn current_status(&self) -> DeviceStatus;

    async fn connection_status(&self) -> ConnectionStatus;

    /// Never fails: problems are logged and reported as `false`
    async fn send_command(&self, command: &str, value: Option<&str>) -> bool;

    async fn refresh_status(&self, silent: bool) -> DeviceStatus;

    async fn is_reachable(&self) -> bool;

    /// Stop every background task. Safe to call repeatedly.
    async fn cleanup(&self);
}

/// Both services plus the hub they publish on, built once per process
#[derive(Clone)]
pub struct Controllers {
    pub tv: Arc<TvService>,
    pub avr: Arc<AvrService>,
    pub hub: Arc<Hub>,
    tv_discovery: Option<Arc<Discovery>>,
    avr_discovery: Option<Arc<Discovery>>,
}

impl Controllers {
    pub fn new(tv: Arc<TvService>, avr: Arc<AvrService>, hub: Arc<Hub>) -> Self {
        Self {
            tv,
            avr,
            hub,
            tv_discovery: None,
            avr_discovery: None,
        }
    }

    pub fn with_discovery(
        mut self,
        tv: Option<Arc<Discovery>>,
        avr: Option<Arc<Discovery>>,
    ) -> Self {
        self.tv_discovery = tv;
        self.avr_discovery = avr;
        self
    }

    /// None when discovery is disabled
    pub fn discovery(&self, kind: DeviceKind) -> Option<Arc<Discovery>> {
        match kind {
            DeviceKind::Tv => self.tv_discovery.clone(),
            DeviceKind::Avr => self.avr_discovery.clone(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let store: Arc<dyn ConnectionStore> = Arc::new(SqliteStore::open(&settings.database_url)?);
        let hub = Arc::new(Hub::new());

        let tv_config = VizioConfig::default();
        let transport = Arc::new(ReqwestTransport::new(tv_config.request_timeout)?);
        let avr_config = DenonConfig::default();

        let scanner = Arc::new(LanScanner::new(settings.subnet_sweep));
        let (tv_discovery, avr_discovery) = if settings.discovery {
            let tv_token = store
                .get_active(DeviceKind::Tv)?
                .and_then(|s| s.info.auth_token)
                .or_else(|| settings.tv_auth_token.clone());
            let tv = Discovery::new(
                DeviceKind::Tv,
                scanner.clone(),
                Arc::new(TvProbe::new(transport.clone(), tv_config.clone(), tv_token)),
                store.clone(),
            );
            let avr = Discovery::new(
                DeviceKind::Avr,
                scanner,
                Arc::new(AvrProbe::new(avr_config.clone())),
                store.clone(),
            );
            (Some(Arc::new(tv)), Some(Arc::new(avr)))
        } else {
            (None, None)
        };

        let tv = TvService::new(
            transport,
            store.clone(),
            StatusPublisher::new(hub.clone(), DeviceKind::Tv.status_channel()),
            tv_discovery.clone(),
            TvSettings {
                static_target: settings.static_target(DeviceKind::Tv),
                poll_interval: settings.poll_interval(DeviceKind::Tv),
                client: tv_config,
            },
        );
        let avr = AvrService::new(
            store,
            StatusPublisher::new(hub.clone(), DeviceKind::Avr.status_channel()),
            avr_discovery.clone(),
            AvrSettings {
                static_target: settings.static_target(DeviceKind::Avr),
                poll_interval: settings.poll_interval(DeviceKind::Avr),
                client: avr_config,
                monitor: settings.avr_monitor,
            },
        );

        Ok(Self::new(Arc::new(tv), Arc::new(avr), hub).with_discovery(tv_discovery, avr_discovery))
    }

    pub fn get(&self, kind: DeviceKind) -> Arc<dyn DeviceController> {
        match kind {
            DeviceKind::Tv => self.tv.clone() as Arc<dyn DeviceController>,
            DeviceKind::Avr => self.avr.clone() as Arc<dyn DeviceController>,
        }
    }

    /// Initialise both devices concurrently
    pub async fn init_all(&self) -> (ConnectionStatus, ConnectionStatus) {
        tokio::join!(self.tv.init(), self.avr.init())
    }

    pub async fn cleanup_all(&self) {
        self.tv.cleanup().await;
        self.avr.cleanup().await;
    }
}

/// TCP connect-then-disconnect reachability probe
pub(crate) async fn tcp_reachable(ip: &str, port: u16, limit: Duration) -> bool {
    match ip.parse() {
        Ok(ip) => crate::scanner::port::connect_latency(std::net::SocketAddr::new(ip, port), limit)
            .await
            .is_some(),
        Err(_) => false,
    }
}
