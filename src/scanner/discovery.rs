//! LAN discovery: find hosts answering on a device's port, validate them,
//! keep the fastest valid one and log every attempt.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Semaphore;

use super::neighbors::read_neighbor_table;
use super::port::PortScanner;
use super::ssdp::SsdpScanner;
use super::validate::{DeviceProbe, ValidationResult};
use super::{local_subnets, subnet_hosts};
use crate::db::{ConnectionStore, HistoryEntry};
use crate::device::{DeviceKind, DiscoveryCandidate};

/// History rows kept per device kind
pub const HISTORY_LIMIT: usize = 50;
/// Validations in flight at once; a swept /24 can yield hundreds of candidates
pub const MAX_CONCURRENT_VALIDATIONS: usize = 16;

#[async_trait]
pub trait HostScanner: Send + Sync {
    /// Hosts answering on the device's default port, with connect latency
    async fn scan(&self, kind: DeviceKind) -> Vec<DiscoveryCandidate>;
}

#[derive(Debug, Default, Clone)]
struct HostHint {
    mac_address: Option<String>,
    device_info: Option<String>,
}

/// Neighbour table, optional subnet sweep, and SSDP hints for the TV
pub struct LanScanner {
    port_scanner: PortScanner,
    subnet_sweep: bool,
}

impl LanScanner {
    pub fn new(subnet_sweep: bool) -> Self {
        Self {
            port_scanner: PortScanner::new().with_timeout(500),
            subnet_sweep,
        }
    }

    async fn gather_hosts(&self, kind: DeviceKind) -> HashMap<IpAddr, HostHint> {
        let mut hosts: HashMap<IpAddr, HostHint> = HashMap::new();

        for neighbor in read_neighbor_table().await {
            if neighbor.ip.is_ipv4() {
                hosts.entry(neighbor.ip).or_default().mac_address = neighbor.mac;
            }
        }

        if self.subnet_sweep {
            for subnet in local_subnets() {
                for ip in subnet_hosts(&subnet) {
                    hosts.entry(ip).or_default();
                }
            }
        }

        if kind == DeviceKind::Tv {
            for result in SsdpScanner::new().discover().await {
                if result.is_smartcast() {
                    hosts.entry(result.ip).or_default().device_info = result.device_info();
                }
            }
        }

        hosts
    }
}

#[async_trait]
impl HostScanner for LanScanner {
    async fn scan(&self, kind: DeviceKind) -> Vec<DiscoveryCandidate> {
        let hosts = self.gather_hosts(kind).await;
        let ips: Vec<IpAddr> = hosts.keys().copied().collect();
        tracing::debug!("Probing {} host(s) for a {} on port {}", ips.len(), kind, kind.default_port());

        self.port_scanner
            .scan_ips(&ips, kind.default_port())
            .await
            .into_iter()
            .map(|open| {
                let hint = hosts.get(&open.ip).cloned().unwrap_or_default();
                DiscoveryCandidate {
                    device_info: hint.device_info,
                    mac_address: hint.mac_address,
                    ..DiscoveryCandidate::new(open.ip, open.port, open.response_time_ms.unwrap_or(0))
                }
            })
            .collect()
    }
}

pub struct Discovery {
    kind: DeviceKind,
    scanner: Arc<dyn HostScanner>,
    probe: Arc<dyn DeviceProbe>,
    store: Arc<dyn ConnectionStore>,
    history_limit: usize,
    max_concurrent_validations: usize,
}

impl Discovery {
    pub fn new(
        kind: DeviceKind,
        scanner: Arc<dyn HostScanner>,
        probe: Arc<dyn DeviceProbe>,
        store: Arc<dyn ConnectionStore>,
    ) -> Self {
        Self {
            kind,
            scanner,
            probe,
            store,
            history_limit: HISTORY_LIMIT,
            max_concurrent_validations: MAX_CONCURRENT_VALIDATIONS,
        }
    }

    pub fn with_validation_limit(mut self, limit: usize) -> Self {
        self.max_concurrent_validations = limit.max(1);
        self
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub async fn scan(&self) -> Vec<DiscoveryCandidate> {
        self.scanner.scan(self.kind).await
    }

    pub async fn validate(&self, candidate: &DiscoveryCandidate) -> ValidationResult {
        self.probe.validate(candidate).await
    }

    /// Valid results only, fastest first
    pub fn rank(results: Vec<ValidationResult>) -> Vec<ValidationResult> {
        let mut valid: Vec<ValidationResult> = results.into_iter().filter(|r| r.valid).collect();
        valid.sort_by_key(|r| (r.response_time_ms, r.candidate.response_time_ms));
        valid
    }

    fn record_history(&self, results: &[ValidationResult]) {
        let now = Utc::now().timestamp();
        for result in results {
            let entry = HistoryEntry {
                kind: self.kind,
                ip: result.candidate.ip.to_string(),
                port: result.candidate.port,
                response_time_ms: Some(result.response_time_ms),
                success: result.valid,
                detail: result
                    .error
                    .clone()
                    .or_else(|| result.candidate.device_info.clone()),
                recorded_at: now,
            };
            if let Err(e) = self.store.append_history(&entry) {
                tracing::warn!("Failed to record discovery history: {}", e);
            }
        }
        match self.store.prune_history(self.kind, self.history_limit) {
            Ok(0) => {}
            Ok(n) => tracing::debug!("Pruned {} old {} discovery entries", n, self.kind),
            Err(e) => tracing::warn!("Failed to prune discovery history: {}", e),
        }
    }

    /// Scan, validate every candidate, persist the best one
    pub async fn discover(&self) -> Option<ValidationResult> {
        let candidates = self.scan().await;
        tracing::info!("Discovery found {} {} candidate(s)", candidates.len(), self.kind);
        if candidates.is_empty() {
            return None;
        }

        let permits = Semaphore::new(self.max_concurrent_validations);
        let results = join_all(candidates.iter().map(|c| async {
            let _permit = permits.acquire().await.ok();
            self.validate(c).await
        }))
        .await;
        self.record_history(&results);

        let best = Self::rank(results).into_iter().next()?;
        if let Err(e) = self
            .store
            .upsert(self.kind, &best.candidate.to_connection_info())
        {
            tracing::warn!("Failed to persist discovered {}: {}", self.kind, e);
        }
        tracing::info!(
            "Selected {} at {}:{} ({} ms)",
            self.kind,
            best.candidate.ip,
            best.candidate.port,
            best.response_time_ms
        );
        Some(best)
    }
}
