//! TCP connect probe. Checks a device port across many hosts with
//! semaphore-limited concurrency and records the connect latency.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use super::PortResult;

/// Connect then drop the socket; returns the connect time when the port is open
pub async fn connect_latency(addr: SocketAddr, limit: Duration) -> Option<u64> {
    let started = Instant::now();
    match timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Some(started.elapsed().as_millis() as u64),
        Ok(Err(_)) => None, // Connection refused or other error
        Err(_) => None,     // Timeout
    }
}

/// TCP port scanner using async connect
pub struct PortScanner {
    timeout_ms: u64,
    max_concurrent: usize,
}

impl PortScanner {
    pub fn new() -> Self {
        Self {
            timeout_ms: 1000,
            max_concurrent: 64,
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub async fn scan_port(&self, ip: IpAddr, port: u16) -> PortResult {
        let addr = SocketAddr::new(ip, port);
        let response_time_ms = connect_latency(addr, Duration::from_millis(self.timeout_ms)).await;
        PortResult {
            ip,
            port,
            open: response_time_ms.is_some(),
            response_time_ms,
        }
    }

    /// Probe `port` on every IP, returning only the hosts that accepted
    pub async fn scan_ips(&self, ips: &[IpAddr], port: u16) -> Vec<PortResult> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut handles = Vec::new();

        for &ip in ips {
            let sem = semaphore.clone();
            let scanner_timeout = self.timeout_ms;

            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire().await.ok()?;
                let scanner = PortScanner::new().with_timeout(scanner_timeout);
                Some(scanner.scan_port(ip, port).await)
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            if let Ok(Some(result)) = handle.await
                && result.open
            {
                results.push(result);
            }
        }

        results
    }
}

impl Default for PortScanner {
    fn default() -> Self {
        Self::new()
    }
}
