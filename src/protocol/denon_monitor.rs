//! Long-lived monitoring connection to a Denon receiver. Seeds its cache with
//! the five status queries, turns every unsolicited status line that changes a
//! value into an event, and reconnects with linear backoff.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use super::denon::{AvrChange, DenonConfig, LINE_TERMINATOR, STATUS_QUERIES, parse_line};
use crate::device::AvrStatus;
use crate::error::{DeviceError, Result};

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Connected,
    Change(AvrChange),
    Reconnecting { attempt: u32, delay: Duration },
    /// Terminal: reconnect attempts are exhausted and the task has stopped
    Disconnected,
}

/// Handle to the background monitor task
pub struct DenonMonitor {
    handle: JoinHandle<()>,
    status: Arc<Mutex<AvrStatus>>,
}

impl DenonMonitor {
    pub fn spawn(addr: String, config: DenonConfig) -> (Self, mpsc::Receiver<MonitorEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let status = Arc::new(Mutex::new(AvrStatus::default()));
        let handle = tokio::spawn(run(addr, config, status.clone(), tx));
        (Self { handle, status }, rx)
    }

    /// Last values seen on the wire
    pub fn snapshot(&self) -> AvrStatus {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for DenonMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn connect_with_keepalive(addr: &str, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| DeviceError::Timeout)??;

    let sock = SockRef::from(&stream);
    sock.set_keepalive(true)?;
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(30));
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        tracing::debug!("Could not tune keep-alive on {}: {}", addr, e);
    }
    Ok(stream)
}

async fn run(
    addr: String,
    config: DenonConfig,
    status: Arc<Mutex<AvrStatus>>,
    tx: mpsc::Sender<MonitorEvent>,
) {
    let mut attempt: u32 = 0;
    loop {
        match connect_with_keepalive(&addr, config.connect_timeout).await {
            Ok(stream) => {
                tracing::info!("Monitoring receiver at {}", addr);
                if tx.send(MonitorEvent::Connected).await.is_err() {
                    return;
                }
                let mut heard = false;
                match run_session(stream, &config, &status, &tx, &mut heard).await {
                    Ok(()) => tracing::info!("Receiver at {} closed the monitor connection", addr),
                    Err(e) => tracing::warn!("Monitor connection to {} failed: {}", addr, e),
                }
                // A session that never produced a line does not count as recovered
                if heard {
                    attempt = 0;
                }
            }
            Err(e) => tracing::warn!("Could not open monitor connection to {}: {}", addr, e),
        }

        if tx.is_closed() {
            return;
        }
        if attempt >= config.max_reconnect_attempts {
            tracing::warn!(
                "Giving up on monitoring {} after {} reconnect attempts",
                addr,
                attempt
            );
            let _ = tx.send(MonitorEvent::Disconnected).await;
            return;
        }

        attempt += 1;
        let delay = config.reconnect_base_delay * attempt;
        tracing::debug!("Reconnecting monitor in {:?} (attempt {})", delay, attempt);
        if tx
            .send(MonitorEvent::Reconnecting { attempt, delay })
            .await
            .is_err()
        {
            return;
        }
        sleep(delay).await;
    }
}

async fn write_status_queries(writer: &mut OwnedWriteHalf, stagger: Duration) -> std::io::Result<()> {
    for (i, query) in STATUS_QUERIES.iter().enumerate() {
        if i > 0 {
            sleep(stagger).await;
        }
        writer
            .write_all(format!("{}{}", query, LINE_TERMINATOR).as_bytes())
            .await?;
    }
    Ok(())
}

/// Seed on connect, then reseed whenever the reader reports a power-on.
/// Returns once the reader drops its end of `reseed`.
async fn send_status_queries(
    mut writer: OwnedWriteHalf,
    stagger: Duration,
    mut reseed: mpsc::UnboundedReceiver<()>,
) -> std::io::Result<OwnedWriteHalf> {
    write_status_queries(&mut writer, stagger).await?;
    while reseed.recv().await.is_some() {
        write_status_queries(&mut writer, stagger).await?;
    }
    Ok(writer)
}

async fn read_status_lines(
    reader: OwnedReadHalf,
    status: &Mutex<AvrStatus>,
    tx: &mpsc::Sender<MonitorEvent>,
    reseed: mpsc::UnboundedSender<()>,
    heard: &mut bool,
) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(LINE_TERMINATOR as u8, &mut buf).await? == 0 {
            return Ok(());
        }
        let raw = String::from_utf8_lossy(&buf);
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        *heard = true;

        let Some(change) = parse_line(line) else {
            tracing::trace!("Ignoring status line {:?}", line);
            continue;
        };

        // Same powered-off collapse as the service cache, so values repeated
        // after a power cycle still count as changes
        let changed = {
            let mut cache = status.lock().unwrap_or_else(|e| e.into_inner());
            let mut next = cache.clone();
            change.apply(&mut next);
            let next = next.canonical();
            let changed = *cache != next;
            *cache = next;
            changed
        };
        if changed {
            if change == AvrChange::Power(true) {
                let _ = reseed.send(());
            }
            tracing::debug!("Receiver {} changed: {:?}", change.field(), change);
            tx.send(MonitorEvent::Change(change))
                .await
                .map_err(|_| DeviceError::Transport("monitor consumer dropped".into()))?;
        }
    }
}

async fn run_session(
    stream: TcpStream,
    config: &DenonConfig,
    status: &Mutex<AvrStatus>,
    tx: &mpsc::Sender<MonitorEvent>,
    heard: &mut bool,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let (reseed_tx, reseed_rx) = mpsc::unbounded_channel();

    // The write half stays alive until reading ends; dropping it would half-close the socket
    let (queries, lines) = tokio::join!(
        send_status_queries(writer, config.query_stagger, reseed_rx),
        read_status_lines(reader, status, tx, reseed_tx, heard)
    );
    if let Err(e) = queries {
        tracing::debug!("Status queries failed: {}", e);
    }
    lines
}
