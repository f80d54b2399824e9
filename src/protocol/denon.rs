//! Denon AVR telnet protocol. Opens one short-lived socket per command, speaks
//! `\r` terminated ASCII lines, and implements the status line / volume codec.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};

use crate::device::{AVR_VOLUME_MAX, AvrStatus};
use crate::error::{DeviceError, Result};

pub const LINE_TERMINATOR: char = '\r';

/// Prefixes a genuine receiver answers a power query with
pub const RESPONSE_PREFIXES: &[&str] = &["PW", "ZM", "SI", "MV"];

/// The five queries that seed a full status snapshot
pub const STATUS_QUERIES: &[&str] = &["PW?", "MV?", "MU?", "SI?", "MS?"];

#[derive(Debug, Clone)]
pub struct DenonConfig {
    pub connect_timeout: Duration,
    /// A response is complete after this much silence
    pub silence: Duration,
    /// Upper bound on reading one response
    pub command_deadline: Duration,
    pub retries: u32,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub query_stagger: Duration,
}

impl Default for DenonConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            silence: Duration::from_millis(500),
            command_deadline: Duration::from_secs(5),
            retries: 2,
            reconnect_base_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            query_stagger: Duration::from_millis(100),
        }
    }
}

/// Raw outcome of one command exchange
#[derive(Debug, Clone, PartialEq)]
pub struct DenonReply {
    pub success: bool,
    pub data: String,
}

impl DenonReply {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.data
            .split(|c| c == LINE_TERMINATOR || c == '\n')
            .map(str::trim)
            .filter(|l| !l.is_empty())
    }

    /// Every recognised status line in the reply, in order
    pub fn changes(&self) -> Vec<AvrChange> {
        self.lines().filter_map(parse_line).collect()
    }
}

/// A single field update decoded from a status line
#[derive(Debug, Clone, PartialEq)]
pub enum AvrChange {
    Power(bool),
    Volume(f64),
    Mute(bool),
    Input(String),
    SoundMode(String),
}

fn set<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

impl AvrChange {
    /// Write the value into `status`; returns whether it differed
    pub fn apply(&self, status: &mut AvrStatus) -> bool {
        match self {
            AvrChange::Power(on) => set(&mut status.is_powered_on, *on),
            AvrChange::Volume(v) => set(&mut status.volume, *v),
            AvrChange::Mute(m) => set(&mut status.is_muted, *m),
            AvrChange::Input(i) => set(&mut status.input, i.clone()),
            AvrChange::SoundMode(m) => set(&mut status.sound_mode, m.clone()),
        }
    }

    pub fn field(&self) -> &'static str {
        match self {
            AvrChange::Power(_) => "power",
            AvrChange::Volume(_) => "volume",
            AvrChange::Mute(_) => "mute",
            AvrChange::Input(_) => "input",
            AvrChange::SoundMode(_) => "sound_mode",
        }
    }
}

/// Clamp to the receiver's range and round to its one-decimal precision
pub fn round_volume(v: f64) -> f64 {
    (v.clamp(0.0, AVR_VOLUME_MAX) * 10.0).round() / 10.0
}

/// `50.0` -> `MV50`, `50.5` -> `MV505`
pub fn encode_volume(v: f64) -> String {
    let tenths = (round_volume(v) * 10.0).round() as u32;
    let (whole, frac) = (tenths / 10, tenths % 10);
    if frac == 0 {
        format!("MV{:02}", whole)
    } else {
        format!("MV{:02}{}", whole, frac)
    }
}

/// Decode the digits after `MV`; a third digit is the tenths place
pub fn decode_volume(digits: &str) -> Option<f64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match digits.len() {
        1 | 2 => digits.parse::<u32>().ok().map(f64::from),
        3 => {
            let whole: u32 = digits[..2].parse().ok()?;
            let frac: u32 = digits[2..].parse().ok()?;
            Some(whole as f64 + frac as f64 / 10.0)
        }
        _ => None,
    }
}

/// Match one status line against the fixed textual patterns
pub fn parse_line(line: &str) -> Option<AvrChange> {
    let line = line.trim();
    match line {
        "PWON" | "ZMON" => return Some(AvrChange::Power(true)),
        "PWSTANDBY" | "PWOFF" | "ZMOFF" => return Some(AvrChange::Power(false)),
        "MUON" => return Some(AvrChange::Mute(true)),
        "MUOFF" => return Some(AvrChange::Mute(false)),
        _ => {}
    }

    if let Some(rest) = line.strip_prefix("MV") {
        // "MVMAX 98" reports the ceiling, not the level
        if rest.starts_with("MAX") {
            return None;
        }
        return decode_volume(rest.trim()).map(AvrChange::Volume);
    }
    if let Some(source) = line.strip_prefix("SI")
        && !source.is_empty()
    {
        return Some(AvrChange::Input(source.to_string()));
    }
    if let Some(mode) = line.strip_prefix("MS")
        && !mode.is_empty()
    {
        return Some(AvrChange::SoundMode(mode.to_string()));
    }
    None
}

pub fn power_command(on: bool) -> &'static str {
    if on { "PWON" } else { "PWSTANDBY" }
}

pub fn mute_command(on: bool) -> &'static str {
    if on { "MUON" } else { "MUOFF" }
}

/// Command/response client for one receiver
#[derive(Debug, Clone)]
pub struct DenonClient {
    addr: String,
    config: DenonConfig,
}

impl DenonClient {
    pub fn new(ip: &str, port: u16) -> Self {
        Self::with_config(ip, port, DenonConfig::default())
    }

    pub fn with_config(ip: &str, port: u16, config: DenonConfig) -> Self {
        Self {
            addr: format!("{}:{}", ip, port),
            config,
        }
    }

    pub fn address(&self) -> &str {
        &self.addr
    }

    pub fn config(&self) -> &DenonConfig {
        &self.config
    }

    /// Connect, write one command, read until the line goes quiet, close
    async fn exchange(&self, cmd: &str) -> Result<String> {
        let mut stream = timeout(self.config.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| DeviceError::Timeout)??;

        stream
            .write_all(format!("{}{}", cmd, LINE_TERMINATOR).as_bytes())
            .await?;

        let mut response = Vec::new();
        let mut buf = [0u8; 512];
        let deadline = Instant::now() + self.config.command_deadline;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(self.config.silence.min(remaining), stream.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => response.extend_from_slice(&buf[..n]),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
        }

        let _ = stream.shutdown().await;
        Ok(String::from_utf8_lossy(&response).into_owned())
    }

    /// Send a command, retrying on timeout, empty response or socket error
    pub async fn send_command(&self, cmd: &str) -> Result<DenonReply> {
        let mut last_error = None;
        for attempt in 0..=self.config.retries {
            match self.exchange(cmd).await {
                Ok(data) if !data.trim().is_empty() => {
                    tracing::trace!("{} <- {:?}", cmd, data);
                    return Ok(DenonReply {
                        success: true,
                        data,
                    });
                }
                Ok(_) => {
                    tracing::debug!("Empty response to {} (attempt {})", cmd, attempt + 1);
                    last_error = None;
                }
                Err(e) => {
                    tracing::debug!("{} failed on attempt {}: {}", cmd, attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(DenonReply {
                success: false,
                data: String::new(),
            }),
        }
    }

    /// Send a query and pick the first reply line `select` accepts
    async fn query<T>(&self, cmd: &str, select: impl Fn(AvrChange) -> Option<T>) -> Result<T> {
        let reply = self.send_command(cmd).await?;
        reply
            .changes()
            .into_iter()
            .find_map(select)
            .ok_or_else(|| DeviceError::Protocol(format!("no usable reply to {}: {:?}", cmd, reply.data)))
    }

    pub async fn power(&self) -> Result<bool> {
        self.query("PW?", |c| match c {
            AvrChange::Power(on) => Some(on),
            _ => None,
        })
        .await
    }

    pub async fn volume(&self) -> Result<f64> {
        self.query("MV?", |c| match c {
            AvrChange::Volume(v) => Some(v),
            _ => None,
        })
        .await
    }

    pub async fn mute(&self) -> Result<bool> {
        self.query("MU?", |c| match c {
            AvrChange::Mute(m) => Some(m),
            _ => None,
        })
        .await
    }

    pub async fn input(&self) -> Result<String> {
        self.query("SI?", |c| match c {
            AvrChange::Input(i) => Some(i),
            _ => None,
        })
        .await
    }

    pub async fn sound_mode(&self) -> Result<String> {
        self.query("MS?", |c| match c {
            AvrChange::SoundMode(m) => Some(m),
            _ => None,
        })
        .await
    }

    pub async fn set_volume(&self, volume: f64) -> Result<DenonReply> {
        self.send_command(&encode_volume(volume)).await
    }

    /// Plain TCP connect-then-disconnect, independent of the command protocol
    pub async fn is_reachable(&self) -> bool {
        matches!(
            timeout(self.config.connect_timeout, TcpStream::connect(&self.addr)).await,
            Ok(Ok(_))
        )
    }
}
