//! Runtime settings. Every option can come from a flag or the environment.

use std::time::Duration;

use clap::{ArgAction, Args};

use crate::device::{ConnectionInfo, DeviceKind};

#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// SQLite database holding connection records and discovery history
    #[arg(long, env = "DATABASE_URL", default_value = "home_panel.db")]
    pub database_url: String,

    /// Static TV address, tried after the persisted record
    #[arg(long = "tv-ip", env = "VIZIO_TV_IP")]
    pub tv_ip: Option<String>,

    #[arg(long = "tv-port", env = "VIZIO_TV_PORT", default_value_t = 7345)]
    pub tv_port: u16,

    /// Pairing token for the static TV address
    #[arg(long = "tv-token", env = "VIZIO_AUTH_TOKEN", hide_env_values = true)]
    pub tv_auth_token: Option<String>,

    /// Static receiver address, tried after the persisted record
    #[arg(long = "avr-ip", env = "DENON_AVR_IP")]
    pub avr_ip: Option<String>,

    #[arg(long = "avr-port", env = "DENON_AVR_PORT", default_value_t = 23)]
    pub avr_port: u16,

    #[arg(long, env = "TV_POLL_SECS", default_value_t = 5)]
    pub tv_poll_secs: u64,

    /// Fallback poll for the receiver while its monitor is down
    #[arg(long, env = "AVR_POLL_SECS", default_value_t = 30)]
    pub avr_poll_secs: u64,

    /// Hold the receiver's monitor connection open while connected
    #[arg(long, env = "AVR_MONITOR", default_value_t = true, action = ArgAction::Set)]
    pub avr_monitor: bool,

    /// Scan the LAN when no persisted or static address connects
    #[arg(long, env = "DISCOVERY", default_value_t = true, action = ArgAction::Set)]
    pub discovery: bool,

    /// Sweep every host of the local /24 instead of only the neighbour table
    #[arg(long, env = "SUBNET_SWEEP", default_value_t = false, action = ArgAction::Set)]
    pub subnet_sweep: bool,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Settings {
    /// Manually configured address for a device, if any
    pub fn static_target(&self, kind: DeviceKind) -> Option<ConnectionInfo> {
        match kind {
            DeviceKind::Tv => self
                .tv_ip
                .as_deref()
                .filter(|ip| !ip.trim().is_empty())
                .map(|ip| {
                    ConnectionInfo::new(ip.trim(), self.tv_port)
                        .with_token(self.tv_auth_token.clone())
                }),
            DeviceKind::Avr => self
                .avr_ip
                .as_deref()
                .filter(|ip| !ip.trim().is_empty())
                .map(|ip| ConnectionInfo::new(ip.trim(), self.avr_port)),
        }
    }

    pub fn poll_interval(&self, kind: DeviceKind) -> Duration {
        let secs = match kind {
            DeviceKind::Tv => self.tv_poll_secs,
            DeviceKind::Avr => self.avr_poll_secs,
        };
        Duration::from_secs(secs.max(1))
    }

    /// Filter directive for the tracing subscriber
    pub fn log_filter(&self) -> String {
        format!("home_panel={}", self.log_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        settings: Settings,
    }

    fn parse(args: &[&str]) -> Settings {
        let mut argv = vec!["home-panel"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv).settings
    }

    #[test]
    fn test_static_targets() {
        let settings = parse(&[
            "--tv-ip",
            "192.168.1.40",
            "--tv-token",
            "Zmy",
            "--avr-ip",
            "192.168.1.41",
            "--avr-port",
            "2323",
        ]);

        let tv = settings.static_target(DeviceKind::Tv).unwrap();
        assert_eq!(tv.address(), "192.168.1.40:7345");
        assert_eq!(tv.auth_token.as_deref(), Some("Zmy"));

        let avr = settings.static_target(DeviceKind::Avr).unwrap();
        assert_eq!(avr.address(), "192.168.1.41:2323");
        assert_eq!(avr.auth_token, None);
    }

    #[test]
    fn test_flags_and_intervals() {
        let settings = parse(&[
            "--discovery",
            "false",
            "--tv-poll-secs",
            "0",
            "--log-level",
            "debug",
        ]);
        assert!(!settings.discovery);
        assert!(settings.avr_monitor);
        assert_eq!(settings.poll_interval(DeviceKind::Tv), Duration::from_secs(1));
        assert_eq!(settings.log_filter(), "home_panel=debug");
    }

    #[test]
    fn test_blank_address_ignored() {
        let settings = parse(&["--avr-ip", "  "]);
        assert!(settings.static_target(DeviceKind::Avr).is_none());
    }
}
