//! `nmprobe.toml` configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level probe configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    /// Network worker threads.
    #[serde(default = "ProbeConfig::default_workers")]
    pub workers: usize,
    /// Seconds between statistics log lines while serving.
    #[serde(default = "ProbeConfig::default_stats_interval")]
    pub stats_interval_secs: u64,
    /// Drop inbound UDP datagrams larger than this many bytes.
    #[serde(default)]
    pub max_udp: Option<u32>,
    /// Cap on concurrent unanswered queries per DNS-framed connection.
    #[serde(default)]
    pub max_pipelined: Option<usize>,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub listeners: Vec<ListenerEntry>,
}

/// TCP timeouts in tenths of seconds, the unit the manager is configured
/// in.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutsConfig {
    #[serde(default = "TimeoutsConfig::default_tenths")]
    pub initial: u64,
    #[serde(default = "TimeoutsConfig::default_tenths")]
    pub idle: u64,
    #[serde(default = "TimeoutsConfig::default_tenths")]
    pub keepalive: u64,
    #[serde(default = "TimeoutsConfig::default_tenths")]
    pub advertised: u64,
}

impl TimeoutsConfig {
    fn default_tenths() -> u64 {
        300
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            initial: Self::default_tenths(),
            idle: Self::default_tenths(),
            keepalive: Self::default_tenths(),
            advertised: Self::default_tenths(),
        }
    }
}

/// One echo listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerEntry {
    /// Name shown in log lines (e.g. "udp53", "dot")
    pub name: String,
    /// Transport: "udp", "tcp", "tcpdns", or "tls"
    pub transport: String,
    /// Listen address, e.g. "127.0.0.1:5300"
    pub address: String,
    /// Maximum concurrent connections (tcp/tcpdns/tls only)
    pub quota: Option<usize>,
    /// PEM certificate chain (tls only)
    pub cert: Option<String>,
    /// PEM private key (tls only)
    pub key: Option<String>,
}

impl ProbeConfig {
    fn default_workers() -> usize {
        4
    }

    fn default_stats_interval() -> u64 {
        30
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// A config that stands up one echo listener per transport on
    /// loopback ports.
    pub fn default_example() -> Self {
        Self {
            workers: Self::default_workers(),
            stats_interval_secs: Self::default_stats_interval(),
            max_udp: Some(4096),
            max_pipelined: Some(100),
            timeouts: TimeoutsConfig::default(),
            listeners: vec![
                ListenerEntry {
                    name: "udp".into(),
                    transport: "udp".into(),
                    address: "127.0.0.1:5300".into(),
                    quota: None,
                    cert: None,
                    key: None,
                },
                ListenerEntry {
                    name: "tcp".into(),
                    transport: "tcp".into(),
                    address: "127.0.0.1:5301".into(),
                    quota: Some(100),
                    cert: None,
                    key: None,
                },
                ListenerEntry {
                    name: "tcpdns".into(),
                    transport: "tcpdns".into(),
                    address: "127.0.0.1:5302".into(),
                    quota: Some(100),
                    cert: None,
                    key: None,
                },
                ListenerEntry {
                    name: "dot".into(),
                    transport: "tls".into(),
                    address: "127.0.0.1:5303".into(),
                    quota: Some(100),
                    cert: Some("/etc/nmprobe/cert.pem".into()),
                    key: Some("/etc/nmprobe/key.pem".into()),
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_roundtrips_through_toml() {
        let example = ProbeConfig::default_example();
        let text = toml::to_string_pretty(&example).unwrap();
        let back: ProbeConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.workers, example.workers);
        assert_eq!(back.listeners.len(), example.listeners.len());
        assert_eq!(back.timeouts.initial, 300);
    }

    #[test]
    fn test_defaults_fill_in() {
        let cfg: ProbeConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.workers, 4);
        assert!(cfg.listeners.is_empty());
        assert_eq!(cfg.timeouts.idle, 300);
    }
}
