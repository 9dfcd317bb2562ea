use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use feed_angel::FeedConfig;
use infra_clock::SquareOffWindow;
use serde::Deserialize;

/// Operator-facing configuration, loaded from a TOML file with environment
/// overrides for the listen address. Every field has a default so an empty
/// file (or none at all) yields a runnable server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,

    pub heartbeat_interval_secs: u64,
    pub channel_send_queue: usize,
    pub channel_send_deadline_secs: u64,
    pub command_queue: usize,

    pub feed_endpoint: String,
    pub upstream_read_deadline_secs: u64,
    pub reconnect_backoff_base_secs: u64,
    pub reconnect_backoff_max_secs: u64,
    pub reconnect_backoff_jitter: f64,
    pub subscription_batch_window_ms: u64,
    pub feed_linger_secs: u64,
    pub decode_error_threshold: u32,

    pub persistence_flush_interval_secs: u64,
    pub session_ttl_warm_secs: u64,
    pub session_ttl_cold_secs: u64,

    pub square_off_start: String,
    pub square_off_end: String,
    pub auto_square_off: bool,
    pub per_trade_cap: f64,
    pub averaging_enabled: bool,
    pub alert_log_cap: usize,

    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            data_dir: PathBuf::from("data"),

            heartbeat_interval_secs: 10,
            channel_send_queue: 256,
            channel_send_deadline_secs: 10,
            command_queue: 1024,

            feed_endpoint: "wss://smartapisocket.angelone.in/smart-stream".to_string(),
            upstream_read_deadline_secs: 40,
            reconnect_backoff_base_secs: 1,
            reconnect_backoff_max_secs: 30,
            reconnect_backoff_jitter: 0.2,
            subscription_batch_window_ms: 100,
            feed_linger_secs: 30,
            decode_error_threshold: 25,

            persistence_flush_interval_secs: 5,
            session_ttl_warm_secs: 30 * 60,
            session_ttl_cold_secs: 7 * 24 * 3600,

            square_off_start: "15:15".to_string(),
            square_off_end: "15:30".to_string(),
            auto_square_off: true,
            per_trade_cap: 1.0,
            averaging_enabled: false,
            alert_log_cap: 500,

            shutdown_grace_secs: 10,
        }
    }
}

impl ServerConfig {
    /// Load from `LEVELWATCH_CONFIG` (default `configs/levelwatch.toml`). A
    /// missing file is not an error; a malformed one is.
    pub fn load() -> Result<Self> {
        let path = env::var("LEVELWATCH_CONFIG")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("configs/levelwatch.toml"));

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read config {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(bind) = env::var("LEVELWATCH_BIND") {
            if !bind.trim().is_empty() {
                config.bind = bind.trim().to_string();
            }
        }
        if let Ok(port) = env::var("LEVELWATCH_PORT") {
            if let Ok(port) = port.trim().parse() {
                config.port = port;
            }
        }
        Ok(config)
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            endpoint: self.feed_endpoint.clone(),
            read_deadline: Duration::from_secs(self.upstream_read_deadline_secs),
            backoff_base: Duration::from_secs(self.reconnect_backoff_base_secs),
            backoff_max: Duration::from_secs(self.reconnect_backoff_max_secs),
            backoff_jitter: self.reconnect_backoff_jitter,
            batch_window: Duration::from_millis(self.subscription_batch_window_ms),
            linger: Duration::from_secs(self.feed_linger_secs),
            decode_error_threshold: self.decode_error_threshold,
            ..FeedConfig::default()
        }
    }

    pub fn square_off_window(&self) -> Result<SquareOffWindow> {
        SquareOffWindow::parse(&self.square_off_start, &self.square_off_end)
            .context("square_off window")
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn channel_send_deadline(&self) -> Duration {
        Duration::from_secs(self.channel_send_deadline_secs)
    }

    pub fn persistence_flush_interval(&self) -> Duration {
        Duration::from_secs(self.persistence_flush_interval_secs)
    }

    pub fn session_ttl_warm(&self) -> Duration {
        Duration::from_secs(self.session_ttl_warm_secs)
    }

    pub fn session_ttl_cold(&self) -> Duration {
        Duration::from_secs(self.session_ttl_cold_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_operator_table() {
        let config = ServerConfig::default();
        assert_eq!(config.heartbeat_interval_secs, 10);
        assert_eq!(config.upstream_read_deadline_secs, 40);
        assert_eq!(config.subscription_batch_window_ms, 100);
        assert_eq!(config.channel_send_queue, 256);
        assert_eq!(config.command_queue, 1024);
        assert_eq!(config.persistence_flush_interval_secs, 5);
        assert_eq!(config.per_trade_cap, 1.0);
        assert!(config.auto_square_off);
    }

    #[test]
    fn partial_toml_keeps_defaults_elsewhere() {
        let config: ServerConfig =
            toml::from_str("port = 9000\nchannel_send_queue = 64\n").expect("parse");
        assert_eq!(config.port, 9000);
        assert_eq!(config.channel_send_queue, 64);
        assert_eq!(config.heartbeat_interval_secs, 10);
    }

    #[test]
    fn square_off_window_parses() {
        let config = ServerConfig::default();
        let window = config.square_off_window().expect("window");
        assert_eq!(window.start.to_string(), "15:15:00");
    }
}
