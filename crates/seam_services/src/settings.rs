//! Settings management

use seam_net::channel::HealthCheckPolicy;
use seam_net::handoff::HandoffConfig;
use seam_net::{CellId, ServerDescriptor};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Mesh node settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub channel: ChannelSettings,
    pub handoff: HandoffSettings,
    pub registry: RegistrySettings,
    pub bootstrap: BootstrapSettings,
    /// Used when `RUST_LOG` is unset.
    pub log_filter: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub exchange: String,
    pub routing_prefix: String,
    pub persistent: bool,
    pub health_check_interval_ms: u64,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    pub reconnect_multiplier: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffSettings {
    pub session_ttl_ms: u64,
    pub dispatch_timeout_ms: u64,
    pub reaper_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub heartbeat_timeout_ms: u64,
    pub liveness_sweep_interval_ms: u64,
}

/// World servers and cell assignments to load at startup.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSettings {
    pub servers: Vec<ServerBootstrap>,
    pub cells: Vec<CellBootstrap>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerBootstrap {
    pub public_address: String,
    pub internal_address: String,
    #[serde(default)]
    pub rpc_endpoint: Option<String>,
    #[serde(default)]
    pub starting_load: u32,
}

impl ServerBootstrap {
    pub fn descriptor(&self) -> ServerDescriptor {
        let mut descriptor = ServerDescriptor::new(&self.public_address, &self.internal_address)
            .with_starting_load(self.starting_load);
        descriptor.rpc_endpoint = self.rpc_endpoint.clone();
        descriptor
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellBootstrap {
    pub cell: CellId,
    /// Index into `bootstrap.servers`.
    pub server: usize,
    #[serde(default)]
    pub map_instance: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            channel: ChannelSettings::default(),
            handoff: HandoffSettings::default(),
            registry: RegistrySettings::default(),
            bootstrap: BootstrapSettings::default(),
            log_filter: "info,seam_net=info".to_string(),
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        let config = HandoffConfig::default();
        let policy = HealthCheckPolicy::default();
        Self {
            exchange: config.exchange,
            routing_prefix: config.routing_prefix,
            persistent: config.persistent,
            health_check_interval_ms: policy.interval.as_millis() as u64,
            reconnect_initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            reconnect_max_backoff_ms: policy.max_backoff.as_millis() as u64,
            reconnect_multiplier: policy.multiplier,
        }
    }
}

impl Default for HandoffSettings {
    fn default() -> Self {
        Self {
            session_ttl_ms: 30_000,
            dispatch_timeout_ms: 5_000,
            reaper_interval_ms: 10_000,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 15_000,
            liveness_sweep_interval_ms: 5_000,
        }
    }
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "loading settings");
        let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, SettingsError> {
        let settings: Settings = serde_json::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let non_zero = [
            ("handoff.session_ttl_ms", self.handoff.session_ttl_ms),
            ("handoff.dispatch_timeout_ms", self.handoff.dispatch_timeout_ms),
            ("channel.health_check_interval_ms", self.channel.health_check_interval_ms),
            ("channel.reconnect_initial_backoff_ms", self.channel.reconnect_initial_backoff_ms),
            ("channel.reconnect_max_backoff_ms", self.channel.reconnect_max_backoff_ms),
            ("channel.reconnect_multiplier", u64::from(self.channel.reconnect_multiplier)),
        ];
        if let Some((field, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(SettingsError::Invalid(format!("{field} must be non-zero")));
        }
        // A publish may not outlive its session.
        if self.handoff.dispatch_timeout_ms >= self.handoff.session_ttl_ms {
            return Err(SettingsError::Invalid(
                "handoff.dispatch_timeout_ms must be shorter than handoff.session_ttl_ms".into(),
            ));
        }
        if self.channel.reconnect_initial_backoff_ms > self.channel.reconnect_max_backoff_ms {
            return Err(SettingsError::Invalid(
                "channel.reconnect_initial_backoff_ms exceeds channel.reconnect_max_backoff_ms"
                    .into(),
            ));
        }
        if self.channel.routing_prefix.trim().is_empty() {
            return Err(SettingsError::Invalid("channel.routing_prefix is empty".into()));
        }
        for cell in &self.bootstrap.cells {
            if cell.cell.is_blank() {
                return Err(SettingsError::Invalid("bootstrap cell id is empty".into()));
            }
            if cell.server >= self.bootstrap.servers.len() {
                return Err(SettingsError::Invalid(format!(
                    "cell {} refers to server #{} but only {} are listed",
                    cell.cell,
                    cell.server,
                    self.bootstrap.servers.len()
                )));
            }
        }
        Ok(())
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.handoff.reaper_interval_ms.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.registry.heartbeat_timeout_ms)
    }

    pub fn liveness_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.registry.liveness_sweep_interval_ms.max(1))
    }
}

impl From<&Settings> for HandoffConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            exchange: settings.channel.exchange.clone(),
            routing_prefix: settings.channel.routing_prefix.clone(),
            persistent: settings.channel.persistent,
            session_ttl: Duration::from_millis(settings.handoff.session_ttl_ms),
            dispatch_timeout: Duration::from_millis(settings.handoff.dispatch_timeout_ms),
        }
    }
}

impl From<&ChannelSettings> for HealthCheckPolicy {
    fn from(channel: &ChannelSettings) -> Self {
        Self {
            interval: Duration::from_millis(channel.health_check_interval_ms),
            initial_backoff: Duration::from_millis(channel.reconnect_initial_backoff_ms),
            max_backoff: Duration::from_millis(channel.reconnect_max_backoff_ms),
            multiplier: channel.reconnect_multiplier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_library_defaults() {
        let settings = Settings::default();
        assert_eq!(HandoffConfig::from(&settings), HandoffConfig::default());
        assert_eq!(HealthCheckPolicy::from(&settings.channel), HealthCheckPolicy::default());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let settings = Settings::from_json(
            r#"{
                "handoff": { "session_ttl_ms": 10000 },
                "bootstrap": {
                    "servers": [
                        {
                            "public_address": "203.0.113.3",
                            "internal_address": "10.0.0.3",
                            "rpc_endpoint": "rpc://10.0.0.3:7777"
                        }
                    ],
                    "cells": [ { "cell": "A07", "server": 0 } ]
                }
            }"#,
        )
        .unwrap();

        assert_eq!(settings.handoff.session_ttl_ms, 10_000);
        assert_eq!(settings.handoff.dispatch_timeout_ms, 5_000);
        assert_eq!(settings.channel.routing_prefix, "handoff.prepare");
        assert_eq!(settings.bootstrap.cells[0].cell.as_str(), "A07");

        let descriptor = settings.bootstrap.servers[0].descriptor();
        assert_eq!(descriptor.rpc_endpoint.as_deref(), Some("rpc://10.0.0.3:7777"));
        assert_eq!(descriptor.starting_load, Some(0));
    }

    #[test]
    fn dangling_cell_reference_is_rejected() {
        let raw = r#"{ "bootstrap": { "cells": [ { "cell": "A07", "server": 2 } ] } }"#;
        let err = Settings::from_json(raw).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid(_)));
    }

    #[test]
    fn dispatch_timeout_must_fit_inside_session_ttl() {
        for (ttl, dispatch) in [(100, 5_000), (5_000, 5_000)] {
            let mut settings = Settings::default();
            settings.handoff.session_ttl_ms = ttl;
            settings.handoff.dispatch_timeout_ms = dispatch;
            let err = settings.validate().unwrap_err();
            assert!(err.to_string().contains("shorter than"), "{err}");
        }
    }

    #[test]
    fn zero_health_check_timings_are_rejected() {
        let zeroed: [fn(&mut ChannelSettings); 4] = [
            |c| c.health_check_interval_ms = 0,
            |c| c.reconnect_initial_backoff_ms = 0,
            |c| c.reconnect_max_backoff_ms = 0,
            |c| c.reconnect_multiplier = 0,
        ];
        for zero in zeroed {
            let mut settings = Settings::default();
            zero(&mut settings.channel);
            let err = settings.validate().unwrap_err();
            assert!(err.to_string().contains("must be non-zero"), "{err}");
        }
    }

    #[test]
    fn initial_backoff_cannot_exceed_max() {
        let mut settings = Settings::default();
        settings.channel.reconnect_initial_backoff_ms = 20_000;
        assert!(matches!(settings.validate(), Err(SettingsError::Invalid(_))));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(Settings::from_json("{ nope"), Err(SettingsError::Parse(_))));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Settings::load("/definitely/not/here/seam.json").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here/seam.json"));
    }
}
