//! JSON configuration accepted by a point, and its validation rules.

use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

use crate::logger::{self, BreadcrumbFlags, LogLevel};

const LOG_LEVELS: [&str; 5] = ["debug", "info", "warning", "error", "none"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Forward,
    Blackhole,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub loglevel: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            loglevel: default_log_level(),
        }
    }
}

impl LogConfig {
    /// Threshold for engine lines; `None` silences the engine entirely.
    pub fn level(&self) -> Option<LogLevel> {
        match self.loglevel.as_str() {
            "none" => None,
            other => Some(LogLevel::from_str(other)),
        }
    }
}

fn default_log_level() -> String {
    "warning".to_string()
}

/// Presence of the `stats` object enables the traffic counters.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StatsConfig {}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct InboundSettings {
    pub outbound: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InboundConfig {
    #[serde(default)]
    pub tag: String,
    #[serde(default = "default_listen")]
    pub listen: IpAddr,
    #[serde(default)]
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub settings: InboundSettings,
}

fn default_listen() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct OutboundSettings {
    pub address: Option<String>,
    pub port: Option<u16>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OutboundConfig {
    pub tag: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub settings: OutboundSettings,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PointConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub stats: Option<StatsConfig>,
    /// Asset name of an optional static hosts table.
    #[serde(default)]
    pub hosts: Option<String>,
    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,
    #[serde(default)]
    pub outbounds: Vec<OutboundConfig>,
}

impl PointConfig {
    pub fn stats_enabled(&self) -> bool {
        self.stats.is_some()
    }

    #[cfg(test)]
    pub(crate) fn outbound(&self, tag: &str) -> Option<&OutboundConfig> {
        self.outbounds.iter().find(|outbound| outbound.tag == tag)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log.loglevel.as_str()) {
            return Err(invalid(format!(
                "unknown log level '{}'",
                self.log.loglevel
            )));
        }
        if self.outbounds.is_empty() {
            return Err(invalid("at least one outbound is required"));
        }

        let mut outbound_tags = HashSet::new();
        for outbound in &self.outbounds {
            if outbound.tag.is_empty() {
                return Err(invalid("outbound tag must not be empty"));
            }
            if !outbound_tags.insert(outbound.tag.as_str()) {
                return Err(invalid(format!("duplicate outbound tag '{}'", outbound.tag)));
            }
            if outbound.protocol == Protocol::Forward {
                let address = outbound.settings.address.as_deref().unwrap_or("");
                if address.trim().is_empty() {
                    return Err(invalid(format!(
                        "outbound '{}' needs settings.address",
                        outbound.tag
                    )));
                }
                if outbound.settings.port.unwrap_or(0) == 0 {
                    return Err(invalid(format!(
                        "outbound '{}' needs a non-zero settings.port",
                        outbound.tag
                    )));
                }
            }
        }

        let mut inbound_tags = HashSet::new();
        for inbound in &self.inbounds {
            if !inbound.tag.is_empty() && !inbound_tags.insert(inbound.tag.as_str()) {
                return Err(invalid(format!("duplicate inbound tag '{}'", inbound.tag)));
            }
            if inbound.protocol != Protocol::Forward {
                return Err(invalid(format!(
                    "inbound '{}' must use the forward protocol",
                    inbound.tag
                )));
            }
            match inbound.settings.outbound.as_deref() {
                Some(target) if outbound_tags.contains(target) => {}
                Some(target) => {
                    return Err(invalid(format!(
                        "inbound '{}' references unknown outbound '{}'",
                        inbound.tag, target
                    )))
                }
                None => {
                    return Err(invalid(format!(
                        "inbound '{}' needs settings.outbound",
                        inbound.tag
                    )))
                }
            }
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Parses and validates raw configuration text. Starts nothing.
pub fn load_json(text: &str) -> Result<PointConfig, ConfigError> {
    let config: PointConfig = serde_json::from_str(text)?;
    config.validate()?;
    logger::breadcrumb(
        BreadcrumbFlags::CONFIG,
        format!(
            "config loaded: {} inbounds, {} outbounds, stats={}",
            config.inbounds.len(),
            config.outbounds.len(),
            config.stats_enabled()
        ),
    );
    Ok(config)
}
