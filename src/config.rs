//! Configuration handling for the tunnel plugin

use crate::request::Provider;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub timing: TimingConfig,
    pub service: ServiceConfig,
    pub hans: HansConfig,
    pub iodine: IodineConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Prober deadline, `0` disables it
    pub tunnel_deadline_secs: u64,
    pub terminate_grace_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 1000,
            probe_timeout_ms: 1000,
            tunnel_deadline_secs: 60,
            terminate_grace_secs: 5,
        }
    }
}

impl TimingConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn tunnel_deadline(&self) -> Option<Duration> {
        (self.tunnel_deadline_secs > 0).then(|| Duration::from_secs(self.tunnel_deadline_secs))
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Leave the service loop once the connection is torn down.
    ///
    /// The process exits right after, so a repeated `Disconnect` reaches no
    /// controller and is answered with an error instead of `StateChanged`.
    pub exit_on_disconnect: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            exit_on_disconnect: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HansConfig {
    pub binary: String,
    pub device: String,
    pub probe: bool,
    pub probe_target: Ipv4Addr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    pub mtu: u32,
    pub prefix: u8,
    pub host_routes: Vec<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_metric: Option<u32>,
    pub flush_addresses: bool,
}

impl Default for HansConfig {
    fn default() -> Self {
        Self {
            binary: "hans".to_string(),
            device: "tun0".to_string(),
            probe: true,
            probe_target: Ipv4Addr::new(10, 1, 2, 1),
            gateway: Some(Ipv4Addr::new(10, 1, 2, 254)),
            dns: vec![Ipv4Addr::new(8, 8, 8, 8)],
            mtu: 1467,
            prefix: 24,
            host_routes: vec![Ipv4Addr::new(10, 1, 2, 1)],
            route_metric: Some(5),
            flush_addresses: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IodineConfig {
    pub binary: String,
    pub device: String,
    /// Race the prober against the output classifier
    pub probe: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_target: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    pub mtu: u32,
    pub prefix: u8,
    pub host_routes: Vec<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_metric: Option<u32>,
    pub flush_addresses: bool,
}

impl Default for IodineConfig {
    fn default() -> Self {
        Self {
            binary: "iodine".to_string(),
            device: "dns0".to_string(),
            probe: false,
            probe_target: None,
            gateway: None,
            dns: Vec::new(),
            mtu: 1130,
            prefix: 27,
            host_routes: Vec::new(),
            route_metric: None,
            flush_addresses: false,
        }
    }
}

/// Provider settings after defaults have been applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub binary: String,
    pub device: String,
    pub probe: bool,
    pub probe_target: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    pub mtu: u32,
    pub prefix: u8,
    pub host_routes: Vec<Ipv4Addr>,
    pub route_metric: Option<u32>,
    pub flush_addresses: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn profile(&self, provider: Provider) -> ProviderProfile {
        match provider {
            Provider::Hans => {
                let c = &self.hans;
                ProviderProfile {
                    binary: c.binary.clone(),
                    device: c.device.clone(),
                    probe: c.probe,
                    probe_target: Some(c.probe_target),
                    gateway: c.gateway,
                    dns: c.dns.clone(),
                    mtu: c.mtu,
                    prefix: c.prefix,
                    host_routes: c.host_routes.clone(),
                    route_metric: c.route_metric,
                    flush_addresses: c.flush_addresses,
                }
            }
            Provider::Iodine => {
                let c = &self.iodine;
                ProviderProfile {
                    binary: c.binary.clone(),
                    device: c.device.clone(),
                    probe: c.probe,
                    probe_target: c.probe_target,
                    gateway: c.gateway,
                    dns: c.dns.clone(),
                    mtu: c.mtu,
                    prefix: c.prefix,
                    host_routes: c.host_routes.clone(),
                    route_metric: c.route_metric,
                    flush_addresses: c.flush_addresses,
                }
            }
        }
    }
}
