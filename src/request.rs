//! Connection request parsing and validation
//!
//! NetworkManager hands the plugin a loosely-typed settings payload. It is
//! reduced to a [`VpnSettings`] (string maps for `data` and `secrets`) at the
//! D-Bus boundary and validated once into a [`ConnectionRequest`] here.
//!
//! # Recognised keys
//!
//! | Key | Section | Provider | Description |
//! |-----|---------|----------|-------------|
//! | `server` | data | HANS | Relay server to connect to |
//! | `topdomain` | data | Iodine | Delegated DNS domain of the tunnel |
//! | `password` | secrets (or data) | both | Tunnel password |
//! | `nameserver` | data | Iodine | Resolver to send DNS queries through |
//! | `fragsize` | data | Iodine | Maximum downstream fragment size |
//! | `dns` | data | both | DNS server to hand to the host |
//! | `gateway` | data | both | Tunnel-side gateway address |

use crate::supervisor::TunnelCommand;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

pub const PASSWORD_KEY: &str = "password";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Missing required field(s): {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Tunnel implementation a plugin instance drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// ICMP tunnel; silent on stdout, detected through the tunnel interface
    Hans,
    /// DNS tunnel; reports its parameters on its output
    Iodine,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Hans => "hans",
            Provider::Iodine => "iodine",
        }
    }

    /// Well-known bus name NetworkManager looks the plugin up by
    pub fn bus_name(&self) -> &'static str {
        match self {
            Provider::Hans => "org.freedesktop.NetworkManager.hans",
            Provider::Iodine => "org.freedesktop.NetworkManager.iodine",
        }
    }

    /// Data key naming the remote end of the tunnel
    pub fn endpoint_key(&self) -> &'static str {
        match self {
            Provider::Hans => "server",
            Provider::Iodine => "topdomain",
        }
    }

    /// Whether the tunnel binary prints its negotiated parameters
    pub fn parses_output(&self) -> bool {
        matches!(self, Provider::Iodine)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A credential that never shows up in `Debug` output
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(*****)")
    }
}

/// Raw `vpn` section of a connection, as received from the host
#[derive(Clone, Default, PartialEq, Eq)]
pub struct VpnSettings {
    pub data: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
}

impl VpnSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(mut self, key: &str, value: &str) -> Self {
        self.data.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_secret(mut self, key: &str, value: &str) -> Self {
        self.secrets.insert(key.to_string(), value.to_string());
        self
    }

    /// Non-empty data value for `key`
    pub fn data(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Password from `secrets`, falling back to `data`
    pub fn password(&self) -> Option<&str> {
        self.secrets
            .get(PASSWORD_KEY)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .or_else(|| {
                self.data
                    .get(PASSWORD_KEY)
                    .map(String::as_str)
                    .filter(|v| !v.is_empty())
            })
    }

    /// Fold a later, partial payload into this one.
    ///
    /// Secrets are added to (and override) the held ones; data keys present
    /// in `supplied` replace the held values, other held keys are kept.
    pub fn merge(&mut self, supplied: VpnSettings) {
        self.secrets.extend(supplied.secrets);
        self.data.extend(supplied.data);
    }
}

impl fmt::Debug for VpnSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VpnSettings")
            .field("data", &self.data.keys().collect::<Vec<_>>())
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Validated connection request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub provider: Provider,
    /// HANS server or Iodine top domain
    pub endpoint: String,
    pub password: Secret,
    pub nameserver: Option<String>,
    pub fragsize: Option<u32>,
    pub dns: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
}

impl ConnectionRequest {
    /// Validate a settings payload for `provider`
    pub fn from_settings(provider: Provider, settings: &VpnSettings) -> Result<Self, RequestError> {
        let endpoint = settings.data(provider.endpoint_key());
        let password = settings.password();

        let mut missing = Vec::new();
        if endpoint.is_none() {
            missing.push(provider.endpoint_key());
        }
        if password.is_none() {
            missing.push(PASSWORD_KEY);
        }
        let (Some(endpoint), Some(password)) = (endpoint, password) else {
            return Err(RequestError::MissingFields(missing));
        };

        let (nameserver, fragsize) = match provider {
            Provider::Iodine => (
                settings.data("nameserver").map(str::to_string),
                parse_optional(settings, "fragsize")?,
            ),
            Provider::Hans => (None, None),
        };

        Ok(Self {
            provider,
            endpoint: endpoint.to_string(),
            password: Secret::new(password),
            nameserver,
            fragsize,
            dns: parse_optional(settings, "dns")?,
            gateway: parse_optional(settings, "gateway")?,
        })
    }

    /// Argument vector for the tunnel binary, running in the foreground
    pub fn tunnel_command(&self, binary: &str) -> TunnelCommand {
        match self.provider {
            Provider::Hans => TunnelCommand::new(binary)
                .arg("-f")
                .arg("-c")
                .arg(&self.endpoint)
                .arg("-p")
                .secret(self.password.expose()),
            Provider::Iodine => {
                let mut command = TunnelCommand::new(binary)
                    .arg("-f")
                    .arg("-P")
                    .secret(self.password.expose());
                if let Some(fragsize) = self.fragsize {
                    command = command.arg("-m").arg(fragsize.to_string());
                }
                if let Some(ref nameserver) = self.nameserver {
                    command = command.arg(nameserver);
                }
                command.arg(&self.endpoint)
            }
        }
    }
}

fn parse_optional<T: FromStr>(
    settings: &VpnSettings,
    field: &'static str,
) -> Result<Option<T>, RequestError> {
    settings
        .data(field)
        .map(|value| {
            value.parse().map_err(|_| RequestError::InvalidValue {
                field,
                value: value.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iodine_request_from_settings() {
        let settings = VpnSettings::new()
            .with_data("topdomain", "t.example.com")
            .with_data("nameserver", "192.168.1.1")
            .with_data("fragsize", "1200")
            .with_secret("password", "hunter2");

        let request = ConnectionRequest::from_settings(Provider::Iodine, &settings).unwrap();

        assert_eq!(request.endpoint, "t.example.com");
        assert_eq!(request.password.expose(), "hunter2");
        assert_eq!(request.nameserver.as_deref(), Some("192.168.1.1"));
        assert_eq!(request.fragsize, Some(1200));
        assert_eq!(request.dns, None);
    }

    #[test]
    fn test_hans_password_from_data() {
        let settings = VpnSettings::new()
            .with_data("server", "relay.example.com")
            .with_data("password", "secret")
            .with_data("dns", "1.1.1.1")
            .with_data("gateway", "10.1.2.1");

        let request = ConnectionRequest::from_settings(Provider::Hans, &settings).unwrap();

        assert_eq!(request.password.expose(), "secret");
        assert_eq!(request.dns, Some(Ipv4Addr::new(1, 1, 1, 1)));
        assert_eq!(request.gateway, Some(Ipv4Addr::new(10, 1, 2, 1)));
    }

    #[test]
    fn test_missing_fields_are_all_reported() {
        let err = ConnectionRequest::from_settings(Provider::Hans, &VpnSettings::new()).unwrap_err();
        assert_eq!(err, RequestError::MissingFields(vec!["server", "password"]));
        assert_eq!(err.to_string(), "Missing required field(s): server, password");

        let settings = VpnSettings::new().with_data("topdomain", "t.example.com");
        let err = ConnectionRequest::from_settings(Provider::Iodine, &settings).unwrap_err();
        assert_eq!(err, RequestError::MissingFields(vec!["password"]));
    }

    #[test]
    fn test_blank_values_count_as_missing() {
        let settings = VpnSettings::new()
            .with_data("server", "  ")
            .with_secret("password", "");
        let err = ConnectionRequest::from_settings(Provider::Hans, &settings).unwrap_err();
        assert!(matches!(err, RequestError::MissingFields(ref f) if f.len() == 2));
    }

    #[test]
    fn test_invalid_optional_values() {
        let settings = VpnSettings::new()
            .with_data("topdomain", "t.example.com")
            .with_data("fragsize", "big")
            .with_secret("password", "pw");
        let err = ConnectionRequest::from_settings(Provider::Iodine, &settings).unwrap_err();
        assert!(matches!(err, RequestError::InvalidValue { field: "fragsize", .. }));

        let settings = VpnSettings::new()
            .with_data("server", "relay")
            .with_data("gateway", "not-an-ip")
            .with_data("password", "pw");
        let err = ConnectionRequest::from_settings(Provider::Hans, &settings).unwrap_err();
        assert!(err.to_string().contains("gateway"));
    }

    #[test]
    fn test_iodine_command_line() {
        let settings = VpnSettings::new()
            .with_data("topdomain", "t.example.com")
            .with_data("nameserver", "192.168.1.1")
            .with_data("fragsize", "1200")
            .with_secret("password", "hunter2");
        let request = ConnectionRequest::from_settings(Provider::Iodine, &settings).unwrap();

        let command = request.tunnel_command("iodine");

        assert_eq!(
            command.args(),
            ["-f", "-P", "hunter2", "-m", "1200", "192.168.1.1", "t.example.com"]
        );
        assert_eq!(
            command.to_string(),
            "iodine -f -P ***** -m 1200 192.168.1.1 t.example.com"
        );
    }

    #[test]
    fn test_hans_command_line() {
        let settings = VpnSettings::new()
            .with_data("server", "relay.example.com")
            .with_secret("password", "pw");
        let request = ConnectionRequest::from_settings(Provider::Hans, &settings).unwrap();

        let command = request.tunnel_command("/usr/sbin/hans");

        assert_eq!(command.program(), "/usr/sbin/hans");
        assert_eq!(command.args(), ["-f", "-c", "relay.example.com", "-p", "pw"]);
        assert_eq!(command.to_string(), "/usr/sbin/hans -f -c relay.example.com -p *****");
    }

    #[test]
    fn test_merge_keeps_held_data_and_overrides_supplied() {
        let mut held = VpnSettings::new()
            .with_data("topdomain", "old.example.com")
            .with_data("nameserver", "192.168.1.1");
        held.merge(
            VpnSettings::new()
                .with_data("topdomain", "new.example.com")
                .with_secret("password", "pw"),
        );

        assert_eq!(held.data("topdomain"), Some("new.example.com"));
        assert_eq!(held.data("nameserver"), Some("192.168.1.1"));
        assert_eq!(held.password(), Some("pw"));
    }

    #[test]
    fn test_debug_output_hides_secrets() {
        let settings = VpnSettings::new()
            .with_data("topdomain", "t.example.com")
            .with_secret("password", "hunter2");
        assert!(!format!("{:?}", settings).contains("hunter2"));

        let request = ConnectionRequest::from_settings(Provider::Iodine, &settings).unwrap();
        assert!(!format!("{:?}", request).contains("hunter2"));
    }

    #[test]
    fn test_provider_names() {
        assert_eq!(Provider::Hans.bus_name(), "org.freedesktop.NetworkManager.hans");
        assert_eq!(Provider::Iodine.to_string(), "iodine");
        assert!(Provider::Iodine.parses_output());
        assert!(!Provider::Hans.parses_output());
    }
}
