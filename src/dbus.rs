//! NetworkManager VPN plugin service on the system bus
//!
//! Method calls are forwarded to the controller as commands. Signals are
//! only ever emitted by the controller's event loop, through
//! [`DbusControlPlane`].

use crate::codec::{Ip4Config, WireValue};
use crate::config::Config;
use crate::controller::{ControlPlane, Controller, ControllerError, ControllerHandle, EmitError};
use crate::platform::SystemLinkControl;
use crate::request::{Provider, VpnSettings};
use crate::secrets::need_secrets_marker;
use crate::state::PluginSignal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use zbus::object_server::SignalContext;
use zbus::zvariant::{OwnedValue, Value};
use zbus::{fdo, interface, Connection};

pub const PLUGIN_PATH: &str = "/org/freedesktop/NetworkManager/VPN/Plugin";

const COMMAND_QUEUE: usize = 16;

/// `a{sa{sv}}` connection settings as sent by NetworkManager
pub type ConnectionSettings = HashMap<String, HashMap<String, OwnedValue>>;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("D-Bus error: {0}")]
    DbusError(#[from] zbus::Error),
    #[error("Failed to install signal handler: {0}")]
    SignalError(#[from] std::io::Error),
    #[error("Controller task failed: {0}")]
    ControllerError(String),
}

/// Reduce a connection payload to its `vpn` section
pub fn vpn_settings(mut connection: ConnectionSettings) -> VpnSettings {
    let Some(mut vpn) = connection.remove("vpn") else {
        warn!("Connection has no vpn section");
        return VpnSettings::new();
    };
    VpnSettings {
        data: string_map(vpn.remove("data"), "data"),
        secrets: string_map(vpn.remove("secrets"), "secrets"),
    }
}

fn string_map(value: Option<OwnedValue>, section: &str) -> BTreeMap<String, String> {
    let Some(value) = value else {
        return BTreeMap::new();
    };
    match HashMap::<String, String>::try_from(value) {
        Ok(map) => map.into_iter().collect(),
        Err(e) => {
            warn!("Ignoring malformed vpn.{}: {}", section, e);
            BTreeMap::new()
        }
    }
}

fn failed(e: ControllerError) -> fdo::Error {
    fdo::Error::Failed(e.to_string())
}

pub struct VpnPlugin {
    provider: Provider,
    handle: ControllerHandle,
}

impl VpnPlugin {
    pub fn new(provider: Provider, handle: ControllerHandle) -> Self {
        Self { provider, handle }
    }
}

#[interface(name = "org.freedesktop.NetworkManager.VPN.Plugin")]
impl VpnPlugin {
    async fn connect(&self, connection: ConnectionSettings) -> fdo::Result<()> {
        debug!("Connect called for {}", self.provider);
        self.handle
            .connect(vpn_settings(connection))
            .await
            .map_err(failed)
    }

    async fn connect_interactive(
        &self,
        connection: ConnectionSettings,
        _details: HashMap<String, OwnedValue>,
    ) -> fdo::Result<()> {
        debug!("ConnectInteractive called for {}", self.provider);
        self.handle
            .connect_interactive(vpn_settings(connection))
            .await
            .map_err(failed)
    }

    async fn need_secrets(&self, settings: ConnectionSettings) -> fdo::Result<String> {
        Ok(need_secrets_marker(&vpn_settings(settings)).to_string())
    }

    async fn new_secrets(&self, connection: ConnectionSettings) -> fdo::Result<()> {
        self.handle
            .new_secrets(vpn_settings(connection))
            .await
            .map_err(failed)
    }

    async fn disconnect(&self) -> fdo::Result<()> {
        self.handle.disconnect().await.map_err(failed)
    }

    #[zbus(signal)]
    async fn state_changed(ctxt: &SignalContext<'_>, state: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn failure(ctxt: &SignalContext<'_>, reason: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn ip4_config(ctxt: &SignalContext<'_>, config: HashMap<&str, Value<'_>>) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn secrets_required(
        ctxt: &SignalContext<'_>,
        message: &str,
        secrets: Vec<String>,
    ) -> zbus::Result<()>;
}

/// `a{sv}` form of an IPv4 configuration
pub fn ip4_config_dict(config: &Ip4Config) -> HashMap<&'static str, Value<'static>> {
    config
        .to_wire()
        .into_iter()
        .map(|(key, value)| (key, wire_value(value)))
        .collect()
}

fn wire_value(value: WireValue) -> Value<'static> {
    match value {
        WireValue::U32(v) => Value::from(v),
        WireValue::Str(s) => Value::from(s),
        WireValue::U32List(list) => Value::from(list),
        WireValue::Routes(routes) => Value::from(routes),
        WireValue::AddressData(entries) => {
            let entries: Vec<HashMap<String, Value<'static>>> = entries
                .into_iter()
                .map(|(address, prefix)| {
                    HashMap::from([
                        ("address".to_string(), Value::from(address)),
                        ("prefix".to_string(), Value::from(prefix)),
                    ])
                })
                .collect();
            Value::from(entries)
        }
    }
}

/// Emits plugin signals on a bus connection
#[derive(Clone)]
pub struct DbusControlPlane {
    connection: Connection,
}

impl DbusControlPlane {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }
}

impl ControlPlane for DbusControlPlane {
    async fn emit(&self, signal: PluginSignal) -> Result<(), EmitError> {
        let name = signal.name();
        let to_emit_error = |e: zbus::Error| EmitError {
            signal: name,
            message: e.to_string(),
        };
        let ctxt = SignalContext::new(&self.connection, PLUGIN_PATH).map_err(to_emit_error)?;

        let result = match signal {
            PluginSignal::StateChanged { state, reason } => {
                info!("State {:?} ({}): {}", state, state.code(), reason);
                VpnPlugin::state_changed(&ctxt, state.code()).await
            }
            PluginSignal::Failure(code) => {
                info!("Failure {:?} ({})", code, code.code());
                VpnPlugin::failure(&ctxt, code.code()).await
            }
            PluginSignal::Ip4Config(config) => {
                VpnPlugin::ip4_config(&ctxt, ip4_config_dict(&config)).await
            }
            PluginSignal::SecretsRequired { message, secrets } => {
                VpnPlugin::secrets_required(&ctxt, &message, secrets).await
            }
        };
        result.map_err(to_emit_error)
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<(), ServiceError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<(), ServiceError> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Own the provider's bus name and serve until disconnect or a termination signal
pub async fn serve(provider: Provider, config: Config) -> Result<(), ServiceError> {
    let (handle, commands) = ControllerHandle::channel(COMMAND_QUEUE);

    let connection = zbus::connection::Builder::system()?
        .name(provider.bus_name())?
        .serve_at(PLUGIN_PATH, VpnPlugin::new(provider, handle.clone()))?
        .build()
        .await?;
    info!("Serving {} plugin as {}", provider, provider.bus_name());

    let controller = Controller::new(
        provider,
        Arc::new(config),
        DbusControlPlane::new(connection.clone()),
        Arc::new(SystemLinkControl::new()),
        commands,
    );
    let mut task = tokio::spawn(controller.run());

    tokio::select! {
        result = &mut task => {
            result.map_err(|e| ServiceError::ControllerError(e.to_string()))?;
        }
        result = shutdown_signal() => {
            result?;
            info!("Termination requested");
            if let Err(e) = handle.shutdown().await {
                debug!("Controller already stopped: {}", e);
            }
            task.await
                .map_err(|e| ServiceError::ControllerError(e.to_string()))?;
        }
    }

    info!("{} plugin exiting", provider);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_address, encode_route_component, Ip4Route};
    use std::net::Ipv4Addr;

    fn owned(map: HashMap<String, String>) -> OwnedValue {
        OwnedValue::try_from(Value::from(map)).unwrap()
    }

    fn connection(data: &[(&str, &str)], secrets: &[(&str, &str)]) -> ConnectionSettings {
        let to_map = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>()
        };
        let vpn = HashMap::from([
            ("data".to_string(), owned(to_map(data))),
            ("secrets".to_string(), owned(to_map(secrets))),
        ]);
        HashMap::from([("vpn".to_string(), vpn)])
    }

    #[test]
    fn test_vpn_settings_from_connection() {
        let settings = vpn_settings(connection(
            &[("topdomain", "t.example.com"), ("nameserver", "192.168.1.1")],
            &[("password", "pw")],
        ));

        assert_eq!(settings.data("topdomain"), Some("t.example.com"));
        assert_eq!(settings.data("nameserver"), Some("192.168.1.1"));
        assert_eq!(settings.password(), Some("pw"));
    }

    #[test]
    fn test_vpn_settings_without_vpn_section() {
        let settings = vpn_settings(HashMap::new());
        assert!(settings.data.is_empty());
        assert!(settings.secrets.is_empty());
    }

    #[test]
    fn test_malformed_section_is_ignored() {
        let vpn = HashMap::from([
            ("data".to_string(), OwnedValue::try_from(Value::from(7u32)).unwrap()),
            (
                "secrets".to_string(),
                owned(HashMap::from([("password".to_string(), "pw".to_string())])),
            ),
        ]);
        let settings = vpn_settings(HashMap::from([("vpn".to_string(), vpn)]));

        assert!(settings.data.is_empty());
        assert_eq!(settings.password(), Some("pw"));
    }

    #[test]
    fn test_ip4_config_dict() {
        let config = Ip4Config {
            address: Ipv4Addr::new(10, 1, 2, 100),
            prefix: 24,
            gateway: Some(Ipv4Addr::new(10, 1, 2, 254)),
            ptp: None,
            dns: vec![Ipv4Addr::new(8, 8, 8, 8)],
            mtu: 1467,
            tundev: "tun0".into(),
            routes: vec![Ip4Route::host(Ipv4Addr::new(10, 1, 2, 1))],
            route_metric: Some(5),
        };

        let dict = ip4_config_dict(&config);

        assert_eq!(dict["address"], Value::U32(encode_address("10.1.2.100").unwrap()));
        assert_eq!(dict["prefix"], Value::U32(24));
        assert_eq!(dict["tundev"], Value::from("tun0"));
        assert_eq!(
            dict["dns"],
            Value::from(vec![encode_address("8.8.8.8").unwrap()])
        );
        assert_eq!(
            dict["routes"],
            Value::from(vec![(encode_route_component("10.1.2.1").unwrap(), 32u32, 0u32)])
        );
        assert_eq!(dict["routes"].value_signature().as_str(), "a(uuu)");
        assert_eq!(dict["address-data"].value_signature().as_str(), "aa{sv}");
        assert!(!dict.contains_key("ptp"));
    }
}
