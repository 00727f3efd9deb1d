//! NetworkManager VPN plugin for HANS and Iodine tunnels
//!
//! This crate runs an ICMP (HANS) or DNS (Iodine) tunnel binary on behalf
//! of NetworkManager. It starts the tunnel, works out the negotiated IPv4
//! parameters and hands them to NetworkManager over the VPN plugin D-Bus
//! interface.
//!
//! # Architecture
//!
//! - `controller`: Connection state machine and its event loop
//! - `supervisor`: Tunnel process spawning, output forwarding, termination
//! - `classifier`: Line grammar for tunnel output (Iodine)
//! - `prober`: Interface readiness probing (HANS)
//! - `discovery`: Write-once tunnel parameters and the config-sent latch
//! - `codec`: IPv4 configuration record and its wire byte orders
//! - `secrets`: Interactive secrets negotiation
//! - `request`: Settings payload and validated connection request
//! - `platform`: Link operations on the tunnel interface (iproute2)
//! - `dbus`: NetworkManager VPN plugin service
//! - `config`: Configuration file handling (TOML)
//!
//! # Usage
//!
//! Installed as the plugin service NetworkManager starts for a connection:
//! ```bash
//! nm-tunnel-plugin --config /etc/nm-tunnel-plugin.toml serve iodine
//! ```

pub mod classifier;
pub mod codec;
pub mod config;
pub mod context;
pub mod controller;
pub mod dbus;
pub mod discovery;
pub mod platform;
pub mod prober;
pub mod request;
pub mod secrets;
pub mod state;
pub mod supervisor;

#[cfg(test)]
mod test_log;

pub use config::Config;
pub use controller::{Controller, ControllerHandle};
pub use request::{ConnectionRequest, Provider, VpnSettings};
pub use state::{ConnectionState, FailureReason};
