//! Tunnel parameters discovered during a connection attempt
//!
//! The output reader and the readiness prober may both learn parameters for
//! the same attempt. Every field is write-once: the first writer wins and
//! later writes within the attempt are ignored. The config-sent latch
//! guarantees the IPv4 configuration is handed to the host at most once.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// A single fact learned about the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    Device(String),
    ClientAddress(Ipv4Addr),
    PeerAddress(Ipv4Addr),
    RelayAddress(Ipv4Addr),
    Mtu(u32),
    Prefix(u8),
}

impl Discovery {
    pub fn field(&self) -> &'static str {
        match self {
            Discovery::Device(_) => "device",
            Discovery::ClientAddress(_) => "client address",
            Discovery::PeerAddress(_) => "peer address",
            Discovery::RelayAddress(_) => "relay address",
            Discovery::Mtu(_) => "mtu",
            Discovery::Prefix(_) => "prefix",
        }
    }
}

#[derive(Debug, Default)]
pub struct DiscoveredParameters {
    device: OnceLock<String>,
    client_address: OnceLock<Ipv4Addr>,
    peer_address: OnceLock<Ipv4Addr>,
    relay_address: OnceLock<Ipv4Addr>,
    mtu: OnceLock<u32>,
    prefix: OnceLock<u8>,
}

impl DiscoveredParameters {
    /// Store a discovery. Returns `false` if the field was already set.
    pub fn record(&self, discovery: Discovery) -> bool {
        match discovery {
            Discovery::Device(v) => self.device.set(v).is_ok(),
            Discovery::ClientAddress(v) => self.client_address.set(v).is_ok(),
            Discovery::PeerAddress(v) => self.peer_address.set(v).is_ok(),
            Discovery::RelayAddress(v) => self.relay_address.set(v).is_ok(),
            Discovery::Mtu(v) => self.mtu.set(v).is_ok(),
            Discovery::Prefix(v) => self.prefix.set(v).is_ok(),
        }
    }

    /// Both tunnel endpoints are known
    pub fn has_endpoints(&self) -> bool {
        self.client_address.get().is_some() && self.peer_address.get().is_some()
    }

    pub fn snapshot(&self) -> ParameterSnapshot {
        ParameterSnapshot {
            device: self.device.get().cloned(),
            client_address: self.client_address.get().copied(),
            peer_address: self.peer_address.get().copied(),
            relay_address: self.relay_address.get().copied(),
            mtu: self.mtu.get().copied(),
            prefix: self.prefix.get().copied(),
        }
    }
}

/// Point-in-time copy of the discovered parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSnapshot {
    pub device: Option<String>,
    pub client_address: Option<Ipv4Addr>,
    pub peer_address: Option<Ipv4Addr>,
    pub relay_address: Option<Ipv4Addr>,
    pub mtu: Option<u32>,
    pub prefix: Option<u8>,
}

/// Single-emission guard for the IPv4 configuration
#[derive(Debug, Default)]
pub struct ConfigLatch(AtomicBool);

impl ConfigLatch {
    /// Claim the right to send the configuration. Only the first caller gets `true`.
    pub fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// State shared between the event loop and the workers of one attempt
#[derive(Debug, Default)]
pub struct AttemptShared {
    pub params: DiscoveredParameters,
    pub config_sent: ConfigLatch,
}
