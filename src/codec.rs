//! IPv4 configuration codec
//!
//! Translates discovered tunnel parameters into the `Ip4Config` record the
//! host control plane consumes.
//!
//! # Byte order
//!
//! NetworkManager reads scalar address fields (`address`, `gateway`, `ptp`,
//! `dns` entries) as the address octets laid out in memory on a
//! little-endian host, i.e. the *reverse* of network byte order when viewed
//! as a number. Route triples use plain network byte order. The two
//! encodings live here and nowhere else:
//!
//! | Address | `encode_address` | `encode_route_component` |
//! |---------|------------------|--------------------------|
//! | `10.1.2.1` | `0x0102010A` | `0x0A010201` |

use crate::discovery::ParameterSnapshot;
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid IPv4 address: {0}")]
    InvalidAddress(String),
    #[error("Missing {0} for IPv4 configuration")]
    MissingField(&'static str),
}

/// Encode a dotted quad as a scalar configuration value
pub fn encode_address(dotted: &str) -> Result<u32, CodecError> {
    Ok(scalar_value(parse(dotted)?))
}

/// Inverse of [`encode_address`]
pub fn decode_address(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value.to_le_bytes())
}

/// Encode a dotted quad as a route triple component
pub fn encode_route_component(dotted: &str) -> Result<u32, CodecError> {
    Ok(route_value(parse(dotted)?))
}

/// Inverse of [`encode_route_component`]
pub fn decode_route_component(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value.to_be_bytes())
}

fn parse(dotted: &str) -> Result<Ipv4Addr, CodecError> {
    dotted
        .trim()
        .parse()
        .map_err(|_| CodecError::InvalidAddress(dotted.to_string()))
}

fn scalar_value(addr: Ipv4Addr) -> u32 {
    u32::from_le_bytes(addr.octets())
}

fn route_value(addr: Ipv4Addr) -> u32 {
    u32::from_be_bytes(addr.octets())
}

/// Static route handed to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ip4Route {
    pub destination: Ipv4Addr,
    pub prefix: u8,
    /// `0.0.0.0` routes on-link through the tunnel device
    pub gateway: Ipv4Addr,
}

impl Ip4Route {
    pub fn host(destination: Ipv4Addr) -> Self {
        Self {
            destination,
            prefix: 32,
            gateway: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// Provider and request values used where nothing was discovered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ip4Defaults {
    pub prefix: u8,
    pub mtu: u32,
    pub device: String,
    /// Always wins over discovered addresses
    pub gateway_override: Option<Ipv4Addr>,
    /// Used when neither relay nor peer address is known
    pub fallback_gateway: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    pub routes: Vec<Ip4Route>,
    pub route_metric: Option<u32>,
}

/// IPv4 configuration record, before wire encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ip4Config {
    pub address: Ipv4Addr,
    pub prefix: u8,
    pub gateway: Option<Ipv4Addr>,
    pub ptp: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    pub mtu: u32,
    pub tundev: String,
    pub routes: Vec<Ip4Route>,
    pub route_metric: Option<u32>,
}

/// Value of one `Ip4Config` dictionary entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
    U32(u32),
    Str(String),
    U32List(Vec<u32>),
    /// `(destination, prefix, gateway)` triples
    Routes(Vec<(u32, u32, u32)>),
    /// `(address, prefix)` pairs of the `address-data` entry
    AddressData(Vec<(String, u32)>),
}

impl Ip4Config {
    /// Derive the configuration from what was discovered
    pub fn assemble(params: &ParameterSnapshot, defaults: &Ip4Defaults) -> Result<Self, CodecError> {
        let address = params
            .client_address
            .ok_or(CodecError::MissingField("client address"))?;

        let gateway = defaults
            .gateway_override
            .or(params.relay_address)
            .or(params.peer_address)
            .or(defaults.fallback_gateway);

        Ok(Self {
            address,
            prefix: params.prefix.unwrap_or(defaults.prefix),
            gateway,
            ptp: params.peer_address,
            dns: defaults.dns.clone(),
            mtu: params.mtu.unwrap_or(defaults.mtu),
            tundev: params
                .device
                .clone()
                .unwrap_or_else(|| defaults.device.clone()),
            routes: defaults.routes.clone(),
            route_metric: defaults.route_metric,
        })
    }

    /// Dictionary entries in the layout the host expects
    pub fn to_wire(&self) -> Vec<(&'static str, WireValue)> {
        let mut entries = vec![
            ("address", WireValue::U32(scalar_value(self.address))),
            ("prefix", WireValue::U32(u32::from(self.prefix))),
        ];
        if let Some(gateway) = self.gateway {
            entries.push(("gateway", WireValue::U32(scalar_value(gateway))));
        }
        if let Some(ptp) = self.ptp {
            entries.push(("ptp", WireValue::U32(scalar_value(ptp))));
        }
        entries.push(("mtu", WireValue::U32(self.mtu)));
        entries.push(("tundev", WireValue::Str(self.tundev.clone())));
        if !self.dns.is_empty() {
            entries.push((
                "dns",
                WireValue::U32List(self.dns.iter().copied().map(scalar_value).collect()),
            ));
        }
        if !self.routes.is_empty() {
            let routes = self
                .routes
                .iter()
                .map(|r| {
                    (
                        route_value(r.destination),
                        u32::from(r.prefix),
                        route_value(r.gateway),
                    )
                })
                .collect();
            entries.push(("routes", WireValue::Routes(routes)));
        }
        if let Some(metric) = self.route_metric {
            entries.push(("route-metric", WireValue::U32(metric)));
        }
        entries.push((
            "address-data",
            WireValue::AddressData(vec![(self.address.to_string(), u32::from(self.prefix))]),
        ));
        entries
    }
}
