//! Host network operations used while bringing a tunnel up

pub mod linux;

use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Failed to bring up link: {0}")]
    LinkUpError(String),
    #[error("Failed to query interface address: {0}")]
    AddressQueryError(String),
    #[error("Failed to flush interface addresses: {0}")]
    FlushError(String),
    #[error("Failed to run reachability probe: {0}")]
    ProbeError(String),
}

/// IPv4 address assigned to an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub address: Ipv4Addr,
    pub prefix: u8,
}

/// Link and reachability operations on the tunnel interface
pub trait LinkControl: Send + Sync + 'static {
    /// Set the interface administratively up. Safe to repeat.
    fn set_link_up(&self, device: &str) -> impl Future<Output = Result<(), PlatformError>> + Send;

    /// First IPv4 address on the interface, if any
    fn ipv4_address(
        &self,
        device: &str,
    ) -> impl Future<Output = Result<Option<InterfaceAddress>, PlatformError>> + Send;

    /// Remove every address from the interface
    fn flush_addresses(&self, device: &str) -> impl Future<Output = Result<(), PlatformError>> + Send;

    /// Send a single echo request. `Ok(false)` means no reply within `timeout`.
    fn ping(
        &self,
        target: Ipv4Addr,
        timeout: Duration,
    ) -> impl Future<Output = Result<bool, PlatformError>> + Send;
}

/// Link control of the running host
pub type SystemLinkControl = linux::LinuxLinkControl;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_error_display() {
        let err = PlatformError::LinkUpError("no such device".to_string());
        assert_eq!(err.to_string(), "Failed to bring up link: no such device");

        let err = PlatformError::AddressQueryError("bad json".to_string());
        assert_eq!(err.to_string(), "Failed to query interface address: bad json");

        let err = PlatformError::FlushError("denied".to_string());
        assert_eq!(err.to_string(), "Failed to flush interface addresses: denied");

        let err = PlatformError::ProbeError("ping missing".to_string());
        assert_eq!(err.to_string(), "Failed to run reachability probe: ping missing");
    }
}
