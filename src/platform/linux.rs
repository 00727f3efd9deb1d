//! Linux implementation on top of iproute2 and ping

use super::{InterfaceAddress, LinkControl, PlatformError};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

pub struct LinuxLinkControl;

impl LinuxLinkControl {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinuxLinkControl {
    fn default() -> Self {
        Self::new()
    }
}

async fn ip(args: &[&str]) -> std::io::Result<Output> {
    debug!("ip {}", args.join(" "));
    Command::new("ip").args(args).output().await
}

fn check(output: Output, err: fn(String) -> PlatformError) -> Result<Output, PlatformError> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(err(stderr.trim().to_string()));
    }
    Ok(output)
}

impl LinkControl for LinuxLinkControl {
    async fn set_link_up(&self, device: &str) -> Result<(), PlatformError> {
        let output = ip(&["link", "set", device, "up"])
            .await
            .map_err(|e| PlatformError::LinkUpError(e.to_string()))?;
        check(output, PlatformError::LinkUpError)?;
        Ok(())
    }

    async fn ipv4_address(&self, device: &str) -> Result<Option<InterfaceAddress>, PlatformError> {
        let output = ip(&["-j", "-4", "addr", "show", "dev", device])
            .await
            .map_err(|e| PlatformError::AddressQueryError(e.to_string()))?;
        let output = check(output, PlatformError::AddressQueryError)?;
        parse_ipv4_address(&output.stdout)
    }

    async fn flush_addresses(&self, device: &str) -> Result<(), PlatformError> {
        let output = ip(&["addr", "flush", "dev", device])
            .await
            .map_err(|e| PlatformError::FlushError(e.to_string()))?;
        check(output, PlatformError::FlushError)?;
        Ok(())
    }

    async fn ping(&self, target: Ipv4Addr, timeout: Duration) -> Result<bool, PlatformError> {
        let wait = timeout.as_secs().max(1).to_string();
        let target = target.to_string();
        debug!("ping -c 1 -W {} {}", wait, target);
        let status = Command::new("ping")
            .args(["-c", "1", "-W", &wait, &target])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map_err(|e| PlatformError::ProbeError(e.to_string()))?;
        Ok(status.success())
    }
}

#[derive(Debug, Deserialize)]
struct IpInterface {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    family: String,
    local: String,
    prefixlen: u8,
}

/// Extract the first IPv4 address from `ip -j addr show` output
pub fn parse_ipv4_address(json: &[u8]) -> Result<Option<InterfaceAddress>, PlatformError> {
    let interfaces: Vec<IpInterface> = serde_json::from_slice(json)
        .map_err(|e| PlatformError::AddressQueryError(e.to_string()))?;

    for info in interfaces.iter().flat_map(|i| i.addr_info.iter()) {
        if info.family != "inet" {
            continue;
        }
        let address = info.local.parse().map_err(|_| {
            PlatformError::AddressQueryError(format!("Invalid address {}", info.local))
        })?;
        return Ok(Some(InterfaceAddress {
            address,
            prefix: info.prefixlen,
        }));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TUN0: &str = r#"[{"ifindex":7,"ifname":"tun0","flags":["POINTOPOINT","UP"],"mtu":1467,
        "addr_info":[{"family":"inet6","local":"fe80::1","prefixlen":64},
                     {"family":"inet","local":"10.1.2.100","prefixlen":24,"scope":"global"}]}]"#;

    #[test]
    fn test_parse_ipv4_address() {
        let addr = parse_ipv4_address(TUN0.as_bytes()).unwrap();
        assert_eq!(
            addr,
            Some(InterfaceAddress {
                address: Ipv4Addr::new(10, 1, 2, 100),
                prefix: 24,
            })
        );
    }

    #[test]
    fn test_parse_interface_without_address() {
        let json = r#"[{"ifindex":7,"ifname":"tun0","addr_info":[]}]"#;
        assert_eq!(parse_ipv4_address(json.as_bytes()).unwrap(), None);

        let json = r#"[{"ifindex":7,"ifname":"tun0"}]"#;
        assert_eq!(parse_ipv4_address(json.as_bytes()).unwrap(), None);

        assert_eq!(parse_ipv4_address(b"[]").unwrap(), None);
    }

    #[test]
    fn test_parse_invalid_output() {
        let err = parse_ipv4_address(b"Device \"tun0\" does not exist.").unwrap_err();
        assert!(matches!(err, PlatformError::AddressQueryError(_)));
    }

    #[test]
    fn test_linux_link_control_creation() {
        let _control = LinuxLinkControl::new();
        let _default = LinuxLinkControl::default();
    }
}
