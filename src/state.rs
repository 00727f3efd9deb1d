//! Connection state, failure taxonomy and host-bound signals
//!
//! The numeric codes here are the ones NetworkManager's VPN plugin protocol
//! uses on the wire. Everything else in the crate speaks in terms of the
//! enums and only the D-Bus layer turns them into integers.

use crate::codec::Ip4Config;
use std::fmt;
use thiserror::Error;

/// Lifecycle of a single connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No attempt in progress
    #[default]
    Idle,
    /// Tunnel process spawned, nothing discovered yet
    Starting,
    /// Waiting for tunnel parameters (classifier and/or prober running)
    Probing,
    /// Parameters known, IPv4 configuration being handed to the host
    Configuring,
    /// IPv4 configuration accepted by the host
    Connected,
    /// Explicit teardown in progress
    Disconnecting,
    /// Attempt ended with an error
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Starting => "starting",
            ConnectionState::Probing => "probing",
            ConnectionState::Configuring => "configuring",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service state codes carried by `StateChanged`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StateCode {
    Connecting = 2,
    Configuring = 3,
    Connected = 4,
    Disconnecting = 5,
    Disconnected = 6,
}

impl StateCode {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Failure codes carried by `Failure`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FailureCode {
    LoginFailed = 0,
    ConnectFailed = 1,
    BadIpConfig = 2,
}

impl FailureCode {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Why a connection attempt ended without reaching (or staying in) Connected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    #[error("Invalid connection request: {0}")]
    Validation(String),
    #[error("Failed to start tunnel process: {0}")]
    Spawn(String),
    #[error("Tunnel process exited with code {exit_code:?} before configuration")]
    LoginFailed { exit_code: Option<i32> },
    #[error("Tunnel process exited cleanly without reporting an IP configuration")]
    BadIpConfig,
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Tunnel timeout")]
    TunnelTimeout,
    #[error("Tunnel process exited (code {0:?})")]
    ProcessExited(Option<i32>),
}

impl FailureReason {
    /// Failure code reported to the host for this reason
    pub fn code(&self) -> FailureCode {
        match self {
            FailureReason::LoginFailed { .. } => FailureCode::LoginFailed,
            FailureReason::BadIpConfig => FailureCode::BadIpConfig,
            FailureReason::Validation(_)
            | FailureReason::Spawn(_)
            | FailureReason::ConnectFailed(_)
            | FailureReason::TunnelTimeout
            | FailureReason::ProcessExited(_) => FailureCode::ConnectFailed,
        }
    }
}

/// Notification sent to the host control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginSignal {
    StateChanged { state: StateCode, reason: String },
    Failure(FailureCode),
    Ip4Config(Ip4Config),
    SecretsRequired { message: String, secrets: Vec<String> },
}

impl PluginSignal {
    /// Signal member name, for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            PluginSignal::StateChanged { .. } => "StateChanged",
            PluginSignal::Failure(_) => "Failure",
            PluginSignal::Ip4Config(_) => "Ip4Config",
            PluginSignal::SecretsRequired { .. } => "SecretsRequired",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes_match_protocol() {
        assert_eq!(StateCode::Connecting.code(), 2);
        assert_eq!(StateCode::Configuring.code(), 3);
        assert_eq!(StateCode::Connected.code(), 4);
        assert_eq!(StateCode::Disconnecting.code(), 5);
        assert_eq!(StateCode::Disconnected.code(), 6);
    }

    #[test]
    fn test_failure_reason_codes() {
        assert_eq!(
            FailureReason::LoginFailed { exit_code: Some(1) }.code(),
            FailureCode::LoginFailed
        );
        assert_eq!(FailureReason::BadIpConfig.code(), FailureCode::BadIpConfig);
        assert_eq!(FailureReason::TunnelTimeout.code(), FailureCode::ConnectFailed);
        assert_eq!(
            FailureReason::Validation("missing server".into()).code(),
            FailureCode::ConnectFailed
        );
        assert_eq!(FailureCode::BadIpConfig.code(), 2);
    }

    #[test]
    fn test_failure_reason_display() {
        assert_eq!(FailureReason::TunnelTimeout.to_string(), "Tunnel timeout");
        assert_eq!(
            FailureReason::ProcessExited(Some(1)).to_string(),
            "Tunnel process exited (code Some(1))"
        );
    }

    #[test]
    fn test_connection_state_default_and_display() {
        assert_eq!(ConnectionState::default(), ConnectionState::Idle);
        assert_eq!(ConnectionState::Probing.to_string(), "probing");
    }
}
