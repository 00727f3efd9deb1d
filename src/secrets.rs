//! Secrets negotiation
//!
//! When a connection is started interactively without its password, the
//! request is parked here while the host asks the user. The follow-up
//! `NewSecrets` payload is merged into the parked request, which is then
//! connected as usual.

use crate::request::{VpnSettings, PASSWORD_KEY};
use tracing::{debug, warn};

/// Secret keys the settings still lack
pub fn missing_secrets(settings: &VpnSettings) -> Vec<&'static str> {
    if settings.password().is_some() {
        Vec::new()
    } else {
        vec![PASSWORD_KEY]
    }
}

/// Setting name reported to the host, or an empty string when nothing is missing
pub fn need_secrets_marker(settings: &VpnSettings) -> &'static str {
    if missing_secrets(settings).is_empty() {
        ""
    } else {
        "vpn"
    }
}

#[derive(Debug, Default)]
pub struct SecretsNegotiator {
    pending: Option<VpnSettings>,
}

impl SecretsNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a request until its secrets arrive. A request already waiting
    /// is replaced.
    pub fn hold(&mut self, settings: VpnSettings) {
        if self.pending.is_some() {
            warn!("Replacing connection request that was still waiting for secrets");
        }
        debug!("Holding connection request for secrets: {:?}", settings);
        self.pending = Some(settings);
    }

    /// Merge the supplied secrets into the parked request and release it
    pub fn complete(&mut self, supplied: VpnSettings) -> Option<VpnSettings> {
        let mut held = self.pending.take()?;
        held.merge(supplied);
        Some(held)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_need_secrets_marker() {
        let settings = VpnSettings::new().with_data("topdomain", "t.example.com");
        assert_eq!(need_secrets_marker(&settings), "vpn");
        assert_eq!(missing_secrets(&settings), vec!["password"]);

        let settings = settings.with_secret("password", "pw");
        assert_eq!(need_secrets_marker(&settings), "");
        assert!(missing_secrets(&settings).is_empty());
    }

    #[test]
    fn test_hold_and_complete() {
        let mut negotiator = SecretsNegotiator::new();
        assert!(negotiator.complete(VpnSettings::new()).is_none());

        negotiator.hold(VpnSettings::new().with_data("topdomain", "t.example.com"));
        assert!(negotiator.has_pending());

        let merged = negotiator
            .complete(VpnSettings::new().with_secret("password", "pw"))
            .unwrap();

        assert_eq!(merged.data("topdomain"), Some("t.example.com"));
        assert_eq!(merged.password(), Some("pw"));
        assert!(!negotiator.has_pending());
    }

    #[test]
    fn test_second_hold_replaces_first() {
        let mut negotiator = SecretsNegotiator::new();
        negotiator.hold(VpnSettings::new().with_data("topdomain", "first.example.com"));
        negotiator.hold(VpnSettings::new().with_data("topdomain", "second.example.com"));

        let merged = negotiator.complete(VpnSettings::new()).unwrap();
        assert_eq!(merged.data("topdomain"), Some("second.example.com"));
    }

    #[test]
    fn test_clear_drops_pending() {
        let mut negotiator = SecretsNegotiator::new();
        negotiator.hold(VpnSettings::new());
        negotiator.clear();
        assert!(!negotiator.has_pending());
    }
}
