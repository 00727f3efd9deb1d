//! Per-attempt context passed explicitly to every component
//!
//! Each connection attempt gets a correlation id and a `tracing` span; tasks
//! spawned on behalf of the attempt are instrumented with that span so their
//! log lines can be told apart from those of earlier attempts.

use crate::request::Provider;
use std::fmt;
use tracing::{info_span, Span};

/// Correlation id of a connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(pub u64);

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct AttemptContext {
    id: AttemptId,
    provider: Provider,
    span: Span,
}

impl AttemptContext {
    pub fn new(id: AttemptId, provider: Provider) -> Self {
        let span = info_span!("attempt", id = %id, provider = %provider);
        Self { id, provider, span }
    }

    pub fn id(&self) -> AttemptId {
        self.id
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_id_display() {
        assert_eq!(AttemptId(7).to_string(), "attempt-7");
    }

    #[test]
    fn test_context_carries_id_and_provider() {
        let ctx = AttemptContext::new(AttemptId(3), Provider::Iodine);
        assert_eq!(ctx.id(), AttemptId(3));
        assert_eq!(ctx.provider(), Provider::Iodine);
    }
}
