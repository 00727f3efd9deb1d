//! Tunnel output classification
//!
//! A [`LineGrammar`] turns single output lines into [`Discovery`] values.
//! [`spawn_reader`] runs the grammar over a tunnel's output on its own task
//! and reports back to the controller through the attempt event queue.

use crate::context::AttemptContext;
use crate::controller::{AttemptEvent, DiscoverySource, EventKind, EventSender};
use crate::discovery::{AttemptShared, Discovery};
use crate::request::Provider;
use crate::state::FailureReason;
use crate::supervisor::{ExitWatch, OutputReceiver};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Device,
    ClientAddress,
    PeerAddress,
    RelayAddress,
    Mtu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extract {
    /// Last whitespace-separated token
    LastToken,
    /// Everything after the last occurrence of the separator
    After(&'static str),
}

#[derive(Debug, Clone, Copy)]
struct Rule {
    marker: &'static str,
    extract: Extract,
    field: Field,
}

const IODINE_RULES: &[Rule] = &[
    Rule {
        marker: "Opened dns",
        extract: Extract::LastToken,
        field: Field::Device,
    },
    Rule {
        marker: "Setting IP of",
        extract: Extract::After(" to "),
        field: Field::ClientAddress,
    },
    Rule {
        marker: "Server tunnel IP is",
        extract: Extract::After(" is "),
        field: Field::PeerAddress,
    },
    Rule {
        marker: "Sending DNS queries for",
        extract: Extract::LastToken,
        field: Field::RelayAddress,
    },
    Rule {
        marker: "Sending raw traffic directly to",
        extract: Extract::LastToken,
        field: Field::RelayAddress,
    },
    Rule {
        marker: "Setting MTU of",
        extract: Extract::LastToken,
        field: Field::Mtu,
    },
];

/// Ordered pattern rules for one provider's output
#[derive(Debug, Clone, Copy)]
pub struct LineGrammar {
    rules: &'static [Rule],
}

impl LineGrammar {
    pub const IODINE: LineGrammar = LineGrammar { rules: IODINE_RULES };

    /// Grammar that recognises nothing; output is only drained and logged
    pub const DRAIN: LineGrammar = LineGrammar { rules: &[] };

    pub fn for_provider(provider: Provider) -> Self {
        if provider.parses_output() {
            Self::IODINE
        } else {
            Self::DRAIN
        }
    }

    /// Whether any line can ever produce a discovery
    pub fn parses(&self) -> bool {
        !self.rules.is_empty()
    }

    /// Classify one line. The first rule whose marker occurs in the line
    /// decides; a value that does not parse leaves the line unmatched.
    pub fn classify(&self, line: &str) -> Option<Discovery> {
        let rule = self.rules.iter().find(|r| line.contains(r.marker))?;
        let value = match rule.extract {
            Extract::LastToken => line.split_whitespace().last()?,
            Extract::After(sep) => line.rsplit_once(sep)?.1.trim(),
        };
        match rule.field {
            Field::Device => Some(Discovery::Device(value.to_string())),
            Field::ClientAddress => parse_addr(value).map(Discovery::ClientAddress),
            Field::PeerAddress => parse_addr(value).map(Discovery::PeerAddress),
            Field::RelayAddress => parse_addr(value).map(Discovery::RelayAddress),
            Field::Mtu => value.parse().ok().map(Discovery::Mtu),
        }
    }
}

fn parse_addr(value: &str) -> Option<Ipv4Addr> {
    value.parse().ok()
}

/// Failure implied by the tunnel exiting before it produced its parameters
pub fn classify_exit(exit_code: Option<i32>) -> FailureReason {
    match exit_code {
        Some(0) => FailureReason::BadIpConfig,
        code => FailureReason::LoginFailed { exit_code: code },
    }
}

/// Spawn the output reader worker of one attempt
///
/// The worker never talks to the control plane itself. It posts
/// `ParametersReady` at most once, then exactly one `ReaderFinished`.
pub fn spawn_reader(
    ctx: &AttemptContext,
    grammar: LineGrammar,
    mut output: OutputReceiver,
    mut exit: ExitWatch,
    shared: Arc<AttemptShared>,
    events: EventSender,
) -> JoinHandle<()> {
    let attempt = ctx.id();
    let provider = ctx.provider();

    tokio::spawn(
        async move {
            let mut posted = false;
            let mut read_failure = None;

            while let Some(line) = output.recv().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Failed to read tunnel output: {}", e);
                        if !shared.config_sent.is_set() {
                            read_failure = Some(FailureReason::ConnectFailed(e.to_string()));
                        }
                        break;
                    }
                };

                match grammar.classify(&line.text) {
                    Some(discovery) => {
                        let field = discovery.field();
                        if shared.params.record(discovery) {
                            info!("Discovered {} from: {}", field, line.text);
                        } else {
                            debug!("Ignoring repeated {}: {}", field, line.text);
                        }
                    }
                    None => debug!("[{} {}] {}", provider, line.stream.as_str(), line.text),
                }

                if !posted && shared.params.has_endpoints() && !shared.config_sent.is_set() {
                    posted = true;
                    let _ = events.send(AttemptEvent {
                        attempt,
                        kind: EventKind::ParametersReady {
                            source: DiscoverySource::Classifier,
                        },
                    });
                }
            }

            let exit_code = exit.wait().await;
            debug!("Tunnel output closed, exit code {:?}", exit_code);

            let failure = read_failure.or_else(|| {
                if grammar.parses() && !posted && !shared.config_sent.is_set() {
                    Some(classify_exit(exit_code))
                } else {
                    None
                }
            });

            let _ = events.send(AttemptEvent {
                attempt,
                kind: EventKind::ReaderFinished { failure, exit_code },
            });
        }
        .instrument(ctx.span().clone()),
    )
}
