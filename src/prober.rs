//! Readiness probing for tunnels that do not report their parameters
//!
//! On every tick the prober brings the tunnel interface up, looks for an
//! IPv4 address on it and, once one is present, sends a single echo request
//! to the tunnel gateway. The first answered probe makes the tunnel ready.
//! The recurring task stops itself on readiness, on failure, or when its
//! [`ProberHandle`] is cancelled or dropped.

use crate::context::AttemptContext;
use crate::controller::{AttemptEvent, DiscoverySource, EventKind, EventSender};
use crate::discovery::{AttemptShared, Discovery};
use crate::platform::{InterfaceAddress, LinkControl};
use crate::state::FailureReason;
use crate::supervisor::{ExitWatch, ProcessStatus};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSettings {
    pub device: String,
    pub target: Ipv4Addr,
    pub interval: Duration,
    pub probe_timeout: Duration,
    /// Give up once this much time has passed since the prober started
    pub deadline: Option<Duration>,
}

/// Result of a single probe tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Pending,
    Ready(InterfaceAddress),
    Failed(FailureReason),
}

pub struct Prober<L> {
    settings: ProbeSettings,
    net: Arc<L>,
    started_at: Instant,
}

impl<L: LinkControl> Prober<L> {
    pub fn new(settings: ProbeSettings, net: Arc<L>, started_at: Instant) -> Self {
        Self {
            settings,
            net,
            started_at,
        }
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    /// Run one probe step as of `now`
    pub async fn tick(&self, now: Instant, status: ProcessStatus) -> ProbeOutcome {
        if let ProcessStatus::Exited(code) = status {
            return ProbeOutcome::Failed(FailureReason::ProcessExited(code));
        }

        if let Some(deadline) = self.settings.deadline {
            if now.saturating_duration_since(self.started_at) >= deadline {
                return ProbeOutcome::Failed(FailureReason::TunnelTimeout);
            }
        }

        let device = self.settings.device.as_str();

        if let Err(e) = self.net.set_link_up(device).await {
            debug!("Link {} not up yet: {}", device, e);
        }

        match self.net.ipv4_address(device).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!("No IPv4 address on {} yet", device);
                return ProbeOutcome::Pending;
            }
            Err(e) => {
                debug!("Address query on {} failed: {}", device, e);
                return ProbeOutcome::Pending;
            }
        }

        match self
            .net
            .ping(self.settings.target, self.settings.probe_timeout)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("No reply from {}", self.settings.target);
                return ProbeOutcome::Pending;
            }
            Err(e) => {
                warn!("Probe of {} failed: {}", self.settings.target, e);
                return ProbeOutcome::Pending;
            }
        }

        // Address may have changed between the first query and the reply.
        match self.net.ipv4_address(device).await {
            Ok(Some(address)) => ProbeOutcome::Ready(address),
            _ => ProbeOutcome::Pending,
        }
    }
}

/// Cancels the recurring probe task; dropping the handle cancels too
#[derive(Debug)]
pub struct ProberHandle {
    abort: AbortHandle,
}

impl ProberHandle {
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

impl Drop for ProberHandle {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

/// Start probing every `interval`, first tick one interval after now
pub fn spawn_prober<L: LinkControl>(
    ctx: &AttemptContext,
    settings: ProbeSettings,
    net: Arc<L>,
    exit: ExitWatch,
    shared: Arc<AttemptShared>,
    events: EventSender,
) -> ProberHandle {
    let attempt = ctx.id();
    let start = Instant::now();
    let prober = Prober::new(settings, net, start);

    let task = tokio::spawn(
        async move {
            let interval = prober.settings().interval;
            let mut ticker = interval_at(start + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                "Probing {} via {} every {:?}",
                prober.settings().device,
                prober.settings().target,
                interval
            );

            loop {
                let now = ticker.tick().await;
                match prober.tick(now, exit.poll()).await {
                    ProbeOutcome::Pending => continue,
                    ProbeOutcome::Ready(found) => {
                        info!("Tunnel ready with {}/{}", found.address, found.prefix);
                        shared.params.record(Discovery::ClientAddress(found.address));
                        shared.params.record(Discovery::Prefix(found.prefix));
                        let _ = events.send(AttemptEvent {
                            attempt,
                            kind: EventKind::ParametersReady {
                                source: DiscoverySource::Prober,
                            },
                        });
                        break;
                    }
                    ProbeOutcome::Failed(reason) => {
                        warn!("Probing stopped: {}", reason);
                        let _ = events.send(AttemptEvent {
                            attempt,
                            kind: EventKind::ProbeFailed(reason),
                        });
                        break;
                    }
                }
            }
        }
        .instrument(ctx.span().clone()),
    );

    ProberHandle {
        abort: task.abort_handle(),
    }
}
