//! Connection state machine
//!
//! A [`Controller`] owns every connection attempt of one plugin instance.
//! It runs a single event loop that consumes two queues:
//!
//! - [`Command`]s from the control plane, sent through a [`ControllerHandle`]
//! - [`AttemptEvent`]s posted by the output reader and the prober
//!
//! Only the event loop emits signals. Workers never touch the control plane
//! directly, they post an event and the loop acts on it. Events carry the
//! id of the attempt that produced them, so anything arriving after that
//! attempt was torn down is dropped.

use crate::classifier::{classify_exit, spawn_reader, LineGrammar};
use crate::codec::{Ip4Config, Ip4Defaults, Ip4Route};
use crate::config::{Config, ProviderProfile};
use crate::context::{AttemptContext, AttemptId};
use crate::discovery::AttemptShared;
use crate::platform::LinkControl;
use crate::prober::{spawn_prober, ProbeSettings, ProberHandle};
use crate::request::{ConnectionRequest, Provider, VpnSettings};
use crate::secrets::{missing_secrets, SecretsNegotiator};
use crate::state::{ConnectionState, FailureReason, PluginSignal, StateCode};
use crate::supervisor::{OutputMode, Supervisor, TunnelProcess};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Where the tunnel parameters came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
    Classifier,
    Prober,
}

#[derive(Debug)]
pub enum EventKind {
    /// Enough parameters are recorded to configure the host
    ParametersReady { source: DiscoverySource },
    ProbeFailed(FailureReason),
    /// Output reached EOF and the process is gone
    ReaderFinished {
        failure: Option<FailureReason>,
        exit_code: Option<i32>,
    },
}

/// Hand-off from attempt workers to the event loop
#[derive(Debug)]
pub struct AttemptEvent {
    pub attempt: AttemptId,
    pub kind: EventKind,
}

pub type EventSender = mpsc::UnboundedSender<AttemptEvent>;

#[derive(Error, Debug)]
#[error("Failed to emit {signal}: {message}")]
pub struct EmitError {
    pub signal: &'static str,
    pub message: String,
}

/// Host-bound side of the plugin protocol
pub trait ControlPlane: Send + Sync + 'static {
    fn emit(&self, signal: PluginSignal) -> impl Future<Output = Result<(), EmitError>> + Send;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("A connection attempt is already {0}")]
    AttemptActive(ConnectionState),
    #[error("No connection request is waiting for secrets")]
    NoPendingSecrets,
    #[error("Controller is not running")]
    Closed,
}

type Reply<T> = oneshot::Sender<T>;

#[derive(Debug)]
pub enum Command {
    Connect {
        settings: VpnSettings,
        reply: Reply<Result<(), ControllerError>>,
    },
    ConnectInteractive {
        settings: VpnSettings,
        reply: Reply<Result<(), ControllerError>>,
    },
    NewSecrets {
        settings: VpnSettings,
        reply: Reply<Result<(), ControllerError>>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    /// Disconnect and stop the event loop
    Shutdown {
        reply: Reply<()>,
    },
}

/// Cloneable sender side of a controller's command queue
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
}

impl ControllerHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ControllerError::Closed)?;
        rx.await.map_err(|_| ControllerError::Closed)
    }

    pub async fn connect(&self, settings: VpnSettings) -> Result<(), ControllerError> {
        self.request(|reply| Command::Connect { settings, reply })
            .await?
    }

    pub async fn connect_interactive(&self, settings: VpnSettings) -> Result<(), ControllerError> {
        self.request(|reply| Command::ConnectInteractive { settings, reply })
            .await?
    }

    pub async fn new_secrets(&self, settings: VpnSettings) -> Result<(), ControllerError> {
        self.request(|reply| Command::NewSecrets { settings, reply })
            .await?
    }

    pub async fn disconnect(&self) -> Result<(), ControllerError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Everything owned by a running attempt
struct Attempt {
    ctx: AttemptContext,
    request: ConnectionRequest,
    process: TunnelProcess,
    shared: Arc<AttemptShared>,
    reader: Option<JoinHandle<()>>,
    prober: Option<ProberHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub struct Controller<C, L> {
    provider: Provider,
    config: Arc<Config>,
    profile: ProviderProfile,
    control: C,
    net: Arc<L>,
    supervisor: Supervisor,
    commands: mpsc::Receiver<Command>,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<AttemptEvent>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    attempt: Option<Attempt>,
    next_attempt: u64,
    secrets: SecretsNegotiator,
}

impl<C: ControlPlane, L: LinkControl> Controller<C, L> {
    pub fn new(
        provider: Provider,
        config: Arc<Config>,
        control: C,
        net: Arc<L>,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        let profile = config.profile(provider);
        let supervisor = Supervisor::new(config.timing.terminate_grace());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Idle);

        Self {
            provider,
            config,
            profile,
            control,
            net,
            supervisor,
            commands,
            events_tx,
            events_rx,
            state: ConnectionState::Idle,
            state_tx,
            attempt: None,
            next_attempt: 1,
            secrets: SecretsNegotiator::new(),
        }
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Run the event loop until shutdown, or the first disconnect when so configured
    pub async fn run(mut self) {
        info!("{} controller started", self.provider);
        loop {
            let flow = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("Command channel closed");
                        self.disconnect().await;
                        Flow::Stop
                    }
                },
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                    Flow::Continue
                }
            };
            if flow == Flow::Stop {
                break;
            }
        }
        info!("{} controller stopped", self.provider);
    }

    async fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Connect { settings, reply } => {
                let result = self.connect(settings).await;
                let _ = reply.send(result);
            }
            Command::ConnectInteractive { settings, reply } => {
                let result = self.connect_interactive(settings).await;
                let _ = reply.send(result);
            }
            Command::NewSecrets { settings, reply } => {
                let result = self.new_secrets(settings).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
                if self.config.service.exit_on_disconnect {
                    return Flow::Stop;
                }
            }
            Command::Shutdown { reply } => {
                info!("Shutting down");
                self.disconnect().await;
                let _ = reply.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn handle_event(&mut self, event: AttemptEvent) {
        let AttemptEvent { attempt, kind } = event;
        let span = match self.attempt {
            Some(ref current) if current.ctx.id() == attempt => current.ctx.span().clone(),
            _ => {
                debug!("Ignoring {:?} from finished {}", kind, attempt);
                return;
            }
        };

        async move {
            match kind {
                EventKind::ParametersReady { source } => self.configure(source).await,
                EventKind::ProbeFailed(reason) => self.fail(reason).await,
                EventKind::ReaderFinished { failure, exit_code } => {
                    self.reader_finished(failure, exit_code).await
                }
            }
        }
        .instrument(span)
        .await
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("State {} -> {}", self.state, state);
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    /// Best-effort emission
    async fn emit(&self, signal: PluginSignal) {
        if let Err(e) = self.control.emit(signal).await {
            warn!("{}", e);
        }
    }

    async fn emit_state(&self, state: StateCode, reason: &str) {
        self.emit(PluginSignal::StateChanged {
            state,
            reason: reason.to_string(),
        })
        .await;
    }

    async fn connect(&mut self, settings: VpnSettings) -> Result<(), ControllerError> {
        if self.attempt.is_some() {
            warn!("Rejecting connect while {}", self.state);
            return Err(ControllerError::AttemptActive(self.state));
        }
        self.secrets.clear();

        let ctx = AttemptContext::new(AttemptId(self.next_attempt), self.provider);
        self.next_attempt += 1;

        let span = ctx.span().clone();
        self.start_attempt(ctx, settings).instrument(span).await;
        Ok(())
    }

    async fn start_attempt(&mut self, ctx: AttemptContext, settings: VpnSettings) {
        info!("Connect requested: {:?}", settings);

        let request = match ConnectionRequest::from_settings(self.provider, &settings) {
            Ok(request) => request,
            Err(e) => {
                self.fail(FailureReason::Validation(e.to_string())).await;
                return;
            }
        };

        let command = request.tunnel_command(&self.profile.binary);
        let mode = if self.provider.parses_output() {
            OutputMode::Merged
        } else {
            OutputMode::Separate
        };
        let mut process = match self.supervisor.start(&ctx, &command, mode) {
            Ok(process) => process,
            Err(e) => {
                self.fail(FailureReason::Spawn(e.to_string())).await;
                return;
            }
        };

        self.set_state(ConnectionState::Starting);
        self.emit_state(StateCode::Connecting, "Tunnel process started")
            .await;

        let shared = Arc::new(AttemptShared::default());

        let reader = process.take_output().map(|output| {
            spawn_reader(
                &ctx,
                LineGrammar::for_provider(self.provider),
                output,
                process.exit_watch(),
                shared.clone(),
                self.events_tx.clone(),
            )
        });

        let prober = self.probe_settings(&request).map(|settings| {
            spawn_prober(
                &ctx,
                settings,
                self.net.clone(),
                process.exit_watch(),
                shared.clone(),
                self.events_tx.clone(),
            )
        });

        self.attempt = Some(Attempt {
            ctx,
            request,
            process,
            shared,
            reader,
            prober,
        });
        self.set_state(ConnectionState::Probing);
    }

    fn probe_settings(&self, request: &ConnectionRequest) -> Option<ProbeSettings> {
        if !self.profile.probe {
            return None;
        }
        let Some(target) = request.gateway.or(self.profile.probe_target) else {
            warn!("Probing enabled for {} but no probe target configured", self.provider);
            return None;
        };
        Some(ProbeSettings {
            device: self.profile.device.clone(),
            target,
            interval: self.config.timing.probe_interval(),
            probe_timeout: self.config.timing.probe_timeout(),
            deadline: self.config.timing.tunnel_deadline(),
        })
    }

    fn ip4_defaults(&self, request: &ConnectionRequest) -> Ip4Defaults {
        let profile = &self.profile;
        Ip4Defaults {
            prefix: profile.prefix,
            mtu: profile.mtu,
            device: profile.device.clone(),
            // A probing provider uses the request gateway as probe target instead.
            gateway_override: if profile.probe { None } else { request.gateway },
            fallback_gateway: profile.gateway,
            dns: match request.dns {
                Some(dns) => vec![dns],
                None => profile.dns.clone(),
            },
            routes: profile.host_routes.iter().copied().map(Ip4Route::host).collect(),
            route_metric: profile.route_metric,
        }
    }

    async fn configure(&mut self, source: DiscoverySource) {
        let Some(ref attempt) = self.attempt else {
            return;
        };
        if !attempt.shared.config_sent.try_claim() {
            debug!("IPv4 configuration already sent, ignoring {:?}", source);
            return;
        }
        let snapshot = attempt.shared.params.snapshot();
        let defaults = self.ip4_defaults(&attempt.request);
        info!("Tunnel parameters from {:?}: {:?}", source, snapshot);

        self.set_state(ConnectionState::Configuring);
        self.emit_state(StateCode::Configuring, "Configuring IPv4")
            .await;

        let config = match Ip4Config::assemble(&snapshot, &defaults) {
            Ok(config) => config,
            Err(e) => {
                warn!("Cannot build IPv4 configuration: {}", e);
                self.fail(FailureReason::BadIpConfig).await;
                return;
            }
        };

        if self.profile.flush_addresses {
            if let Err(e) = self.net.flush_addresses(&config.tundev).await {
                warn!("{}", e);
            }
        }

        info!(
            "Sending IPv4 configuration: {}/{} on {}",
            config.address, config.prefix, config.tundev
        );
        if let Err(e) = self.control.emit(PluginSignal::Ip4Config(config)).await {
            error!("{}", e);
            self.fail(FailureReason::ConnectFailed(e.to_string())).await;
            return;
        }

        if let Some(prober) = self.attempt.as_mut().and_then(|a| a.prober.take()) {
            prober.cancel();
        }
        self.set_state(ConnectionState::Connected);
        self.emit_state(StateCode::Connected, "Tunnel established")
            .await;
    }

    async fn reader_finished(&mut self, failure: Option<FailureReason>, exit_code: Option<i32>) {
        if let Some(reason) = failure {
            self.fail(reason).await;
            return;
        }

        let probing = self.attempt.as_ref().is_some_and(|a| a.prober.is_some());
        match self.state {
            ConnectionState::Connected => {
                warn!("Tunnel process exited with {:?}", exit_code);
                self.release().await;
                self.set_state(ConnectionState::Idle);
                self.emit_state(StateCode::Disconnected, "Tunnel process exited")
                    .await;
            }
            _ if probing => debug!("Output closed, prober decides the outcome"),
            _ => self.fail(classify_exit(exit_code)).await,
        }
    }

    async fn connect_interactive(&mut self, settings: VpnSettings) -> Result<(), ControllerError> {
        if self.attempt.is_some() {
            return Err(ControllerError::AttemptActive(self.state));
        }
        let missing = missing_secrets(&settings);
        if missing.is_empty() {
            return self.connect(settings).await;
        }

        info!("Secrets required: {}", missing.join(", "));
        self.secrets.hold(settings);
        self.emit(PluginSignal::SecretsRequired {
            message: format!("A password is required to connect the {} tunnel", self.provider),
            secrets: missing.into_iter().map(str::to_string).collect(),
        })
        .await;
        Ok(())
    }

    async fn new_secrets(&mut self, settings: VpnSettings) -> Result<(), ControllerError> {
        if self.attempt.is_some() {
            return Err(ControllerError::AttemptActive(self.state));
        }
        let Some(merged) = self.secrets.complete(settings) else {
            warn!("Received secrets without a pending request");
            return Err(ControllerError::NoPendingSecrets);
        };
        self.connect(merged).await
    }

    /// End the attempt with `reason`. Reports the failure, tears down and
    /// reports the terminal state.
    async fn fail(&mut self, reason: FailureReason) {
        warn!("Connection failed: {}", reason);
        if let Some(ref attempt) = self.attempt {
            report_exit_output(&attempt.process, &reason);
        }
        self.set_state(ConnectionState::Failed);
        self.emit(PluginSignal::Failure(reason.code())).await;
        self.release().await;
        self.emit_state(StateCode::Disconnected, &reason.to_string())
            .await;
    }

    /// Tear down the current attempt, if any. Never fails.
    async fn release(&mut self) {
        let Some(mut attempt) = self.attempt.take() else {
            return;
        };
        debug!("Releasing {}", attempt.ctx.id());

        if let Some(prober) = attempt.prober.take() {
            prober.cancel();
        }
        self.supervisor.terminate(&mut attempt.process).await;
        if let Some(reader) = attempt.reader.take() {
            reader.abort();
        }

        if self.profile.flush_addresses && attempt.shared.config_sent.is_set() {
            let device = attempt
                .shared
                .params
                .snapshot()
                .device
                .unwrap_or_else(|| self.profile.device.clone());
            if let Err(e) = self.net.flush_addresses(&device).await {
                debug!("{}", e);
            }
        }
    }

    async fn disconnect(&mut self) {
        self.secrets.clear();
        if let Some(span) = self.attempt.as_ref().map(|a| a.ctx.span().clone()) {
            async {
                info!("Disconnecting");
                self.set_state(ConnectionState::Disconnecting);
                self.emit_state(StateCode::Disconnecting, "Disconnect requested")
                    .await;
                self.release().await;
            }
            .instrument(span)
            .await;
        }
        self.set_state(ConnectionState::Idle);
        self.emit_state(StateCode::Disconnected, "Disconnected").await;
    }
}

/// Log what a tunnel printed before it went away on its own
fn report_exit_output(process: &TunnelProcess, reason: &FailureReason) {
    if !matches!(
        reason,
        FailureReason::LoginFailed { .. }
            | FailureReason::BadIpConfig
            | FailureReason::ProcessExited(_)
    ) {
        return;
    }
    let tail = process.output_tail();
    warn!(
        "Tunnel process {} exited after {:?}, last {} output lines follow",
        process.pid().map_or_else(|| "?".to_string(), |pid| pid.to_string()),
        process.started_at().elapsed(),
        tail.len()
    );
    for line in tail {
        warn!("| {}", line);
    }
}
