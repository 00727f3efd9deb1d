//! Tunnel process supervision
//!
//! Spawns the tunnel binary, forwards its output line by line, tracks its
//! exit status and tears it down. The child itself is owned by a small
//! waiter task; everything else talks to it through a [`TunnelProcess`]
//! handle:
//!
//! - exit status is published on a `watch` channel, so liveness checks
//!   never block
//! - output lines are pushed into an unbounded channel read by the
//!   output classifier
//! - dropping the handle without terminating kills the child

use crate::context::AttemptContext;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn, Instrument};

const OUTPUT_TAIL_LINES: usize = 20;

/// Upper bound on the share of the grace period reserved for reaping after a kill
const KILL_WAIT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to spawn {program}: {source}")]
    SpawnError {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Program and argument vector of a tunnel process
///
/// Arguments added with [`TunnelCommand::secret`] are masked when the
/// command is displayed.
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelCommand {
    program: String,
    args: Vec<String>,
    secret_positions: Vec<usize>,
}

impl TunnelCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            secret_positions: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn secret(mut self, arg: impl Into<String>) -> Self {
        self.secret_positions.push(self.args.len());
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for TunnelCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for (i, arg) in self.args.iter().enumerate() {
            if self.secret_positions.contains(&i) {
                f.write_str(" *****")?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TunnelCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TunnelCommand({})", self)
    }
}

/// How stderr is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// stderr lines are delivered together with stdout lines
    Merged,
    /// only stdout is delivered; stderr is drained into the log
    Separate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Receiving end of a tunnel's output; closes once every stream hit EOF
pub type OutputReceiver = mpsc::UnboundedReceiver<io::Result<OutputLine>>;

/// Liveness of a tunnel process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    /// Exit code, `None` when killed by a signal
    Exited(Option<i32>),
}

/// Read side of a process's exit status
#[derive(Debug, Clone)]
pub struct ExitWatch(watch::Receiver<ProcessStatus>);

/// Write side of a process's exit status
#[derive(Debug)]
pub struct ExitNotifier(watch::Sender<ProcessStatus>);

impl ExitNotifier {
    pub fn exited(self, code: Option<i32>) {
        let _ = self.0.send(ProcessStatus::Exited(code));
    }
}

/// Create a linked exit notifier/watch pair, initially `Running`
pub fn exit_channel() -> (ExitNotifier, ExitWatch) {
    let (tx, rx) = watch::channel(ProcessStatus::Running);
    (ExitNotifier(tx), ExitWatch(rx))
}

impl ExitWatch {
    /// Non-blocking liveness check
    pub fn poll(&self) -> ProcessStatus {
        *self.0.borrow()
    }

    /// Wait until the process has exited and return its exit code
    pub async fn wait(&mut self) -> Option<i32> {
        loop {
            if let ProcessStatus::Exited(code) = *self.0.borrow_and_update() {
                return code;
            }
            if self.0.changed().await.is_err() {
                // Waiter went away without reporting; treat as gone.
                return match *self.0.borrow() {
                    ProcessStatus::Exited(code) => code,
                    ProcessStatus::Running => None,
                };
            }
        }
    }
}

/// Last lines a tunnel printed, kept for failure diagnostics
#[derive(Debug, Clone, Default)]
pub struct OutputTail(Arc<Mutex<VecDeque<String>>>);

impl OutputTail {
    fn push(&self, line: &str) {
        if let Ok(mut tail) = self.0.lock() {
            if tail.len() == OUTPUT_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.to_string());
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.0
            .lock()
            .map(|tail| tail.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Handle to a spawned tunnel process
pub struct TunnelProcess {
    pid: Option<u32>,
    started_at: Instant,
    exit: ExitWatch,
    kill_tx: Option<oneshot::Sender<()>>,
    output: Option<OutputReceiver>,
    tail: OutputTail,
    terminated: bool,
}

impl TunnelProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn poll(&self) -> ProcessStatus {
        self.exit.poll()
    }

    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    /// Take the output channel. Output can be consumed only once per process.
    pub fn take_output(&mut self) -> Option<OutputReceiver> {
        self.output.take()
    }

    pub fn output_tail(&self) -> Vec<String> {
        self.tail.lines()
    }
}

/// Starts and stops tunnel processes
#[derive(Debug, Clone)]
pub struct Supervisor {
    grace: Duration,
}

impl Supervisor {
    /// `grace` bounds the whole of [`Supervisor::terminate`], force kill included
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Split the grace period into the SIGTERM wait and the post-kill wait
    fn waits(&self) -> (Duration, Duration) {
        let kill_wait = KILL_WAIT.min(self.grace / 2);
        (self.grace - kill_wait, kill_wait)
    }

    /// Spawn the tunnel. Returns as soon as the OS created the process.
    pub fn start(
        &self,
        ctx: &AttemptContext,
        command: &TunnelCommand,
        mode: OutputMode,
    ) -> Result<TunnelProcess, SupervisorError> {
        let mut child = Command::new(command.program())
            .args(command.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SupervisorError::SpawnError {
                program: command.program().to_string(),
                source,
            })?;

        let pid = child.id();
        info!("Started {} (pid {:?})", command, pid);

        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let tail = OutputTail::default();

        if let Some(stdout) = child.stdout.take() {
            forward_lines(ctx, stdout, OutputStream::Stdout, Some(lines_tx.clone()), tail.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = match mode {
                OutputMode::Merged => Some(lines_tx.clone()),
                OutputMode::Separate => None,
            };
            forward_lines(ctx, stderr, OutputStream::Stderr, tx, tail.clone());
        }
        drop(lines_tx);

        let (notifier, exit) = exit_channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(
            async move {
                // A dropped handle resolves kill_rx as well, so the child never outlives it.
                let waited = tokio::select! {
                    status = child.wait() => Some(status),
                    _ = kill_rx => None,
                };
                let status = match waited {
                    Some(status) => status,
                    None => {
                        if let Err(e) = child.start_kill() {
                            warn!("Failed to kill tunnel process: {}", e);
                        }
                        child.wait().await
                    }
                };
                match status {
                    Ok(status) => {
                        info!("Tunnel process exited: {}", status);
                        notifier.exited(status.code());
                    }
                    Err(e) => {
                        error!("Failed to wait for tunnel process: {}", e);
                        notifier.exited(None);
                    }
                }
            }
            .instrument(ctx.span().clone()),
        );

        Ok(TunnelProcess {
            pid,
            started_at: Instant::now(),
            exit,
            kill_tx: Some(kill_tx),
            output: Some(lines_rx),
            tail,
            terminated: false,
        })
    }

    /// Stop the process: SIGTERM, wait, then SIGKILL. Both waits together
    /// stay within the grace period.
    ///
    /// Idempotent and infallible; problems are only logged.
    pub async fn terminate(&self, process: &mut TunnelProcess) {
        if process.terminated {
            debug!("Tunnel process already terminated");
            return;
        }
        process.terminated = true;

        if let ProcessStatus::Exited(code) = process.poll() {
            debug!("Tunnel process already exited with {:?}", code);
            return;
        }

        if let Some(pid) = process.pid {
            send_sigterm(pid);
        }

        let (term_wait, kill_wait) = self.waits();
        let mut exit = process.exit.clone();
        match timeout(term_wait, exit.wait()).await {
            Ok(code) => info!(
                "Tunnel process stopped with {:?}, ran for {:?}",
                code,
                process.started_at.elapsed()
            ),
            Err(_) => {
                warn!(
                    "Tunnel process still running after {:?}, force killing",
                    term_wait
                );
                if let Some(kill_tx) = process.kill_tx.take() {
                    let _ = kill_tx.send(());
                }
                if timeout(kill_wait, exit.wait()).await.is_err() {
                    error!("Tunnel process did not exit after SIGKILL");
                }
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        warn!("Process id {} out of range", pid);
        return;
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => debug!("Sent SIGTERM to {}", pid),
        Err(e) => warn!("Failed to send SIGTERM to {}: {}", pid, e),
    }
}

#[cfg(not(unix))]
fn send_sigterm(pid: u32) {
    debug!("No graceful termination on this platform for {}", pid);
}

/// Read `reader` line by line into `tx` (or only into the log when `tx` is `None`)
fn forward_lines<R>(
    ctx: &AttemptContext,
    reader: R,
    stream: OutputStream,
    tx: Option<mpsc::UnboundedSender<io::Result<OutputLine>>>,
    tail: OutputTail,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let provider = ctx.provider();
    tokio::spawn(
        async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&buf)
                            .trim_end_matches(['\r', '\n'])
                            .to_string();
                        tail.push(&text);
                        match tx {
                            Some(ref tx) => {
                                if tx.send(Ok(OutputLine { stream, text })).is_err() {
                                    break;
                                }
                            }
                            None => debug!("[{} {}] {}", provider, stream.as_str(), text),
                        }
                    }
                    Err(e) => {
                        warn!("Error reading tunnel {}: {}", stream.as_str(), e);
                        if let Some(ref tx) = tx {
                            let _ = tx.send(Err(e));
                        }
                        break;
                    }
                }
            }
            debug!("Tunnel {} closed", stream.as_str());
        }
        .instrument(ctx.span().clone()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AttemptId;
    use crate::request::Provider;

    fn ctx() -> AttemptContext {
        AttemptContext::new(AttemptId(1), Provider::Iodine)
    }

    fn sh(script: &str) -> TunnelCommand {
        TunnelCommand::new("sh").arg("-c").arg(script)
    }

    async fn collect(mut rx: OutputReceiver) -> Vec<OutputLine> {
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line.unwrap());
        }
        lines
    }

    #[test]
    fn test_command_display_masks_secret() {
        let command = TunnelCommand::new("hans")
            .arg("-c")
            .arg("relay")
            .arg("-p")
            .secret("hunter2");
        assert_eq!(command.to_string(), "hans -c relay -p *****");
        assert!(!format!("{:?}", command).contains("hunter2"));
        assert_eq!(command.args()[3], "hunter2");
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let supervisor = Supervisor::new(Duration::from_secs(1));
        let result = supervisor.start(
            &ctx(),
            &TunnelCommand::new("/nonexistent/tunnel-binary"),
            OutputMode::Merged,
        );
        match result {
            Err(SupervisorError::SpawnError { program, .. }) => {
                assert_eq!(program, "/nonexistent/tunnel-binary")
            }
            Ok(_) => panic!("Expected SpawnError"),
        }
    }

    #[tokio::test]
    async fn test_merged_output_and_exit_code() {
        let supervisor = Supervisor::new(Duration::from_secs(1));
        let mut process = supervisor
            .start(&ctx(), &sh("echo one; echo two >&2; exit 3"), OutputMode::Merged)
            .unwrap();

        let lines = collect(process.take_output().unwrap()).await;
        let mut texts: Vec<_> = lines.iter().map(|l| l.text.as_str()).collect();
        texts.sort();
        assert_eq!(texts, ["one", "two"]);

        let mut exit = process.exit_watch();
        assert_eq!(exit.wait().await, Some(3));
        assert_eq!(process.poll(), ProcessStatus::Exited(Some(3)));
        assert_eq!(process.output_tail().len(), 2);
    }

    #[tokio::test]
    async fn test_separate_output_only_delivers_stdout() {
        let supervisor = Supervisor::new(Duration::from_secs(1));
        let mut process = supervisor
            .start(&ctx(), &sh("echo out; echo err >&2"), OutputMode::Separate)
            .unwrap();

        let lines = collect(process.take_output().unwrap()).await;

        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].stream, OutputStream::Stdout);
        assert_eq!(lines[0].text, "out");
        assert!(process.take_output().is_none());
    }

    #[tokio::test]
    async fn test_poll_reports_running() {
        let supervisor = Supervisor::new(Duration::from_secs(1));
        let mut process = supervisor.start(&ctx(), &sh("exec sleep 30"), OutputMode::Merged).unwrap();

        assert_eq!(process.poll(), ProcessStatus::Running);

        supervisor.terminate(&mut process).await;
        assert!(matches!(process.poll(), ProcessStatus::Exited(_)));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let supervisor = Supervisor::new(Duration::from_secs(2));
        let mut process = supervisor.start(&ctx(), &sh("exec sleep 30"), OutputMode::Merged).unwrap();

        supervisor.terminate(&mut process).await;
        // SIGTERM kills sleep, so there is no exit code
        assert_eq!(process.poll(), ProcessStatus::Exited(None));

        supervisor.terminate(&mut process).await;
        assert_eq!(process.poll(), ProcessStatus::Exited(None));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let supervisor = Supervisor::new(Duration::from_secs(1));
        let mut process = supervisor
            .start(&ctx(), &sh("trap '' TERM; exec sleep 30"), OutputMode::Merged)
            .unwrap();
        // Let the shell install the trap before signalling it.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        supervisor.terminate(&mut process).await;

        assert_eq!(process.poll(), ProcessStatus::Exited(None));
        assert!(started.elapsed() >= Duration::from_millis(500));
        // The force kill is reaped within the same grace period.
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_terminate_waits_fit_grace_period() {
        let (term, kill) = Supervisor::new(Duration::from_secs(5)).waits();
        assert_eq!((term, kill), (Duration::from_secs(4), Duration::from_secs(1)));

        let (term, kill) = Supervisor::new(Duration::from_millis(400)).waits();
        assert_eq!(term + kill, Duration::from_millis(400));
        assert_eq!(kill, Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_dropping_handle_kills_process() {
        let supervisor = Supervisor::new(Duration::from_secs(1));
        let process = supervisor.start(&ctx(), &sh("exec sleep 30"), OutputMode::Merged).unwrap();
        let mut exit = process.exit_watch();

        drop(process);

        let code = timeout(Duration::from_secs(5), exit.wait()).await.unwrap();
        assert_eq!(code, None);
    }

    #[tokio::test]
    async fn test_exit_watch_wait_after_exit() {
        let (notifier, mut watch) = exit_channel();
        assert_eq!(watch.poll(), ProcessStatus::Running);
        notifier.exited(Some(0));
        assert_eq!(watch.wait().await, Some(0));
        assert_eq!(watch.poll(), ProcessStatus::Exited(Some(0)));
    }
}
