//! Opens, monitors, and recreates the long-lived multiplexed ssh session
//! that every other remote operation rides on.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::command_builder::{forward_spec, CommandBuilder, ControlOp};
use crate::error::Error;
use crate::host_ref::HostReference;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;
#[cfg(any(test, feature = "test-support"))]
pub use fake::FakeControlChannel;

/// The subset of control-channel behavior the reconciler depends on. Exists
/// so `reconciler::apply` can be driven by a fake in tests without a real
/// ssh control master.
#[async_trait]
pub trait ForwardChannel: Send + Sync {
    async fn forward(&self, local_port: u16, remote_port: u16) -> Result<(), Error>;
    async fn cancel(&self, local_port: u16, remote_port: u16) -> Result<(), Error>;
}

const SOCKET_WAIT_DEADLINE: Duration = Duration::from_secs(10);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);
const BREAKER_FAILURE_THRESHOLD: u32 = 5;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(60);
const CONTROL_PERSIST: &str = "10m";

/// Circuit-breaker states guarding control-channel recreation attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// A pure, independently testable circuit breaker: five consecutive
/// recreation failures open the breaker for a cooldown window; the first
/// attempt after cooldown is half-open and decides whether it closes again.
struct CircuitBreaker {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            opened_at: None,
            threshold,
            cooldown,
        }
    }

    /// Whether a recreation attempt may proceed right now. Transitions
    /// Open -> HalfOpen once the cooldown has elapsed.
    fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|since| since.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.cooldown {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.failures = 0;
        self.opened_at = None;
    }

    fn record_failure(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.opened_at = Some(Instant::now());
                self.failures = self.threshold;
            }
            BreakerState::Closed | BreakerState::Open => {
                self.failures += 1;
                if self.failures >= self.threshold {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state, BreakerState::Open)
    }
}

/// The long-lived multiplexed ssh session. Owns its subprocess handle and
/// control-socket path exclusively; every method that touches either takes
/// the relevant internal lock itself.
pub struct ControlChannel {
    host: HostReference,
    control_path: PathBuf,
    identity_file: Option<PathBuf>,
    child: AsyncMutex<Option<Child>>,
    breaker: SyncMutex<CircuitBreaker>,
    recreate_lock: AsyncMutex<()>,
    recovery_tx: mpsc::Sender<()>,
}

impl ControlChannel {
    /// Build a channel for `host`, but do not open it yet. Returns the
    /// channel and the receiving half of its recovery-notification channel,
    /// which the Manager's select loop consumes (see `manager::Manager`).
    pub fn new(host: HostReference, identity_file: Option<PathBuf>) -> (Self, mpsc::Receiver<()>) {
        let control_path = host.control_path();
        let (recovery_tx, recovery_rx) = mpsc::channel(1);
        let channel = Self {
            host,
            control_path,
            identity_file,
            child: AsyncMutex::new(None),
            breaker: SyncMutex::new(CircuitBreaker::new(
                BREAKER_FAILURE_THRESHOLD,
                BREAKER_COOLDOWN,
            )),
            recreate_lock: AsyncMutex::new(()),
            recovery_tx,
        };
        (channel, recovery_rx)
    }

    /// Path to the derived control socket.
    pub fn control_path(&self) -> &Path {
        &self.control_path
    }

    fn master_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-M").arg("-f").arg("-N");
        cmd.arg("-S").arg(&self.control_path);
        cmd.arg("-o").arg("ControlMaster=auto");
        cmd.arg("-o").arg(format!("ControlPersist={CONTROL_PERSIST}"));
        cmd.arg("-o").arg(format!(
            "ControlPath={}",
            self.control_path.to_string_lossy()
        ));
        cmd.arg("-o").arg("ServerAliveInterval=15");
        cmd.arg("-o").arg("ServerAliveCountMax=2");
        cmd.arg("-o").arg("TCPKeepAlive=yes");
        cmd.arg("-o").arg("ExitOnForwardFailure=yes");
        cmd.arg("-o").arg("StrictHostKeyChecking=accept-new");
        if let Some(port) = self.host.port() {
            cmd.arg("-p").arg(port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(self.host.user_at_host());
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());
        cmd
    }

    /// Spawn the background master and wait for its control socket to
    /// appear. Kills the subprocess and returns a fatal error if the socket
    /// never shows up within the deadline.
    pub async fn open(&self) -> Result<(), Error> {
        let child = self
            .master_command()
            .spawn()
            .map_err(|e| Error::ControlChannel(format!("failed to spawn ssh master: {e}")))?;

        let deadline = Instant::now() + SOCKET_WAIT_DEADLINE;
        loop {
            if self.control_path.exists() {
                *self.child.lock().await = Some(child);
                return Ok(());
            }
            if Instant::now() >= deadline {
                let mut child = child;
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(Error::ControlChannel(format!(
                    "control socket {} did not appear within {SOCKET_WAIT_DEADLINE:?}",
                    self.control_path.display()
                )));
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    fn op_command(&self, op: ControlOp) -> Command {
        let args = CommandBuilder::new(&self.control_path, self.host.user_at_host())
            .op(op)
            .build();
        let mut cmd = Command::new("ssh");
        cmd.args(args);
        cmd.stdin(std::process::Stdio::null());
        cmd
    }

    /// Success iff the control socket answers `-O check`.
    pub async fn check(&self) -> Result<(), Error> {
        let output = self
            .op_command(ControlOp::Check)
            .output()
            .await
            .map_err(|e| Error::ControlChannel(format!("failed to run ssh -O check: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::ControlChannel(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ))
        }
    }

    /// If `check` fails, remove any stale socket, tear down the previous
    /// subprocess, and open a new one. On success, notify the recovery
    /// channel so the Manager can trigger a full resync. Honors the circuit
    /// breaker and serializes concurrent recreation attempts.
    pub async fn ensure_alive(&self) -> Result<(), Error> {
        if self.check().await.is_ok() {
            self.breaker.lock().record_success();
            return Ok(());
        }

        let _guard = self.recreate_lock.lock().await;

        // Re-check: another task may have already recreated the channel
        // while we were waiting for the recreate lock.
        if self.check().await.is_ok() {
            self.breaker.lock().record_success();
            return Ok(());
        }

        if !self.breaker.lock().allow() {
            return Err(Error::ControlChannel(
                "circuit breaker open; control channel recreation suspended".into(),
            ));
        }

        warn!(host = %self.host, "control channel unresponsive, recreating");

        if self.control_path.exists() {
            let _ = std::fs::remove_file(&self.control_path);
        }
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        match self.open().await {
            Ok(()) => {
                self.breaker.lock().record_success();
                info!(host = %self.host, "control channel recreated");
                let _ = self.recovery_tx.try_send(());
                Ok(())
            }
            Err(e) => {
                self.breaker.lock().record_failure();
                Err(e)
            }
        }
    }

    /// Request a local forward through the control master.
    pub async fn forward(&self, local_port: u16, remote_port: u16) -> Result<(), Error> {
        self.do_forward(local_port, remote_port).await
    }

    async fn do_forward(&self, local_port: u16, remote_port: u16) -> Result<(), Error> {
        let spec = forward_spec(local_port, remote_port);
        let args = CommandBuilder::new(&self.control_path, self.host.user_at_host())
            .op(ControlOp::Forward)
            .forward(spec)
            .build();
        let output = Command::new("ssh")
            .args(args)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| Error::ControlChannel(format!("failed to run ssh -O forward: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            let message = String::from_utf8_lossy(&output.stderr).into_owned();
            let retryable = Error::is_port_in_use(&message);
            Err(Error::Forward { message, retryable })
        }
    }

    /// Cancel a local forward. Treats "not present" errors as non-fatal,
    /// since cancellations are expected to be graceful.
    pub async fn cancel(&self, local_port: u16, remote_port: u16) -> Result<(), Error> {
        self.do_cancel(local_port, remote_port).await
    }

    async fn do_cancel(&self, local_port: u16, remote_port: u16) -> Result<(), Error> {
        let spec = forward_spec(local_port, remote_port);
        let args = CommandBuilder::new(&self.control_path, self.host.user_at_host())
            .op(ControlOp::Cancel)
            .forward(spec)
            .build();
        let output = Command::new("ssh")
            .args(args)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| Error::ControlChannel(format!("failed to run ssh -O cancel: {e}")))?;
        if output.status.success() {
            return Ok(());
        }
        let message = String::from_utf8_lossy(&output.stderr).into_owned();
        if Error::is_forward_already_gone(&message) {
            debug!(port = remote_port, "cancel of already-gone forward treated as success");
            Ok(())
        } else {
            Err(Error::Forward {
                message,
                retryable: false,
            })
        }
    }

    /// Stop the health monitor (the caller owns its task handle), request a
    /// clean master exit, fall back to SIGTERM, and remove the socket.
    pub async fn close(&self) -> Result<(), Error> {
        let output = self.op_command(ControlOp::Exit).output().await;

        let mut child_guard = self.child.lock().await;
        if let Some(mut child) = child_guard.take() {
            sleep(Duration::from_millis(200)).await;
            if child.try_wait().ok().flatten().is_none() {
                let _ = child.start_kill();
            }
            let _ = child.wait().await;
        }
        drop(child_guard);

        if self.control_path.exists() {
            let _ = std::fs::remove_file(&self.control_path);
        }

        match output {
            Ok(out) if out.status.success() => Ok(()),
            Ok(out) => Err(Error::ControlChannel(
                String::from_utf8_lossy(&out.stderr).into_owned(),
            )),
            Err(e) => Err(Error::ControlChannel(format!("failed to run ssh -O exit: {e}"))),
        }
    }

    /// Run the remote command line `tokens` through the control channel and
    /// return its captured stdout. Used for one-shot remote-inspect queries.
    pub async fn run_remote_command(&self, tokens: Vec<String>) -> Result<Vec<u8>, Error> {
        let args = CommandBuilder::new(&self.control_path, self.host.user_at_host())
            .remote_command(tokens)
            .build();
        let output = Command::new("ssh")
            .args(args)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| Error::ControlChannel(format!("failed to run remote command: {e}")))?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(Error::ControlChannel(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ))
        }
    }

    /// Spawn the streaming subprocess for `tokens` through the control
    /// channel, returning the child with piped stdout for line-by-line
    /// consumption by the event source.
    pub fn spawn_streaming_command(&self, tokens: Vec<String>) -> Result<Child, Error> {
        let args = CommandBuilder::new(&self.control_path, self.host.user_at_host())
            .remote_command(tokens)
            .build();
        Command::new("ssh")
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ControlChannel(format!("failed to spawn remote command: {e}")))
    }

    /// Spawn the health monitor background task: periodically calls
    /// `ensure_alive` until `cancel` fires. Cancellable; the caller owns the
    /// returned handle.
    pub fn spawn_health_monitor(
        self: std::sync::Arc<Self>,
        interval: Duration,
        cancel: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.ensure_alive().await {
                            warn!(host = %self.host, error = %e, "health check failed");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ForwardChannel for ControlChannel {
    async fn forward(&self, local_port: u16, remote_port: u16) -> Result<(), Error> {
        self.do_forward(local_port, remote_port).await
    }

    async fn cancel(&self, local_port: u16, remote_port: u16) -> Result<(), Error> {
        self.do_cancel(local_port, remote_port).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_threshold_failures() {
        let mut b = CircuitBreaker::new(5, Duration::from_millis(20));
        for _ in 0..4 {
            assert!(b.allow());
            b.record_failure();
            assert!(!b.is_open());
        }
        assert!(b.allow());
        b.record_failure();
        assert!(b.is_open());
        assert!(!b.allow());
    }

    #[test]
    fn breaker_half_opens_after_cooldown_and_closes_on_success() {
        let mut b = CircuitBreaker::new(2, Duration::from_millis(10));
        b.record_failure();
        b.record_failure();
        assert!(b.is_open());
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.allow());
        b.record_success();
        assert!(!b.is_open());
        assert_eq!(b.failures, 0);
    }

    #[test]
    fn breaker_half_open_failure_reopens_immediately() {
        let mut b = CircuitBreaker::new(1, Duration::from_millis(10));
        b.record_failure();
        assert!(b.is_open());
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.allow());
        b.record_failure();
        assert!(b.is_open());
        assert!(!b.allow());
    }

    #[test]
    fn breaker_success_resets_failure_count() {
        let mut b = CircuitBreaker::new(5, Duration::from_secs(60));
        b.record_failure();
        b.record_failure();
        b.record_success();
        assert_eq!(b.failures, 0);
        assert!(!b.is_open());
    }
}
