use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use super::channel;
use super::process::{self, BridgeProcess, ExitWatch, LaunchSpec};
use crate::JsonMap;
use crate::config::BridgeConfig;
use crate::error::BridgeError;

/// Deadline for the child to acknowledge `shutdown`.
const SHUTDOWN_ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait for a natural exit after the acknowledgement.
const EXIT_GRACE: Duration = Duration::from_secs(5);
/// How long to wait for the pumps to flush after exit.
const PUMP_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle of a [`Bridge`].
///
/// ```text
/// Idle --start--> Starting --ready--> Ready <--> Running
///                    |                  |           |
///                    `--fail--> Idle    `-- exit ---+--> Crashed
/// any started state --shutdown--> ShuttingDown --> Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Starting,
    Ready,
    /// A command is in flight.
    Running,
    ShuttingDown,
    /// The child died. Only `shutdown`, `restart` or `ensure_running` leave
    /// this state.
    Crashed,
}

/// What happened during [`Bridge::shutdown`]. Shutdown never fails; this
/// is how its partial failures are reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// A session existed when shutdown began.
    pub was_started: bool,
    /// The child answered the `shutdown` command.
    pub acknowledged: bool,
    /// Why the `shutdown` command failed, if it did.
    pub command_error: Option<String>,
    /// The child exited on its own within the grace period.
    pub exited_gracefully: bool,
    /// The child had to be killed.
    pub forced_kill: bool,
}

/// One started child. A fresh session (and so a fresh command lock and
/// stdout queue) is created by every successful start.
struct Session {
    /// The command lock: held for the whole write-then-read of one exchange.
    process: Mutex<BridgeProcess>,
    exit: ExitWatch,
    pid: Option<u32>,
}

impl Session {
    fn new(process: BridgeProcess) -> Self {
        Self {
            exit: process.exit_watch(),
            pid: process.pid(),
            process: Mutex::new(process),
        }
    }
}

/// The public face of the bridge: lifecycle plus serialized commands.
///
/// Share it behind an `Arc`. Dropping the last handle kills the child;
/// call [`shutdown`](Self::shutdown) for an orderly exit.
pub struct Bridge {
    config: BridgeConfig,
    session: RwLock<Option<Arc<Session>>>,
    /// Serializes start, shutdown and restart.
    lifecycle: Mutex<()>,
    state: watch::Sender<BridgeState>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("pob_path", &self.config.pob_path)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}

/// Resets the state to `Idle` when dropped, so a cancelled shutdown does
/// not leave the bridge stuck in `ShuttingDown`.
struct IdleOnDrop<'a>(&'a watch::Sender<BridgeState>);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.send_replace(BridgeState::Idle);
    }
}

/// Moves the state `from -> to` when dropped, unless something else has
/// already moved it on. Restores `Starting -> Idle` and `Running -> Ready`
/// when a start or a command is cancelled mid-flight.
struct RevertOnDrop<'a> {
    bridge: &'a Bridge,
    /// When set, only revert while this session is still installed.
    session: Option<&'a Arc<Session>>,
    from: BridgeState,
    to: BridgeState,
}

impl Drop for RevertOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session {
            if !self.bridge.is_current(session) {
                return;
            }
        }
        self.bridge.move_state(self.from, self.to);
    }
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        let (state, _) = watch::channel(BridgeState::Idle);
        Self {
            config,
            session: RwLock::new(None),
            lifecycle: Mutex::new(()),
            state,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    /// Pid of the current child, if one has been started.
    pub fn pid(&self) -> Option<u32> {
        self.current().and_then(|session| session.pid)
    }

    /// True iff a child has been started and has not exited.
    ///
    /// Never blocks, even while a command is in flight.
    pub fn is_running(&self) -> bool {
        self.current().is_some_and(|session| session.exit.is_alive())
    }

    /// Start the child and wait for its ready handshake.
    ///
    /// A no-op when already started (including a crashed session; see
    /// [`ensure_running`](Self::ensure_running)). `timeout` defaults to the
    /// configured startup timeout. On failure the child is killed and the
    /// bridge is back to `Idle`.
    pub async fn start(&self, timeout: Option<Duration>) -> Result<(), BridgeError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.start_locked(timeout).await
    }

    /// Send one command and return its result mapping.
    ///
    /// Starts the bridge first if it was never started. Concurrent callers
    /// are served one at a time, in lock acquisition order. `timeout`
    /// defaults to the configured command timeout.
    pub async fn send_command(
        &self,
        command: &str,
        params: Option<JsonMap>,
        timeout: Option<Duration>,
    ) -> Result<JsonMap, BridgeError> {
        let session = match self.current() {
            Some(session) => session,
            None => {
                self.start(None).await?;
                self.current().ok_or(BridgeError::NotRunning)?
            }
        };
        let timeout = timeout.unwrap_or(self.config.command_timeout);

        let mut process = session.process.lock().await;
        self.transition(&session, BridgeState::Ready, BridgeState::Running);
        let _ready = RevertOnDrop {
            bridge: self,
            session: Some(&session),
            from: BridgeState::Running,
            to: BridgeState::Ready,
        };
        let result = channel::exchange(&mut process, command, params.as_ref(), timeout).await;

        if let Err(e) = &result {
            if e.is_fatal() {
                error!(command, pid = session.pid, error = %e, "bridge subprocess is unusable");
                if process.is_alive() {
                    process.terminate().await;
                }
                if self.is_current(&session) {
                    self.state.send_if_modified(|state| {
                        if matches!(state, BridgeState::Ready | BridgeState::Running) {
                            *state = BridgeState::Crashed;
                            true
                        } else {
                            false
                        }
                    });
                }
            }
        }
        result
    }

    /// [`send_command`](Self::send_command) with the default timeout.
    pub async fn call(&self, command: &str, params: Option<JsonMap>) -> Result<JsonMap, BridgeError> {
        self.send_command(command, params, None).await
    }

    /// Stop the child: ask it to exit, wait briefly, then kill it.
    ///
    /// Safe to call at any time and any number of times. The session is
    /// released before anything can fail, so a later `start` always spawns
    /// a fresh child.
    pub async fn shutdown(&self) -> ShutdownReport {
        let _lifecycle = self.lifecycle.lock().await;
        self.shutdown_locked().await
    }

    /// Shut down (if started) and start again.
    pub async fn restart(&self) -> Result<ShutdownReport, BridgeError> {
        let _lifecycle = self.lifecycle.lock().await;
        let report = self.shutdown_locked().await;
        self.start_locked(None).await?;
        Ok(report)
    }

    /// Make sure a live child is available, replacing a dead one.
    pub async fn ensure_running(&self) -> Result<(), BridgeError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }
        if self.current().is_some() {
            info!("bridge subprocess is not running; restarting");
            let report = self.shutdown_locked().await;
            debug!(?report, "cleared dead bridge session");
        }
        self.start_locked(None).await
    }

    // -----------------------------------------------------------------------
    // Internals; callers hold `lifecycle`.
    // -----------------------------------------------------------------------

    async fn start_locked(&self, timeout: Option<Duration>) -> Result<(), BridgeError> {
        if self.current().is_some() {
            return Ok(());
        }
        let timeout = timeout.unwrap_or(self.config.startup_timeout);
        let spec = LaunchSpec::from_config(&self.config);

        self.state.send_replace(BridgeState::Starting);
        let _idle = RevertOnDrop {
            bridge: self,
            session: None,
            from: BridgeState::Starting,
            to: BridgeState::Idle,
        };
        match Self::launch(&spec, timeout).await {
            Ok(process) => {
                let session = Arc::new(Session::new(process));
                info!(pid = session.pid, "bridge subprocess ready");
                *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
                self.state.send_replace(BridgeState::Ready);
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(BridgeState::Idle);
                Err(e)
            }
        }
    }

    async fn launch(spec: &LaunchSpec, timeout: Duration) -> Result<BridgeProcess, BridgeError> {
        let mut process = process::spawn(spec)?;
        debug!(timeout_ms = timeout.as_millis() as u64, "waiting for bridge ready line");
        if let Err(e) = channel::await_ready(&mut process, timeout).await {
            warn!(pid = process.pid(), error = %e, "bridge handshake failed; killing subprocess");
            process.terminate().await;
            return Err(e);
        }
        Ok(process)
    }

    async fn shutdown_locked(&self) -> ShutdownReport {
        let Some(session) = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return ShutdownReport::default();
        };

        self.state.send_replace(BridgeState::ShuttingDown);
        let _idle = IdleOnDrop(&self.state);
        let mut report = ShutdownReport {
            was_started: true,
            ..ShutdownReport::default()
        };

        let mut process = session.process.lock().await;
        if process.is_alive() {
            match channel::exchange(&mut process, "shutdown", None, SHUTDOWN_ACK_TIMEOUT).await {
                Ok(_) => report.acknowledged = true,
                Err(e) => {
                    debug!(error = %e, "bridge did not acknowledge shutdown");
                    report.command_error = Some(e.to_string());
                }
            }
            if process.wait_for_exit(EXIT_GRACE).await {
                report.exited_gracefully = true;
            } else {
                warn!(pid = session.pid, "bridge subprocess did not exit; killing it");
                report.forced_kill = true;
                process.terminate().await;
            }
        }
        process.join_pumps(PUMP_GRACE).await;

        info!(
            pid = session.pid,
            acknowledged = report.acknowledged,
            forced_kill = report.forced_kill,
            "bridge shut down"
        );
        report
    }

    fn current(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_current(&self, session: &Arc<Session>) -> bool {
        self.current().is_some_and(|cur| Arc::ptr_eq(&cur, session))
    }

    /// Move `from -> to`, but only for the installed session.
    fn transition(&self, session: &Arc<Session>, from: BridgeState, to: BridgeState) {
        if self.is_current(session) {
            self.move_state(from, to);
        }
    }

    fn move_state(&self, from: BridgeState, to: BridgeState) {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_bridge_is_idle() {
        let bridge = Bridge::new(BridgeConfig::new("/nonexistent/pob"));
        assert_eq!(bridge.state(), BridgeState::Idle);
        assert!(!bridge.is_running());
        assert!(bridge.pid().is_none());
    }

    #[tokio::test]
    async fn shutdown_before_start_is_a_no_op() {
        let bridge = Bridge::new(BridgeConfig::new("/nonexistent/pob"));
        let report = bridge.shutdown().await;
        assert_eq!(report, ShutdownReport::default());
        assert_eq!(bridge.state(), BridgeState::Idle);
    }

    #[tokio::test]
    async fn start_with_bad_paths_stays_idle() {
        let bridge = Bridge::new(BridgeConfig::new("/nonexistent/pob"));
        let err = bridge.start(None).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
        assert_eq!(bridge.state(), BridgeState::Idle);
        assert!(!bridge.is_running());
    }

    #[tokio::test]
    async fn send_command_surfaces_start_failure() {
        let bridge = Bridge::new(BridgeConfig::new("/nonexistent/pob"));
        let err = bridge.call("get_stats", None).await.unwrap_err();
        assert!(matches!(err, BridgeError::MissingPath { .. }), "{err:?}");
    }
}
