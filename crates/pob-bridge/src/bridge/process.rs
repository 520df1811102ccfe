//! Process supervision: validate, spawn, watch and terminate the child.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pump::{spawn_stderr_pump, spawn_stdout_pump};
use super::queue::StdoutQueue;
use crate::config::BridgeConfig;
use crate::error::BridgeError;

/// Pure-Lua module patterns, relative to the child's working directory.
pub const LUA_PATH_ENTRIES: &str = "../runtime/lua/?.lua;../runtime/lua/?/init.lua";
/// Native module patterns; only needed where DLL lookup differs (Windows).
pub const LUA_CPATH_ENTRIES: &str = "../runtime/?.dll";

/// How long `terminate` waits for the killed child to be reaped.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to launch the child.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Interpreter to run.
    pub executable: String,
    /// Script passed as the sole argument. Relative paths resolve against
    /// `working_dir`.
    pub script: PathBuf,
    /// Directory the child runs in.
    pub working_dir: PathBuf,
    /// Variables set on top of the inherited environment.
    pub env: Vec<(String, OsString)>,
}

impl LaunchSpec {
    /// Derive the launch parameters from a [`BridgeConfig`], using this
    /// process's environment as the base for the module search paths.
    pub fn from_config(config: &BridgeConfig) -> Self {
        let root = std::path::absolute(&config.pob_path).unwrap_or_else(|_| config.pob_path.clone());
        let mut env = module_search_env(|key| std::env::var_os(key), cfg!(windows));
        if let Some(builds) = &config.builds_path {
            env.push(("POB_BUILDS_PATH".to_owned(), builds.clone().into_os_string()));
        }
        Self {
            executable: config.luajit_path.clone(),
            script: root.join(BridgeConfig::SCRIPT),
            working_dir: root.join(BridgeConfig::SRC_DIR),
            env,
        }
    }

    /// Check the paths before spawning, so a bad configuration fails with
    /// the missing path named instead of as a silent startup hang.
    ///
    /// Returns the script path as the child will see it.
    pub fn validate(&self) -> Result<PathBuf, BridgeError> {
        if !self.working_dir.is_dir() {
            return Err(BridgeError::MissingPath {
                what: "bridge working directory",
                path: self.working_dir.clone(),
            });
        }
        let script = resolve_against(&self.working_dir, &self.script);
        if !script.is_file() {
            return Err(BridgeError::MissingPath {
                what: "bridge script",
                path: script,
            });
        }
        Ok(script)
    }
}

fn resolve_against(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Module search path variables for the child.
///
/// Our entries are prepended to whatever the parent already has, so an
/// operator's own `LUA_PATH` keeps working. With nothing inherited, Lua's
/// `;;` marker appends the interpreter's built-in default path.
pub fn module_search_env(
    inherited: impl Fn(&str) -> Option<OsString>,
    native_modules: bool,
) -> Vec<(String, OsString)> {
    let mut env = vec![(
        "LUA_PATH".to_owned(),
        prepend_search_path(LUA_PATH_ENTRIES, inherited("LUA_PATH")),
    )];
    if native_modules {
        env.push((
            "LUA_CPATH".to_owned(),
            prepend_search_path(LUA_CPATH_ENTRIES, inherited("LUA_CPATH")),
        ));
    }
    env
}

fn prepend_search_path(ours: &str, inherited: Option<OsString>) -> OsString {
    match inherited.filter(|value| !value.is_empty()) {
        Some(existing) => {
            let mut joined = OsString::from(ours);
            joined.push(";");
            joined.push(existing);
            joined
        }
        None => OsString::from(format!("{ours};;")),
    }
}

// ---------------------------------------------------------------------------
// Exit tracking
// ---------------------------------------------------------------------------

/// Lock-free view of whether the child has exited.
#[derive(Debug, Clone)]
pub struct ExitWatch {
    exited: watch::Receiver<bool>,
}

impl ExitWatch {
    pub fn is_alive(&self) -> bool {
        !*self.exited.borrow()
    }

    /// Wait up to `timeout` for the child to exit. Returns whether it did.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.exited.clone();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|exited| *exited)).await,
            Ok(Ok(_))
        )
    }
}

/// Move the child into a task that reaps it and publishes its exit.
///
/// Sending on (or dropping) the returned sender kills the child, so a
/// dropped [`BridgeProcess`] never leaves an orphan behind.
fn spawn_exit_monitor(mut child: Child, pid: Option<u32>) -> (ExitWatch, oneshot::Sender<()>) {
    let (exited_tx, exited_rx) = watch::channel(false);
    let (kill_tx, kill_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                debug!(pid, "killing bridge subprocess");
                if let Err(e) = child.start_kill() {
                    debug!(pid, error = %e, "kill failed (already exited?)");
                }
                child.wait().await
            }
        };
        match status {
            Ok(status) => info!(pid, %status, "bridge subprocess exited"),
            Err(e) => warn!(pid, error = %e, "failed to wait on bridge subprocess"),
        }
        exited_tx.send_replace(true);
    });

    (ExitWatch { exited: exited_rx }, kill_tx)
}

// ---------------------------------------------------------------------------
// BridgeProcess
// ---------------------------------------------------------------------------

/// A running child with its stdin, its stdout queue and its pumps.
pub struct BridgeProcess {
    pid: Option<u32>,
    pub(crate) stdin: ChildStdin,
    pub(crate) stdout: StdoutQueue,
    /// Set while a request line is being written. Still set on entry to
    /// the next exchange means that write was cancelled part-way.
    pub(crate) write_in_progress: bool,
    exit: ExitWatch,
    kill: Option<oneshot::Sender<()>>,
    pumps: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for BridgeProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeProcess")
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Validate `spec`, spawn the child with all three streams piped, and start
/// both pumps.
///
/// If any step fails, nothing is left running: pumps are only started once
/// every pipe has been captured, and a child that was spawned is killed on
/// drop.
pub fn spawn(spec: &LaunchSpec) -> Result<BridgeProcess, BridgeError> {
    let script = spec.validate()?;

    info!(
        executable = %spec.executable,
        script = %script.display(),
        cwd = %spec.working_dir.display(),
        "starting bridge subprocess"
    );

    let mut cmd = Command::new(&spec.executable);
    cmd.arg(&script)
        .current_dir(&spec.working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Merge, don't replace the entire env.
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|source| BridgeError::Spawn {
        executable: spec.executable.clone(),
        source,
    })?;
    let pid = child.id();

    let stdin = child.stdin.take().ok_or(BridgeError::MissingPipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(BridgeError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(BridgeError::MissingPipe("stderr"))?;

    let (tx, queue) = StdoutQueue::channel();
    let pumps = vec![
        spawn_stdout_pump(stdout, tx),
        spawn_stderr_pump(stderr, pid),
    ];
    let (exit, kill) = spawn_exit_monitor(child, pid);

    debug!(pid, "bridge subprocess spawned");
    Ok(BridgeProcess {
        pid,
        stdin,
        stdout: queue,
        write_in_progress: false,
        exit,
        kill: Some(kill),
        pumps,
    })
}

impl BridgeProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.exit.is_alive()
    }

    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    /// Wait up to `timeout` for a natural exit.
    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        self.exit.wait(timeout).await
    }

    /// Force-kill and wait up to [`TERMINATE_GRACE`] for the exit.
    ///
    /// An already-exited child counts as success. Returns whether the exit
    /// was observed; never fails.
    pub async fn terminate(&mut self) -> bool {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        let exited = self.wait_for_exit(TERMINATE_GRACE).await;
        if !exited {
            warn!(pid = self.pid, "bridge subprocess did not exit after kill");
        }
        exited
    }

    /// Give the pumps up to `timeout` to flush trailing output after exit.
    pub async fn join_pumps(&mut self, timeout: Duration) {
        for pump in self.pumps.drain(..) {
            if tokio::time::timeout(timeout, pump).await.is_err() {
                // A grandchild may still hold the pipe open.
                debug!(pid = self.pid, "stream pump still running after exit");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn inherited(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let map: HashMap<String, OsString> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn lookup<'a>(env: &'a [(String, OsString)], key: &str) -> Option<&'a OsString> {
        env.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    #[test]
    fn lua_path_gets_default_marker_when_nothing_inherited() {
        let env = module_search_env(inherited(&[]), false);
        assert_eq!(
            lookup(&env, "LUA_PATH").unwrap(),
            "../runtime/lua/?.lua;../runtime/lua/?/init.lua;;"
        );
        assert!(lookup(&env, "LUA_CPATH").is_none());
    }

    #[test]
    fn lua_path_is_prepended_to_inherited_value() {
        let env = module_search_env(inherited(&[("LUA_PATH", "/usr/share/lua/?.lua;;")]), false);
        assert_eq!(
            lookup(&env, "LUA_PATH").unwrap(),
            "../runtime/lua/?.lua;../runtime/lua/?/init.lua;/usr/share/lua/?.lua;;"
        );
    }

    #[test]
    fn empty_inherited_value_counts_as_unset() {
        let env = module_search_env(inherited(&[("LUA_PATH", "")]), false);
        assert!(lookup(&env, "LUA_PATH").unwrap().to_string_lossy().ends_with(";;"));
    }

    #[test]
    fn native_platform_also_sets_cpath() {
        let env = module_search_env(inherited(&[("LUA_CPATH", "C:\\lua\\?.dll")]), true);
        assert_eq!(
            lookup(&env, "LUA_CPATH").unwrap(),
            "../runtime/?.dll;C:\\lua\\?.dll"
        );
    }

    #[test]
    fn from_config_derives_absolute_layout() {
        let mut config = BridgeConfig::new("/opt/pob");
        config.luajit_path = "/usr/bin/luajit".to_string();
        config.builds_path = Some(PathBuf::from("/home/me/builds"));

        let spec = LaunchSpec::from_config(&config);
        assert_eq!(spec.executable, "/usr/bin/luajit");
        assert_eq!(spec.working_dir, PathBuf::from("/opt/pob/src"));
        assert_eq!(spec.script, PathBuf::from("/opt/pob/api/lua/bridge.lua"));
        assert_eq!(
            lookup(&spec.env, "POB_BUILDS_PATH").unwrap(),
            "/home/me/builds"
        );
    }

    #[test]
    fn relative_root_is_made_absolute() {
        let spec = LaunchSpec::from_config(&BridgeConfig::new("relative/pob"));
        assert!(spec.working_dir.is_absolute());
        assert!(spec.script.is_absolute());
    }

    #[test]
    fn validate_rejects_missing_working_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::from_config(&BridgeConfig::new(tmp.path()));
        let err = spec.validate().unwrap_err();
        assert!(
            err.to_string().starts_with("bridge working directory not found"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn validate_rejects_missing_script() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("src")).unwrap();
        let spec = LaunchSpec::from_config(&BridgeConfig::new(tmp.path()));
        let err = spec.validate().unwrap_err();
        assert!(
            err.to_string().starts_with("bridge script not found"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn validate_resolves_relative_script_from_working_dir() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/bridge.lua"), "").unwrap();
        let spec = LaunchSpec {
            executable: "luajit".to_string(),
            script: PathBuf::from("bridge.lua"),
            working_dir: tmp.path().join("src"),
            env: Vec::new(),
        };
        assert_eq!(spec.validate().unwrap(), tmp.path().join("src/bridge.lua"));
    }

    #[tokio::test]
    async fn spawn_missing_interpreter_fails_without_leaking() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::create_dir_all(tmp.path().join("api/lua")).unwrap();
        std::fs::write(tmp.path().join("api/lua/bridge.lua"), "").unwrap();

        let mut config = BridgeConfig::new(tmp.path());
        config.luajit_path = "/nonexistent/path/to/luajit".to_string();
        let err = spawn(&LaunchSpec::from_config(&config)).unwrap_err();
        assert!(matches!(err, BridgeError::Spawn { .. }), "{err:?}");
        assert!(err.to_string().contains("/nonexistent/path/to/luajit"));
    }
}
