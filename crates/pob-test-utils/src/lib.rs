//! Shared test utilities for bridge integration tests.
//!
//! Provides [`FakeBridge`]: a throwaway Path of Building layout whose
//! `api/lua/bridge.lua` is really a POSIX shell script, run with
//! `/bin/sh` as the "interpreter". The script speaks the bridge protocol
//! well enough to exercise the real spawn, handshake, framing and
//! shutdown code without LuaJIT installed.
//!
//! Every request line the fake receives is appended to `requests.log` in
//! the layout root, so tests can assert on exactly what was sent.
//!
//! Canned responses are embedded in single quotes; they must not contain
//! `'` themselves.

use std::path::{Path, PathBuf};
use std::time::Duration;

use pob_bridge::{Bridge, BridgeConfig};
use tempfile::TempDir;

/// How the fake behaves before it starts reading commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Startup {
    /// Write `{"ready":true}` and serve commands.
    Ready,
    /// Write nothing and hang.
    Silent,
    /// Write a line that is not JSON, then hang.
    Garbage,
    /// Write `{"ready":false}`, then hang.
    NotReady,
    /// Exit without writing anything.
    ExitImmediately,
}

#[derive(Debug, Clone)]
enum Arm {
    Respond(String),
    Delayed { secs: f64, response: String },
    Die { code: i32 },
}

/// Builder for a fake bridge layout.
#[derive(Debug, Clone)]
pub struct FakeBridgeBuilder {
    startup: Startup,
    stderr_noise: usize,
    arms: Vec<(String, Arm)>,
    startup_timeout: Duration,
    command_timeout: Duration,
}

impl Default for FakeBridgeBuilder {
    fn default() -> Self {
        Self {
            startup: Startup::Ready,
            stderr_noise: 0,
            arms: Vec::new(),
            startup_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
        }
    }
}

impl FakeBridgeBuilder {
    pub fn startup(mut self, startup: Startup) -> Self {
        self.startup = startup;
        self
    }

    /// Write `lines` lines to stderr before the ready line.
    pub fn stderr_noise(mut self, lines: usize) -> Self {
        self.stderr_noise = lines;
        self
    }

    /// Answer `command` with the raw response line `response`.
    pub fn respond(mut self, command: &str, response: &str) -> Self {
        self.arms
            .push((command.to_owned(), Arm::Respond(response.to_owned())));
        self
    }

    /// Answer `command` with `{"ok":true,"result":<result>}`.
    pub fn respond_ok(self, command: &str, result: &str) -> Self {
        let line = format!(r#"{{"ok":true,"result":{result}}}"#);
        self.respond(command, &line)
    }

    /// Answer `command` with `{"ok":false,"error":<message>}`.
    pub fn respond_err(self, command: &str, message: &str) -> Self {
        let line = format!(r#"{{"ok":false,"error":"{message}"}}"#);
        self.respond(command, &line)
    }

    /// Sleep `secs` before answering `command`.
    pub fn respond_after(mut self, command: &str, secs: f64, response: &str) -> Self {
        self.arms.push((
            command.to_owned(),
            Arm::Delayed {
                secs,
                response: response.to_owned(),
            },
        ));
        self
    }

    /// Exit with `code`, without answering, when `command` arrives.
    pub fn die_on(mut self, command: &str, code: i32) -> Self {
        self.arms.push((command.to_owned(), Arm::Die { code }));
        self
    }

    /// Handshake deadline of the returned config.
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Write the layout to a fresh temp dir.
    pub fn build(self) -> FakeBridge {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        std::fs::create_dir_all(dir.path().join(BridgeConfig::SRC_DIR))
            .expect("failed to create src dir");

        let script_path = dir.path().join(BridgeConfig::SCRIPT);
        std::fs::create_dir_all(script_path.parent().expect("script has a parent"))
            .expect("failed to create script dir");
        std::fs::write(&script_path, self.render(dir.path())).expect("failed to write fake bridge");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
                .expect("failed to chmod fake bridge");
        }

        let mut config = BridgeConfig::new(dir.path());
        config.luajit_path = "/bin/sh".to_owned();
        config.startup_timeout = self.startup_timeout;
        config.command_timeout = self.command_timeout;

        FakeBridge { dir, config }
    }

    fn render(&self, root: &Path) -> String {
        let root = root.display();
        let mut script = format!(
            "#!/bin/sh\n\
             ROOT='{root}'\n\
             echo $$ > \"$ROOT/child.pid\"\n"
        );

        if self.stderr_noise > 0 {
            script.push_str(&format!(
                "i=0\n\
                 while [ $i -lt {} ]; do\n  \
                   echo \"loading data part $i of the passive tree\" >&2\n  \
                   i=$((i + 1))\n\
                 done\n",
                self.stderr_noise
            ));
        }

        match self.startup {
            Startup::Ready => script.push_str("echo '{\"ready\":true}'\n"),
            Startup::Silent => script.push_str("exec sleep 30\n"),
            Startup::Garbage => script.push_str("echo 'LuaJIT 2.1 banner'\nexec sleep 30\n"),
            Startup::NotReady => script.push_str("echo '{\"ready\":false}'\nexec sleep 30\n"),
            Startup::ExitImmediately => script.push_str("exit 0\n"),
        }

        script.push_str(
            "while IFS= read -r line; do\n  \
               printf '%s\\n' \"$line\" >> \"$ROOT/requests.log\"\n  \
               case \"$line\" in\n",
        );
        for (command, arm) in &self.arms {
            let body = match arm {
                Arm::Respond(response) => format!("echo '{response}'"),
                Arm::Delayed { secs, response } => format!("sleep {secs}; echo '{response}'"),
                Arm::Die { code } => format!("echo 'bridge: fatal error' >&2; exit {code}"),
            };
            script.push_str(&format!(
                "    *'\"command\":\"{command}\"'*) {body} ;;\n"
            ));
        }
        script.push_str(
            "    *'\"command\":\"shutdown\"'*) echo '{\"ok\":true,\"result\":{}}'; exit 0 ;;\n    \
                 *'\"params\":'*)\n      \
                   params=$(printf '%s\\n' \"$line\" | sed 's/^.*\"params\":\\(.*\\)}$/\\1/')\n      \
                   printf '{\"ok\":true,\"result\":{\"echo\":%s}}\\n' \"$params\" ;;\n    \
                 *) echo '{\"ok\":true,\"result\":{}}' ;;\n  \
               esac\n\
             done\n",
        );
        script
    }
}

/// A fake bridge layout on disk. Deleted on drop.
#[derive(Debug)]
pub struct FakeBridge {
    dir: TempDir,
    config: BridgeConfig,
}

impl FakeBridge {
    pub fn builder() -> FakeBridgeBuilder {
        FakeBridgeBuilder::default()
    }

    /// A fake that becomes ready immediately and echoes params back.
    pub fn ready() -> Self {
        Self::builder().build()
    }

    pub fn config(&self) -> BridgeConfig {
        self.config.clone()
    }

    pub fn bridge(&self) -> Bridge {
        Bridge::new(self.config())
    }

    /// Request lines received so far, in arrival order.
    pub fn requests(&self) -> Vec<String> {
        std::fs::read_to_string(self.requests_log())
            .map(|log| log.lines().map(str::to_owned).collect())
            .unwrap_or_default()
    }

    pub fn requests_log(&self) -> PathBuf {
        self.dir.path().join("requests.log")
    }

    /// Pid the most recent child wrote on startup.
    pub fn child_pid(&self) -> Option<u32> {
        std::fs::read_to_string(self.dir.path().join("child.pid"))
            .ok()
            .and_then(|pid| pid.trim().parse().ok())
    }
}
