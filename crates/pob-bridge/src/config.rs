use std::path::PathBuf;
use std::time::Duration;

use crate::error::BridgeError;

/// Bridge configuration.
///
/// Every value is supplied by the host; this crate does not read its
/// settings from the environment. Use [`parse_timeout`] for timeouts given as text.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Root of the Path of Building checkout (contains `src/` and `api/`).
    pub pob_path: PathBuf,
    /// Interpreter used to run the bridge script.
    pub luajit_path: String,
    /// How long to wait for the ready handshake.
    pub startup_timeout: Duration,
    /// Default deadline for a single command.
    pub command_timeout: Duration,
    /// Builds directory override, forwarded to the child as `POB_BUILDS_PATH`.
    pub builds_path: Option<PathBuf>,
}

impl BridgeConfig {
    /// The interpreter used when none is configured.
    pub const DEFAULT_LUAJIT: &str = "luajit";
    /// Default handshake and command deadline.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    /// Working directory of the child, relative to `pob_path`.
    pub const SRC_DIR: &str = "src";
    /// Bridge script, relative to `pob_path`.
    pub const SCRIPT: &str = "api/lua/bridge.lua";

    /// Build a config rooted at `pob_path` with every other value defaulted.
    pub fn new(pob_path: impl Into<PathBuf>) -> Self {
        Self {
            pob_path: pob_path.into(),
            luajit_path: Self::DEFAULT_LUAJIT.to_owned(),
            startup_timeout: Self::DEFAULT_TIMEOUT,
            command_timeout: Self::DEFAULT_TIMEOUT,
            builds_path: None,
        }
    }

    /// Directory the child runs in.
    pub fn working_dir(&self) -> PathBuf {
        self.pob_path.join(Self::SRC_DIR)
    }

    /// Script handed to the interpreter as its sole argument.
    pub fn script_path(&self) -> PathBuf {
        self.pob_path.join(Self::SCRIPT)
    }
}

/// Parse a timeout given in seconds.
pub fn parse_timeout(key: &'static str, raw: &str) -> Result<Duration, BridgeError> {
    let invalid = |reason: &str| BridgeError::InvalidConfig {
        key,
        value: raw.to_owned(),
        reason: reason.to_owned(),
    };
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| invalid("expected a number of seconds"))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(invalid("must be a positive number of seconds"));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| invalid("out of range"))
}
