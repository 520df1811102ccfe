//! Configuration file management for pob-server.
//!
//! Provides a TOML-based config file at `~/.config/pob-server/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use pob_bridge::BridgeConfig;
use pob_bridge::config::parse_timeout;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BridgeSection {
    /// Path of Building root (contains `src/` and `api/`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pob_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub luajit_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_timeout_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builds_path: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the pob-server config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/pob-server` or
/// `~/.config/pob-server`, on every platform.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("pob-server");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("pob-server")
}

/// Return the path to the pob-server config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

fn load_config_from(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Load the config file if there is one. A file that exists but does not
/// parse is still an error.
pub fn load_optional_config() -> Result<ConfigFile> {
    let path = config_path();
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    load_config_from(&path)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line. `None` means "not given".
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub pob_path: Option<PathBuf>,
    pub luajit_path: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bridge: BridgeConfig,
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - `pob_path`: `--pob-path` > `POB_PATH` > `bridge.pob_path` > current directory
    /// - `luajit_path`: `--luajit-path` > `LUAJIT_PATH` > `bridge.luajit_path` > `luajit`
    /// - timeouts: `POB_BRIDGE_*_TIMEOUT` > `bridge.*_timeout_secs` > 30s
    /// - `builds_path`: `POB_BUILDS_PATH` > `bridge.builds_path` > unset
    /// - `host` / `port`: flag > `POB_API_HOST` / `POB_API_PORT` > `[server]` > 127.0.0.1:8000
    pub fn resolve(overrides: &Overrides) -> Result<Self> {
        let file = load_optional_config()?;
        Self::resolve_with(overrides, file)
    }

    fn resolve_with(overrides: &Overrides, file: ConfigFile) -> Result<Self> {
        let pob_path = match (&overrides.pob_path, env_nonempty("POB_PATH")) {
            (Some(path), _) => path.clone(),
            (None, Some(path)) => PathBuf::from(path),
            (None, None) => match file.bridge.pob_path {
                Some(path) => path,
                None => std::env::current_dir().context("failed to determine current directory")?,
            },
        };

        let mut bridge = BridgeConfig::new(pob_path);
        if let Some(luajit) = overrides
            .luajit_path
            .clone()
            .or_else(|| env_nonempty("LUAJIT_PATH"))
            .or(file.bridge.luajit_path)
        {
            bridge.luajit_path = luajit;
        }
        bridge.startup_timeout = resolve_timeout(
            "POB_BRIDGE_STARTUP_TIMEOUT",
            "bridge.startup_timeout_secs",
            file.bridge.startup_timeout_secs,
        )?;
        bridge.command_timeout = resolve_timeout(
            "POB_BRIDGE_COMMAND_TIMEOUT",
            "bridge.command_timeout_secs",
            file.bridge.command_timeout_secs,
        )?;
        bridge.builds_path = env_nonempty("POB_BUILDS_PATH")
            .map(PathBuf::from)
            .or(file.bridge.builds_path);

        let host = overrides
            .host
            .clone()
            .or_else(|| env_nonempty("POB_API_HOST"))
            .or(file.server.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string());

        let port = if let Some(port) = overrides.port {
            port
        } else if let Some(raw) = env_nonempty("POB_API_PORT") {
            raw.trim()
                .parse()
                .with_context(|| format!("invalid value for POB_API_PORT: {raw:?}"))?
        } else {
            file.server.port.unwrap_or(DEFAULT_PORT)
        };

        Ok(Self { bridge, host, port })
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn resolve_timeout(env_key: &'static str, file_key: &'static str, file_value: Option<f64>) -> Result<Duration> {
    if let Some(raw) = env_nonempty(env_key) {
        return Ok(parse_timeout(env_key, &raw)?);
    }
    match file_value {
        Some(secs) => Ok(parse_timeout(file_key, &secs.to_string())?),
        None => Ok(BridgeConfig::DEFAULT_TIMEOUT),
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
