mod call_cmd;
mod config;
mod mcp_cmd;
mod serve_cmd;
#[cfg(test)]
mod test_util;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use config::{Overrides, ServerConfig};

#[derive(Parser)]
#[command(
    name = "pob-server",
    version,
    about = "Serve the Path of Building calculation engine over HTTP and MCP"
)]
struct Cli {
    /// Path of Building root directory (overrides POB_PATH env var)
    #[arg(long, global = true)]
    pob_path: Option<PathBuf>,

    /// LuaJIT interpreter to run the engine with (overrides LUAJIT_PATH env var)
    #[arg(long, global = true)]
    luajit_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a pob-server config file (requires --pob-path)
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the HTTP API
    Serve {
        /// Address to bind (overrides POB_API_HOST env var)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides POB_API_PORT env var)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the MCP tool-call server on stdin/stdout
    Mcp,
    /// Send a single command to the engine and print the result
    Call {
        /// Bridge command name, e.g. get_build_info
        command: String,
        /// Command parameters as a JSON object
        #[arg(long)]
        params: Option<String>,
        /// Command timeout in seconds
        #[arg(long)]
        timeout: Option<f64>,
    },
}

/// Execute the `pob-server init` command: write config file.
fn cmd_init(pob_path: Option<PathBuf>, luajit_path: Option<String>, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let pob_path = pob_path.context("--pob-path is required for init")?;
    let pob_path = std::path::absolute(&pob_path)
        .with_context(|| format!("failed to resolve {}", pob_path.display()))?;

    let cfg = config::ConfigFile {
        bridge: config::BridgeSection {
            pob_path: Some(pob_path.clone()),
            luajit_path: luajit_path.clone(),
            ..Default::default()
        },
        server: config::ServerSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  bridge.pob_path = {}", pob_path.display());
    if let Some(luajit) = &luajit_path {
        println!("  bridge.luajit_path = {luajit}");
    }
    println!();
    println!("Next: run `pob-server serve` or `pob-server mcp`.");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut overrides = Overrides {
        pob_path: cli.pob_path,
        luajit_path: cli.luajit_path,
        ..Default::default()
    };

    match cli.command {
        Commands::Init { force } => {
            cmd_init(overrides.pob_path, overrides.luajit_path, force)?;
        }
        Commands::Serve { host, port } => {
            overrides.host = host;
            overrides.port = port;
            let resolved = ServerConfig::resolve(&overrides)?;
            serve_cmd::run_serve(resolved).await?;
        }
        Commands::Mcp => {
            let resolved = ServerConfig::resolve(&overrides)?;
            mcp_cmd::run_mcp(resolved.bridge).await?;
        }
        Commands::Call {
            command,
            params,
            timeout,
        } => {
            let resolved = ServerConfig::resolve(&overrides)?;
            call_cmd::run_call(resolved.bridge, &command, params.as_deref(), timeout).await?;
        }
    }

    Ok(())
}
