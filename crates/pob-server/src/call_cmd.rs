use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::debug;

use pob_bridge::{Bridge, BridgeConfig, JsonMap};

/// Parse `--params` into a JSON object. `None` and `{}` mean "no params".
fn parse_params(raw: Option<&str>) -> Result<Option<JsonMap>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("--params is not valid JSON: {raw}"))?;
    match value {
        Value::Object(map) if map.is_empty() => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        other => bail!("--params must be a JSON object, got: {other}"),
    }
}

fn parse_timeout(secs: Option<f64>) -> Result<Option<Duration>> {
    secs.map(|s| {
        Duration::try_from_secs_f64(s)
            .ok()
            .filter(|d| !d.is_zero())
            .with_context(|| format!("--timeout must be a positive number of seconds, got {s}"))
    })
    .transpose()
}

/// Start the bridge, run one command and return its result.
///
/// The bridge is shut down on every path.
pub async fn call_once(
    config: BridgeConfig,
    command: &str,
    params: Option<&str>,
    timeout: Option<f64>,
) -> Result<JsonMap> {
    let params = parse_params(params)?;
    let timeout = parse_timeout(timeout)?;

    let bridge = Bridge::new(config);
    let result = async {
        bridge.start(None).await.context("failed to start bridge")?;
        bridge
            .send_command(command, params, timeout)
            .await
            .with_context(|| format!("command '{command}' failed"))
    }
    .await;

    let report = bridge.shutdown().await;
    debug!(?report, "bridge shutdown report");
    result
}

/// Execute `pob-server call`: print the result as pretty JSON.
pub async fn run_call(
    config: BridgeConfig,
    command: &str,
    params: Option<&str>,
    timeout: Option<f64>,
) -> Result<()> {
    let result = call_once(config, command, params, timeout).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
