//! Request/response exchange over a running [`BridgeProcess`].
//!
//! Callers must hold the session's command lock for the whole exchange;
//! taking `&mut BridgeProcess` enforces that at the type level.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::envelope::{RequestEnvelope, ResponseEnvelope, parse_ready};
use super::process::BridgeProcess;
use super::queue::QueueRead;
use crate::JsonMap;
use crate::error::BridgeError;

/// Wait for the child's one-time ready line.
pub async fn await_ready(process: &mut BridgeProcess, timeout: Duration) -> Result<(), BridgeError> {
    match process.stdout.next(timeout).await {
        QueueRead::Line(line) => {
            parse_ready(&line)?;
            debug!(pid = process.pid(), "bridge ready");
            Ok(())
        }
        QueueRead::Closed => Err(BridgeError::NoOutput),
        QueueRead::TimedOut => Err(BridgeError::StartupTimeout { timeout }),
    }
}

/// Send one command and wait up to `timeout` for its response.
///
/// Lines already sitting in the queue when the call starts belong to an
/// earlier request that timed out; they are logged and dropped so they are
/// not mistaken for this command's answer.
///
/// Cancelling this future while the request is being written leaves a
/// partial line in the child's stdin; every later exchange on the same
/// process then fails with [`BridgeError::PartialWrite`].
pub async fn exchange(
    process: &mut BridgeProcess,
    command: &str,
    params: Option<&JsonMap>,
    timeout: Duration,
) -> Result<JsonMap, BridgeError> {
    if !process.is_alive() {
        return Err(BridgeError::NotRunning);
    }
    if process.write_in_progress {
        return Err(BridgeError::PartialWrite);
    }
    for stale in process.stdout.drain_pending() {
        warn!(command, line = %stale, "discarding late response from an earlier command");
    }
    if process.stdout.is_closed() {
        return Err(BridgeError::NotRunning);
    }

    let mut request = RequestEnvelope::new(command, params).encode()?;
    debug!(command, request = %request, "sending bridge command");
    request.push('\n');

    process.write_in_progress = true;
    process
        .stdin
        .write_all(request.as_bytes())
        .await
        .map_err(BridgeError::Write)?;
    process.stdin.flush().await.map_err(BridgeError::Write)?;
    process.write_in_progress = false;

    match process.stdout.next(timeout).await {
        QueueRead::Line(line) => {
            debug!(command, response = %line, "bridge response");
            ResponseEnvelope::parse(&line)?.into_result(command)
        }
        QueueRead::Closed => Err(BridgeError::ChildExited {
            command: command.to_owned(),
        }),
        QueueRead::TimedOut => {
            warn!(command, timeout_ms = timeout.as_millis() as u64, "bridge command timed out");
            Err(BridgeError::Timeout {
                command: command.to_owned(),
                timeout,
            })
        }
    }
}
