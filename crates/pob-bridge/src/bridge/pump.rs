//! Background readers that drain the child's output streams.
//!
//! Both pipes must be drained continuously: a child blocked on a full
//! stderr pipe would never answer on stdout. Each pump runs on its own task
//! for the life of one process and ends when its stream closes.

use tokio::io::{AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::framing::FramedLineReader;
use super::queue::StdoutEvent;

/// Forward non-empty stdout lines to the queue, then exactly one
/// [`StdoutEvent::Closed`] when the stream ends or fails.
pub fn spawn_stdout_pump<R>(stdout: R, tx: mpsc::UnboundedSender<StdoutEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = FramedLineReader::new(BufReader::new(stdout));
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    if tx.send(StdoutEvent::Line(line)).is_err() {
                        // Session already torn down; nobody is listening.
                        return;
                    }
                }
                Ok(None) => {
                    debug!("bridge stdout closed");
                    break;
                }
                Err(e) => {
                    // Closure under a forced kill shows up here; not an error.
                    debug!(error = %e, "bridge stdout read ended");
                    break;
                }
            }
        }
        let _ = tx.send(StdoutEvent::Closed);
    })
}

/// Log each non-empty stderr line as child output. Never fails.
pub fn spawn_stderr_pump<R>(stderr: R, pid: Option<u32>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = FramedLineReader::new(BufReader::new(stderr));
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end();
                    if !line.is_empty() {
                        info!(target: "pob_bridge::child", pid, "{line}");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "bridge stderr read ended");
                    break;
                }
            }
        }
    })
}
