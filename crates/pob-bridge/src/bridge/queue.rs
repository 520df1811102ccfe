//! Hand-off queue between the stdout pump and the command channel.

use std::time::Duration;

use tokio::sync::mpsc;

/// What the stdout pump publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdoutEvent {
    /// One complete, non-empty line.
    Line(String),
    /// End of stream: the child closed stdout or the read failed.
    Closed,
}

/// Outcome of waiting on the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueRead {
    Line(String),
    /// The stream has ended; every later read returns this too.
    Closed,
    /// Nothing arrived before the deadline. The stream may still be open.
    TimedOut,
}

/// Unbounded, arrival-ordered queue of stdout lines with an explicit
/// end-of-stream marker.
///
/// The pump is the only producer. Consumers are the ready handshake and
/// the command channel, which never run concurrently.
#[derive(Debug)]
pub struct StdoutQueue {
    rx: mpsc::UnboundedReceiver<StdoutEvent>,
    closed: bool,
}

impl StdoutQueue {
    /// Create a queue and the sender handed to the stdout pump.
    pub fn channel() -> (mpsc::UnboundedSender<StdoutEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx, closed: false })
    }

    /// Wait up to `timeout` for the next line.
    pub async fn next(&mut self, timeout: Duration) -> QueueRead {
        if self.closed {
            return QueueRead::Closed;
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(StdoutEvent::Line(line))) => QueueRead::Line(line),
            // A dropped sender without a sentinel still means the stream is gone.
            Ok(Some(StdoutEvent::Closed)) | Ok(None) => {
                self.closed = true;
                QueueRead::Closed
            }
            Err(_) => QueueRead::TimedOut,
        }
    }

    /// Remove and return every line that is already queued, without waiting.
    ///
    /// Observing the end-of-stream marker here marks the queue closed.
    pub fn drain_pending(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while !self.closed {
            match self.rx.try_recv() {
                Ok(StdoutEvent::Line(line)) => lines.push(line),
                Ok(StdoutEvent::Closed) | Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.closed = true;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
            }
        }
        lines
    }

    /// Whether end-of-stream has been observed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn lines_arrive_in_order() {
        let (tx, mut queue) = StdoutQueue::channel();
        tx.send(StdoutEvent::Line("a".into())).unwrap();
        tx.send(StdoutEvent::Line("b".into())).unwrap();
        assert_eq!(queue.next(SHORT).await, QueueRead::Line("a".into()));
        assert_eq!(queue.next(SHORT).await, QueueRead::Line("b".into()));
    }

    #[tokio::test]
    async fn empty_queue_times_out_without_closing() {
        let (_tx, mut queue) = StdoutQueue::channel();
        assert_eq!(queue.next(SHORT).await, QueueRead::TimedOut);
        assert!(!queue.is_closed());
    }

    #[tokio::test]
    async fn sentinel_is_sticky() {
        let (tx, mut queue) = StdoutQueue::channel();
        tx.send(StdoutEvent::Closed).unwrap();
        assert_eq!(queue.next(SHORT).await, QueueRead::Closed);
        // Even if something were sent afterwards, the queue stays closed.
        tx.send(StdoutEvent::Line("late".into())).unwrap();
        assert_eq!(queue.next(SHORT).await, QueueRead::Closed);
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn dropped_sender_reads_as_closed() {
        let (tx, mut queue) = StdoutQueue::channel();
        drop(tx);
        assert_eq!(queue.next(SHORT).await, QueueRead::Closed);
    }

    #[tokio::test]
    async fn drain_returns_queued_lines_only() {
        let (tx, mut queue) = StdoutQueue::channel();
        tx.send(StdoutEvent::Line("stale-1".into())).unwrap();
        tx.send(StdoutEvent::Line("stale-2".into())).unwrap();
        assert_eq!(queue.drain_pending(), vec!["stale-1", "stale-2"]);
        assert!(queue.drain_pending().is_empty());
        assert!(!queue.is_closed());
    }

    #[tokio::test]
    async fn drain_notices_sentinel() {
        let (tx, mut queue) = StdoutQueue::channel();
        tx.send(StdoutEvent::Line("last words".into())).unwrap();
        tx.send(StdoutEvent::Closed).unwrap();
        assert_eq!(queue.drain_pending(), vec!["last words"]);
        assert!(queue.is_closed());
        assert_eq!(queue.next(SHORT).await, QueueRead::Closed);
    }
}
