//! Write acknowledgment tracking.
//!
//! Every write handed to [`Outbound`](crate::transport::Outbound) returns a
//! [`WriteAck`]. The caller either awaits it with [`WriteAck::wait`] or hands
//! it a continuation with [`WriteAck::on_complete`]; both resolve through the
//! same timeout rules.

use std::io;
use std::time::Duration;
use tokio::sync::oneshot;

/// Result of one unit write
#[derive(Debug)]
pub enum WriteOutcome {
    /// The transport flushed the unit to the socket
    Written,
    /// The transport reported an error
    Failed(io::Error),
    /// No answer before the timeout; the write was abandoned
    TimedOut,
}

impl WriteOutcome {
    #[cfg(test)]
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written)
    }
}

/// Pending acknowledgment for a single write
#[derive(Debug)]
pub struct WriteAck {
    rx: oneshot::Receiver<io::Result<()>>,
}

impl WriteAck {
    pub(crate) fn new(rx: oneshot::Receiver<io::Result<()>>) -> Self {
        Self { rx }
    }

    /// An acknowledgment that has already failed.
    pub(crate) fn failed(error: io::Error) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self { rx }
    }

    /// Wait up to `timeout` for the transport's answer.
    ///
    /// On timeout the receiver is dropped, so a late answer is discarded.
    pub async fn wait(self, timeout: Duration) -> WriteOutcome {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(Ok(()))) => WriteOutcome::Written,
            Ok(Ok(Err(e))) => WriteOutcome::Failed(e),
            Ok(Err(_)) => WriteOutcome::Failed(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "writer stopped before acknowledging",
            )),
            Err(_) => WriteOutcome::TimedOut,
        }
    }

    /// Run `continuation` with the outcome once it is known.
    ///
    /// Must be called from within a tokio runtime.
    pub fn on_complete<F>(self, timeout: Duration, continuation: F)
    where
        F: FnOnce(WriteOutcome) + Send + 'static,
    {
        tokio::spawn(async move {
            let outcome = self.wait(timeout).await;
            continuation(outcome);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_written() {
        let (tx, rx) = oneshot::channel();
        tx.send(Ok(())).unwrap();
        let outcome = WriteAck::new(rx).wait(Duration::from_secs(1)).await;
        assert!(outcome.is_written());
    }

    #[tokio::test]
    async fn test_failed() {
        let outcome = WriteAck::failed(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .wait(Duration::from_secs(1))
            .await;
        match outcome {
            WriteOutcome::Failed(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sender_dropped_is_failure() {
        let (tx, rx) = oneshot::channel::<io::Result<()>>();
        drop(tx);
        let outcome = WriteAck::new(rx).wait(Duration::from_secs(1)).await;
        assert!(matches!(outcome, WriteOutcome::Failed(e) if e.kind() == io::ErrorKind::BrokenPipe));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_and_late_answer_ignored() {
        let (tx, rx) = oneshot::channel();
        let outcome = WriteAck::new(rx).wait(Duration::from_millis(50)).await;
        assert!(matches!(outcome, WriteOutcome::TimedOut));
        // the abandoned write's late answer goes nowhere
        assert!(tx.send(Ok(())).is_err());
    }

    #[tokio::test]
    async fn test_continuation() {
        let (tx, rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        WriteAck::new(rx).on_complete(Duration::from_secs(1), move |outcome| {
            let _ = done_tx.send(outcome.is_written());
        });
        tx.send(Ok(())).unwrap();
        assert!(done_rx.await.unwrap());
    }
}
