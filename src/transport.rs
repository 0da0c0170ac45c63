//! Outbound write primitive.
//!
//! A single writer task owns the write half of the connection. Each call to
//! [`Outbound::write`] queues one unit; the task writes and flushes it, then
//! answers on the unit's [`WriteAck`]. After a failed write or a close
//! request the task stops, and every later write fails immediately.

use crate::ack::WriteAck;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, trace};

enum Request {
    Write {
        data: Bytes,
        ack: oneshot::Sender<io::Result<()>>,
    },
    Close {
        ack: oneshot::Sender<io::Result<()>>,
    },
}

/// Handle to a connection's writer task
#[derive(Clone)]
pub struct Outbound {
    requests: mpsc::UnboundedSender<Request>,
    abort: Arc<AbortHandle>,
}

impl Outbound {
    /// Spawn the writer task for `writer`.
    pub fn spawn<W>(writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (requests, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drive(writer, rx));
        Self {
            requests,
            abort: Arc::new(task.abort_handle()),
        }
    }

    /// Queue one unit for writing.
    pub fn write(&self, data: Bytes) -> WriteAck {
        let (ack, rx) = oneshot::channel();
        match self.requests.send(Request::Write { data, ack }) {
            Ok(()) => WriteAck::new(rx),
            Err(_) => WriteAck::failed(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            )),
        }
    }

    /// Flush everything queued so far, then shut the write side down.
    ///
    /// Falls back to [`Outbound::close_now`] if this takes longer than
    /// `timeout`.
    pub async fn close_graceful(&self, timeout: Duration) -> io::Result<()> {
        let (ack, rx) = oneshot::channel();
        if self.requests.send(Request::Close { ack }).is_err() {
            return Ok(());
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // writer stopped on its own; nothing left to flush
            Ok(Err(_)) => Ok(()),
            Err(_) => {
                self.close_now();
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "graceful close did not finish in time",
                ))
            }
        }
    }

    /// Stop the writer task, discarding anything still queued.
    pub fn close_now(&self) {
        self.abort.abort();
    }
}

async fn drive<W>(mut writer: W, mut requests: mpsc::UnboundedReceiver<Request>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(request) = requests.recv().await {
        match request {
            Request::Write { data, ack } => {
                let result = write_unit(&mut writer, &data).await;
                let failed = result.is_err();
                if let Err(ref e) = result {
                    debug!(error = %e, len = data.len(), "Write failed, stopping writer");
                }
                let _ = ack.send(result);
                if failed {
                    break;
                }
            }
            Request::Close { ack } => {
                let _ = ack.send(writer.shutdown().await);
                break;
            }
        }
    }
    trace!("Writer task finished");
}

async fn write_unit<W>(writer: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(data).await?;
    writer.flush().await
}
