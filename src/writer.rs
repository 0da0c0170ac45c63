//! Chunked payload writer.
//!
//! Splits a payload into fixed-size units and pushes them through an
//! [`Outbound`] one at a time. Two strategies drive the loop:
//!
//! - [`AckMode::Await`]: await each unit's acknowledgment, then issue the next.
//! - [`AckMode::Callback`]: each acknowledgment's continuation issues the next
//!   unit; the last one resolves the caller's future.
//!
//! Either way at most one unit is in flight. The first `TimedOut` or `Failed`
//! outcome aborts the session and closes the connection abruptly.

use crate::ack::WriteOutcome;
use crate::config::{AckMode, Framing};
use crate::error::TransferError;
use crate::session::TransferSession;
use crate::stats::{self, StatsReport};
use crate::transport::Outbound;
use bytes::Bytes;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

/// One write unit: a slice of the payload and where it starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferUnit {
    pub offset: usize,
    pub payload: Bytes,
}

impl TransferUnit {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Iterator over the units of a payload, in ascending offset order.
#[derive(Debug, Clone)]
pub struct Units {
    payload: Bytes,
    unit_size: usize,
    offset: usize,
}

impl Iterator for Units {
    type Item = TransferUnit;

    fn next(&mut self) -> Option<TransferUnit> {
        if self.offset >= self.payload.len() {
            return None;
        }
        let end = (self.offset + self.unit_size).min(self.payload.len());
        let unit = TransferUnit {
            offset: self.offset,
            payload: self.payload.slice(self.offset..end),
        };
        self.offset = end;
        Some(unit)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.payload.len() - self.offset).div_ceil(self.unit_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Units {}

/// Split `payload` into units of at most `unit_size` bytes.
///
/// Slicing shares the payload's storage; nothing is copied.
pub fn split_units(payload: Bytes, unit_size: NonZeroUsize) -> Units {
    Units {
        payload,
        unit_size: unit_size.get(),
        offset: 0,
    }
}

/// Result of a successful send
#[derive(Debug, Clone, Copy)]
pub struct SendSummary {
    /// Wire bytes acknowledged, the end record excluded
    pub bytes_written: u64,
    pub units_written: u32,
    /// `None` when there was nothing to send
    pub report: Option<StatsReport>,
}

/// Writes a payload as a sequence of acknowledged units
#[derive(Debug, Clone)]
pub struct ChunkWriter {
    unit_size: NonZeroUsize,
    write_timeout: Duration,
    close_timeout: Duration,
    ack_mode: AckMode,
    framing: Framing,
}

impl ChunkWriter {
    pub fn new(unit_size: NonZeroUsize, write_timeout: Duration, close_timeout: Duration) -> Self {
        Self {
            unit_size,
            write_timeout,
            close_timeout,
            ack_mode: AckMode::Await,
            framing: Framing::Raw,
        }
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Send `payload`, then close the connection.
    ///
    /// On success the connection is closed gracefully; on a write error it is
    /// closed immediately and the error returned without a report.
    pub async fn send(
        &self,
        outbound: &Outbound,
        payload: Bytes,
    ) -> Result<SendSummary, TransferError> {
        let session = Arc::new(TransferSession::new(payload.len() as u64));
        let units = split_units(payload, self.unit_size);
        info!(
            units = units.len(),
            unit_size = self.unit_size.get(),
            ack_mode = ?self.ack_mode,
            framing = ?self.framing,
            "Sending payload"
        );

        let result = match self.ack_mode {
            AckMode::Await => self.send_awaiting(outbound, units, &session).await,
            AckMode::Callback => self.send_chained(outbound, units, Arc::clone(&session)).await,
        };

        if let Err(e) = result {
            error!(error = %e, "Send aborted");
            outbound.close_now();
            session.reset();
            return Err(e);
        }

        let progress = session.snapshot();
        let report = match stats::finalize(&session, Instant::now()) {
            Ok(report) => Some(report),
            Err(e) => {
                debug!(reason = %e, "Nothing was sent");
                None
            }
        };

        if let Err(e) = outbound.close_graceful(self.close_timeout).await {
            warn!(error = %e, "Graceful close failed");
        }

        Ok(SendSummary {
            bytes_written: progress.bytes_transferred,
            units_written: progress.units_processed,
            report,
        })
    }

    async fn send_awaiting(
        &self,
        outbound: &Outbound,
        units: Units,
        session: &TransferSession,
    ) -> Result<(), TransferError> {
        for unit in units {
            let offset = unit.offset;
            trace!(offset, len = unit.len(), "Issuing unit");
            let wire = self.framing.encode_unit(unit.payload);
            let len = wire.len();
            session.start(Instant::now());

            let outcome = outbound.write(wire).wait(self.write_timeout).await;
            settle(session, offset, len, outcome, self.write_timeout)?;
        }
        self.send_trailer(outbound, payload_end(session)).await
    }

    async fn send_chained(
        &self,
        outbound: &Outbound,
        units: Units,
        session: Arc<TransferSession>,
    ) -> Result<(), TransferError> {
        let (done, finished) = oneshot::channel();
        let chain = Arc::new(Chain {
            outbound: outbound.clone(),
            units: Mutex::new(units),
            session: Arc::clone(&session),
            framing: self.framing,
            write_timeout: self.write_timeout,
            done: Mutex::new(Some(done)),
        });
        Chain::advance(chain);

        let result = finished.await.unwrap_or_else(|_| {
            Err(TransferError::WriteFailure {
                offset: 0,
                source: std::io::Error::other("write chain dropped without finishing"),
            })
        });
        result?;
        self.send_trailer(outbound, payload_end(&session)).await
    }

    /// The end record is acknowledged like a unit but not counted.
    async fn send_trailer(&self, outbound: &Outbound, offset: usize) -> Result<(), TransferError> {
        let Some(trailer) = self.framing.trailer() else {
            return Ok(());
        };
        let outcome = outbound.write(trailer).wait(self.write_timeout).await;
        check(offset, outcome, self.write_timeout)?;
        debug!("End record written");
        Ok(())
    }
}

fn payload_end(session: &TransferSession) -> usize {
    usize::try_from(session.expected_total_bytes()).unwrap_or(usize::MAX)
}

/// Continuation state for [`AckMode::Callback`]
struct Chain {
    outbound: Outbound,
    units: Mutex<Units>,
    session: Arc<TransferSession>,
    framing: Framing,
    write_timeout: Duration,
    done: Mutex<Option<oneshot::Sender<Result<(), TransferError>>>>,
}

impl Chain {
    /// Issue the next unit and register the continuation that issues the
    /// one after it.
    fn advance(chain: Arc<Chain>) {
        let next = chain
            .units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next();
        let Some(unit) = next else {
            chain.finish(Ok(()));
            return;
        };

        let offset = unit.offset;
        let wire = chain.framing.encode_unit(unit.payload);
        let len = wire.len();
        chain.session.start(Instant::now());

        let ack = chain.outbound.write(wire);
        let timeout = chain.write_timeout;
        ack.on_complete(timeout, move |outcome| {
            match settle(&chain.session, offset, len, outcome, timeout) {
                Ok(()) => Chain::advance(chain),
                Err(e) => chain.finish(Err(e)),
            }
        });
    }

    fn finish(&self, result: Result<(), TransferError>) {
        let done = self.done.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(done) = done {
            let _ = done.send(result);
        }
    }
}

/// Record a written unit or turn a bad outcome into the session's error.
fn settle(
    session: &TransferSession,
    offset: usize,
    len: usize,
    outcome: WriteOutcome,
    timeout: Duration,
) -> Result<(), TransferError> {
    check(offset, outcome, timeout)?;
    let progress = session.record(len);
    trace!(
        offset,
        len,
        total = progress.bytes_transferred,
        "Unit acknowledged"
    );
    Ok(())
}

fn check(offset: usize, outcome: WriteOutcome, timeout: Duration) -> Result<(), TransferError> {
    match outcome {
        WriteOutcome::Written => Ok(()),
        WriteOutcome::TimedOut => Err(TransferError::WriteTimeout { offset, timeout }),
        WriteOutcome::Failed(source) => Err(TransferError::WriteFailure { offset, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    const WAIT: Duration = Duration::from_secs(5);

    fn nz(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| i as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn test_units_cover_payload_exactly_once() {
        for len in [0usize, 1, 7, 64, 65, 1000] {
            for unit_size in [1usize, 3, 64, 4096] {
                let units: Vec<_> = split_units(payload(len), nz(unit_size)).collect();
                assert_eq!(units.len(), len.div_ceil(unit_size));

                let mut next = 0;
                for unit in &units {
                    assert_eq!(unit.offset, next);
                    assert!(!unit.is_empty() && unit.len() <= unit_size);
                    next += unit.len();
                }
                assert_eq!(next, len);
            }
        }
    }

    #[test]
    fn test_last_unit_length() {
        let units: Vec<_> = split_units(payload(10), nz(4)).collect();
        assert_eq!(
            units.iter().map(TransferUnit::len).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );

        let units: Vec<_> = split_units(payload(131072), nz(65536)).collect();
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].len(), 65536);
    }

    #[test]
    fn test_unit_larger_than_payload() {
        let mut units = split_units(payload(5), nz(100));
        assert_eq!(units.len(), 1);
        assert_eq!(units.next().unwrap().payload, payload(5));
        assert!(units.next().is_none());
    }

    #[tokio::test]
    async fn test_exact_unit_boundaries_on_the_wire() {
        let mock = tokio_test::io::Builder::new()
            .write(b"abcd")
            .write(b"efgh")
            .write(b"ij")
            .build();
        let outbound = Outbound::spawn(mock);
        let writer = ChunkWriter::new(nz(4), WAIT, WAIT);

        let summary = writer
            .send(&outbound, Bytes::from_static(b"abcdefghij"))
            .await
            .unwrap();
        assert_eq!(summary.bytes_written, 10);
        assert_eq!(summary.units_written, 3);
        let report = summary.report.unwrap();
        assert_eq!(report.total_bytes, 10);
        assert_eq!(report.unit_count, 3);
    }

    async fn send_over_duplex(writer: ChunkWriter, data: Bytes) -> (SendSummary, Vec<u8>) {
        let (client, mut server) = tokio::io::duplex(1024);
        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            server.read_to_end(&mut received).await.unwrap();
            received
        });
        let outbound = Outbound::spawn(client);
        let summary = writer.send(&outbound, data).await.unwrap();
        (summary, reader.await.unwrap())
    }

    #[tokio::test]
    async fn test_all_written_in_both_modes() {
        for mode in [AckMode::Await, AckMode::Callback] {
            let data = payload(10_000);
            let writer = ChunkWriter::new(nz(1500), WAIT, WAIT).with_ack_mode(mode);
            let (summary, received) = send_over_duplex(writer, data.clone()).await;

            assert_eq!(summary.bytes_written, 10_000, "{mode:?}");
            assert_eq!(summary.units_written, 7, "{mode:?}");
            assert_eq!(received, data.to_vec(), "{mode:?}");
        }
    }

    #[tokio::test]
    async fn test_empty_payload_is_trivially_complete() {
        for mode in [AckMode::Await, AckMode::Callback] {
            let writer = ChunkWriter::new(nz(16), WAIT, WAIT).with_ack_mode(mode);
            let (summary, received) = send_over_duplex(writer, Bytes::new()).await;
            assert_eq!(summary.bytes_written, 0);
            assert_eq!(summary.units_written, 0);
            assert!(summary.report.is_none());
            assert!(received.is_empty());
        }
    }

    #[tokio::test]
    async fn test_line_framing_adds_terminators_and_end_record() {
        let writer = ChunkWriter::new(nz(3), WAIT, WAIT).with_framing(Framing::Line);
        let (summary, received) = send_over_duplex(writer, Bytes::from_static(b"AAAAA")).await;
        assert_eq!(received, b"AAA\r\nAA\r\nEND_OF_TRANSMISSION\r\n");
        assert_eq!(summary.bytes_written, 9);
        assert_eq!(summary.units_written, 2);
    }

    #[tokio::test]
    async fn test_timeout_aborts_in_both_modes() {
        for mode in [AckMode::Await, AckMode::Callback] {
            // peer never reads, so the first unit larger than the pipe stalls
            let (client, _server) = tokio::io::duplex(16);
            let outbound = Outbound::spawn(client);
            let writer =
                ChunkWriter::new(nz(64), Duration::from_millis(50), WAIT).with_ack_mode(mode);

            let result = writer.send(&outbound, payload(256)).await;
            match result {
                Err(TransferError::WriteTimeout { offset, .. }) => assert_eq!(offset, 0),
                other => panic!("{mode:?}: unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_failure_stops_further_units() {
        // two units accepted, then the transport errors
        let mock = tokio_test::io::Builder::new()
            .write(b"aaaa")
            .write(b"bbbb")
            .write_error(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset by peer",
            ))
            .build();
        let outbound = Outbound::spawn(mock);
        let writer = ChunkWriter::new(nz(4), WAIT, WAIT).with_ack_mode(AckMode::Callback);

        let result = writer
            .send(&outbound, Bytes::from_static(b"aaaabbbbccccdddd"))
            .await;
        match result {
            Err(TransferError::WriteFailure { offset, source }) => {
                assert_eq!(offset, 8);
                assert_eq!(source.kind(), std::io::ErrorKind::ConnectionReset);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!outbound.write(Bytes::from_static(b"x")).wait(WAIT).await.is_written());
    }
}
