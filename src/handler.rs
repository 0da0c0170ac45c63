//! Connection event handling.
//!
//! The server drives every accepted connection through a
//! [`ConnectionHandler`]. [`TransferHandler`] is the one implementation: it
//! owns the connection's [`TransferReceiver`] and turns transport events into
//! session updates and reports.

use crate::config::{Config, Framing};
use crate::error::TransferError;
use crate::framing::{LineDecoder, Record};
use crate::receiver::{SegmentOutcome, TransferReceiver};
use crate::session::TransferSession;
use crate::stats::StatsReport;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Facts about a freshly accepted connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: usize,
    pub peer: SocketAddr,
    /// SO_SNDBUF, if it could be read
    pub send_buffer_size: Option<usize>,
    /// SO_RCVBUF, if it could be read
    pub recv_buffer_size: Option<usize>,
}

/// Transport events for one connection, delivered in order by one task.
pub trait ConnectionHandler: Send {
    fn on_open(&mut self, info: &ConnectionInfo);
    /// One inbound segment; empty at end of stream.
    fn on_data(&mut self, segment: &[u8]);
    fn on_error(&mut self, error: &io::Error);
    fn on_close(&mut self);
}

/// Measures throughput of the transfers arriving on one connection
pub struct TransferHandler {
    id: usize,
    receiver: TransferReceiver,
    decoder: Option<LineDecoder>,
    records: Vec<Record>,
    reports: Option<mpsc::UnboundedSender<StatsReport>>,
    completed: u32,
}

impl TransferHandler {
    pub fn new(
        id: usize,
        session: Arc<TransferSession>,
        config: &Config,
        reports: Option<mpsc::UnboundedSender<StatsReport>>,
    ) -> Self {
        let receiver =
            TransferReceiver::new(session, config.eof_heuristic, config.progress_interval);
        // line counts include terminators, so the shared total cannot be the threshold
        let (receiver, decoder) = match config.framing {
            Framing::Raw => (receiver, None),
            Framing::Line => (
                receiver.without_threshold(),
                Some(LineDecoder::new(config.max_record_size)),
            ),
        };
        Self {
            id,
            receiver,
            decoder,
            records: Vec::new(),
            reports,
            completed: 0,
        }
    }

    /// Number of transfers completed on this connection
    #[cfg(test)]
    pub fn completed(&self) -> u32 {
        self.completed
    }

    fn handle(&mut self, outcome: SegmentOutcome) {
        if let SegmentOutcome::Completed { reason, report } = outcome {
            self.completed += 1;
            info!(
                connection = self.id,
                ?reason,
                transfer = self.completed,
                "Transfer finished"
            );
            report.emit("receiver");
            if let Some(ref reports) = self.reports {
                let _ = reports.send(report);
            }
        }
    }

    fn on_line_data(&mut self, segment: &[u8], now: Instant) {
        let Some(decoder) = self.decoder.as_mut() else {
            return;
        };

        if segment.is_empty() {
            if decoder.pending() > 0 {
                let dropped = decoder.discard();
                warn!(connection = self.id, dropped, "Partial record discarded at end of stream");
            }
            let outcome = self.receiver.on_segment(0, now);
            self.handle(outcome);
            return;
        }

        let mut records = std::mem::take(&mut self.records);
        decoder.push(segment, &mut records);
        for record in records.drain(..) {
            let outcome = match record {
                Record::Data { len } => self.receiver.on_segment(len, now),
                Record::EndOfTransmission => self.receiver.on_end_record(now),
            };
            self.handle(outcome);
        }
        self.records = records;
    }

    /// Drop any partial session, reporting it as a disconnect.
    fn release(&mut self) {
        if self.receiver.in_progress() {
            let progress = self.receiver.release();
            let error = TransferError::UnexpectedDisconnect {
                bytes_received: progress.bytes_transferred,
            };
            warn!(connection = self.id, error = %error, "Transfer abandoned");
        } else {
            self.receiver.release();
        }
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.discard();
        }
    }
}

impl ConnectionHandler for TransferHandler {
    fn on_open(&mut self, info: &ConnectionInfo) {
        info!(
            connection = info.id,
            peer = %info.peer,
            send_buffer = ?info.send_buffer_size,
            recv_buffer = ?info.recv_buffer_size,
            "Connection opened"
        );
    }

    fn on_data(&mut self, segment: &[u8]) {
        let now = Instant::now();
        if self.decoder.is_some() {
            self.on_line_data(segment, now);
        } else {
            let outcome = self.receiver.on_segment(segment.len(), now);
            self.handle(outcome);
        }
    }

    fn on_error(&mut self, error: &io::Error) {
        error!(connection = self.id, error = %error, "Connection error");
        self.release();
    }

    fn on_close(&mut self) {
        self.release();
        info!(
            connection = self.id,
            transfers = self.completed,
            "Connection closed"
        );
    }
}
