//! Inbound transfer accounting.
//!
//! `TransferReceiver` is fed every inbound segment of one connection, in
//! arrival order. Segment boundaries are whatever the transport delivered and
//! carry no meaning; only the running totals matter.

use crate::detector::{CompletionDetector, CompletionReason};
use crate::session::{Progress, SessionState, TransferSession};
use crate::stats::{self, StatsReport};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What a single segment did to the session
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SegmentOutcome {
    /// Empty segment before any data; nothing recorded
    Ignored,
    /// Recorded, transfer still running
    Accepted(Progress),
    /// Transfer finished and the session was reset
    Completed {
        reason: CompletionReason,
        report: StatsReport,
    },
    /// Completion fired without a running clock; session reset, no report
    Skipped,
}

/// Folds inbound segments into a connection's session
#[derive(Debug)]
pub struct TransferReceiver {
    session: Arc<TransferSession>,
    detector: CompletionDetector,
    progress_interval: u32,
}

impl TransferReceiver {
    pub fn new(session: Arc<TransferSession>, eof_heuristic: bool, progress_interval: u32) -> Self {
        let detector = CompletionDetector::new(session.expected_total_bytes(), eof_heuristic);
        Self {
            session,
            detector,
            progress_interval,
        }
    }

    /// Complete only by end record or end of stream.
    pub fn without_threshold(mut self) -> Self {
        self.detector = self.detector.without_threshold();
        self
    }

    #[cfg(test)]
    pub fn session(&self) -> &Arc<TransferSession> {
        &self.session
    }

    /// Account for one segment of `len` bytes received at `now`.
    pub fn on_segment(&mut self, len: usize, now: Instant) -> SegmentOutcome {
        if len == 0 && self.session.is_pristine() {
            debug!("Empty segment before any data, ignored");
            return SegmentOutcome::Ignored;
        }

        if len > 0 && self.session.start(now) {
            info!(
                expected = self.session.expected_total_bytes(),
                "Transfer started"
            );
        }

        let progress = self.session.record(len);
        self.log_progress(len, &progress);

        match self.detector.evaluate(len, &progress) {
            Some(reason) => self.complete(reason, now),
            None => SegmentOutcome::Accepted(progress),
        }
    }

    /// The peer sent the explicit end record.
    pub fn on_end_record(&mut self, now: Instant) -> SegmentOutcome {
        if self.session.is_pristine() {
            debug!("End record with no data in progress, ignored");
            return SegmentOutcome::Ignored;
        }
        let reason = self.detector.signal_sentinel(&self.session.snapshot());
        self.complete(reason, now)
    }

    /// True while data has been seen but the transfer has not completed.
    pub fn in_progress(&self) -> bool {
        self.session.state() == SessionState::InProgress
    }

    /// Abandon the current session, returning what had been received.
    pub fn release(&mut self) -> Progress {
        let progress = self.session.snapshot();
        self.session.reset();
        self.detector.reset();
        progress
    }

    fn complete(&mut self, reason: CompletionReason, now: Instant) -> SegmentOutcome {
        let result = stats::finalize(&self.session, now);
        self.detector.reset();
        match result {
            Ok(report) => SegmentOutcome::Completed { reason, report },
            Err(e) => {
                warn!(error = %e, ?reason, "Completion without statistics");
                SegmentOutcome::Skipped
            }
        }
    }

    fn log_progress(&self, len: usize, progress: &Progress) {
        if len == 0 || self.progress_interval == 0 {
            return;
        }
        if progress.units_processed % self.progress_interval == 0
            && progress.bytes_transferred < self.session.expected_total_bytes()
        {
            info!(
                segment = len,
                units = progress.units_processed,
                total = progress.bytes_transferred,
                "Receiving"
            );
        }
    }
}
