//! End-of-transfer detection.
//!
//! There is no length header on the wire, so the receiver decides that a
//! transfer is over from its running totals:
//!
//! - **Threshold**: the byte count reached the total agreed out of band.
//!   Off with line framing, where counts include record terminators.
//! - **End of stream**: an empty read arrived after data. This is a
//!   compatibility fallback only; a transport that never reports a discrete
//!   empty read will never trigger it, and an unrelated early empty read
//!   would complete the transfer too soon. It can be switched off.
//! - **Sentinel**: with line framing, the peer sent the end record.

use crate::session::Progress;
use tracing::{debug, info};

/// Why a transfer was considered finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    Threshold,
    EndOfStream,
    Sentinel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    WaitingForData,
    Completing,
}

/// Decides after every segment whether the session has finished
#[derive(Debug)]
pub struct CompletionDetector {
    expected_total_bytes: u64,
    threshold: bool,
    eof_heuristic: bool,
    state: DetectorState,
}

impl CompletionDetector {
    pub fn new(expected_total_bytes: u64, eof_heuristic: bool) -> Self {
        Self {
            expected_total_bytes,
            threshold: true,
            eof_heuristic,
            state: DetectorState::WaitingForData,
        }
    }

    /// Never complete by byte count; only the end record or end of stream
    /// finish the transfer.
    pub fn without_threshold(mut self) -> Self {
        self.threshold = false;
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> DetectorState {
        self.state
    }

    /// Evaluate the rules for a segment of `segment_len` bytes, given the
    /// session counters after that segment was recorded.
    ///
    /// Threshold takes precedence when both rules hold.
    pub fn evaluate(&mut self, segment_len: usize, progress: &Progress) -> Option<CompletionReason> {
        if self.threshold && progress.bytes_transferred >= self.expected_total_bytes {
            info!(
                bytes = progress.bytes_transferred,
                expected = self.expected_total_bytes,
                units = progress.units_processed,
                "Completed by threshold"
            );
            self.state = DetectorState::Completing;
            return Some(CompletionReason::Threshold);
        }

        let end_of_stream = segment_len == 0
            && progress.bytes_transferred > 0
            && progress.started_at.is_some()
            && progress.units_processed > 1;

        if end_of_stream {
            if self.eof_heuristic {
                info!(
                    bytes = progress.bytes_transferred,
                    expected = self.expected_total_bytes,
                    units = progress.units_processed,
                    "Completed by end-of-stream heuristic, before threshold was reached"
                );
                self.state = DetectorState::Completing;
                return Some(CompletionReason::EndOfStream);
            }
            debug!(
                bytes = progress.bytes_transferred,
                "Empty read below threshold ignored, end-of-stream heuristic disabled"
            );
        }

        None
    }

    /// The explicit end record arrived.
    pub fn signal_sentinel(&mut self, progress: &Progress) -> CompletionReason {
        info!(
            bytes = progress.bytes_transferred,
            expected = self.expected_total_bytes,
            units = progress.units_processed,
            "Completed by end-of-transmission record"
        );
        self.state = DetectorState::Completing;
        CompletionReason::Sentinel
    }

    /// Return to `WaitingForData` after the collector has run.
    pub fn reset(&mut self) {
        self.state = DetectorState::WaitingForData;
    }
}
