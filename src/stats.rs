//! Throughput statistics for a completed transfer.

use crate::error::TransferError;
use crate::session::TransferSession;
use std::fmt::Display;
use std::time::{Duration, Instant};
use tracing::info;

const BYTES_PER_MEGABYTE: f64 = 1024.0 * 1024.0;
const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

/// Statistics emitted once per completed session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsReport {
    pub total_bytes: u64,
    pub unit_count: u32,
    pub duration_nanos: u64,
    pub mb_per_sec: f64,
    pub mbit_per_sec: f64,
    pub avg_bytes_per_unit: f64,
}

impl StatsReport {
    /// Derive the report from raw totals and the elapsed time.
    #[must_use]
    pub fn compute(total_bytes: u64, unit_count: u32, elapsed: Duration) -> Self {
        #![allow(clippy::cast_precision_loss)]

        let duration_nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        let duration_seconds = duration_nanos as f64 / NANOS_PER_SECOND;
        let megabytes = total_bytes as f64 / BYTES_PER_MEGABYTE;
        let mb_per_sec = if duration_seconds > 0.0 {
            megabytes / duration_seconds
        } else {
            0.0
        };
        let avg_bytes_per_unit = if unit_count > 0 {
            total_bytes as f64 / f64::from(unit_count)
        } else {
            0.0
        };

        Self {
            total_bytes,
            unit_count,
            duration_nanos,
            mb_per_sec,
            mbit_per_sec: mb_per_sec * 8.0,
            avg_bytes_per_unit,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.duration_nanos)
    }

    /// Log the report as a single structured event.
    pub fn emit(&self, side: &'static str) {
        info!(
            side,
            total_bytes = self.total_bytes,
            unit_count = self.unit_count,
            duration_ms = self.duration_nanos / 1_000_000,
            mb_per_sec = %format!("{:.2}", self.mb_per_sec),
            mbit_per_sec = %format!("{:.2}", self.mbit_per_sec),
            avg_bytes_per_unit = %format!("{:.2}", self.avg_bytes_per_unit),
            "Transfer complete"
        );
    }
}

impl Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} bytes in {} units over {:?}: {:.2} MB/s ({:.2} Mbps), {:.2} bytes/unit",
            self.total_bytes,
            self.unit_count,
            self.duration(),
            self.mb_per_sec,
            self.mbit_per_sec,
            self.avg_bytes_per_unit
        )
    }
}

/// Compute the report for `session` as of `completed_at`, then reset it.
///
/// The session is reset whether or not a report could be produced.
pub fn finalize(
    session: &TransferSession,
    completed_at: Instant,
) -> Result<StatsReport, TransferError> {
    let progress = session.snapshot();
    let result = match progress.started_at {
        Some(started_at) => {
            session.mark_completed();
            Ok(StatsReport::compute(
                progress.bytes_transferred,
                progress.units_processed,
                completed_at.saturating_duration_since(started_at),
            ))
        }
        None => Err(TransferError::StatsComputationSkipped),
    };
    session.reset();
    result
}
