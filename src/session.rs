//! Per-transfer session state.
//!
//! A `TransferSession` tracks one logical transfer: how many bytes and units
//! have moved and when the first data-bearing unit was seen. Every connection
//! (and every sender run) owns its own session; nothing here is global.
//!
//! Counters are atomics because the task serving a connection may hop
//! between runtime worker threads between segments. The clock and lifecycle
//! state share a mutex since they change together.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No data seen since creation or the last reset
    Idle,
    /// Clock started, counters accumulating
    InProgress,
    /// Completion fired; about to be reset
    Completed,
}

/// Point-in-time view of a session's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub bytes_transferred: u64,
    pub units_processed: u32,
    pub started_at: Option<Instant>,
}

#[derive(Debug)]
struct Clock {
    started_at: Option<Instant>,
    state: SessionState,
}

/// Counters and clock for one logical transfer
#[derive(Debug)]
pub struct TransferSession {
    expected_total_bytes: u64,
    bytes_transferred: AtomicU64,
    units_processed: AtomicU32,
    clock: Mutex<Clock>,
}

impl TransferSession {
    /// Create an idle session expecting `expected_total_bytes`
    pub fn new(expected_total_bytes: u64) -> Self {
        Self {
            expected_total_bytes,
            bytes_transferred: AtomicU64::new(0),
            units_processed: AtomicU32::new(0),
            clock: Mutex::new(Clock {
                started_at: None,
                state: SessionState::Idle,
            }),
        }
    }

    fn clock(&self) -> MutexGuard<'_, Clock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn expected_total_bytes(&self) -> u64 {
        self.expected_total_bytes
    }

    pub fn state(&self) -> SessionState {
        self.clock().state
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.clock().started_at
    }

    /// Start the clock if it is not running yet.
    ///
    /// Returns `true` only for the call that actually started it.
    pub fn start(&self, now: Instant) -> bool {
        let mut clock = self.clock();
        if clock.started_at.is_some() {
            return false;
        }
        clock.started_at = Some(now);
        clock.state = SessionState::InProgress;
        true
    }

    /// Add one unit of `len` bytes and return the updated counters.
    pub fn record(&self, len: usize) -> Progress {
        let bytes_transferred =
            self.bytes_transferred.fetch_add(len as u64, Ordering::AcqRel) + len as u64;
        let units_processed = self.units_processed.fetch_add(1, Ordering::AcqRel) + 1;
        Progress {
            bytes_transferred,
            units_processed,
            started_at: self.started_at(),
        }
    }

    /// Current counters without modifying them
    pub fn snapshot(&self) -> Progress {
        Progress {
            bytes_transferred: self.bytes_transferred.load(Ordering::Acquire),
            units_processed: self.units_processed.load(Ordering::Acquire),
            started_at: self.started_at(),
        }
    }

    /// True until the first data-bearing unit has been recorded
    pub fn is_pristine(&self) -> bool {
        self.bytes_transferred.load(Ordering::Acquire) == 0 && self.started_at().is_none()
    }

    pub fn mark_completed(&self) {
        self.clock().state = SessionState::Completed;
    }

    /// Zero the counters and return to `Idle` so the session can be reused.
    pub fn reset(&self) {
        let mut clock = self.clock();
        self.bytes_transferred.store(0, Ordering::Release);
        self.units_processed.store(0, Ordering::Release);
        clock.started_at = None;
        clock.state = SessionState::Idle;
    }
}
