//! Transfer errors shared by the sender and receiver.

use std::time::Duration;

/// Errors that end a transfer session
#[derive(Debug)]
pub enum TransferError {
    /// The connector could not reach the peer
    ConnectFailure { addr: String, source: std::io::Error },
    /// The connect attempt did not finish in time
    ConnectTimeout { addr: String, timeout: Duration },
    /// A unit was not acknowledged before its timeout
    WriteTimeout { offset: usize, timeout: Duration },
    /// The transport rejected a unit
    WriteFailure { offset: usize, source: std::io::Error },
    /// The peer went away before the transfer completed
    UnexpectedDisconnect { bytes_received: u64 },
    /// Finalize was reached but the session clock never started
    StatsComputationSkipped,
}

impl TransferError {
    /// True for errors raised on the write path, which abort the session.
    pub fn is_write_error(&self) -> bool {
        matches!(
            self,
            TransferError::WriteTimeout { .. } | TransferError::WriteFailure { .. }
        )
    }
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::ConnectFailure { addr, source } => {
                write!(f, "Failed to connect to {addr}: {source}")
            }
            TransferError::ConnectTimeout { addr, timeout } => {
                write!(f, "Timed out after {timeout:?} connecting to {addr}")
            }
            TransferError::WriteTimeout { offset, timeout } => {
                write!(
                    f,
                    "Write of unit at offset {offset} not acknowledged within {timeout:?}"
                )
            }
            TransferError::WriteFailure { offset, source } => {
                write!(f, "Write of unit at offset {offset} failed: {source}")
            }
            TransferError::UnexpectedDisconnect { bytes_received } => {
                write!(
                    f,
                    "Peer disconnected after {bytes_received} bytes, before the transfer completed"
                )
            }
            TransferError::StatsComputationSkipped => {
                write!(f, "Statistics skipped: session clock was never started")
            }
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransferError::ConnectFailure { source, .. }
            | TransferError::WriteFailure { source, .. } => Some(source),
            _ => None,
        }
    }
}
