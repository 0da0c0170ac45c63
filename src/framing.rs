//! Wire framing.
//!
//! Two framings are supported:
//!
//! ```text
//! raw:   <bytes><bytes><bytes>...                     (total agreed out of band)
//! line:  <record>\r\n<record>\r\n...END_OF_TRANSMISSION\r\n
//! ```
//!
//! In line framing every record counts as its payload plus the 2-byte
//! terminator. The end record is not counted.

use crate::config::Framing;
use bytes::{Buf, Bytes, BytesMut};
use tracing::warn;

/// Record that ends a line-framed transfer
pub const END_OF_TRANSMISSION: &[u8] = b"END_OF_TRANSMISSION";

const CRLF: &[u8] = b"\r\n";

impl Framing {
    /// Wire bytes for one unit of payload.
    pub fn encode_unit(self, payload: Bytes) -> Bytes {
        match self {
            Framing::Raw => payload,
            Framing::Line => {
                let mut record = BytesMut::with_capacity(payload.len() + CRLF.len());
                record.extend_from_slice(&payload);
                record.extend_from_slice(CRLF);
                record.freeze()
            }
        }
    }

    /// Bytes written after the last unit, if any.
    pub fn trailer(self) -> Option<Bytes> {
        match self {
            Framing::Raw => None,
            Framing::Line => {
                let mut record = BytesMut::with_capacity(END_OF_TRANSMISSION.len() + CRLF.len());
                record.extend_from_slice(END_OF_TRANSMISSION);
                record.extend_from_slice(CRLF);
                Some(record.freeze())
            }
        }
    }

    /// Payload filler; line records must not contain CR or LF.
    pub fn fill_byte(self) -> u8 {
        match self {
            Framing::Raw => 0,
            Framing::Line => b'A',
        }
    }
}

/// A complete line-framed record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    /// A data record of `len` wire bytes, terminator included
    Data { len: usize },
    /// The end record
    EndOfTransmission,
}

/// Reassembles CRLF-terminated records from arbitrary segments.
///
/// A record longer than `max_record_size` is dropped, up to and including
/// its terminator.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: BytesMut,
    /// Offset from which the next terminator search starts
    scanned: usize,
    max_record_size: usize,
    /// Dropping an oversized record until its terminator arrives
    skipping: bool,
}

impl LineDecoder {
    pub fn new(max_record_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            max_record_size,
            skipping: false,
        }
    }

    /// Feed one inbound segment and collect every record it completes.
    pub fn push(&mut self, segment: &[u8], records: &mut Vec<Record>) {
        self.buffer.extend_from_slice(segment);

        while let Some(pos) = find_crlf(&self.buffer[self.scanned..]) {
            let line_end = self.scanned + pos;
            let record = if self.skipping {
                None
            } else if &self.buffer[..line_end] == END_OF_TRANSMISSION {
                Some(Record::EndOfTransmission)
            } else {
                Some(Record::Data {
                    len: line_end + CRLF.len(),
                })
            };
            self.buffer.advance(line_end + CRLF.len());
            self.scanned = 0;
            self.skipping = false;
            records.extend(record);
        }

        if self.buffer.len() > self.max_record_size {
            if !self.skipping {
                warn!(
                    pending = self.buffer.len(),
                    limit = self.max_record_size,
                    "Record exceeds size limit, discarding until next terminator"
                );
            }
            // a trailing CR may still pair with an LF in the next segment
            let trailing_cr = self.buffer.last() == Some(&b'\r');
            self.buffer.clear();
            if trailing_cr {
                self.buffer.extend_from_slice(b"\r");
            }
            self.skipping = true;
        }

        // a CR at the very end may pair with an LF in the next segment
        self.scanned = self.buffer.len().saturating_sub(1);
    }

    /// Bytes held for an unterminated record
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any unterminated record, returning its length.
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        self.scanned = 0;
        self.skipping = false;
        dropped
    }
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == CRLF)
}
