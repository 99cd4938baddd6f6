//! Server-side state for one in-progress upload.
//!
//! A [`Session`] is created by the handshake and owns everything needed to
//! reassemble the file: the declared size, how many segments have been taken,
//! the bytes accumulated so far, and the sequence bit of the last accepted
//! message.  It does **not** touch the socket or the filesystem; the
//! [`crate::engine::Engine`] drives it and decides what to reply.
//!
//! # Alternating-bit contract
//! - The sender never has more than one message in flight.
//! - A message whose bit equals `last_accepted_bit` is a retransmission of
//!   the message already accepted and must not be appended again.
//! - Any other bit is a new segment.

use std::net::SocketAddr;

use crate::packet::Bit;

/// What [`Session::accept`] did with a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// Same bit as the last accepted message; payload discarded.
    Duplicate,
    /// Appended; more segments are still expected.
    Accepted,
    /// Appended and the declared number of segments has now been reached.
    Completed,
}

/// Per-sender upload state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    identity: SocketAddr,
    filename: String,
    file_size: u64,
    segment_size: usize,
    total_segments: u64,
    accepted_segments: u64,
    buffer: Vec<u8>,
    last_accepted_bit: Bit,
}

impl Session {
    /// Create a session from a handshake carrying `bit`.
    ///
    /// `total_segments` is fixed here as `ceil(file_size / segment_size)`.
    /// A `segment_size` of zero is treated as one byte per segment.
    pub fn new(
        identity: SocketAddr,
        filename: impl Into<String>,
        file_size: u64,
        segment_size: usize,
        bit: Bit,
    ) -> Self {
        let segment_size = segment_size.max(1);
        Self {
            identity,
            filename: filename.into(),
            file_size,
            segment_size,
            total_segments: file_size.div_ceil(segment_size as u64),
            accepted_segments: 0,
            buffer: Vec::new(),
            last_accepted_bit: bit,
        }
    }

    pub fn identity(&self) -> SocketAddr {
        self.identity
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn total_segments(&self) -> u64 {
        self.total_segments
    }

    pub fn accepted_segments(&self) -> u64 {
        self.accepted_segments
    }

    pub fn last_accepted_bit(&self) -> Bit {
        self.last_accepted_bit
    }

    /// Bytes accepted so far, in acceptance order.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn is_complete(&self) -> bool {
        self.accepted_segments == self.total_segments
    }

    /// `true` if a message with `bit` repeats the last accepted one.
    pub fn is_duplicate(&self, bit: Bit) -> bool {
        bit == self.last_accepted_bit
    }

    /// Process one Data segment.
    ///
    /// A session that already holds every segment treats further data as a
    /// retransmission, so `accepted_segments` can never pass `total_segments`.
    pub fn accept(&mut self, bit: Bit, payload: &[u8]) -> SegmentOutcome {
        if self.is_duplicate(bit) || self.is_complete() {
            return SegmentOutcome::Duplicate;
        }

        self.buffer.extend_from_slice(payload);
        self.accepted_segments += 1;
        self.last_accepted_bit = bit;

        if self.is_complete() {
            SegmentOutcome::Completed
        } else {
            SegmentOutcome::Accepted
        }
    }

    /// Consume the session, yielding the reassembled bytes.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}
