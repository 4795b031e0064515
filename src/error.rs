//! # Error taxonomy
//!
//! One enum for the whole crate, split along the absorb/propagate boundary:
//! framing and FEC variants are logged and counted at the session edge,
//! queue and flow variants surface to the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Datagram shorter than a segment header.
    #[error("datagram too short for segment header ({got} < {need} bytes)")]
    TruncatedHeader { got: usize, need: usize },

    /// Header's `len` field promises more payload than the datagram holds.
    #[error("segment payload truncated: header says {expected}, {got} remain")]
    TruncatedPayload { expected: usize, got: usize },

    /// Command byte outside the known set.
    #[error("unknown segment command {0:#04x}")]
    InvalidCommand(u8),

    /// Segment addressed to a different conversation.
    #[error("conversation mismatch: expected {expected}, got {got}")]
    ConvMismatch { expected: u32, got: u32 },

    /// Payload would fragment beyond the negotiated limit. Nothing was
    /// enqueued; the payload must be split by the caller.
    #[error("{size} byte payload needs {fragments} fragments, limit is {limit}")]
    TooManyFragments {
        size: usize,
        fragments: usize,
        limit: usize,
    },

    /// Bounded write queue overflowed. Fatal for the session.
    #[error("write queue full ({capacity} pending), closing session")]
    WriteQueueFull { capacity: usize },

    /// Bounded read queue overflowed; the payload was dropped, the
    /// session stays up.
    #[error("read queue full, dropped {size} byte payload")]
    ReadQueueFull { size: usize },

    /// Operation on a session that is closing or released.
    #[error("session {conv} is closed")]
    SessionClosed { conv: u32 },

    /// A segment exhausted its retransmit budget; the peer is gone.
    #[error("link dead: segment {sn} retransmitted {xmit} times")]
    LinkDead { sn: u32, xmit: u32 },

    /// Reed-Solomon backend failure during parity build or reconstruction.
    #[error("fec codec: {0}")]
    Fec(#[from] reed_solomon_simd::Error),
}

impl TransportError {
    /// Whether the session must close when this error reaches it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::WriteQueueFull { .. } | TransportError::LinkDead { .. }
        )
    }
}
