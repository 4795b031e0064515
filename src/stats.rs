//! # Transport metrics
//!
//! Per-session counters behind an `Arc`, injected into the ARQ core and the
//! FEC codecs at construction. Nothing global: two sessions never share a
//! counter, and tests can assert on a single session's numbers.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counter block. All increments are `Relaxed`; readers only ever
/// want a statistical view.
#[derive(Debug, Default)]
pub struct TransportMetrics {
    segments_out: AtomicU64,
    segments_in: AtomicU64,
    bytes_out: AtomicU64,
    bytes_in: AtomicU64,
    retransmits: AtomicU64,
    fast_retransmits: AtomicU64,
    duplicate_segments: AtomicU64,
    acks_sent: AtomicU64,
    parity_shards_sent: AtomicU64,
    shards_recovered: AtomicU64,
    groups_unrecoverable: AtomicU64,
    read_drops: AtomicU64,
    framing_errors: AtomicU64,
}

impl TransportMetrics {
    pub(crate) fn on_segment_out(&self, bytes: usize) {
        self.segments_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_segment_in(&self, bytes: usize) {
        self.segments_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_retransmit(&self, fast: bool) {
        self.retransmits.fetch_add(1, Ordering::Relaxed);
        if fast {
            self.fast_retransmits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn on_duplicate(&self) {
        self.duplicate_segments.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_ack_sent(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_parity_sent(&self, n: usize) {
        self.parity_shards_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_shards_recovered(&self, n: usize) {
        self.shards_recovered.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_group_unrecoverable(&self) {
        self.groups_unrecoverable.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_read_drop(&self) {
        self.read_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent-enough point-in-time copy for logging or dashboards.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            segments_out: self.segments_out.load(Ordering::Relaxed),
            segments_in: self.segments_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            retransmits: self.retransmits.load(Ordering::Relaxed),
            fast_retransmits: self.fast_retransmits.load(Ordering::Relaxed),
            duplicate_segments: self.duplicate_segments.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            parity_shards_sent: self.parity_shards_sent.load(Ordering::Relaxed),
            shards_recovered: self.shards_recovered.load(Ordering::Relaxed),
            groups_unrecoverable: self.groups_unrecoverable.load(Ordering::Relaxed),
            read_drops: self.read_drops.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of [`TransportMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub segments_out: u64,
    pub segments_in: u64,
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub retransmits: u64,
    pub fast_retransmits: u64,
    pub duplicate_segments: u64,
    pub acks_sent: u64,
    pub parity_shards_sent: u64,
    pub shards_recovered: u64,
    pub groups_unrecoverable: u64,
    pub read_drops: u64,
    pub framing_errors: u64,
}

impl MetricsSnapshot {
    /// Fraction of transmitted segments that were retransmissions.
    pub fn retransmit_ratio(&self) -> f64 {
        if self.segments_out == 0 {
            0.0
        } else {
            self.retransmits as f64 / self.segments_out as f64
        }
    }

    /// Shards recovered per parity shard sent by the peer's encoder would
    /// need both sides; locally this reports recoveries per incoming segment.
    pub fn recovery_ratio(&self) -> f64 {
        if self.segments_in == 0 {
            0.0
        } else {
            self.shards_recovered as f64 / self.segments_in as f64
        }
    }
}
