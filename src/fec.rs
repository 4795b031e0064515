//! # Reed-Solomon group FEC
//!
//! Whole-datagram forward error correction layered under the ARQ engine.
//! Every outgoing datagram becomes a data shard; each group of
//! `data_shards` consecutive datagrams yields `parity_shards` parity
//! datagrams. On the far side any `data_shards` members of a group are
//! enough to rebuild the missing data shards, sparing a retransmit
//! round trip.
//!
//! Shard framing (prefixes the reserved space the ARQ core leaves free):
//!
//! ```text
//! data:   [seq:4][0xf1:2][len:2][transport datagram ...]
//! parity: [seq:4][0xf2:2][parity bytes ...]
//! ```
//!
//! `len` covers itself plus the transport payload; parity is computed over
//! the `[len][payload]` region padded to the group's largest (even) size,
//! so trailing zeros never corrupt a recovered datagram.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use reed_solomon_simd::{ReedSolomonDecoder, ReedSolomonEncoder};
use tracing::{trace, warn};

use crate::config::FecConfig;
use crate::error::TransportError;
use crate::stats::TransportMetrics;
use crate::transport::{seq_diff, OutputSink};
use crate::wire::{FecHeader, FEC_DATA_OVERHEAD, FEC_HEADER_LEN, FEC_TYPE_DATA, FEC_TYPE_PARITY};

#[inline]
fn round_even(n: usize) -> usize {
    (n + 1) & !1
}

// ─── Encoder ─────────────────────────────────────────────────────────────────

pub struct FecEncoder {
    data_shards: usize,
    parity_shards: usize,
    /// Shard sequence wraps at a multiple of the group size so
    /// `seq % total` stays a valid in-group position across the wrap.
    paws: u32,
    next_seq: u32,
    /// `[len][payload]` regions of the open group, unpadded.
    cache: Vec<Vec<u8>>,
    max_size: usize,
    metrics: Arc<TransportMetrics>,
}

impl FecEncoder {
    pub fn new(cfg: &FecConfig, metrics: Arc<TransportMetrics>) -> Self {
        let total = cfg.total_shards() as u32;
        FecEncoder {
            data_shards: cfg.data_shards,
            parity_shards: cfg.parity_shards,
            paws: (u32::MAX / total) * total,
            next_seq: 0,
            cache: Vec::with_capacity(cfg.data_shards),
            max_size: 0,
            metrics,
        }
    }

    fn advance_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.next_seq >= self.paws {
            self.next_seq = 0;
        }
        seq
    }

    /// Stamp the reserved prefix of an outgoing datagram and cache its
    /// shard region. Returns the parity datagrams when this shard
    /// completes a group.
    pub fn encode(&mut self, datagram: &mut BytesMut) -> Result<Vec<BytesMut>, TransportError> {
        debug_assert!(datagram.len() >= FEC_DATA_OVERHEAD);
        let len_field = (datagram.len() - FEC_HEADER_LEN) as u16;
        let seq = self.advance_seq();
        FecHeader {
            seq,
            flag: FEC_TYPE_DATA,
        }
        .write_to(&mut datagram[..FEC_HEADER_LEN]);
        datagram[FEC_HEADER_LEN..FEC_DATA_OVERHEAD].copy_from_slice(&len_field.to_le_bytes());

        self.cache.push(datagram[FEC_HEADER_LEN..].to_vec());
        self.max_size = self.max_size.max(datagram.len() - FEC_HEADER_LEN);

        if self.cache.len() == self.data_shards {
            self.build_parity()
        } else {
            Ok(Vec::new())
        }
    }

    /// Close out a partially filled group: pad it with empty data shards
    /// (which must still travel so the peer can reconstruct) and emit the
    /// group's parity. No-op when the group is empty.
    pub fn flush(&mut self) -> Result<Vec<BytesMut>, TransportError> {
        if self.cache.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        while self.cache.len() < self.data_shards {
            let seq = self.advance_seq();
            let mut pkt = BytesMut::with_capacity(FEC_DATA_OVERHEAD);
            pkt.resize(FEC_DATA_OVERHEAD, 0);
            FecHeader {
                seq,
                flag: FEC_TYPE_DATA,
            }
            .write_to(&mut pkt[..FEC_HEADER_LEN]);
            pkt[FEC_HEADER_LEN..].copy_from_slice(&2u16.to_le_bytes());
            self.cache.push(pkt[FEC_HEADER_LEN..].to_vec());
            self.max_size = self.max_size.max(2);
            out.push(pkt);
        }
        out.extend(self.build_parity()?);
        Ok(out)
    }

    fn build_parity(&mut self) -> Result<Vec<BytesMut>, TransportError> {
        let shard_bytes = round_even(self.max_size);
        let mut rs = ReedSolomonEncoder::new(self.data_shards, self.parity_shards, shard_bytes)?;
        for shard in &mut self.cache {
            shard.resize(shard_bytes, 0);
            rs.add_original_shard(&shard[..])?;
        }
        let result = rs.encode()?;

        let mut parity = Vec::with_capacity(self.parity_shards);
        for recovery in result.recovery_iter() {
            let seq = self.advance_seq();
            let mut pkt = BytesMut::with_capacity(FEC_HEADER_LEN + shard_bytes);
            pkt.resize(FEC_HEADER_LEN, 0);
            FecHeader {
                seq,
                flag: FEC_TYPE_PARITY,
            }
            .write_to(&mut pkt[..FEC_HEADER_LEN]);
            pkt.extend_from_slice(recovery);
            parity.push(pkt);
        }

        self.metrics.on_parity_sent(parity.len());
        self.cache.clear();
        self.max_size = 0;
        Ok(parity)
    }
}

// ─── Decoder ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct FecElement {
    seq: u32,
    flag: u16,
    /// `[len][payload]` for data shards, raw parity bytes otherwise.
    body: Bytes,
}

pub struct FecDecoder {
    data_shards: usize,
    parity_shards: usize,
    total: usize,
    /// Received shards ordered by sequence.
    rx: VecDeque<FecElement>,
    rx_limit: usize,
    /// Shards further behind the newest than this are stale.
    stale_horizon: i32,
    newest: u32,
    metrics: Arc<TransportMetrics>,
}

impl FecDecoder {
    pub fn new(cfg: &FecConfig, metrics: Arc<TransportMetrics>) -> Self {
        let total = cfg.total_shards();
        FecDecoder {
            data_shards: cfg.data_shards,
            parity_shards: cfg.parity_shards,
            total,
            rx: VecDeque::new(),
            rx_limit: 3 * total,
            stale_horizon: (3 * total * total) as i32,
            newest: 0,
            metrics,
        }
    }

    #[cfg(test)]
    pub(crate) fn cached(&self) -> usize {
        self.rx.len()
    }

    fn group_base(&self, seq: u32) -> u32 {
        seq - seq % self.total as u32
    }

    /// Ingest one shard. Returns the transport datagrams this shard allowed
    /// the decoder to reconstruct (empty for the common no-loss case).
    pub fn decode(&mut self, hdr: FecHeader, body: Bytes) -> Vec<Bytes> {
        if seq_diff(hdr.seq, self.newest) > 0 {
            self.newest = hdr.seq;
        }

        // Insert sorted from the back; duplicates are harmless replays.
        let mut insert_at = 0;
        for (i, e) in self.rx.iter().enumerate().rev() {
            if e.seq == hdr.seq {
                trace!(seq = hdr.seq, "duplicate shard dropped");
                return Vec::new();
            }
            if seq_diff(hdr.seq, e.seq) > 0 {
                insert_at = i + 1;
                break;
            }
        }
        self.rx.insert(
            insert_at,
            FecElement {
                seq: hdr.seq,
                flag: hdr.flag,
                body,
            },
        );

        let recovered = self.try_resolve(self.group_base(hdr.seq));
        self.evict();
        recovered
    }

    fn evict(&mut self) {
        loop {
            let Some(front) = self.rx.front() else { break };
            let stale = seq_diff(self.newest, front.seq) > self.stale_horizon;
            if !stale && self.rx.len() <= self.rx_limit {
                break;
            }
            let e = self.rx.pop_front();
            if let Some(e) = e {
                // A lingering data shard whose group is now gone means the
                // group never reached the reconstruction threshold. Parity
                // remnants are just late arrivals for an already-solved
                // group and do not count.
                let base = self.group_base(e.seq);
                let last_data_of_group = e.flag == FEC_TYPE_DATA
                    && !self.rx.iter().any(|o| {
                        self.group_base(o.seq) == base && o.flag == FEC_TYPE_DATA
                    });
                if last_data_of_group {
                    self.metrics.on_group_unrecoverable();
                    warn!(group = base, "fec group evicted without recovery");
                }
            }
        }
    }

    fn group_members(&self, base: u32) -> Vec<usize> {
        self.rx
            .iter()
            .enumerate()
            .filter(|(_, e)| self.group_base(e.seq) == base)
            .map(|(i, _)| i)
            .collect()
    }

    fn remove_members(&mut self, mut members: Vec<usize>) {
        members.sort_unstable();
        for i in members.into_iter().rev() {
            self.rx.remove(i);
        }
    }

    fn try_resolve(&mut self, base: u32) -> Vec<Bytes> {
        let members = self.group_members(base);
        let data_present = members
            .iter()
            .filter(|&&i| self.rx[i].flag == FEC_TYPE_DATA)
            .count();

        if data_present == self.data_shards {
            // Nothing lost; the group is done.
            self.remove_members(members);
            return Vec::new();
        }
        if members.len() < self.data_shards {
            return Vec::new();
        }

        match self.reconstruct(&members) {
            Ok(recovered) => {
                self.metrics.on_shards_recovered(recovered.len());
                self.remove_members(members);
                recovered
            }
            Err(err) => {
                warn!(group = base, %err, "fec reconstruction failed, group dropped");
                self.metrics.on_group_unrecoverable();
                self.remove_members(members);
                Vec::new()
            }
        }
    }

    fn reconstruct(&self, members: &[usize]) -> Result<Vec<Bytes>, TransportError> {
        let shard_bytes = round_even(
            members
                .iter()
                .map(|&i| self.rx[i].body.len())
                .max()
                .unwrap_or(2),
        );
        let mut rs = ReedSolomonDecoder::new(self.data_shards, self.parity_shards, shard_bytes)?;
        let mut padded = Vec::new();
        for &i in members {
            let e = &self.rx[i];
            let pos = (e.seq % self.total as u32) as usize;
            let shard: &[u8] = if e.body.len() == shard_bytes {
                &e.body
            } else {
                padded.clear();
                padded.extend_from_slice(&e.body);
                padded.resize(shard_bytes, 0);
                &padded
            };
            if e.flag == FEC_TYPE_DATA {
                rs.add_original_shard(pos, shard)?;
            } else {
                rs.add_recovery_shard(pos - self.data_shards, shard)?;
            }
        }

        let result = rs.decode()?;
        let mut recovered = Vec::new();
        for (_, shard) in result.restored_original_iter() {
            if shard.len() < 2 {
                continue;
            }
            let len = u16::from_le_bytes([shard[0], shard[1]]) as usize;
            if len < 2 || len > shard.len() {
                warn!(len, "recovered shard with invalid length prefix, skipped");
                continue;
            }
            if len > 2 {
                recovered.push(Bytes::copy_from_slice(&shard[2..len]));
            }
            // len == 2: padding shard from a partial-group flush.
        }
        Ok(recovered)
    }
}

// ─── Wrapping sink ───────────────────────────────────────────────────────────

/// Composes FEC around an inner sink: stamps each datagram as a data shard
/// and follows a completed group with its parity datagrams.
pub struct FecWrappingSink {
    inner: Box<dyn OutputSink>,
    encoder: FecEncoder,
}

impl FecWrappingSink {
    pub fn new(inner: Box<dyn OutputSink>, encoder: FecEncoder) -> Self {
        FecWrappingSink { inner, encoder }
    }
}

impl OutputSink for FecWrappingSink {
    fn send(&mut self, mut datagram: BytesMut) {
        match self.encoder.encode(&mut datagram) {
            Ok(parity) => {
                self.inner.send(datagram);
                for pkt in parity {
                    self.inner.send(pkt);
                }
            }
            Err(err) => {
                // Parity failed; the data shard is still worth delivering.
                warn!(%err, "fec encode failed, sending unprotected");
                self.inner.send(datagram);
            }
        }
    }

    fn flush(&mut self) {
        match self.encoder.flush() {
            Ok(packets) => {
                for pkt in packets {
                    self.inner.send(pkt);
                }
            }
            Err(err) => warn!(%err, "fec flush failed, partial group unprotected"),
        }
        self.inner.flush();
    }
}
