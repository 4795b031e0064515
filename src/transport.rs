//! # ARQ engine
//!
//! Single-conversation sliding-window ARQ: fragmentation, ordered delivery,
//! RTO from SRTT/RTTVAR, fast retransmit, window probing and an AIMD
//! congestion window with optional bypass.
//!
//! The core is deliberately inert: no sockets, no clocks, no threads. Callers
//! feed datagrams through [`TransportCore::input`], pass `now` as monotonic
//! milliseconds (`u32`, wraparound handled via signed difference), and pace
//! themselves with the timestamp [`TransportCore::update`] returns. Outgoing
//! datagrams leave through the [`OutputSink`] seam.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::config::SessionConfig;
use crate::error::TransportError;
use crate::stats::TransportMetrics;
use crate::wire::{Command, SegmentHeader};

// ─── Protocol constants ──────────────────────────────────────────────────────

const RTO_NDL: u32 = 30;
const RTO_MIN: u32 = 100;
const RTO_DEF: u32 = 200;
const RTO_MAX: u32 = 60_000;
const SSTHRESH_INIT: u32 = 2;
const SSTHRESH_MIN: u32 = 2;
const PROBE_INIT: u32 = 7_000;
const PROBE_LIMIT: u32 = 120_000;
const DEAD_LINK: u32 = 20;
const FASTACK_LIMIT: u32 = 5;
const MAX_FRAGMENTS: usize = 128;
const WND_RMT_DEF: u16 = 128;

const ASK_SEND: u32 = 1;
const ASK_TELL: u32 = 2;

/// Signed distance between two wrapping sequence numbers or timestamps.
/// Positive when `later` is ahead of `earlier`.
#[inline]
pub(crate) fn seq_diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

// ─── Output seam ─────────────────────────────────────────────────────────────

/// Where packed datagrams go. When FEC is enabled the reserved prefix at the
/// front of each datagram is still zeroed; the sink owns filling it.
pub trait OutputSink: Send {
    fn send(&mut self, datagram: BytesMut);

    /// Push out anything the sink is holding back (an open FEC group, for
    /// instance). Called during the session's final flush.
    fn flush(&mut self) {}
}

/// Plainest sink: hand the frozen datagram to a closure.
pub struct DirectSink<F: FnMut(Bytes) + Send>(pub F);

impl<F: FnMut(Bytes) + Send> OutputSink for DirectSink<F> {
    fn send(&mut self, datagram: BytesMut) {
        (self.0)(datagram.freeze());
    }
}

// ─── Segment ─────────────────────────────────────────────────────────────────

/// In-flight or queued data segment. Control segments (acks, probes) are
/// synthesized at flush time and never stored.
#[derive(Debug, Clone)]
struct Segment {
    sn: u32,
    /// Fragments remaining after this one.
    frg: u8,
    /// Send timestamp, echoed back in acks for RTT sampling.
    ts: u32,
    rto: u32,
    resend_ts: u32,
    fast_ack: u32,
    xmit: u32,
    payload: Bytes,
}

impl Segment {
    fn data(payload: Bytes, frg: u8) -> Self {
        Segment {
            sn: 0,
            frg,
            ts: 0,
            rto: 0,
            resend_ts: 0,
            fast_ack: 0,
            xmit: 0,
            payload,
        }
    }
}

// ─── TransportCore ───────────────────────────────────────────────────────────

pub struct TransportCore {
    conv: u32,
    mtu: usize,
    mss: usize,
    dead_on: Option<(u32, u32)>,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    rx_srtt: u32,
    rx_rttval: u32,
    rx_rto: u32,
    rx_minrto: u32,

    snd_wnd: u16,
    rcv_wnd: u16,
    rmt_wnd: u16,
    cwnd: u32,
    incr: u32,
    ssthresh: u32,

    probe: u32,
    ts_probe: u32,
    probe_wait: u32,

    interval: u32,
    ts_flush: u32,
    updated: bool,

    nodelay: bool,
    fast_resend: u32,
    fast_limit: u32,
    nocwnd: bool,
    stream: bool,

    ack_mask_bytes: usize,
    /// Bytes kept free at the front of every datagram (FEC prefix).
    reserved: usize,

    snd_queue: VecDeque<Segment>,
    snd_buf: VecDeque<Segment>,
    rcv_buf: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,
    /// Pending acknowledgements as `(sn, ts)` pairs.
    acklist: Vec<(u32, u32)>,

    buffer: BytesMut,
    output: Box<dyn OutputSink>,
    metrics: Arc<TransportMetrics>,
}

impl TransportCore {
    pub fn new(conv: u32, output: Box<dyn OutputSink>, metrics: Arc<TransportMetrics>) -> Self {
        let mtu = 1400;
        TransportCore {
            conv,
            mtu,
            mss: mtu - SegmentHeader::encoded_len(0),
            dead_on: None,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            rx_srtt: 0,
            rx_rttval: 0,
            rx_rto: RTO_DEF,
            rx_minrto: RTO_MIN,
            snd_wnd: 32,
            rcv_wnd: 128,
            rmt_wnd: WND_RMT_DEF,
            cwnd: 0,
            incr: 0,
            ssthresh: SSTHRESH_INIT,
            probe: 0,
            ts_probe: 0,
            probe_wait: 0,
            interval: 100,
            ts_flush: 100,
            updated: false,
            nodelay: false,
            fast_resend: 0,
            fast_limit: FASTACK_LIMIT,
            nocwnd: false,
            stream: false,
            ack_mask_bytes: 0,
            reserved: 0,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            acklist: Vec::new(),
            buffer: BytesMut::new(),
            output,
            metrics,
        }
    }

    /// Apply the tuning surface. `reserved` (FEC prefix space) is set
    /// separately by the session when it wraps the sink.
    pub fn configure(&mut self, cfg: &SessionConfig) {
        self.mtu = cfg.mtu;
        self.snd_wnd = cfg.snd_wnd;
        self.rcv_wnd = cfg.rcv_wnd;
        self.nodelay = cfg.nodelay;
        self.rx_minrto = if cfg.nodelay { RTO_NDL } else { RTO_MIN };
        self.interval = cfg.interval.clamp(10, 5_000);
        self.fast_resend = cfg.fast_resend;
        self.nocwnd = cfg.nocwnd;
        self.stream = cfg.stream;
        self.ack_mask_bytes = cfg.ack_mask_bits as usize / 8;
        self.update_mss();
    }

    /// Reserve prefix space at the front of every datagram.
    pub fn set_reserved(&mut self, reserved: usize) {
        self.reserved = reserved;
        self.update_mss();
    }

    fn update_mss(&mut self) {
        self.mss = self.mtu - self.reserved - SegmentHeader::encoded_len(self.ack_mask_bytes);
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn mss(&self) -> usize {
        self.mss
    }

    /// Current smoothed RTT estimate, ms. Zero before the first sample.
    pub fn srtt(&self) -> u32 {
        self.rx_srtt
    }

    pub fn rto(&self) -> u32 {
        self.rx_rto
    }

    /// A segment exhausted its retransmit budget; the peer is unreachable.
    pub fn is_dead(&self) -> bool {
        self.dead_on.is_some()
    }

    /// The error describing why the link died, if it has.
    pub fn link_failure(&self) -> Option<TransportError> {
        self.dead_on
            .map(|(sn, xmit)| TransportError::LinkDead { sn, xmit })
    }

    /// Segments queued or in flight on the send side.
    pub fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    /// Send-side writability with hysteresis: writable while fewer than
    /// `2 * snd_wnd` segments wait; once saturated, writable again only
    /// below half of that.
    pub fn can_send(&self, currently_writable: bool) -> bool {
        let max = self.snd_wnd as usize * 2;
        let wait = self.wait_snd();
        if currently_writable {
            wait < max
        } else {
            wait < (max / 2).max(1)
        }
    }

    // ─── Send path ───────────────────────────────────────────────────────────

    /// Fragment `payload` onto the send queue. Message mode numbers the
    /// fragments descending so the last carries `frg = 0`; stream mode
    /// coalesces into the queue tail first and never marks boundaries.
    pub fn send(&mut self, mut payload: Bytes) -> Result<(), TransportError> {
        if self.stream {
            if let Some(tail) = self.snd_queue.back_mut() {
                if tail.payload.len() < self.mss && !payload.is_empty() {
                    let room = self.mss - tail.payload.len();
                    let take = room.min(payload.len());
                    let mut merged = BytesMut::with_capacity(tail.payload.len() + take);
                    merged.extend_from_slice(&tail.payload);
                    merged.extend_from_slice(&payload.split_to(take));
                    tail.payload = merged.freeze();
                    tail.frg = 0;
                }
            }
        }
        if payload.is_empty() {
            return Ok(());
        }

        let count = payload.len().div_ceil(self.mss);
        let limit = MAX_FRAGMENTS.min(self.rcv_wnd as usize);
        if count > limit {
            return Err(TransportError::TooManyFragments {
                size: payload.len(),
                fragments: count,
                limit,
            });
        }

        for i in 0..count {
            let take = self.mss.min(payload.len());
            let chunk = payload.split_to(take);
            let frg = if self.stream {
                0
            } else {
                (count - 1 - i) as u8
            };
            self.snd_queue.push_back(Segment::data(chunk, frg));
        }
        Ok(())
    }

    // ─── Receive path ────────────────────────────────────────────────────────

    /// Size of the next complete message, if one is ready.
    pub fn peek_size(&self) -> Option<usize> {
        let first = self.rcv_queue.front()?;
        if first.frg == 0 {
            return Some(first.payload.len());
        }
        if self.rcv_queue.len() < first.frg as usize + 1 {
            return None;
        }
        let mut total = 0;
        for seg in &self.rcv_queue {
            total += seg.payload.len();
            if seg.frg == 0 {
                break;
            }
        }
        Some(total)
    }

    fn recv_one(&mut self) -> Option<Bytes> {
        let size = self.peek_size()?;
        let was_full = self.rcv_queue.len() >= self.rcv_wnd as usize;

        let first_frg = self.rcv_queue.front().map(|s| s.frg)?;
        let message = if first_frg == 0 {
            // Unfragmented: hand the payload through zero-copy.
            self.rcv_queue.pop_front().map(|s| s.payload)?
        } else {
            let mut out = BytesMut::with_capacity(size);
            while let Some(seg) = self.rcv_queue.pop_front() {
                out.extend_from_slice(&seg.payload);
                if seg.frg == 0 {
                    break;
                }
            }
            out.freeze()
        };

        self.move_to_rcv_queue();

        // Window reopened after being full: tell the peer without waiting
        // for it to probe.
        if was_full && self.rcv_queue.len() < self.rcv_wnd as usize {
            self.probe |= ASK_TELL;
        }
        Some(message)
    }

    /// Drain every complete message into `out`; returns how many were added.
    pub fn recv(&mut self, out: &mut Vec<Bytes>) -> usize {
        let mut n = 0;
        while let Some(msg) = self.recv_one() {
            out.push(msg);
            n += 1;
        }
        n
    }

    /// Drain all complete messages into one contiguous buffer. Useful in
    /// stream mode where boundaries carry no meaning.
    pub fn merge_recv(&mut self) -> Option<Bytes> {
        let first = self.recv_one()?;
        let Some(second) = self.recv_one() else {
            return Some(first);
        };
        let mut merged = BytesMut::with_capacity(first.len() + second.len());
        merged.extend_from_slice(&first);
        merged.extend_from_slice(&second);
        while let Some(next) = self.recv_one() {
            merged.extend_from_slice(&next);
        }
        Some(merged.freeze())
    }

    fn move_to_rcv_queue(&mut self) {
        while let Some(seg) = self.rcv_buf.front() {
            if seg.sn == self.rcv_nxt && self.rcv_queue.len() < self.rcv_wnd as usize {
                let seg = self.rcv_buf.pop_front();
                if let Some(seg) = seg {
                    self.rcv_queue.push_back(seg);
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                }
            } else {
                break;
            }
        }
    }

    fn store_received(&mut self, sn: u32, frg: u8, payload: Bytes) {
        // Insert sorted from the back; duplicates dropped silently.
        let mut insert_at = 0;
        let mut duplicate = false;
        for (i, seg) in self.rcv_buf.iter().enumerate().rev() {
            if seg.sn == sn {
                duplicate = true;
                break;
            }
            if seq_diff(sn, seg.sn) > 0 {
                insert_at = i + 1;
                break;
            }
        }
        if duplicate {
            self.metrics.on_duplicate();
        } else {
            let mut seg = Segment::data(payload, frg);
            seg.sn = sn;
            self.rcv_buf.insert(insert_at, seg);
        }
        self.move_to_rcv_queue();
    }

    // ─── ACK bookkeeping ─────────────────────────────────────────────────────

    fn update_rtt(&mut self, rtt: u32) {
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt;
            self.rx_rttval = rtt / 2;
        } else {
            let delta = rtt.abs_diff(self.rx_srtt);
            self.rx_rttval = (3 * self.rx_rttval + delta) / 4;
            self.rx_srtt = ((7 * self.rx_srtt + rtt) / 8).max(1);
        }
        let rto = self.rx_srtt + self.interval.max(4 * self.rx_rttval);
        self.rx_rto = rto.clamp(self.rx_minrto, RTO_MAX);
    }

    fn shrink_snd_buf(&mut self) {
        self.snd_una = match self.snd_buf.front() {
            Some(seg) => seg.sn,
            None => self.snd_nxt,
        };
    }

    fn remove_acked(&mut self, sn: u32) {
        if seq_diff(sn, self.snd_una) < 0 || seq_diff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for i in 0..self.snd_buf.len() {
            match seq_diff(sn, self.snd_buf[i].sn) {
                0 => {
                    self.snd_buf.remove(i);
                    break;
                }
                d if d < 0 => break,
                _ => {}
            }
        }
    }

    fn advance_una(&mut self, una: u32) {
        while let Some(seg) = self.snd_buf.front() {
            if seq_diff(seg.sn, una) < 0 {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    fn count_fast_acks(&mut self, sn: u32, ts: u32) {
        if seq_diff(sn, self.snd_una) < 0 || seq_diff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for seg in self.snd_buf.iter_mut() {
            if seq_diff(sn, seg.sn) < 0 {
                break;
            }
            if seg.sn != sn && seq_diff(seg.ts, ts) <= 0 {
                seg.fast_ack += 1;
            }
        }
    }

    fn apply_ack_mask(&mut self, una: u32, mask: u64) {
        let bits = self.ack_mask_bytes * 8;
        for i in 0..bits {
            if mask >> i & 1 != 0 {
                self.remove_acked(una.wrapping_add(1 + i as u32));
            }
        }
    }

    /// Receipt bitmap over `rcv_buf`, relative to `rcv_nxt`.
    fn build_ack_mask(&self) -> u64 {
        if self.ack_mask_bytes == 0 {
            return 0;
        }
        let bits = (self.ack_mask_bytes * 8) as i32;
        let mut mask = 0u64;
        for seg in &self.rcv_buf {
            let off = seq_diff(seg.sn, self.rcv_nxt) - 1;
            if (0..bits).contains(&off) {
                mask |= 1 << off;
            }
        }
        mask
    }

    // ─── Input ───────────────────────────────────────────────────────────────

    /// Feed one datagram's worth of segments. `regular = false` marks
    /// FEC-recovered input: acks and data still count, but the remote
    /// window, probe state and congestion window stay untouched so a
    /// recovered copy never double-drives flow control.
    pub fn input(&mut self, mut data: Bytes, regular: bool, now: u32) -> Result<(), TransportError> {
        let header_len = SegmentHeader::encoded_len(self.ack_mask_bytes);
        if data.len() < header_len {
            return Err(TransportError::TruncatedHeader {
                got: data.len(),
                need: header_len,
            });
        }

        let prev_una = self.snd_una;
        let mut latest_ack: Option<(u32, u32)> = None;

        while data.len() >= header_len {
            let (hdr, payload) = SegmentHeader::decode(&mut data, self.ack_mask_bytes)?;
            if hdr.conv != self.conv {
                return Err(TransportError::ConvMismatch {
                    expected: self.conv,
                    got: hdr.conv,
                });
            }
            self.metrics.on_segment_in(payload.len());

            if regular {
                self.rmt_wnd = hdr.wnd;
            }
            self.advance_una(hdr.una);
            self.shrink_snd_buf();
            if hdr.ack_mask != 0 {
                self.apply_ack_mask(hdr.una, hdr.ack_mask);
                self.shrink_snd_buf();
            }

            match hdr.cmd {
                Command::Ack => {
                    let rtt = seq_diff(now, hdr.ts);
                    if rtt >= 0 {
                        self.update_rtt(rtt as u32);
                    }
                    self.remove_acked(hdr.sn);
                    self.shrink_snd_buf();
                    match latest_ack {
                        Some((sn, _)) if seq_diff(hdr.sn, sn) <= 0 => {}
                        _ => latest_ack = Some((hdr.sn, hdr.ts)),
                    }
                }
                Command::Push => {
                    let wnd_edge = self.rcv_nxt.wrapping_add(self.rcv_wnd as u32);
                    if seq_diff(hdr.sn, wnd_edge) < 0 {
                        // Ack even stale segments so a lost ack gets repaired.
                        self.acklist.push((hdr.sn, hdr.ts));
                        if seq_diff(hdr.sn, self.rcv_nxt) >= 0 {
                            self.store_received(hdr.sn, hdr.frg, payload);
                        } else {
                            self.metrics.on_duplicate();
                        }
                    } else {
                        trace!(sn = hdr.sn, "push beyond receive window, dropped");
                        self.metrics.on_duplicate();
                    }
                }
                Command::WindowProbe => {
                    if regular {
                        self.probe |= ASK_TELL;
                    }
                }
                Command::WindowTell => {
                    // Window already taken from the header above.
                }
            }
        }

        if regular {
            if let Some((sn, ts)) = latest_ack {
                self.count_fast_acks(sn, ts);
            }
            if seq_diff(self.snd_una, prev_una) > 0 && self.cwnd < self.rmt_wnd as u32 {
                self.grow_cwnd();
            }
        }
        Ok(())
    }

    /// Slow start below ssthresh, additive increase above it.
    fn grow_cwnd(&mut self) {
        let mss = self.mss as u32;
        if self.cwnd < self.ssthresh {
            self.cwnd += 1;
            self.incr += mss;
        } else {
            if self.incr < mss {
                self.incr = mss;
            }
            self.incr += (mss * mss) / self.incr + (mss / 16);
            if (self.cwnd + 1) * mss <= self.incr {
                self.cwnd = (self.incr + mss - 1) / mss.max(1);
            }
        }
        if self.cwnd > self.rmt_wnd as u32 {
            self.cwnd = self.rmt_wnd as u32;
            self.incr = self.rmt_wnd as u32 * mss;
        }
    }

    /// Receive-window headroom advertised to the peer, in segments.
    pub fn wnd_unused(&self) -> u16 {
        (self.rcv_wnd as usize).saturating_sub(self.rcv_queue.len()) as u16
    }

    // ─── Pacing ──────────────────────────────────────────────────────────────

    /// Drive the clock. Flushes when the tick is due and returns the next
    /// timestamp at which [`update`](Self::update) wants to run again.
    pub fn update(&mut self, now: u32) -> u32 {
        if !self.updated {
            self.updated = true;
            self.ts_flush = now;
        }
        let mut slap = seq_diff(now, self.ts_flush);
        if !(-10_000..10_000).contains(&slap) {
            self.ts_flush = now;
            slap = 0;
        }
        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if seq_diff(now, self.ts_flush) >= 0 {
                self.ts_flush = now.wrapping_add(self.interval);
            }
            self.flush(now);
        }
        self.check(now)
    }

    /// When the next call to [`update`](Self::update) is needed: the
    /// earlier of the interval tick and the earliest retransmit timer.
    pub fn check(&self, now: u32) -> u32 {
        if !self.updated {
            return now;
        }
        let mut ts_flush = self.ts_flush;
        if !(-10_000..10_000).contains(&seq_diff(now, ts_flush)) {
            ts_flush = now;
        }
        if seq_diff(now, ts_flush) >= 0 {
            return now;
        }
        let mut wait = seq_diff(ts_flush, now);
        for seg in &self.snd_buf {
            let diff = seq_diff(seg.resend_ts, now);
            if diff <= 0 {
                return now;
            }
            wait = wait.min(diff);
        }
        now.wrapping_add((wait as u32).min(self.interval))
    }

    /// Ask the sink to emit anything it is holding back, such as an open
    /// FEC group. Used by the session's final flush.
    pub fn flush_output(&mut self) {
        self.output.flush();
    }

    /// Whether anything is pending that a flush would put on the wire.
    pub fn flush_needed(&self) -> bool {
        !self.acklist.is_empty() || !self.snd_queue.is_empty() || !self.snd_buf.is_empty()
    }

    /// Emit pending acks, window probes and data; retransmit on timeout or
    /// duplicate-ack evidence; adjust the congestion window. Returns the
    /// next-update timestamp as a convenience.
    pub fn flush(&mut self, now: u32) -> u32 {
        if !self.updated {
            // Direct flush before the first tick starts the clock.
            self.updated = true;
            self.ts_flush = now.wrapping_add(self.interval);
        }

        let conv = self.conv;
        let rcv_nxt = self.rcv_nxt;
        let wnd_unused = self.wnd_unused();
        let ack_mask = self.build_ack_mask();
        let mask_bytes = self.ack_mask_bytes;
        let mtu = self.mtu;
        let reserved = self.reserved;

        let acks = std::mem::take(&mut self.acklist);

        // Disjoint field borrows: the packer owns buffer/output/metrics while
        // the loops below walk the segment queues.
        let buffer = &mut self.buffer;
        let output = &mut self.output;
        let metrics = Arc::clone(&self.metrics);
        let mut pack = |cmd: Command, frg: u8, ts: u32, sn: u32, payload: &[u8]| {
            let need = SegmentHeader::encoded_len(mask_bytes) + payload.len();
            if buffer.len() + need > mtu && buffer.len() > reserved {
                output.send(buffer.split());
            }
            if buffer.len() < reserved {
                buffer.resize(reserved, 0);
            }
            let hdr = SegmentHeader {
                conv,
                cmd,
                frg,
                wnd: wnd_unused,
                ts,
                sn,
                una: rcv_nxt,
                ack_mask,
            };
            hdr.encode(buffer, payload.len(), mask_bytes);
            buffer.extend_from_slice(payload);
            metrics.on_segment_out(need);
        };

        for (sn, ts) in acks {
            pack(Command::Ack, 0, ts, sn, &[]);
            self.metrics.on_ack_sent();
        }

        // Probe the remote window while it announces zero.
        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT;
                self.ts_probe = now.wrapping_add(self.probe_wait);
            } else if seq_diff(now, self.ts_probe) >= 0 {
                self.probe_wait = (self.probe_wait + self.probe_wait / 2).min(PROBE_LIMIT);
                self.ts_probe = now.wrapping_add(self.probe_wait);
                self.probe |= ASK_SEND;
            }
        } else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }
        if self.probe & ASK_SEND != 0 {
            pack(Command::WindowProbe, 0, now, 0, &[]);
        }
        if self.probe & ASK_TELL != 0 {
            pack(Command::WindowTell, 0, now, 0, &[]);
        }
        self.probe = 0;

        // Admit queued segments into the in-flight window.
        let mut window = self.snd_wnd.min(self.rmt_wnd) as u32;
        if !self.nocwnd {
            window = window.min(self.cwnd);
        }
        while seq_diff(self.snd_nxt, self.snd_una.wrapping_add(window)) < 0 {
            let Some(mut seg) = self.snd_queue.pop_front() else {
                break;
            };
            seg.sn = self.snd_nxt;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_buf.push_back(seg);
        }

        // Transmit and retransmit.
        let resent = if self.fast_resend > 0 {
            self.fast_resend
        } else {
            u32::MAX
        };
        let rtomin = if self.nodelay { 0 } else { self.rx_rto >> 3 };
        let rx_rto = self.rx_rto;
        let nodelay = self.nodelay;
        let fast_limit = self.fast_limit;
        let mut lost = false;
        let mut change = false;
        let mut dead = None;

        for seg in self.snd_buf.iter_mut() {
            let mut needsend = false;
            if seg.xmit == 0 {
                needsend = true;
                seg.xmit = 1;
                seg.rto = rx_rto;
                seg.resend_ts = now.wrapping_add(seg.rto + rtomin);
            } else if seq_diff(now, seg.resend_ts) >= 0 {
                needsend = true;
                seg.xmit += 1;
                let step = if nodelay { seg.rto / 2 } else { seg.rto.max(rx_rto) };
                seg.rto = (seg.rto + step).min(RTO_MAX);
                seg.resend_ts = now.wrapping_add(seg.rto);
                lost = true;
                metrics.on_retransmit(false);
            } else if seg.fast_ack >= resent && seg.xmit <= fast_limit {
                needsend = true;
                seg.xmit += 1;
                seg.fast_ack = 0;
                seg.resend_ts = now.wrapping_add(seg.rto);
                change = true;
                metrics.on_retransmit(true);
            }
            if needsend {
                seg.ts = now;
                pack(Command::Push, seg.frg, seg.ts, seg.sn, &seg.payload);
                if seg.xmit >= DEAD_LINK {
                    dead = Some((seg.sn, seg.xmit));
                }
            }
        }
        drop(pack);

        if self.buffer.len() > self.reserved {
            let datagram = self.buffer.split();
            self.output.send(datagram);
        } else {
            self.buffer.clear();
        }

        if let Some((sn, xmit)) = dead {
            if self.dead_on.is_none() {
                self.dead_on = Some((sn, xmit));
                tracing::warn!(conv = self.conv, sn, xmit, "retransmit budget exhausted, link dead");
            }
        }

        // Congestion response: duplicate-ack evidence halves the pipe
        // estimate, a timeout collapses to one segment.
        if change {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.ssthresh = (inflight / 2).max(SSTHRESH_MIN);
            self.cwnd = self.ssthresh + resent;
            self.incr = self.cwnd * self.mss as u32;
        }
        if lost {
            self.ssthresh = (self.cwnd / 2).max(SSTHRESH_MIN);
            self.cwnd = 1;
            self.incr = self.mss as u32;
        }
        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = self.mss as u32;
        }

        self.check(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::HEADER_LEN;
    use std::sync::Mutex;

    type Wire = Arc<Mutex<Vec<Bytes>>>;

    fn capture_sink() -> (Box<dyn OutputSink>, Wire) {
        let wire: Wire = Arc::new(Mutex::new(Vec::new()));
        let tx = Arc::clone(&wire);
        let sink = DirectSink(move |datagram: Bytes| {
            tx.lock().unwrap().push(datagram);
        });
        (Box::new(sink), wire)
    }

    fn core_with(cfg: &SessionConfig) -> (TransportCore, Wire) {
        let (sink, wire) = capture_sink();
        let mut core = TransportCore::new(cfg.conv, sink, Arc::new(TransportMetrics::default()));
        core.configure(cfg);
        (core, wire)
    }

    // Congestion bypass so a single flush puts everything on the wire;
    // the slow-start ramp is exercised separately.
    fn test_config() -> SessionConfig {
        SessionConfig {
            conv: 42,
            nocwnd: true,
            ..SessionConfig::default()
        }
    }

    fn drain(wire: &Wire) -> Vec<Bytes> {
        std::mem::take(&mut *wire.lock().unwrap())
    }

    fn pump(from: &Wire, to: &mut TransportCore, now: u32) {
        for datagram in drain(from) {
            to.input(datagram, true, now).unwrap();
        }
    }

    /// Tick both cores and exchange whatever they emit.
    fn converse(
        a: &mut TransportCore,
        wire_a: &Wire,
        b: &mut TransportCore,
        wire_b: &Wire,
        steps: u32,
    ) {
        let mut now = 0;
        for _ in 0..steps {
            a.update(now);
            b.update(now);
            pump(wire_a, b, now);
            pump(wire_b, a, now);
            now += 10;
        }
    }

    #[test]
    fn seq_diff_wraparound() {
        assert_eq!(seq_diff(5, 3), 2);
        assert_eq!(seq_diff(3, 5), -2);
        assert_eq!(seq_diff(2, u32::MAX - 1), 4);
        assert_eq!(seq_diff(u32::MAX - 1, 2), -4);
    }

    #[test]
    fn fragmentation_counts() {
        let (mut core, _wire) = core_with(&test_config());
        // mss = 1400 - 24 = 1376; 3000 bytes → 3 fragments
        assert_eq!(core.mss(), 1376);
        core.send(Bytes::from(vec![0u8; 3000])).unwrap();
        assert_eq!(core.wait_snd(), 3);
    }

    #[test]
    fn too_many_fragments_rejected() {
        let (mut core, _wire) = core_with(&test_config());
        let oversize = core.mss() * 129;
        let err = core.send(Bytes::from(vec![0u8; oversize])).unwrap_err();
        assert!(matches!(
            err,
            TransportError::TooManyFragments { fragments: 129, limit: 128, .. }
        ));
        assert_eq!(core.wait_snd(), 0); // nothing enqueued
    }

    #[test]
    fn fragment_limit_follows_rcv_wnd() {
        let cfg = SessionConfig {
            rcv_wnd: 8,
            ..test_config()
        };
        let (mut core, _wire) = core_with(&cfg);
        let err = core.send(Bytes::from(vec![0u8; core.mss() * 9])).unwrap_err();
        assert!(matches!(err, TransportError::TooManyFragments { limit: 8, .. }));
    }

    #[test]
    fn three_segment_message_roundtrip() {
        // Congestion control on: the window has to ramp from slow start
        // before all three fragments are in flight. Short interval so the
        // ramp completes within the conversation.
        let cfg = SessionConfig {
            conv: 42,
            interval: 10,
            ..SessionConfig::default()
        };
        let (mut a, wire_a) = core_with(&cfg);
        let (mut b, wire_b) = core_with(&cfg);

        let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        a.send(Bytes::from(payload.clone())).unwrap();
        assert_eq!(a.wait_snd(), 3);

        converse(&mut a, &wire_a, &mut b, &wire_b, 30);

        let mut out = Vec::new();
        assert_eq!(b.recv(&mut out), 1);
        assert_eq!(out[0].len(), 3000);
        assert_eq!(out[0].as_ref(), &payload[..]);
        assert_eq!(a.wait_snd(), 0, "acks should have cleared the sender");
    }

    /// Re-frame each segment of a packed datagram as its own datagram.
    fn explode(datagram: &Bytes, mask_bytes: usize) -> Vec<Bytes> {
        let mut data = datagram.clone();
        let mut frames = Vec::new();
        while !data.is_empty() {
            let (hdr, payload) = SegmentHeader::decode(&mut data, mask_bytes).unwrap();
            let mut buf = BytesMut::new();
            hdr.encode(&mut buf, payload.len(), mask_bytes);
            buf.extend_from_slice(&payload);
            frames.push(buf.freeze());
        }
        frames
    }

    #[test]
    fn out_of_order_delivery_is_reordered() {
        let cfg = test_config();
        let (mut a, wire_a) = core_with(&cfg);
        let (mut b, _wire_b) = core_with(&cfg);

        a.send(Bytes::from_static(b"first")).unwrap();
        a.send(Bytes::from_static(b"second")).unwrap();
        a.send(Bytes::from_static(b"third")).unwrap();
        a.update(0);

        let datagrams = drain(&wire_a);
        assert_eq!(datagrams.len(), 1);
        let mut frames = explode(&datagrams[0], 0);
        assert_eq!(frames.len(), 3);
        frames.reverse();
        for frame in frames {
            b.input(frame, true, 1).unwrap();
        }

        let mut out = Vec::new();
        assert_eq!(b.recv(&mut out), 3);
        assert_eq!(out[0].as_ref(), b"first");
        assert_eq!(out[1].as_ref(), b"second");
        assert_eq!(out[2].as_ref(), b"third");
    }

    #[test]
    fn duplicate_input_is_idempotent() {
        let cfg = test_config();
        let (mut a, wire_a) = core_with(&cfg);
        let (mut b, _wire_b) = core_with(&cfg);

        a.send(Bytes::from_static(b"once")).unwrap();
        a.update(0);
        let datagrams = drain(&wire_a);
        for d in &datagrams {
            b.input(d.clone(), true, 1).unwrap();
        }
        for d in &datagrams {
            b.input(d.clone(), true, 2).unwrap();
        }

        let mut out = Vec::new();
        assert_eq!(b.recv(&mut out), 1, "duplicate delivered the message twice");
        assert_eq!(out[0].as_ref(), b"once");
    }

    #[test]
    fn ack_clears_snd_buf() {
        let cfg = test_config();
        let (mut a, wire_a) = core_with(&cfg);
        let (mut b, wire_b) = core_with(&cfg);

        a.send(Bytes::from_static(b"payload")).unwrap();
        a.update(0);
        assert_eq!(a.wait_snd(), 1);

        pump(&wire_a, &mut b, 1);
        b.update(10); // emits the ack
        pump(&wire_b, &mut a, 20);

        assert_eq!(a.wait_snd(), 0);
        assert!(a.srtt() > 0);
    }

    #[test]
    fn conv_mismatch_rejected() {
        let cfg = test_config();
        let (mut a, wire_a) = core_with(&cfg);
        let other = SessionConfig {
            conv: 7,
            ..test_config()
        };
        let (mut b, _wire_b) = core_with(&other);

        a.send(Bytes::from_static(b"x")).unwrap();
        a.update(0);
        let datagram = drain(&wire_a).remove(0);
        assert!(matches!(
            b.input(datagram, true, 1),
            Err(TransportError::ConvMismatch { expected: 7, got: 42 })
        ));
    }

    #[test]
    fn stream_mode_coalesces() {
        let cfg = SessionConfig {
            stream: true,
            ..test_config()
        };
        let (mut core, _wire) = core_with(&cfg);
        core.send(Bytes::from_static(b"hello ")).unwrap();
        core.send(Bytes::from_static(b"world")).unwrap();
        assert_eq!(core.wait_snd(), 1, "small writes should share a segment");
    }

    #[test]
    fn merge_recv_concatenates() {
        let cfg = test_config();
        let (mut a, wire_a) = core_with(&cfg);
        let (mut b, _wire_b) = core_with(&cfg);

        a.send(Bytes::from_static(b"ab")).unwrap();
        a.send(Bytes::from_static(b"cd")).unwrap();
        a.update(0);
        pump(&wire_a, &mut b, 1);

        let merged = b.merge_recv().unwrap();
        assert_eq!(merged.as_ref(), b"abcd");
        assert!(b.merge_recv().is_none());
    }

    #[test]
    fn can_send_hysteresis() {
        let cfg = SessionConfig {
            snd_wnd: 4,
            ..test_config()
        };
        let (mut core, _wire) = core_with(&cfg);

        assert!(core.can_send(true));
        // Saturate: 2 * snd_wnd = 8 waiting segments.
        for _ in 0..8 {
            core.send(Bytes::from_static(b"x")).unwrap();
        }
        assert!(!core.can_send(true), "full queue must block");
        // Once blocked, 7 waiting (below max but above half) keeps blocking.
        let mut out = Vec::new();
        core.recv(&mut out); // no-op, nothing received
        assert!(!core.can_send(false));
        // Only below half (4) does it reopen.
        // Simulate drain by acking: replace with a fresh core at 3 waiting.
        let (mut fresh, _w) = core_with(&cfg);
        for _ in 0..3 {
            fresh.send(Bytes::from_static(b"x")).unwrap();
        }
        assert!(fresh.can_send(false));
        assert!(fresh.can_send(true));
    }

    #[test]
    fn retransmit_after_timeout() {
        let cfg = test_config();
        let (mut a, wire_a) = core_with(&cfg);

        a.send(Bytes::from_static(b"needs retry")).unwrap();
        a.update(0);
        let first = drain(&wire_a);
        assert_eq!(first.len(), 1);

        // No ack arrives; well past RTO the segment goes out again with a
        // fresh timestamp but identical payload length.
        a.update(70_000);
        let second = drain(&wire_a);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].len(), second[0].len());
    }

    #[test]
    fn dead_link_after_budget() {
        let cfg = test_config();
        let (mut core, wire) = core_with(&cfg);
        core.send(Bytes::from_static(b"doomed")).unwrap();

        let mut now = 0u32;
        for _ in 0..25 {
            core.update(now);
            drain(&wire);
            now += 70_000; // beyond any backoff step
        }
        assert!(core.is_dead());
        match core.link_failure() {
            Some(TransportError::LinkDead { sn: 0, xmit }) => assert!(xmit >= DEAD_LINK),
            other => panic!("expected LinkDead for sn 0, got {other:?}"),
        }
    }

    #[test]
    fn ack_mask_clears_out_of_order_segments() {
        let cfg = SessionConfig {
            ack_mask_bits: 32,
            ..test_config()
        };
        let (mut a, wire_a) = core_with(&cfg);
        let (mut b, wire_b) = core_with(&cfg);

        for i in 0..4 {
            a.send(Bytes::from(vec![i as u8; 8])).unwrap();
        }
        a.update(0);
        let datagrams = drain(&wire_a);
        assert_eq!(datagrams.len(), 1);

        // Drop the first segment: re-frame the datagram without it.
        let mut data = datagrams[0].clone();
        let (_hdr, _payload) = SegmentHeader::decode(&mut data, 4).unwrap();
        b.input(data, true, 1).unwrap();
        b.update(10);
        pump(&wire_b, &mut a, 20);

        // sn 1..=3 are acknowledged through the mask; only sn 0 remains.
        assert_eq!(a.wait_snd(), 1);
    }

    #[test]
    fn window_full_stops_admission() {
        let cfg = SessionConfig {
            snd_wnd: 2,
            nocwnd: true,
            ..test_config()
        };
        let (mut a, wire_a) = core_with(&cfg);
        for _ in 0..6 {
            a.send(Bytes::from_static(b"seg")).unwrap();
        }
        a.update(0);
        let datagrams = drain(&wire_a);
        let total: usize = datagrams.iter().map(|d| d.len()).sum();
        // Only two segments admitted: 2 * (24 + 3)
        assert_eq!(total, 2 * (HEADER_LEN + 3));
        assert_eq!(a.wait_snd(), 6);
    }
}
