//! # Session configuration
//!
//! One struct covers the whole tuning surface; `Default` gives the
//! conservative profile (100 ms interval, congestion control on). The usual
//! low-latency profile is `nodelay = true, interval = 10, fast_resend = 2,
//! nocwnd = true`.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::wire::{FEC_DATA_OVERHEAD, HEADER_LEN};

/// Reed-Solomon shard counts for one FEC group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FecConfig {
    pub data_shards: usize,
    pub parity_shards: usize,
    /// Pad and emit parity for a partially filled group during the final
    /// close flush. Off by default: tail shards ride unprotected until the
    /// group fills.
    #[serde(default)]
    pub flush_partial_group: bool,
}

impl FecConfig {
    pub fn new(data_shards: usize, parity_shards: usize) -> Self {
        FecConfig {
            data_shards,
            parity_shards,
            flush_partial_group: false,
        }
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Conversation id; must match on both peers.
    pub conv: u32,
    /// Datagram budget including all headers.
    pub mtu: usize,
    /// Send window, segments.
    pub snd_wnd: u16,
    /// Receive window, segments. Also bounds the fragment count.
    pub rcv_wnd: u16,
    /// Aggressive RTO profile (min 30 ms, 1.5x backoff).
    pub nodelay: bool,
    /// Internal clock tick, ms. Clamped to 10..=5000.
    pub interval: u32,
    /// Retransmit after this many duplicate-ack skips (0 = off).
    pub fast_resend: u32,
    /// Disable the congestion window, flow control only.
    pub nocwnd: bool,
    /// Stream mode: coalesce writes, no message boundaries.
    pub stream: bool,
    /// Flush immediately when an ACK is pending instead of waiting for the
    /// next tick.
    pub ack_nodelay: bool,
    /// ACK bitmap width in bits: 0 (off), 8, 16, 32 or 64. Must match the
    /// peer's setting.
    pub ack_mask_bits: u8,
    /// Close the session after this long without hearing from the peer
    /// (0 disables).
    pub timeout_ms: u32,
    /// Flush on every write/input event rather than waiting for the tick.
    pub fast_flush: bool,
    /// Bound for the write queue; `None` is unbounded. Overflow of a
    /// bounded queue closes the session.
    pub write_queue_cap: Option<usize>,
    /// Bound for the read queue. Overflow drops the payload, session
    /// stays up.
    pub read_queue_cap: usize,
    pub fec: Option<FecConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            conv: 0,
            mtu: 1400,
            snd_wnd: 32,
            rcv_wnd: 128,
            nodelay: false,
            interval: 100,
            fast_resend: 0,
            nocwnd: false,
            stream: false,
            ack_nodelay: false,
            ack_mask_bits: 0,
            timeout_ms: 30_000,
            fast_flush: true,
            write_queue_cap: None,
            read_queue_cap: 4096,
            fec: None,
        }
    }
}

impl SessionConfig {
    /// Default config with a random conversation id.
    pub fn with_random_conv() -> Self {
        SessionConfig {
            conv: rand::random(),
            ..SessionConfig::default()
        }
    }

    /// Low-latency profile used by most interactive deployments.
    pub fn turbo(conv: u32) -> Self {
        SessionConfig {
            conv,
            nodelay: true,
            interval: 10,
            fast_resend: 2,
            nocwnd: true,
            ..SessionConfig::default()
        }
    }

    /// Bytes of each datagram not available to segment data.
    pub fn datagram_overhead(&self) -> usize {
        let fec = if self.fec.is_some() {
            FEC_DATA_OVERHEAD
        } else {
            0
        };
        fec + HEADER_LEN + self.ack_mask_bits as usize / 8
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.ack_mask_bits, 0 | 8 | 16 | 32 | 64) {
            bail!("ack_mask_bits must be 0, 8, 16, 32 or 64, got {}", self.ack_mask_bits);
        }
        if self.mtu <= self.datagram_overhead() {
            bail!(
                "mtu {} leaves no room for data ({} bytes of overhead)",
                self.mtu,
                self.datagram_overhead()
            );
        }
        if self.snd_wnd == 0 || self.rcv_wnd == 0 {
            bail!("windows must be at least one segment");
        }
        if self.read_queue_cap == 0 {
            bail!("read_queue_cap must be non-zero");
        }
        if let Some(cap) = self.write_queue_cap {
            if cap == 0 {
                bail!("write_queue_cap of 0 can never accept a write");
            }
        }
        if let Some(fec) = &self.fec {
            if fec.data_shards == 0 || fec.parity_shards == 0 {
                bail!(
                    "fec shards must be at least 1+1, got {}+{}",
                    fec.data_shards,
                    fec.parity_shards
                );
            }
            if fec.total_shards() > 256 {
                bail!("fec group of {} shards is too large", fec.total_shards());
            }
        }
        Ok(())
    }
}
