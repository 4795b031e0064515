//! # Segment framing
//!
//! Fixed little-endian wire layout shared by both peers:
//!
//! ```text
//! [conv:4][cmd:1][frg:1][wnd:2][ts:4][sn:4][una:4][len:4][data:len]
//! ```
//!
//! With the ACK bitmap extension enabled, a mask of `ack_mask_bits / 8`
//! bytes sits between `una` and `len`; both peers must configure the same
//! width. When FEC is enabled every datagram additionally carries a shard
//! prefix (`[seq:4][flag:2]`, data shards add `[len:2]`) ahead of the
//! segment stream; see [`crate::fec`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::TransportError;

/// Segment header size without the optional ACK mask.
pub const HEADER_LEN: usize = 24;

// ─── Commands ────────────────────────────────────────────────────────────────

pub const CMD_PUSH: u8 = 81;
pub const CMD_ACK: u8 = 82;
pub const CMD_WND_PROBE: u8 = 83;
pub const CMD_WND_TELL: u8 = 84;

/// Segment command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Data segment, occupies a sequence number.
    Push = CMD_PUSH,
    /// Acknowledges `sn`; `ts` echoes the data segment's send time.
    Ack = CMD_ACK,
    /// Asks the peer to announce its receive window.
    WindowProbe = CMD_WND_PROBE,
    /// Announces the sender's receive window (in `wnd`).
    WindowTell = CMD_WND_TELL,
}

impl Command {
    pub fn from_byte(b: u8) -> Result<Self, TransportError> {
        match b {
            CMD_PUSH => Ok(Command::Push),
            CMD_ACK => Ok(Command::Ack),
            CMD_WND_PROBE => Ok(Command::WindowProbe),
            CMD_WND_TELL => Ok(Command::WindowTell),
            other => Err(TransportError::InvalidCommand(other)),
        }
    }
}

// ─── Segment header ──────────────────────────────────────────────────────────

/// Decoded segment header. `len` and the payload are handled by the codec
/// functions so the payload can be sliced zero-copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub conv: u32,
    pub cmd: Command,
    /// Fragments remaining after this one (0 = last / unfragmented).
    pub frg: u8,
    /// Sender's unused receive window, in segments.
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    /// All sequence numbers below this have been received in order.
    pub una: u32,
    /// Out-of-order receipt bitmap: bit `i` means `una + 1 + i` arrived.
    /// Only on the wire when the mask width is non-zero.
    pub ack_mask: u64,
}

impl SegmentHeader {
    /// Wire size of a header at the given mask width.
    pub fn encoded_len(mask_bytes: usize) -> usize {
        HEADER_LEN + mask_bytes
    }

    /// Append the header plus `payload_len` to `buf`. The payload itself is
    /// appended by the caller.
    pub fn encode(&self, buf: &mut BytesMut, payload_len: usize, mask_bytes: usize) {
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd as u8);
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        if mask_bytes > 0 {
            buf.put_uint_le(self.ack_mask, mask_bytes);
        }
        buf.put_u32_le(payload_len as u32);
    }

    /// Decode one segment from the front of `data`, consuming header and
    /// payload. The payload comes back as a zero-copy slice.
    pub fn decode(data: &mut Bytes, mask_bytes: usize) -> Result<(Self, Bytes), TransportError> {
        let need = Self::encoded_len(mask_bytes);
        if data.remaining() < need {
            return Err(TransportError::TruncatedHeader {
                got: data.remaining(),
                need,
            });
        }
        let conv = data.get_u32_le();
        let cmd = Command::from_byte(data.get_u8())?;
        let frg = data.get_u8();
        let wnd = data.get_u16_le();
        let ts = data.get_u32_le();
        let sn = data.get_u32_le();
        let una = data.get_u32_le();
        let ack_mask = if mask_bytes > 0 {
            data.get_uint_le(mask_bytes)
        } else {
            0
        };
        let len = data.get_u32_le() as usize;
        if data.remaining() < len {
            return Err(TransportError::TruncatedPayload {
                expected: len,
                got: data.remaining(),
            });
        }
        let payload = data.split_to(len);
        Ok((
            SegmentHeader {
                conv,
                cmd,
                frg,
                wnd,
                ts,
                sn,
                una,
                ack_mask,
            },
            payload,
        ))
    }
}

// ─── FEC shard prefix ────────────────────────────────────────────────────────

/// Shard carrying transport payload.
pub const FEC_TYPE_DATA: u16 = 0xf1;
/// Parity shard, payload is Reed-Solomon output.
pub const FEC_TYPE_PARITY: u16 = 0xf2;

/// `[seq:4][flag:2]`
pub const FEC_HEADER_LEN: usize = 6;
/// Data shards carry an extra `[len:2]` covering itself plus the payload.
pub const FEC_DATA_OVERHEAD: usize = FEC_HEADER_LEN + 2;

/// Prefix every datagram carries when FEC is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecHeader {
    /// Monotonic shard sequence; group id = `seq - seq % total_shards`.
    pub seq: u32,
    pub flag: u16,
}

impl FecHeader {
    pub fn decode(data: &mut Bytes) -> Result<Self, TransportError> {
        if data.remaining() < FEC_HEADER_LEN {
            return Err(TransportError::TruncatedHeader {
                got: data.remaining(),
                need: FEC_HEADER_LEN,
            });
        }
        let seq = data.get_u32_le();
        let flag = data.get_u16_le();
        Ok(FecHeader { seq, flag })
    }

    /// Write the prefix into the front of an already-reserved region.
    pub fn write_to(&self, dst: &mut [u8]) {
        dst[0..4].copy_from_slice(&self.seq.to_le_bytes());
        dst[4..6].copy_from_slice(&self.flag.to_le_bytes());
    }

    pub fn is_data(&self) -> bool {
        self.flag == FEC_TYPE_DATA
    }

    pub fn is_parity(&self) -> bool {
        self.flag == FEC_TYPE_PARITY
    }
}
