//! Datagram framing.
//!
//! ```ascii
//! 0:      flags (u8): ZEROCODED 0x80, RELIABLE 0x40, RESENT 0x20, ACK 0x10
//! 1..5:   sequence number (u32 BE)
//! 5:      extra header length N (u8)
//! 6..6+N: extra header, opaque to the transport
//! 6+N..:  payload (message id + body), zero-coded if flagged
//! tail:   if ACK: k acknowledged sequence numbers (u32 BE each) followed by k (u8)
//! ```
//!
//! Zero-coding replaces every run of zero bytes in the payload by `0x00, count`. Appended acks
//! are never zero-coded.

use bitflags::bitflags;
use bytes::{BufMut, BytesMut};

use super::message::MessageId;

/// Largest datagram this server constructs.
pub const MTU: usize = 1400;

/// Receive buffer size; peers are allowed to send more than [`MTU`].
pub const MAX_RECV_SIZE: usize = 4096;

pub const HEADER_LEN: usize = 6;

/// Header plus at least one byte of message id.
pub const MIN_PACKET_LEN: usize = HEADER_LEN + 1;

/// Payloads that fit go into a small allocation instead of a full MTU buffer.
pub const SMALL_BUFFER_SIZE: usize = 200;

/// Upper bound for a zero-decoded payload.
const MAX_DECODED_LEN: usize = u16::MAX as usize;

/// Acknowledgements that fit in one datagram tail (single-byte count).
pub const MAX_APPENDED_ACKS: usize = u8::MAX as usize;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u8 {
        const ZEROCODED = 0x80;
        const RELIABLE = 0x40;
        const RESENT = 0x20;
        const ACK = 0x10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MalformedPacket {
    #[error("datagram of {0} bytes is shorter than the minimum header")]
    TooShort(usize),
    #[error("extra header of {extra} bytes overruns datagram of {len} bytes")]
    HeaderOverrun { extra: usize, len: usize },
    #[error("{acks} appended acks overrun datagram of {len} bytes")]
    AckTrailerOverrun { acks: usize, len: usize },
    #[error("payload does not start with a complete message id")]
    MissingMessageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    pub sequence: u32,
    pub extra_len: usize,
}

impl PacketHeader {
    pub fn is_reliable(&self) -> bool {
        self.flags.contains(PacketFlags::RELIABLE)
    }

    pub fn is_resent(&self) -> bool {
        self.flags.contains(PacketFlags::RESENT)
    }
}

/// A decoded datagram. `payload` starts with the message id and is already zero-decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub header: PacketHeader,
    pub message_id: MessageId,
    /// Offset of the message body within `payload`.
    pub body_offset: usize,
    pub payload: Vec<u8>,
    pub acks: Vec<u32>,
}

impl DecodedPacket {
    pub fn body(&self) -> &[u8] {
        &self.payload[self.body_offset..]
    }
}

/// Decodes a raw datagram into a freshly allocated payload buffer.
pub fn decode(raw: &[u8]) -> Result<DecodedPacket, MalformedPacket> {
    decode_into(raw, Vec::new())
}

/// Decodes a raw datagram, reusing `payload` (typically taken from a pool) as the
/// destination of the message bytes.
pub fn decode_into(raw: &[u8], mut payload: Vec<u8>) -> Result<DecodedPacket, MalformedPacket> {
    let len = raw.len();
    if len < MIN_PACKET_LEN {
        return Err(MalformedPacket::TooShort(len));
    }
    let mut flags = PacketFlags::from_bits_truncate(raw[0]);
    let sequence = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]);
    let extra_len = raw[5] as usize;
    let payload_start = HEADER_LEN + extra_len;
    if payload_start >= len {
        return Err(MalformedPacket::HeaderOverrun {
            extra: extra_len,
            len,
        });
    }

    let mut payload_end = len;
    let mut acks = Vec::new();
    if flags.contains(PacketFlags::ACK) {
        let count = raw[len - 1] as usize;
        let trailer = count * 4 + 1;
        if payload_start + trailer >= len {
            return Err(MalformedPacket::AckTrailerOverrun { acks: count, len });
        }
        payload_end = len - trailer;
        acks.reserve(count);
        for chunk in raw[payload_end..len - 1].chunks_exact(4) {
            acks.push(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
    }

    let encoded = &raw[payload_start..payload_end];
    payload.clear();
    if flags.contains(PacketFlags::ZEROCODED) && !zero_decode(encoded, &mut payload) {
        tracing::debug!(sequence, "Zero-decoding overflowed, falling back to raw payload");
        flags.remove(PacketFlags::ZEROCODED);
        payload.clear();
    }
    if !flags.contains(PacketFlags::ZEROCODED) {
        payload.extend_from_slice(encoded);
    }

    let (message_id, body_offset) =
        MessageId::parse(&payload).ok_or(MalformedPacket::MissingMessageId)?;

    Ok(DecodedPacket {
        header: PacketHeader {
            flags,
            sequence,
            extra_len,
        },
        message_id,
        body_offset,
        payload,
        acks,
    })
}

/// Expands a zero-coded buffer into `dst`.
///
/// Returns `false` when the input ends in the middle of a run or the output would exceed the
/// worst-case bound; `dst` is then left in an unspecified state.
pub fn zero_decode(src: &[u8], dst: &mut Vec<u8>) -> bool {
    // every `00 nn` pair expands to at most 255 bytes
    let worst_case = (src.len() / 2 + 1) * u8::MAX as usize;
    let capacity = worst_case.min(MAX_DECODED_LEN);
    dst.reserve(src.len().min(capacity));

    let mut i = 0;
    while i < src.len() {
        let byte = src[i];
        if byte == 0 {
            let Some(&run) = src.get(i + 1) else {
                return false;
            };
            if dst.len() + run as usize > capacity {
                return false;
            }
            dst.resize(dst.len() + run as usize, 0);
            i += 2;
        } else {
            if dst.len() + 1 > capacity {
                return false;
            }
            dst.push(byte);
            i += 1;
        }
    }
    true
}

/// Zero-codes `src`, appending the result to `dst`.
pub fn zero_encode(src: &[u8], dst: &mut impl BufMut) {
    let mut zeros: u8 = 0;
    for &byte in src {
        if byte == 0 {
            if zeros == u8::MAX {
                dst.put_u8(0);
                dst.put_u8(zeros);
                zeros = 0;
            }
            zeros += 1;
        } else {
            if zeros > 0 {
                dst.put_u8(0);
                dst.put_u8(zeros);
                zeros = 0;
            }
            dst.put_u8(byte);
        }
    }
    if zeros > 0 {
        dst.put_u8(0);
        dst.put_u8(zeros);
    }
}

/// Frames `payload` into a new datagram with sequence number 0 (assigned at send time).
///
/// Small datagrams get a [`SMALL_BUFFER_SIZE`] allocation, others a full [`MTU`] one. A
/// zero-coded body that no longer fits is sent raw with the flag cleared. A datagram that
/// exceeds the MTU even uncompressed gets an exact-size buffer and is reported, since no
/// splittable message should get there.
pub fn build_datagram(mut flags: PacketFlags, extra: &[u8], payload: &[u8]) -> BytesMut {
    debug_assert!(extra.len() <= u8::MAX as usize);
    let header_len = HEADER_LEN + extra.len();

    let mut coded = None;
    if flags.contains(PacketFlags::ZEROCODED) {
        let mut scratch = Vec::with_capacity(payload.len() + payload.len() / 2 + 2);
        zero_encode(payload, &mut scratch);
        if header_len + scratch.len() <= MTU {
            coded = Some(scratch);
        } else {
            tracing::trace!(
                len = payload.len(),
                coded = scratch.len(),
                "Zero-coded payload exceeds MTU, sending raw"
            );
            flags.remove(PacketFlags::ZEROCODED);
        }
    }
    let body = coded.as_deref().unwrap_or(payload);
    let needed = header_len + body.len();

    let capacity = if needed <= SMALL_BUFFER_SIZE {
        SMALL_BUFFER_SIZE
    } else if needed <= MTU {
        MTU
    } else {
        tracing::error!(
            len = needed,
            mtu = MTU,
            "Encoded datagram exceeds MTU, allocating exact-size buffer"
        );
        needed
    };

    let mut buf = BytesMut::with_capacity(capacity);
    buf.put_u8(flags.bits());
    buf.put_u32(0);
    buf.put_u8(extra.len() as u8);
    buf.extend_from_slice(extra);
    buf.extend_from_slice(body);
    buf
}

pub fn flags_of(datagram: &[u8]) -> PacketFlags {
    PacketFlags::from_bits_truncate(datagram[0])
}

pub fn set_flags(datagram: &mut [u8], flags: PacketFlags) {
    datagram[0] = flags.bits();
}

pub fn sequence_of(datagram: &[u8]) -> u32 {
    u32::from_be_bytes([datagram[1], datagram[2], datagram[3], datagram[4]])
}

pub fn set_sequence(datagram: &mut [u8], sequence: u32) {
    datagram[1..5].copy_from_slice(&sequence.to_be_bytes());
}

/// Marks a retransmitted datagram.
pub fn set_resent(datagram: &mut [u8]) {
    datagram[0] |= PacketFlags::RESENT.bits();
}

/// Number of acks that still fit into `datagram` without exceeding the MTU.
pub fn ack_capacity(datagram: &[u8]) -> usize {
    MTU.saturating_sub(datagram.len() + 1) / 4
}

/// Appends the acknowledgement trailer and sets the ACK flag. `acks` must not be empty and
/// must fit (see [`ack_capacity`]).
pub fn append_acks(datagram: &mut BytesMut, acks: &[u32]) {
    debug_assert!(!acks.is_empty() && acks.len() <= MAX_APPENDED_ACKS);
    for ack in acks {
        datagram.put_u32(*ack);
    }
    datagram.put_u8(acks.len() as u8);
    let flags = flags_of(datagram) | PacketFlags::ACK;
    set_flags(datagram, flags);
}
