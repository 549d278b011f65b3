//! Message identifiers, block-structured outbound messages and the handful of control message
//! bodies the transport interprets itself.
//!
//! Message numbers are frequency encoded at the start of the payload:
//!
//! ```ascii
//! High:   NN                 (1 byte, 0x01..=0xFE)
//! Medium: FF NN              (2 bytes)
//! Low:    FF FF NN NN        (4 bytes, big-endian u16)
//! Fixed:  FF FF FF NN        (4 bytes)
//! ```
//!
//! Message bodies are little-endian.

use bytes::{BufMut, Bytes};
use uuid::Uuid;

use super::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    High(u8),
    Medium(u8),
    Low(u16),
    Fixed(u8),
}

impl MessageId {
    pub const PACKET_ACK: MessageId = MessageId::Fixed(0xFB);
    pub const OPEN_CIRCUIT: MessageId = MessageId::Fixed(0xFC);
    pub const CLOSE_CIRCUIT: MessageId = MessageId::Fixed(0xFD);
    pub const START_PING_CHECK: MessageId = MessageId::High(1);
    pub const COMPLETE_PING_CHECK: MessageId = MessageId::High(2);
    pub const USE_CIRCUIT_CODE: MessageId = MessageId::Low(3);
    pub const COARSE_LOCATION_UPDATE: MessageId = MessageId::Medium(6);
    pub const CHAT_FROM_VIEWER: MessageId = MessageId::Low(80);

    /// Reads the message number at the start of `payload`, returning it with its encoded length.
    pub fn parse(payload: &[u8]) -> Option<(MessageId, usize)> {
        match payload {
            [0xFF, 0xFF, 0xFF, n, ..] => Some((MessageId::Fixed(*n), 4)),
            [0xFF, 0xFF, hi, lo, ..] => Some((MessageId::Low(u16::from_be_bytes([*hi, *lo])), 4)),
            [0xFF, n, ..] if *n != 0xFF => Some((MessageId::Medium(*n), 2)),
            [n, ..] if *n != 0xFF => Some((MessageId::High(*n), 1)),
            _ => None,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            MessageId::High(_) => 1,
            MessageId::Medium(_) => 2,
            MessageId::Low(_) | MessageId::Fixed(_) => 4,
        }
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        match *self {
            MessageId::High(n) => buf.put_u8(n),
            MessageId::Medium(n) => {
                buf.put_u8(0xFF);
                buf.put_u8(n);
            }
            MessageId::Low(n) => {
                buf.put_u16(0xFFFF);
                buf.put_u16(n);
            }
            MessageId::Fixed(n) => {
                buf.put_u16(0xFFFF);
                buf.put_u8(0xFF);
                buf.put_u8(n);
            }
        }
    }

    /// Messages of this type are never split, however large they grow.
    pub fn is_split_exempt(&self) -> bool {
        *self == MessageId::COARSE_LOCATION_UPDATE
    }

    /// Chat traffic gets its own inbox and worker so it cannot starve everything else.
    pub fn is_chat(&self) -> bool {
        *self == MessageId::CHAT_FROM_VIEWER
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageId::High(n) => write!(f, "High {n}"),
            MessageId::Medium(n) => write!(f, "Medium {n}"),
            MessageId::Low(n) => write!(f, "Low {n}"),
            MessageId::Fixed(n) => write!(f, "Fixed 0x{n:02X}"),
        }
    }
}

/// Maximum repetitions of a variable block in one datagram (the count is a single byte).
const MAX_BLOCKS_PER_FRAGMENT: usize = u8::MAX as usize;

/// An outbound message: a fixed part plus, optionally, a count-prefixed list of repeated
/// variable blocks. Only messages with repeated blocks can be split across datagrams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: MessageId,
    fixed: Bytes,
    blocks: Option<Vec<Bytes>>,
}

impl Message {
    /// A message without a repeated section. Never split.
    pub fn new(id: MessageId, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            fixed: body.into(),
            blocks: None,
        }
    }

    /// A message whose trailing section is a repeated block serialized as `count, block*`.
    pub fn with_blocks(id: MessageId, fixed: impl Into<Bytes>, blocks: Vec<Bytes>) -> Self {
        Self {
            id,
            fixed: fixed.into(),
            blocks: Some(blocks),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn is_splittable(&self) -> bool {
        self.blocks.is_some() && !self.id.is_split_exempt()
    }

    pub fn serialized_len(&self) -> usize {
        self.id.encoded_len()
            + self.fixed.len()
            + self
                .blocks
                .as_ref()
                .map_or(0, |b| 1 + b.iter().map(Bytes::len).sum::<usize>())
    }

    fn block_count(&self) -> usize {
        self.blocks.as_ref().map_or(0, Vec::len)
    }

    /// Serializes the whole message as one payload.
    ///
    /// A single payload holds at most 255 repeated blocks; use [`Message::split`] for anything
    /// that may carry more. Blocks past the 255th are dropped here and the loss is logged.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_len());
        self.id.write_to(&mut buf);
        buf.extend_from_slice(&self.fixed);
        if let Some(blocks) = &self.blocks {
            if blocks.len() > MAX_BLOCKS_PER_FRAGMENT {
                tracing::error!(
                    id = %self.id,
                    blocks = blocks.len(),
                    "Repeated blocks beyond 255 dropped from single payload"
                );
            }
            buf.put_u8(blocks.len().min(MAX_BLOCKS_PER_FRAGMENT) as u8);
            for block in blocks.iter().take(MAX_BLOCKS_PER_FRAGMENT) {
                buf.extend_from_slice(block);
            }
        }
        buf
    }

    /// A message that has to go out as one payload, refused when its block count overflows.
    fn whole(&self) -> Result<Vec<Vec<u8>>, TransportError> {
        let blocks = self.block_count();
        if blocks > MAX_BLOCKS_PER_FRAGMENT {
            return Err(TransportError::TooManyBlocks { id: self.id, blocks });
        }
        Ok(vec![self.to_bytes()])
    }

    /// Serializes into one or more payloads of at most `max_payload` bytes each.
    ///
    /// Every fragment repeats the message id and the fixed part and carries a disjoint run of
    /// the repeated blocks, in order. A message that fits, cannot be split, or whose fixed part
    /// alone exceeds the limit comes back as a single (possibly oversized) payload. Such a
    /// message fails with [`TransportError::TooManyBlocks`] if it carries more than 255 blocks.
    pub fn split(&self, max_payload: usize) -> Result<Vec<Vec<u8>>, TransportError> {
        let blocks = match &self.blocks {
            Some(blocks) if self.is_splittable() => blocks,
            _ => return self.whole(),
        };
        if self.serialized_len() <= max_payload && blocks.len() <= MAX_BLOCKS_PER_FRAGMENT {
            return self.whole();
        }

        let base = self.id.encoded_len() + self.fixed.len() + 1;
        if base >= max_payload {
            tracing::warn!(id = %self.id, base, max_payload, "Fixed part too large to split");
            return self.whole();
        }

        let mut fragments = Vec::new();
        let mut start = 0;
        while start < blocks.len() {
            let mut size = base;
            let mut end = start;
            while end < blocks.len()
                && end - start < MAX_BLOCKS_PER_FRAGMENT
                && (end == start || size + blocks[end].len() <= max_payload)
            {
                size += blocks[end].len();
                end += 1;
            }
            let mut buf = Vec::with_capacity(size);
            self.id.write_to(&mut buf);
            buf.extend_from_slice(&self.fixed);
            buf.put_u8((end - start) as u8);
            for block in &blocks[start..end] {
                buf.extend_from_slice(block);
            }
            fragments.push(buf);
            start = end;
        }
        Ok(fragments)
    }
}

/// Body of the circuit handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseCircuitCode {
    pub circuit_code: u32,
    pub session_id: Uuid,
    pub agent_id: Uuid,
}

impl UseCircuitCode {
    const LEN: usize = 4 + 16 + 16;

    pub fn parse(body: &[u8]) -> Option<Self> {
        if body.len() < Self::LEN {
            return None;
        }
        let circuit_code = u32::from_le_bytes(body[0..4].try_into().ok()?);
        let session_id = Uuid::from_slice(&body[4..20]).ok()?;
        let agent_id = Uuid::from_slice(&body[20..36]).ok()?;
        Some(Self {
            circuit_code,
            session_id,
            agent_id,
        })
    }

    pub fn to_message(&self) -> Message {
        let mut body = Vec::with_capacity(Self::LEN);
        body.put_u32_le(self.circuit_code);
        body.extend_from_slice(self.session_id.as_bytes());
        body.extend_from_slice(self.agent_id.as_bytes());
        Message::new(MessageId::USE_CIRCUIT_CODE, body)
    }
}

/// Builds a dedicated acknowledgement message. At most 255 sequence numbers are taken.
pub fn packet_ack(sequences: &[u32]) -> Message {
    let count = sequences.len().min(u8::MAX as usize);
    let mut body = Vec::with_capacity(1 + count * 4);
    body.put_u8(count as u8);
    for seq in &sequences[..count] {
        body.put_u32_le(*seq);
    }
    Message::new(MessageId::PACKET_ACK, body)
}

/// Reads the sequence numbers carried by a `PacketAck` body. Truncated entries are ignored.
pub fn parse_packet_ack(body: &[u8]) -> Vec<u32> {
    let Some((&count, rest)) = body.split_first() else {
        return Vec::new();
    };
    rest.chunks_exact(4)
        .take(count as usize)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn start_ping_check(ping_id: u8, oldest_unacked: u32) -> Message {
    let mut body = Vec::with_capacity(5);
    body.put_u8(ping_id);
    body.put_u32_le(oldest_unacked);
    Message::new(MessageId::START_PING_CHECK, body)
}

pub fn complete_ping_check(ping_id: u8) -> Message {
    Message::new(MessageId::COMPLETE_PING_CHECK, vec![ping_id])
}
