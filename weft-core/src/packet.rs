//! Fixed 32-byte packet headers for chunked transfers over raw byte
//! transports. An Ack packet may pack further headers into its payload,
//! acknowledging many chunks at once.

use uuid::Uuid;

pub const HEADER_LEN: usize = 32;

const CHUNK_TYPE_OFFSET: usize = 4;
const CHUNK_INDEX_RANGE: std::ops::Range<usize> = 8..12;
const CHANNEL_RANGE: std::ops::Range<usize> = 16..32;

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("packet too short: {len} bytes, need at least {HEADER_LEN}")]
    TooShort { len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    /// A chunk of transfer contents.
    Contents,
    /// The final contents chunk of its transfer.
    ContentsEnd,
    /// Acknowledgement; payload may carry packed sub-headers.
    Ack,
    /// Anything else on the wire. Preserved, never constructed locally.
    Unknown,
}

impl ChunkType {
    fn from_byte(byte: u8) -> Self {
        match byte {
            1 => ChunkType::Contents,
            2 => ChunkType::ContentsEnd,
            3 => ChunkType::Ack,
            _ => ChunkType::Unknown,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            ChunkType::Contents => 1,
            ChunkType::ContentsEnd => 2,
            ChunkType::Ack => 3,
            ChunkType::Unknown => 0,
        }
    }
}

/// The fixed-size header framing every chunk. Byte layout: checksum (0..4,
/// currently always zero), chunk type (4), chunk index (8..12, little
/// endian), channel id (16..32); the gaps are reserved and zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub chunk_type: ChunkType,
    pub chunk_index: u32,
    /// Transfer this chunk belongs to.
    pub channel: Uuid,
}

impl PacketHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        // Checksum bytes 0..4 and the reserved gaps stay zero.
        let mut out = [0u8; HEADER_LEN];
        out[CHUNK_TYPE_OFFSET] = self.chunk_type.to_byte();
        out[CHUNK_INDEX_RANGE].copy_from_slice(&self.chunk_index.to_le_bytes());
        out[CHANNEL_RANGE].copy_from_slice(self.channel.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_LEN {
            return Err(PacketError::TooShort { len: bytes.len() });
        }
        let mut index = [0u8; 4];
        index.copy_from_slice(&bytes[CHUNK_INDEX_RANGE]);
        let mut channel = [0u8; 16];
        channel.copy_from_slice(&bytes[CHANNEL_RANGE]);
        Ok(Self {
            chunk_type: ChunkType::from_byte(bytes[CHUNK_TYPE_OFFSET]),
            chunk_index: u32::from_le_bytes(index),
            channel: Uuid::from_bytes(channel),
        })
    }
}

/// Header plus payload. `encode`/`decode` frame a single packet; transport
/// drivers own message boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(header: PacketHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let header = PacketHeader::decode(bytes)?;
        Ok(Self {
            header,
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }

    /// Interpret the payload as packed sub-headers (Ack coalescing). A ragged
    /// tail that is not a whole header is logged and ignored.
    pub fn sub_headers(&self) -> Vec<PacketHeader> {
        let remainder = self.payload.len() % HEADER_LEN;
        if remainder != 0 {
            tracing::warn!(
                payload_len = self.payload.len(),
                remainder,
                "packet payload is not a whole number of sub-headers"
            );
        }
        self.payload
            .chunks_exact(HEADER_LEN)
            .filter_map(|chunk| PacketHeader::decode(chunk).ok())
            .collect()
    }
}
