//! Wire framing between instrumented peers
//!
//! Every write from an instrumented process is prefixed with an 8-byte
//! magic constant and a 12-byte little-endian metadata header. A receiver
//! that does not see the magic treats the whole read as one opaque payload
//! with no injected delay, which keeps uninstrumented peers working
//! unmodified.

/// Magic constant leading every frame, encoded little-endian.
pub const MAGIC: u64 = 0xabcd_effe_dcba;

/// Bytes of magic on the wire.
pub const MAGIC_LEN: usize = std::mem::size_of::<u64>();

/// Bytes of magic plus metadata header on the wire.
pub const HEADER_LEN: usize = MAGIC_LEN + FrameHeader::LEN;

/// Size of the stack buffer one framed write is built in.
pub const PACKET_SIZE: usize = 1024;

/// Largest payload a single framed write can carry.
pub const MAX_PAYLOAD: usize = PACKET_SIZE - HEADER_LEN;

/// Metadata carried between the magic and the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    /// Server calls the sender performed on behalf of this payload; each
    /// one buys the receiver a delay unit of wait.
    pub number_server_calls: u32,
    /// Accumulated virtual delay the sender has already absorbed.
    pub total_virtual_delay: u32,
    /// Payload bytes following this header.
    pub data_size: u32,
}

impl FrameHeader {
    /// Encoded size of the metadata header.
    pub const LEN: usize = 12;

    /// Header for an outgoing application write of `len` bytes.
    pub fn for_payload(len: usize) -> Self {
        FrameHeader {
            number_server_calls: 0,
            total_virtual_delay: 0,
            data_size: len as u32,
        }
    }

    /// Encode into the first [`Self::LEN`] bytes of `out`.
    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.number_server_calls.to_le_bytes());
        out[4..8].copy_from_slice(&self.total_virtual_delay.to_le_bytes());
        out[8..12].copy_from_slice(&self.data_size.to_le_bytes());
    }

    /// Decode from the first [`Self::LEN`] bytes of `bytes`.
    pub fn decode(bytes: &[u8]) -> Self {
        FrameHeader {
            number_server_calls: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            total_virtual_delay: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            data_size: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        }
    }
}

/// Does `bytes` begin with the frame magic?
pub fn starts_with_magic(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC_LEN
        && u64::from_le_bytes(bytes[..MAGIC_LEN].try_into().unwrap()) == MAGIC
}

/// Build a complete frame (magic, header, payload) into `out`, truncating
/// the payload to the space available. Returns the number of bytes written.
pub fn encode_frame(header: &FrameHeader, payload: &[u8], out: &mut [u8]) -> usize {
    debug_assert!(out.len() >= HEADER_LEN);
    out[..MAGIC_LEN].copy_from_slice(&MAGIC.to_le_bytes());
    header.encode(&mut out[MAGIC_LEN..HEADER_LEN]);

    let take = payload.len().min(out.len() - HEADER_LEN);
    out[HEADER_LEN..HEADER_LEN + take].copy_from_slice(&payload[..take]);
    HEADER_LEN + take
}
