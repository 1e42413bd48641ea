//! Binary codec for LanLink TCP messages.
//!
//! Wire format:
//! ```text
//! [kind:1][payload_len:4][payload:N]
//! ```
//! Total header size: 5 bytes.  `payload_len` is a little-endian signed
//! 32-bit integer.  The header layout is not versioned: changing it breaks
//! every existing peer.
//!
//! Messages are built with [`OutgoingMessage`], frozen into an immutable
//! [`Frame`] by [`OutgoingMessage::finish`], and read back on the receiving
//! side with [`IncomingMessage`], whose readers mirror the writers exactly.
//!
//! # Value encodings
//!
//! | Value        | Encoding                                                   |
//! |--------------|------------------------------------------------------------|
//! | integers     | fixed width, little-endian                                  |
//! | `bool`       | 1 byte, `0x00` / `0x01`                                    |
//! | string       | 4-byte LE byte count, then UTF-16LE code units             |
//! | byte span    | raw bytes, no prefix (the reader supplies the length)      |
//! | UUID         | 16 bytes in GUID (mixed-endian) order, see [`Uuid::to_bytes_le`] |

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Size of the frame header in bytes: 1 kind byte + 4 length bytes.
pub const HEADER_SIZE: usize = 5;

/// Errors that can occur while building or reading messages.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// A read would run past the end of the payload.
    #[error("insufficient data: need {needed} bytes, {available} available")]
    InsufficientData { needed: usize, available: usize },

    /// A frame header declared a negative payload length.
    #[error("negative payload length in frame header: {0}")]
    NegativeLength(i32),

    /// A payload exceeds the size the receiver (or the wire format) allows.
    #[error("payload too large: {declared} bytes, limit is {max}")]
    PayloadTooLarge { declared: usize, max: usize },

    /// A length-prefixed field carried an impossible value.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

// ── Message kinds ─────────────────────────────────────────────────────────────

/// The kind byte carried in every frame header.
///
/// Only `Data` and `IsAlive` are produced by the library itself; the rest are
/// reserved for applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MessageKind {
    #[default]
    Unknown = 0,
    /// Application-defined data.
    Data = 1,
    /// Empty liveness probe.
    IsAlive = 2,
    Verification = 3,
    Ping = 4,
}

impl MessageKind {
    /// Maps a header byte to a kind.  Unrecognized bytes become `Unknown`.
    pub fn from_byte(value: u8) -> Self {
        match value {
            1 => MessageKind::Data,
            2 => MessageKind::IsAlive,
            3 => MessageKind::Verification,
            4 => MessageKind::Ping,
            _ => MessageKind::Unknown,
        }
    }
}

// ── Header helpers ────────────────────────────────────────────────────────────

/// Decoded contents of a 5-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: MessageKind,
    /// Declared payload length.  Signed on the wire; negative values are a
    /// protocol violation the reassembler rejects.
    pub payload_len: i32,
}

/// Encodes a frame header.
pub fn encode_header(kind: MessageKind, payload_len: i32) -> [u8; HEADER_SIZE] {
    let len = payload_len.to_le_bytes();
    [kind as u8, len[0], len[1], len[2], len[3]]
}

/// Decodes a frame header.
///
/// # Examples
///
/// ```rust
/// use lanlink_core::protocol::{decode_header, encode_header, MessageKind};
///
/// let header = encode_header(MessageKind::Data, 12);
/// let decoded = decode_header(&header);
/// assert_eq!(decoded.kind, MessageKind::Data);
/// assert_eq!(decoded.payload_len, 12);
/// ```
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> FrameHeader {
    FrameHeader {
        kind: MessageKind::from_byte(header[0]),
        payload_len: i32::from_le_bytes([header[1], header[2], header[3], header[4]]),
    }
}

// ── Outgoing messages ─────────────────────────────────────────────────────────

/// Append-only builder for an outgoing frame.
///
/// The buffer starts with the kind byte and a zeroed length placeholder; every
/// writer appends to the end.  [`finish`](Self::finish) patches the length and
/// consumes the builder, so a finalized message cannot be mutated.
///
/// # Examples
///
/// ```rust
/// use lanlink_core::protocol::{MessageKind, OutgoingMessage};
///
/// let mut msg = OutgoingMessage::new(MessageKind::Data);
/// msg.write_str("hello");
/// msg.write_i32(7);
/// let frame = msg.finish().unwrap();
/// assert_eq!(frame.kind(), MessageKind::Data);
/// assert_eq!(frame.payload_len(), 4 + 10 + 4);
/// ```
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    buf: Vec<u8>,
}

impl OutgoingMessage {
    /// Starts a message of the given kind.
    pub fn new(kind: MessageKind) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&encode_header(kind, 0));
        Self { buf }
    }

    /// Shorthand for `OutgoingMessage::new(MessageKind::Data)`.
    pub fn data() -> Self {
        Self::new(MessageKind::Data)
    }

    /// Number of payload bytes written so far.
    pub fn payload_len(&self) -> usize {
        self.buf.len() - HEADER_SIZE
    }

    /// Writes a string as a 4-byte byte count followed by UTF-16LE code units.
    pub fn write_str(&mut self, value: &str) {
        let units: Vec<u16> = value.encode_utf16().collect();
        self.write_i32((units.len() * 2) as i32);
        for unit in units {
            self.buf.extend_from_slice(&unit.to_le_bytes());
        }
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Writes a boolean as a single `0x00` / `0x01` byte.
    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    /// Appends raw bytes without a length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(value);
    }

    /// Writes a UUID as 16 bytes in GUID byte order.
    pub fn write_uuid(&mut self, value: Uuid) {
        self.buf.extend_from_slice(&value.to_bytes_le());
    }

    /// Patches the length field and freezes the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] if the payload does not fit
    /// the signed 32-bit length field.
    pub fn finish(mut self) -> Result<Frame, ProtocolError> {
        let payload_len = self.payload_len();
        let declared = i32::try_from(payload_len).map_err(|_| ProtocolError::PayloadTooLarge {
            declared: payload_len,
            max: i32::MAX as usize,
        })?;
        self.buf[1..HEADER_SIZE].copy_from_slice(&declared.to_le_bytes());
        Ok(Frame {
            bytes: Arc::from(self.buf.into_boxed_slice()),
        })
    }
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// A finalized, immutable frame ready for transmission.
///
/// Cloning is cheap (reference counted), so the same frame can be queued on
/// many connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Arc<[u8]>,
}

impl Frame {
    /// A frame with no payload, e.g. an `IsAlive` probe.
    pub fn empty(kind: MessageKind) -> Self {
        Frame {
            bytes: Arc::from(encode_header(kind, 0).to_vec().into_boxed_slice()),
        }
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::from_byte(self.bytes[0])
    }

    pub fn payload_len(&self) -> usize {
        self.bytes.len() - HEADER_SIZE
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_SIZE..]
    }

    /// The complete wire bytes, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Reinterprets this frame as a received message, as the peer would see it.
    pub fn to_incoming(&self) -> IncomingMessage {
        IncomingMessage::new(self.kind(), self.payload().to_vec())
    }
}

// ── Incoming messages ─────────────────────────────────────────────────────────

/// A received message: its kind, its payload, and a read cursor.
///
/// Each reader advances the cursor by the width of the value it decodes.
/// Reading past the end of the payload is a caller error and is reported as
/// [`ProtocolError::InsufficientData`]; the cursor is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    kind: MessageKind,
    payload: Vec<u8>,
    cursor: usize,
}

impl IncomingMessage {
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            payload,
            cursor: 0,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Current read offset into the payload.
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.cursor
    }

    /// Reads a 4-byte byte count and that many bytes of UTF-16LE text.
    ///
    /// Unpaired surrogates and a trailing odd byte decode to U+FFFD.
    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let start = self.cursor;
        let len = self.read_i32()?;
        let len = match usize::try_from(len) {
            Ok(len) => len,
            Err(_) => {
                self.cursor = start;
                return Err(ProtocolError::MalformedPayload(format!(
                    "negative string length {len} at offset {start}"
                )));
            }
        };
        if len > self.remaining() {
            let available = self.remaining();
            self.cursor = start;
            return Err(ProtocolError::InsufficientData {
                needed: len,
                available,
            });
        }
        let bytes = self.take(len)?;

        let chunks = bytes.chunks_exact(2);
        let odd = !chunks.remainder().is_empty();
        let units: Vec<u16> = chunks.map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
        let mut text = String::from_utf16_lossy(&units);
        if odd {
            text.push(char::REPLACEMENT_CHARACTER);
        }
        Ok(text)
    }

    pub fn read_i16(&mut self) -> Result<i16, ProtocolError> {
        Ok(i16::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        let [b] = self.take_array::<1>()?;
        Ok(b)
    }

    /// Reads one byte; any non-zero value is `true`.
    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads `amount` raw bytes as a borrowed slice.
    pub fn read_bytes(&mut self, amount: usize) -> Result<&[u8], ProtocolError> {
        self.take(amount)
    }

    /// Reads a 16-byte UUID in GUID byte order.
    pub fn read_uuid(&mut self) -> Result<Uuid, ProtocolError> {
        Ok(Uuid::from_bytes_le(self.take_array()?))
    }

    fn take(&mut self, amount: usize) -> Result<&[u8], ProtocolError> {
        let available = self.remaining();
        if amount > available {
            return Err(ProtocolError::InsufficientData {
                needed: amount,
                available,
            });
        }
        let start = self.cursor;
        self.cursor += amount;
        Ok(&self.payload[start..start + amount])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn incoming(frame: &Frame) -> IncomingMessage {
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&frame.as_bytes()[..HEADER_SIZE]);
        let decoded = decode_header(&header);
        assert_eq!(decoded.payload_len as usize, frame.payload_len());
        IncomingMessage::new(decoded.kind, frame.payload().to_vec())
    }

    // ── Header layout ─────────────────────────────────────────────────────────

    /// The header layout is shared with every deployed peer.  If this test
    /// fails, the change is a wire-protocol break.
    #[test]
    fn test_header_layout_is_fixed_at_five_bytes() {
        assert_eq!(HEADER_SIZE, 5);

        let header = encode_header(MessageKind::IsAlive, 0x0102_0304);

        assert_eq!(header, [0x02, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_kind_byte_values_match_the_wire_protocol() {
        assert_eq!(MessageKind::Unknown as u8, 0);
        assert_eq!(MessageKind::Data as u8, 1);
        assert_eq!(MessageKind::IsAlive as u8, 2);
        assert_eq!(MessageKind::Verification as u8, 3);
        assert_eq!(MessageKind::Ping as u8, 4);
    }

    #[test]
    fn test_unrecognized_kind_byte_decodes_as_unknown() {
        assert_eq!(MessageKind::from_byte(0xEE), MessageKind::Unknown);
    }

    #[test]
    fn test_decode_header_reads_negative_length() {
        let header = encode_header(MessageKind::Data, -1);
        assert_eq!(decode_header(&header).payload_len, -1);
    }

    // ── Builder ───────────────────────────────────────────────────────────────

    #[test]
    fn test_empty_message_finishes_to_bare_header() {
        // Arrange
        let msg = OutgoingMessage::new(MessageKind::IsAlive);

        // Act
        let frame = msg.finish().unwrap();

        // Assert
        assert_eq!(frame.as_bytes(), &[0x02, 0, 0, 0, 0]);
        assert_eq!(frame, Frame::empty(MessageKind::IsAlive));
    }

    #[test]
    fn test_finish_patches_length_with_payload_size() {
        let mut msg = OutgoingMessage::data();
        msg.write_i64(1);
        msg.write_u8(2);

        let frame = msg.finish().unwrap();

        assert_eq!(frame.payload_len(), 9);
        assert_eq!(&frame.as_bytes()[1..5], &9i32.to_le_bytes());
    }

    #[test]
    fn test_string_is_utf16_with_byte_count_prefix() {
        let mut msg = OutgoingMessage::data();
        msg.write_str("hi");

        let frame = msg.finish().unwrap();

        assert_eq!(frame.payload(), &[4, 0, 0, 0, b'h', 0, b'i', 0]);
    }

    #[test]
    fn test_bool_is_one_byte() {
        let mut msg = OutgoingMessage::data();
        msg.write_bool(true);
        msg.write_bool(false);

        assert_eq!(msg.finish().unwrap().payload(), &[1, 0]);
    }

    #[test]
    fn test_uuid_uses_guid_byte_order() {
        let id = Uuid::parse_str("00112233-4455-6677-8899-aabbccddeeff").unwrap();
        let mut msg = OutgoingMessage::data();
        msg.write_uuid(id);

        let frame = msg.finish().unwrap();

        assert_eq!(
            frame.payload(),
            &[
                0x33, 0x22, 0x11, 0x00, 0x55, 0x44, 0x77, 0x66, 0x88, 0x99, 0xaa, 0xbb, 0xcc,
                0xdd, 0xee, 0xff
            ]
        );
    }

    // ── Reader ────────────────────────────────────────────────────────────────

    #[test]
    fn test_mixed_values_read_back_in_order() {
        // Arrange
        let id = Uuid::new_v4();
        let mut msg = OutgoingMessage::data();
        msg.write_str("héllo wörld ✓");
        msg.write_i16(-2);
        msg.write_i32(i32::MIN);
        msg.write_i64(i64::MAX);
        msg.write_u16(u16::MAX);
        msg.write_u32(0xDEAD_BEEF);
        msg.write_u64(u64::MAX - 1);
        msg.write_u8(0x7F);
        msg.write_bool(true);
        msg.write_bytes(&[9, 8, 7]);
        msg.write_uuid(id);
        let frame = msg.finish().unwrap();

        // Act
        let mut reader = incoming(&frame);

        // Assert
        assert_eq!(reader.kind(), MessageKind::Data);
        assert_eq!(reader.read_string().unwrap(), "héllo wörld ✓");
        assert_eq!(reader.read_i16().unwrap(), -2);
        assert_eq!(reader.read_i32().unwrap(), i32::MIN);
        assert_eq!(reader.read_i64().unwrap(), i64::MAX);
        assert_eq!(reader.read_u16().unwrap(), u16::MAX);
        assert_eq!(reader.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(reader.read_u8().unwrap(), 0x7F);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_bytes(3).unwrap(), &[9, 8, 7]);
        assert_eq!(reader.read_uuid().unwrap(), id);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_string_with_surrogate_pairs_reads_back() {
        let mut msg = OutgoingMessage::data();
        msg.write_str("emoji 🎉 and 𝄞");
        let mut reader = incoming(&msg.finish().unwrap());

        assert_eq!(reader.read_string().unwrap(), "emoji 🎉 and 𝄞");
    }

    #[test]
    fn test_empty_string_reads_back() {
        let mut msg = OutgoingMessage::data();
        msg.write_str("");
        let mut reader = incoming(&msg.finish().unwrap());

        assert_eq!(reader.read_string().unwrap(), "");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_read_past_end_returns_insufficient_data_without_moving_cursor() {
        // Arrange
        let mut reader = IncomingMessage::new(MessageKind::Data, vec![1, 2]);

        // Act
        let result = reader.read_i32();

        // Assert
        assert_eq!(
            result,
            Err(ProtocolError::InsufficientData {
                needed: 4,
                available: 2
            })
        );
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_read_string_with_length_beyond_payload_fails_and_rewinds() {
        let mut payload = 100i32.to_le_bytes().to_vec();
        payload.extend_from_slice(&[0x41, 0x00]);
        let mut reader = IncomingMessage::new(MessageKind::Data, payload);

        assert!(matches!(
            reader.read_string(),
            Err(ProtocolError::InsufficientData { .. })
        ));
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_read_string_with_negative_length_is_malformed() {
        let mut reader = IncomingMessage::new(MessageKind::Data, (-4i32).to_le_bytes().to_vec());

        assert!(matches!(
            reader.read_string(),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_read_string_with_odd_byte_count_is_lossy() {
        let mut payload = 3i32.to_le_bytes().to_vec();
        payload.extend_from_slice(&[b'A', 0x00, 0x42]);
        let mut reader = IncomingMessage::new(MessageKind::Data, payload);

        assert_eq!(reader.read_string().unwrap(), "A\u{FFFD}");
    }

    #[test]
    fn test_frame_to_incoming_mirrors_peer_view() {
        let mut msg = OutgoingMessage::new(MessageKind::Ping);
        msg.write_u32(5);
        let frame = msg.finish().unwrap();

        let mut reader = frame.to_incoming();

        assert_eq!(reader.kind(), MessageKind::Ping);
        assert_eq!(reader.read_u32().unwrap(), 5);
    }
}
