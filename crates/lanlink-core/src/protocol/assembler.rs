//! Incremental frame reassembly for the receive side of a connection.
//!
//! A stream socket delivers bytes in arbitrary chunks: one read may contain
//! half a header, three whole frames, or the middle of a large body.  The
//! [`FrameAssembler`] keeps the partial state between reads:
//!
//! 1. Fill the 5-byte header.
//! 2. Decode it and allocate a body buffer of the declared length.
//! 3. Fill the body across as many chunks as it takes.
//! 4. Emit the completed [`IncomingMessage`] and reset to step 1.
//!
//! A zero-length body is emitted as soon as its header is complete.

use super::frame::{decode_header, IncomingMessage, MessageKind, ProtocolError, HEADER_SIZE};

/// Upper bound on the body buffer reserved up front; larger bodies grow as
/// their bytes arrive, so a hostile header cannot force a huge allocation.
const MAX_INITIAL_BODY_CAPACITY: usize = 64 * 1024;

/// Reassembles frames from a byte stream delivered in arbitrary chunks.
#[derive(Debug)]
pub struct FrameAssembler {
    header: [u8; HEADER_SIZE],
    header_filled: usize,
    /// Kind and body of the frame whose header is complete, if any.
    body: Option<(MessageKind, Vec<u8>)>,
    body_len: usize,
    max_payload: usize,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    /// Creates an assembler that accepts any non-negative declared length.
    pub fn new() -> Self {
        Self {
            header: [0u8; HEADER_SIZE],
            header_filled: 0,
            body: None,
            body_len: 0,
            max_payload: i32::MAX as usize,
        }
    }

    /// Rejects frames whose declared payload exceeds `max_payload` bytes.
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Returns `true` when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        self.header_filled == 0 && self.body.is_none()
    }

    /// Feeds `chunk` into the assembler, calling `emit` once per completed
    /// message.  Returns the number of messages emitted.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::NegativeLength`] or
    /// [`ProtocolError::PayloadTooLarge`] when a header declares an
    /// unacceptable length.  The stream cannot be resynchronised after that;
    /// the caller should drop the connection.
    pub fn push<F>(&mut self, chunk: &[u8], mut emit: F) -> Result<usize, ProtocolError>
    where
        F: FnMut(IncomingMessage),
    {
        let mut cursor = 0;
        let mut emitted = 0;

        loop {
            if self.body.is_none() {
                let wanted = HEADER_SIZE - self.header_filled;
                let n = wanted.min(chunk.len() - cursor);
                self.header[self.header_filled..self.header_filled + n]
                    .copy_from_slice(&chunk[cursor..cursor + n]);
                self.header_filled += n;
                cursor += n;

                if self.header_filled < HEADER_SIZE {
                    break;
                }
                self.begin_body()?;
            }

            if let Some((_, body)) = self.body.as_mut() {
                let wanted = self.body_len - body.len();
                let n = wanted.min(chunk.len() - cursor);
                body.extend_from_slice(&chunk[cursor..cursor + n]);
                cursor += n;

                if body.len() < self.body_len {
                    break;
                }
            }

            if let Some((kind, body)) = self.body.take() {
                self.header_filled = 0;
                self.body_len = 0;
                emit(IncomingMessage::new(kind, body));
                emitted += 1;
            }

            if cursor == chunk.len() {
                break;
            }
        }

        Ok(emitted)
    }

    fn begin_body(&mut self) -> Result<(), ProtocolError> {
        let header = decode_header(&self.header);
        let len = usize::try_from(header.payload_len)
            .map_err(|_| ProtocolError::NegativeLength(header.payload_len))?;
        if len > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                declared: len,
                max: self.max_payload,
            });
        }
        self.body_len = len;
        self.body = Some((header.kind, Vec::with_capacity(len.min(MAX_INITIAL_BODY_CAPACITY))));
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{encode_header, Frame, OutgoingMessage};

    fn data_frame(text: &str, n: i64) -> Frame {
        let mut msg = OutgoingMessage::data();
        msg.write_str(text);
        msg.write_i64(n);
        msg.finish().unwrap()
    }

    fn collect(assembler: &mut FrameAssembler, chunks: &[&[u8]]) -> Vec<IncomingMessage> {
        let mut out = Vec::new();
        for chunk in chunks {
            assembler.push(chunk, |m| out.push(m)).unwrap();
        }
        out
    }

    #[test]
    fn test_whole_frame_in_one_chunk_emits_one_message() {
        // Arrange
        let frame = data_frame("hello", 42);
        let mut assembler = FrameAssembler::new();

        // Act
        let messages = collect(&mut assembler, &[frame.as_bytes()]);

        // Assert
        assert_eq!(messages, vec![frame.to_incoming()]);
        assert!(assembler.is_idle());
    }

    #[test]
    fn test_every_chunk_size_yields_identical_message() {
        let frame = data_frame("fragmented across many reads", -7);
        let bytes = frame.as_bytes();

        for size in 1..=bytes.len() {
            let mut assembler = FrameAssembler::new();
            let chunks: Vec<&[u8]> = bytes.chunks(size).collect();

            let messages = collect(&mut assembler, &chunks);

            assert_eq!(messages.len(), 1, "chunk size {size}");
            assert_eq!(messages[0], frame.to_incoming(), "chunk size {size}");
            assert!(assembler.is_idle(), "chunk size {size}");
        }
    }

    #[test]
    fn test_several_frames_in_one_chunk_emit_in_order() {
        let a = data_frame("a", 1);
        let b = Frame::empty(MessageKind::IsAlive);
        let c = data_frame("c", 3);
        let mut joined = Vec::new();
        joined.extend_from_slice(a.as_bytes());
        joined.extend_from_slice(b.as_bytes());
        joined.extend_from_slice(c.as_bytes());
        let mut assembler = FrameAssembler::new();

        let mut out = Vec::new();
        let emitted = assembler.push(&joined, |m| out.push(m)).unwrap();

        assert_eq!(emitted, 3);
        assert_eq!(out, vec![a.to_incoming(), b.to_incoming(), c.to_incoming()]);
    }

    #[test]
    fn test_chunk_boundary_inside_header_and_next_frame() {
        let a = data_frame("first", 1);
        let b = data_frame("second", 2);
        let mut joined = a.as_bytes().to_vec();
        joined.extend_from_slice(b.as_bytes());
        let split = a.as_bytes().len() + 2;
        let mut assembler = FrameAssembler::new();

        let messages = collect(&mut assembler, &[&joined[..3], &joined[3..split], &joined[split..]]);

        assert_eq!(messages, vec![a.to_incoming(), b.to_incoming()]);
    }

    #[test]
    fn test_partial_frame_is_held_until_complete() {
        let frame = data_frame("pending", 9);
        let bytes = frame.as_bytes();
        let mut assembler = FrameAssembler::new();

        let first = collect(&mut assembler, &[&bytes[..bytes.len() - 1]]);
        assert!(first.is_empty());
        assert!(!assembler.is_idle());

        let second = collect(&mut assembler, &[&bytes[bytes.len() - 1..]]);
        assert_eq!(second, vec![frame.to_incoming()]);
    }

    #[test]
    fn test_empty_chunk_is_a_no_op() {
        let mut assembler = FrameAssembler::new();

        let emitted = assembler.push(&[], |_| panic!("nothing to emit")).unwrap();

        assert_eq!(emitted, 0);
        assert!(assembler.is_idle());
    }

    #[test]
    fn test_negative_length_is_rejected() {
        let header = encode_header(MessageKind::Data, -5);
        let mut assembler = FrameAssembler::new();

        let result = assembler.push(&header, |_| {});

        assert_eq!(result, Err(ProtocolError::NegativeLength(-5)));
    }

    #[test]
    fn test_length_above_limit_is_rejected() {
        let header = encode_header(MessageKind::Data, 2048);
        let mut assembler = FrameAssembler::new().with_max_payload(1024);

        let result = assembler.push(&header, |_| {});

        assert_eq!(
            result,
            Err(ProtocolError::PayloadTooLarge {
                declared: 2048,
                max: 1024
            })
        );
    }
}
