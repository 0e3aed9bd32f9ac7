//! Self-delimiting framing for raw byte streams
//!
//! Fallback transport for plugins that cannot use the native length-delimited
//! channel. Every frame is
//!
//! ```text
//! MAGIC (22 bytes) | LENGTH (u32, big-endian, payload bytes only) | PAYLOAD
//! ```
//!
//! The decoder is a byte-at-a-time state machine so it survives any fragmentation
//! of the underlying stream, including splits inside the magic or the length field.
//! Bytes outside a frame are skipped, which lets the frames share a stream with
//! ordinary diagnostic output.
//!
//! The encoder writes exactly LENGTH payload bytes with no trailing padding.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Frame start marker
pub const MAGIC: &[u8; 22] = b"PHANDLERA_TRANSMISSION";

/// Size of the big-endian length field
pub const LENGTH_FIELD_LEN: usize = 4;

/// Magic plus length field
pub const HEADER_LEN: usize = MAGIC.len() + LENGTH_FIELD_LEN;

/// Largest payload accepted by default (16 MiB)
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("declared frame length {declared} exceeds maximum {max}")]
    FrameTooLarge { declared: usize, max: usize },

    #[error("payload of {0} bytes does not fit the 32-bit length field")]
    PayloadTooLong(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<FrameError> for std::io::Error {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(io) => io,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    ScanningHeader,
    ReadingFrame,
}

/// Stateful frame decoder/encoder
#[derive(Debug)]
pub struct FrameCodec {
    state: DecodeState,
    /// Number of magic bytes matched so far
    magic_cursor: usize,
    /// Current frame, magic included
    buffer: Vec<u8>,
    /// Latched once the length field is complete
    declared_len: Option<usize>,
    max_frame_length: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            state: DecodeState::ScanningHeader,
            magic_cursor: 0,
            buffer: Vec::new(),
            declared_len: None,
            max_frame_length,
        }
    }

    /// True when no partial frame or partial magic is buffered
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::ScanningHeader && self.magic_cursor == 0
    }

    /// Feed a single byte, returning the payload if this byte completes a frame
    pub fn push_byte(&mut self, byte: u8) -> Result<Option<BytesMut>, FrameError> {
        match self.state {
            DecodeState::ScanningHeader => {
                if byte == MAGIC[self.magic_cursor] {
                    self.magic_cursor += 1;
                    if self.magic_cursor == MAGIC.len() {
                        self.buffer.extend_from_slice(MAGIC);
                        self.magic_cursor = 0;
                        self.state = DecodeState::ReadingFrame;
                    }
                } else {
                    // The mismatching byte may itself start a new magic
                    self.magic_cursor = usize::from(byte == MAGIC[0]);
                }
                Ok(None)
            }
            DecodeState::ReadingFrame => {
                self.buffer.push(byte);

                if self.declared_len.is_none() && self.buffer.len() >= HEADER_LEN {
                    let mut len_bytes = [0u8; LENGTH_FIELD_LEN];
                    len_bytes.copy_from_slice(&self.buffer[MAGIC.len()..HEADER_LEN]);
                    let declared = u32::from_be_bytes(len_bytes) as usize;
                    if declared > self.max_frame_length {
                        self.reset();
                        return Err(FrameError::FrameTooLarge {
                            declared,
                            max: self.max_frame_length,
                        });
                    }
                    self.declared_len = Some(declared);
                }

                match self.declared_len {
                    Some(len) if self.buffer.len() >= HEADER_LEN + len => {
                        let payload = BytesMut::from(&self.buffer[HEADER_LEN..HEADER_LEN + len]);
                        self.reset();
                        Ok(Some(payload))
                    }
                    _ => Ok(None),
                }
            }
        }
    }

    /// Feed a fragment, returning every payload it completes
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<BytesMut>, FrameError> {
        let mut frames = Vec::new();
        for &byte in data {
            if let Some(payload) = self.push_byte(byte)? {
                frames.push(payload);
            }
        }
        Ok(frames)
    }

    /// Append one encoded frame for `payload` to `dst`
    pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = u32::try_from(payload.len())
            .map_err(|_| FrameError::PayloadTooLong(payload.len()))?;
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_slice(MAGIC);
        dst.put_u32(len);
        dst.put_slice(payload);
        Ok(())
    }

    fn reset(&mut self) {
        self.state = DecodeState::ScanningHeader;
        self.magic_cursor = 0;
        self.buffer.clear();
        self.declared_len = None;
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, FrameError> {
        let mut consumed = 0;
        let mut result = Ok(None);
        while consumed < src.len() {
            let byte = src[consumed];
            consumed += 1;
            match self.push_byte(byte) {
                Ok(None) => continue,
                other => {
                    result = other;
                    break;
                }
            }
        }
        src.advance(consumed);
        result
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, FrameError> {
        // A truncated trailing frame is dropped, not reported
        self.decode(src)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        Self::encode_frame(&item, dst)
    }
}
