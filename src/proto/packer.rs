//! Length-prefixed framing over a chunked byte stream.
//!
//! Every message travels as `[0x02][u32 big-endian length][payload]`, split
//! into chunks no larger than the channel buffer. The receiving side feeds
//! whatever the socket hands back into [`Packer::unpack`], which keeps the
//! partially received frame between calls.

use bytes::{BufMut, Bytes, BytesMut};
use log::warn;
use std::sync::Arc;
use thiserror::Error;

/// Marker opening every frame.
pub const MESSAGE_START_BYTE: u8 = 0x02;

/// Marker byte plus the 4-byte length.
pub const HEADER_LEN: usize = 5;

/// Smallest buffer able to carry a header and at least one payload byte.
pub const MIN_BUFFER_SIZE: usize = 6;

/// Upper bound for the up-front allocation of an announced payload.
const MAX_PREALLOC: usize = 64 * 1024;

/// 帧处理错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid buffer size {size}, at least {min} bytes required")]
    InvalidBufferSize { size: usize, min: usize },
    #[error("payload of {0} bytes does not fit a u32 length prefix")]
    PayloadTooLarge(usize),
}

/// Framing strategy used by a channel.
///
/// `unpack` must accept arbitrary fragments: a fragment may end inside a
/// header, carry the tail of one message and the head of the next, or hold
/// several whole messages.
pub trait Packer: Send {
    /// Split one encoded message into wire chunks.
    fn pack(&self, message: &[u8]) -> Result<Vec<Bytes>, FrameError>;

    /// Feed one fragment, returning every message it completes.
    fn unpack(&mut self, fragment: &[u8]) -> Vec<Bytes>;
}

/// Builds a fresh packer for one channel end from the configured buffer size.
pub type PackerFactory = Arc<dyn Fn(usize) -> Result<Box<dyn Packer>, FrameError> + Send + Sync>;

/// Factory producing [`FramePacker`]s.
pub fn default_packer_factory() -> PackerFactory {
    Arc::new(|buffer_size| Ok(Box::new(FramePacker::new(buffer_size)?) as Box<dyn Packer>))
}

/// Default marker + big-endian length framing.
#[derive(Debug)]
pub struct FramePacker {
    buffer_size: usize,
    /// Header bytes collected so far (marker included).
    header: BytesMut,
    /// Length of the in-flight payload, `None` between messages.
    expected: Option<usize>,
    buffer: BytesMut,
}

impl FramePacker {
    pub fn new(buffer_size: usize) -> Result<Self, FrameError> {
        if buffer_size < MIN_BUFFER_SIZE {
            return Err(FrameError::InvalidBufferSize {
                size: buffer_size,
                min: MIN_BUFFER_SIZE,
            });
        }
        Ok(Self {
            buffer_size,
            header: BytesMut::with_capacity(HEADER_LEN),
            expected: None,
            buffer: BytesMut::new(),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Bytes of the in-flight payload received so far.
    pub fn accumulated_len(&self) -> usize {
        self.buffer.len()
    }

    /// Announced length of the in-flight payload.
    pub fn expected_len(&self) -> Option<usize> {
        self.expected
    }

    /// Drop any partially received frame.
    pub fn reset(&mut self) {
        self.header.clear();
        self.buffer.clear();
        self.expected = None;
    }

    fn consume_header<'a>(&mut self, mut rest: &'a [u8], out: &mut Vec<Bytes>) -> &'a [u8] {
        if self.header.is_empty() {
            match rest.iter().position(|b| *b == MESSAGE_START_BYTE) {
                Some(0) => {}
                Some(skip) => {
                    warn!("discarding {} bytes before frame marker", skip);
                    rest = &rest[skip..];
                }
                None => {
                    warn!("discarding {} bytes without frame marker", rest.len());
                    return &[];
                }
            }
        }

        let take = (HEADER_LEN - self.header.len()).min(rest.len());
        self.header.extend_from_slice(&rest[..take]);

        if self.header.len() == HEADER_LEN {
            let h = &self.header;
            let expected = u32::from_be_bytes([h[1], h[2], h[3], h[4]]) as usize;
            self.header.clear();
            self.buffer.reserve(expected.min(MAX_PREALLOC));
            self.expected = Some(expected);
            if expected == 0 {
                self.complete(out);
            }
        }

        &rest[take..]
    }

    fn consume_payload<'a>(
        &mut self,
        rest: &'a [u8],
        expected: usize,
        out: &mut Vec<Bytes>,
    ) -> &'a [u8] {
        let take = (expected - self.buffer.len()).min(rest.len());
        self.buffer.extend_from_slice(&rest[..take]);
        if self.buffer.len() == expected {
            self.complete(out);
        }
        &rest[take..]
    }

    fn complete(&mut self, out: &mut Vec<Bytes>) {
        out.push(self.buffer.split().freeze());
        self.expected = None;
    }
}

impl Packer for FramePacker {
    fn pack(&self, message: &[u8]) -> Result<Vec<Bytes>, FrameError> {
        let length =
            u32::try_from(message.len()).map_err(|_| FrameError::PayloadTooLarge(message.len()))?;

        let mut frame = BytesMut::with_capacity(HEADER_LEN + message.len());
        frame.put_u8(MESSAGE_START_BYTE);
        frame.put_u32(length);
        frame.extend_from_slice(message);

        let mut frame = frame.freeze();
        let mut chunks = Vec::with_capacity(frame.len().div_ceil(self.buffer_size));
        while !frame.is_empty() {
            let size = self.buffer_size.min(frame.len());
            chunks.push(frame.split_to(size));
        }
        Ok(chunks)
    }

    fn unpack(&mut self, fragment: &[u8]) -> Vec<Bytes> {
        let mut out = Vec::new();
        if fragment.is_empty() {
            self.reset();
            return out;
        }

        let mut rest = fragment;
        while !rest.is_empty() {
            rest = match self.expected {
                Some(expected) => self.consume_payload(rest, expected, &mut out),
                None => self.consume_header(rest, &mut out),
            };
        }
        out
    }
}
