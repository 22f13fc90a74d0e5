//! Wire format between the bridging daemon and the hub.
//!
//! The bridge relays whole Ethernet frames over a TCP byte stream. Every
//! frame travels as one record, with all multi-byte fields in network byte
//! order (big-endian).
//!
//! # Record Format
//!
//! - Padded length (4 bytes): frame length rounded up to a multiple of 4
//! - Original length (4 bytes): frame length before padding
//! - Frame (variable): the Ethernet frame
//! - Padding (0-3 bytes): zeroes up to the padded length
//!
//! Total header size: 8 bytes + padded frame
//!
//! Records are batched by [`SendBatcher`] and split back out of the stream
//! by [`RecordDecoder`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub use crate::frame::{ETHERMAX, ETHERMTU};

/// Size of the record header
pub const RECORD_HEADER_LEN: usize = 8;

/// Records are padded to a multiple of this
pub const RECORD_ALIGN: usize = 4;

/// Largest padded length accepted from the stream
pub const MAX_RECORD_LEN: usize = 32768;

/// Default flush threshold for buffered records (two full frames)
pub const SENDBUF_THRESHOLD: usize = 2 * ETHERMAX;

/// Padding needed after a frame of `len` bytes
pub fn padding_for(len: usize) -> usize {
    match (RECORD_HEADER_LEN + len) % RECORD_ALIGN {
        0 => 0,
        remain => RECORD_ALIGN - remain,
    }
}

/// Record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Frame length including padding
    pub padded_len: u32,
    /// Frame length before padding
    pub orig_len: u32,
}

impl RecordHeader {
    /// Header for a frame of `len` bytes
    pub fn for_frame(len: usize) -> Self {
        Self {
            padded_len: (len + padding_for(len)) as u32,
            orig_len: len as u32,
        }
    }

    /// Encode header to bytes (network byte order)
    pub fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut buf = [0u8; RECORD_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.padded_len.to_be_bytes());
        buf[4..8].copy_from_slice(&self.orig_len.to_be_bytes());
        buf
    }

    /// Decode and validate a header (network byte order)
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < RECORD_HEADER_LEN {
            return Err(ProtocolError::InvalidLength {
                expected: RECORD_HEADER_LEN,
                actual: buf.len(),
            });
        }
        let header = Self {
            padded_len: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            orig_len: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        };
        header.validate()?;
        Ok(header)
    }

    /// Validate header fields
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let padded = self.padded_len as usize;
        let orig = self.orig_len as usize;
        if padded > MAX_RECORD_LEN {
            return Err(ProtocolError::RecordTooLarge(padded));
        }
        if padded % RECORD_ALIGN != 0 {
            return Err(ProtocolError::Misaligned(padded));
        }
        if orig > padded || padded - orig >= RECORD_ALIGN {
            return Err(ProtocolError::BadPadding { padded, orig });
        }
        Ok(())
    }

    /// Header plus padded frame
    pub fn record_len(&self) -> usize {
        RECORD_HEADER_LEN + self.padded_len as usize
    }
}

/// Append one record for `frame` to `buf`
pub fn encode_record(frame: &[u8], buf: &mut BytesMut) {
    let header = RecordHeader::for_frame(frame.len());
    buf.reserve(header.record_len());
    buf.put_slice(&header.encode());
    buf.put_slice(frame);
    buf.put_bytes(0, header.padded_len as usize - frame.len());
}

/// Splits a byte stream back into frames
#[derive(Debug, Default)]
pub struct RecordDecoder {
    buf: BytesMut,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, `Ok(None)` if more bytes are needed.
    ///
    /// A malformed header is an error; the stream cannot be resynchronized.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.buf.len() < RECORD_HEADER_LEN {
            return Ok(None);
        }
        let header = RecordHeader::decode(&self.buf[..RECORD_HEADER_LEN])?;
        if self.buf.len() < header.record_len() {
            return Ok(None);
        }
        self.buf.advance(RECORD_HEADER_LEN);
        let mut record = self.buf.split_to(header.padded_len as usize);
        record.truncate(header.orig_len as usize);
        Ok(Some(record.freeze()))
    }

    /// Bytes buffered but not yet returned
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Accumulates records until they should be written out.
///
/// A frame shorter than [`ETHERMAX`] is taken as the end of a burst and
/// asks for an immediate flush, as does a buffer above the threshold.
#[derive(Debug)]
pub struct SendBatcher {
    buf: BytesMut,
    threshold: usize,
}

impl SendBatcher {
    pub fn new(threshold: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(threshold + RECORD_HEADER_LEN + ETHERMAX),
            threshold,
        }
    }

    /// Queue one frame. Returns true if the buffer should be flushed now.
    pub fn push(&mut self, frame: &[u8]) -> bool {
        encode_record(frame, &mut self.buf);
        frame.len() < ETHERMAX || self.buf.len() > self.threshold
    }

    /// Take everything buffered so far
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for SendBatcher {
    fn default() -> Self {
        Self::new(SENDBUF_THRESHOLD)
    }
}

/// Protocol-related errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid record length: expected at least {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Record too large: {0} bytes (max {MAX_RECORD_LEN})")]
    RecordTooLarge(usize),

    #[error("Padded length {0} is not a multiple of {RECORD_ALIGN}")]
    Misaligned(usize),

    #[error("Bad padding: padded length {padded}, original length {orig}")]
    BadPadding { padded: usize, orig: usize },
}
