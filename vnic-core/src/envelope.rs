//! Unit-data indication: the wrapper a non-raw consumer receives for each
//! inbound frame.
//!
//! The control segment carries the destination and source DLSAP addresses
//! taken from the link header; the data segment is the frame with its link
//! header stripped. One indication is built per inbound frame and shared by
//! every non-raw recipient (the payload is a reference-counted slice).

use bytes::{BufMut, Bytes, BytesMut};

use crate::addr::{DlsapAddr, DLSAP_ADDR_LEN};
use crate::frame::{EtherHeader, FrameError, ETHER_HEADER_LEN};

/// Size of the encoded control segment
pub const CONTROL_LEN: usize = 2 * DLSAP_ADDR_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDataInd {
    pub dest: DlsapAddr,
    pub src: DlsapAddr,
    /// Destination was a group (multicast or broadcast) address
    pub group: bool,
    /// Frame contents after the link header
    pub payload: Bytes,
}

impl UnitDataInd {
    /// Build an indication from a complete frame.
    ///
    /// Both addresses carry the frame's type/length value as their key.
    pub fn build(frame: &Bytes) -> Result<Self, FrameError> {
        let header = EtherHeader::parse(frame)?;
        Ok(Self::from_parts(&header, frame.slice(ETHER_HEADER_LEN..)))
    }

    pub fn from_parts(header: &EtherHeader, payload: Bytes) -> Self {
        Self {
            dest: DlsapAddr::new(header.dst, header.ethertype),
            src: DlsapAddr::new(header.src, header.ethertype),
            group: header.dst.is_multicast(),
            payload,
        }
    }

    /// Encode the control segment: destination then source address
    pub fn encode_control(&self) -> [u8; CONTROL_LEN] {
        let mut buf = [0u8; CONTROL_LEN];
        buf[..DLSAP_ADDR_LEN].copy_from_slice(&self.dest.encode());
        buf[DLSAP_ADDR_LEN..].copy_from_slice(&self.src.encode());
        buf
    }

    /// Control segment followed by the payload
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        buf.put_slice(&self.encode_control());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn len(&self) -> usize {
        CONTROL_LEN + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Lazily built indication shared across one fan-out pass
#[derive(Debug, Default)]
pub(crate) struct LazyEnvelope {
    built: Option<UnitDataInd>,
}

impl LazyEnvelope {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Return the indication for `frame`, building it on first use
    pub(crate) fn get_or_build(&mut self, header: &EtherHeader, frame: &Bytes) -> &UnitDataInd {
        self.built.get_or_insert_with(|| {
            UnitDataInd::from_parts(header, frame.slice(ETHER_HEADER_LEN..))
        })
    }

    #[cfg(test)]
    pub(crate) fn is_built(&self) -> bool {
        self.built.is_some()
    }
}
