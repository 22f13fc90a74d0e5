//! Ethernet framing.
//!
//! The engine only ever looks at the 14-byte link header: destination,
//! source and the type/length field. Values up to [`ETHERMTU`] in that field
//! are an 802.3 length, anything larger is an Ethernet II type.

use bytes::{BufMut, Bytes, BytesMut};

use crate::addr::{MacAddr, MAC_ADDR_LEN};

/// Size of the Ethernet link header
pub const ETHER_HEADER_LEN: usize = 14;

/// Maximum payload size (also the largest 802.3 length value)
pub const ETHERMTU: usize = 1500;

/// Maximum frame size without FCS
pub const ETHERMAX: usize = ETHER_HEADER_LEN + ETHERMTU;

/// Frame parsing errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Runt frame: {0} bytes is shorter than the {ETHER_HEADER_LEN}-byte link header")]
    Runt(usize),
}

/// Parsed Ethernet link header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EtherHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    /// Type (Ethernet II) or length (802.3)
    pub ethertype: u16,
}

impl EtherHeader {
    pub fn new(dst: MacAddr, src: MacAddr, ethertype: u16) -> Self {
        Self { dst, src, ethertype }
    }

    /// Parse the link header at the start of `frame`
    pub fn parse(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() < ETHER_HEADER_LEN {
            return Err(FrameError::Runt(frame.len()));
        }
        let mut dst = [0u8; MAC_ADDR_LEN];
        let mut src = [0u8; MAC_ADDR_LEN];
        dst.copy_from_slice(&frame[0..6]);
        src.copy_from_slice(&frame[6..12]);
        Ok(Self {
            dst: MacAddr(dst),
            src: MacAddr(src),
            ethertype: u16::from_be_bytes([frame[12], frame[13]]),
        })
    }

    /// Encode to wire bytes (network byte order)
    pub fn encode(&self) -> [u8; ETHER_HEADER_LEN] {
        let mut buf = [0u8; ETHER_HEADER_LEN];
        buf[0..6].copy_from_slice(&self.dst.0);
        buf[6..12].copy_from_slice(&self.src.0);
        buf[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
        buf
    }

    /// The type/length field holds an 802.3 length rather than a type
    pub fn is_length_field(&self) -> bool {
        usize::from(self.ethertype) <= ETHERMTU
    }
}

/// Type/length value for an outbound frame sent by a channel bound to `sap`.
///
/// A key above [`ETHERMTU`] goes out as the Ethernet II type; otherwise the
/// frame is 802.3 and carries the payload length.
pub fn outbound_type_field(sap: u16, payload_len: usize) -> u16 {
    if sap != 0 && usize::from(sap) > ETHERMTU {
        sap
    } else {
        payload_len.min(usize::from(u16::MAX)) as u16
    }
}

/// Assemble a frame from a header and a payload
pub fn build_frame(header: &EtherHeader, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ETHER_HEADER_LEN + payload.len());
    buf.put_slice(&header.encode());
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: MacAddr = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    const B: MacAddr = MacAddr::new([0x02, 0, 0, 0, 0, 0x01]);

    #[test]
    fn test_header_encode_decode() {
        let header = EtherHeader::new(A, B, 0x0806);
        let frame = build_frame(&header, &[1, 2, 3]);

        assert_eq!(frame.len(), ETHER_HEADER_LEN + 3);
        assert_eq!(&frame[12..14], &[0x08, 0x06]);
        assert_eq!(EtherHeader::parse(&frame), Ok(header));
    }

    #[test]
    fn test_runt_frame() {
        assert_eq!(EtherHeader::parse(&[0u8; 13]), Err(FrameError::Runt(13)));
    }

    #[test]
    fn test_length_field_boundary() {
        assert!(EtherHeader::new(A, B, 1500).is_length_field());
        assert!(!EtherHeader::new(A, B, 1501).is_length_field());
        assert!(!EtherHeader::new(A, B, 0x0800).is_length_field());
    }

    #[test]
    fn test_outbound_type_field() {
        // Ethernet II
        assert_eq!(outbound_type_field(0x0800, 64), 0x0800);
        // unbound / 802.3 keys carry the payload length
        assert_eq!(outbound_type_field(0, 64), 64);
        assert_eq!(outbound_type_field(1500, 46), 46);
        assert_eq!(outbound_type_field(0x42, 100), 100);
    }
}
