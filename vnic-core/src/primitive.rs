//! Negotiation primitives exchanged between a consumer and its channel.
//!
//! Requests travel down (consumer to engine), [`Upstream`] messages travel up
//! (engine to consumer). Each request variant carries exactly the fields its
//! primitive needs.

use bytes::Bytes;
use std::fmt;

use crate::addr::{DlsapAddr, MacAddr, DLSAP_ADDR_LEN, MAC_ADDR_LEN};
use crate::envelope::UnitDataInd;
use crate::frame::ETHERMTU;

/// Provider version reported in the info acknowledgment
pub const DL_VERSION_2: u32 = 2;

/// Fixed size of an acknowledgment header, used for queue accounting
const ACK_HEADER_LEN: usize = 32;

/// Per-channel negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DlState {
    /// Not attached to any instance
    #[default]
    Unattached,
    /// Attached, no subscription key
    Unbound,
    /// Bound and ready for data transfer
    Idle,
}

impl fmt::Display for DlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DlState::Unattached => "UNATTACHED",
            DlState::Unbound => "UNBOUND",
            DlState::Idle => "IDLE",
        };
        f.write_str(name)
    }
}

/// Request identifiers, echoed back in acknowledgments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    InfoReq,
    AttachReq,
    DetachReq,
    BindReq,
    UnbindReq,
    PhysAddrReq,
    SetPhysAddrReq,
    PromiscOnReq,
    EnabMultiReq,
    UnitDataReq,
}

/// Control request issued by a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Capability query
    Info,
    /// Attach to the instance identified by `ppa`
    Attach { ppa: u32 },
    Detach,
    /// Bind to a subscription key (0 selects 802.3 / unfiltered matching)
    Bind { sap: u16 },
    Unbind,
    PhysAddr,
    SetPhysAddr { addr: MacAddr },
    PromiscOn,
    /// Accepted for any group; every multicast frame is already delivered
    EnableMulti { addr: MacAddr },
    /// Send `payload` to `dest`. The frame type comes from the channel's own
    /// bound key, not from `dest.sap`.
    UnitData { dest: DlsapAddr, payload: Bytes },
}

impl Request {
    pub fn primitive(&self) -> Primitive {
        match self {
            Request::Info => Primitive::InfoReq,
            Request::Attach { .. } => Primitive::AttachReq,
            Request::Detach => Primitive::DetachReq,
            Request::Bind { .. } => Primitive::BindReq,
            Request::Unbind => Primitive::UnbindReq,
            Request::PhysAddr => Primitive::PhysAddrReq,
            Request::SetPhysAddr { .. } => Primitive::SetPhysAddrReq,
            Request::PromiscOn => Primitive::PromiscOnReq,
            Request::EnableMulti { .. } => Primitive::EnabMultiReq,
            Request::UnitData { .. } => Primitive::UnitDataReq,
        }
    }
}

/// Reasons carried by a negative acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DlError {
    #[error("payload larger than the maximum frame body")]
    BadData,

    #[error("no such instance")]
    BadPpa,

    #[error("primitive issued in improper state")]
    OutState,

    #[error("internal state inconsistency")]
    SysErr,
}

impl DlError {
    /// Numeric reason code as defined by DLPI
    pub fn code(&self) -> u32 {
        match self {
            DlError::BadData => 0x06,
            DlError::BadPpa => 0x08,
            DlError::OutState => 0x11,
            DlError::SysErr => 0x12,
        }
    }
}

/// Control operations outside the negotiation protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ioctl {
    /// Deliver exact Ethernet frames instead of indications
    Raw,
    /// Become the bridging channel of the attached instance
    RegisterBridge,
    UnregisterBridge,
}

/// Capability descriptor returned for [`Request::Info`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoAck {
    pub max_sdu: u32,
    pub min_sdu: u32,
    pub addr_len: u32,
    pub mac_type: MacType,
    pub provider_style: ProviderStyle,
    pub service_mode: ServiceMode,
    pub version: u32,
    pub current_state: DlState,
    /// Channel address; all zero while unattached
    pub addr: DlsapAddr,
    pub broadcast: MacAddr,
}

impl InfoAck {
    pub fn new(current_state: DlState, addr: DlsapAddr) -> Self {
        Self {
            max_sdu: ETHERMTU as u32,
            min_sdu: 0,
            addr_len: DLSAP_ADDR_LEN as u32,
            mac_type: MacType::Ether,
            provider_style: ProviderStyle::Style2,
            service_mode: ServiceMode::Connectionless,
            version: DL_VERSION_2,
            current_state,
            addr,
            broadcast: MacAddr::BROADCAST,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacType {
    Ether,
}

/// Style 2 providers require an explicit attach before bind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStyle {
    Style2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    Connectionless,
}

/// Message delivered up to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    /// Positive acknowledgment carrying the request identifier
    OkAck(Primitive),
    ErrorAck { primitive: Primitive, error: DlError },
    InfoAck(InfoAck),
    BindAck { sap: u16, addr: DlsapAddr },
    PhysAddrAck(MacAddr),
    /// Received frame wrapped for a non-raw consumer
    UnitData(UnitDataInd),
    /// Exact Ethernet frame for a raw consumer
    Frame(Bytes),
    IoctlAck(Ioctl),
    IoctlNak(Ioctl),
}

impl Upstream {
    /// Bytes this message accounts for in a receive queue
    pub fn len(&self) -> usize {
        match self {
            Upstream::Frame(frame) => frame.len(),
            Upstream::UnitData(ind) => ind.len(),
            Upstream::InfoAck(_) => ACK_HEADER_LEN + DLSAP_ADDR_LEN + MAC_ADDR_LEN,
            Upstream::BindAck { .. } => ACK_HEADER_LEN + DLSAP_ADDR_LEN,
            Upstream::PhysAddrAck(_) => ACK_HEADER_LEN + MAC_ADDR_LEN,
            Upstream::OkAck(_)
            | Upstream::ErrorAck { .. }
            | Upstream::IoctlAck(_)
            | Upstream::IoctlNak(_) => ACK_HEADER_LEN,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Data messages are subject to flow control; acknowledgments are not
    pub fn is_data(&self) -> bool {
        matches!(self, Upstream::Frame(_) | Upstream::UnitData(_))
    }

    /// The error code, if this is a negative acknowledgment
    pub fn error(&self) -> Option<DlError> {
        match self {
            Upstream::ErrorAck { error, .. } => Some(*error),
            _ => None,
        }
    }
}
