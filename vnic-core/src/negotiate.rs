//! Negotiation state machine.
//!
//! ```text
//!  UNATTACHED --attach--> UNBOUND --bind--> IDLE
//!  UNATTACHED <--detach-- UNBOUND <--unbind-- IDLE
//! ```
//!
//! Each request is checked against the channel's current state. A request
//! issued in the wrong state is refused with OUTSTATE and changes nothing.
//! A channel that claims to be attached but has lost its instance link is
//! reported as an inconsistency (SYSERR).

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::addr::{DlsapAddr, MacAddr};
use crate::budget::{Budget, Charge};
use crate::channel::{Channel, ChannelFlags};
use crate::frame::{build_frame, outbound_type_field, EtherHeader, ETHERMTU};
use crate::instance::InstanceTable;
use crate::primitive::{DlError, DlState, InfoAck, Ioctl, Primitive, Request, Upstream};

/// What the engine must do after a request has been handled
#[derive(Debug)]
pub(crate) enum Step {
    /// Acknowledgment built from the request itself; always delivered
    Reply(Upstream),
    /// Acknowledgment that needed its own buffer
    Alloc(Upstream, Charge),
    /// No buffer for the acknowledgment: the request is dropped unanswered
    Dropped(Primitive),
    /// Outbound frame for the channel's write queue
    Transmit(Bytes),
    /// Attached state without an instance link
    Inconsistent(Primitive),
}

fn error_ack(primitive: Primitive, error: DlError) -> Step {
    Step::Reply(Upstream::ErrorAck { primitive, error })
}

fn charged(budget: &Arc<Budget>, primitive: Primitive, msg: Upstream) -> Step {
    match budget.try_charge(msg.len()) {
        Some(charge) => Step::Alloc(msg, charge),
        None => Step::Dropped(primitive),
    }
}

/// Handle one control request on `channel`
pub(crate) fn handle(
    channel: &Arc<Channel>,
    instances: &InstanceTable,
    budget: &Arc<Budget>,
    req: Request,
) -> Step {
    let primitive = req.primitive();
    debug!("Channel {}: {:?}", channel.id(), primitive);

    match req {
        Request::Info => info(channel, budget),
        Request::Attach { ppa } => attach(channel, instances, ppa),
        Request::Detach => detach(channel),
        Request::Bind { sap } => bind(channel, budget, sap),
        Request::Unbind => unbind(channel),
        Request::PhysAddr => phys_addr(channel, budget),
        Request::SetPhysAddr { addr } => set_phys_addr(channel, addr),
        Request::PromiscOn => {
            channel.state().flags.insert(ChannelFlags::PROMISC);
            Step::Reply(Upstream::OkAck(primitive))
        }
        Request::EnableMulti { addr } => {
            debug!("Channel {}: multicast {} enabled", channel.id(), addr);
            Step::Reply(Upstream::OkAck(primitive))
        }
        Request::UnitData { dest, payload } => unit_data(channel, dest, payload),
    }
}

fn info(channel: &Channel, budget: &Arc<Budget>) -> Step {
    let ack = {
        let st = channel.state();
        let addr = match (st.dl_state, st.instance()) {
            (DlState::Unattached, _) | (_, None) => DlsapAddr::default(),
            (_, Some(instance)) => DlsapAddr::new(instance.addr(), st.sap),
        };
        InfoAck::new(st.dl_state, addr)
    };
    charged(budget, Primitive::InfoReq, Upstream::InfoAck(ack))
}

fn attach(channel: &Arc<Channel>, instances: &InstanceTable, ppa: u32) -> Step {
    let mut st = channel.state();
    if st.dl_state != DlState::Unattached {
        return error_ack(Primitive::AttachReq, DlError::OutState);
    }
    let Some(instance) = instances.attach(ppa, channel) else {
        debug!("Channel {}: instance {} does not exist", channel.id(), ppa);
        return error_ack(Primitive::AttachReq, DlError::BadPpa);
    };
    st.instance = Some(Arc::downgrade(&instance));
    st.dl_state = DlState::Unbound;
    Step::Reply(Upstream::OkAck(Primitive::AttachReq))
}

fn detach(channel: &Channel) -> Step {
    let mut st = channel.state();
    if st.dl_state != DlState::Unbound {
        return error_ack(Primitive::DetachReq, DlError::OutState);
    }
    let Some(instance) = st.instance() else {
        return Step::Inconsistent(Primitive::DetachReq);
    };
    instance.members().remove(channel.id());
    if instance.unregister_bridge(channel.id()) {
        debug!("Instance {}: bridge channel {} detached", instance.ppa(), channel.id());
        st.flags.remove(ChannelFlags::SERVICE);
        channel.reset_recv_hiwat();
    }
    st.instance = None;
    st.dl_state = DlState::Unattached;
    Step::Reply(Upstream::OkAck(Primitive::DetachReq))
}

fn bind(channel: &Channel, budget: &Arc<Budget>, sap: u16) -> Step {
    let mut st = channel.state();
    if st.dl_state != DlState::Unbound {
        return error_ack(Primitive::BindReq, DlError::OutState);
    }
    let Some(instance) = st.instance() else {
        return Step::Inconsistent(Primitive::BindReq);
    };
    let addr = DlsapAddr::new(instance.addr(), sap);
    let step = charged(budget, Primitive::BindReq, Upstream::BindAck { sap, addr });
    if matches!(step, Step::Alloc(..)) {
        st.sap = sap;
        st.dl_state = DlState::Idle;
    }
    step
}

fn unbind(channel: &Channel) -> Step {
    let mut st = channel.state();
    if st.dl_state != DlState::Idle {
        return error_ack(Primitive::UnbindReq, DlError::OutState);
    }
    st.sap = 0;
    st.dl_state = DlState::Unbound;
    Step::Reply(Upstream::OkAck(Primitive::UnbindReq))
}

fn phys_addr(channel: &Channel, budget: &Arc<Budget>) -> Step {
    let st = channel.state();
    if st.dl_state == DlState::Unattached {
        return error_ack(Primitive::PhysAddrReq, DlError::OutState);
    }
    let Some(instance) = st.instance() else {
        return Step::Inconsistent(Primitive::PhysAddrReq);
    };
    charged(budget, Primitive::PhysAddrReq, Upstream::PhysAddrAck(instance.addr()))
}

fn set_phys_addr(channel: &Channel, addr: MacAddr) -> Step {
    let st = channel.state();
    if st.dl_state == DlState::Unattached {
        return error_ack(Primitive::SetPhysAddrReq, DlError::OutState);
    }
    let Some(instance) = st.instance() else {
        return Step::Inconsistent(Primitive::SetPhysAddrReq);
    };
    instance.set_addr(addr);
    debug!("Instance {}: address set to {}", instance.ppa(), addr);
    Step::Reply(Upstream::OkAck(Primitive::SetPhysAddrReq))
}

fn unit_data(channel: &Channel, dest: DlsapAddr, payload: Bytes) -> Step {
    let st = channel.state();
    if st.dl_state != DlState::Idle {
        return error_ack(Primitive::UnitDataReq, DlError::OutState);
    }
    let Some(instance) = st.instance() else {
        return Step::Inconsistent(Primitive::UnitDataReq);
    };
    if payload.len() > ETHERMTU {
        debug!("Channel {}: {}-byte payload refused", channel.id(), payload.len());
        return error_ack(Primitive::UnitDataReq, DlError::BadData);
    }
    // the channel's own key decides the type field, whatever dest.sap says
    let header = EtherHeader::new(
        dest.mac,
        instance.addr(),
        outbound_type_field(st.sap, payload.len()),
    );
    Step::Transmit(build_frame(&header, &payload))
}

/// Handle a control operation. Never fails with a negotiation error: the
/// result is an ack or a nak.
pub(crate) fn ioctl(channel: &Arc<Channel>, op: Ioctl, bridge_recv_hiwat: usize) -> Upstream {
    match op {
        Ioctl::Raw => {
            channel.state().flags.insert(ChannelFlags::RAW);
            Upstream::IoctlAck(op)
        }
        Ioctl::RegisterBridge => {
            let instance = {
                let mut st = channel.state();
                let Some(instance) = st.instance() else {
                    debug!("Channel {}: bridge registration before attach", channel.id());
                    return Upstream::IoctlNak(op);
                };
                st.flags.insert(ChannelFlags::SERVICE);
                instance
            };
            channel.set_recv_hiwat(bridge_recv_hiwat);
            if let Some(previous) = instance.register_bridge(channel) {
                warn!(
                    "Instance {}: bridge channel {} replaced by channel {}",
                    instance.ppa(),
                    previous.id(),
                    channel.id()
                );
                previous.state().flags.remove(ChannelFlags::SERVICE);
                previous.reset_recv_hiwat();
            }
            Upstream::IoctlAck(op)
        }
        Ioctl::UnregisterBridge => {
            let instance = {
                let mut st = channel.state();
                st.flags.remove(ChannelFlags::SERVICE);
                st.instance()
            };
            if let Some(instance) = instance {
                instance.unregister_bridge(channel.id());
            }
            channel.reset_recv_hiwat();
            Upstream::IoctlAck(op)
        }
    }
}
