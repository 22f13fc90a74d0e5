//! Frame distribution.
//!
//! Inbound fan-out hands one copy of a frame to every eligible channel of an
//! instance. Eligibility is decided by [`is_eligible`], which applies its
//! match rules in a fixed order; the first rule that matches decides.
//!
//! Outbound frames reach the bridging channel through [`send_to_bridge`].

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::addr::MacAddr;
use crate::budget::Budget;
use crate::channel::ChannelFlags;
use crate::control::Counters;
use crate::envelope::LazyEnvelope;
use crate::frame::EtherHeader;
use crate::instance::Instance;
use crate::primitive::Upstream;

/// Whether a channel bound to `sap` with `flags` should receive a frame
/// with `header` on an instance whose address is `own_addr`.
pub fn is_eligible(sap: u16, flags: ChannelFlags, header: &EtherHeader, own_addr: MacAddr) -> bool {
    // the bridge gets frames through the outbound path only
    if flags.contains(ChannelFlags::SERVICE) {
        return false;
    }
    if sap == 0 && flags.contains(ChannelFlags::PROMISC) {
        return true;
    }
    // 802.3 length field
    if header.is_length_field() && sap == 0 {
        return true;
    }
    if sap != header.ethertype {
        return false;
    }
    // our own transmission seen on loopback
    if header.src == own_addr {
        return false;
    }
    if header.dst == own_addr {
        return true;
    }
    header.dst.is_broadcast() || header.dst.is_multicast()
}

/// Deliver `frame` to every eligible channel attached to `instance`.
/// Returns the number of copies delivered.
///
/// A recipient whose receive queue is full, or for which no message space
/// can be charged, is skipped; the pass continues with the others.
pub(crate) fn fan_out(
    instance: &Instance,
    frame: &Bytes,
    budget: &Arc<Budget>,
    counters: &Counters,
) -> usize {
    let header = match EtherHeader::parse(frame) {
        Ok(header) => header,
        Err(e) => {
            debug!("Instance {}: {}", instance.ppa(), e);
            Counters::bump(&counters.runt_dropped);
            return 0;
        }
    };
    let own_addr = instance.addr();
    let mut envelope = LazyEnvelope::new();
    let mut delivered = 0;

    for channel in instance.members().snapshot() {
        let (sap, flags) = {
            let st = channel.state();
            (st.sap, st.flags)
        };
        if !is_eligible(sap, flags, &header, own_addr) {
            continue;
        }

        if !channel.can_put() {
            debug!(
                "Instance {}: channel {} (sap 0x{:04x}) is full, skipping",
                instance.ppa(),
                channel.id(),
                sap
            );
            Counters::bump(&counters.skipped_backpressure);
            continue;
        }

        let msg = if flags.contains(ChannelFlags::RAW) {
            Upstream::Frame(frame.clone())
        } else {
            Upstream::UnitData(envelope.get_or_build(&header, frame).clone())
        };

        let Some(charge) = budget.try_charge(msg.len()) else {
            warn!(
                "Instance {}: no message space for channel {}, dropping {}-byte frame",
                instance.ppa(),
                channel.id(),
                frame.len()
            );
            Counters::bump(&counters.skipped_exhausted);
            continue;
        };

        channel.put(msg, Some(charge));
        Counters::bump(&counters.delivered);
        delivered += 1;
    }

    delivered
}

/// Hand an outbound frame to the instance's bridging channel.
///
/// With no bridge registered the frame is dropped; only the first such drop
/// since the last registration is announced.
pub(crate) fn send_to_bridge(instance: &Instance, frame: Bytes, counters: &Counters) -> bool {
    let Some(bridge) = instance.bridge() else {
        if instance.note_link_down() {
            info!("Instance {}: link down (is the bridge running?)", instance.ppa());
        }
        Counters::bump(&counters.bridge_dropped);
        return false;
    };

    if !bridge.can_put() {
        debug!(
            "Instance {}: bridge channel {} is full, dropping frame",
            instance.ppa(),
            bridge.id()
        );
        Counters::bump(&counters.bridge_dropped);
        return false;
    }

    bridge.put(Upstream::Frame(frame), None);
    Counters::bump(&counters.bridge_forwarded);
    true
}
