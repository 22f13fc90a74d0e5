//! Adapter instances.
//!
//! An [`Instance`] is one virtual adapter: a generated hardware address, the
//! list of channels attached to it, and the slot for its bridging channel.
//! Instances live in an [`InstanceTable`] keyed by their port number (PPA).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

use crate::addr::MacAddr;
use crate::channel::{Channel, ChannelHold, ChannelId};
use crate::sync::{lock, read, write};

/// Instance manager errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InstanceError {
    #[error("Instance {0} already exists")]
    Exists(u32),

    #[error("Instance {0} not found")]
    NotFound(u32),

    #[error("Instance {ppa} is busy: {attached} channel(s) still attached")]
    Busy { ppa: u32, attached: usize },
}

/// Channels attached to one instance, in attach order.
///
/// Traversal copies the list under its lock and takes a hold on each
/// channel, then works on the copy with no list lock held.
#[derive(Debug, Default)]
pub struct MemberList {
    members: Mutex<Vec<Arc<Channel>>>,
}

impl MemberList {
    pub(crate) fn insert(&self, channel: Arc<Channel>) {
        lock(&self.members).push(channel);
    }

    /// Remove a channel; returns false if it was not a member
    pub(crate) fn remove(&self, id: ChannelId) -> bool {
        let mut members = lock(&self.members);
        match members.iter().position(|ch| ch.id() == id) {
            Some(index) => {
                members.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.members).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.members).is_empty()
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        lock(&self.members).iter().any(|ch| ch.id() == id)
    }

    /// Held copies of every live member. Channels that are being closed are
    /// skipped.
    pub(crate) fn snapshot(&self) -> Vec<ChannelHold> {
        lock(&self.members).iter().filter_map(Channel::hold).collect()
    }
}

#[derive(Debug, Default)]
struct BridgeSlot {
    channel: Option<Arc<Channel>>,
    /// Drops since the bridge went away; only the first one is announced
    link_warnings: u32,
}

#[derive(Debug)]
pub struct Instance {
    ppa: u32,
    addr: Mutex<MacAddr>,
    members: MemberList,
    bridge: Mutex<BridgeSlot>,
}

impl Instance {
    fn new(ppa: u32, addr: MacAddr) -> Self {
        Self {
            ppa,
            addr: Mutex::new(addr),
            members: MemberList::default(),
            bridge: Mutex::new(BridgeSlot::default()),
        }
    }

    pub fn ppa(&self) -> u32 {
        self.ppa
    }

    pub fn addr(&self) -> MacAddr {
        *lock(&self.addr)
    }

    pub(crate) fn set_addr(&self, addr: MacAddr) {
        *lock(&self.addr) = addr;
    }

    pub fn members(&self) -> &MemberList {
        &self.members
    }

    /// Install `channel` as the bridging channel. Returns the previous one
    /// if a different channel held the slot.
    pub(crate) fn register_bridge(&self, channel: &Arc<Channel>) -> Option<Arc<Channel>> {
        let mut slot = lock(&self.bridge);
        slot.link_warnings = 0;
        let previous = slot.channel.replace(Arc::clone(channel));
        info!("Instance {}: link up (bridge channel {})", self.ppa, channel.id());
        previous.filter(|prev| prev.id() != channel.id())
    }

    /// Clear the bridging slot if `id` holds it
    pub(crate) fn unregister_bridge(&self, id: ChannelId) -> bool {
        let mut slot = lock(&self.bridge);
        if slot.channel.as_ref().map(|ch| ch.id()) == Some(id) {
            slot.channel = None;
            debug!("Instance {}: bridge channel {} unregistered", self.ppa, id);
            true
        } else {
            false
        }
    }

    /// Held reference to the bridging channel, if one is registered and live
    pub(crate) fn bridge(&self) -> Option<ChannelHold> {
        lock(&self.bridge).channel.as_ref().and_then(Channel::hold)
    }

    pub fn bridge_id(&self) -> Option<ChannelId> {
        lock(&self.bridge).channel.as_ref().map(|ch| ch.id())
    }

    /// Count a drop caused by a missing bridge. Returns true for the first
    /// drop since the last registration.
    pub(crate) fn note_link_down(&self) -> bool {
        let mut slot = lock(&self.bridge);
        let first = slot.link_warnings == 0;
        slot.link_warnings = slot.link_warnings.saturating_add(1);
        first
    }

    pub fn link_warnings(&self) -> u32 {
        lock(&self.bridge).link_warnings
    }
}

/// All instances, keyed by PPA
#[derive(Debug, Default)]
pub struct InstanceTable {
    instances: RwLock<BTreeMap<u32, Arc<Instance>>>,
}

impl InstanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an instance with a freshly generated address
    pub fn create(&self, ppa: u32) -> Result<Arc<Instance>, InstanceError> {
        self.create_with_addr(ppa, MacAddr::generate())
    }

    pub fn create_with_addr(&self, ppa: u32, addr: MacAddr) -> Result<Arc<Instance>, InstanceError> {
        let mut instances = write(&self.instances);
        if instances.contains_key(&ppa) {
            return Err(InstanceError::Exists(ppa));
        }
        let instance = Arc::new(Instance::new(ppa, addr));
        instances.insert(ppa, Arc::clone(&instance));
        info!("Instance {} created with address {}", ppa, addr);
        Ok(instance)
    }

    /// Remove an instance. Fails while any channel is attached to it.
    pub fn destroy(&self, ppa: u32) -> Result<(), InstanceError> {
        let mut instances = write(&self.instances);
        let instance = instances.get(&ppa).ok_or(InstanceError::NotFound(ppa))?;
        let attached = instance.members.len();
        if attached > 0 {
            return Err(InstanceError::Busy { ppa, attached });
        }
        instances.remove(&ppa);
        info!("Instance {} destroyed", ppa);
        Ok(())
    }

    pub fn get(&self, ppa: u32) -> Option<Arc<Instance>> {
        read(&self.instances).get(&ppa).cloned()
    }

    /// Look up `ppa` and add `channel` to its member list in one step, so a
    /// concurrent destroy cannot slip in between.
    pub(crate) fn attach(&self, ppa: u32, channel: &Arc<Channel>) -> Option<Arc<Instance>> {
        let instances = read(&self.instances);
        let instance = instances.get(&ppa)?;
        instance.members.insert(Arc::clone(channel));
        Some(Arc::clone(instance))
    }

    pub fn ppas(&self) -> Vec<u32> {
        read(&self.instances).keys().copied().collect()
    }
}
