//! Channel registry.
//!
//! Slot table indexed by channel identifier. Lookups take the table's read
//! lock just long enough to clone the slot and take a hold on the channel, so
//! concurrent lookups never serialize behind each other and no lock is held
//! while the caller works with the channel. Release blocks until all holds
//! are gone, without any table lock held, then frees the slot.

use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::channel::{Channel, ChannelHold, ChannelId};
use crate::sync::{read, write};

/// Registry errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Channel {0} not found")]
    NotFound(ChannelId),
}

#[derive(Debug, Default)]
pub struct Registry {
    slots: RwLock<Vec<Option<Arc<Channel>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a channel in the lowest free slot
    pub fn allocate(&self, recv_hiwat: usize) -> Arc<Channel> {
        let mut slots = write(&self.slots);
        let id = match slots.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                slots.push(None);
                slots.len() - 1
            }
        };
        let channel = Arc::new(Channel::new(id, recv_hiwat));
        slots[id] = Some(Arc::clone(&channel));
        debug!("Allocated channel {}", id);
        channel
    }

    /// Look up a live channel and take a hold on it. The hold must be
    /// dropped before the channel can be released.
    pub fn find_by_id(&self, id: ChannelId) -> Result<ChannelHold, RegistryError> {
        let slots = read(&self.slots);
        slots
            .get(id)
            .and_then(Option::as_ref)
            .and_then(Channel::hold)
            .ok_or(RegistryError::NotFound(id))
    }

    /// Tear down a channel: refuse new holds, wait for outstanding ones to
    /// drain, then free the slot so the identifier can be reused.
    pub fn release(&self, id: ChannelId) -> Result<(), RegistryError> {
        let channel = {
            let slots = read(&self.slots);
            slots
                .get(id)
                .and_then(Option::as_ref)
                .cloned()
                .ok_or(RegistryError::NotFound(id))?
        };
        if !channel.begin_close() {
            return Err(RegistryError::NotFound(id));
        }

        channel.wait_drained();

        let mut slots = write(&self.slots);
        if let Some(slot) = slots.get_mut(id) {
            *slot = None;
        }
        while matches!(slots.last(), Some(None)) {
            slots.pop();
        }
        debug!("Released channel {}", id);
        Ok(())
    }

    /// Number of live channels (including ones being released)
    pub fn len(&self) -> usize {
        read(&self.slots).iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identifiers currently allocated, in ascending order
    pub fn ids(&self) -> Vec<ChannelId> {
        read(&self.slots)
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|_| id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_lowest_free_id() {
        let reg = Registry::new();
        let ids: Vec<_> = (0..4).map(|_| reg.allocate(1024).id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);

        reg.release(1).expect("release 1");
        reg.release(2).expect("release 2");
        assert_eq!(reg.ids(), vec![0, 3]);

        assert_eq!(reg.allocate(1024).id(), 1);
        assert_eq!(reg.allocate(1024).id(), 2);
        assert_eq!(reg.allocate(1024).id(), 4);
    }

    #[test]
    fn test_release_unknown() {
        let reg = Registry::new();
        assert_eq!(reg.release(7), Err(RegistryError::NotFound(7)));

        reg.allocate(1024);
        reg.release(0).expect("release");
        assert_eq!(reg.release(0), Err(RegistryError::NotFound(0)));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_find_takes_hold() {
        let reg = Registry::new();
        let ch = reg.allocate(1024);

        let hold = reg.find_by_id(0).expect("find");
        assert_eq!(hold.id(), 0);
        assert_eq!(ch.hold_count(), 1);
        drop(hold);
        assert_eq!(ch.hold_count(), 0);

        assert!(matches!(reg.find_by_id(5), Err(RegistryError::NotFound(5))));
    }

    #[test]
    fn test_release_waits_for_holds() {
        let reg = Arc::new(Registry::new());
        reg.allocate(1024);
        let hold = reg.find_by_id(0).expect("find");

        let releaser = {
            let reg = Arc::clone(&reg);
            thread::spawn(move || reg.release(0))
        };
        thread::sleep(Duration::from_millis(20));

        // still allocated, but no new holds while closing
        assert!(!releaser.is_finished());
        assert_eq!(reg.ids(), vec![0]);
        assert!(reg.find_by_id(0).is_err());
        // a new open does not get the id being released
        assert_eq!(reg.allocate(1024).id(), 1);

        drop(hold);
        releaser
            .join()
            .expect("releaser panicked")
            .expect("release failed");
        assert_eq!(reg.ids(), vec![1]);
        assert_eq!(reg.allocate(1024).id(), 0);
    }
}
