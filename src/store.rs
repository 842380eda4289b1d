use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::packet::Packet;

/// Number of recent packets retained for late-joining viewers
pub const DEFAULT_STORE_CAPACITY: usize = 100;

/// Bounded history of the most recent packets.
/// Writers are serialized against snapshot readers; entries are shared
/// immutably so a snapshot stays valid after the ring evicts them.
#[derive(Debug)]
pub struct PacketStore {
    packets: RwLock<VecDeque<Arc<Packet>>>,
    capacity: usize,
}

impl PacketStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_STORE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        // A zero-sized history would make every append a no-op
        let capacity = capacity.max(1);
        Self {
            packets: RwLock::new(VecDeque::with_capacity(capacity + 1)),
            capacity,
        }
    }

    /// Append at the tail, evicting the oldest entries past capacity
    pub fn append(&self, packet: Arc<Packet>) {
        let mut packets = self.packets.write();
        packets.push_back(packet);
        while packets.len() > self.capacity {
            packets.pop_front();
        }
    }

    /// Copy of the current contents in insertion order
    pub fn snapshot(&self) -> Vec<Arc<Packet>> {
        self.packets.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.packets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for PacketStore {
    fn default() -> Self {
        Self::new()
    }
}
