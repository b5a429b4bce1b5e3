//! Peer bookkeeping tables.
//!
//! The peer table maps remote addresses to active peers and keeps a
//! compact indexable list for tick iteration. The shutdown table holds
//! peers whose graceful disconnect is awaiting acknowledgement. A peer
//! exists in at most one of the two at any instant; transfers hold both
//! locks in the fixed order peer table, then shutdown table.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::session::peer::Peer;

/// Outcome of a guarded removal.
#[derive(Debug)]
pub(crate) enum RemoveIf {
    /// The entry matched and was removed.
    Removed(Arc<Peer>),
    /// An entry exists but did not match the guard.
    Mismatch,
    /// No entry for this address.
    Missing,
}

#[derive(Default)]
struct Slots {
    index: HashMap<SocketAddr, usize>,
    list: Vec<Arc<Peer>>,
}

impl Slots {
    /// Swap-with-last removal, patching the moved entry's index.
    fn remove_at(&mut self, slot: usize) -> Arc<Peer> {
        let peer = self.list.swap_remove(slot);
        self.index.remove(&peer.addr());

        if let Some(moved) = self.list.get(slot) {
            self.index.insert(moved.addr(), slot);
        }
        peer
    }
}

/// Address-indexed table of active peers, bounded by capacity.
pub(crate) struct PeerTable {
    capacity: usize,
    slots: Mutex<Slots>,
}

impl PeerTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Mutex::new(Slots::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().list.len()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.slots.lock().unwrap().index.contains_key(addr)
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        let slots = self.slots.lock().unwrap();
        slots.index.get(addr).map(|&slot| slots.list[slot].clone())
    }

    /// Insert a peer. Fails when the address is taken or the table is at
    /// capacity.
    pub fn insert(&self, peer: Arc<Peer>) -> bool {
        let mut slots = self.slots.lock().unwrap();

        if slots.list.len() >= self.capacity || slots.index.contains_key(&peer.addr()) {
            return false;
        }
        let slot = slots.list.len();
        slots.index.insert(peer.addr(), slot);
        slots.list.push(peer);

        true
    }

    /// Remove the entry for `addr` if the guard accepts it.
    pub fn remove_if<F>(&self, addr: &SocketAddr, guard: F) -> RemoveIf
    where
        F: FnOnce(&Arc<Peer>) -> bool,
    {
        let mut slots = self.slots.lock().unwrap();

        let Some(&slot) = slots.index.get(addr) else {
            return RemoveIf::Missing;
        };
        if !guard(&slots.list[slot]) {
            return RemoveIf::Mismatch;
        }
        RemoveIf::Removed(slots.remove_at(slot))
    }

    /// Move the given peer into the shutdown table, atomically with
    /// respect to both tables.
    pub fn transfer_to_shutdown(&self, peer: &Arc<Peer>, dst: &ShutdownTable) -> bool {
        let mut slots = self.slots.lock().unwrap();

        let Some(&slot) = slots.index.get(&peer.addr()) else {
            return false;
        };
        if !Arc::ptr_eq(&slots.list[slot], peer) {
            return false;
        }
        let peer = slots.remove_at(slot);
        dst.insert(peer);

        true
    }

    /// The peer in the first slot, if any.
    pub fn first(&self) -> Option<Arc<Peer>> {
        self.slots.lock().unwrap().list.first().cloned()
    }

    /// Append every peer to `out` without dropping its existing content.
    pub fn snapshot(&self, out: &mut Vec<Arc<Peer>>) {
        let slots = self.slots.lock().unwrap();
        out.extend(slots.list.iter().cloned());
    }

    /// Remove and return every peer.
    pub fn take_all(&self) -> Vec<Arc<Peer>> {
        let mut slots = self.slots.lock().unwrap();
        slots.index.clear();
        std::mem::take(&mut slots.list)
    }
}

/// Peers in graceful shutdown, keyed by remote address.
pub(crate) struct ShutdownTable {
    entries: Mutex<HashMap<SocketAddr, Arc<Peer>>>,
}

impl ShutdownTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn insert(&self, peer: Arc<Peer>) {
        self.entries.lock().unwrap().insert(peer.addr(), peer);
    }

    pub fn remove(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        self.entries.lock().unwrap().remove(addr)
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.entries.lock().unwrap().contains_key(addr)
    }

    pub fn snapshot(&self, out: &mut Vec<Arc<Peer>>) {
        let entries = self.entries.lock().unwrap();
        out.extend(entries.values().cloned());
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}
