use std::{
    hash::Hash,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};

use crate::burrow::comm::{
    forwarder::Forwarder,
    listener::{TcpListener, UdpListener},
    route::RouteTable,
    session::Comm,
    tunnel::Tunnel,
};

/// An ID-keyed map with its own lock.
///
/// `add` overwrites an existing entry (last writer wins). Lookups clone the
/// value out so no shard lock is held across I/O.
pub struct Registry<K, V> {
    items: DashMap<K, V>,
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            items: DashMap::new(),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn add(&self, key: K, value: V) -> Option<V> {
        self.items.insert(key, value)
    }

    /// Inserts `value` only if `key` is free. The check and the insert happen
    /// under one shard lock; a taken key hands `value` back.
    pub fn try_add(&self, key: K, value: V) -> Result<(), V> {
        match self.items.entry(key) {
            Entry::Occupied(_) => Err(value),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.items.get(key).map(|v| v.value().clone())
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.items.remove(key).map(|(_, v)| v)
    }

    /// Removes `key` only if `pred` holds for the stored value.
    pub fn remove_if(&self, key: &K, pred: impl FnOnce(&V) -> bool) -> Option<V> {
        self.items.remove_if(key, |_, v| pred(v)).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.items.contains_key(key)
    }

    pub fn all(&self) -> Vec<V> {
        self.items.iter().map(|e| e.value().clone()).collect()
    }

    pub fn keys(&self) -> Vec<K> {
        self.items.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// All Comm-layer registries, injected into every component that needs them.
#[derive(Default)]
pub struct Registries {
    pub comms: Registry<u32, Arc<Comm>>,
    pub routes: RouteTable,
    pub tcp_listeners: Registry<String, Arc<TcpListener>>,
    pub udp_listeners: Registry<String, Arc<UdpListener>>,
    pub forwarders: Registry<String, Arc<dyn Forwarder>>,
    pub tunnels: Registry<u64, Arc<Tunnel>>,
    comm_seq: AtomicU32,
    session_seq: AtomicU32,
}

impl Registries {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn next_comm_id(&self) -> u32 {
        self.comm_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn next_session_id(&self) -> u32 {
        self.session_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The Comm owned by a peer session.
    pub fn comm_by_session(&self, session_id: u32) -> Option<Arc<Comm>> {
        self.comms
            .all()
            .into_iter()
            .find(|c| c.session_id() == session_id)
    }
}
