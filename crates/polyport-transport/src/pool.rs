//! Fixed-capacity pool of upper-layer connection objects.
//!
//! Slots never move, so a [`ConnectionHandle`] stays cheap to resolve. Each
//! slot carries a generation that changes on release, which makes handles
//! held across a disconnect harmless: they simply stop resolving.
//!
//! After every operation:
//! 1. each slot is either in the free queue or in the active list, never both;
//! 2. the key map contains exactly the keys of the active connections;
//! 3. the active list holds no duplicates and each entry knows its position.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;

use polyport_config::Protocol;

use crate::aggregator::ConnectionKey;

/// Stable reference to a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    slot: u32,
    generation: u32,
}

impl ConnectionHandle {
    /// Slot index in the pool.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Generation of the slot when the handle was issued.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.slot, self.generation)
    }
}

/// A connection as the upper layer sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    handle: ConnectionHandle,
    key: ConnectionKey,
    protocol: Protocol,
    remote: Option<SocketAddr>,
    max_payload: usize,
}

impl Connection {
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    /// Backend connection this object stands for.
    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    /// Protocol the connection runs over.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Remote endpoint, when the backend reports one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Largest payload that can be sent in one call.
    pub fn max_payload_size(&self) -> usize {
        self.max_payload
    }
}

/// Whether a slot currently holds a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Active,
}

/// Errors from [`ConnectionPool::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// Every slot is in use.
    #[error("connection pool is full ({capacity} slots)")]
    Full {
        /// Pool capacity.
        capacity: usize,
    },

    /// The backend connection already has a pooled object.
    #[error("connection {0} is already pooled")]
    DuplicateKey(ConnectionKey),
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Total slots.
    pub capacity: usize,
    /// Slots holding a connection.
    pub active: usize,
    /// Slots ready for reuse.
    pub free: usize,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    connection: Option<Connection>,
    active_pos: usize,
}

/// Arena of connection slots with a free queue and an active list.
#[derive(Debug)]
pub struct ConnectionPool {
    slots: Vec<Slot>,
    free: VecDeque<u32>,
    active: Vec<u32>,
    by_key: HashMap<ConnectionKey, u32>,
}

impl ConnectionPool {
    /// Pool with `capacity` slots, all free.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
            free: (0..capacity as u32).collect(),
            active: Vec::with_capacity(capacity),
            by_key: HashMap::with_capacity(capacity),
        }
    }

    /// Take a free slot for the backend connection `key`.
    ///
    /// Free slots are reused oldest-released first.
    pub fn acquire(
        &mut self,
        key: ConnectionKey,
        protocol: Protocol,
        remote: Option<SocketAddr>,
        max_payload: usize,
    ) -> Result<ConnectionHandle, PoolError> {
        if self.by_key.contains_key(&key) {
            return Err(PoolError::DuplicateKey(key));
        }
        let index = self.free.pop_front().ok_or(PoolError::Full {
            capacity: self.slots.len(),
        })?;

        let slot = &mut self.slots[index as usize];
        let handle = ConnectionHandle {
            slot: index,
            generation: slot.generation,
        };
        slot.connection = Some(Connection {
            handle,
            key,
            protocol,
            remote,
            max_payload,
        });
        slot.active_pos = self.active.len();
        self.active.push(index);
        self.by_key.insert(key, index);
        Ok(handle)
    }

    /// Return a connection's slot to the free queue.
    ///
    /// Returns `false` if the handle was already released or never valid.
    pub fn release(&mut self, handle: ConnectionHandle) -> bool {
        let Some(slot) = self
            .slots
            .get_mut(handle.slot as usize)
            .filter(|slot| slot.generation == handle.generation)
        else {
            return false;
        };
        let Some(connection) = slot.connection.take() else {
            return false;
        };
        let pos = slot.active_pos;
        slot.generation = slot.generation.wrapping_add(1);

        self.by_key.remove(&connection.key);
        self.active.swap_remove(pos);
        if let Some(&moved) = self.active.get(pos) {
            self.slots[moved as usize].active_pos = pos;
        }
        self.free.push_back(handle.slot);
        true
    }

    /// Handle of the pooled object for a backend connection.
    pub fn lookup(&self, key: ConnectionKey) -> Option<ConnectionHandle> {
        let index = *self.by_key.get(&key)?;
        self.slots[index as usize]
            .connection
            .as_ref()
            .map(Connection::handle)
    }

    /// Resolve a handle. Stale handles resolve to `None`.
    pub fn get(&self, handle: ConnectionHandle) -> Option<&Connection> {
        self.slots
            .get(handle.slot as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.connection.as_ref())
    }

    /// Active connections, in active-list order.
    pub fn active(&self) -> impl Iterator<Item = &Connection> + '_ {
        self.active
            .iter()
            .filter_map(|&index| self.slots[index as usize].connection.as_ref())
    }

    /// Replace the contents of `out` with the handles of all active connections.
    pub fn active_handles_into(&self, out: &mut Vec<ConnectionHandle>) {
        out.clear();
        out.extend(self.active().map(Connection::handle));
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Occupancy of one slot.
    pub fn state(&self, slot: u32) -> Option<SlotState> {
        self.slots.get(slot as usize).map(|slot| {
            if slot.connection.is_some() {
                SlotState::Active
            } else {
                SlotState::Free
            }
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity(),
            active: self.active_len(),
            free: self.free_len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::DriverIndex;
    use crate::driver::DriverConnectionId;

    fn key(index: u32) -> ConnectionKey {
        ConnectionKey {
            driver: DriverIndex(0),
            id: DriverConnectionId {
                index,
                generation: 0,
            },
        }
    }

    fn acquire(pool: &mut ConnectionPool, index: u32) -> ConnectionHandle {
        pool.acquire(key(index), Protocol::Udp, None, 1384).unwrap()
    }

    fn assert_consistent(pool: &ConnectionPool) {
        assert_eq!(pool.free_len() + pool.active_len(), pool.capacity());
        assert_eq!(pool.by_key.len(), pool.active_len());
        for (pos, &index) in pool.active.iter().enumerate() {
            let slot = &pool.slots[index as usize];
            assert_eq!(slot.active_pos, pos);
            let connection = slot.connection.as_ref().unwrap();
            assert_eq!(pool.by_key.get(&connection.key()), Some(&index));
            assert!(!pool.free.contains(&index));
        }
    }

    #[test]
    fn test_acquire_until_full() {
        let mut pool = ConnectionPool::new(3);
        for i in 0..3 {
            acquire(&mut pool, i);
        }
        assert_eq!(
            pool.acquire(key(9), Protocol::Udp, None, 1384),
            Err(PoolError::Full { capacity: 3 })
        );
        assert_eq!(pool.stats(), PoolStats { capacity: 3, active: 3, free: 0 });
        assert_consistent(&pool);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut pool = ConnectionPool::new(2);
        acquire(&mut pool, 1);
        assert_eq!(
            pool.acquire(key(1), Protocol::Udp, None, 1384),
            Err(PoolError::DuplicateKey(key(1)))
        );
        assert_eq!(pool.active_len(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut pool = ConnectionPool::new(2);
        let handle = acquire(&mut pool, 0);
        assert!(pool.release(handle));
        assert!(!pool.release(handle));
        assert_eq!(pool.free_len(), 2);
        assert_eq!(pool.state(handle.slot()), Some(SlotState::Free));
        assert_consistent(&pool);
    }

    #[test]
    fn test_stale_handle_does_not_resolve_after_reuse() {
        let mut pool = ConnectionPool::new(1);
        let old = acquire(&mut pool, 0);
        pool.release(old);
        let new = acquire(&mut pool, 1);

        assert_eq!(old.slot(), new.slot());
        assert!(pool.get(old).is_none());
        assert_eq!(pool.get(new).unwrap().key(), key(1));
        assert!(!pool.release(old));
        assert!(pool.get(new).is_some());
    }

    #[test]
    fn test_swap_removal_keeps_positions() {
        let mut pool = ConnectionPool::new(4);
        let handles: Vec<_> = (0..4).map(|i| acquire(&mut pool, i)).collect();

        pool.release(handles[1]);
        assert_consistent(&pool);
        pool.release(handles[0]);
        assert_consistent(&pool);

        let mut remaining = Vec::new();
        pool.active_handles_into(&mut remaining);
        remaining.sort_by_key(|h| h.slot());
        assert_eq!(remaining, vec![handles[2], handles[3]]);
        assert_eq!(pool.lookup(key(3)), Some(handles[3]));
        assert_eq!(pool.lookup(key(1)), None);
    }

    #[test]
    fn test_free_slots_reused_oldest_first() {
        let mut pool = ConnectionPool::new(3);
        let a = acquire(&mut pool, 0);
        let b = acquire(&mut pool, 1);
        pool.release(b);
        pool.release(a);

        // Slot 2 was never used and sits at the front of the queue.
        assert_eq!(acquire(&mut pool, 10).slot(), 2);
        assert_eq!(acquire(&mut pool, 11).slot(), b.slot());
        assert_eq!(acquire(&mut pool, 12).slot(), a.slot());
        assert_consistent(&pool);
    }

    #[test]
    fn test_connection_accessors() {
        let mut pool = ConnectionPool::new(1);
        let remote: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let handle = pool
            .acquire(key(0), Protocol::RelayWebSocket, Some(remote), 1368)
            .unwrap();
        let connection = pool.get(handle).unwrap();
        assert_eq!(connection.handle(), handle);
        assert_eq!(connection.protocol(), Protocol::RelayWebSocket);
        assert_eq!(connection.remote_addr(), Some(remote));
        assert_eq!(connection.max_payload_size(), 1368);
        assert_eq!(pool.active().count(), 1);
    }

    #[test]
    fn test_zero_capacity_pool() {
        let mut pool = ConnectionPool::new(0);
        assert!(matches!(
            pool.acquire(key(0), Protocol::Udp, None, 0),
            Err(PoolError::Full { capacity: 0 })
        ));
        assert_eq!(pool.state(0), None);
    }

    #[test]
    fn test_churn_keeps_pool_consistent() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x5EED);
        let mut pool = ConnectionPool::new(8);
        let mut live: Vec<(ConnectionHandle, u32)> = Vec::new();
        let mut stale: Vec<ConnectionHandle> = Vec::new();
        let mut next_key = 0u32;

        for _ in 0..2000 {
            let connect = live.is_empty() || (live.len() < 8 && rng.random_bool(0.6));
            if connect {
                let handle = acquire(&mut pool, next_key);
                live.push((handle, next_key));
                next_key += 1;
            } else {
                let (handle, _) = live.swap_remove(rng.random_range(0..live.len()));
                assert!(pool.release(handle));
                assert!(!pool.release(handle));
                stale.push(handle);
            }

            assert_consistent(&pool);
            let stats = pool.stats();
            assert_eq!(stats.free + stats.active, stats.capacity);
            assert_eq!(stats.active, live.len());
            for &(handle, index) in &live {
                assert_eq!(pool.lookup(key(index)), Some(handle));
                assert_eq!(pool.get(handle).map(Connection::handle), Some(handle));
            }
        }

        assert!(!stale.is_empty());
        for handle in stale {
            assert!(pool.get(handle).is_none());
        }
    }
}
