//! Connection table and id allocation

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tunmux_proto::ConnectionId;

const FULL_SPAN: u64 = 1 << 32;

/// Monotonic connection id allocator
///
/// Ids start at 0 and wrap after `u32::MAX`. The endpoint rejects a wrapped id
/// that is still open instead of reusing it.
#[derive(Debug)]
pub struct ConnectionIdAllocator {
    next: AtomicU64,
    span: u64,
}

impl ConnectionIdAllocator {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(first: ConnectionId) -> Self {
        Self {
            next: AtomicU64::new(u64::from(first)),
            span: FULL_SPAN,
        }
    }

    /// Allocator cycling through ids `0..size`
    ///
    /// A `size` of 0 is treated as 1.
    pub fn bounded(size: u32) -> Self {
        Self {
            next: AtomicU64::new(0),
            span: u64::from(size.max(1)),
        }
    }

    pub fn allocate(&self) -> ConnectionId {
        let next = self.next.fetch_add(1, Ordering::Relaxed);
        // span is at most 2^32, so the remainder fits
        (next % self.span) as ConnectionId
    }
}

impl Default for ConnectionIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Open logical connections of one endpoint, keyed by id
#[derive(Debug)]
pub struct ConnectionTable<T> {
    entries: HashMap<ConnectionId, T>,
}

impl<T> ConnectionTable<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register an entry, returning the one it replaced
    pub fn insert(&mut self, id: ConnectionId, entry: T) -> Option<T> {
        self.entries.insert(id, entry)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<T> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ConnectionId, &mut T)> {
        self.entries.iter_mut().map(|(id, entry)| (*id, entry))
    }

    /// Remove every entry, in id order
    pub fn drain(&mut self) -> Vec<(ConnectionId, T)> {
        let mut drained: Vec<_> = self.entries.drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }
}

impl<T> Default for ConnectionTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
