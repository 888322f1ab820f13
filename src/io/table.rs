//! Descriptor table: socket fd to packet queue
//!
//! Populated on successful connect/accept, drained on close. A descriptor
//! without an entry bypasses interposition entirely, so membership tests
//! sit on every interposed call and must stay O(1).

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::io::queue::PacketQueue;

/// A packet queue shared between the owning descriptor's consumer path
/// and the epoll readiness scan.
pub type SharedQueue = Arc<Mutex<PacketQueue>>;

/// Process-global map from socket descriptor to its packet queue.
#[derive(Default)]
pub struct DescriptorTable {
    inner: Mutex<HashMap<RawFd, SharedQueue>>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<RawFd, SharedQueue>> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Insert a fresh queue for `fd`. A duplicate registration (re-used fd
    /// number) replaces the old entry.
    pub fn register(&self, fd: RawFd) {
        self.map()
            .insert(fd, Arc::new(Mutex::new(PacketQueue::new())));
    }

    /// Is `fd` an interposed socket?
    pub fn contains(&self, fd: RawFd) -> bool {
        self.map().contains_key(&fd)
    }

    /// The queue for `fd`, if interposed.
    pub fn lookup(&self, fd: RawFd) -> Option<SharedQueue> {
        self.map().get(&fd).cloned()
    }

    /// Remove and return the queue for `fd`.
    pub fn remove(&self, fd: RawFd) -> Option<SharedQueue> {
        self.map().remove(&fd)
    }

    /// All current entries, for the epoll readiness scan. Cloned out so no
    /// table lock is held while individual queues are inspected.
    pub fn snapshot(&self) -> Vec<(RawFd, SharedQueue)> {
        self.map()
            .iter()
            .map(|(fd, queue)| (*fd, Arc::clone(queue)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}
