// src/table.rs
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, TryLockError};

use crate::conn::Connection;
use crate::context::Shared;
use crate::error::{EtudeError, EtudeResult};
use crate::pool::Task;

/// One table entry: a connection plus the context its work needs.
///
/// The one-shot registration means the reactor and at most one worker take
/// turns on the mutex; it is never contended on the hot path.
pub struct Slot {
    shared: Arc<Shared>,
    conn: Mutex<Connection>,
}

impl Slot {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            conn: Mutex::new(Connection::empty()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock only if nobody else holds the connection right now.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, Connection>> {
        match self.conn.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

impl Task for Slot {
    fn process(&self) {
        let mut conn = self.lock();
        if !conn.is_open() || !conn.is_in_flight() {
            tracing::trace!(conn = ?*conn, "stale task skipped");
            return;
        }
        conn.process(&self.shared);
    }
}

/// Connections indexed directly by socket descriptor.
///
/// Slots are created on first use and then kept for the life of the table,
/// so a reused descriptor number reuses its buffers.
pub struct ConnectionTable {
    slots: Box<[OnceLock<Arc<Slot>>]>,
    shared: Arc<Shared>,
}

impl ConnectionTable {
    pub fn new(capacity: usize, shared: Arc<Shared>) -> Self {
        let slots = (0..capacity).map(|_| OnceLock::new()).collect();
        Self { slots, shared }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The slot for `fd`, if one was ever created.
    pub fn get(&self, fd: RawFd) -> Option<&Arc<Slot>> {
        let index = usize::try_from(fd).ok()?;
        self.slots.get(index)?.get()
    }

    /// The slot for `fd`, created on first use.
    pub fn slot(&self, fd: RawFd) -> EtudeResult<&Arc<Slot>> {
        let cell = usize::try_from(fd)
            .ok()
            .and_then(|index| self.slots.get(index))
            .ok_or(EtudeError::TableFull)?;
        Ok(cell.get_or_init(|| Arc::new(Slot::new(Arc::clone(&self.shared)))))
    }

    /// Every slot that has ever held a connection.
    pub fn slots(&self) -> impl Iterator<Item = &Arc<Slot>> {
        self.slots.iter().filter_map(OnceLock::get)
    }
}

impl std::fmt::Debug for ConnectionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTable")
            .field("capacity", &self.slots.len())
            .field("created", &self.slots().count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscalls::Epoll;

    fn table(capacity: usize) -> ConnectionTable {
        let shared = Arc::new(Shared::new(Arc::new(Epoll::new().unwrap()), "/tmp", 8));
        ConnectionTable::new(capacity, shared)
    }

    #[test]
    fn slots_are_created_once_per_fd() {
        let table = table(16);
        assert!(table.get(5).is_none());
        let first = Arc::clone(table.slot(5).unwrap());
        let again = table.slot(5).unwrap();
        assert!(Arc::ptr_eq(&first, again));
        assert!(table.get(5).is_some());
        assert_eq!(table.slots().count(), 1);
    }

    #[test]
    fn out_of_range_fd_is_table_full() {
        let table = table(4);
        assert!(matches!(table.slot(4), Err(EtudeError::TableFull)));
        assert!(matches!(table.slot(-1), Err(EtudeError::TableFull)));
        assert!(table.get(100).is_none());
    }

    #[test]
    fn try_lock_yields_while_held() {
        let table = table(4);
        let slot = table.slot(1).unwrap();
        let held = slot.lock();
        assert!(slot.try_lock().is_none());
        drop(held);
        assert!(slot.try_lock().is_some());
    }

    #[test]
    fn idle_slot_task_is_a_no_op() {
        let table = table(4);
        let slot = Arc::clone(table.slot(2).unwrap());
        slot.process();
        assert!(!slot.lock().is_open());
    }
}
