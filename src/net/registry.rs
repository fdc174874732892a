//! Connection registry: tracks in-flight dials and established connections
//! so a single sweep can interrupt any subset of them.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::interrupt::CloseHandle;

/// Synchronized set of connection handles.
///
/// Once the registry is closed, nothing more can be added until `reset`;
/// callers use a failed `add` to abort a dial that lost the race with
/// `close_all`.
pub struct ConnRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    is_closed: bool,
    conns: HashMap<u64, CloseHandle>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        ConnRegistry {
            state: Mutex::new(RegistryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().expect("connection registry lock poisoned")
    }

    /// Reopen the registry and drop all tracked handles.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.is_closed = false;
        state.conns.clear();
    }

    /// Track `conn`. Returns false when the registry is closed, in which
    /// case the caller must abort the connection itself.
    pub fn add(&self, conn: CloseHandle) -> bool {
        let mut state = self.lock();
        if state.is_closed {
            return false;
        }
        state.conns.insert(conn.id(), conn);
        true
    }

    pub fn remove(&self, conn: &CloseHandle) {
        self.lock().conns.remove(&conn.id());
    }

    /// Close every registered connection and refuse new registrations.
    ///
    /// Handle close is non-blocking, so the sweep runs under the lock and
    /// the close/add race is total-ordered by lock acquisition.
    pub fn close_all(&self) {
        let mut state = self.lock();
        state.is_closed = true;
        for conn in state.conns.values() {
            conn.close();
        }
        state.conns.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove() {
        let registry = ConnRegistry::new();
        let a = CloseHandle::new();
        let b = CloseHandle::new();

        assert!(registry.add(a.clone()));
        assert!(registry.add(b.clone()));
        assert_eq!(registry.len(), 2);

        registry.remove(&a);
        assert_eq!(registry.len(), 1);
        assert!(!a.is_closed());
    }

    #[test]
    fn test_close_all_closes_everything_once() {
        let registry = ConnRegistry::new();
        let a = CloseHandle::new();
        let b = CloseHandle::new();
        registry.add(a.clone());
        registry.add(b.clone());

        registry.close_all();
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(registry.is_empty());

        // Idempotent: a second sweep has nothing left to close.
        registry.close_all();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_add_fails_after_close() {
        let registry = ConnRegistry::new();
        registry.close_all();
        let conn = CloseHandle::new();
        assert!(!registry.add(conn.clone()));
        assert!(registry.is_empty());
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_reset_reopens() {
        let registry = ConnRegistry::new();
        registry.close_all();
        registry.reset();
        assert!(registry.add(CloseHandle::new()));
        assert_eq!(registry.len(), 1);
    }
}
