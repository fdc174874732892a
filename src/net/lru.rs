//! Age-ordered connection set with O(1) promotion and oldest-first
//! eviction, used to shed the least-recently-active tunneled connection
//! under pressure.

use std::sync::{Arc, Mutex, MutexGuard};

use super::interrupt::CloseHandle;

/// Connection set ordered by recent activity.
///
/// `add` inserts a connection as the freshest and returns an
/// [`LruConnEntry`] bound to the inserted node; the entry promotes its
/// connection on activity and detaches it when the connection goes away.
/// `close_oldest` evicts and closes the stalest survivor.
#[derive(Clone)]
pub struct LruConnList {
    state: Arc<Mutex<LruState>>,
}

// Index-linked nodes in a slab; generations make entry operations no-ops
// once the node has been detached and its slot possibly reused.
struct LruState {
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    next_generation: u64,
}

struct Node {
    conn: Option<CloseHandle>,
    generation: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

impl LruState {
    fn push_front(&mut self, index: usize) {
        self.nodes[index].prev = None;
        self.nodes[index].next = self.head;
        if let Some(head) = self.head {
            self.nodes[head].prev = Some(index);
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }

    fn unlink(&mut self, index: usize) {
        let prev = self.nodes[index].prev;
        let next = self.nodes[index].next;
        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[index].prev = None;
        self.nodes[index].next = None;
    }

    fn release(&mut self, index: usize) {
        self.nodes[index].conn = None;
        self.nodes[index].generation = 0;
        self.len -= 1;
        self.free.push(index);
    }
}

impl LruConnList {
    pub fn new() -> Self {
        LruConnList {
            state: Arc::new(Mutex::new(LruState {
                nodes: Vec::new(),
                free: Vec::new(),
                head: None,
                tail: None,
                len: 0,
                next_generation: 1,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruState> {
        self.state.lock().expect("lru conn list lock poisoned")
    }

    /// Insert `conn` as the freshest connection.
    pub fn add(&self, conn: CloseHandle) -> LruConnEntry {
        let mut state = self.lock();
        let generation = state.next_generation;
        state.next_generation += 1;

        let node = Node {
            conn: Some(conn),
            generation,
            prev: None,
            next: None,
        };
        let index = match state.free.pop() {
            Some(index) => {
                state.nodes[index] = node;
                index
            }
            None => {
                state.nodes.push(node);
                state.nodes.len() - 1
            }
        };
        state.push_front(index);
        state.len += 1;

        LruConnEntry {
            state: self.state.clone(),
            index,
            generation,
        }
    }

    /// Detach and close the stalest connection; a no-op when empty.
    pub fn close_oldest(&self) {
        let conn = {
            let mut state = self.lock();
            let Some(tail) = state.tail else { return };
            state.unlink(tail);
            let conn = state.nodes[tail].conn.take();
            state.release(tail);
            conn
        };
        // Close outside the lock: close may reenter bookkeeping that takes
        // it again.
        if let Some(conn) = conn {
            conn.close();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LruConnList {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry bound to one node of an [`LruConnList`]. `touch` and `remove` are
/// no-ops once the node has been detached, by whichever path detached it.
pub struct LruConnEntry {
    state: Arc<Mutex<LruState>>,
    index: usize,
    generation: u64,
}

impl LruConnEntry {
    /// Promote the connection to freshest.
    pub fn touch(&self) {
        let mut state = self.state.lock().expect("lru conn list lock poisoned");
        if state.nodes[self.index].generation != self.generation {
            return;
        }
        state.unlink(self.index);
        state.push_front(self.index);
    }

    /// Detach the connection from the list without closing it.
    pub fn remove(&self) {
        let mut state = self.state.lock().expect("lru conn list lock poisoned");
        if state.nodes[self.index].generation != self.generation {
            return;
        }
        state.unlink(self.index);
        state.release(self.index);
    }
}

impl Drop for LruConnEntry {
    fn drop(&mut self) {
        self.remove();
    }
}
