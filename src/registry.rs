//! Process-wide collection of live threads.
//!
//! A [`Registry`] maps identities to [`Tcb`]s and native thread ids to
//! thread records. Both maps sit behind one reader/writer lock: mutations are
//! serialized, and enumeration copies the whole map under the read lock, so a
//! snapshot is consistent at one instant and never sees half an insert.
//!
//! The native binding outlives registration. A stopped thread leaves the
//! registry at once but keeps resolving to its own record until its entry
//! returns, so it observes the stop at its next safe point.
//!
//! The registry is not a global. A [`Runtime`](crate::Runtime) is handed one
//! explicitly and several runtimes may share it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::RwLock;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::thread::{Id, Tcb};
use crate::BASE_THREAD_ID;

#[derive(Default)]
struct Tables {
    threads: BTreeMap<Id, Arc<Tcb>>,
    by_os: HashMap<ThreadId, Arc<Tcb>>,
}

impl Tables {
    fn insert(&mut self, tcb: &Arc<Tcb>, os_id: Option<ThreadId>) -> Result<()> {
        let id = tcb.id();
        if self.threads.contains_key(&id) {
            error!(thread = %id, "duplicate identity in registry");
            return Err(Error::DuplicateIdentity(id));
        }
        self.threads.insert(id, Arc::clone(tcb));
        if let Some(os_id) = os_id {
            self.by_os.insert(os_id, Arc::clone(tcb));
        }
        debug!(thread = %id, live = self.threads.len(), "registered");
        Ok(())
    }
}

pub struct Registry {
    /// Total number of identities handed out so far.
    count: AtomicUsize,
    tables: RwLock<Tables>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            count: AtomicUsize::new(BASE_THREAD_ID.0),
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Hands out the next unused identity. Identities are never reused.
    pub fn allocate_id(&self) -> Id {
        Id(self.count.fetch_add(1, Ordering::Relaxed))
    }

    /// Inserts `tcb`, indexed by its identity and, if bound, its native thread.
    ///
    /// A duplicate identity means controller and registry disagree; the
    /// registry is left untouched and the caller aborts.
    pub fn register(&self, tcb: &Arc<Tcb>) -> Result<()> {
        let os_id = tcb.os_thread_id();
        self.tables.write().insert(tcb, os_id)
    }

    /// Registers a thread whose native thread has just begun executing and
    /// takes its `NEW -> RUNNABLE` edge under the same write lock.
    ///
    /// Returns `Ok(false)` without registering if the thread was stopped
    /// first, so a terminated identity is never listed.
    pub(crate) fn register_started(&self, tcb: &Arc<Tcb>) -> Result<bool> {
        let id = tcb.id();
        let os_id = tcb.os_thread_id();
        let mut tables = self.tables.write();
        if tables.threads.contains_key(&id) {
            error!(thread = %id, "duplicate identity in registry");
            return Err(Error::DuplicateIdentity(id));
        }
        // lock order is registry before thread record
        if !tcb.mark_running() {
            return Ok(false);
        }
        tables.insert(tcb, os_id)?;
        Ok(true)
    }

    /// Removes `tcb` from enumeration. Returns whether it was present; calling
    /// it again is harmless. The native binding is kept, see [`unbind`](Self::unbind).
    pub fn unregister(&self, tcb: &Tcb) -> bool {
        let id = tcb.id();
        let mut tables = self.tables.write();
        let removed = tables.threads.remove(&id).is_some();
        if removed {
            debug!(thread = %id, live = tables.threads.len(), "unregistered");
        }
        removed
    }

    /// Drops the binding from `tcb`'s native thread to `tcb`. Called once the
    /// native thread stops running on behalf of the record.
    pub fn unbind(&self, tcb: &Tcb) -> bool {
        let Some(os_id) = tcb.os_thread_id() else {
            return false;
        };
        let mut tables = self.tables.write();
        match tables.by_os.get(&os_id) {
            Some(bound) if bound.id() == tcb.id() => {
                tables.by_os.remove(&os_id);
                true
            }
            _ => false,
        }
    }

    /// Identities of every registered thread, in identity order.
    pub fn snapshot_all(&self) -> Vec<Id> {
        self.tables.read().threads.keys().copied().collect()
    }

    /// Registered threads, in identity order.
    pub fn threads(&self) -> Vec<Arc<Tcb>> {
        self.tables.read().threads.values().cloned().collect()
    }

    pub fn get(&self, id: Id) -> Option<Arc<Tcb>> {
        self.tables.read().threads.get(&id).cloned()
    }

    pub fn contains(&self, id: Id) -> bool {
        self.tables.read().threads.contains_key(&id)
    }

    /// The thread record bound to the calling native thread, if any. This may
    /// be a stopped record that is no longer registered.
    pub fn current(&self) -> Option<Arc<Tcb>> {
        self.by_os_thread(std::thread::current().id())
    }

    pub fn by_os_thread(&self, os_id: ThreadId) -> Option<Arc<Tcb>> {
        self.tables.read().by_os.get(&os_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tables.read().threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}
