//! Reentrant mutual exclusion with owner tracking and a wait set.
//!
//! Waiters park on their own thread record; notify hands a token to the head
//! of the wait queue, an interrupt wakes a waiter directly.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{Error, Result};
use crate::runtime::{Runtime, ThreadController};
use crate::thread::{Id, Tcb};

const NO_OWNER: usize = usize::MAX;

static NEXT_MONITOR: AtomicU64 = AtomicU64::new(1);

struct Ownership {
    owner: Option<Id>,
    /// Reentrant entry count of the owner.
    depth: usize,
    waiters: VecDeque<Arc<Tcb>>,
}

pub struct Monitor {
    id: u64,
    /// Mirror of `ownership.owner` for lock-free ownership queries.
    owner: AtomicUsize,
    ownership: Mutex<Ownership>,
    available: Condvar,
}

impl Monitor {
    pub fn new() -> Self {
        Monitor {
            id: NEXT_MONITOR.fetch_add(1, Ordering::Relaxed),
            owner: AtomicUsize::new(NO_OWNER),
            ownership: Mutex::new(Ownership {
                owner: None,
                depth: 0,
                waiters: VecDeque::new(),
            }),
            available: Condvar::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn owner(&self) -> Option<Id> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            id => Some(Id(id)),
        }
    }

    /// Ownership query that neither takes nor releases the monitor.
    pub fn is_held_by(&self, id: Id) -> bool {
        self.owner.load(Ordering::Acquire) == id.0
    }

    /// Acquires the monitor for the calling thread, blocking while another
    /// thread owns it. Not interruptible. Reentrant.
    pub fn enter(&self, rt: &Runtime) -> MonitorGuard<'_> {
        let tcb = rt.current_thread();
        let mut ownership = self.ownership.lock();
        while matches!(ownership.owner, Some(owner) if owner != tcb.id()) {
            self.available.wait(&mut ownership);
        }
        self.take(&mut ownership, tcb.id());
        MonitorGuard { monitor: self }
    }

    /// Acquires the monitor only if that does not require waiting.
    pub fn try_enter(&self, rt: &Runtime) -> Option<MonitorGuard<'_>> {
        let tcb = rt.current_thread();
        let mut ownership = self.ownership.lock();
        if matches!(ownership.owner, Some(owner) if owner != tcb.id()) {
            return None;
        }
        self.take(&mut ownership, tcb.id());
        Some(MonitorGuard { monitor: self })
    }

    fn take(&self, ownership: &mut Ownership, id: Id) {
        ownership.owner = Some(id);
        ownership.depth += 1;
        self.owner.store(id.0, Ordering::Release);
    }

    /// Releases the monitor completely, waits for a notify, the timeout, or an
    /// interrupt, then reacquires it at the previous entry depth.
    ///
    /// Returns `Ok(true)` when notified and `Ok(false)` on timeout. The caller
    /// must own the monitor.
    pub fn wait(&self, rt: &Runtime, timeout: Option<Duration>) -> Result<bool> {
        let tcb = rt.current_thread();
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        tcb.lock().notified = false;
        let depth = {
            let mut ownership = self.ownership.lock();
            self.check_owner(&ownership, tcb.id())?;
            ownership.waiters.push_back(Arc::clone(&tcb));
            let depth = std::mem::take(&mut ownership.depth);
            ownership.owner = None;
            self.owner.store(NO_OWNER, Ordering::Release);
            self.available.notify_one();
            depth
        };
        trace!(thread = %tcb.id(), monitor = self.id, "waiting");

        let result = tcb.block_interruptibly("wait", deadline, |inner| {
            std::mem::take(&mut inner.notified)
        });

        let mut ownership = self.ownership.lock();
        ownership.waiters.retain(|w| w.id() != tcb.id());
        // a notification that arrived after a failed or timed out wait goes to the next waiter
        let unused = std::mem::take(&mut tcb.lock().notified);
        if unused && !matches!(result, Ok(true)) {
            if let Some(next) = ownership.waiters.pop_front() {
                next.signal();
            }
        }
        while ownership.owner.is_some() {
            self.available.wait(&mut ownership);
        }
        ownership.owner = Some(tcb.id());
        ownership.depth = depth;
        self.owner.store(tcb.id().0, Ordering::Release);
        result
    }

    /// Wakes the longest waiting thread. The caller must own the monitor.
    pub fn notify(&self, rt: &Runtime) -> Result<()> {
        let id = rt.current_thread().id();
        let mut ownership = self.ownership.lock();
        self.check_owner(&ownership, id)?;
        if let Some(waiter) = ownership.waiters.pop_front() {
            trace!(thread = %waiter.id(), monitor = self.id, "notified");
            waiter.signal();
        }
        Ok(())
    }

    /// Wakes every waiting thread. The caller must own the monitor.
    pub fn notify_all(&self, rt: &Runtime) -> Result<()> {
        let id = rt.current_thread().id();
        let mut ownership = self.ownership.lock();
        self.check_owner(&ownership, id)?;
        for waiter in ownership.waiters.drain(..) {
            waiter.signal();
        }
        Ok(())
    }

    /// Number of threads in the wait set.
    pub fn waiters(&self) -> usize {
        self.ownership.lock().waiters.len()
    }

    fn check_owner(&self, ownership: &Ownership, id: Id) -> Result<()> {
        if ownership.owner == Some(id) {
            Ok(())
        } else {
            Err(Error::NotOwner {
                id,
                monitor: self.id,
            })
        }
    }

    fn exit(&self) {
        let mut ownership = self.ownership.lock();
        ownership.depth = ownership.depth.saturating_sub(1);
        if ownership.depth == 0 {
            ownership.owner = None;
            self.owner.store(NO_OWNER, Ordering::Release);
            self.available.notify_one();
        }
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Monitor::new()
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("id", &self.id)
            .field("owner", &self.owner())
            .finish()
    }
}

/// Leaves the monitor once when dropped.
#[must_use = "the monitor is released as soon as the guard is dropped"]
pub struct MonitorGuard<'a> {
    monitor: &'a Monitor,
}

impl MonitorGuard<'_> {
    pub fn monitor(&self) -> &Monitor {
        self.monitor
    }
}

impl Drop for MonitorGuard<'_> {
    fn drop(&mut self) {
        self.monitor.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    #[test]
    fn test_enter_is_reentrant() {
        let rt = Runtime::new(RuntimeConfig::default());
        let me = rt.current_thread();
        let monitor = Monitor::new();
        assert!(!rt.holds_lock(&me, &monitor));
        {
            let _outer = monitor.enter(&rt);
            let _inner = monitor.enter(&rt);
            assert!(rt.holds_lock(&me, &monitor));
        }
        assert!(!rt.holds_lock(&me, &monitor));
        assert_eq!(monitor.owner(), None);
    }

    #[test]
    fn test_notify_requires_ownership() {
        let rt = Runtime::new(RuntimeConfig::default());
        let monitor = Monitor::new();
        assert!(matches!(
            monitor.notify(&rt),
            Err(Error::NotOwner { .. })
        ));
        assert!(matches!(
            monitor.wait(&rt, Some(Duration::from_millis(1))),
            Err(Error::NotOwner { .. })
        ));
    }

    #[test]
    fn test_wait_times_out_and_reacquires() {
        let rt = Runtime::new(RuntimeConfig::default());
        let me = rt.current_thread();
        let monitor = Monitor::new();
        let _guard = monitor.enter(&rt);
        let _again = monitor.enter(&rt);
        let notified = monitor.wait(&rt, Some(Duration::from_millis(10))).unwrap();
        assert!(!notified);
        assert!(rt.holds_lock(&me, &monitor));
        assert_eq!(monitor.waiters(), 0);
    }

    #[test]
    fn test_try_enter_fails_while_owned_elsewhere() {
        let rt = Runtime::new(RuntimeConfig::default());
        let monitor = Arc::new(Monitor::new());
        let _guard = monitor.enter(&rt);

        let other = {
            let rt = rt.clone();
            let monitor = Arc::clone(&monitor);
            std::thread::spawn(move || monitor.try_enter(&rt).is_none())
        };
        assert!(other.join().unwrap());
    }
}
