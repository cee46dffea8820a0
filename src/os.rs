//! Native thread handle.
//!
//! [`OsThread`] is the single owner of a platform thread's join handle. It is
//! created by `start`, stored in the thread's [`Tcb`](crate::Tcb), and consumed
//! by [`OsThread::release`] on the terminal transition, so the handle cannot be
//! disposed of twice.

use std::fmt;
use std::io;
use std::thread::{Builder, JoinHandle, ThreadId};

use tracing::trace;

use crate::thread::Priority;

pub struct OsThread {
    handle: JoinHandle<()>,
    name: String,
    priority: Priority,
}

impl OsThread {
    /// Creates the native thread and runs `entry` on it.
    ///
    /// Fails when the platform cannot allocate another thread.
    pub(crate) fn spawn<F>(
        name: &str,
        stack_size: Option<usize>,
        priority: Priority,
        entry: F,
    ) -> io::Result<OsThread>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = native_name(name);
        let mut builder = Builder::new().name(name.clone());
        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }
        let handle = builder.spawn(entry)?;
        trace!(native = ?handle.thread().id(), %name, "native thread created");

        Ok(OsThread {
            handle,
            name,
            priority,
        })
    }

    pub fn id(&self) -> ThreadId {
        self.handle.thread().id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Records the priority requested for the native thread.
    ///
    /// The standard library has no portable priority control, so the value is
    /// kept on the handle and reported from there.
    pub(crate) fn set_priority(&mut self, priority: Priority) {
        trace!(native = ?self.id(), %priority, "native priority set");
        self.priority = priority;
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = native_name(name);
    }

    /// Disposes of the handle. The native thread keeps running detached until
    /// its entry returns.
    pub(crate) fn release(self) {
        trace!(native = ?self.id(), name = %self.name, "native handle released");
        drop(self.handle);
    }
}

impl fmt::Debug for OsThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsThread")
            .field("id", &self.id())
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

// thread names may not carry interior NULs
fn native_name(name: &str) -> String {
    name.replace('\0', "")
}
