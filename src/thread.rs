use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use strum::Display;
use tracing::trace;

use crate::config::PriorityRange;
use crate::error::{Error, Result};
use crate::os::OsThread;

/// Uniquely identifies a thread.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
#[repr(transparent)]
pub struct Id(pub usize);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Possible states that a thread can be in during its lifetime.
///
/// ```text
/// NEW --start--> RUNNABLE <--suspend/resume--> SUSPENDED
///                RUNNABLE <--block/wake------> BLOCKED_INTERRUPTIBLE
/// any non-terminal --exit/stop--> TERMINATED
/// ```
#[derive(Debug, Display, PartialEq, Eq, Clone, Copy)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Created but not started. A thread being started stays here until its
    /// native thread is actually executing.
    New,
    /// Thread is making progress.
    Runnable,
    /// Thread was suspended through legacy control and parks at its next safe point.
    Suspended,
    /// Thread is sleeping or waiting and can be woken by an interrupt.
    BlockedInterruptible,
    /// Thread has finished. No further transitions.
    Terminated,
}

impl State {
    pub fn is_alive(self) -> bool {
        !matches!(self, State::New | State::Terminated)
    }
}

/// Scheduling priority of a thread.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct Priority(pub i32);

impl Priority {
    /// Validates `value` against `range`. Use [`PriorityRange::clamp`] for the
    /// lenient variant.
    pub fn new(value: i32, range: &PriorityRange) -> Result<Self> {
        if range.contains(value) {
            Ok(Priority(value))
        } else {
            Err(Error::ValueOutOfRange {
                value,
                min: range.min,
                max: range.max,
            })
        }
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of a thread's call-stack-like trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub method: String,
}

impl Frame {
    pub fn new(method: impl Into<String>) -> Self {
        Frame {
            method: method.into(),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.method)
    }
}

/// How a terminated thread ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// The body returned `Ok`.
    Completed,
    /// The body returned an error other than `Stopped`.
    Failed(String),
    /// The body unwound; holds the panic message.
    Panicked(String),
    /// Legacy stop was applied.
    Stopped,
    /// No native thread could be created.
    StartFailed(String),
}

pub(crate) type Body = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Mutable part of a [`Tcb`], all behind one lock.
pub(crate) struct Inner {
    pub(crate) state: State,
    /// A `start` call has claimed this thread; its native thread is not yet running.
    pub(crate) starting: bool,
    /// Sticky until consumed by an interruptible wait or a clearing read.
    pub(crate) interrupted: bool,
    /// Wakeup token handed over by a monitor notify.
    pub(crate) notified: bool,
    pub(crate) priority: Priority,
    pub(crate) name: String,
    pub(crate) handle: Option<OsThread>,
    pub(crate) os_id: Option<ThreadId>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) exit: Option<ExitStatus>,
    pub(crate) body: Option<Body>,
    pub(crate) joiners: Vec<Arc<Tcb>>,
    /// Adopted foreign thread, no owned native handle.
    pub(crate) attached: bool,
}

impl Inner {
    fn finished(&self) -> bool {
        match self.state {
            State::Terminated => true,
            State::New => !self.starting,
            _ => false,
        }
    }
}

/// Thread Control Block: the record of one logical thread.
///
/// Every field that changes lives behind a single mutex, so state transitions,
/// the interrupt flag and the native handle are always updated together. A
/// thread only ever parks on its own condition variable; anyone waking it takes
/// its lock first, which rules out lost wakeups.
pub struct Tcb {
    id: Id,
    inner: Mutex<Inner>,
    wakeup: Condvar,
    /// Set on the terminal transition; readable without the lock.
    terminated: AtomicBool,
}

impl Tcb {
    pub(crate) fn new(id: Id, name: String, priority: Priority, body: Body) -> Arc<Self> {
        Arc::new(Tcb {
            id,
            inner: Mutex::new(Inner {
                state: State::New,
                starting: false,
                interrupted: false,
                notified: false,
                priority,
                name,
                handle: None,
                os_id: None,
                frames: Vec::new(),
                exit: None,
                body: Some(body),
                joiners: Vec::new(),
                attached: false,
            }),
            wakeup: Condvar::new(),
            terminated: AtomicBool::new(false),
        })
    }

    /// Record for a thread the runtime did not create, already executing.
    pub(crate) fn attached(id: Id, name: String, priority: Priority, os_id: ThreadId) -> Arc<Self> {
        Arc::new(Tcb {
            id,
            inner: Mutex::new(Inner {
                state: State::Runnable,
                starting: false,
                interrupted: false,
                notified: false,
                priority,
                name,
                handle: None,
                os_id: Some(os_id),
                frames: Vec::new(),
                exit: None,
                body: None,
                joiners: Vec::new(),
                attached: true,
            }),
            wakeup: Condvar::new(),
            terminated: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    pub fn priority(&self) -> Priority {
        self.inner.lock().priority
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.inner.lock().exit.clone()
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().attached
    }

    pub fn os_thread_id(&self) -> Option<ThreadId> {
        self.inner.lock().os_id
    }

    /// Priority last applied to the native thread, if one is held.
    pub fn native_priority(&self) -> Option<Priority> {
        self.inner.lock().handle.as_ref().map(OsThread::priority)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock()
    }

    /// Wakes the thread if it is parked. Takes the lock so a waiter between
    /// its check and its wait cannot miss the signal.
    pub(crate) fn wake(&self) {
        let _inner = self.inner.lock();
        self.wakeup.notify_all();
    }

    /// Hands over a monitor notification.
    pub(crate) fn signal(&self) {
        let mut inner = self.inner.lock();
        inner.notified = true;
        self.wakeup.notify_all();
    }

    pub(crate) fn interrupt(&self) {
        let mut inner = self.inner.lock();
        inner.interrupted = true;
        trace!(thread = %self.id, state = %inner.state, "interrupt requested");
        self.wakeup.notify_all();
    }

    /// Reads the interrupt flag, clearing it in the same critical section when asked.
    pub(crate) fn test_interrupted(&self, clear: bool) -> bool {
        let mut inner = self.inner.lock();
        let flag = inner.interrupted;
        if clear {
            inner.interrupted = false;
        }
        flag
    }

    /// Stores the native handle once the native thread exists. If the thread
    /// was already terminated in the meantime the handle is released right away.
    pub(crate) fn install_handle(&self, os: OsThread) {
        let mut inner = self.inner.lock();
        if inner.state == State::Terminated {
            drop(inner);
            os.release();
        } else {
            inner.handle = Some(os);
        }
    }

    pub(crate) fn bind_os_thread(&self, os_id: ThreadId) {
        self.inner.lock().os_id = Some(os_id);
    }

    /// Takes the `NEW -> RUNNABLE` edge from the new thread itself. Returns
    /// `false` if the thread was stopped before it got to run.
    pub(crate) fn mark_running(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.starting = false;
        if inner.state != State::New {
            return false;
        }
        inner.state = State::Runnable;
        trace!(thread = %self.id, "NEW -> RUNNABLE");
        true
    }

    /// Moves to `TERMINATED`, records `status` and releases the native handle.
    ///
    /// Returns `false` without touching anything if the thread already
    /// terminated, so the handle is released exactly once.
    pub(crate) fn terminate(&self, status: ExitStatus) -> bool {
        let (handle, joiners) = {
            let mut inner = self.inner.lock();
            if inner.state == State::Terminated {
                return false;
            }
            trace!(thread = %self.id, from = %inner.state, ?status, "-> TERMINATED");
            inner.state = State::Terminated;
            self.terminated.store(true, Ordering::Release);
            inner.starting = false;
            inner.exit = Some(status);
            inner.frames.clear();
            inner.body = None;
            self.wakeup.notify_all();
            (inner.handle.take(), std::mem::take(&mut inner.joiners))
        };
        if let Some(handle) = handle {
            handle.release();
        }
        for joiner in joiners {
            joiner.wake();
        }
        true
    }

    /// Lock-free check used by waiters that already hold their own lock.
    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Registers `joiner` to be woken at termination. Returns `false` if there
    /// is nothing to wait for: terminated, or never started and not being started.
    pub(crate) fn add_joiner(&self, joiner: &Arc<Tcb>) -> bool {
        let mut inner = self.inner.lock();
        let finished = inner.finished();
        if !finished {
            inner.joiners.push(Arc::clone(joiner));
        }
        !finished
    }

    pub(crate) fn remove_joiner(&self, joiner: Id) {
        self.inner.lock().joiners.retain(|t| t.id != joiner);
    }

    /// Parks the calling thread, which must be the thread this block describes,
    /// in `BLOCKED_INTERRUPTIBLE` until `woken` holds, `deadline` passes, an
    /// interrupt arrives, or the thread is stopped.
    ///
    /// Returns `Ok(true)` when woken, `Ok(false)` on timeout. A pending or
    /// arriving interrupt fails with [`Error::Interrupted`] and clears the flag.
    ///
    /// A suspended thread parks here until resumed before it blocks; there is
    /// no `SUSPENDED -> BLOCKED_INTERRUPTIBLE` edge.
    pub(crate) fn block_interruptibly<F>(
        &self,
        frame: &str,
        deadline: Option<Instant>,
        mut woken: F,
    ) -> Result<bool>
    where
        F: FnMut(&mut Inner) -> bool,
    {
        let mut inner = self.inner.lock();
        while inner.state == State::Suspended {
            self.wakeup.wait(&mut inner);
        }
        if inner.state == State::Terminated {
            return Err(Error::Stopped(self.id));
        }
        if inner.interrupted {
            inner.interrupted = false;
            return Err(Error::Interrupted);
        }

        inner.state = State::BlockedInterruptible;
        inner.frames.push(Frame::new(frame));
        let depth = inner.frames.len();
        trace!(thread = %self.id, frame, "RUNNABLE -> BLOCKED_INTERRUPTIBLE");

        let result = loop {
            if inner.state == State::Terminated {
                break Err(Error::Stopped(self.id));
            }
            if inner.interrupted {
                inner.interrupted = false;
                break Err(Error::Interrupted);
            }
            if woken(&mut *inner) {
                break Ok(true);
            }
            match deadline {
                Some(deadline) => {
                    if self.wakeup.wait_until(&mut inner, deadline).timed_out() {
                        // a wakeup racing the timeout still counts
                        if inner.state != State::Terminated && !inner.interrupted {
                            break Ok(woken(&mut *inner));
                        }
                    }
                }
                None => self.wakeup.wait(&mut inner),
            }
        };

        if inner.state == State::BlockedInterruptible {
            inner.state = State::Runnable;
            inner.frames.truncate(depth - 1);
            trace!(thread = %self.id, frame, "BLOCKED_INTERRUPTIBLE -> RUNNABLE");
        }
        result
    }

    /// Parks while suspended and reports a pending stop. Called by the thread itself.
    pub(crate) fn safepoint(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        loop {
            match inner.state {
                State::Suspended => self.wakeup.wait(&mut inner),
                State::Terminated => return Err(Error::Stopped(self.id)),
                _ => return Ok(()),
            }
        }
    }

    pub(crate) fn push_frame(self: &Arc<Self>, frame: Frame) -> FrameGuard {
        let mut inner = self.inner.lock();
        let depth = inner.frames.len();
        inner.frames.push(frame);
        FrameGuard {
            tcb: Arc::clone(self),
            depth,
        }
    }
}

impl fmt::Debug for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Tcb")
            .field("id", &self.id)
            .field("name", &inner.name)
            .field("state", &inner.state)
            .field("priority", &inner.priority)
            .field("interrupted", &inner.interrupted)
            .finish()
    }
}

/// Pops a frame pushed with [`Runtime::enter_frame`](crate::Runtime::enter_frame)
/// when dropped, together with anything pushed above it.
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub struct FrameGuard {
    tcb: Arc<Tcb>,
    depth: usize,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.tcb.inner.lock().frames.truncate(self.depth);
    }
}
