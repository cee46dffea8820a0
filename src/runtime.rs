use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::monitor::Monitor;
use crate::os::OsThread;
use crate::registry::Registry;
use crate::snapshot::{self, Snapshot};
use crate::thread::{Body, ExitStatus, Frame, FrameGuard, Id, Priority, State, Tcb};

/// The operations a managed thread object can invoke on the runtime.
///
/// Everything here is safe to use. Stop, suspend and resume live on
/// [`LegacyThreadControl`] instead.
pub trait ThreadController {
    /// Starts a `NEW` thread. The thread becomes `RUNNABLE` once its native
    /// thread is executing, not when this call returns.
    fn start(&self, tcb: &Arc<Tcb>) -> Result<()>;

    /// Momentary answer; the thread may start or finish right after.
    fn is_alive(&self, tcb: &Tcb) -> bool;

    /// Clamps `value` into the configured range, stores it and applies it to
    /// the native thread if there is one. Returns the applied priority.
    fn set_priority(&self, tcb: &Tcb, value: i32) -> Priority;

    /// Scheduler hint. No state change and no guaranteed effect.
    fn yield_now(&self);

    /// Blocks the calling thread for at least `millis` milliseconds.
    ///
    /// Interruptible: fails with [`Error::Interrupted`] and clears the flag.
    fn sleep_current(&self, millis: u64) -> Result<()>;

    /// The record of the calling thread. Always resolves; threads the runtime
    /// did not create are attached on first use.
    fn current_thread(&self) -> Arc<Tcb>;

    fn count_stack_frames(&self, tcb: &Tcb) -> Result<usize>;

    /// Sets the sticky interrupt flag and wakes the thread if it is blocked
    /// in an interruptible wait.
    fn interrupt(&self, tcb: &Tcb);

    /// Reads the interrupt flag; with `clear` the flag is reset in the same
    /// critical section, so a concurrent interrupt is never lost.
    fn is_interrupted(&self, tcb: &Tcb, clear: bool) -> bool;

    /// Whether `tcb` owns `monitor`. Does not touch the monitor's lock.
    fn holds_lock(&self, tcb: &Tcb, monitor: &Monitor) -> bool;

    fn get_threads(&self) -> Vec<Id>;

    fn dump_threads(&self, ids: &[Id]) -> Vec<Snapshot>;

    fn set_native_name(&self, tcb: &Tcb, name: &str);
}

/// Legacy control operations.
///
/// # Hazards
///
/// `request_stop` terminates a thread wherever it is; the thread only notices
/// at its next safe point and whatever invariants it was maintaining are left
/// half done. `suspend` keeps every lock the target holds, so a resumer that
/// needs one of them deadlocks. Nothing here tries to prevent either.
pub trait LegacyThreadControl {
    /// Moves any non-terminal thread straight to `TERMINATED` and releases its
    /// native handle. A running target still resolves to its own record and
    /// fails with [`Error::Stopped`] at its next safe point.
    fn request_stop(&self, tcb: &Tcb, cause: Option<&str>) -> Result<()>;

    /// `RUNNABLE -> SUSPENDED`. Returns `false` for a warned no-op.
    fn suspend(&self, tcb: &Tcb) -> Result<bool>;

    /// `SUSPENDED -> RUNNABLE`. Returns `false` for a warned no-op.
    fn resume(&self, tcb: &Tcb) -> Result<bool>;
}

struct Shared {
    config: RuntimeConfig,
    registry: Arc<Registry>,
    /// Started threads whose entry has not returned yet.
    live: AtomicUsize,
}

/// Lifecycle controller. Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
}

impl Runtime {
    /// Builds a runtime with its own registry and attaches the calling thread
    /// as the initial thread.
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_registry(config, Arc::new(Registry::new()))
    }

    pub fn with_registry(config: RuntimeConfig, registry: Arc<Registry>) -> Self {
        let runtime = Runtime {
            shared: Arc::new(Shared {
                config,
                registry,
                live: AtomicUsize::new(0),
            }),
        };
        if runtime.registry().current().is_none() {
            let name = runtime.config().main_thread_name.clone();
            let main = runtime.attach_with_name(name);
            info!(thread = %main.id(), "runtime initialised");
        }
        runtime
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    /// Creates a `NEW` thread running `f` once started.
    pub fn create_thread<F>(&self, f: F) -> Arc<Tcb>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let id = self.registry().allocate_id();
        let name = format!("{}{}", self.config().name_prefix, id.0);
        self.new_tcb(id, name, Box::new(f))
    }

    pub fn create_named_thread<F>(&self, name: impl Into<String>, f: F) -> Arc<Tcb>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let id = self.registry().allocate_id();
        self.new_tcb(id, name.into(), Box::new(f))
    }

    /// [`create_named_thread`](Self::create_named_thread) followed by `start`.
    pub fn spawn<F>(&self, name: impl Into<String>, f: F) -> Result<Arc<Tcb>>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let tcb = self.create_named_thread(name, f);
        self.start(&tcb)?;
        Ok(tcb)
    }

    fn new_tcb(&self, id: Id, name: String, body: Body) -> Arc<Tcb> {
        let priority = self.config().priority.norm();
        debug!(thread = %id, %name, "created thread");
        Tcb::new(id, name, priority, body)
    }

    /// Attaches the calling native thread, or returns its existing record.
    pub fn attach_current(&self) -> Arc<Tcb> {
        if let Some(tcb) = self.registry().current() {
            return tcb;
        }
        let name = std::thread::current().name().unwrap_or_default().to_owned();
        self.attach_with_name(name)
    }

    fn attach_with_name(&self, name: String) -> Arc<Tcb> {
        let id = self.registry().allocate_id();
        let name = if name.is_empty() {
            format!("{}{}", self.config().name_prefix, id.0)
        } else {
            name
        };
        let tcb = Tcb::attached(
            id,
            name,
            self.config().priority.norm(),
            std::thread::current().id(),
        );
        if let Err(err) = self.registry().register(&tcb) {
            // fresh identities cannot collide; keep going unregistered
            error!(thread = %id, %err, "attach failed");
        }
        debug!(thread = %id, "attached native thread");
        tcb
    }

    /// Removes the record of the calling thread if it was attached rather than
    /// started. Returns whether anything was removed.
    pub fn detach_current(&self) -> bool {
        match self.registry().current() {
            Some(tcb) if tcb.is_attached() => {
                self.registry().unregister(&tcb);
                tcb.terminate(ExitStatus::Completed);
                self.registry().unbind(&tcb)
            }
            _ => false,
        }
    }

    /// Waits until `tcb` has terminated. Returns at once for a thread that was
    /// never started. Interruptible, and a safe point even when it does not block.
    pub fn join(&self, tcb: &Arc<Tcb>) -> Result<()> {
        self.join_until(tcb, None).map(|_| ())
    }

    /// Like [`join`](Self::join) with an upper bound. Returns whether the
    /// thread finished in time.
    pub fn join_timeout(&self, tcb: &Arc<Tcb>, timeout: Duration) -> Result<bool> {
        self.join_until(tcb, Instant::now().checked_add(timeout))
    }

    fn join_until(&self, target: &Arc<Tcb>, deadline: Option<Instant>) -> Result<bool> {
        let me = self.current_thread();
        if me.id() == target.id() {
            return Err(Error::IllegalThreadState {
                id: target.id(),
                state: target.state(),
                op: "join",
            });
        }
        me.safepoint()?;
        if !target.add_joiner(&me) {
            return Ok(true);
        }
        let result = me.block_interruptibly("join", deadline, |_| target.is_terminated());
        target.remove_joiner(me.id());
        result
    }

    /// Joins every started thread, including ones started while waiting.
    ///
    /// Threads that were started but have not registered yet are waited for
    /// too, as are stopped threads that have not reached a safe point.
    pub fn join_all(&self) -> Result<()> {
        let me = self.current_thread();
        let own_slot = usize::from(!me.is_attached());
        loop {
            let pending: Vec<_> = self
                .registry()
                .threads()
                .into_iter()
                .filter(|t| t.id() != me.id() && !t.is_attached())
                .collect();
            if pending.is_empty() {
                if self.shared.live.load(Ordering::Acquire) <= own_slot {
                    return Ok(());
                }
                self.sleep_current(1)?;
                continue;
            }
            for tcb in pending {
                self.join(&tcb)?;
            }
        }
    }

    /// Pushes a frame on the calling thread's trace until the guard drops.
    pub fn enter_frame(&self, method: impl Into<String>) -> FrameGuard {
        self.current_thread().push_frame(Frame::new(method))
    }

    /// Explicit safe point: parks while the calling thread is suspended and
    /// fails with [`Error::Stopped`] once it has been stopped.
    pub fn safepoint(&self) -> Result<()> {
        self.current_thread().safepoint()
    }

    /// Access to stop, suspend and resume. Fails unless the configuration opts in.
    pub fn legacy(&self) -> Result<Legacy<'_>> {
        if !self.config().allow_legacy_control {
            return Err(Error::LegacyDisabled("legacy thread control"));
        }
        Ok(Legacy { runtime: self })
    }

    fn is_current(&self, tcb: &Tcb) -> bool {
        tcb.os_thread_id() == Some(std::thread::current().id())
    }

    fn reserve_slot(&self, id: Id) -> Result<()> {
        let limit = self.config().max_threads;
        self.shared
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| match limit {
                Some(max) if live >= max => None,
                _ => Some(live + 1),
            })
            .map(|_| ())
            .map_err(|live| Error::ResourceExhausted {
                id,
                reason: format!("thread limit of {live} reached"),
            })
    }

    fn release_slot(&self) {
        self.shared.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Runs on the new native thread: register and go `RUNNABLE` in one step,
    /// run the body, unregister, unbind, terminate. Unregistration precedes the
    /// terminal transition so a returning join never finds the thread still
    /// registered. A thread stopped while running stays bound to its record
    /// until here, so its next safe point fails with [`Error::Stopped`].
    fn run_entry(&self, tcb: Arc<Tcb>, body: Body) {
        tcb.bind_os_thread(std::thread::current().id());
        match self.registry().register_started(&tcb) {
            Ok(true) => {}
            Ok(false) => {
                // stopped before it got to run
                self.release_slot();
                return;
            }
            Err(err) => {
                tcb.terminate(ExitStatus::StartFailed(err.to_string()));
                self.release_slot();
                return;
            }
        }

        let status = {
            let _run = tcb.push_frame(Frame::new("run"));
            match panic::catch_unwind(AssertUnwindSafe(body)) {
                Ok(Ok(())) => ExitStatus::Completed,
                Ok(Err(Error::Stopped(_))) => ExitStatus::Stopped,
                Ok(Err(err)) => {
                    debug!(thread = %tcb.id(), %err, "thread body failed");
                    ExitStatus::Failed(err.to_string())
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(thread = %tcb.id(), %message, "thread body panicked");
                    ExitStatus::Panicked(message)
                }
            }
        };

        // cleanup after the body returns
        self.registry().unregister(&tcb);
        self.registry().unbind(&tcb);
        self.release_slot();
        if tcb.terminate(status) {
            debug!(thread = %tcb.id(), "thread finished");
        }
    }
}

impl ThreadController for Runtime {
    fn start(&self, tcb: &Arc<Tcb>) -> Result<()> {
        let (body, name, priority) = {
            let mut inner = tcb.lock();
            if inner.state != State::New || inner.starting {
                return Err(Error::AlreadyStarted(tcb.id()));
            }
            let Some(body) = inner.body.take() else {
                return Err(Error::AlreadyStarted(tcb.id()));
            };
            inner.starting = true;
            (body, inner.name.clone(), inner.priority)
        };

        if let Err(err) = self.reserve_slot(tcb.id()) {
            warn!(thread = %tcb.id(), %err, "start refused");
            tcb.terminate(ExitStatus::StartFailed(err.to_string()));
            return Err(err);
        }

        let runtime = self.clone();
        let target = Arc::clone(tcb);
        let spawned = OsThread::spawn(&name, self.config().stack_size, priority, move || {
            runtime.run_entry(target, body)
        });
        match spawned {
            Ok(os) => {
                debug!(thread = %tcb.id(), native = ?os.id(), "start requested");
                tcb.install_handle(os);
                Ok(())
            }
            Err(io) => {
                self.release_slot();
                let reason = io.to_string();
                warn!(thread = %tcb.id(), %reason, "native thread creation failed");
                tcb.terminate(ExitStatus::StartFailed(reason.clone()));
                Err(Error::ResourceExhausted {
                    id: tcb.id(),
                    reason,
                })
            }
        }
    }

    fn is_alive(&self, tcb: &Tcb) -> bool {
        tcb.state().is_alive()
    }

    fn set_priority(&self, tcb: &Tcb, value: i32) -> Priority {
        let range = self.config().priority;
        let applied = range.clamp(value);
        if applied.get() != value {
            warn!(thread = %tcb.id(), requested = value, %applied, "priority clamped");
        }
        let mut inner = tcb.lock();
        inner.priority = applied;
        if inner.state.is_alive() {
            if let Some(os) = inner.handle.as_mut() {
                os.set_priority(applied);
            }
        }
        applied
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn sleep_current(&self, millis: u64) -> Result<()> {
        let tcb = self.current_thread();
        let deadline = Instant::now().checked_add(Duration::from_millis(millis));
        tcb.block_interruptibly("sleep", deadline, |_| false)
            .map(|_| ())
    }

    fn current_thread(&self) -> Arc<Tcb> {
        self.attach_current()
    }

    fn count_stack_frames(&self, tcb: &Tcb) -> Result<usize> {
        snapshot::count_frames(tcb)
    }

    fn interrupt(&self, tcb: &Tcb) {
        tcb.interrupt();
    }

    fn is_interrupted(&self, tcb: &Tcb, clear: bool) -> bool {
        tcb.test_interrupted(clear)
    }

    fn holds_lock(&self, tcb: &Tcb, monitor: &Monitor) -> bool {
        monitor.is_held_by(tcb.id())
    }

    fn get_threads(&self) -> Vec<Id> {
        self.registry().snapshot_all()
    }

    fn dump_threads(&self, ids: &[Id]) -> Vec<Snapshot> {
        snapshot::dump(self.registry(), ids)
    }

    fn set_native_name(&self, tcb: &Tcb, name: &str) {
        let mut inner = tcb.lock();
        trace!(thread = %tcb.id(), from = %inner.name, to = name, "renamed");
        inner.name = name.to_string();
        if let Some(os) = inner.handle.as_mut() {
            os.set_name(name);
        }
    }
}

/// Handle to the legacy control operations, obtained from [`Runtime::legacy`].
pub struct Legacy<'a> {
    runtime: &'a Runtime,
}

impl LegacyThreadControl for Legacy<'_> {
    fn request_stop(&self, tcb: &Tcb, cause: Option<&str>) -> Result<()> {
        let state = tcb.state();
        if state == State::Terminated {
            return Err(Error::IllegalThreadState {
                id: tcb.id(),
                state,
                op: "stop",
            });
        }
        self.runtime.registry().unregister(tcb);
        if !tcb.terminate(ExitStatus::Stopped) {
            return Err(Error::IllegalThreadState {
                id: tcb.id(),
                state: State::Terminated,
                op: "stop",
            });
        }
        warn!(thread = %tcb.id(), cause = cause.unwrap_or("none"), "thread stopped");
        Ok(())
    }

    fn suspend(&self, tcb: &Tcb) -> Result<bool> {
        let suspended = {
            let mut inner = tcb.lock();
            match inner.state {
                State::Runnable => {
                    inner.state = State::Suspended;
                    trace!(thread = %tcb.id(), "RUNNABLE -> SUSPENDED");
                    true
                }
                State::BlockedInterruptible => {
                    return Err(Error::IllegalThreadState {
                        id: tcb.id(),
                        state: inner.state,
                        op: "suspend",
                    });
                }
                state => {
                    warn!(thread = %tcb.id(), %state, "suspend has no effect");
                    false
                }
            }
        };
        if suspended && self.runtime.is_current(tcb) {
            tcb.safepoint()?;
        }
        Ok(suspended)
    }

    fn resume(&self, tcb: &Tcb) -> Result<bool> {
        let mut inner = tcb.lock();
        if inner.state != State::Suspended {
            warn!(thread = %tcb.id(), state = %inner.state, "resume has no effect");
            return Ok(false);
        }
        inner.state = State::Runnable;
        trace!(thread = %tcb.id(), "SUSPENDED -> RUNNABLE");
        drop(inner);
        tcb.wake();
        Ok(true)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_runtime_attaches_main_thread() {
        let rt = Runtime::new(RuntimeConfig::default());
        let main = rt.current_thread();
        assert_eq!(main.id(), crate::BASE_THREAD_ID);
        assert_eq!(main.name(), "main");
        assert_eq!(main.state(), State::Runnable);
        assert_eq!(rt.get_threads(), vec![main.id()]);
    }

    #[test]
    fn test_create_thread_generates_name() {
        let rt = Runtime::new(RuntimeConfig::default().with_name_prefix("w-"));
        let tcb = rt.create_thread(|| Ok(()));
        assert_eq!(tcb.name(), format!("w-{}", tcb.id().0));
        assert_eq!(tcb.state(), State::New);
        assert!(!rt.is_alive(&tcb));
    }

    #[test]
    fn test_start_twice_fails() {
        let rt = Runtime::new(RuntimeConfig::default());
        let tcb = rt.create_thread(|| Ok(()));
        rt.start(&tcb).unwrap();
        assert!(matches!(rt.start(&tcb), Err(Error::AlreadyStarted(_))));
        rt.join(&tcb).unwrap();
        assert_eq!(tcb.exit_status(), Some(ExitStatus::Completed));
    }

    #[test]
    fn test_thread_limit_exhausts() {
        let rt = Runtime::new(RuntimeConfig::default().with_max_threads(1));
        let (tx, rx) = mpsc::channel::<()>();
        let first = rt
            .spawn("holder", move || {
                let _ = rx.recv();
                Ok(())
            })
            .unwrap();

        let second = rt.create_thread(|| Ok(()));
        assert!(matches!(
            rt.start(&second),
            Err(Error::ResourceExhausted { .. })
        ));
        assert_eq!(second.state(), State::Terminated);
        assert!(matches!(
            second.exit_status(),
            Some(ExitStatus::StartFailed(_))
        ));
        assert!(!rt.registry().contains(second.id()));

        tx.send(()).unwrap();
        rt.join(&first).unwrap();
    }

    #[test]
    fn test_set_priority_clamps() {
        let rt = Runtime::new(RuntimeConfig::default());
        let tcb = rt.create_thread(|| Ok(()));
        assert_eq!(rt.set_priority(&tcb, 42), Priority(10));
        assert_eq!(tcb.priority(), Priority(10));
        assert_eq!(rt.set_priority(&tcb, -3), Priority(1));
        assert_eq!(rt.set_priority(&tcb, 7), Priority(7));
    }

    #[test]
    fn test_body_error_and_panic_are_recorded() {
        let rt = Runtime::new(RuntimeConfig::default());
        let failing = rt.spawn("failing", || Err(Error::Interrupted)).unwrap();
        let panicking = rt.spawn("panicking", || panic!("boom")).unwrap();
        rt.join(&failing).unwrap();
        rt.join(&panicking).unwrap();
        assert_eq!(
            failing.exit_status(),
            Some(ExitStatus::Failed("thread interrupted".into()))
        );
        assert_eq!(
            panicking.exit_status(),
            Some(ExitStatus::Panicked("boom".into()))
        );
    }

    #[test]
    fn test_legacy_requires_opt_in() {
        let rt = Runtime::new(RuntimeConfig::default());
        assert!(matches!(rt.legacy(), Err(Error::LegacyDisabled(_))));
        let rt = Runtime::new(RuntimeConfig::legacy());
        assert!(rt.legacy().is_ok());
    }

    #[test]
    fn test_join_self_is_illegal() {
        let rt = Runtime::new(RuntimeConfig::default());
        let me = rt.current_thread();
        assert!(matches!(
            rt.join(&me),
            Err(Error::IllegalThreadState { op: "join", .. })
        ));
    }

    #[test]
    fn test_join_never_started_returns() {
        let rt = Runtime::new(RuntimeConfig::default());
        let tcb = rt.create_thread(|| Ok(()));
        rt.join(&tcb).unwrap();
        assert_eq!(tcb.state(), State::New);
    }

    #[test]
    fn test_set_native_name() {
        let rt = Runtime::new(RuntimeConfig::default());
        let tcb = rt.create_thread(|| Ok(()));
        rt.set_native_name(&tcb, "renamed");
        assert_eq!(tcb.name(), "renamed");
    }
}
