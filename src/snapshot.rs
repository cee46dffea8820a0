//! Diagnostic snapshots of thread state.
//!
//! A [`Snapshot`] is a copy taken under the thread's lock. It holds no
//! reference back to the [`Tcb`], so dumping never races the live thread and
//! never mutates it.

use std::fmt::{self, Write};

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::thread::{Frame, Id, Priority, State, Tcb};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: Id,
    pub name: String,
    pub state: State,
    pub priority: Priority,
    pub interrupted: bool,
    /// Innermost frame first.
    pub frames: Vec<Frame>,
}

impl Snapshot {
    pub fn capture(tcb: &Tcb) -> Snapshot {
        let inner = tcb.lock();
        Snapshot {
            id: tcb.id(),
            name: inner.name.clone(),
            state: inner.state,
            priority: inner.priority,
            interrupted: inner.interrupted,
            frames: inner.frames.iter().rev().cloned().collect(),
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\" {} prio={} {}",
            self.name, self.id, self.priority, self.state
        )?;
        if self.interrupted {
            f.write_str(" (interrupted)")?;
        }
        for frame in &self.frames {
            write!(f, "\n\tat {frame}")?;
        }
        Ok(())
    }
}

/// Snapshots of the requested threads that are still registered, in request
/// order. Threads that terminated in the meantime are left out.
pub fn dump(registry: &Registry, ids: &[Id]) -> Vec<Snapshot> {
    ids.iter()
        .filter_map(|id| registry.get(*id))
        .map(|tcb| Snapshot::capture(&tcb))
        .filter(|snapshot| snapshot.state != State::Terminated)
        .collect()
}

/// Depth of the thread's trace. Not defined for a thread that never ran.
pub fn count_frames(tcb: &Tcb) -> Result<usize> {
    let inner = tcb.lock();
    if inner.state == State::New {
        return Err(Error::IllegalThreadState {
            id: tcb.id(),
            state: inner.state,
            op: "countStackFrames",
        });
    }
    Ok(inner.frames.len())
}

/// Renders snapshots as a textual thread dump, one block per thread.
pub fn render(snapshots: &[Snapshot]) -> String {
    let mut out = String::new();
    for snapshot in snapshots {
        // writing into a String cannot fail
        let _ = writeln!(out, "{snapshot}\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{ExitStatus, Tcb};
    use std::sync::Arc;

    fn running(registry: &Registry, name: &str) -> Arc<Tcb> {
        let tcb = Tcb::new(
            registry.allocate_id(),
            name.to_string(),
            Priority(5),
            Box::new(|| Ok(())),
        );
        assert!(tcb.mark_running());
        registry.register(&tcb).unwrap();
        tcb
    }

    #[test]
    fn test_dump_skips_missing_and_keeps_order() {
        let registry = Registry::new();
        let a = running(&registry, "a");
        let b = running(&registry, "b");
        let c = running(&registry, "c");
        registry.unregister(&b);
        b.terminate(ExitStatus::Completed);

        let snapshots = dump(&registry, &[c.id(), b.id(), Id(999), a.id()]);
        let ids: Vec<_> = snapshots.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![c.id(), a.id()]);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let registry = Registry::new();
        let a = running(&registry, "a");
        let guard = a.push_frame(Frame::new("outer"));
        let inner = a.push_frame(Frame::new("inner"));
        let snapshot = Snapshot::capture(&a);
        drop(inner);
        drop(guard);

        assert_eq!(snapshot.depth(), 2);
        assert_eq!(snapshot.frames[0].method, "inner");
        assert_eq!(count_frames(&a).unwrap(), 0);
    }

    #[test]
    fn test_count_frames_rejects_new() {
        let tcb = Tcb::new(Id(3), "fresh".into(), Priority(5), Box::new(|| Ok(())));
        assert!(matches!(
            count_frames(&tcb),
            Err(Error::IllegalThreadState {
                state: State::New,
                ..
            })
        ));
    }

    #[test]
    fn test_render() {
        let snapshot = Snapshot {
            id: Id(4),
            name: "worker".into(),
            state: State::BlockedInterruptible,
            priority: Priority(7),
            interrupted: false,
            frames: vec![Frame::new("sleep"), Frame::new("run")],
        };
        let text = render(&[snapshot]);
        assert!(text.starts_with("\"worker\" #4 prio=7 BLOCKED_INTERRUPTIBLE"));
        assert!(text.contains("\n\tat sleep\n\tat run"));
    }
}
