//! Monitor ownership, notification and interruptible waits.

use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use threadctl::{Error, Monitor, Result, Runtime, RuntimeConfig, State, ThreadController};

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_notify_wakes_waiter() -> Result<()> {
    let rt = Runtime::new(RuntimeConfig::default());
    let monitor = Arc::new(Monitor::new());
    let (tx, rx) = mpsc::channel();

    let waiter = rt.spawn("waiter", {
        let rt = rt.clone();
        let monitor = Arc::clone(&monitor);
        move || {
            let _guard = monitor.enter(&rt);
            let notified = monitor.wait(&rt, None)?;
            let me = rt.current_thread();
            tx.send((notified, rt.holds_lock(&me, &monitor))).unwrap();
            Ok(())
        }
    })?;
    wait_for("waiter to park", || {
        monitor.waiters() == 1 && waiter.state() == State::BlockedInterruptible
    });
    assert_eq!(monitor.owner(), None);

    {
        let _guard = monitor.enter(&rt);
        monitor.notify(&rt)?;
    }
    assert_eq!(rx.recv().unwrap(), (true, true));
    rt.join(&waiter)
}

#[test]
fn test_interrupt_wakes_monitor_wait() -> Result<()> {
    let rt = Runtime::new(RuntimeConfig::default());
    let monitor = Arc::new(Monitor::new());
    let (tx, rx) = mpsc::channel();

    let waiter = rt.spawn("waiter", {
        let rt = rt.clone();
        let monitor = Arc::clone(&monitor);
        move || {
            let _guard = monitor.enter(&rt);
            let result = monitor.wait(&rt, None);
            let me = rt.current_thread();
            tx.send((
                matches!(result, Err(Error::Interrupted)),
                rt.holds_lock(&me, &monitor),
                rt.is_interrupted(&me, false),
            ))
            .unwrap();
            Ok(())
        }
    })?;
    wait_for("waiter to park", || monitor.waiters() == 1);

    rt.interrupt(&waiter);
    assert_eq!(rx.recv().unwrap(), (true, true, false));
    rt.join(&waiter)?;
    assert_eq!(monitor.waiters(), 0);
    assert_eq!(monitor.owner(), None);
    Ok(())
}

#[test]
fn test_holds_lock_observed_from_other_thread() -> Result<()> {
    let rt = Runtime::new(RuntimeConfig::default());
    let me = rt.current_thread();
    let monitor = Arc::new(Monitor::new());
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let holder = rt.spawn("holder", {
        let rt = rt.clone();
        let monitor = Arc::clone(&monitor);
        move || {
            let _guard = monitor.enter(&rt);
            let _ = release_rx.recv();
            Ok(())
        }
    })?;
    wait_for("holder to own the monitor", || {
        rt.holds_lock(&holder, &monitor)
    });
    assert!(!rt.holds_lock(&me, &monitor));
    assert!(monitor.try_enter(&rt).is_none());

    release_tx.send(()).unwrap();
    rt.join(&holder)?;
    assert!(!rt.holds_lock(&holder, &monitor));
    assert!(monitor.try_enter(&rt).is_some());
    Ok(())
}

#[test]
fn test_notify_all_wakes_every_waiter() -> Result<()> {
    let rt = Runtime::new(RuntimeConfig::default());
    let monitor = Arc::new(Monitor::new());

    let waiters: Vec<_> = (0..3)
        .map(|i| {
            rt.spawn(format!("waiter-{i}"), {
                let rt = rt.clone();
                let monitor = Arc::clone(&monitor);
                move || {
                    let _guard = monitor.enter(&rt);
                    monitor.wait(&rt, None).map(|_| ())
                }
            })
        })
        .collect::<Result<_>>()?;
    wait_for("all waiters to park", || monitor.waiters() == 3);

    {
        let _guard = monitor.enter(&rt);
        monitor.notify_all(&rt)?;
    }
    for waiter in &waiters {
        rt.join(waiter)?;
        assert_eq!(waiter.exit_status(), Some(threadctl::ExitStatus::Completed));
    }
    Ok(())
}
