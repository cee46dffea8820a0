//! Registry consistency under concurrent start and termination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use threadctl::{Registry, Result, Runtime, RuntimeConfig, ThreadController, BASE_THREAD_ID};

#[test]
fn test_snapshot_never_observes_partial_entries() -> Result<()> {
    let rt = Runtime::new(RuntimeConfig::default());
    let done = Arc::new(AtomicBool::new(false));

    let reader = std::thread::spawn({
        let registry = Arc::clone(rt.registry());
        let done = Arc::clone(&done);
        move || {
            let mut observed = 0usize;
            while !done.load(Ordering::Acquire) {
                let ids = registry.snapshot_all();
                assert!(ids.windows(2).all(|w| w[0] < w[1]), "unordered {ids:?}");

                for tcb in registry.threads() {
                    // a registered thread is always bound to its native thread
                    assert!(tcb.os_thread_id().is_some());
                }
                observed = observed.max(ids.len());
            }
            observed
        }
    });

    for round in 0..50 {
        let tcb = rt.spawn(format!("churn-{round}"), || Ok(()))?;
        if round % 2 == 0 {
            rt.join(&tcb)?;
        }
    }
    rt.join_all()?;
    done.store(true, Ordering::Release);

    let observed = reader.join().unwrap();
    assert!(observed >= 1);
    assert_eq!(rt.get_threads(), vec![BASE_THREAD_ID]);
    Ok(())
}

#[test]
fn test_runtimes_can_share_a_registry() -> Result<()> {
    let registry = Arc::new(Registry::new());
    let first = Runtime::with_registry(RuntimeConfig::default(), Arc::clone(&registry));
    let second = Runtime::with_registry(RuntimeConfig::default(), Arc::clone(&registry));

    // the calling thread is attached once
    assert_eq!(first.current_thread().id(), second.current_thread().id());
    assert_eq!(registry.len(), 1);

    let a = first.create_thread(|| Ok(()));
    let b = second.create_thread(|| Ok(()));
    assert_ne!(a.id(), b.id());

    first.start(&a)?;
    second.start(&b)?;
    first.join(&a)?;
    second.join(&b)?;
    assert_eq!(registry.snapshot_all(), vec![BASE_THREAD_ID]);
    Ok(())
}
