//! Critical sections shared between real threads.

#![cfg(not(loom))]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use critsect::{CritSectError, CritSectRegistry};
use lockval::{Error, LockValidator, SrcPos, ThreadHandle, ValidatorConfig};

fn registry() -> CritSectRegistry {
    CritSectRegistry::new(LockValidator::new(ValidatorConfig::default().quiet(true).may_panic(false)))
}

#[test]
fn serializes_increments() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 500;

    let reg = registry();
    let cs = reg.create(0, "counter", SrcPos::caller());
    let counter = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..THREADS {
            let cs = &cs;
            let counter = &counter;
            s.spawn(move || {
                for _ in 0..ROUNDS {
                    let _guard = cs.lock().unwrap();
                    // Split load/store loses updates unless serialized.
                    let n = counter.load(Ordering::Relaxed);
                    counter.store(n + 1, Ordering::Relaxed);
                }
            });
        }
    });

    assert_eq!(counter.load(Ordering::Relaxed), THREADS * ROUNDS);
    let stats = cs.stats();
    assert_eq!(stats.acquisitions, (THREADS * ROUNDS) as u64);
    assert!(stats.contention_unlock <= stats.contention_lock);
    assert!(!cs.is_owned());
    assert_eq!(cs.waiters(), 0);
}

#[test]
fn crossed_enter_reports_deadlock_instead_of_hanging() {
    let reg = registry();
    let a = reg.create(0, "A", SrcPos::caller());
    let b = reg.create(0, "B", SrcPos::caller());
    let owned = Arc::new(Barrier::new(2));

    let spawn = |first: Arc<critsect::CritSect>, second: Arc<critsect::CritSect>| {
        let owned = Arc::clone(&owned);
        thread::spawn(move || {
            first.enter(SrcPos::caller()).unwrap();
            owned.wait();
            let result = second.enter(SrcPos::caller());
            if result.is_ok() {
                second.leave().unwrap();
            }
            first.leave().unwrap();
            result
        })
    };

    let t1 = spawn(Arc::clone(&a), Arc::clone(&b));
    let t2 = spawn(Arc::clone(&b), Arc::clone(&a));
    let results = [t1.join().unwrap(), t2.join().unwrap()];

    let deadlock = Err(CritSectError::Validator(Error::DeadlockDetected));
    assert_eq!(results.iter().filter(|r| **r == deadlock).count(), 1, "{results:?}");
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "{results:?}");
    assert!(!a.is_owned());
    assert!(!b.is_owned());
    assert_eq!(reg.validator().violation_count(), 1);
}

#[test]
fn waiter_is_reported_blocked() {
    let reg = registry();
    let cs = reg.create(0, "busy", SrcPos::caller());
    cs.enter(SrcPos::caller()).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    let waiter = {
        let cs = Arc::clone(&cs);
        thread::spawn(move || {
            tx.send(ThreadHandle::current()).unwrap();
            cs.enter(SrcPos::caller()).unwrap();
            cs.leave().unwrap();
        })
    };

    let handle = rx.recv().unwrap();
    while handle.query_blocking().is_none() || cs.waiters() == 0 {
        thread::yield_now();
    }
    let info = handle.query_blocking().unwrap();
    assert_eq!(info.lock_name, "busy");
    assert_eq!(info.state, lockval::ThreadState::BlockedCritSect);

    cs.leave().unwrap();
    waiter.join().unwrap();
    assert!(handle.query_blocking().is_none());
    assert_eq!(cs.stats().contention_lock, 1);
    assert_eq!(cs.stats().contention_unlock, 1);
}

#[test]
fn exit_event_wakes_after_release() {
    let reg = registry();
    let cs = reg.create(0, "cs", SrcPos::caller());
    let event = Arc::new(critsect::EventSem::new());
    cs.enter(SrcPos::caller()).unwrap();
    cs.schedule_exit_event(Arc::clone(&event)).unwrap();

    let observer = {
        let cs = Arc::clone(&cs);
        let event = Arc::clone(&event);
        thread::spawn(move || {
            event.wait();
            // The section is free by the time the event fires.
            cs.try_enter(SrcPos::caller()).unwrap();
            cs.leave().unwrap();
        })
    };

    cs.leave().unwrap();
    observer.join().unwrap();
}
