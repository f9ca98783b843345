//! Registry teardown and fatal-path behaviour with several threads.

#![cfg(not(loom))]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use critsect::{CritSectError, CritSectFlags, CritSectRegistry};
use lockval::{ClassFlags, Error, LockValidator, SrcPos, SubClass, ThreadHandle, ValidatorConfig};

fn registry() -> CritSectRegistry {
    CritSectRegistry::new(LockValidator::new(ValidatorConfig::default().quiet(true).may_panic(false)))
}

#[test]
fn subclass_order_is_enforced_across_sections() {
    let reg = registry();
    let class = reg.validator().classes().register("device", ClassFlags::empty());
    let outer = reg.create_with(1, "outer", class, SubClass::user(1), CritSectFlags::empty(), SrcPos::caller());
    let inner = reg.create_with(1, "inner", class, SubClass::user(2), CritSectFlags::empty(), SrcPos::caller());

    outer.enter(SrcPos::caller()).unwrap();
    inner.enter(SrcPos::caller()).unwrap();
    inner.leave().unwrap();
    outer.leave().unwrap();

    inner.enter(SrcPos::caller()).unwrap();
    assert_eq!(
        outer.enter(SrcPos::caller()),
        Err(CritSectError::Validator(Error::OrderViolation))
    );
    assert!(!outer.is_owned());
    inner.leave().unwrap();
    assert_eq!(reg.delete_by_key(1), Ok(2));
}

#[test]
fn unvalidated_section_skips_order_checks() {
    let reg = registry();
    let class = reg.validator().classes().register("device", ClassFlags::empty());
    let low = reg.create_with(0, "low", class, SubClass::user(1), CritSectFlags::NO_VALIDATION, SrcPos::caller());
    let high = reg.create_with(0, "high", class, SubClass::user(2), CritSectFlags::empty(), SrcPos::caller());

    high.enter(SrcPos::caller()).unwrap();
    low.enter(SrcPos::caller()).unwrap();
    assert!(low.record().is_none());
    low.leave().unwrap();
    high.leave().unwrap();
}

#[test]
fn delete_by_key_leaves_other_keys() {
    let reg = registry();
    for i in 0..4 {
        reg.create(9, format!("dev{i}"), SrcPos::caller());
    }
    reg.create(3, "other", SrcPos::caller());
    assert_eq!(reg.delete_by_key(9), Ok(4));
    assert_eq!(reg.names(), ["other"]);
}

#[test]
fn leave_all_unblocks_waiters_of_a_failing_thread() {
    let reg = Arc::new(registry());
    let a = reg.create(0, "a", SrcPos::caller());
    let b = reg.create(0, "b", SrcPos::caller());
    a.enter(SrcPos::caller()).unwrap();
    b.enter(SrcPos::caller()).unwrap();
    a.enter(SrcPos::caller()).unwrap();

    let waiter = {
        let a = Arc::clone(&a);
        thread::spawn(move || {
            a.enter(SrcPos::caller()).unwrap();
            let owned = a.is_owner();
            a.leave().unwrap();
            owned
        })
    };
    while a.waiters() == 0 {
        thread::sleep(Duration::from_millis(1));
    }

    let (count, names) = reg.count_owned(32);
    assert_eq!(count, 2);
    assert_eq!(names, "a, b");

    // Out-of-order nesting would be rejected by a normal leave.
    assert_eq!(reg.leave_all(), 2);
    assert!(waiter.join().unwrap());
    assert_eq!(ThreadHandle::current().held_depth(), 0);
    assert_eq!(reg.count_owned(32), (0, String::new()));
}
