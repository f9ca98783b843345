//! Lock order checks against the calling thread's held locks.

use crate::class::ClassFlags;
use crate::error::{Error, Result};
use crate::record::{LockRecord, RecordId};
use crate::report::ViolationReport;
use crate::src_pos::SrcPos;
use crate::thread::{Nest, ThreadHandle};

/// A held lock as seen by the order check.
struct Held {
    record: LockRecord,
    pos: SrcPos,
}

/// Checks that `thread` may acquire `rec` given what it already holds.
///
/// Never blocks and takes no detector lock. Within a class the subclasses
/// must follow the validator's [`OrderDirection`](crate::OrderDirection).
/// Across learning classes, the first observed order wins.
pub(crate) fn check_order(rec: &LockRecord, thread: &ThreadHandle, pos: SrcPos) -> Result<()> {
    let validator = rec.validator();
    let class = rec.class();
    if !rec.is_enabled() || class.is_none() {
        return Ok(());
    }

    let skip = [Some(rec.id()), rec.sibling().map(|s| s.id())];
    let held = snapshot(thread, &skip);
    let direction = validator.order_direction();
    let classes = validator.classes();
    let learning = classes.flags(class).contains(ClassFlags::AUTODIDACT);

    for h in &held {
        let held_class = h.record.class();
        if held_class.is_none() {
            continue;
        }
        if held_class == class {
            if !direction.permits(h.record.sub_class(), rec.sub_class()) {
                return Err(validator.fail(
                    ViolationReport::new(Error::OrderViolation, rec.name(), pos)
                        .with_thread(thread)
                        .with_other(h.record.name(), h.pos)
                        .with_detail(format!(
                            "subclass {} acquired while holding subclass {} of class \"{}\"",
                            rec.sub_class(),
                            h.record.sub_class(),
                            classes.name(class)
                        )),
                ));
            }
        } else if learning
            && classes.flags(held_class).contains(ClassFlags::AUTODIDACT)
            && !classes.learn_order(held_class, class)
        {
            return Err(validator.fail(
                ViolationReport::new(Error::OrderViolation, rec.name(), pos)
                    .with_thread(thread)
                    .with_other(h.record.name(), h.pos)
                    .with_detail(format!(
                        "class \"{}\" was previously acquired before \"{}\"",
                        classes.name(class),
                        classes.name(held_class)
                    )),
            ));
        }
    }
    Ok(())
}

/// Collects the base entries of `thread`'s hold stack, most recent first,
/// skipping the records in `skip`.
fn snapshot(thread: &ThreadHandle, skip: &[Option<RecordId>]) -> Vec<Held> {
    let entries: Vec<_> = thread.with_held(|held| {
        held.iter_top_down()
            .filter(|e| e.nest == Nest::Base && !skip.contains(&Some(e.record)))
            .cloned()
            .collect()
    });
    // Upgrade outside the stack lock: dropping the last strong handle runs
    // the record's destructor, which takes the stack lock itself.
    entries
        .into_iter()
        .filter_map(|e| e.lock.upgrade().map(|record| Held { record, pos: e.pos }))
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::class::{ClassFlags, LockClassId, SubClass};
    use crate::config::{OrderDirection, ValidatorConfig};
    use crate::error::Error;
    use crate::record::{make_siblings, LockRecord};
    use crate::src_pos::SrcPos;
    use crate::validator::LockValidator;

    fn validator(order: OrderDirection) -> LockValidator {
        LockValidator::new(ValidatorConfig::default().quiet(true).may_panic(false).order(order))
    }

    #[test]
    fn ascending_user_subclasses() {
        let v = validator(OrderDirection::Ascending);
        let class = v.classes().register("dev", ClassFlags::empty());
        let a = v.create_excl(class, SubClass::user(1), "a", 0);
        let b = v.create_excl(class, SubClass::user(2), "b", 0);

        b.check_order(None, SrcPos::caller()).unwrap();
        b.set_owner(None, SrcPos::caller(), true);
        assert_eq!(a.check_order(None, SrcPos::caller()), Err(Error::OrderViolation));
        b.release_owner(true).unwrap();

        a.set_owner(None, SrcPos::caller(), true);
        b.check_order(None, SrcPos::caller()).unwrap();
        a.release_owner(true).unwrap();
    }

    #[test]
    fn descending_user_subclasses() {
        let v = validator(OrderDirection::Descending);
        let class = v.classes().register("dev", ClassFlags::empty());
        let a = v.create_excl(class, SubClass::user(1), "a", 0);
        let b = v.create_excl(class, SubClass::user(2), "b", 0);

        b.set_owner(None, SrcPos::caller(), true);
        a.check_order(None, SrcPos::caller()).unwrap();
        b.release_owner(true).unwrap();
    }

    #[test]
    fn subclass_none_is_exclusive_within_class() {
        let v = validator(OrderDirection::Ascending);
        let class = v.classes().register("dev", ClassFlags::empty());
        let a = v.create_excl(class, SubClass::NONE, "a", 0);
        let b = v.create_excl(class, SubClass::NONE, "b", 0);
        let any = v.create_excl(class, SubClass::ANY, "any", 0);

        a.set_owner(None, SrcPos::caller(), true);
        assert_eq!(b.check_order(None, SrcPos::caller()), Err(Error::OrderViolation));
        any.check_order(None, SrcPos::caller()).unwrap();
        a.release_owner(true).unwrap();
    }

    #[test]
    fn held_record_itself_is_skipped() {
        let v = validator(OrderDirection::Ascending);
        let class = v.classes().register("dev", ClassFlags::empty());
        let a = v.create_excl(class, SubClass::NONE, "a", 0);
        a.set_owner(None, SrcPos::caller(), true);
        a.check_order(None, SrcPos::caller()).unwrap();
        a.release_owner(true).unwrap();
    }

    #[test]
    fn siblings_are_skipped() {
        let v = validator(OrderDirection::Ascending);
        let class = v.classes().register("rw", ClassFlags::empty());
        let write = v.create_excl(class, SubClass::NONE, "rw.w", 0);
        let read = v.create_shared(class, SubClass::NONE, "rw.r", 0, false);
        make_siblings(&write.clone().into(), &read.clone().into()).unwrap();

        read.add_owner(None, SrcPos::caller());
        write.check_order(None, SrcPos::caller()).unwrap();
        read.check_and_release(None).unwrap();
    }

    #[test]
    fn unrelated_classes_do_not_interact() {
        let v = validator(OrderDirection::Ascending);
        let c1 = v.classes().register("c1", ClassFlags::empty());
        let c2 = v.classes().register("c2", ClassFlags::empty());
        let a = v.create_excl(c1, SubClass::NONE, "a", 0);
        let b = v.create_excl(c2, SubClass::NONE, "b", 0);

        a.set_owner(None, SrcPos::caller(), true);
        b.check_order(None, SrcPos::caller()).unwrap();
        a.release_owner(true).unwrap();

        b.set_owner(None, SrcPos::caller(), true);
        a.check_order(None, SrcPos::caller()).unwrap();
        b.release_owner(true).unwrap();
    }

    #[test]
    fn autodidact_learns_first_order() {
        let v = validator(OrderDirection::Ascending);
        let c1 = v.classes().register("c1", ClassFlags::AUTODIDACT);
        let c2 = v.classes().register("c2", ClassFlags::AUTODIDACT);
        let a = v.create_excl(c1, SubClass::NONE, "a", 0);
        let b = v.create_excl(c2, SubClass::NONE, "b", 0);

        a.set_owner(None, SrcPos::caller(), true);
        b.check_order(None, SrcPos::caller()).unwrap();
        a.release_owner(true).unwrap();
        assert!(v.classes().is_ordered_before(c1, c2));

        b.set_owner(None, SrcPos::caller(), true);
        assert_eq!(a.check_order(None, SrcPos::caller()), Err(Error::OrderViolation));
        b.release_owner(true).unwrap();
        assert_eq!(v.classes().edge_count(), 1);
    }

    #[test]
    fn classless_records_are_not_checked() {
        let v = validator(OrderDirection::Ascending);
        let a = v.create_excl(LockClassId::NONE, SubClass::NONE, "a", 0);
        let b: LockRecord = v.create_excl(LockClassId::NONE, SubClass::NONE, "b", 0).into();
        a.set_owner(None, SrcPos::caller(), true);
        b.check_order(None, SrcPos::caller()).unwrap();
        a.release_owner(true).unwrap();
    }
}
