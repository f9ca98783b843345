//! Process registry of critical sections.
//!
//! Every section created through a [`CritSectRegistry`] is linked into one
//! list so it can be torn down by owner key, released in bulk by a crashing
//! thread, and inspected for debugging.

use std::sync::Arc;

use lockval::{LockClassId, LockValidator, SrcPos, SubClass, ThreadHandle};
use parking_lot::Mutex;

use crate::critsect::{CritSect, CritSectFlags};
use crate::error::{CritSectError, Result};

/// Registry of every critical section created through it.
pub struct CritSectRegistry {
    validator: LockValidator,
    sections: Mutex<Vec<Arc<CritSect>>>,
    /// Shared section that never serializes. Not part of `sections`.
    nop: Arc<CritSect>,
}

impl CritSectRegistry {
    /// Creates an empty registry whose sections are validated by `validator`.
    pub fn new(validator: LockValidator) -> Self {
        let nop = Arc::new(CritSect::new(
            &validator,
            0,
            "nop",
            LockClassId::NONE,
            SubClass::NONE,
            CritSectFlags::NOP,
        ));
        Self {
            validator,
            sections: Mutex::new(Vec::new()),
            nop,
        }
    }

    /// The validator shared by all sections of this registry.
    pub fn validator(&self) -> &LockValidator {
        &self.validator
    }

    /// The registry's NOP section.
    pub fn nop(&self) -> Arc<CritSect> {
        Arc::clone(&self.nop)
    }

    /// Creates and registers a section without a lock class.
    pub fn create(&self, key: usize, name: impl Into<String>, pos: SrcPos) -> Arc<CritSect> {
        self.create_with(key, name, LockClassId::NONE, SubClass::NONE, CritSectFlags::empty(), pos)
    }

    /// Creates and registers a section with an explicit class and flags.
    pub fn create_with(
        &self,
        key: usize,
        name: impl Into<String>,
        class: LockClassId,
        sub_class: SubClass,
        flags: CritSectFlags,
        pos: SrcPos,
    ) -> Arc<CritSect> {
        let section = Arc::new(CritSect::new(&self.validator, key, name, class, sub_class, flags));
        tracing::debug!(name = section.name(), key, %pos, "registered critical section");
        self.sections.lock().push(Arc::clone(&section));
        section
    }

    /// Deletes `section` and unlinks it. A section that fails to delete stays
    /// registered.
    pub fn delete(&self, section: &Arc<CritSect>) -> Result<()> {
        let mut sections = self.sections.lock();
        let index = sections
            .iter()
            .position(|s| Arc::ptr_eq(s, section))
            .ok_or(CritSectError::NotFound)?;
        section.delete()?;
        sections.remove(index);
        Ok(())
    }

    /// Deletes every section created with `key`. Returns the number deleted,
    /// or the first failure after attempting all of them.
    pub fn delete_by_key(&self, key: usize) -> Result<usize> {
        let mut sections = self.sections.lock();
        let mut deleted = 0;
        let mut first_err = None;
        sections.retain(|s| {
            if s.key() != key {
                return true;
            }
            match s.delete() {
                Ok(()) => {
                    deleted += 1;
                    false
                }
                Err(error) => {
                    tracing::warn!(name = s.name(), key, %error, "failed to delete critical section");
                    first_err.get_or_insert(error);
                    true
                }
            }
        });
        match first_err {
            Some(error) => Err(error),
            None => Ok(deleted),
        }
    }

    /// Unlinks and deletes every registered section, including ones still
    /// owned. Returns the first failure.
    pub fn term(&self) -> Result<()> {
        let sections = core::mem::take(&mut *self.sections.lock());
        let mut result = Ok(());
        for section in &sections {
            if section.is_owned() {
                tracing::warn!(name = section.name(), "deleting owned critical section at teardown");
            }
            if let Err(error) = section.destroy() {
                if result.is_ok() {
                    result = Err(error);
                }
            }
        }
        tracing::debug!(count = sections.len(), "critical section registry terminated");
        result
    }

    /// Leaves every section the calling thread owns, at all nesting levels,
    /// without release-order checks. Used on fatal paths so diagnostics do not
    /// block on the caller's own sections. Returns the number of sections
    /// left.
    pub fn leave_all(&self) -> usize {
        let me = ThreadHandle::current_id();
        let owned: Vec<_> = self.owned_by(me);
        let mut left = 0;
        for section in owned {
            let levels = section.force_leave();
            if levels > 0 {
                tracing::debug!(name = section.name(), levels, "left critical section");
                left += 1;
            }
        }
        left
    }

    /// Counts the sections the calling thread owns and lists their names,
    /// separated by `", "`, in at most `max_len` characters. A name that does
    /// not fit is cut and padded with `+` to the limit.
    pub fn count_owned(&self, max_len: usize) -> (usize, String) {
        let owned = self.owned_by(ThreadHandle::current_id());
        let mut names = String::new();
        let mut left = max_len;
        for (i, section) in owned.iter().enumerate() {
            if left == 0 {
                continue;
            }
            if i != 0 {
                names.push(',');
                left -= 1;
                if left > 0 {
                    names.push(' ');
                    left -= 1;
                }
            }
            if left == 0 {
                continue;
            }
            let name = section.name();
            let len = name.chars().count();
            if len <= left {
                names.push_str(name);
                left -= len;
            } else {
                if left > 2 {
                    names.extend(name.chars().take(left - 2));
                    left = 2;
                }
                names.extend(core::iter::repeat_n('+', left));
                left = 0;
            }
        }
        (owned.len(), names)
    }

    fn owned_by(&self, thread_id: u64) -> Vec<Arc<CritSect>> {
        self.sections
            .lock()
            .iter()
            .filter(|s| s.is_initialized() && s.held_by(thread_id))
            .cloned()
            .collect()
    }

    /// Looks up a registered section by name.
    pub fn find(&self, name: &str) -> Option<Arc<CritSect>> {
        self.sections.lock().iter().find(|s| s.name() == name).cloned()
    }

    /// Names of all registered sections, in creation order.
    pub fn names(&self) -> Vec<String> {
        self.sections.lock().iter().map(|s| s.name().to_owned()).collect()
    }

    /// Number of registered sections.
    pub fn len(&self) -> usize {
        self.sections.lock().len()
    }

    /// Returns `true` if no section is registered.
    pub fn is_empty(&self) -> bool {
        self.sections.lock().is_empty()
    }

    /// Writes a statistics table of every section that was ever acquired.
    pub fn dump_stats(&self, w: &mut impl core::fmt::Write) -> core::fmt::Result {
        writeln!(
            w,
            "{:<24} {:>10} {:>12} {:>12} {:>12} {:>14}",
            "SECTION", "ACQUIRES", "CONT_LOCK", "CONT_UNLOCK", "MAX_HOLD_NS", "TOTAL_HOLD_NS"
        )?;

        for section in self.sections.lock().iter() {
            let stats = section.stats();
            if stats.acquisitions == 0 {
                continue; // Skip unused sections.
            }
            writeln!(
                w,
                "{:<24} {:>10} {:>12} {:>12} {:>12} {:>14}",
                section.name(),
                stats.acquisitions,
                stats.contention_lock,
                stats.contention_unlock,
                stats.max_hold_ns,
                stats.total_hold_ns,
            )?;
        }
        Ok(())
    }
}

impl Drop for CritSectRegistry {
    fn drop(&mut self) {
        if let Err(error) = self.term() {
            tracing::warn!(%error, "critical section registry dropped with failures");
        }
    }
}

impl core::fmt::Debug for CritSectRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CritSectRegistry")
            .field("sections", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use lockval::ValidatorConfig;

    fn registry() -> CritSectRegistry {
        CritSectRegistry::new(LockValidator::new(ValidatorConfig::default().quiet(true).may_panic(false)))
    }

    #[test]
    fn create_find_delete() {
        let reg = registry();
        let a = reg.create(1, "a", SrcPos::caller());
        let _b = reg.create(2, "b", SrcPos::caller());
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.names(), ["a", "b"]);
        assert!(Arc::ptr_eq(&reg.find("a").unwrap(), &a));
        assert!(reg.find("c").is_none());

        reg.delete(&a).unwrap();
        assert!(!a.is_initialized());
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.delete(&a), Err(CritSectError::NotFound));
    }

    #[test]
    fn owned_section_stays_registered() {
        let reg = registry();
        let a = reg.create(1, "a", SrcPos::caller());
        a.enter(SrcPos::caller()).unwrap();
        assert_eq!(reg.delete(&a), Err(CritSectError::StillOwned));
        assert_eq!(reg.len(), 1);
        a.leave().unwrap();
        reg.delete(&a).unwrap();
        assert!(reg.is_empty());
    }

    #[test]
    fn delete_by_key_reports_first_failure() {
        let reg = registry();
        let a = reg.create(7, "a", SrcPos::caller());
        let _b = reg.create(7, "b", SrcPos::caller());
        let _c = reg.create(8, "c", SrcPos::caller());

        a.enter(SrcPos::caller()).unwrap();
        assert_eq!(reg.delete_by_key(7), Err(CritSectError::StillOwned));
        assert_eq!(reg.names(), ["a", "c"]);

        a.leave().unwrap();
        assert_eq!(reg.delete_by_key(7), Ok(1));
        assert_eq!(reg.names(), ["c"]);
        assert_eq!(reg.delete_by_key(42), Ok(0));
    }

    #[test]
    fn leave_all_releases_every_level() {
        let reg = registry();
        let a = reg.create(0, "a", SrcPos::caller());
        let b = reg.create(0, "b", SrcPos::caller());
        let c = reg.create(0, "c", SrcPos::caller());
        a.enter(SrcPos::caller()).unwrap();
        b.enter(SrcPos::caller()).unwrap();
        b.enter(SrcPos::caller()).unwrap();

        assert_eq!(reg.leave_all(), 2);
        assert!(!a.is_owned());
        assert!(!b.is_owned());
        assert!(!c.is_owned());
        assert_eq!(ThreadHandle::current().held_depth(), 0);

        // The sections are usable again afterwards.
        c.enter(SrcPos::caller()).unwrap();
        a.enter(SrcPos::caller()).unwrap();
        a.leave().unwrap();
        c.leave().unwrap();
    }

    #[test]
    fn count_owned_truncates_names() {
        let reg = registry();
        let first = reg.create(0, "first", SrcPos::caller());
        let second = reg.create(0, "second", SrcPos::caller());
        let _idle = reg.create(0, "idle", SrcPos::caller());
        first.enter(SrcPos::caller()).unwrap();
        second.enter(SrcPos::caller()).unwrap();

        assert_eq!(reg.count_owned(64), (2, "first, second".to_owned()));
        assert_eq!(reg.count_owned(11), (2, "first, se++".to_owned()));
        assert_eq!(reg.count_owned(3), (2, "f++".to_owned()));
        assert_eq!(reg.count_owned(0), (2, String::new()));

        second.leave().unwrap();
        first.leave().unwrap();
        assert_eq!(reg.count_owned(64), (0, String::new()));
    }

    #[test]
    fn term_deletes_everything() {
        let reg = registry();
        let a = reg.create(0, "a", SrcPos::caller());
        let b = reg.create(0, "b", SrcPos::caller());
        reg.term().unwrap();
        assert!(reg.is_empty());
        assert!(!a.is_initialized());
        assert!(!b.is_initialized());
        assert!(reg.nop().is_initialized());
    }

    #[test]
    fn term_deletes_owned_sections() {
        let reg = registry();
        let a = reg.create(0, "a", SrcPos::caller());
        a.enter(SrcPos::caller()).unwrap();
        a.enter(SrcPos::caller()).unwrap();
        reg.term().unwrap();
        assert!(!a.is_initialized());
        assert!(!a.is_owned());
        assert_eq!(ThreadHandle::current().held_depth(), 0);
        assert_eq!(a.leave(), Err(CritSectError::Destroyed));
    }

    #[test]
    fn nop_section_is_shared() {
        let reg = registry();
        let nop = reg.nop();
        assert!(Arc::ptr_eq(&nop, &reg.nop()));
        nop.enter(SrcPos::caller()).unwrap();
        nop.enter(SrcPos::caller()).unwrap();
        assert!(nop.is_owner());
        assert!(reg.is_empty());
    }

    #[test]
    fn dump_stats_lists_used_sections() {
        let reg = registry();
        let used = reg.create(0, "used", SrcPos::caller());
        let _unused = reg.create(0, "unused", SrcPos::caller());
        used.enter(SrcPos::caller()).unwrap();
        used.leave().unwrap();

        let mut out = String::new();
        reg.dump_stats(&mut out).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("SECTION"));
        assert!(lines[1].starts_with("used "));
    }
}
