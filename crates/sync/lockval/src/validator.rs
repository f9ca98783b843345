//! The validator handle: toggles, class registry and detector serialization.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::class::{ClassRegistry, LockClassId, SubClass};
use crate::config::{OrderDirection, ValidatorConfig};
use crate::excl::ExclRecord;
use crate::report::ViolationHook;
use crate::shared::SharedRecord;

struct ValidatorInner {
    enabled: AtomicBool,
    quiet: AtomicBool,
    may_panic: AtomicBool,
    order: OrderDirection,
    shared_table_capacity: usize,
    /// Serializes deadlock detection and shared owner-table growth.
    detector: Mutex<()>,
    classes: ClassRegistry,
    hook: RwLock<Option<ViolationHook>>,
    violations: AtomicU64,
}

/// Handle to a validator instance.
///
/// Records keep a clone of the handle they were created from. Cloning is
/// cheap.
#[derive(Clone)]
pub struct LockValidator(Arc<ValidatorInner>);

impl LockValidator {
    /// Creates an isolated validator.
    pub fn new(config: ValidatorConfig) -> Self {
        tracing::debug!(?config, "creating lock validator");
        Self(Arc::new(ValidatorInner {
            enabled: AtomicBool::new(config.enabled),
            quiet: AtomicBool::new(config.quiet),
            may_panic: AtomicBool::new(config.may_panic),
            order: config.order,
            shared_table_capacity: config.shared_table_capacity.max(1),
            detector: Mutex::new(()),
            classes: ClassRegistry::new(),
            hook: RwLock::new(None),
            violations: AtomicU64::new(0),
        }))
    }

    /// The process-wide validator, configured from the environment on first
    /// use (see [`ValidatorConfig::from_env`]).
    pub fn global() -> &'static LockValidator {
        static GLOBAL: OnceLock<LockValidator> = OnceLock::new();
        GLOBAL.get_or_init(|| LockValidator::new(ValidatorConfig::from_env()))
    }

    // -- Toggles ------------------------------------------------------------

    /// Enables or disables validation of records created from now on.
    /// Returns the previous value.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.0.enabled.swap(enabled, Ordering::AcqRel)
    }

    /// Whether new records are validated.
    pub fn is_enabled(&self) -> bool {
        self.0.enabled.load(Ordering::Acquire)
    }

    /// Suppresses or restores violation logging. Returns the previous value.
    pub fn set_quiet(&self, quiet: bool) -> bool {
        self.0.quiet.swap(quiet, Ordering::AcqRel)
    }

    /// Whether violation logging is suppressed.
    pub fn are_quiet(&self) -> bool {
        self.0.quiet.load(Ordering::Acquire)
    }

    /// Chooses between panicking on violations and returning the error.
    /// Returns the previous value.
    pub fn set_may_panic(&self, may_panic: bool) -> bool {
        self.0.may_panic.swap(may_panic, Ordering::AcqRel)
    }

    /// Whether violations panic.
    pub fn may_panic(&self) -> bool {
        self.0.may_panic.load(Ordering::Acquire)
    }

    /// Subclass ordering rule.
    pub fn order_direction(&self) -> OrderDirection {
        self.0.order
    }

    /// Initial owner-table capacity for shared records.
    pub fn shared_table_capacity(&self) -> usize {
        self.0.shared_table_capacity
    }

    // -- Classes and records ------------------------------------------------

    /// The class registry of this validator.
    pub fn classes(&self) -> &ClassRegistry {
        &self.0.classes
    }

    /// Creates an exclusive record for the lock identified by `lock`.
    pub fn create_excl(&self, class: LockClassId, sub_class: SubClass, name: impl Into<String>, lock: usize) -> ExclRecord {
        ExclRecord::new(self, class, sub_class, name, lock)
    }

    /// Creates a shared record. Signaller records track the threads allowed
    /// to signal an event instead of readers.
    pub fn create_shared(
        &self,
        class: LockClassId,
        sub_class: SubClass,
        name: impl Into<String>,
        lock: usize,
        signaller: bool,
    ) -> SharedRecord {
        SharedRecord::new(self, class, sub_class, name, lock, signaller)
    }

    // -- Reporting ----------------------------------------------------------

    /// Installs a callback run for every violation. Returns the previous one.
    pub fn set_violation_hook(&self, hook: Option<ViolationHook>) -> Option<ViolationHook> {
        core::mem::replace(&mut *self.0.hook.write(), hook)
    }

    /// Number of violations reported so far.
    pub fn violation_count(&self) -> u64 {
        self.0.violations.load(Ordering::Relaxed)
    }

    pub(crate) fn hook(&self) -> Option<ViolationHook> {
        self.0.hook.read().clone()
    }

    pub(crate) fn count_violation(&self) {
        self.0.violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes the detector lock. Order: detector, then record, then thread.
    pub(crate) fn serialize_detection(&self) -> MutexGuard<'_, ()> {
        self.0.detector.lock()
    }

    pub(crate) fn same(&self, other: &LockValidator) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for LockValidator {
    fn default() -> Self {
        Self::new(ValidatorConfig::default())
    }
}

impl fmt::Debug for LockValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockValidator")
            .field("enabled", &self.is_enabled())
            .field("quiet", &self.are_quiet())
            .field("may_panic", &self.may_panic())
            .field("order", &self.0.order)
            .field("classes", &self.0.classes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::report::ViolationReport;
    use crate::src_pos::SrcPos;

    #[test]
    fn toggles_return_previous_value() {
        let v = LockValidator::new(ValidatorConfig::default().may_panic(true));
        assert!(v.set_enabled(false));
        assert!(!v.set_enabled(true));
        assert!(!v.set_quiet(true));
        assert!(v.are_quiet());
        assert!(v.set_may_panic(false));
        assert!(!v.may_panic());
    }

    #[test]
    fn global_is_shared() {
        assert!(LockValidator::global().same(LockValidator::global()));
    }

    #[test]
    fn hook_sees_violations() {
        let v = LockValidator::new(ValidatorConfig::default().quiet(true).may_panic(false));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        v.set_violation_hook(Some(Arc::new(move |r: &ViolationReport| sink.lock().push(r.error))));

        let err = v.fail(ViolationReport::new(Error::OrderViolation, "x", SrcPos::NONE));
        assert_eq!(err, Error::OrderViolation);
        assert_eq!(*seen.lock(), vec![Error::OrderViolation]);
        assert_eq!(v.violation_count(), 1);
        assert!(v.set_violation_hook(None).is_some());
    }

    #[test]
    #[should_panic(expected = "lockval: potential deadlock")]
    fn may_panic_panics() {
        let v = LockValidator::new(ValidatorConfig::default().quiet(true).may_panic(true));
        v.fail(ViolationReport::new(Error::DeadlockDetected, "x", SrcPos::NONE));
    }
}
