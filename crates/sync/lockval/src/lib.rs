//! Lock validator: ownership records, lock-order checks and deadlock detection.
//!
//! Lock implementations embed an [`ExclRecord`] (exclusive locks) or a
//! [`SharedRecord`] (reader/writer and signaller locks) and call into them
//! around every acquisition and release:
//!
//! - **Ownership.** After the real primitive has been taken, the lock records
//!   the owner ([`ExclRecord::set_owner`], [`SharedRecord::add_owner`]). The
//!   record is pushed on the owning thread's hold stack, and releases must
//!   pop it in LIFO order.
//! - **Order.** Locks sharing a [`LockClassId`] are ordered by their
//!   [`SubClass`]. Classes flagged [`ClassFlags::AUTODIDACT`] additionally learn
//!   cross-class acquisition order and reject inversions.
//! - **Deadlock detection.** Before a thread blocks, `check_blocking` walks the
//!   wait-for graph of owners and blocked threads. A path back to the caller
//!   is reported instead of letting the thread go to sleep.
//!
//! All state is scoped to a [`LockValidator`] handle. [`LockValidator::global`]
//! returns the process-wide instance, and [`LockValidator::new`] creates an
//! isolated one.
//!
//! Violations go through a single reporting path that logs with `tracing`,
//! runs an optional hook and then either panics or returns the [`Error`],
//! depending on [`LockValidator::may_panic`].

mod class;
mod config;
mod detector;
mod error;
mod excl;
mod order;
mod record;
mod report;
mod shared;
mod src_pos;
mod thread;
mod validator;

pub use class::{ClassFlags, ClassRegistry, LockClassId, SubClass, MAX_CLASSES};
pub use config::{OrderDirection, ValidatorConfig};
pub use error::{Error, Result};
pub use excl::ExclRecord;
pub use record::{make_siblings, LockRecord, RecordId, RecordKind};
pub use report::{ViolationHook, ViolationReport, WaitLink};
pub use shared::{SharedOwner, SharedRecord};
pub use src_pos::SrcPos;
pub use thread::{BlockedLockInfo, ThreadHandle, ThreadState};
pub use validator::LockValidator;

/// Captures the source position of the call site.
///
/// The function slot is filled with the enclosing module path; an optional
/// expression becomes the position's `id`.
#[macro_export]
macro_rules! src_pos {
    () => {
        $crate::SrcPos::new(file!(), line!(), module_path!(), 0)
    };
    ($id:expr) => {
        $crate::SrcPos::new(file!(), line!(), module_path!(), $id)
    };
}
