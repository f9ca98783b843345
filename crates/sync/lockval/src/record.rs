//! Type-erased lock records and sibling pairing.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use crate::class::{LockClassId, SubClass};
use crate::error::{Error, Result};
use crate::excl::{ExclInner, ExclRecord};
use crate::report::ViolationReport;
use crate::shared::{SharedInner, SharedRecord};
use crate::src_pos::SrcPos;
use crate::thread::{ThreadHandle, ThreadState};
use crate::validator::LockValidator;

/// Unique identity of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(u64);

impl RecordId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rec#{}", self.0)
    }
}

/// Kind of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// An [`ExclRecord`].
    Exclusive,
    /// A [`SharedRecord`].
    Shared,
}

/// Either kind of lock record.
///
/// Used wherever the validator has to treat both kinds uniformly: wait links,
/// sibling pairs and violation reports.
#[derive(Clone)]
pub enum LockRecord {
    /// An exclusive record.
    Excl(ExclRecord),
    /// A shared record.
    Shared(SharedRecord),
}

impl LockRecord {
    /// Identity of the record.
    pub fn id(&self) -> RecordId {
        match self {
            Self::Excl(r) => r.id(),
            Self::Shared(r) => r.id(),
        }
    }

    /// Kind of the record.
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Excl(_) => RecordKind::Exclusive,
            Self::Shared(_) => RecordKind::Shared,
        }
    }

    /// Name of the lock.
    pub fn name(&self) -> &str {
        match self {
            Self::Excl(r) => r.name(),
            Self::Shared(r) => r.name(),
        }
    }

    /// Class of the lock.
    pub fn class(&self) -> LockClassId {
        match self {
            Self::Excl(r) => r.class(),
            Self::Shared(r) => r.class(),
        }
    }

    /// Current subclass of the lock.
    pub fn sub_class(&self) -> SubClass {
        match self {
            Self::Excl(r) => r.sub_class(),
            Self::Shared(r) => r.sub_class(),
        }
    }

    /// Whether the record is validated.
    pub fn is_enabled(&self) -> bool {
        match self {
            Self::Excl(r) => r.is_enabled(),
            Self::Shared(r) => r.is_enabled(),
        }
    }

    /// The paired record, if any.
    pub fn sibling(&self) -> Option<LockRecord> {
        match self {
            Self::Excl(r) => r.sibling(),
            Self::Shared(r) => r.sibling(),
        }
    }

    /// Checks whether `thread` may acquire this lock given the locks it
    /// already holds.
    pub fn check_order(&self, thread: Option<&ThreadHandle>, pos: SrcPos) -> Result<()> {
        match self {
            Self::Excl(r) => r.check_order(thread, pos),
            Self::Shared(r) => r.check_order(thread, pos),
        }
    }

    /// Checks whether `thread` may block waiting for this lock.
    pub fn check_blocking(
        &self,
        thread: Option<&ThreadHandle>,
        pos: SrcPos,
        recursive_ok: bool,
        state: ThreadState,
        really_sleeping: bool,
    ) -> Result<()> {
        match self {
            Self::Excl(r) => r.check_blocking(thread, pos, recursive_ok, state, really_sleeping),
            Self::Shared(r) => r.check_blocking(thread, pos, recursive_ok, state, really_sleeping),
        }
    }

    pub(crate) fn validator(&self) -> &LockValidator {
        match self {
            Self::Excl(r) => r.validator(),
            Self::Shared(r) => r.validator(),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakLockRecord {
        match self {
            Self::Excl(r) => WeakLockRecord::Excl(r.downgrade()),
            Self::Shared(r) => WeakLockRecord::Shared(r.downgrade()),
        }
    }

    fn set_sibling(&self, sibling: WeakLockRecord) -> bool {
        match self {
            Self::Excl(r) => r.set_sibling(sibling),
            Self::Shared(r) => r.set_sibling(sibling),
        }
    }

    fn is_paired(&self) -> bool {
        match self {
            Self::Excl(r) => r.is_paired(),
            Self::Shared(r) => r.is_paired(),
        }
    }
}

impl From<ExclRecord> for LockRecord {
    fn from(rec: ExclRecord) -> Self {
        Self::Excl(rec)
    }
}

impl From<SharedRecord> for LockRecord {
    fn from(rec: SharedRecord) -> Self {
        Self::Shared(rec)
    }
}

impl fmt::Debug for LockRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRecord")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}

/// Non-owning reference to a record, kept by hold stacks and sibling links.
#[derive(Clone)]
pub(crate) enum WeakLockRecord {
    Excl(Weak<ExclInner>),
    Shared(Weak<SharedInner>),
}

impl WeakLockRecord {
    pub(crate) fn upgrade(&self) -> Option<LockRecord> {
        match self {
            Self::Excl(w) => w.upgrade().map(|inner| LockRecord::Excl(ExclRecord::from_inner(inner))),
            Self::Shared(w) => w.upgrade().map(|inner| LockRecord::Shared(SharedRecord::from_inner(inner))),
        }
    }
}

/// Pairs the two halves of a reader/writer lock.
///
/// Siblings are skipped by order checks against each other, may recurse
/// into each other through `recursion_mixed`, and are followed by the
/// deadlock detector. Two shared records or a shared and an exclusive record
/// can be paired; each record can have only one sibling.
pub fn make_siblings(a: &LockRecord, b: &LockRecord) -> Result<()> {
    let invalid = |detail: &str| {
        a.validator().fail(
            ViolationReport::new(Error::InvalidParameter, a.name(), SrcPos::NONE).with_detail(format!(
                "cannot pair \"{}\" with \"{}\": {detail}",
                a.name(),
                b.name()
            )),
        )
    };

    if a.id() == b.id() {
        return Err(invalid("a record cannot be its own sibling"));
    }
    if !a.validator().same(b.validator()) {
        return Err(invalid("records belong to different validators"));
    }
    if a.kind() == RecordKind::Exclusive && b.kind() == RecordKind::Exclusive {
        return Err(invalid("two exclusive records"));
    }
    // Both links are checked before either is set, under the detector lock
    // so a concurrent pairing cannot slip in between.
    let paired = {
        let _serialize = a.validator().serialize_detection();
        if a.is_paired() || b.is_paired() {
            false
        } else {
            let linked_a = a.set_sibling(b.downgrade());
            let linked_b = b.set_sibling(a.downgrade());
            debug_assert!(linked_a && linked_b);
            true
        }
    };
    if !paired {
        return Err(invalid("already paired"));
    }
    tracing::trace!(a = %a.id(), b = %b.id(), "paired lock records");
    Ok(())
}
