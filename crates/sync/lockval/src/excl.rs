//! Exclusive lock records.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::class::{ClassFlags, LockClassId, SubClass};
use crate::detector;
use crate::error::{Error, Result};
use crate::order;
use crate::record::{LockRecord, RecordId, WeakLockRecord};
use crate::report::ViolationReport;
use crate::src_pos::SrcPos;
use crate::thread::{HeldEntry, Nest, ThreadHandle, ThreadState};
use crate::validator::LockValidator;

#[derive(Default)]
struct ExclState {
    owner: Option<ThreadHandle>,
    recursion: u32,
    pos: SrcPos,
    /// Index of the base entry on the owner's hold stack.
    hold_index: Option<usize>,
}

pub(crate) struct ExclInner {
    id: RecordId,
    validator: LockValidator,
    name: String,
    lock: usize,
    class: LockClassId,
    sub_class: AtomicU32,
    enabled: AtomicBool,
    sibling: OnceLock<WeakLockRecord>,
    state: Mutex<ExclState>,
}

impl Drop for ExclInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let Some(owner) = state.owner.take() else {
            return;
        };
        let id = self.id;
        owner.with_held(|held| held.remove_all(|e| e.record == id));
        owner.write_lock_dec();
        if !std::thread::panicking() {
            self.validator.fail(
                ViolationReport::new(Error::InvalidParameter, &self.name, state.pos)
                    .with_thread(&owner)
                    .with_detail("record destroyed while owned"),
            );
        }
    }
}

/// Ownership record of an exclusive lock.
///
/// Cloning yields another handle to the same record. The owner, recursion
/// count and hold-stack index are updated together under the record's own
/// lock.
#[derive(Clone)]
pub struct ExclRecord(Arc<ExclInner>);

impl ExclRecord {
    /// Creates a record for the lock identified by `lock`.
    ///
    /// The record is validated if `validator` is enabled at this point.
    pub fn new(
        validator: &LockValidator,
        class: LockClassId,
        sub_class: SubClass,
        name: impl Into<String>,
        lock: usize,
    ) -> Self {
        Self(Arc::new(ExclInner {
            id: RecordId::next(),
            validator: validator.clone(),
            name: name.into(),
            lock,
            class,
            sub_class: AtomicU32::new(sub_class.raw()),
            enabled: AtomicBool::new(validator.is_enabled()),
            sibling: OnceLock::new(),
            state: Mutex::new(ExclState::default()),
        }))
    }

    pub(crate) fn from_inner(inner: Arc<ExclInner>) -> Self {
        Self(inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<ExclInner> {
        Arc::downgrade(&self.0)
    }

    /// Deletes the record. Deleting an owned record is reported as
    /// [`Error::InvalidParameter`]; the ownership is dropped either way.
    pub fn delete(self) -> Result<()> {
        self.0.enabled.store(false, Ordering::Release);
        let Some((owner, pos)) = self.take_all() else {
            return Ok(());
        };
        Err(self.0.validator.fail(
            ViolationReport::new(Error::InvalidParameter, &self.0.name, pos)
                .with_thread(&owner)
                .with_detail("record deleted while owned"),
        ))
    }

    // -- Accessors ----------------------------------------------------------

    /// Identity of the record.
    pub fn id(&self) -> RecordId {
        self.0.id
    }

    /// Name of the lock.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Caller supplied identity of the lock.
    pub fn lock_id(&self) -> usize {
        self.0.lock
    }

    /// Class of the lock.
    pub fn class(&self) -> LockClassId {
        self.0.class
    }

    /// Current subclass.
    pub fn sub_class(&self) -> SubClass {
        SubClass::from_raw(self.0.sub_class.load(Ordering::Acquire))
    }

    /// Changes the subclass. Returns the previous one.
    pub fn set_sub_class(&self, sub_class: SubClass) -> SubClass {
        SubClass::from_raw(self.0.sub_class.swap(sub_class.raw(), Ordering::AcqRel))
    }

    /// Whether the record is validated.
    pub fn is_enabled(&self) -> bool {
        self.0.enabled.load(Ordering::Acquire)
    }

    /// Enables or disables validation of this record. Returns the previous
    /// value.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.0.enabled.swap(enabled, Ordering::AcqRel)
    }

    /// The paired record, if any.
    pub fn sibling(&self) -> Option<LockRecord> {
        self.0.sibling.get().and_then(WeakLockRecord::upgrade)
    }

    pub(crate) fn set_sibling(&self, sibling: WeakLockRecord) -> bool {
        self.0.sibling.set(sibling).is_ok()
    }

    /// Whether a sibling link was ever set, even to a record since dropped.
    pub(crate) fn is_paired(&self) -> bool {
        self.0.sibling.get().is_some()
    }

    pub(crate) fn validator(&self) -> &LockValidator {
        &self.0.validator
    }

    /// Current owner.
    pub fn owner(&self) -> Option<ThreadHandle> {
        self.0.state.lock().owner.clone()
    }

    /// Returns `true` if `thread` owns the lock.
    pub fn is_owned_by(&self, thread: &ThreadHandle) -> bool {
        self.0.state.lock().owner.as_ref() == Some(thread)
    }

    /// Number of times the owner has entered the lock; zero when free.
    pub fn recursion_depth(&self) -> u32 {
        self.0.state.lock().recursion
    }

    /// Position of the first acquisition by the current owner.
    pub fn owner_pos(&self) -> SrcPos {
        self.0.state.lock().pos
    }

    /// Index of the base entry on the owner's hold stack.
    pub fn hold_index(&self) -> Option<usize> {
        self.0.state.lock().hold_index
    }

    // -- Ownership ----------------------------------------------------------

    fn held_entry(&self, nest: Nest, pos: SrcPos) -> HeldEntry {
        HeldEntry {
            lock: WeakLockRecord::Excl(self.downgrade()),
            record: self.0.id,
            owner: None,
            nest,
            pos,
        }
    }

    /// Records that `thread` (default: the caller) now owns the lock.
    ///
    /// With `first_recursion` set, or when the record is free, ownership is
    /// (re)assigned with a recursion count of one. Otherwise the owner's
    /// recursion count is bumped.
    pub fn set_owner(&self, thread: Option<&ThreadHandle>, pos: SrcPos, first_recursion: bool) {
        if !self.is_enabled() {
            return;
        }
        let me = ThreadHandle::resolve(thread);
        let mut st = self.0.state.lock();

        if !first_recursion && st.owner.as_ref() == Some(&me) {
            st.recursion += 1;
            me.push_held(self.held_entry(Nest::Plain, pos));
            return;
        }

        if let Some(stale) = st.owner.take() {
            tracing::warn!(lock = %self.0.name, stale = %stale, new = %me, "overwriting lock owner");
            let id = self.0.id;
            stale.with_held(|held| held.remove_all(|e| e.record == id));
            stale.write_lock_dec();
        }

        let index = me.push_held(self.held_entry(Nest::Base, pos));
        me.write_lock_inc();
        *st = ExclState {
            owner: Some(me),
            recursion: 1,
            pos,
            hold_index: Some(index),
        };
    }

    /// Records one release by the owner.
    ///
    /// The matching entry must be on top of the owner's hold stack: the base
    /// entry for the final release, a plain recursion entry otherwise. With
    /// `final_recursion` set the release must be the last one.
    pub fn release_owner(&self, final_recursion: bool) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let mut st = self.0.state.lock();
        let Some(owner) = st.owner.clone() else {
            let pos = st.pos;
            drop(st);
            return Err(self.fail(Error::NotOwnerOnRelease, pos, None, "release of a free lock"));
        };
        if final_recursion && st.recursion != 1 {
            let (pos, depth) = (st.pos, st.recursion);
            drop(st);
            return Err(self.fail(
                Error::InvalidParameter,
                pos,
                Some(&owner),
                &format!("final release at recursion depth {depth}"),
            ));
        }

        let nest = if st.recursion > 1 { Nest::Plain } else { Nest::Base };
        let id = self.0.id;
        if let Err(top) = owner.with_held(|held| held.pop_if(|e| e.record == id && e.nest == nest)) {
            let pos = st.pos;
            drop(st);
            return Err(self.release_order_violation(pos, &owner, top));
        }

        st.recursion -= 1;
        if st.recursion == 0 {
            st.owner = None;
            st.hold_index = None;
            owner.write_lock_dec();
        }
        Ok(())
    }

    /// Drops ownership without any checks, removing every hold-stack entry
    /// of this record.
    pub fn release_owner_unchecked(&self) {
        self.take_all();
    }

    fn take_all(&self) -> Option<(ThreadHandle, SrcPos)> {
        let mut st = self.0.state.lock();
        let owner = st.owner.take()?;
        let pos = st.pos;
        *st = ExclState::default();
        let id = self.0.id;
        owner.with_held(|held| held.remove_all(|e| e.record == id));
        owner.write_lock_dec();
        Some((owner, pos))
    }

    /// Records a recursive acquisition by the owning caller.
    ///
    /// Fails with [`Error::NestedNotAllowed`] if the class forbids recursion.
    pub fn recursion(&self, pos: SrcPos) -> Result<()> {
        self.nest(Nest::Plain, pos)
    }

    /// Records a recursive acquisition through the sibling record `mixed`,
    /// e.g. a writer taking the read side of its own lock.
    pub fn recursion_mixed(&self, mixed: &LockRecord, pos: SrcPos) -> Result<()> {
        self.check_sibling(mixed)?;
        self.nest(Nest::Mixed(mixed.id()), pos)
    }

    /// Undoes one [`recursion`](Self::recursion).
    pub fn unwind(&self) -> Result<()> {
        self.unnest(Nest::Plain)
    }

    /// Undoes one [`recursion_mixed`](Self::recursion_mixed).
    pub fn unwind_mixed(&self, mixed: &LockRecord) -> Result<()> {
        self.check_sibling(mixed)?;
        self.unnest(Nest::Mixed(mixed.id()))
    }

    fn check_sibling(&self, mixed: &LockRecord) -> Result<()> {
        if self.sibling().map(|s| s.id()) == Some(mixed.id()) {
            return Ok(());
        }
        Err(self.fail(
            Error::InvalidParameter,
            SrcPos::NONE,
            None,
            &format!("\"{}\" is not the sibling of this lock", mixed.name()),
        ))
    }

    fn nest(&self, nest: Nest, pos: SrcPos) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let me = ThreadHandle::current();
        let no_recursion = self.0.validator.classes().flags(self.0.class).contains(ClassFlags::NO_RECURSION);

        let mut st = self.0.state.lock();
        if st.owner.as_ref() != Some(&me) {
            drop(st);
            return Err(self.fail(Error::InvalidParameter, pos, Some(&me), "recursion by a non-owner"));
        }
        if no_recursion {
            let held_pos = st.pos;
            drop(st);
            return Err(self.0.validator.fail(
                ViolationReport::new(Error::NestedNotAllowed, &self.0.name, pos)
                    .with_thread(&me)
                    .with_other(&self.0.name, held_pos),
            ));
        }
        st.recursion += 1;
        me.push_held(self.held_entry(nest, pos));
        Ok(())
    }

    fn unnest(&self, nest: Nest) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let me = ThreadHandle::current();
        let mut st = self.0.state.lock();
        if st.owner.as_ref() != Some(&me) || st.recursion < 2 {
            let pos = st.pos;
            drop(st);
            return Err(self.fail(Error::InvalidParameter, pos, Some(&me), "unwind without recursion"));
        }
        let id = self.0.id;
        if let Err(top) = me.with_held(|held| held.pop_if(|e| e.record == id && e.nest == nest)) {
            let pos = st.pos;
            drop(st);
            return Err(self.release_order_violation(pos, &me, top));
        }
        st.recursion -= 1;
        Ok(())
    }

    // -- Checks -------------------------------------------------------------

    /// Checks the acquisition order against the locks `thread` holds.
    pub fn check_order(&self, thread: Option<&ThreadHandle>, pos: SrcPos) -> Result<()> {
        order::check_order(&LockRecord::Excl(self.clone()), &ThreadHandle::resolve(thread), pos)
    }

    /// Checks whether `thread` may block on this lock, and marks it blocked
    /// if `really_sleeping`.
    pub fn check_blocking(
        &self,
        thread: Option<&ThreadHandle>,
        pos: SrcPos,
        recursive_ok: bool,
        state: ThreadState,
        really_sleeping: bool,
    ) -> Result<()> {
        detector::check_blocking(
            &LockRecord::Excl(self.clone()),
            &ThreadHandle::resolve(thread),
            pos,
            detector::Request {
                exclusive: true,
                recursive_ok,
                state,
                really_sleeping,
            },
        )
    }

    /// [`check_order`](Self::check_order) followed by
    /// [`check_blocking`](Self::check_blocking).
    pub fn check_order_and_blocking(
        &self,
        thread: Option<&ThreadHandle>,
        pos: SrcPos,
        recursive_ok: bool,
        state: ThreadState,
        really_sleeping: bool,
    ) -> Result<()> {
        let me = ThreadHandle::resolve(thread);
        self.check_order(Some(&me), pos)?;
        self.check_blocking(Some(&me), pos, recursive_ok, state, really_sleeping)
    }

    // -- Reporting ----------------------------------------------------------

    fn fail(&self, error: Error, pos: SrcPos, thread: Option<&ThreadHandle>, detail: &str) -> Error {
        let mut report = ViolationReport::new(error, &self.0.name, pos).with_detail(detail);
        if let Some(thread) = thread {
            report = report.with_thread(thread);
        }
        self.0.validator.fail(report)
    }

    fn release_order_violation(&self, pos: SrcPos, owner: &ThreadHandle, top: Option<HeldEntry>) -> Error {
        let mut report = ViolationReport::new(Error::ReleaseOrderViolation, &self.0.name, pos).with_thread(owner);
        if let Some(top) = top {
            let (name, pos) = top.describe();
            report = report.with_other(&name, pos).with_detail("other lock is on top of the hold stack");
        }
        self.0.validator.fail(report)
    }
}

impl fmt::Debug for ExclRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.0.state.lock();
        f.debug_struct("ExclRecord")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("owner", &st.owner)
            .field("recursion", &st.recursion)
            .finish_non_exhaustive()
    }
}
