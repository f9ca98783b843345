//! Shared lock records: readers of a reader/writer lock, or the signallers
//! of an event.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::class::{LockClassId, SubClass};
use crate::detector;
use crate::error::{Error, Result};
use crate::order;
use crate::record::{LockRecord, RecordId, WeakLockRecord};
use crate::report::ViolationReport;
use crate::src_pos::SrcPos;
use crate::thread::{HeldEntry, Nest, ThreadHandle, ThreadState};
use crate::validator::LockValidator;

// ---------------------------------------------------------------------------
// Owner records
// ---------------------------------------------------------------------------

const NO_INDEX: usize = usize::MAX;

pub(crate) struct SharedOwnerInner {
    id: RecordId,
    thread: ThreadHandle,
    shared: Weak<SharedInner>,
    /// Mutated under the aggregate's table lock.
    recursion: AtomicU32,
    pos: SrcPos,
    hold_index: AtomicUsize,
}

/// One thread's share of a [`SharedRecord`].
#[derive(Clone)]
pub struct SharedOwner(Arc<SharedOwnerInner>);

impl SharedOwner {
    fn new(thread: ThreadHandle, shared: Weak<SharedInner>, pos: SrcPos) -> Self {
        Self(Arc::new(SharedOwnerInner {
            id: RecordId::next(),
            thread,
            shared,
            recursion: AtomicU32::new(1),
            pos,
            hold_index: AtomicUsize::new(NO_INDEX),
        }))
    }

    /// Identity of the owner record.
    pub fn id(&self) -> RecordId {
        self.0.id
    }

    /// The owning thread.
    pub fn thread(&self) -> &ThreadHandle {
        &self.0.thread
    }

    /// How many times the thread holds the lock.
    pub fn recursion_depth(&self) -> u32 {
        self.0.recursion.load(Ordering::Acquire)
    }

    /// Where the thread first acquired the lock.
    pub fn pos(&self) -> SrcPos {
        self.0.pos
    }

    /// Index of the base entry on the thread's hold stack. Signaller owners
    /// are not on any hold stack.
    pub fn hold_index(&self) -> Option<usize> {
        match self.0.hold_index.load(Ordering::Acquire) {
            NO_INDEX => None,
            index => Some(index),
        }
    }

    /// The shared record this owner belongs to, if it still exists.
    pub fn aggregate(&self) -> Option<SharedRecord> {
        self.0.shared.upgrade().map(SharedRecord)
    }
}

impl fmt::Debug for SharedOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedOwner")
            .field("id", &self.0.id)
            .field("thread", &self.0.thread)
            .field("recursion", &self.recursion_depth())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Owner table
// ---------------------------------------------------------------------------

struct OwnerTable {
    slots: Vec<Option<SharedOwner>>,
    count: usize,
    /// One past the highest occupied slot.
    high_water: usize,
}

impl OwnerTable {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            count: 0,
            high_water: 0,
        }
    }

    fn position(&self, thread: &ThreadHandle) -> Option<usize> {
        self.slots[..self.high_water]
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|o| o.thread() == thread))
    }

    fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    /// Doubles the slot vector in place. Runs under the table mutex, which
    /// every reader takes too, so no scan sees a partly grown table.
    fn grow(&mut self) {
        let new_capacity = self.slots.len() * 2;
        self.slots.resize(new_capacity, None);
        tracing::debug!(capacity = new_capacity, "grew shared owner table");
    }

    fn insert(&mut self, owner: SharedOwner) {
        let index = self.slots.iter().position(Option::is_none).unwrap_or_else(|| {
            // Callers grow a full table first.
            self.slots.push(None);
            self.slots.len() - 1
        });
        self.slots[index] = Some(owner);
        self.count += 1;
        self.high_water = self.high_water.max(index + 1);
    }

    fn remove(&mut self, index: usize) {
        self.slots[index] = None;
        self.count -= 1;
        while self.high_water > 0 && self.slots[self.high_water - 1].is_none() {
            self.high_water -= 1;
        }
    }

    fn owners(&self) -> impl Iterator<Item = &SharedOwner> {
        self.slots[..self.high_water].iter().flatten()
    }
}

// ---------------------------------------------------------------------------
// Shared records
// ---------------------------------------------------------------------------

pub(crate) struct SharedInner {
    id: RecordId,
    validator: LockValidator,
    name: String,
    lock: usize,
    class: LockClassId,
    sub_class: AtomicU32,
    enabled: AtomicBool,
    signaller: bool,
    sibling: OnceLock<WeakLockRecord>,
    table: Mutex<OwnerTable>,
}

impl Drop for SharedInner {
    fn drop(&mut self) {
        let table = self.table.get_mut();
        if table.count == 0 {
            return;
        }
        tracing::warn!(lock = %self.name, owners = table.count, "shared record destroyed while owned");
        if !self.signaller {
            for owner in table.owners() {
                release_holds(owner);
            }
        }
    }
}

/// Removes every hold-stack entry of `owner` and drops its read counts.
fn release_holds(owner: &SharedOwner) {
    let id = owner.id();
    let removed = owner.thread().with_held(|held| held.remove_all(|e| e.owner == Some(id)));
    for _ in 0..removed {
        owner.thread().read_lock_dec();
    }
}

/// Ownership record of a lock that several threads hold at once.
///
/// Keeps one [`SharedOwner`] per owning thread in a table that grows on
/// demand. Signaller records track the threads allowed to signal an event;
/// they do not appear on hold stacks.
#[derive(Clone)]
pub struct SharedRecord(Arc<SharedInner>);

impl SharedRecord {
    /// Creates a record for the lock identified by `lock`.
    pub fn new(
        validator: &LockValidator,
        class: LockClassId,
        sub_class: SubClass,
        name: impl Into<String>,
        lock: usize,
        signaller: bool,
    ) -> Self {
        Self(Arc::new(SharedInner {
            id: RecordId::next(),
            validator: validator.clone(),
            name: name.into(),
            lock,
            class,
            sub_class: AtomicU32::new(sub_class.raw()),
            enabled: AtomicBool::new(validator.is_enabled()),
            signaller,
            sibling: OnceLock::new(),
            table: Mutex::new(OwnerTable::with_capacity(validator.shared_table_capacity())),
        }))
    }

    pub(crate) fn from_inner(inner: Arc<SharedInner>) -> Self {
        Self(inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<SharedInner> {
        Arc::downgrade(&self.0)
    }

    /// Deletes the record, dropping all remaining owners.
    pub fn delete(self) {
        self.0.enabled.store(false, Ordering::Release);
        self.reset_owner(None, SrcPos::NONE);
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

    /// Whether this record tracks signallers rather than readers.
    pub fn is_signaller(&self) -> bool {
        self.0.signaller
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

    /// Number of distinct owning threads.
    pub fn owner_count(&self) -> usize {
        self.0.table.lock().count
    }

    /// Current number of owner slots.
    pub fn capacity(&self) -> usize {
        self.0.table.lock().slots.len()
    }

    /// One past the highest occupied slot.
    pub fn high_water(&self) -> usize {
        self.0.table.lock().high_water
    }

    /// Owning threads in slot order.
    pub fn owners(&self) -> Vec<ThreadHandle> {
        self.0.table.lock().owners().map(|o| o.thread().clone()).collect()
    }

    /// Owner records in slot order.
    pub fn owner_records(&self) -> Vec<SharedOwner> {
        self.0.table.lock().owners().cloned().collect()
    }

    /// Returns `true` if `thread` is an owner.
    pub fn is_owner(&self, thread: &ThreadHandle) -> bool {
        self.0.table.lock().position(thread).is_some()
    }

    /// How many times `thread` holds the lock.
    pub fn recursion_of(&self, thread: &ThreadHandle) -> u32 {
        let table = self.0.table.lock();
        table
            .position(thread)
            .and_then(|i| table.slots[i].as_ref())
            .map_or(0, SharedOwner::recursion_depth)
    }

    // -- Ownership ----------------------------------------------------------

    fn held_entry(&self, owner: &SharedOwner, nest: Nest, pos: SrcPos) -> HeldEntry {
        HeldEntry {
            lock: WeakLockRecord::Shared(self.downgrade()),
            record: self.0.id,
            owner: Some(owner.id()),
            nest,
            pos,
        }
    }

    /// Adds `thread` (default: the caller) as an owner, or bumps its
    /// recursion count if it already is one.
    pub fn add_owner(&self, thread: Option<&ThreadHandle>, pos: SrcPos) {
        if !self.is_enabled() {
            return;
        }
        let me = ThreadHandle::resolve(thread);
        let mut table = self.0.table.lock();
        if table.position(&me).is_none() && table.is_full() {
            table.grow();
        }

        if let Some(index) = table.position(&me) {
            if let Some(owner) = &table.slots[index] {
                owner.0.recursion.fetch_add(1, Ordering::AcqRel);
                if !self.0.signaller {
                    me.push_held(self.held_entry(owner, Nest::Plain, pos));
                    me.read_lock_inc();
                }
            }
            return;
        }

        let owner = SharedOwner::new(me.clone(), self.downgrade(), pos);
        if !self.0.signaller {
            let index = me.push_held(self.held_entry(&owner, Nest::Base, pos));
            owner.0.hold_index.store(index, Ordering::Release);
            me.read_lock_inc();
        }
        table.insert(owner);
    }

    /// Removes one hold of `thread` (default: the caller) without checking
    /// the release order.
    pub fn remove_owner(&self, thread: Option<&ThreadHandle>) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let me = ThreadHandle::resolve(thread);
        let mut table = self.0.table.lock();
        let Some((index, owner)) = Self::find(&table, &me) else {
            drop(table);
            return Err(self.not_owner(&me));
        };
        if !self.0.signaller {
            let id = owner.id();
            me.with_held(|held| held.remove_topmost(|e| e.owner == Some(id)));
            me.read_lock_dec();
        }
        Self::drop_one(&mut table, index, &owner);
        Ok(())
    }

    /// Removes one hold of `thread` (default: the caller), checking that it
    /// is the top of the thread's hold stack.
    pub fn check_and_release(&self, thread: Option<&ThreadHandle>) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let me = ThreadHandle::resolve(thread);
        let mut table = self.0.table.lock();
        let Some((index, owner)) = Self::find(&table, &me) else {
            drop(table);
            return Err(self.not_owner(&me));
        };
        if !self.0.signaller {
            let id = owner.id();
            let nest = if owner.recursion_depth() > 1 { Nest::Plain } else { Nest::Base };
            if let Err(top) = me.with_held(|held| held.pop_if(|e| e.owner == Some(id) && e.nest == nest)) {
                drop(table);
                let mut report =
                    ViolationReport::new(Error::ReleaseOrderViolation, &self.0.name, owner.pos()).with_thread(&me);
                if let Some(top) = top {
                    let (name, pos) = top.describe();
                    report = report.with_other(&name, pos);
                }
                return Err(self.0.validator.fail(report));
            }
            me.read_lock_dec();
        }
        Self::drop_one(&mut table, index, &owner);
        Ok(())
    }

    /// Replaces all owners with `thread`, or removes them all if `None`.
    pub fn reset_owner(&self, thread: Option<&ThreadHandle>, pos: SrcPos) {
        let mut table = self.0.table.lock();
        if !self.0.signaller {
            for owner in table.owners() {
                release_holds(owner);
            }
        }
        let capacity = table.slots.len();
        *table = OwnerTable::with_capacity(capacity);

        let Some(thread) = thread else {
            return;
        };
        if !self.is_enabled() {
            return;
        }
        let owner = SharedOwner::new(thread.clone(), self.downgrade(), pos);
        if !self.0.signaller {
            let index = thread.push_held(self.held_entry(&owner, Nest::Base, pos));
            owner.0.hold_index.store(index, Ordering::Release);
            thread.read_lock_inc();
        }
        table.insert(owner);
    }

    /// Checks that `thread` (default: the caller) may signal this event.
    pub fn check_signaller(&self, thread: Option<&ThreadHandle>) -> Result<()> {
        let me = ThreadHandle::resolve(thread);
        if !self.0.signaller {
            return Err(self.0.validator.fail(
                ViolationReport::new(Error::InvalidParameter, &self.0.name, SrcPos::NONE)
                    .with_thread(&me)
                    .with_detail("not a signaller record"),
            ));
        }
        if !self.is_enabled() || self.is_owner(&me) {
            return Ok(());
        }
        Err(self.0.validator.fail(
            ViolationReport::new(Error::NotSignaller, &self.0.name, SrcPos::NONE).with_thread(&me),
        ))
    }

    fn find(table: &OwnerTable, thread: &ThreadHandle) -> Option<(usize, SharedOwner)> {
        let index = table.position(thread)?;
        table.slots[index].clone().map(|owner| (index, owner))
    }

    fn drop_one(table: &mut OwnerTable, index: usize, owner: &SharedOwner) {
        if owner.0.recursion.fetch_sub(1, Ordering::AcqRel) == 1 {
            table.remove(index);
        }
    }

    fn not_owner(&self, thread: &ThreadHandle) -> Error {
        self.0
            .validator
            .fail(ViolationReport::new(Error::NotOwnerOnRelease, &self.0.name, SrcPos::NONE).with_thread(thread))
    }

    // -- Checks -------------------------------------------------------------

    /// Checks the acquisition order against the locks `thread` holds.
    pub fn check_order(&self, thread: Option<&ThreadHandle>, pos: SrcPos) -> Result<()> {
        order::check_order(&LockRecord::Shared(self.clone()), &ThreadHandle::resolve(thread), pos)
    }

    /// Checks whether `thread` may block waiting for shared access (or, for
    /// signaller records, for the event), and marks it blocked if
    /// `really_sleeping`.
    pub fn check_blocking(
        &self,
        thread: Option<&ThreadHandle>,
        pos: SrcPos,
        recursive_ok: bool,
        state: ThreadState,
        really_sleeping: bool,
    ) -> Result<()> {
        detector::check_blocking(
            &LockRecord::Shared(self.clone()),
            &ThreadHandle::resolve(thread),
            pos,
            detector::Request {
                exclusive: false,
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
}

impl fmt::Debug for SharedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.0.table.lock();
        f.debug_struct("SharedRecord")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("signaller", &self.0.signaller)
            .field("owners", &table.count)
            .field("capacity", &table.slots.len())
            .finish_non_exhaustive()
    }
}
