//! Per-thread validator bookkeeping.
//!
//! Every thread that touches a lock record gets a [`ThreadHandle`]: a shared
//! record holding its lock counters, its stack of held locks and what it is
//! currently blocked on. Handles are created lazily on first use and live as
//! long as any record or wait link still refers to them.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::record::{LockRecord, RecordId, RecordKind, WeakLockRecord};
use crate::src_pos::SrcPos;

// ---------------------------------------------------------------------------
// Thread states
// ---------------------------------------------------------------------------

/// Scheduling state of a thread as seen by the validator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ThreadState {
    /// Running or runnable.
    #[default]
    Running,
    /// Waiting to enter a critical section.
    BlockedCritSect,
    /// Waiting on an event semaphore.
    BlockedEvent,
    /// Waiting on a multiple-release event semaphore.
    BlockedEventMulti,
    /// Waiting on a mutex.
    BlockedMutex,
    /// Waiting for read access to a reader/writer lock.
    BlockedRwRead,
    /// Waiting for write access to a reader/writer lock.
    BlockedRwWrite,
    /// Sleeping without waiting on a lock.
    Sleep,
}

impl ThreadState {
    /// Returns `true` for the states that wait on a lock.
    pub fn is_blocked(self) -> bool {
        !matches!(self, Self::Running | Self::Sleep)
    }

    /// Returns a human-readable name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::BlockedCritSect => "blocked(critsect)",
            Self::BlockedEvent => "blocked(event)",
            Self::BlockedEventMulti => "blocked(event-multi)",
            Self::BlockedMutex => "blocked(mutex)",
            Self::BlockedRwRead => "blocked(rw-read)",
            Self::BlockedRwWrite => "blocked(rw-write)",
            Self::Sleep => "sleep",
        }
    }
}

// ---------------------------------------------------------------------------
// Held-lock stack
// ---------------------------------------------------------------------------

/// What kind of hold a stack entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Nest {
    /// The first acquisition of the lock.
    Base,
    /// A recursive acquisition of the same record.
    Plain,
    /// A recursive acquisition through the sibling record.
    Mixed(RecordId),
}

/// Entry in a thread's held-lock stack.
#[derive(Clone)]
pub(crate) struct HeldEntry {
    /// The lock, exclusive record or shared aggregate.
    pub(crate) lock: WeakLockRecord,
    /// Identity of `lock`.
    pub(crate) record: RecordId,
    /// Shared owner record this entry belongs to, if any.
    pub(crate) owner: Option<RecordId>,
    pub(crate) nest: Nest,
    pub(crate) pos: SrcPos,
}

impl HeldEntry {
    /// Name and position for violation reports. Call without the hold stack
    /// locked.
    pub(crate) fn describe(&self) -> (String, SrcPos) {
        let name = self
            .lock
            .upgrade()
            .map_or_else(|| String::from("<destroyed>"), |r| r.name().to_owned());
        (name, self.pos)
    }
}

/// Stack of locks held by a single thread, most recent last.
#[derive(Default)]
pub(crate) struct HoldStack {
    entries: Vec<HeldEntry>,
}

impl HoldStack {
    /// Pushes an entry and returns its index.
    pub(crate) fn push(&mut self, entry: HeldEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    /// Pops the top entry if it satisfies `pred`. Otherwise leaves the stack
    /// untouched and returns a copy of the top entry, if any.
    pub(crate) fn pop_if(&mut self, pred: impl Fn(&HeldEntry) -> bool) -> Result<HeldEntry, Option<HeldEntry>> {
        match self.entries.last() {
            Some(top) if pred(top) => self.entries.pop().ok_or(None),
            top => Err(top.cloned()),
        }
    }

    /// Removes the top-most entry matching `pred`, wherever it is.
    pub(crate) fn remove_topmost(&mut self, pred: impl Fn(&HeldEntry) -> bool) -> Option<HeldEntry> {
        let i = self.entries.iter().rposition(pred)?;
        Some(self.entries.remove(i))
    }

    /// Removes every entry matching `pred`. Returns how many were removed.
    pub(crate) fn remove_all(&mut self, pred: impl Fn(&HeldEntry) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !pred(e));
        before - self.entries.len()
    }

    /// Iterates from the most recent entry down.
    pub(crate) fn iter_top_down(&self) -> impl Iterator<Item = &HeldEntry> {
        self.entries.iter().rev()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// Blocking state
// ---------------------------------------------------------------------------

/// The lock a thread is sleeping on.
#[derive(Clone)]
pub(crate) struct BlockedOn {
    pub(crate) record: LockRecord,
    pub(crate) exclusive: bool,
    pub(crate) pos: SrcPos,
}

#[derive(Default)]
struct WaitState {
    state: ThreadState,
    blocked_on: Option<BlockedOn>,
}

/// Snapshot of what a thread is blocked on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedLockInfo {
    /// Name of the lock.
    pub lock_name: String,
    /// Identity of the record waited on.
    pub record: RecordId,
    /// Kind of the record waited on.
    pub kind: RecordKind,
    /// Whether exclusive access was requested.
    pub exclusive: bool,
    /// The thread's blocking state.
    pub state: ThreadState,
    /// Where the wait was issued.
    pub pos: SrcPos,
}

// ---------------------------------------------------------------------------
// Thread records
// ---------------------------------------------------------------------------

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

struct ThreadRecord {
    id: u64,
    name: String,
    write_locks: AtomicI32,
    read_locks: AtomicI32,
    wait: Mutex<WaitState>,
    /// Set while the thread runs a blocking check.
    in_validator: AtomicBool,
    /// Mutated only on behalf of this thread.
    held: Mutex<HoldStack>,
}

/// Shared handle to a thread's validator record.
///
/// Cloning is cheap; handles compare equal when they refer to the same
/// thread.
#[derive(Clone)]
pub struct ThreadHandle(Arc<ThreadRecord>);

thread_local! {
    static CURRENT: ThreadHandle = ThreadHandle::for_current_thread();
}

impl ThreadHandle {
    fn with_name(name: String) -> Self {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let name = if name.is_empty() { format!("thread-{id}") } else { name };
        Self(Arc::new(ThreadRecord {
            id,
            name,
            write_locks: AtomicI32::new(0),
            read_locks: AtomicI32::new(0),
            wait: Mutex::new(WaitState::default()),
            in_validator: AtomicBool::new(false),
            held: Mutex::new(HoldStack::default()),
        }))
    }

    fn for_current_thread() -> Self {
        Self::with_name(std::thread::current().name().unwrap_or_default().to_owned())
    }

    /// Returns the handle of the calling thread, creating it on first use.
    pub fn current() -> Self {
        CURRENT
            .try_with(Clone::clone)
            .unwrap_or_else(|_| Self::adopt("<exiting>"))
    }

    /// Returns the id of the calling thread without cloning its handle.
    pub fn current_id() -> u64 {
        CURRENT.try_with(ThreadHandle::id).unwrap_or(0)
    }

    /// Creates a handle for a thread the validator does not run on, for
    /// instance a thread of a foreign runtime that owns locks on whose behalf
    /// the caller records operations.
    pub fn adopt(name: impl Into<String>) -> Self {
        Self::with_name(name.into())
    }

    /// Returns `thread` or, when `None`, the calling thread.
    pub fn resolve(thread: Option<&ThreadHandle>) -> Self {
        thread.cloned().unwrap_or_else(Self::current)
    }

    /// Unique id of the thread.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Name of the thread.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    // -- Counters -----------------------------------------------------------

    /// Number of write (exclusive) holds recorded for this thread.
    pub fn write_lock_count(&self) -> i32 {
        self.0.write_locks.load(Ordering::Relaxed)
    }

    /// Increments the write lock counter.
    pub fn write_lock_inc(&self) {
        self.0.write_locks.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the write lock counter.
    pub fn write_lock_dec(&self) {
        let prev = self.0.write_locks.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "write lock count underflow on {}", self.name());
    }

    /// Number of read (shared) holds recorded for this thread, nested entries
    /// included.
    pub fn read_lock_count(&self) -> i32 {
        self.0.read_locks.load(Ordering::Relaxed)
    }

    /// Increments the read lock counter.
    pub fn read_lock_inc(&self) {
        self.0.read_locks.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the read lock counter.
    pub fn read_lock_dec(&self) {
        let prev = self.0.read_locks.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "read lock count underflow on {}", self.name());
    }

    // -- Blocking state -----------------------------------------------------

    /// Current state of the thread.
    pub fn state(&self) -> ThreadState {
        self.0.wait.lock().state
    }

    /// Describes the lock the thread is blocked on, if any.
    pub fn query_blocking(&self) -> Option<BlockedLockInfo> {
        let wait = self.0.wait.lock();
        let blocked = wait.blocked_on.as_ref()?;
        Some(BlockedLockInfo {
            lock_name: blocked.record.name().to_owned(),
            record: blocked.record.id(),
            kind: blocked.record.kind(),
            exclusive: blocked.exclusive,
            state: wait.state,
            pos: blocked.pos,
        })
    }

    /// Returns `true` while the thread runs a blocking check.
    pub fn is_blocked_in_validator(&self) -> bool {
        self.0.in_validator.load(Ordering::Acquire)
    }

    /// Marks the thread as running again after a wait ended.
    pub fn unblock(&self) {
        let mut wait = self.0.wait.lock();
        wait.state = ThreadState::Running;
        wait.blocked_on = None;
    }

    pub(crate) fn set_blocked(&self, blocked: BlockedOn, state: ThreadState) {
        let mut wait = self.0.wait.lock();
        wait.state = state;
        wait.blocked_on = Some(blocked);
    }

    pub(crate) fn blocked_on(&self) -> Option<BlockedOn> {
        let wait = self.0.wait.lock();
        if wait.state.is_blocked() {
            wait.blocked_on.clone()
        } else {
            None
        }
    }

    pub(crate) fn set_in_validator(&self, value: bool) {
        self.0.in_validator.store(value, Ordering::Release);
    }

    // -- Held locks ---------------------------------------------------------

    /// Number of entries on the thread's held-lock stack, recursion entries
    /// included.
    pub fn held_depth(&self) -> usize {
        self.0.held.lock().len()
    }

    /// Names of the held locks, most recent first.
    pub fn held_lock_names(&self) -> Vec<String> {
        // Upgrade outside the stack lock: dropping the last strong reference
        // of a record cleans this very stack.
        let locks: Vec<_> = self.with_held(|held| held.iter_top_down().map(|e| e.lock.clone()).collect());
        locks
            .iter()
            .filter_map(WeakLockRecord::upgrade)
            .map(|r| r.name().to_owned())
            .collect()
    }

    /// Runs `f` with the held-lock stack locked.
    pub(crate) fn with_held<R>(&self, f: impl FnOnce(&mut HoldStack) -> R) -> R {
        f(&mut self.0.held.lock())
    }

    pub(crate) fn push_held(&self, entry: HeldEntry) -> usize {
        self.with_held(|held| held.push(entry))
    }
}

impl PartialEq for ThreadHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for ThreadHandle {}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadHandle({} \"{}\")", self.0.id, self.0.name)
    }
}

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.0.name, self.0.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_is_stable_within_a_thread() {
        let a = ThreadHandle::current();
        let b = ThreadHandle::current();
        assert_eq!(a, b);
        assert_eq!(ThreadHandle::resolve(None), a);
        assert_eq!(ThreadHandle::current_id(), a.id());
    }

    #[test]
    fn threads_get_distinct_handles() {
        let here = ThreadHandle::current();
        let there = std::thread::Builder::new()
            .name("worker".into())
            .spawn(ThreadHandle::current)
            .unwrap()
            .join()
            .unwrap();
        assert_ne!(here, there);
        assert_eq!(there.name(), "worker");
    }

    #[test]
    fn adopted_handles_are_unique() {
        let a = ThreadHandle::adopt("emt");
        let b = ThreadHandle::adopt("emt");
        assert_ne!(a, b);
        assert_eq!(ThreadHandle::resolve(Some(&a)), a);
        assert!(ThreadHandle::adopt("").name().starts_with("thread-"));
    }

    #[test]
    fn counters() {
        let t = ThreadHandle::adopt("counters");
        t.write_lock_inc();
        t.write_lock_inc();
        t.read_lock_inc();
        t.write_lock_dec();
        assert_eq!(t.write_lock_count(), 1);
        assert_eq!(t.read_lock_count(), 1);
    }

    #[test]
    fn fresh_thread_is_running_and_unblocked() {
        let t = ThreadHandle::adopt("idle");
        assert_eq!(t.state(), ThreadState::Running);
        assert!(t.query_blocking().is_none());
        assert!(!t.is_blocked_in_validator());
        assert_eq!(t.held_depth(), 0);
    }

    #[test]
    fn blocked_states() {
        assert!(ThreadState::BlockedCritSect.is_blocked());
        assert!(ThreadState::BlockedRwWrite.is_blocked());
        assert!(!ThreadState::Running.is_blocked());
        assert!(!ThreadState::Sleep.is_blocked());
    }

    #[test]
    fn held_lock_names_survives_concurrent_record_drop() {
        use crate::class::{LockClassId, SubClass};
        use crate::config::ValidatorConfig;
        use crate::validator::LockValidator;
        use std::sync::atomic::AtomicBool;

        let v = LockValidator::new(ValidatorConfig::default().quiet(true).may_panic(false));
        let t = ThreadHandle::adopt("holder");
        let done = AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..2_000 {
                    let rec = v.create_excl(LockClassId::NONE, SubClass::NONE, format!("l{i}"), 0);
                    rec.set_owner(Some(&t), SrcPos::caller(), true);
                    // Dropped while owned: the record cleans `t`'s stack.
                }
                done.store(true, Ordering::Release);
            });
            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    assert!(t.held_lock_names().len() <= 1);
                }
            });
        });

        assert_eq!(t.held_depth(), 0);
        assert_eq!(t.write_lock_count(), 0);
    }
}
