//! Wait-for graph deadlock detection.
//!
//! Nodes are threads, and an edge `T -> U` means `T` is blocked on a lock
//! that `U` owns. Before a thread blocks, the detector looks for a path from
//! the owners of the requested lock back to the caller. A walk for one
//! caller is serialized against all others by the detector lock, so two
//! threads closing the same cycle cannot both be approved.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::record::LockRecord;
use crate::report::{ViolationReport, WaitLink};
use crate::src_pos::SrcPos;
use crate::thread::{BlockedOn, ThreadHandle, ThreadState};

/// Longest wait-for chain followed before giving up. Chains this long are
/// treated as deadlock free.
pub(crate) const MAX_WAIT_CHAIN: usize = 32;

/// Parameters of a blocking request.
#[derive(Clone, Copy)]
pub(crate) struct Request {
    pub(crate) exclusive: bool,
    pub(crate) recursive_ok: bool,
    pub(crate) state: ThreadState,
    pub(crate) really_sleeping: bool,
}

/// How the threads a waiter depends on combine.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Wake {
    /// The waiter needs every blocker gone. One blocker leading back to the
    /// caller is enough for a deadlock.
    All,
    /// Any one blocker can release the waiter. Deadlock only if every
    /// blocker leads back to the caller.
    Any,
}

/// Marks the thread as inside the validator for the duration of a check.
struct InValidator<'a>(&'a ThreadHandle);

impl<'a> InValidator<'a> {
    fn enter(thread: &'a ThreadHandle) -> Self {
        thread.set_in_validator(true);
        Self(thread)
    }
}

impl Drop for InValidator<'_> {
    fn drop(&mut self) {
        self.0.set_in_validator(false);
    }
}

/// Checks whether `me` may block on `rec`.
///
/// On approval with `really_sleeping` the thread is marked blocked on `rec`
/// and stays so until [`ThreadHandle::unblock`].
pub(crate) fn check_blocking(rec: &LockRecord, me: &ThreadHandle, pos: SrcPos, req: Request) -> Result<()> {
    let _in_validator = InValidator::enter(me);
    let validator = rec.validator();

    let verdict = {
        let _serialize = validator.serialize_detection();
        let verdict = if rec.is_enabled() {
            evaluate(rec, me, req.exclusive, req.recursive_ok)
        } else {
            Verdict::Approve
        };
        if matches!(verdict, Verdict::Approve) && req.really_sleeping {
            me.set_blocked(
                BlockedOn {
                    record: rec.clone(),
                    exclusive: req.exclusive,
                    pos,
                },
                req.state,
            );
        }
        verdict
    };

    match verdict {
        Verdict::Approve | Verdict::Recursion => Ok(()),
        Verdict::Fail(error, detail) => Err(validator.fail(
            ViolationReport::new(error, rec.name(), pos)
                .with_thread(me)
                .with_detail(detail),
        )),
        Verdict::Deadlock(chain) => {
            tracing::debug!(lock = rec.name(), hops = chain.len(), "wait-for cycle found");
            let detail = format!("cycle of {} thread(s)", chain.len() + 1);
            Err(validator.fail(
                ViolationReport::new(Error::DeadlockDetected, rec.name(), pos)
                    .with_thread(me)
                    .with_chain(chain)
                    .with_detail(detail),
            ))
        }
    }
}

enum Verdict {
    /// The thread may block.
    Approve,
    /// The thread already owns the lock and may recurse without blocking.
    Recursion,
    Fail(Error, String),
    Deadlock(Vec<WaitLink>),
}

fn evaluate(rec: &LockRecord, me: &ThreadHandle, exclusive: bool, recursive_ok: bool) -> Verdict {
    if let Some(verdict) = zero_hop(rec, me, exclusive, recursive_ok) {
        return verdict;
    }

    let (blockers, wake) = blockers(rec, exclusive);
    if blockers.is_empty() {
        return Verdict::Approve;
    }

    let mut walk = Walk {
        me,
        on_path: HashSet::new(),
        chain: Vec::new(),
    };
    if walk.leads_back(&blockers, wake, 0) {
        Verdict::Deadlock(walk.chain)
    } else {
        Verdict::Approve
    }
}

/// Handles the caller waiting on a lock it is itself involved in.
fn zero_hop(rec: &LockRecord, me: &ThreadHandle, exclusive: bool, recursive_ok: bool) -> Option<Verdict> {
    let own = |recursive_ok: bool| {
        if recursive_ok {
            Verdict::Recursion
        } else {
            Verdict::Fail(Error::NestedNotAllowed, String::from("lock already owned by the caller"))
        }
    };
    let upgrade = |what: &str| Verdict::Fail(Error::IllegalUpgrade, what.to_owned());

    match rec {
        LockRecord::Excl(r) => {
            if r.is_owned_by(me) {
                return Some(own(recursive_ok));
            }
            if let Some(LockRecord::Shared(readers)) = r.sibling() {
                if !readers.is_signaller() && readers.is_owner(me) {
                    return Some(upgrade("waiting for write access while holding read access"));
                }
            }
        }
        LockRecord::Shared(r) if !r.is_signaller() => {
            if r.is_owner(me) {
                return Some(if exclusive {
                    upgrade("waiting for exclusive access while holding shared access")
                } else {
                    own(recursive_ok)
                });
            }
            if let Some(LockRecord::Excl(writer)) = r.sibling() {
                if writer.is_owned_by(me) {
                    return Some(upgrade("waiting for read access while holding write access"));
                }
            }
        }
        LockRecord::Shared(_) => {}
    }
    None
}

/// Threads `rec` waits for when requested with `exclusive` access.
fn blockers(rec: &LockRecord, exclusive: bool) -> (Vec<ThreadHandle>, Wake) {
    match rec {
        LockRecord::Excl(r) => {
            let mut threads: Vec<_> = r.owner().into_iter().collect();
            if let Some(LockRecord::Shared(readers)) = r.sibling() {
                if !readers.is_signaller() {
                    threads.extend(readers.owners());
                }
            }
            (threads, Wake::All)
        }
        LockRecord::Shared(r) if r.is_signaller() => (r.owners(), Wake::Any),
        LockRecord::Shared(r) => {
            let mut threads = Vec::new();
            if exclusive {
                threads.extend(r.owners());
            }
            if let Some(LockRecord::Excl(writer)) = r.sibling() {
                threads.extend(writer.owner());
            }
            (threads, Wake::All)
        }
    }
}

struct Walk<'a> {
    me: &'a ThreadHandle,
    /// Threads on the path currently being expanded. A thread reached from
    /// a sibling branch is walked again, since `Wake::Any` needs every
    /// branch to lead back on its own.
    on_path: HashSet<u64>,
    chain: Vec<WaitLink>,
}

impl Walk<'_> {
    /// Returns `true` if waiting on `blockers` combined per `wake` would
    /// wait on the caller. On success `chain` holds the path taken.
    fn leads_back(&mut self, blockers: &[ThreadHandle], wake: Wake, depth: usize) -> bool {
        if blockers.is_empty() {
            return false;
        }
        let start = self.chain.len();
        let found = match wake {
            Wake::All => blockers.iter().any(|t| self.reaches(t, depth)),
            Wake::Any => blockers.iter().all(|t| self.reaches(t, depth)),
        };
        // A failed `Wake::Any` may leave links of the branches that did lead back.
        if !found {
            self.chain.truncate(start);
        }
        found
    }

    fn reaches(&mut self, thread: &ThreadHandle, depth: usize) -> bool {
        if thread == self.me {
            return true;
        }
        if depth >= MAX_WAIT_CHAIN || self.on_path.contains(&thread.id()) {
            return false;
        }
        let Some(blocked) = thread.blocked_on() else {
            return false;
        };
        self.on_path.insert(thread.id());

        self.chain.push(WaitLink {
            thread_id: thread.id(),
            thread: thread.name().to_owned(),
            lock: blocked.record.name().to_owned(),
            pos: blocked.pos,
        });
        let (next, wake) = blockers(&blocked.record, blocked.exclusive);
        let found = self.leads_back(&next, wake, depth + 1);
        self.on_path.remove(&thread.id());
        if !found {
            self.chain.pop();
        }
        found
    }
}
