//! Violation reports and the reporting path.

use core::fmt;
use std::sync::Arc;

use crate::error::Error;
use crate::src_pos::SrcPos;
use crate::thread::ThreadHandle;
use crate::validator::LockValidator;

/// One hop of a wait-for chain: `thread` is blocked on `lock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitLink {
    /// Id of the waiting thread.
    pub thread_id: u64,
    /// Name of the waiting thread.
    pub thread: String,
    /// Name of the lock waited on.
    pub lock: String,
    /// Where the wait was issued.
    pub pos: SrcPos,
}

/// Everything known about a violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationReport {
    /// The status returned to the caller.
    pub error: Error,
    /// Lock the failing operation was issued on.
    pub lock: String,
    /// Thread that issued it, if known.
    pub thread: Option<String>,
    /// Where it was issued.
    pub pos: SrcPos,
    /// The other lock involved, e.g. the held lock an order check failed
    /// against, with the position it was acquired at.
    pub other: Option<(String, SrcPos)>,
    /// Wait-for chain of a deadlock, starting with the first thread the
    /// caller would wait for.
    pub chain: Vec<WaitLink>,
    /// Free-form detail.
    pub detail: Option<String>,
}

impl ViolationReport {
    /// Starts a report for `error` on `lock`.
    pub fn new(error: Error, lock: &str, pos: SrcPos) -> Self {
        Self {
            error,
            lock: lock.to_owned(),
            thread: None,
            pos,
            other: None,
            chain: Vec::new(),
            detail: None,
        }
    }

    /// Sets the issuing thread.
    #[must_use]
    pub fn with_thread(mut self, thread: &ThreadHandle) -> Self {
        self.thread = Some(thread.to_string());
        self
    }

    /// Sets the other lock involved.
    #[must_use]
    pub fn with_other(mut self, lock: &str, pos: SrcPos) -> Self {
        self.other = Some((lock.to_owned(), pos));
        self
    }

    /// Sets the wait-for chain.
    #[must_use]
    pub fn with_chain(mut self, chain: Vec<WaitLink>) -> Self {
        self.chain = chain;
        self
    }

    /// Sets the detail text.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for ViolationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lockval: {}!\n Lock: \"{}\" at {}", self.error.as_str(), self.lock, self.pos)?;
        if let Some(thread) = &self.thread {
            write!(f, " | Thread: {thread}")?;
        }
        if let Some((lock, pos)) = &self.other {
            write!(f, "\n Other: \"{lock}\" at {pos}")?;
        }
        for (i, link) in self.chain.iter().enumerate() {
            write!(
                f,
                "\n #{i}: {}#{} waits for \"{}\" at {}",
                link.thread, link.thread_id, link.lock, link.pos
            )?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "\n {detail}")?;
        }
        Ok(())
    }
}

/// Callback invoked for every violation before the panic decision.
pub type ViolationHook = Arc<dyn Fn(&ViolationReport) + Send + Sync>;

impl LockValidator {
    /// Reports a violation and returns the error to hand to the caller.
    ///
    /// Logs unless quiet and runs the hook. Panics afterwards if the
    /// validator may panic. Must be called with no record, thread or
    /// detector lock held.
    pub(crate) fn fail(&self, report: ViolationReport) -> Error {
        self.count_violation();
        if !self.are_quiet() {
            tracing::error!(
                error = %report.error,
                lock = %report.lock,
                pos = %report.pos,
                chain = report.chain.len(),
                "{report}"
            );
        }
        if let Some(hook) = self.hook() {
            hook(&report);
        }

        if self.may_panic() {
            panic!("{report}");
        }
        report.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_chain() {
        let report = ViolationReport::new(Error::DeadlockDetected, "A", SrcPos::new("a.rs", 1, "", 0))
            .with_other("B", SrcPos::NONE)
            .with_chain(vec![WaitLink {
                thread_id: 7,
                thread: "worker".into(),
                lock: "B".into(),
                pos: SrcPos::new("b.rs", 2, "", 0),
            }])
            .with_detail("cycle of length 2");
        let text = report.to_string();
        assert!(text.starts_with("lockval: potential deadlock!"));
        assert!(text.contains("Lock: \"A\" at a.rs:1"));
        assert!(text.contains("Other: \"B\" at <unknown>"));
        assert!(text.contains("#0: worker#7 waits for \"B\" at b.rs:2"));
        assert!(text.ends_with("cycle of length 2"));
    }
}
