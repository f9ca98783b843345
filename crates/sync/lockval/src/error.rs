//! Validator status codes.

/// A lock validation failure.
///
/// Every variant is produced only after the violation went through the
/// reporting path. The state of the records involved is the same as before
/// the failing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Error {
    /// A record, thread or argument combination is not valid for the call.
    #[error("invalid lock validator parameter")]
    InvalidParameter,
    /// Acquiring the lock would violate the class acquisition order.
    #[error("lock order violation")]
    OrderViolation,
    /// The lock being released is not the most recently acquired one.
    #[error("wrong lock release order")]
    ReleaseOrderViolation,
    /// The lock is already owned and its class forbids recursion.
    #[error("nested locking not allowed")]
    NestedNotAllowed,
    /// Blocking would close a cycle in the wait-for graph.
    #[error("deadlock detected")]
    DeadlockDetected,
    /// The thread would wait on a lock it already holds the other side of.
    #[error("illegal lock upgrade")]
    IllegalUpgrade,
    /// The releasing thread does not own the lock.
    #[error("releasing thread is not an owner")]
    NotOwnerOnRelease,
    /// The thread is not registered as a signaller of the event.
    #[error("thread is not a signaller")]
    NotSignaller,
}

impl Error {
    /// Short identifier used in violation reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidParameter => "invalid parameter",
            Self::OrderViolation => "lock order violation",
            Self::ReleaseOrderViolation => "wrong release order",
            Self::NestedNotAllowed => "nested locking",
            Self::DeadlockDetected => "potential deadlock",
            Self::IllegalUpgrade => "illegal upgrade",
            Self::NotOwnerOnRelease => "not owner",
            Self::NotSignaller => "not signaller",
        }
    }
}

/// Result alias used throughout the validator.
pub type Result<T, E = Error> = core::result::Result<T, E>;
