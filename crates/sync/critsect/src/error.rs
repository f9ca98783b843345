//! Critical section errors.

/// Why a critical section operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CritSectError {
    /// The lock validator rejected the operation.
    #[error(transparent)]
    Validator(#[from] lockval::Error),
    /// The section is owned by another thread.
    #[error("critical section is busy")]
    Busy,
    /// The calling thread does not own the section.
    #[error("calling thread does not own the critical section")]
    NotOwner,
    /// A different exit event is already scheduled.
    #[error("an exit event is already scheduled")]
    TooManyEvents,
    /// The section has been deleted.
    #[error("critical section has been destroyed")]
    Destroyed,
    /// The section cannot be deleted while owned.
    #[error("critical section is still owned")]
    StillOwned,
    /// The section is not in the registry.
    #[error("critical section is not registered")]
    NotFound,
    /// Yielding requires the section to be entered exactly once.
    #[error("cannot yield at nesting depth {depth}")]
    Nested {
        /// The current nesting depth.
        depth: u32,
    },
}

/// Result alias for critical section operations.
pub type Result<T, E = CritSectError> = core::result::Result<T, E>;
