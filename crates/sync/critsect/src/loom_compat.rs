//! Loom compatibility shim.
//!
//! When compiled with `cfg(loom)`, re-exports loom's blocking primitives.
//! Otherwise, re-exports the standard `std::sync` ones. This allows
//! [`EventSem`](crate::EventSem) to be tested under loom's deterministic
//! scheduler without code changes.

// ---------------------------------------------------------------------------
// Loom mode
// ---------------------------------------------------------------------------

#[cfg(loom)]
pub(crate) use loom::sync::{Condvar, Mutex};

// ---------------------------------------------------------------------------
// Normal mode
// ---------------------------------------------------------------------------

#[cfg(not(loom))]
pub(crate) use std::sync::{Condvar, Mutex};
