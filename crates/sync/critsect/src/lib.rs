//! Validated recursive critical sections.
//!
//! A [`CritSect`] is a recursive mutex that reports every acquisition and
//! release to a [`lockval::LockValidator`]. Before a contended enter goes to
//! sleep the validator checks lock order and walks the wait-for graph, so a
//! deadlock is returned as an error instead of hanging the threads involved.
//!
//! Sections are normally created through a [`CritSectRegistry`], which keeps
//! them in one list for bulk teardown, fatal-path release and debugging
//! output.
//!
//! # Loom testing
//!
//! The event semaphore sections park on goes through [`loom_compat`], so it
//! can be model-checked with `RUSTFLAGS="--cfg loom" cargo test -p critsect --lib`.

mod critsect;
mod error;
mod loom_compat;
mod registry;
mod sem;
mod stats;

pub use critsect::{CritSect, CritSectFlags, CritSectGuard};
pub use error::{CritSectError, Result};
pub use registry::CritSectRegistry;
pub use sem::EventSem;
pub use stats::StatsSnapshot;
