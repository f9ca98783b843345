//! Source positions of lock operations.

use core::fmt;
use core::panic::Location;

/// Where a lock operation was issued from.
///
/// Purely diagnostic: the validator stores it in ownership records and wait
/// links so that violation reports can point at the offending call sites.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SrcPos {
    /// Source file.
    pub file: &'static str,
    /// Line in `file`.
    pub line: u32,
    /// Function or module the operation came from.
    pub function: &'static str,
    /// Caller supplied identifier, typically an address.
    pub id: usize,
}

impl SrcPos {
    /// An unknown position.
    pub const NONE: Self = Self {
        file: "",
        line: 0,
        function: "",
        id: 0,
    };

    /// Creates a position from its parts.
    pub const fn new(file: &'static str, line: u32, function: &'static str, id: usize) -> Self {
        Self {
            file,
            line,
            function,
            id,
        }
    }

    /// Captures the position of the caller.
    ///
    /// Works through any chain of `#[track_caller]` functions, so lock
    /// wrappers can forward their own caller's location.
    #[track_caller]
    pub fn caller() -> Self {
        let loc = Location::caller();
        Self {
            file: loc.file(),
            line: loc.line(),
            function: "",
            id: 0,
        }
    }

    /// Returns a copy with `id` replaced.
    #[must_use]
    pub const fn with_id(self, id: usize) -> Self {
        Self { id, ..self }
    }

    /// Returns `true` if the position carries any information.
    pub fn is_known(&self) -> bool {
        self.line != 0 || !self.file.is_empty()
    }
}

impl fmt::Display for SrcPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_known() {
            return f.write_str("<unknown>");
        }
        write!(f, "{}:{}", self.file, self.line)?;
        if !self.function.is_empty() {
            write!(f, " ({})", self.function)?;
        }
        if self.id != 0 {
            write!(f, " [{:#x}]", self.id)?;
        }
        Ok(())
    }
}
