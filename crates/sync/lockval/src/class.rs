//! Lock classes, subclasses and the learned class order graph.
//!
//! A class groups locks with the same ordering rules. Within a class, locks
//! are ordered by [`SubClass`]. Across classes, classes flagged
//! [`ClassFlags::AUTODIDACT`] record "class A was held when class B was
//! acquired" as an edge in a packed adjacency bitset and reject any new edge
//! that would close a cycle.

use core::fmt;

use bitflags::bitflags;
use parking_lot::RwLock;

use crate::src_pos::SrcPos;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum distinct lock classes per validator.
pub const MAX_CLASSES: usize = 256;

/// Number of `u64` words needed for the packed adjacency bitset.
/// Each bit represents an edge from class `row` to class `col`.
const GRAPH_WORDS: usize = MAX_CLASSES * MAX_CLASSES / 64;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifies a lock class within a [`ClassRegistry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LockClassId(u16);

impl LockClassId {
    /// Sentinel value meaning "no class". Records without a class are never
    /// order checked.
    pub const NONE: Self = Self(u16::MAX);

    /// Returns `true` for [`LockClassId::NONE`].
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Position of a lock within its class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubClass(u32);

impl SubClass {
    /// Cannot be held together with any other lock of the same class.
    pub const NONE: Self = Self(0);
    /// Exempt from subclass ordering.
    pub const ANY: Self = Self(1);
    /// First user subclass. Values from here up are ordered numerically.
    pub const USER: Self = Self(16);

    /// Returns user subclass `n`, i.e. `USER + n`.
    pub const fn user(n: u32) -> Self {
        Self(Self::USER.0.saturating_add(n))
    }

    /// Wraps a raw subclass value.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns `true` for ordered user subclasses.
    pub fn is_user(self) -> bool {
        self >= Self::USER
    }
}

impl Default for SubClass {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for SubClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => f.write_str("none"),
            Self::ANY => f.write_str("any"),
            Self(raw) if raw >= Self::USER.0 => write!(f, "user+{}", raw - Self::USER.0),
            Self(raw) => write!(f, "reserved({raw})"),
        }
    }
}

bitflags! {
    /// Behaviour flags of a lock class.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ClassFlags: u32 {
        /// Learn cross-class acquisition order from observed acquisitions and
        /// reject inversions. Only edges between two learning classes are
        /// recorded.
        const AUTODIDACT = 1 << 0;
        /// Locks of this class may not be entered recursively.
        const NO_RECURSION = 1 << 1;
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Metadata for a registered lock class.
struct ClassEntry {
    /// Lookup key, `0` for anonymous classes.
    key: usize,
    /// Human-readable name (e.g. `"pdm-queue"`).
    name: String,
    flags: ClassFlags,
}

struct ClassTable {
    entries: Vec<ClassEntry>,
    /// Packed adjacency bitset. Bit `(a * MAX_CLASSES + b)` is set when class
    /// `a` was held while class `b` was acquired.
    graph: Box<[u64]>,
    /// Edges in discovery order, for diagnostics.
    edges: Vec<(LockClassId, LockClassId)>,
}

impl ClassTable {
    fn find(&self, key: usize) -> Option<LockClassId> {
        if key == 0 {
            return None;
        }
        self.entries
            .iter()
            .position(|e| e.key == key)
            .map(|i| LockClassId(i as u16))
    }

    fn insert(&mut self, key: usize, name: String, flags: ClassFlags) -> LockClassId {
        if self.entries.len() >= MAX_CLASSES {
            // Table full: return NONE so the order checks become no-ops for
            // locks of this class.
            tracing::warn!(name, "lock class table full");
            return LockClassId::NONE;
        }
        let id = LockClassId(self.entries.len() as u16);
        tracing::trace!(class = id.0, name, ?flags, "registered lock class");
        self.entries.push(ClassEntry { key, name, flags });
        id
    }

    /// Tests whether edge (from, to) exists in the graph.
    #[inline]
    fn graph_test(&self, from: usize, to: usize) -> bool {
        let bit = from * MAX_CLASSES + to;
        self.graph[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    /// Sets edge (from, to) in the graph.
    #[inline]
    fn graph_set(&mut self, from: usize, to: usize) {
        let bit = from * MAX_CLASSES + to;
        self.graph[bit / 64] |= 1u64 << (bit % 64);
    }

    /// Returns `true` if there is a path from `src` to `dst`.
    fn has_path(&self, src: LockClassId, dst: LockClassId) -> bool {
        let count = self.entries.len();
        let mut visited = [0u64; MAX_CLASSES / 64];
        let mut stack = Vec::with_capacity(count);
        stack.push(src.index());

        while let Some(node) = stack.pop() {
            if node == dst.index() {
                return true;
            }
            let word = node / 64;
            let bit = 1u64 << (node % 64);
            if visited[word] & bit != 0 {
                continue;
            }
            visited[word] |= bit;

            for neighbor in 0..count {
                if self.graph_test(node, neighbor) && visited[neighbor / 64] & (1u64 << (neighbor % 64)) == 0 {
                    stack.push(neighbor);
                }
            }
        }
        false
    }
}

/// Class table and learned order graph of one validator.
pub struct ClassRegistry {
    table: RwLock<ClassTable>,
}

impl ClassRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            table: RwLock::new(ClassTable {
                entries: Vec::new(),
                graph: vec![0u64; GRAPH_WORDS].into_boxed_slice(),
                edges: Vec::new(),
            }),
        }
    }

    /// Registers a new anonymous class.
    ///
    /// Returns [`LockClassId::NONE`] once [`MAX_CLASSES`] classes exist.
    pub fn register(&self, name: impl Into<String>, flags: ClassFlags) -> LockClassId {
        self.table.write().insert(0, name.into(), flags)
    }

    /// Returns the class registered under `key`, registering it first if
    /// needed. Idempotent; `name` and `flags` of later calls are ignored.
    ///
    /// A `key` of `0` always registers a new class.
    pub fn get_or_register(&self, key: usize, name: impl Into<String>, flags: ClassFlags) -> LockClassId {
        if let Some(id) = self.table.read().find(key) {
            return id;
        }
        let mut table = self.table.write();
        // Re-check: another thread may have registered it.
        if let Some(id) = table.find(key) {
            return id;
        }
        table.insert(key, name.into(), flags)
    }

    /// Returns the class for locks created at `pos`.
    ///
    /// All locks initialized from the same file and line share one class,
    /// named after the position unless `name` is given.
    pub fn for_src_pos(&self, pos: &SrcPos, name: Option<&str>, flags: ClassFlags) -> LockClassId {
        let key = src_pos_key(pos);
        if let Some(id) = self.table.read().find(key) {
            return id;
        }
        let name = name.map_or_else(|| pos.to_string(), str::to_owned);
        self.get_or_register(key, name, flags)
    }

    /// Returns the name of a class, or `"<none>"`.
    pub fn name(&self, id: LockClassId) -> String {
        self.table
            .read()
            .entries
            .get(id.index())
            .map_or_else(|| String::from("<none>"), |e| e.name.clone())
    }

    /// Returns the flags of a class. Unknown classes have no flags.
    pub fn flags(&self, id: LockClassId) -> ClassFlags {
        self.table
            .read()
            .entries
            .get(id.index())
            .map_or(ClassFlags::empty(), |e| e.flags)
    }

    /// Number of registered classes.
    pub fn len(&self) -> usize {
        self.table.read().entries.len()
    }

    /// Returns `true` if no class has been registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `to` was learned to come after `from`, directly or
    /// transitively.
    pub fn is_ordered_before(&self, from: LockClassId, to: LockClassId) -> bool {
        if from.is_none() || to.is_none() || from == to {
            return false;
        }
        self.table.read().has_path(from, to)
    }

    /// Number of learned order edges.
    pub fn edge_count(&self) -> usize {
        self.table.read().edges.len()
    }

    /// Records that `to` was acquired while `held` was held.
    ///
    /// Returns `false`, recording nothing, if the new edge would close a
    /// cycle.
    pub(crate) fn learn_order(&self, held: LockClassId, to: LockClassId) -> bool {
        if held.is_none() || to.is_none() || held == to {
            return true;
        }
        if self.table.read().graph_test(held.index(), to.index()) {
            return true;
        }

        let mut table = self.table.write();
        if table.graph_test(held.index(), to.index()) {
            return true;
        }
        // A path back from `to` to `held` means the inverse order was seen.
        if table.has_path(to, held) {
            return false;
        }
        table.graph_set(held.index(), to.index());
        table.edges.push((held, to));
        tracing::debug!(from = held.0, to = to.0, "learned lock class order");
        true
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.read();
        f.debug_struct("ClassRegistry")
            .field("classes", &table.entries.len())
            .field("edges", &table.edges.len())
            .finish()
    }
}

/// Folds file and line into a lookup key. Never `0`.
fn src_pos_key(pos: &SrcPos) -> usize {
    let mut hash: usize = 0xcbf2_9ce4;
    for b in pos.file.bytes() {
        hash = (hash ^ usize::from(b)).wrapping_mul(0x0100_0193);
    }
    hash = (hash ^ pos.line as usize).wrapping_mul(0x0100_0193);
    hash | 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_returns_distinct_ids() {
        let reg = ClassRegistry::new();
        let a = reg.register("a", ClassFlags::empty());
        let b = reg.register("b", ClassFlags::AUTODIDACT);
        assert_ne!(a, b);
        assert_eq!(reg.name(a), "a");
        assert_eq!(reg.flags(b), ClassFlags::AUTODIDACT);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn get_or_register_is_idempotent() {
        let reg = ClassRegistry::new();
        let a = reg.get_or_register(0x1000, "a", ClassFlags::empty());
        let again = reg.get_or_register(0x1000, "renamed", ClassFlags::NO_RECURSION);
        assert_eq!(a, again);
        assert_eq!(reg.name(a), "a");
        assert!(reg.flags(a).is_empty());
    }

    #[test]
    fn for_src_pos_shares_class_per_site() {
        let reg = ClassRegistry::new();
        let here = SrcPos::new("dev.rs", 10, "", 0);
        let there = SrcPos::new("dev.rs", 11, "", 0);
        let a = reg.for_src_pos(&here, None, ClassFlags::empty());
        assert_eq!(a, reg.for_src_pos(&here, Some("ignored"), ClassFlags::empty()));
        assert_ne!(a, reg.for_src_pos(&there, None, ClassFlags::empty()));
        assert_eq!(reg.name(a), "dev.rs:10");
    }

    #[test]
    fn table_full_returns_none() {
        let reg = ClassRegistry::new();
        for i in 0..MAX_CLASSES {
            assert!(!reg.register(format!("c{i}"), ClassFlags::empty()).is_none());
        }
        assert!(reg.register("overflow", ClassFlags::empty()).is_none());
    }

    #[test]
    fn learned_order_is_transitive() {
        let reg = ClassRegistry::new();
        let a = reg.register("a", ClassFlags::AUTODIDACT);
        let b = reg.register("b", ClassFlags::AUTODIDACT);
        let c = reg.register("c", ClassFlags::AUTODIDACT);

        assert!(reg.learn_order(a, b));
        assert!(reg.learn_order(b, c));
        assert!(reg.is_ordered_before(a, c));
        assert!(!reg.is_ordered_before(c, a));
        assert_eq!(reg.edge_count(), 2);
    }

    #[test]
    fn inversion_is_rejected_without_recording() {
        let reg = ClassRegistry::new();
        let a = reg.register("a", ClassFlags::AUTODIDACT);
        let b = reg.register("b", ClassFlags::AUTODIDACT);
        let c = reg.register("c", ClassFlags::AUTODIDACT);

        assert!(reg.learn_order(a, b));
        assert!(reg.learn_order(b, c));
        assert!(!reg.learn_order(c, a));
        assert!(!reg.is_ordered_before(c, a));
        assert_eq!(reg.edge_count(), 2);
    }

    #[test]
    fn repeated_edge_is_recorded_once() {
        let reg = ClassRegistry::new();
        let a = reg.register("a", ClassFlags::AUTODIDACT);
        let b = reg.register("b", ClassFlags::AUTODIDACT);
        assert!(reg.learn_order(a, b));
        assert!(reg.learn_order(a, b));
        assert_eq!(reg.edge_count(), 1);
    }

    #[test]
    fn subclass_display() {
        assert_eq!(SubClass::NONE.to_string(), "none");
        assert_eq!(SubClass::ANY.to_string(), "any");
        assert_eq!(SubClass::user(3).to_string(), "user+3");
        assert_eq!(SubClass::from_raw(5).to_string(), "reserved(5)");
        assert!(SubClass::user(0).is_user());
        assert!(!SubClass::ANY.is_user());
    }
}
