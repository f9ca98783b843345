//! Validator configuration.

use crate::class::SubClass;

/// Default number of slots a shared record's owner table starts with.
pub const DEFAULT_SHARED_TABLE_CAPACITY: usize = 8;

/// Direction in which user subclasses must be acquired within a class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    /// Lower subclasses first. Taking a lower subclass while holding a
    /// higher one is a violation.
    #[default]
    Ascending,
    /// Higher subclasses first.
    Descending,
}

impl OrderDirection {
    /// Returns `true` if `acquiring` may be taken while `held` is held, both
    /// being locks of the same class.
    pub fn permits(self, held: SubClass, acquiring: SubClass) -> bool {
        if held == SubClass::ANY || acquiring == SubClass::ANY {
            return true;
        }
        if !held.is_user() || !acquiring.is_user() {
            return false;
        }
        match self {
            Self::Ascending => acquiring > held,
            Self::Descending => acquiring < held,
        }
    }
}

/// Settings for a [`LockValidator`](crate::LockValidator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorConfig {
    /// Whether records created from now on are validated.
    pub enabled: bool,
    /// Suppresses violation logging.
    pub quiet: bool,
    /// Panic on violations instead of returning the error.
    pub may_panic: bool,
    /// Subclass ordering rule.
    pub order: OrderDirection,
    /// Initial owner-table capacity of shared records.
    pub shared_table_capacity: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            quiet: false,
            may_panic: !cfg!(lockval_warn),
            order: OrderDirection::Ascending,
            shared_table_capacity: DEFAULT_SHARED_TABLE_CAPACITY,
        }
    }
}

impl ValidatorConfig {
    /// Returns the defaults overridden by `LOCKVAL_ENABLED`, `LOCKVAL_QUIET`
    /// and `LOCKVAL_MAY_PANIC` where those are set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_flag("LOCKVAL_ENABLED") {
            config.enabled = v;
        }
        if let Some(v) = env_flag("LOCKVAL_QUIET") {
            config.quiet = v;
        }
        if let Some(v) = env_flag("LOCKVAL_MAY_PANIC") {
            config.may_panic = v;
        }
        config
    }

    /// Sets [`enabled`](Self::enabled).
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets [`quiet`](Self::quiet).
    #[must_use]
    pub const fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Sets [`may_panic`](Self::may_panic).
    #[must_use]
    pub const fn may_panic(mut self, may_panic: bool) -> Self {
        self.may_panic = may_panic;
        self
    }

    /// Sets [`order`](Self::order).
    #[must_use]
    pub const fn order(mut self, order: OrderDirection) -> Self {
        self.order = order;
        self
    }

    /// Sets [`shared_table_capacity`](Self::shared_table_capacity). Zero is
    /// bumped to one.
    #[must_use]
    pub const fn shared_table_capacity(mut self, capacity: usize) -> Self {
        self.shared_table_capacity = if capacity == 0 { 1 } else { capacity };
        self
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    parse_flag(&value)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
