//! Symbols: named global bindings with attributes and rule stores
//!
//! A symbol owns an attribute bitset, an own-value slot (consulted when the
//! bare symbol is evaluated) and six independently lockable rule caches (see
//! [`crate::kernel::rules`]). Symbols are interned per kernel with
//! create-if-absent semantics; temporary symbols get a process-unique name
//! and are never interned, so they vanish when the last handle drops.

use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::kernel::rules::RuleSet;
use crate::kernel::value::Value;

/// Attribute bitset controlling evaluator behavior for a symbol.
///
/// The bit layout groups the hold flags so that `HOLD_ALL` is the union of
/// `HOLD_FIRST` and `HOLD_REST`.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Attributes(pub u32);

impl Attributes {
    pub const NONE: Attributes = Attributes(0);
    /// Value and rule mutations are rejected.
    pub const PROTECTED: Attributes = Attributes(1 << 0);
    /// Do not evaluate the first argument.
    pub const HOLD_FIRST: Attributes = Attributes(1 << 1);
    /// Do not evaluate any argument but the first.
    pub const HOLD_REST: Attributes = Attributes(1 << 2);
    /// Do not evaluate any argument.
    pub const HOLD_ALL: Attributes = Attributes(1 << 1 | 1 << 2);
    /// Sort arguments into canonical order before matching.
    pub const ORDERLESS: Attributes = Attributes(1 << 3);
    /// Flatten nested same-headed arguments before matching.
    pub const FLAT: Attributes = Attributes(1 << 4);
    /// Process-unique, not interned.
    pub const TEMPORARY: Attributes = Attributes(1 << 7);
    /// Threads element-wise over list arguments (rule-like expansion, not a
    /// core primitive).
    pub const LISTABLE: Attributes = Attributes(1 << 8);
    /// Hold every argument and suppress even the `Evaluate` override and
    /// up-rule lookup.
    pub const HOLD_ALL_COMPLETE: Attributes = Attributes(1 << 10);
    /// Numeric approximation distributes over the arguments.
    pub const NUMERIC_FUNCTION: Attributes = Attributes(1 << 13);

    pub fn contains(self, other: Attributes) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Attributes {
    type Output = Attributes;
    fn bitor(self, rhs: Attributes) -> Attributes {
        Attributes(self.0 | rhs.0)
    }
}

impl BitAnd for Attributes {
    type Output = Attributes;
    fn bitand(self, rhs: Attributes) -> Attributes {
        Attributes(self.0 & rhs.0)
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Attributes({:#x})", self.0)
    }
}

/// A named, globally registered mutable binding.
pub struct Symbol {
    name: String,
    attributes: AtomicU32,
    value: RwLock<Option<Value>>,
    rules: RuleSet,
}

impl Symbol {
    pub(crate) fn new(name: String, attributes: Attributes) -> Symbol {
        Symbol {
            name,
            attributes: AtomicU32::new(attributes.0),
            value: RwLock::new(None),
            rules: RuleSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> Attributes {
        Attributes(self.attributes.load(Ordering::Acquire))
    }

    pub(crate) fn set_attributes(&self, attributes: Attributes) {
        self.attributes.store(attributes.0, Ordering::Release);
    }

    pub(crate) fn add_attributes(&self, attributes: Attributes) {
        self.attributes.fetch_or(attributes.0, Ordering::AcqRel);
    }

    pub fn is_protected(&self) -> bool {
        self.attributes().contains(Attributes::PROTECTED)
    }

    /// The symbol's own value, if bound.
    pub fn own_value(&self) -> Option<Value> {
        self.value.read().clone()
    }

    pub(crate) fn write_value(&self, value: Option<Value>) {
        *self.value.write() = value;
    }

    pub(crate) fn rules(&self) -> &RuleSet {
        &self.rules
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.name)
    }
}

/// Rejected definition write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignError {
    /// The symbol carries the `PROTECTED` attribute.
    Protected,
}

impl fmt::Display for AssignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssignError::Protected => write!(f, "symbol is protected against definition changes"),
        }
    }
}

impl std::error::Error for AssignError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_set_operations() {
        let a = Attributes::HOLD_FIRST | Attributes::FLAT;
        assert!(a.contains(Attributes::HOLD_FIRST));
        assert!(a.contains(Attributes::FLAT));
        assert!(!a.contains(Attributes::HOLD_ALL));
        assert!((a | Attributes::HOLD_REST).contains(Attributes::HOLD_ALL));
    }

    #[test]
    fn test_hold_all_is_first_and_rest() {
        assert_eq!(
            Attributes::HOLD_ALL,
            Attributes::HOLD_FIRST | Attributes::HOLD_REST
        );
    }

    #[test]
    fn test_symbol_attribute_mutation() {
        let s = Symbol::new("f".to_string(), Attributes::NONE);
        assert!(s.attributes().is_empty());
        s.add_attributes(Attributes::ORDERLESS);
        assert!(s.attributes().contains(Attributes::ORDERLESS));
        s.set_attributes(Attributes::PROTECTED);
        assert!(s.is_protected());
        assert!(!s.attributes().contains(Attributes::ORDERLESS));
    }
}
