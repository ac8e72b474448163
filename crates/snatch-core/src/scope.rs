use std::collections::BTreeMap;
use std::fmt;

/// Whether a namespace is subject to node-affinity injection.
///
/// Computed once per admission request and passed explicitly into
/// [`crate::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The namespace carries the opt-in label.
    InScope,
    /// The namespace lacks the label, or its labels could not be read.
    OutOfScope,
}

impl Scope {
    /// Derive the scope from a namespace label set.
    ///
    /// The namespace is in scope only when `key` is present with exactly
    /// `value`.
    #[must_use]
    pub fn from_labels(labels: &BTreeMap<String, String>, key: &str, value: &str) -> Self {
        match labels.get(key) {
            Some(v) if v == value => Self::InScope,
            _ => Self::OutOfScope,
        }
    }

    /// `true` for [`Scope::InScope`].
    #[must_use]
    pub fn is_in_scope(self) -> bool {
        matches!(self, Self::InScope)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InScope => f.write_str("in-scope"),
            Self::OutOfScope => f.write_str("out-of-scope"),
        }
    }
}
