//! Method identities.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of a single interface method.
///
/// Two identities are equal when their interface and method ordinals match.
/// The names are diagnostic only and do not take part in comparisons.
#[derive(Clone, Copy)]
pub struct MethodId {
    pub interface_id: u64,
    pub method_id: u16,
    pub interface_name: &'static str,
    pub method_name: &'static str,
}

impl MethodId {
    /// An anonymous identity.
    pub const fn new(interface_id: u64, method_id: u16) -> Self {
        Self {
            interface_id,
            method_id,
            interface_name: "",
            method_name: "",
        }
    }

    /// Attach diagnostic names.
    pub const fn named(self, interface_name: &'static str, method_name: &'static str) -> Self {
        Self {
            interface_name,
            method_name,
            ..self
        }
    }

    /// The `(interface_id, method_id)` pair used for ordering and lookup.
    pub fn key(&self) -> (u64, u16) {
        (self.interface_id, self.method_id)
    }
}

impl PartialEq for MethodId {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for MethodId {}

impl Hash for MethodId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for MethodId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MethodId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.interface_name.is_empty() {
            write!(f, "@{:#018x}", self.interface_id)?;
        } else {
            f.write_str(self.interface_name)?;
        }
        if self.method_name.is_empty() {
            write!(f, ".@{}", self.method_id)
        } else {
            write!(f, ".{}", self.method_name)
        }
    }
}

impl fmt::Debug for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodId({}, {:#x}:{})", self, self.interface_id, self.method_id)
    }
}
