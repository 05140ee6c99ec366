//! Opaque capability identity.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// An opaque value a capability hands out so that code in the same process
/// can recognize capabilities it implemented itself.
///
/// Brands compare by identity: two brands are the same only when they were
/// cloned from one another.
#[derive(Clone, Default)]
pub struct Brand {
    value: Option<Arc<dyn Any + Send + Sync>>,
}

impl Brand {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Some(Arc::new(value)),
        }
    }

    /// A brand carrying no value.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_none(&self) -> bool {
        self.value.is_none()
    }

    /// Borrow the branded value if it has type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.as_deref().and_then(|v| v.downcast_ref::<T>())
    }

    /// Identity comparison.
    pub fn same_as(&self, other: &Brand) -> bool {
        match (&self.value, &other.value) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Brand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "Brand({:p})", Arc::as_ptr(v)),
            None => f.write_str("Brand(none)"),
        }
    }
}
