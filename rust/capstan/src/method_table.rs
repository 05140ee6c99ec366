//! Sorted method registry.
//!
//! The table is built once when a server is constructed and never mutated
//! afterwards, so lookups need no synchronization.

use std::fmt;
use std::sync::Arc;

use capstan_core::{CancellationToken, Error, MethodId};
use futures_util::future::BoxFuture;

use crate::{Call, ServerError};

/// Future returned by a method body.
pub type MethodFuture<'a> = BoxFuture<'a, Result<(), Error>>;

type MethodImpl =
    Arc<dyn for<'a> Fn(CancellationToken, &'a mut Call) -> MethodFuture<'a> + Send + Sync>;

/// A method identity bound to its implementation.
///
/// # Example
///
/// ```
/// use capstan::Method;
/// use capstan_core::{MethodId, ObjectSize};
///
/// let echo = Method::new(MethodId::new(0x1234, 0), |_ctx, call| {
///     Box::pin(async move {
///         let x = call.args().u64(0);
///         let results = call.alloc_results(ObjectSize::new(8, 0))?;
///         results.set_u64(0, x)
///     })
/// });
/// assert_eq!(echo.id().method_id, 0);
/// ```
#[derive(Clone)]
pub struct Method {
    id: MethodId,
    imp: MethodImpl,
}

impl Method {
    pub fn new<F>(id: MethodId, imp: F) -> Self
    where
        F: for<'a> Fn(CancellationToken, &'a mut Call) -> MethodFuture<'a> + Send + Sync + 'static,
    {
        Self {
            id,
            imp: Arc::new(imp),
        }
    }

    pub fn id(&self) -> &MethodId {
        &self.id
    }

    pub(crate) fn invoke<'a>(&self, ctx: CancellationToken, call: &'a mut Call) -> MethodFuture<'a> {
        (self.imp)(ctx, call)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Methods sorted by `(interface_id, method_id)`.
pub struct MethodTable {
    methods: Vec<Method>,
}

impl MethodTable {
    /// Build a table, rejecting duplicate identities.
    pub fn new(mut methods: Vec<Method>) -> Result<Self, ServerError> {
        methods.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(dup) = methods.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(ServerError::DuplicateMethod(dup[1].id));
        }
        Ok(Self { methods })
    }

    /// Binary search for `id`. Returns `None` if absent.
    pub fn find(&self, id: &MethodId) -> Option<&Method> {
        self.methods
            .binary_search_by(|m| m.id.cmp(id))
            .ok()
            .map(|i| &self.methods[i])
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Registered identities in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = &MethodId> + '_ {
        self.methods.iter().map(|m| &m.id)
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(id: MethodId) -> Method {
        Method::new(id, |_ctx, _call| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn table_new_sorts() {
        let table = MethodTable::new(vec![
            noop(MethodId::new(2, 0)),
            noop(MethodId::new(1, 7)),
            noop(MethodId::new(1, 3)),
        ])
        .unwrap();

        let keys: Vec<_> = table.ids().map(MethodId::key).collect();
        assert_eq!(keys, vec![(1, 3), (1, 7), (2, 0)]);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn table_find() {
        let table = MethodTable::new(vec![
            noop(MethodId::new(1, 0).named("Echo", "echo")),
            noop(MethodId::new(1, 1)),
            noop(MethodId::new(5, 0)),
        ])
        .unwrap();

        let found = table.find(&MethodId::new(1, 0)).unwrap();
        assert_eq!(found.id().method_name, "echo");
        assert!(table.find(&MethodId::new(5, 0)).is_some());
    }

    #[test]
    fn table_find_missing() {
        let table = MethodTable::new(vec![noop(MethodId::new(1, 0))]).unwrap();
        assert!(table.find(&MethodId::new(1, 1)).is_none());
        assert!(table.find(&MethodId::new(0, 0)).is_none());
        assert!(table.find(&MethodId::new(u64::MAX, u16::MAX)).is_none());
    }

    #[test]
    fn table_empty() {
        let table = MethodTable::new(Vec::new()).unwrap();
        assert!(table.is_empty());
        assert!(table.find(&MethodId::new(1, 0)).is_none());
    }

    #[test]
    fn table_duplicate_fails() {
        let result = MethodTable::new(vec![
            noop(MethodId::new(1, 0)),
            noop(MethodId::new(2, 0)),
            noop(MethodId::new(1, 0).named("Echo", "again")),
        ]);
        match result {
            Err(ServerError::DuplicateMethod(id)) => assert_eq!(id.key(), (1, 0)),
            other => panic!("expected duplicate error, got {:?}", other.map(|t| t.len())),
        }
    }

    #[test]
    fn table_many_methods() {
        let methods = (0..100u16).rev().map(|i| noop(MethodId::new(9, i))).collect();
        let table = MethodTable::new(methods).unwrap();
        for i in 0..100u16 {
            assert_eq!(table.find(&MethodId::new(9, i)).unwrap().id().method_id, i);
        }
    }
}
