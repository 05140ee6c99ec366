//! Returners used by the engine itself.

use std::sync::Arc;

use capstan_core::{Error, Message, ObjectSize, Returner, Struct};

use crate::AnswerQueue;

/// Allocates results in a fresh message and discards the outcome.
///
/// Used when the caller observes the call through an [`AnswerQueue`] that the
/// engine resolves directly.
pub(crate) struct DetachedReturner;

impl Returner for DetachedReturner {
    fn alloc_results(&mut self, size: ObjectSize) -> Result<Struct, Error> {
        Ok(Message::new_root(size))
    }

    fn return_results(self: Box<Self>, _result: Result<(), Error>) {}
}

/// Resolves an [`AnswerQueue`] with the call's outcome, then forwards the
/// outcome to the wrapped returner if there is one.
pub(crate) struct ResolvingReturner {
    answer: Arc<AnswerQueue>,
    inner: Option<Box<dyn Returner>>,
    results: Option<Struct>,
}

impl ResolvingReturner {
    /// Resolve `answer` only. Results live in a fresh message.
    pub(crate) fn new(answer: Arc<AnswerQueue>) -> Self {
        Self {
            answer,
            inner: None,
            results: None,
        }
    }

    /// Resolve `answer`, then notify `inner`, which also allocates results.
    pub(crate) fn chained(answer: Arc<AnswerQueue>, inner: Box<dyn Returner>) -> Self {
        Self {
            answer,
            inner: Some(inner),
            results: None,
        }
    }
}

impl Returner for ResolvingReturner {
    fn alloc_results(&mut self, size: ObjectSize) -> Result<Struct, Error> {
        let results = match &mut self.inner {
            Some(inner) => inner.alloc_results(size)?,
            None => Message::new_root(size),
        };
        self.results = Some(results.clone());
        Ok(results)
    }

    fn return_results(self: Box<Self>, result: Result<(), Error>) {
        let Self {
            answer,
            inner,
            results,
        } = *self;
        match &result {
            Ok(()) => answer.fulfill(results.unwrap_or_default()),
            Err(err) => answer.reject(err.clone()),
        }
        if let Some(inner) = inner {
            inner.return_results(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use capstan_core::MethodId;
    use parking_lot::Mutex;

    use super::*;

    struct Recording {
        outcome: Arc<Mutex<Vec<Result<(), Error>>>>,
    }

    impl Returner for Recording {
        fn alloc_results(&mut self, size: ObjectSize) -> Result<Struct, Error> {
            Ok(Message::new_root(size))
        }

        fn return_results(self: Box<Self>, result: Result<(), Error>) {
            self.outcome.lock().push(result);
        }
    }

    #[tokio::test]
    async fn resolving_fulfills_with_allocated_results() {
        let answer = Arc::new(AnswerQueue::new(MethodId::new(1, 0)));
        let mut returner = Box::new(ResolvingReturner::new(answer.clone()));
        let results = returner.alloc_results(ObjectSize::new(8, 0)).unwrap();
        results.set_u64(0, 42).unwrap();
        returner.return_results(Ok(()));

        assert_eq!(answer.wait_results().await.unwrap().u64(0), 42);
    }

    #[tokio::test]
    async fn chained_resolves_then_forwards() {
        let answer = Arc::new(AnswerQueue::new(MethodId::new(1, 0)));
        let outcome = Arc::new(Mutex::new(Vec::new()));
        let inner = Box::new(Recording {
            outcome: outcome.clone(),
        });
        let returner = Box::new(ResolvingReturner::chained(answer.clone(), inner));
        returner.return_results(Err(Error::overloaded("busy")));

        let err = answer.wait_results().await.unwrap_err();
        assert_eq!(err.message(), "busy");
        let outcome = outcome.lock();
        assert_eq!(outcome.len(), 1);
        assert_eq!(outcome[0].as_ref().unwrap_err(), &err);
    }

    #[test]
    fn detached_allocates_fresh_messages() {
        let mut returner = DetachedReturner;
        let a = returner.alloc_results(ObjectSize::new(8, 0)).unwrap();
        let b = returner.alloc_results(ObjectSize::new(8, 0)).unwrap();
        assert!(!a.message().unwrap().same_as(b.message().unwrap()));
    }
}
