//! The per-invocation handle a method body works through.
//!
//! A [`Call`] lives from dequeue to completion. Completion releases the
//! arguments, resolves the call's [`AnswerQueue`] and hands the outcome to the
//! caller's returner, in that order.

use std::fmt;
use std::sync::Arc;

use capstan_core::{CancellationToken, Error, Incoming, MethodId, ObjectSize, Struct};

use crate::error::server_error;
use crate::server::Shared;
use crate::{AnswerQueue, Method};

/// A call being served by a method body.
///
/// The body receives `&mut Call` and reads its arguments, allocates its
/// results, and may acknowledge it to let the server start the next call
/// while this one is still running.
pub struct Call {
    ctx: CancellationToken,
    method: Method,
    incoming: Incoming,
    answer: Arc<AnswerQueue>,
    server: Arc<Shared>,
    /// Set before asking the returner, so a failed allocation still counts.
    alloced: bool,
    results: Option<Struct>,
    acked: bool,
}

impl Call {
    pub(crate) fn new(
        ctx: CancellationToken,
        method: Method,
        incoming: Incoming,
        answer: Arc<AnswerQueue>,
        server: Arc<Shared>,
    ) -> Self {
        Self {
            ctx,
            method,
            incoming,
            answer,
            server,
            alloced: false,
            results: None,
            acked: false,
        }
    }

    /// The identity of the method being served.
    pub fn method(&self) -> &MethodId {
        self.method.id()
    }

    /// The call's arguments. They are released once the body returns.
    pub fn args(&self) -> &Struct {
        &self.incoming.args
    }

    /// Allocate the results struct. Only the first call reaches the returner;
    /// later calls fail, whether or not the first one succeeded, and leave any
    /// first allocation in place.
    pub fn alloc_results(&mut self, size: ObjectSize) -> Result<Struct, Error> {
        if self.alloced {
            return Err(server_error("multiple calls to alloc_results"));
        }
        self.alloced = true;
        let results = self.incoming.returner.alloc_results(size)?;
        self.results = Some(results.clone());
        Ok(results)
    }

    /// Let the server move on to the next queued call while this body keeps
    /// running. Later calls do nothing.
    ///
    /// A body that waits on another call to this same server without
    /// acknowledging first will never finish: the server does not start the
    /// next call until this one returns or acknowledges.
    pub fn ack(&mut self) {
        if self.acked {
            return;
        }
        self.acked = true;
        tracing::debug!(
            server = %self.server.name,
            method = %self.method.id(),
            "call acknowledged, handing off queue"
        );
        self.server.spawn_consumer();
    }

    pub fn is_acked(&self) -> bool {
        self.acked
    }

    pub(crate) fn ctx(&self) -> &CancellationToken {
        &self.ctx
    }

    pub(crate) fn method_impl(&self) -> Method {
        self.method.clone()
    }

    /// Release the arguments, resolve the answer and notify the returner.
    pub(crate) fn complete(self, result: Result<(), Error>) {
        let Call {
            mut incoming,
            answer,
            results,
            ..
        } = self;
        incoming.release_args();
        match &result {
            Ok(()) => answer.fulfill(results.unwrap_or_default()),
            Err(err) => answer.reject(err.clone()),
        }
        incoming.returner.return_results(result);
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("method", self.method.id())
            .field("acked", &self.acked)
            .field("results", &self.results.is_some())
            .finish_non_exhaustive()
    }
}
