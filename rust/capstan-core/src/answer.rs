//! The eventual result of a call.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::{
    Brand, Client, ClientHook, Error, Incoming, MethodId, Outgoing, PipelineCaller,
    PipelineHandle, PipelineOp, ReleaseFunc, Struct, deliver_resolved, noop_release,
    transform_client,
};

/// A promise implementation that an [`Answer`] can wrap.
pub trait AnswerHook: PipelineCaller {
    /// Wait for the outcome.
    fn wait(&self) -> BoxFuture<'_, Result<Struct, Error>>;

    /// The outcome, if already known.
    fn peek(&self) -> Option<Result<Struct, Error>>;
}

#[derive(Clone)]
enum Inner {
    Resolved(Result<Struct, Error>),
    Pending(Arc<dyn AnswerHook>),
}

/// The result of a call, returned as soon as the call starts.
///
/// An answer doubles as a pipelining handle: calls can be aimed at
/// capabilities inside the eventual results before they exist.
#[derive(Clone)]
pub struct Answer {
    method: MethodId,
    inner: Inner,
}

impl Answer {
    /// An answer that has already failed.
    pub fn error(method: MethodId, err: Error) -> Self {
        Self {
            method,
            inner: Inner::Resolved(Err(err)),
        }
    }

    /// An answer that has already succeeded.
    pub fn ready(method: MethodId, results: Struct) -> Self {
        Self {
            method,
            inner: Inner::Resolved(Ok(results)),
        }
    }

    pub fn from_hook(method: MethodId, hook: Arc<dyn AnswerHook>) -> Self {
        Self {
            method,
            inner: Inner::Pending(hook),
        }
    }

    /// The method this answer belongs to.
    pub fn method(&self) -> MethodId {
        self.method
    }

    /// Wait for the results.
    pub async fn results(&self) -> Result<Struct, Error> {
        match &self.inner {
            Inner::Resolved(outcome) => outcome.clone(),
            Inner::Pending(hook) => hook.wait().await,
        }
    }

    /// The results, if already known.
    pub fn try_results(&self) -> Option<Result<Struct, Error>> {
        match &self.inner {
            Inner::Resolved(outcome) => Some(outcome.clone()),
            Inner::Pending(hook) => hook.peek(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.try_results().is_some()
    }

    /// A client for the capability at `transform` inside the eventual results.
    pub fn pipeline_client(&self, transform: impl Into<Vec<PipelineOp>>) -> Client {
        Client::new(PipelineClient {
            answer: self.clone(),
            transform: transform.into(),
        })
    }
}

impl PipelineCaller for Answer {
    fn pipeline_send(
        &self,
        ctx: CancellationToken,
        transform: &[PipelineOp],
        call: Outgoing,
    ) -> (Answer, ReleaseFunc) {
        match &self.inner {
            Inner::Pending(hook) => hook.pipeline_send(ctx, transform, call),
            Inner::Resolved(Err(err)) => (Answer::error(call.method, err.clone()), noop_release()),
            Inner::Resolved(Ok(results)) => match transform_client(results, transform) {
                Ok(client) => client.send(ctx, call),
                Err(err) => (Answer::error(call.method, err), noop_release()),
            },
        }
    }

    fn pipeline_recv(
        &self,
        ctx: CancellationToken,
        transform: &[PipelineOp],
        call: Incoming,
    ) -> Option<PipelineHandle> {
        match &self.inner {
            Inner::Pending(hook) => hook.pipeline_recv(ctx, transform, call),
            Inner::Resolved(outcome) => deliver_resolved(outcome, ctx, transform, call),
        }
    }
}

impl fmt::Debug for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.try_results() {
            None => "pending",
            Some(Ok(_)) => "fulfilled",
            Some(Err(_)) => "rejected",
        };
        f.debug_struct("Answer")
            .field("method", &self.method)
            .field("state", &state)
            .finish()
    }
}

/// A capability that forwards every call into an answer's pipeline.
struct PipelineClient {
    answer: Answer,
    transform: Vec<PipelineOp>,
}

impl ClientHook for PipelineClient {
    fn send(&self, ctx: CancellationToken, call: Outgoing) -> (Answer, ReleaseFunc) {
        self.answer.pipeline_send(ctx, &self.transform, call)
    }

    fn recv(&self, ctx: CancellationToken, call: Incoming) -> Option<PipelineHandle> {
        self.answer.pipeline_recv(ctx, &self.transform, call)
    }

    fn brand(&self) -> Brand {
        match self.answer.try_results() {
            Some(Ok(results)) => transform_client(&results, &self.transform)
                .map(|client| client.brand())
                .unwrap_or_default(),
            _ => Brand::none(),
        }
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}
