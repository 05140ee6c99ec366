//! Local capability server.
//!
//! A [`Server`] turns a table of [`Method`]s into a capability. Every call is
//! pushed onto a queue and served by a single consumer task, one body at a
//! time and in arrival order. A body can [`ack`](crate::Call::ack) its call to
//! hand the queue to a new consumer task while it keeps running.

use std::borrow::Cow;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use capstan_core::{
    Answer, Brand, CancellationToken, ClientHook, Error, Incoming, Outgoing, PipelineHandle,
    ReleaseFunc, noop_release,
};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::answer_queue::release_message;
use crate::cancel;
use crate::error::server_error;
use crate::outstanding::Outstanding;
use crate::queue::CallQueue;
use crate::returner::DetachedReturner;
use crate::{AnswerQueue, Call, Method, MethodTable, ServerError};

/// Runs once, after a server has stopped and every call has completed.
pub trait Shutdowner: Send + Sync {
    fn shutdown(&self);
}

impl<F> Shutdowner for F
where
    F: Fn() + Send + Sync,
{
    fn shutdown(&self) {
        self()
    }
}

/// The brand every [`Server`] carries. Holds the brand supplied at
/// construction.
struct ServerBrand {
    value: Brand,
}

/// If `brand` belongs to a [`Server`], return the brand it was built with.
pub fn is_server(brand: &Brand) -> Option<Brand> {
    brand
        .downcast_ref::<ServerBrand>()
        .map(|server| server.value.clone())
}

/// Settings for a [`Server`].
pub struct ServerBuilder {
    name: Cow<'static, str>,
    methods: Vec<Method>,
    brand: Brand,
    shutdown: Option<Box<dyn Shutdowner>>,
    runtime: Option<Handle>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            name: Cow::Borrowed("capstan"),
            methods: Vec::new(),
            brand: Brand::none(),
            shutdown: None,
            runtime: None,
        }
    }

    /// Name used in log output.
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods.extend(methods);
        self
    }

    /// Value recovered by [`is_server`] from the server's brand.
    pub fn brand(mut self, brand: Brand) -> Self {
        self.brand = brand;
        self
    }

    /// Hook run once by [`Server::shutdown`].
    pub fn shutdown(mut self, hook: impl Shutdowner + 'static) -> Self {
        self.shutdown = Some(Box::new(hook));
        self
    }

    /// Runtime hosting the dispatch tasks. Defaults to the current runtime.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Build the server and start its dispatch task.
    pub fn build(self) -> Result<Server, ServerError> {
        let handle = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| ServerError::NoRuntime)?,
        };
        let methods = MethodTable::new(self.methods)?;

        let shared = Arc::new(Shared {
            name: self.name,
            methods,
            brand: Brand::new(ServerBrand { value: self.brand }),
            queue: CallQueue::new(),
            lifetime: CancellationToken::new(),
            outstanding: Outstanding::default(),
            consumer_active: AtomicBool::new(true),
            shutdown: Mutex::new(self.shutdown),
            handle,
        });
        tracing::debug!(
            server = %shared.name,
            methods = shared.methods.len(),
            "server started"
        );
        shared.handle.spawn(shared.clone().handle_calls());

        Ok(Server { shared })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared between a [`Server`], its consumer tasks and its queued calls.
pub(crate) struct Shared {
    pub(crate) name: Cow<'static, str>,
    methods: MethodTable,
    brand: Brand,
    queue: CallQueue<Call>,
    /// Fires when the server shuts down or is dropped.
    lifetime: CancellationToken,
    outstanding: Outstanding,
    /// Whether some task currently owns the consumer side of `queue`.
    consumer_active: AtomicBool,
    shutdown: Mutex<Option<Box<dyn Shutdowner>>>,
    handle: Handle,
}

impl Shared {
    /// Start a new consumer. The caller must be giving up the consumer role.
    pub(crate) fn spawn_consumer(self: &Arc<Self>) {
        self.handle.spawn(self.clone().handle_calls());
    }

    fn start(self: &Arc<Self>, ctx: CancellationToken, method: Method, call: Incoming) -> Arc<AnswerQueue> {
        self.outstanding.add();
        let answer = Arc::new(AnswerQueue::new(*method.id()));
        tracing::trace!(
            server = %self.name,
            interface_id = method.id().interface_id,
            method_id = method.id().method_id,
            "enqueue call"
        );
        self.queue
            .send(Call::new(ctx, method, call, answer.clone(), self.clone()));

        // A call that lands after the last consumer finished draining would
        // otherwise never run.
        if self.lifetime.is_cancelled()
            && self
                .consumer_active
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            tracing::debug!(server = %self.name, "call arrived after shutdown, draining");
            self.handle.spawn(self.clone().drain());
        }
        answer
    }

    async fn handle_calls(self: Arc<Self>) {
        while let Some(call) = self.queue.recv(&self.lifetime).await {
            if self.handle_call(call).await {
                return;
            }
        }
        tracing::debug!(
            server = %self.name,
            queued = self.queue.len(),
            "server stopping, draining queued calls"
        );
        self.drain().await
    }

    /// Serve whatever is queued, then give up the consumer role.
    async fn drain(self: Arc<Self>) {
        loop {
            while let Some(call) = self.queue.try_recv() {
                if self.handle_call(call).await {
                    return;
                }
            }
            self.consumer_active.store(false, Ordering::SeqCst);
            // Reclaim the role if a call slipped in before the flag was cleared.
            if self.queue.is_empty() || self.consumer_active.swap(true, Ordering::SeqCst) {
                return;
            }
        }
    }

    /// Run one call to completion. Returns whether it was acknowledged, in
    /// which case another task now owns the queue.
    async fn handle_call(&self, mut call: Call) -> bool {
        let method = call.method_impl();
        let id = *method.id();
        tracing::trace!(
            server = %self.name,
            interface_id = id.interface_id,
            method_id = id.method_id,
            "dispatch call"
        );

        let ctx = cancel::merged(&self.handle, call.ctx(), &self.lifetime);
        let token = ctx.token().clone();
        let result = match AssertUnwindSafe(method.invoke(token.clone(), &mut call))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(server = %self.name, method = %id, "method body panicked");
                Err(server_error(format!("method {} panicked", id)))
            }
        };
        let canceled = token.is_cancelled();
        drop(ctx);

        if let Err(err) = &result {
            if canceled {
                tracing::debug!(server = %self.name, method = %id, error = %err, "call failed after cancellation");
            } else {
                tracing::warn!(server = %self.name, method = %id, error = %err, "call failed");
            }
        }

        // Completion runs returner and pipeline code this server does not
        // control. A panic there must not cost the queue its consumer.
        let acked = call.is_acked();
        if std::panic::catch_unwind(AssertUnwindSafe(|| call.complete(result))).is_err() {
            tracing::warn!(server = %self.name, method = %id, "completing call panicked");
        }
        self.outstanding.done();
        acked
    }
}

/// A capability implemented in this process.
///
/// Dropping the server stops it like [`shutdown`](Server::shutdown) does,
/// without waiting and without running the shutdown hook.
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    /// Build a server with default settings and start its dispatch task on
    /// the current Tokio runtime.
    pub fn new(
        methods: Vec<Method>,
        brand: Brand,
        shutdown: Option<Box<dyn Shutdowner>>,
    ) -> Result<Self, ServerError> {
        let mut builder = ServerBuilder::new().methods(methods).brand(brand);
        builder.shutdown = shutdown;
        builder.build()
    }

    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn methods(&self) -> &MethodTable {
        &self.shared.methods
    }

    /// Start a call whose arguments are built by `call.place_args`.
    ///
    /// Returns immediately. The answer doubles as the pipelining handle; the
    /// release function resets the results once the caller is done with them.
    pub fn send(&self, ctx: CancellationToken, call: Outgoing) -> (Answer, ReleaseFunc) {
        let Some(method) = self.shared.methods.find(&call.method).cloned() else {
            return (Answer::error(call.method, unimplemented()), noop_release());
        };
        let id = *method.id();
        let args = match call.place() {
            Ok(args) => args,
            Err(err) => return (Answer::error(id, err), noop_release()),
        };
        let mut incoming = Incoming::new(id, args.clone(), Box::new(DetachedReturner));
        incoming.release_args = Some(release_message(&args));

        let answer = self.shared.start(ctx, method, incoming);
        let release = answer.release_func();
        (Answer::from_hook(id, answer), release)
    }

    /// Start a call with already-built arguments. The outcome goes to
    /// `call.returner`.
    pub fn recv(&self, ctx: CancellationToken, call: Incoming) -> Option<PipelineHandle> {
        let Some(method) = self.shared.methods.find(&call.method).cloned() else {
            call.reject(unimplemented());
            return None;
        };
        let answer: PipelineHandle = self.shared.start(ctx, method, call);
        Some(answer)
    }

    pub fn brand(&self) -> Brand {
        self.shared.brand.clone()
    }

    /// Stop accepting new work, wait for every started call to complete,
    /// then run the shutdown hook.
    ///
    /// Queued calls still run, with an already canceled context. Calling this
    /// more than once is fine; the hook only runs the first time.
    pub async fn shutdown(&self) {
        self.shared.lifetime.cancel();
        self.shared.outstanding.wait_zero().await;
        let hook = self.shared.shutdown.lock().take();
        if let Some(hook) = hook {
            hook.shutdown();
        }
        tracing::debug!(server = %self.shared.name, "server shut down");
    }

    /// Calls waiting to be served.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Calls started but not yet completed.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.get()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.lifetime.cancel();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.shared.name)
            .field("methods", &self.shared.methods)
            .field("queued", &self.queue_len())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl ClientHook for Server {
    fn send(&self, ctx: CancellationToken, call: Outgoing) -> (Answer, ReleaseFunc) {
        Server::send(self, ctx, call)
    }

    fn recv(&self, ctx: CancellationToken, call: Incoming) -> Option<PipelineHandle> {
        Server::recv(self, ctx, call)
    }

    fn brand(&self) -> Brand {
        Server::brand(self)
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(Server::shutdown(self))
    }
}

fn unimplemented() -> Error {
    Error::unimplemented("unimplemented")
}
