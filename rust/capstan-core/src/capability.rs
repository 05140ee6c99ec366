//! Capability hooks and call contracts.
//!
//! A [`Client`] is a reference to something callable. The object behind it
//! implements [`ClientHook`]; locally implemented servers, pipelined promises
//! and (outside this workspace) remote imports all plug in here.
//!
//! Calls arrive in two shapes:
//!
//! - [`Outgoing`]: the caller has not built arguments yet and supplies a
//!   placement callback. The callee allocates an isolated argument struct and
//!   lets the callback fill it.
//! - [`Incoming`]: arguments already exist (for example, received off a wire)
//!   and the caller supplies a [`Returner`] through which the outcome is
//!   delivered.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::{Answer, Brand, Error, Message, MethodId, ObjectSize, Ptr, Struct};

/// Releases a resource handed out by a call. Calling it is optional.
pub type ReleaseFunc = Box<dyn FnOnce() + Send>;

/// A release function that does nothing.
pub fn noop_release() -> ReleaseFunc {
    Box::new(|| {})
}

/// Fills a freshly allocated argument struct.
pub type PlaceArgs = Box<dyn FnOnce(&Struct) -> Result<(), Error> + Send>;

/// One step of a pipeline path: follow pointer field `field`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineOp {
    pub field: u16,
}

impl PipelineOp {
    pub const fn field(field: u16) -> Self {
        Self { field }
    }
}

/// A call whose arguments have not been built yet.
pub struct Outgoing {
    pub method: MethodId,
    pub args_size: ObjectSize,
    pub place_args: Option<PlaceArgs>,
}

impl Outgoing {
    pub fn new(method: MethodId) -> Self {
        Self {
            method,
            args_size: ObjectSize::default(),
            place_args: None,
        }
    }

    /// Set the argument size and placement callback.
    pub fn with_args<F>(mut self, size: ObjectSize, place: F) -> Self
    where
        F: FnOnce(&Struct) -> Result<(), Error> + Send + 'static,
    {
        self.args_size = size;
        self.place_args = Some(Box::new(place));
        self
    }

    /// Allocate the argument struct in a fresh message and run the placement
    /// callback into it.
    ///
    /// Without a callback the arguments are the empty struct. When the callback
    /// fails the message is reset and a [`Failed`](crate::ErrorKind::Failed)
    /// error wrapping the cause is returned.
    pub fn place(self) -> Result<Struct, Error> {
        let Some(place) = self.place_args else {
            return Ok(Struct::default());
        };
        let args = Message::new_root(self.args_size);
        if let Err(err) = place(&args) {
            if let Some(msg) = args.message() {
                msg.reset();
            }
            return Err(Error::failed(format!("place args: {}", err)));
        }
        Ok(args)
    }
}

impl fmt::Debug for Outgoing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outgoing")
            .field("method", &self.method)
            .field("args_size", &self.args_size)
            .field("place_args", &self.place_args.is_some())
            .finish()
    }
}

/// The party that initiated a call and wants its outcome.
///
/// `return_results` consumes the returner, so the outcome is delivered at
/// most once by construction.
pub trait Returner: Send {
    /// Allocate the results struct for the call.
    fn alloc_results(&mut self, size: ObjectSize) -> Result<Struct, Error>;

    /// Deliver the outcome. On `Ok`, the results are whatever
    /// `alloc_results` returned (or nothing if it was never called).
    fn return_results(self: Box<Self>, result: Result<(), Error>);
}

/// A call whose arguments are already materialized.
pub struct Incoming {
    pub method: MethodId,
    pub args: Struct,
    pub release_args: Option<ReleaseFunc>,
    pub returner: Box<dyn Returner>,
}

impl Incoming {
    pub fn new(method: MethodId, args: Struct, returner: Box<dyn Returner>) -> Self {
        Self {
            method,
            args,
            release_args: None,
            returner,
        }
    }

    /// Release the arguments. Later calls do nothing.
    pub fn release_args(&mut self) {
        if let Some(release) = self.release_args.take() {
            release();
        }
        self.args = Struct::default();
    }

    /// Release the arguments and fail the call through its returner.
    pub fn reject(mut self, err: Error) {
        self.release_args();
        self.returner.return_results(Err(err));
    }
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming")
            .field("method", &self.method)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

/// Accepts calls aimed at a capability that will appear inside a result.
pub trait PipelineCaller: Send + Sync {
    /// Start a call on the capability found by walking `transform` into the
    /// eventual results.
    fn pipeline_send(
        &self,
        ctx: CancellationToken,
        transform: &[PipelineOp],
        call: Outgoing,
    ) -> (Answer, ReleaseFunc);

    /// Like [`pipeline_send`](Self::pipeline_send) for already-built calls.
    /// Returns a handle for pipelining on the new call's own result, or
    /// `None` when the call was rejected on the spot.
    fn pipeline_recv(
        &self,
        ctx: CancellationToken,
        transform: &[PipelineOp],
        call: Incoming,
    ) -> Option<PipelineHandle>;
}

/// Shared handle to a [`PipelineCaller`].
pub type PipelineHandle = Arc<dyn PipelineCaller>;

/// The object behind a [`Client`].
pub trait ClientHook: Send + Sync {
    /// Start a call. Never blocks on the call's completion.
    fn send(&self, ctx: CancellationToken, call: Outgoing) -> (Answer, ReleaseFunc);

    /// Start a call with already-built arguments.
    fn recv(&self, ctx: CancellationToken, call: Incoming) -> Option<PipelineHandle>;

    /// Identity of the object behind this hook.
    fn brand(&self) -> Brand;

    /// Stop the object once outstanding work finishes.
    fn shutdown(&self) -> BoxFuture<'_, ()>;
}

/// A reference to a capability. The default client is null: every call on it
/// fails.
#[derive(Clone, Default)]
pub struct Client {
    hook: Option<Arc<dyn ClientHook>>,
}

impl Client {
    pub fn new(hook: impl ClientHook + 'static) -> Self {
        Self {
            hook: Some(Arc::new(hook)),
        }
    }

    pub fn from_arc(hook: Arc<dyn ClientHook>) -> Self {
        Self { hook: Some(hook) }
    }

    pub fn null() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        self.hook.is_none()
    }

    /// Whether both clients refer to the same hook object.
    pub fn same_hook(&self, other: &Client) -> bool {
        match (&self.hook, &other.hook) {
            (Some(a), Some(b)) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            _ => false,
        }
    }

    pub fn send(&self, ctx: CancellationToken, call: Outgoing) -> (Answer, ReleaseFunc) {
        match &self.hook {
            Some(hook) => hook.send(ctx, call),
            None => (Answer::error(call.method, null_client_error()), noop_release()),
        }
    }

    pub fn recv(&self, ctx: CancellationToken, call: Incoming) -> Option<PipelineHandle> {
        match &self.hook {
            Some(hook) => hook.recv(ctx, call),
            None => {
                call.reject(null_client_error());
                None
            }
        }
    }

    pub fn brand(&self) -> Brand {
        match &self.hook {
            Some(hook) => hook.brand(),
            None => Brand::none(),
        }
    }

    pub async fn shutdown(&self) {
        if let Some(hook) = &self.hook {
            hook.shutdown().await;
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hook {
            Some(hook) => write!(f, "Client({:p})", Arc::as_ptr(hook)),
            None => f.write_str("Client(null)"),
        }
    }
}

fn null_client_error() -> Error {
    Error::failed("call on null client")
}

/// Walk `transform` from `results` and return the capability it names.
///
/// Every op selects a pointer field. Intermediate fields must hold structs;
/// the final field must hold a capability. A null pointer anywhere along the
/// path yields a null client. An empty path, a field index past the end of
/// the struct being walked, or a struct where a capability is expected is a
/// structural error.
pub fn transform_client(results: &Struct, transform: &[PipelineOp]) -> Result<Client, Error> {
    let Some((last, path)) = transform.split_last() else {
        return Err(Error::failed("empty pipeline path"));
    };
    let mut current = results.clone();
    for op in path {
        check_field(&current, *op)?;
        match current.ptr(op.field) {
            Ptr::Struct(next) => current = next,
            Ptr::Null => return Ok(Client::null()),
            Ptr::Capability(_) => {
                return Err(Error::failed(format!(
                    "pipeline path: field {} holds a capability, not a struct",
                    op.field
                )));
            }
        }
    }
    check_field(&current, *last)?;
    match current.ptr(last.field) {
        Ptr::Capability(client) => Ok(client),
        Ptr::Null => Ok(Client::null()),
        Ptr::Struct(_) => Err(Error::failed(format!(
            "pipeline path: field {} holds a struct, not a capability",
            last.field
        ))),
    }
}

fn check_field(s: &Struct, op: PipelineOp) -> Result<(), Error> {
    let count = s.pointer_count();
    if op.field >= count {
        return Err(Error::failed(format!(
            "pipeline path: field {} out of bounds (struct has {} pointers)",
            op.field, count
        )));
    }
    Ok(())
}

/// Deliver `call` according to an already-known outcome.
///
/// On success the call goes to the capability named by `transform`; on
/// failure the call is rejected with a clone of the original error.
pub fn deliver_resolved(
    outcome: &Result<Struct, Error>,
    ctx: CancellationToken,
    transform: &[PipelineOp],
    call: Incoming,
) -> Option<PipelineHandle> {
    match outcome {
        Ok(results) => match transform_client(results, transform) {
            Ok(client) => client.recv(ctx, call),
            Err(err) => {
                call.reject(err);
                None
            }
        },
        Err(err) => {
            call.reject(err.clone());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorded {
        outcome: Mutex<Option<Result<(), Error>>>,
    }

    struct RecordingReturner(Arc<Recorded>);

    impl Returner for RecordingReturner {
        fn alloc_results(&mut self, size: ObjectSize) -> Result<Struct, Error> {
            Ok(Message::new_root(size))
        }

        fn return_results(self: Box<Self>, result: Result<(), Error>) {
            *self.0.outcome.lock() = Some(result);
        }
    }

    fn incoming(record: &Arc<Recorded>) -> Incoming {
        Incoming::new(
            MethodId::new(1, 0),
            Struct::default(),
            Box::new(RecordingReturner(record.clone())),
        )
    }

    #[test]
    fn place_without_callback_is_empty() {
        let args = Outgoing::new(MethodId::new(1, 0)).place().unwrap();
        assert!(!args.is_valid());
    }

    #[test]
    fn place_runs_callback_into_fresh_message() {
        let args = Outgoing::new(MethodId::new(1, 0))
            .with_args(ObjectSize::new(8, 0), |s| s.set_u64(0, 5))
            .place()
            .unwrap();
        assert_eq!(args.u64(0), 5);
    }

    #[test]
    fn place_failure_is_wrapped() {
        let err = Outgoing::new(MethodId::new(1, 0))
            .with_args(ObjectSize::new(8, 0), |_| Err(Error::disconnected("gone")))
            .place()
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Failed);
        assert_eq!(err.to_string(), "place args: gone");
    }

    #[test]
    fn null_client_rejects() {
        let record = Arc::new(Recorded::default());
        assert!(Client::null().recv(CancellationToken::new(), incoming(&record)).is_none());
        let outcome = record.outcome.lock().take().unwrap();
        assert_eq!(outcome.unwrap_err().message(), "call on null client");
    }

    #[test]
    fn transform_rejects_empty_and_out_of_bounds_paths() {
        let results = Message::new_root(ObjectSize::new(0, 1));
        assert!(transform_client(&results, &[]).is_err());
        let err = transform_client(&results, &[PipelineOp::field(1)]).unwrap_err();
        assert!(err.message().contains("out of bounds"));
    }

    #[test]
    fn transform_null_pointer_is_null_client() {
        let results = Message::new_root(ObjectSize::new(0, 2));
        let client = transform_client(&results, &[PipelineOp::field(1)]).unwrap();
        assert!(client.is_null());
    }

    #[test]
    fn transform_struct_where_capability_expected() {
        let results = Message::new_root(ObjectSize::new(0, 1));
        results.new_struct(0, ObjectSize::new(0, 1)).unwrap();
        let err = transform_client(&results, &[PipelineOp::field(0)]).unwrap_err();
        assert!(err.message().contains("not a capability"));
    }

    #[test]
    fn deliver_rejected_outcome_propagates_original_error() {
        let record = Arc::new(Recorded::default());
        let cause = Error::disconnected("peer went away");
        let handle = deliver_resolved(
            &Err(cause.clone()),
            CancellationToken::new(),
            &[PipelineOp::field(0)],
            incoming(&record),
        );
        assert!(handle.is_none());
        assert_eq!(record.outcome.lock().take().unwrap().unwrap_err(), cause);
    }
}
