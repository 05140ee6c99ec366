//! Promise for a call served locally, with pipelined calls queued on it.
//!
//! An [`AnswerQueue`] starts unresolved. Pipelined calls aimed at
//! capabilities inside its future results are queued in arrival order and
//! replayed against the resolved results, or failed with the rejection
//! error, exactly once. Calls arriving while the replay is still running are
//! appended to the same queue so they cannot overtake earlier ones.

use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use capstan_core::{
    Answer, AnswerHook, CancellationToken, Error, Incoming, MethodId, Outgoing, PipelineCaller,
    PipelineHandle, PipelineOp, ReleaseFunc, Struct, deliver_resolved, noop_release,
};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::returner::ResolvingReturner;

struct Pending {
    ctx: CancellationToken,
    transform: Vec<PipelineOp>,
    call: Incoming,
}

#[derive(Default)]
struct State {
    outcome: Option<Result<Struct, Error>>,
    pending: VecDeque<Pending>,
    /// Set while queued calls are being replayed after resolution.
    draining: bool,
    /// Reset the results message once replay finishes.
    release_on_resolve: bool,
}

impl State {
    /// The outcome, if resolved and nothing is waiting to be replayed ahead
    /// of a new call.
    fn settled(&self) -> Option<Result<Struct, Error>> {
        if self.draining {
            return None;
        }
        self.outcome.clone()
    }
}

pub struct AnswerQueue {
    method: MethodId,
    state: Mutex<State>,
    resolved: Notify,
}

impl AnswerQueue {
    pub fn new(method: MethodId) -> Self {
        Self {
            method,
            state: Mutex::new(State::default()),
            resolved: Notify::new(),
        }
    }

    pub fn method(&self) -> MethodId {
        self.method
    }

    /// Resolve with `results` and replay queued pipelined calls against them.
    pub fn fulfill(&self, results: Struct) {
        self.resolve(Ok(results));
    }

    /// Resolve with `err` and fail every queued pipelined call with it.
    pub fn reject(&self, err: Error) {
        self.resolve(Err(err));
    }

    fn resolve(&self, outcome: Result<Struct, Error>) {
        {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                tracing::warn!(method = %self.method, "answer already resolved, ignoring");
                return;
            }
            state.outcome = Some(outcome.clone());
            state.draining = true;
        }
        self.resolved.notify_waiters();

        loop {
            let next = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        state.draining = false;
                        if state.release_on_resolve {
                            reset_results(&outcome);
                        }
                        return;
                    }
                }
            };
            // The queued call's own answer is resolved through its returner.
            // A panicking callee must not leave `draining` set, or every later
            // call would queue forever.
            let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| {
                let _ = deliver_resolved(&outcome, next.ctx, &next.transform, next.call);
            }));
            if delivered.is_err() {
                tracing::warn!(method = %self.method, "pipelined call panicked during replay");
            }
        }
    }

    /// The outcome, if resolved.
    pub fn peek(&self) -> Option<Result<Struct, Error>> {
        self.state.lock().outcome.clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.state.lock().outcome.is_some()
    }

    /// Wait for the outcome.
    pub async fn wait_results(&self) -> Result<Struct, Error> {
        loop {
            let resolved = self.resolved.notified();
            if let Some(outcome) = self.peek() {
                return outcome;
            }
            resolved.await;
        }
    }

    /// Number of pipelined calls waiting for resolution.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Give up interest in the results.
    ///
    /// The results message is reset as soon as the answer is fulfilled and
    /// queued pipelined calls have been replayed, or right away if that has
    /// already happened.
    pub fn release_results(&self) {
        let mut state = self.state.lock();
        let settled = state.settled();
        match settled {
            Some(outcome) => {
                drop(state);
                reset_results(&outcome);
            }
            None => state.release_on_resolve = true,
        }
    }

    /// A release function calling [`release_results`](Self::release_results).
    pub fn release_func(self: &Arc<Self>) -> ReleaseFunc {
        let answer = self.clone();
        Box::new(move || answer.release_results())
    }

    /// Queue `call` unless the outcome is settled, in which case the call is
    /// handed back for immediate delivery.
    fn enqueue(
        &self,
        ctx: CancellationToken,
        transform: &[PipelineOp],
        call: Incoming,
    ) -> Option<(Result<Struct, Error>, CancellationToken, Incoming)> {
        let mut state = self.state.lock();
        if let Some(outcome) = state.settled() {
            return Some((outcome, ctx, call));
        }
        tracing::trace!(method = %self.method, callee = %call.method, "queueing pipelined call");
        state.pending.push_back(Pending {
            ctx,
            transform: transform.to_vec(),
            call,
        });
        None
    }
}

impl PipelineCaller for AnswerQueue {
    fn pipeline_send(
        &self,
        ctx: CancellationToken,
        transform: &[PipelineOp],
        call: Outgoing,
    ) -> (Answer, ReleaseFunc) {
        let method = call.method;
        let args = match call.place() {
            Ok(args) => args,
            Err(err) => return (Answer::error(method, err), noop_release()),
        };
        let answer = Arc::new(AnswerQueue::new(method));
        let mut incoming = Incoming::new(
            method,
            args.clone(),
            Box::new(ResolvingReturner::new(answer.clone())),
        );
        incoming.release_args = Some(release_message(&args));

        if transform.is_empty() {
            incoming.reject(empty_path());
        } else if let Some((outcome, ctx, incoming)) = self.enqueue(ctx, transform, incoming) {
            let _ = deliver_resolved(&outcome, ctx, transform, incoming);
        }

        let release = answer.release_func();
        (Answer::from_hook(method, answer), release)
    }

    fn pipeline_recv(
        &self,
        ctx: CancellationToken,
        transform: &[PipelineOp],
        call: Incoming,
    ) -> Option<PipelineHandle> {
        if transform.is_empty() {
            call.reject(empty_path());
            return None;
        }

        let answer = Arc::new(AnswerQueue::new(call.method));
        let Incoming {
            method,
            args,
            release_args,
            returner,
        } = call;
        let call = Incoming {
            method,
            args,
            release_args,
            returner: Box::new(ResolvingReturner::chained(answer.clone(), returner)),
        };

        match self.enqueue(ctx, transform, call) {
            None => Some(answer as PipelineHandle),
            Some((outcome, ctx, call)) => {
                deliver_resolved(&outcome, ctx, transform, call).map(|_| answer as PipelineHandle)
            }
        }
    }
}

impl AnswerHook for AnswerQueue {
    fn wait(&self) -> BoxFuture<'_, Result<Struct, Error>> {
        Box::pin(self.wait_results())
    }

    fn peek(&self) -> Option<Result<Struct, Error>> {
        AnswerQueue::peek(self)
    }
}

impl fmt::Debug for AnswerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let status = match &state.outcome {
            None => "pending",
            Some(Ok(_)) => "fulfilled",
            Some(Err(_)) => "rejected",
        };
        f.debug_struct("AnswerQueue")
            .field("method", &self.method)
            .field("status", &status)
            .field("pending", &state.pending.len())
            .finish()
    }
}

fn empty_path() -> Error {
    Error::failed("empty pipeline path")
}

fn reset_results(outcome: &Result<Struct, Error>) {
    if let Ok(results) = outcome {
        if let Some(message) = results.message() {
            message.reset();
        }
    }
}

/// A release function that resets the message holding `s`.
pub(crate) fn release_message(s: &Struct) -> ReleaseFunc {
    match s.message() {
        Some(message) => {
            let message = message.clone();
            Box::new(move || message.reset())
        }
        None => noop_release(),
    }
}

#[cfg(test)]
mod tests {
    use capstan_core::{Client, ClientHook, Message, ObjectSize, Outgoing, Returner};

    use super::*;

    /// A capability recording the `x` argument of every call it receives.
    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<u64>>>,
    }

    impl ClientHook for Recorder {
        fn send(&self, _ctx: CancellationToken, call: Outgoing) -> (Answer, ReleaseFunc) {
            let method = call.method;
            match call.place() {
                Ok(args) => {
                    self.seen.lock().push(args.u64(0));
                    (Answer::ready(method, Struct::default()), noop_release())
                }
                Err(err) => (Answer::error(method, err), noop_release()),
            }
        }

        fn recv(&self, _ctx: CancellationToken, mut call: Incoming) -> Option<PipelineHandle> {
            self.seen.lock().push(call.args.u64(0));
            let results = call.returner.alloc_results(ObjectSize::new(8, 0));
            if let Ok(results) = &results {
                let _ = results.set_u64(0, call.args.u64(0) * 10);
            }
            call.release_args();
            call.returner.return_results(results.map(|_| ()));
            None
        }

        fn brand(&self) -> capstan_core::Brand {
            capstan_core::Brand::none()
        }

        fn shutdown(&self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    fn results_with(client: Client) -> Struct {
        let results = Message::new_root(ObjectSize::new(0, 1));
        results.set_capability(0, client).unwrap();
        results
    }

    fn sub_call(x: u64) -> Outgoing {
        Outgoing::new(MethodId::new(7, 0)).with_args(ObjectSize::new(8, 0), move |s| s.set_u64(0, x))
    }

    #[tokio::test]
    async fn queued_calls_replay_in_order_after_fulfill() {
        let answer = AnswerQueue::new(MethodId::new(1, 0));
        let recorder = Recorder::default();

        let subs: Vec<_> = (1..=3)
            .map(|x| answer.pipeline_send(CancellationToken::new(), &[PipelineOp::field(0)], sub_call(x)).0)
            .collect();
        assert_eq!(answer.pending_len(), 3);
        assert!(recorder.seen.lock().is_empty());

        answer.fulfill(results_with(Client::new(recorder.clone())));

        assert_eq!(*recorder.seen.lock(), vec![1, 2, 3]);
        assert_eq!(answer.pending_len(), 0);
        for (sub, x) in subs.iter().zip(1..=3u64) {
            assert_eq!(sub.results().await.unwrap().u64(0), x * 10);
        }
    }

    #[tokio::test]
    async fn calls_after_resolution_dispatch_immediately() {
        let answer = AnswerQueue::new(MethodId::new(1, 0));
        let recorder = Recorder::default();
        answer.fulfill(results_with(Client::new(recorder.clone())));

        let (sub, _release) =
            answer.pipeline_send(CancellationToken::new(), &[PipelineOp::field(0)], sub_call(4));
        assert_eq!(*recorder.seen.lock(), vec![4]);
        assert_eq!(sub.results().await.unwrap().u64(0), 40);
    }

    #[tokio::test]
    async fn reject_fails_queued_calls_with_same_error() {
        let answer = AnswerQueue::new(MethodId::new(1, 0));
        let (sub, _release) =
            answer.pipeline_send(CancellationToken::new(), &[PipelineOp::field(0)], sub_call(1));
        let (nested, _release) =
            sub.pipeline_send(CancellationToken::new(), &[PipelineOp::field(0)], sub_call(2));

        let cause = Error::disconnected("peer went away");
        answer.reject(cause.clone());

        assert_eq!(sub.results().await.unwrap_err(), cause);
        assert_eq!(nested.results().await.unwrap_err(), cause);
    }

    #[tokio::test]
    async fn second_resolution_is_ignored() {
        let answer = AnswerQueue::new(MethodId::new(1, 0));
        let results = Message::new_root(ObjectSize::new(8, 0));
        results.set_u64(0, 1).unwrap();
        answer.fulfill(results);
        answer.reject(Error::failed("late"));

        assert_eq!(answer.wait_results().await.unwrap().u64(0), 1);
    }

    #[tokio::test]
    async fn invalid_path_fails_once_resolved() {
        let answer = AnswerQueue::new(MethodId::new(1, 0));
        answer.fulfill(Message::new_root(ObjectSize::new(0, 1)));

        let (sub, _release) =
            answer.pipeline_send(CancellationToken::new(), &[PipelineOp::field(3)], sub_call(1));
        assert!(sub.results().await.unwrap_err().message().contains("out of bounds"));

        let (sub, _release) = answer.pipeline_send(CancellationToken::new(), &[], sub_call(1));
        assert_eq!(sub.results().await.unwrap_err().message(), "empty pipeline path");
    }

    #[tokio::test]
    async fn null_capability_fails_call() {
        let answer = AnswerQueue::new(MethodId::new(1, 0));
        let (sub, _release) =
            answer.pipeline_send(CancellationToken::new(), &[PipelineOp::field(0)], sub_call(1));
        answer.fulfill(Message::new_root(ObjectSize::new(0, 1)));

        assert_eq!(sub.results().await.unwrap_err().message(), "call on null client");
    }

    #[tokio::test]
    async fn waiters_see_resolution() {
        let answer = Arc::new(AnswerQueue::new(MethodId::new(1, 0)));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let answer = answer.clone();
                tokio::spawn(async move { answer.wait_results().await })
            })
            .collect();
        tokio::task::yield_now().await;
        answer.reject(Error::overloaded("busy"));

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap_err().message(), "busy");
        }
    }

    /// Panics on the call whose argument matches `bad`, records the rest.
    #[derive(Clone)]
    struct Flaky {
        bad: u64,
        inner: Recorder,
    }

    impl ClientHook for Flaky {
        fn send(&self, ctx: CancellationToken, call: Outgoing) -> (Answer, ReleaseFunc) {
            self.inner.send(ctx, call)
        }

        fn recv(&self, ctx: CancellationToken, call: Incoming) -> Option<PipelineHandle> {
            if call.args.u64(0) == self.bad {
                panic!("callee blew up on {}", self.bad);
            }
            self.inner.recv(ctx, call)
        }

        fn brand(&self) -> capstan_core::Brand {
            capstan_core::Brand::none()
        }

        fn shutdown(&self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn panicking_callee_does_not_stall_replay() {
        let answer = AnswerQueue::new(MethodId::new(1, 0));
        let recorder = Recorder::default();
        let flaky = Flaky {
            bad: 1,
            inner: recorder.clone(),
        };

        for x in 1..=3 {
            answer.pipeline_send(CancellationToken::new(), &[PipelineOp::field(0)], sub_call(x));
        }
        answer.fulfill(results_with(Client::new(flaky)));
        assert_eq!(*recorder.seen.lock(), vec![2, 3]);
        assert_eq!(answer.pending_len(), 0);

        // Replay finished, so new calls go straight through.
        let (sub, _release) =
            answer.pipeline_send(CancellationToken::new(), &[PipelineOp::field(0)], sub_call(4));
        assert_eq!(*recorder.seen.lock(), vec![2, 3, 4]);
        assert_eq!(sub.results().await.unwrap().u64(0), 40);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submitters_and_fulfill_deliver_each_call_once_in_order() {
        const SUBMITTERS: u64 = 4;
        const PER_SUBMITTER: u64 = 200;

        let answer = Arc::new(AnswerQueue::new(MethodId::new(1, 0)));
        let recorder = Recorder::default();

        let submitters: Vec<_> = (0..SUBMITTERS)
            .map(|p| {
                let answer = answer.clone();
                tokio::spawn(async move {
                    let mut subs = Vec::new();
                    for i in 0..PER_SUBMITTER {
                        let x = p * 1000 + i;
                        let (sub, _release) = answer.pipeline_send(
                            CancellationToken::new(),
                            &[PipelineOp::field(0)],
                            sub_call(x),
                        );
                        subs.push((x, sub));
                        if i % 16 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                    subs
                })
            })
            .collect();

        let fulfiller = {
            let answer = answer.clone();
            let recorder = recorder.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                answer.fulfill(results_with(Client::new(recorder)));
            })
        };

        let mut subs = Vec::new();
        for submitter in submitters {
            subs.extend(submitter.await.unwrap());
        }
        fulfiller.await.unwrap();

        let seen = recorder.seen.lock().clone();
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        let expected: Vec<u64> = (0..SUBMITTERS)
            .flat_map(|p| (0..PER_SUBMITTER).map(move |i| p * 1000 + i))
            .collect();
        assert_eq!(sorted, expected, "every call delivered exactly once");

        for p in 0..SUBMITTERS {
            let order: Vec<u64> = seen.iter().copied().filter(|x| x / 1000 == p).collect();
            assert!(
                order.windows(2).all(|w| w[0] < w[1]),
                "submitter {p} delivered out of order: {order:?}"
            );
        }

        assert_eq!(answer.pending_len(), 0);
        for (x, sub) in subs {
            assert_eq!(sub.results().await.unwrap().u64(0), x * 10);
        }
    }

    #[test]
    fn release_after_fulfill_resets_results() {
        let answer = AnswerQueue::new(MethodId::new(1, 0));
        let results = Message::new_root(ObjectSize::new(8, 0));
        results.set_u64(0, 9).unwrap();
        answer.fulfill(results.clone());

        answer.release_results();
        assert_eq!(results.u64(0), 0);
        assert!(results.set_u64(0, 1).is_err());
    }

    #[test]
    fn release_before_fulfill_waits_for_replay() {
        let answer = AnswerQueue::new(MethodId::new(1, 0));
        let recorder = Recorder::default();
        answer.pipeline_send(CancellationToken::new(), &[PipelineOp::field(0)], sub_call(5));
        answer.release_results();

        let results = results_with(Client::new(recorder.clone()));
        answer.fulfill(results.clone());

        assert_eq!(*recorder.seen.lock(), vec![5]);
        assert!(results.capability(0).is_null());
    }
}
