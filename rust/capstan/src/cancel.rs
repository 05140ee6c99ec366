//! Cancellation combinators.

use tokio::runtime::Handle;
use tokio_util::sync::{CancellationToken, DropGuard};

/// A token canceled when either of two parents is.
///
/// Dropping the context cancels the token, which also stops the task that
/// watches the second parent.
pub struct MergedContext {
    token: CancellationToken,
    _guard: DropGuard,
}

impl MergedContext {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Derive a token that fires when `primary` or `secondary` fires.
///
/// The token is a child of `primary`. `secondary` is watched by a task
/// spawned on `handle` unless it has already fired, in which case the token
/// starts out canceled.
pub fn merged(
    handle: &Handle,
    primary: &CancellationToken,
    secondary: &CancellationToken,
) -> MergedContext {
    let token = primary.child_token();
    if secondary.is_cancelled() {
        token.cancel();
    } else if !token.is_cancelled() {
        let watched = token.clone();
        let secondary = secondary.clone();
        handle.spawn(async move {
            tokio::select! {
                _ = secondary.cancelled() => watched.cancel(),
                _ = watched.cancelled() => {}
            }
        });
    }
    MergedContext {
        _guard: token.clone().drop_guard(),
        token,
    }
}
