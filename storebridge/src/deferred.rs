//! Deferred-result bridge
//!
//! Adapts a store call that takes a one-shot completion callback into a lazy
//! future resolving to exactly one value or one error.
//!
//! # Workflow
//!
//! 10. Consumer: build a [`Deferred`] around the store call (nothing runs yet)
//! 20. Consumer: first poll
//! 30. Bridge: create a oneshot channel, hand a [`Completion`] to the store call
//! 40. Store (any thread): invoke the completion once
//! 50. Bridge: forward the result through the channel and wake the consumer
//!
//! Dropping the future after step 30 suppresses delivery of the result, but
//! the store-side work keeps running: the store gives no way to cancel it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::FusedFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::StoreError;

type Outcome<T> = Result<T, StoreError>;

// ============================================================================
// Completion (store side)
// ============================================================================

enum SlotState<T> {
    Pending(oneshot::Sender<Outcome<T>>),
    Resolved,
}

/// Completion callback handed to the store.
///
/// Clones share one slot. Only the first resolution is forwarded to the
/// consumer; any later call is ignored. Dropping every clone without resolving
/// resolves the consumer's future to [`StoreError::abandoned`].
pub struct Completion<T> {
    slot: Arc<Mutex<SlotState<T>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Completion<T> {
    fn new(sender: oneshot::Sender<Outcome<T>>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(SlotState::Pending(sender))),
        }
    }

    /// Resolve from the store's `(payload, error?)` callback shape.
    ///
    /// The error wins when both are present. Neither present is reported as
    /// [`StoreError::missing_payload`].
    pub fn resolve(&self, payload: Option<T>, error: Option<StoreError>) {
        let outcome = match (payload, error) {
            (_, Some(error)) => Err(error),
            (Some(value), None) => Ok(value),
            (None, None) => Err(StoreError::missing_payload()),
        };
        self.complete(outcome);
    }

    pub fn succeed(&self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(&self, error: StoreError) {
        self.complete(Err(error));
    }

    /// Forward `outcome` to the consumer unless the slot is already resolved.
    pub fn complete(&self, outcome: Outcome<T>) {
        let sender = {
            let mut state = self.slot.lock();
            match std::mem::replace(&mut *state, SlotState::Resolved) {
                SlotState::Pending(sender) => sender,
                SlotState::Resolved => {
                    debug!(
                        is_error = outcome.is_err(),
                        "completion already resolved, ignoring repeated invocation"
                    );
                    return;
                }
            }
        };
        // Channel send happens outside the slot lock
        if sender.send(outcome).is_err() {
            trace!("deferred consumer withdrew before completion, result dropped");
        }
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(*self.slot.lock(), SlotState::Resolved)
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resolved = matches!(*self.slot.lock(), SlotState::Resolved);
        write!(f, "Completion(resolved={resolved})")
    }
}

// ============================================================================
// Deferred (consumer side)
// ============================================================================

type Invoke<T> = Box<dyn FnOnce(Completion<T>) + Send>;

enum DeferredState<T> {
    /// Not started: the store call has not been made
    Idle(Invoke<T>),
    /// Store call made, waiting for the completion
    Waiting(oneshot::Receiver<Outcome<T>>),
    Done,
}

/// A lazy, single-use future over a one-shot store callback.
///
/// The wrapped call runs on first poll, never earlier, so building a
/// `Deferred` that nobody awaits costs nothing.
#[must_use = "the store call runs only when the Deferred is polled"]
pub struct Deferred<T> {
    state: DeferredState<T>,
}

// No field is ever pinned structurally.
impl<T> Unpin for Deferred<T> {}

impl<T: Send + 'static> Deferred<T> {
    /// Wrap a store call. `invoke` receives the completion to pass to the store.
    pub fn new(invoke: impl FnOnce(Completion<T>) + Send + 'static) -> Self {
        Self {
            state: DeferredState::Idle(Box::new(invoke)),
        }
    }
}

impl<T: Send + 'static> Future for Deferred<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match std::mem::replace(&mut self.state, DeferredState::Done) {
                DeferredState::Idle(invoke) => {
                    let (tx, rx) = oneshot::channel();
                    self.state = DeferredState::Waiting(rx);
                    // The store may complete synchronously; the loop polls rx next
                    invoke(Completion::new(tx));
                }
                DeferredState::Waiting(mut rx) => match Pin::new(&mut rx).poll(cx) {
                    Poll::Pending => {
                        self.state = DeferredState::Waiting(rx);
                        return Poll::Pending;
                    }
                    Poll::Ready(Ok(outcome)) => return Poll::Ready(outcome),
                    Poll::Ready(Err(_)) => {
                        warn!("store dropped the completion without invoking it");
                        return Poll::Ready(Err(StoreError::abandoned()));
                    }
                },
                DeferredState::Done => panic!("Deferred polled after it resolved"),
            }
        }
    }
}

impl<T: Send + 'static> FusedFuture for Deferred<T> {
    fn is_terminated(&self) -> bool {
        matches!(self.state, DeferredState::Done)
    }
}

impl<T> Drop for Deferred<T> {
    fn drop(&mut self) {
        if matches!(self.state, DeferredState::Waiting(_)) {
            trace!("deferred dropped while waiting, store work continues unobserved");
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            DeferredState::Idle(_) => "idle",
            DeferredState::Waiting(_) => "waiting",
            DeferredState::Done => "done",
        };
        write!(f, "Deferred(state={state})")
    }
}
