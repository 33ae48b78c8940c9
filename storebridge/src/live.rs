//! Live-query bridge
//!
//! Adapts a store query object (construct, submit, stop) into a cancellable
//! [`Stream`] of result batches.
//!
//! # Lifecycle
//!
//! ```text
//!   Idle ──first poll──▶ Live(teardown) ──terminal emission──▶ Stopped
//!    │                      │
//!    │                      └──────────stream dropped─────────▶ Stopped
//!    └────────────────────stream dropped (no stop call)───────▶ Stopped
//! ```
//!
//! The state tag and the teardown (query handle plus the store's stop
//! function) live behind one `parking_lot::Mutex`. Whoever moves the state out
//! of `Live` owns the teardown and runs it, so the handle is stopped at most
//! once. Handlers check the tag under the same lock before forwarding an
//! emission: an invocation racing with a drop is either delivered before the
//! drop or discarded after it, never both.
//!
//! The lock is never held while calling the store's submit or stop.
//!
//! A store that releases every handler without a terminal emission fails the
//! stream with [`StoreError::abandoned`], and the handle is stopped then.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{FusedStream, Stream};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::StoreError;

type Outcome<T> = Result<T, StoreError>;

/// Whether a query completes after its first result or keeps reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryMode {
    /// Emit the first result, complete, stop the handle
    SingleShot,
    /// Emit every result; only an error or the consumer ends the stream
    Monitoring,
}

impl QueryMode {
    /// Mode asked for by a consumer's `monitor_updates` flag. Without the
    /// flag nothing is requested and the operation's own default applies.
    #[must_use]
    pub fn requested_by_flag(monitor_updates: bool) -> Option<Self> {
        monitor_updates.then_some(Self::Monitoring)
    }

    #[must_use]
    pub fn is_monitoring(self) -> bool {
        self == Self::Monitoring
    }
}

/// One handler invocation, as seen by the bridge.
#[derive(Debug)]
pub enum Emission<T> {
    /// A result batch. Terminal only in single-shot mode.
    Next(T),
    /// A result batch the store marked as its last one. Always terminal.
    Last(T),
    /// A store error. Always terminal.
    Error(StoreError),
}

impl<T> Emission<T> {
    fn is_terminal(&self, mode: QueryMode) -> bool {
        match self {
            Self::Next(_) => mode == QueryMode::SingleShot,
            Self::Last(_) | Self::Error(_) => true,
        }
    }

    fn into_outcome(self) -> Outcome<T> {
        match self {
            Self::Next(value) | Self::Last(value) => Ok(value),
            Self::Error(error) => Err(error),
        }
    }
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum StopReason {
    Completed,
    Failed,
    Dropped,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Dropped => "dropped",
        };
        f.write_str(text)
    }
}

/// Exclusively owned "stop this handle" action.
struct Teardown(Box<dyn FnOnce() + Send>);

impl Teardown {
    fn run(self, reason: StopReason) {
        debug!(%reason, "stopping query handle");
        (self.0)();
    }
}

enum QueryState {
    /// Handle not constructed yet
    Idle,
    /// Handle submitted; owns the teardown
    Live(Teardown),
    /// Terminal; the teardown (if any) has been taken
    Stopped,
}

struct Shared {
    mode: QueryMode,
    state: Mutex<QueryState>,
}

impl Shared {
    /// Move to `Stopped`, returning the teardown if the query was live.
    fn take_teardown(&self) -> Option<Teardown> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, QueryState::Stopped) {
            QueryState::Live(teardown) => Some(teardown),
            QueryState::Idle | QueryState::Stopped => None,
        }
    }
}

/// Channel message between handlers and the stream
enum Signal<T> {
    Item(Outcome<T>),
    End,
}

// ============================================================================
// ResultHandler (store side)
// ============================================================================

/// Result handler handed to the store's query object.
///
/// Cloneable so it can serve both as the initial results handler and as the
/// update handler. Safe to call from any thread.
pub struct ResultHandler<T> {
    shared: Arc<Shared>,
    sender: mpsc::UnboundedSender<Signal<T>>,
}

impl<T> Clone for ResultHandler<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            sender: self.sender.clone(),
        }
    }
}

impl<T: Send + 'static> ResultHandler<T> {
    /// Store callback shape: `(payload?, error?)`.
    ///
    /// The error wins when both are present; neither present is reported as
    /// [`StoreError::missing_payload`].
    pub fn handle(&self, payload: Option<T>, error: Option<StoreError>) {
        let emission = match (payload, error) {
            (_, Some(error)) => Emission::Error(error),
            (Some(value), None) => Emission::Next(value),
            (None, None) => Emission::Error(StoreError::missing_payload()),
        };
        self.deliver(emission);
    }

    pub fn emit(&self, value: T) {
        self.deliver(Emission::Next(value));
    }

    /// Emit a batch the store declared final, completing the stream in any mode.
    pub fn finish(&self, value: T) {
        self.deliver(Emission::Last(value));
    }

    pub fn fail(&self, error: StoreError) {
        self.deliver(Emission::Error(error));
    }

    /// Forward one handler invocation to the consumer.
    ///
    /// Discarded when the query is not live (not submitted yet, completed, or
    /// dropped by the consumer).
    pub fn deliver(&self, emission: Emission<T>) {
        let mut state = self.shared.state.lock();
        match *state {
            QueryState::Live(_) => {}
            QueryState::Idle => {
                warn!("store invoked a query handler before the query was submitted");
                return;
            }
            QueryState::Stopped => {
                trace!("discarding emission for a stopped query");
                return;
            }
        }

        if !emission.is_terminal(self.shared.mode) {
            // Sent under the state lock: a concurrent drop cannot interleave
            let _ = self.sender.send(Signal::Item(emission.into_outcome()));
            return;
        }

        let QueryState::Live(teardown) = std::mem::replace(&mut *state, QueryState::Stopped) else {
            return;
        };
        let reason = match emission {
            Emission::Error(_) => StopReason::Failed,
            Emission::Next(_) | Emission::Last(_) => StopReason::Completed,
        };
        let _ = self.sender.send(Signal::Item(emission.into_outcome()));
        let _ = self.sender.send(Signal::End);
        drop(state);

        teardown.run(reason);
    }

    /// True once the query has completed or the consumer went away.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(*self.shared.state.lock(), QueryState::Stopped)
    }
}

impl<T> fmt::Debug for ResultHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResultHandler(mode={:?})", self.shared.mode)
    }
}

// ============================================================================
// LiveQuery (consumer side)
// ============================================================================

type Starter<T> = Box<dyn FnOnce(&Arc<Shared>, mpsc::UnboundedSender<Signal<T>>) + Send>;

/// A cancellable stream over a store query.
///
/// Nothing happens until the first poll. Dropping the stream stops the
/// underlying query handle if it was submitted and has not completed.
#[must_use = "the query is submitted only when the stream is polled"]
pub struct LiveQuery<T> {
    shared: Arc<Shared>,
    starter: Option<Starter<T>>,
    receiver: Option<mpsc::UnboundedReceiver<Signal<T>>>,
    finished: bool,
}

impl<T> Unpin for LiveQuery<T> {}

impl<T: Send + 'static> LiveQuery<T> {
    /// Build a stream over a query object.
    ///
    /// - `construct` creates the store's query handle around the result handler
    /// - `submit` hands the handle to the store's executor
    /// - `stop` releases the handle; called exactly once if `submit` was called
    pub fn new<H, C, S, X>(mode: QueryMode, construct: C, submit: S, stop: X) -> Self
    where
        H: Send + Sync + 'static,
        C: FnOnce(ResultHandler<T>) -> H + Send + 'static,
        S: FnOnce(&H) + Send + 'static,
        X: FnOnce(&H) + Send + 'static,
    {
        let starter: Starter<T> = Box::new(
            move |shared: &Arc<Shared>, sender: mpsc::UnboundedSender<Signal<T>>| {
                let handler = ResultHandler {
                    shared: Arc::clone(shared),
                    sender,
                };
                let handle = Arc::new(construct(handler));
                let teardown = {
                    let handle = Arc::clone(&handle);
                    Teardown(Box::new(move || stop(&handle)))
                };
                *shared.state.lock() = QueryState::Live(teardown);

                debug!(mode = ?shared.mode, "submitting query handle");
                submit(&handle);
            },
        );

        Self {
            shared: Arc::new(Shared {
                mode,
                state: Mutex::new(QueryState::Idle),
            }),
            starter: Some(starter),
            receiver: None,
            finished: false,
        }
    }

    fn start(&mut self) {
        if let Some(starter) = self.starter.take() {
            let (tx, rx) = mpsc::unbounded_channel();
            self.receiver = Some(rx);
            starter(&self.shared, tx);
        }
    }
}

impl<T> LiveQuery<T> {
    #[must_use]
    pub fn mode(&self) -> QueryMode {
        self.shared.mode
    }

    /// True once the query handle has been constructed and submitted.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.starter.is_none()
    }
}

impl<T: Send + 'static> Stream for LiveQuery<T> {
    type Item = Outcome<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        self.start();

        let Some(receiver) = self.receiver.as_mut() else {
            self.finished = true;
            return Poll::Ready(None);
        };
        match receiver.poll_recv(cx) {
            Poll::Ready(Some(Signal::Item(outcome))) => Poll::Ready(Some(outcome)),
            Poll::Ready(Some(Signal::End)) => {
                self.finished = true;
                self.receiver = None;
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                // Every handler clone is gone without a terminal emission
                warn!("store released all query handlers, failing stream");
                self.finished = true;
                self.receiver = None;
                if let Some(teardown) = self.shared.take_teardown() {
                    teardown.run(StopReason::Failed);
                }
                Poll::Ready(Some(Err(StoreError::abandoned())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: Send + 'static> FusedStream for LiveQuery<T> {
    fn is_terminated(&self) -> bool {
        self.finished
    }
}

impl<T> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        if let Some(teardown) = self.shared.take_teardown() {
            teardown.run(StopReason::Dropped);
        }
    }
}

impl<T> fmt::Debug for LiveQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LiveQuery(mode={:?}, started={}, finished={})",
            self.shared.mode,
            self.is_started(),
            self.finished
        )
    }
}
