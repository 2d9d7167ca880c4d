//! Single-assignment completions for subscribe/unsubscribe intents.
//!
//! A [`PendingOp`] is resolved exactly once. Every intent collapsed into the
//! same handshake receives a clone of the same [`Completion`], and two pending
//! operations can be joined so that both sets of waiters observe one outcome.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::{FutureExt, Shared};
use tokio::sync::oneshot;

use crate::rta::error::RtaError;

/// Outcome delivered to add/remove callers.
pub type Outcome = Result<(), RtaError>;

/// Cloneable future resolving to the outcome of an add or remove.
///
/// If the producing side is dropped without resolving, the completion
/// resolves to [`RtaError::Aborted`].
#[derive(Clone)]
#[must_use = "completions do nothing unless awaited"]
pub struct Completion {
    inner: CompletionInner,
}

#[derive(Clone)]
enum CompletionInner {
    Ready(Outcome),
    Pending(Shared<oneshot::Receiver<Outcome>>),
}

impl Completion {
    /// Returns a completion that is already resolved.
    pub fn ready(outcome: Outcome) -> Self {
        Self {
            inner: CompletionInner::Ready(outcome),
        }
    }
}

impl Future for Completion {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            CompletionInner::Ready(outcome) => Poll::Ready(outcome.clone()),
            CompletionInner::Pending(shared) => shared
                .poll_unpin(cx)
                .map(|received| received.unwrap_or(Err(RtaError::Aborted))),
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            CompletionInner::Ready(outcome) => {
                f.debug_tuple("Completion::Ready").field(outcome).finish()
            }
            CompletionInner::Pending(_) => f.write_str("Completion::Pending"),
        }
    }
}

/// Producer side of one in-flight operation.
pub(crate) struct PendingOp {
    senders: Vec<oneshot::Sender<Outcome>>,
    completion: Completion,
}

impl PendingOp {
    pub(crate) fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            senders: vec![tx],
            completion: Completion {
                inner: CompletionInner::Pending(rx.shared()),
            },
        }
    }

    pub(crate) fn completion(&self) -> Completion {
        self.completion.clone()
    }

    /// Joins `other` so its waiters observe this operation's outcome.
    pub(crate) fn absorb(&mut self, other: PendingOp) {
        self.senders.extend(other.senders);
    }

    pub(crate) fn resolve(self, outcome: Outcome) {
        for tx in self.senders {
            let _ = tx.send(outcome.clone());
        }
    }
}

/// Returns a completion for the operation in `slot`, starting one if none is
/// in flight.
pub(crate) fn join(slot: &mut Option<PendingOp>) -> Completion {
    slot.get_or_insert_with(PendingOp::new).completion()
}

/// Moves the waiters of `from` into the operation in `into`.
pub(crate) fn merge(into: &mut Option<PendingOp>, from: Option<PendingOp>) {
    if let Some(from) = from {
        match into {
            Some(op) => op.absorb(from),
            None => *into = Some(from),
        }
    }
}
