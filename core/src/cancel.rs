use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

/// A very long duration used as a stand-in for "no deadline" when a
/// `CancelToken` is handed to a `crossbeam_channel::select!` that needs a
/// concrete `default(duration)` arm.
const NO_DEADLINE: Duration = Duration::from_secs(315_360_000);

struct Inner {
    /// Closed (all senders dropped) when the token is cancelled. Every
    /// suspension point in this crate selects on a clone of this receiver,
    /// standing in for a Go `context.Context`'s `Done()` channel.
    cancel_done: Receiver<()>,
    /// Holds this token's own sender, if it owns one. Root tokens created
    /// with `CancelToken::new` own a sender and drop it on `cancel()`.
    /// Tokens derived with `with_deadline` share the parent's receiver and
    /// hold no sender of their own, since they have no authority to cancel
    /// the parent.
    owned_sender: Mutex<Option<Sender<()>>>,
    /// An additional, purely local deadline. Once passed, `is_cancelled`
    /// reports true even though `cancel_done` itself is untouched.
    deadline: Option<Instant>,
}

/// Cooperative cancellation primitive standing in for a Go `context.Context`
/// in this crate. Cloning is cheap; every clone observes the same
/// cancellation, and derived tokens (`with_deadline`, `with_cancel`) layer
/// extra cancellation conditions without disturbing the parent.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Creates a new, independent root token.
    pub fn new() -> CancelToken {
        let (tx, rx) = bounded(0);
        CancelToken {
            inner: Arc::new(Inner {
                cancel_done: rx,
                owned_sender: Mutex::new(Some(tx)),
                deadline: None,
            }),
        }
    }

    /// A fresh, independent root token, deliberately disconnected from any
    /// ongoing cancellation. Engines pass this into handler invocations
    /// (see the handler cancellation discipline): a mid-flight handler call
    /// must be allowed to finish even if the engine's own run token has
    /// since been cancelled.
    pub fn background() -> CancelToken {
        CancelToken::new()
    }

    /// Cancels this token. Idempotent: cancelling twice is a no-op.
    /// Every clone of this token (and every `with_deadline` descendant)
    /// observes the cancellation.
    pub fn cancel(&self) {
        if let Ok(mut guard) = self.inner.owned_sender.lock() {
            guard.take();
        }
    }

    /// True if this token has been cancelled, or its recorded deadline (if
    /// any) has passed.
    pub fn is_cancelled(&self) -> bool {
        if let Err(TryRecvError::Disconnected) = self.inner.cancel_done.try_recv() {
            return true;
        }
        match self.inner.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// A clone of the underlying cancellation receiver, for use in a
    /// `crossbeam_channel::select!` alongside other channel operations.
    /// The receiver becomes "ready" (disconnected) exactly when this token
    /// is cancelled.
    pub fn cancel_receiver(&self) -> Receiver<()> {
        self.inner.cancel_done.clone()
    }

    /// Time remaining until this token's recorded deadline, or a very large
    /// duration if it has none. Intended to be fed directly into a
    /// `select! { ... default(token.remaining()) => ... }` arm.
    pub fn remaining(&self) -> Duration {
        match self.inner.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => NO_DEADLINE,
        }
    }

    /// Derives a token that is cancelled when either `self` is cancelled or
    /// `timeout` elapses, whichever comes first. Cheap: shares the parent's
    /// cancellation receiver rather than spawning a thread, since the
    /// deadline is enforced by callers consulting `remaining()`/
    /// `is_cancelled()` rather than by an active timer.
    pub fn with_deadline(&self, timeout: Duration) -> CancelToken {
        let candidate = Instant::now() + timeout;
        let deadline = match self.inner.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        CancelToken {
            inner: Arc::new(Inner {
                cancel_done: self.inner.cancel_done.clone(),
                owned_sender: Mutex::new(None),
                deadline: Some(deadline),
            }),
        }
    }

    /// Derives a child token that is cancelled whenever `self` is
    /// cancelled, but which also has its own independent `cancel()`
    /// (cancelling the child never affects `self`). This mirrors Go's
    /// `context.WithCancel(parent)` and is how an engine's `run` derives
    /// the token it hands to workers, so that one worker's fatal error can
    /// cancel its siblings without the caller's own token being touched.
    ///
    /// Spawns one lightweight relay thread that blocks until the parent is
    /// cancelled; intended to be called once per engine run, not per
    /// message.
    pub fn with_cancel(&self) -> CancelToken {
        let child = CancelToken::new();
        let parent_done = self.cancel_receiver();
        let relay_target = child.clone();
        thread::Builder::new()
            .name("ductwork-cancel-relay".into())
            .spawn(move || {
                // Blocks until the parent is cancelled, or returns
                // immediately once the parent is fully dropped.
                let _ = parent_done.recv();
                relay_target.cancel();
            })
            .expect("failed to spawn cancel relay thread");
        child
    }

    /// Blocks the calling thread for up to `max`, returning `true` if this
    /// token was cancelled (or its deadline passed) before `max` elapsed.
    pub fn sleep(&self, max: Duration) -> bool {
        let wait = std::cmp::min(max, self.remaining());
        crossbeam_channel::select! {
            recv(self.inner.cancel_done) -> _ => true,
            default(wait) => self.is_cancelled(),
        }
    }
}

impl Default for CancelToken {
    fn default() -> CancelToken {
        CancelToken::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_is_observed_by_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn with_deadline_expires_without_explicit_cancel() {
        let token = CancelToken::new();
        let timed = token.with_deadline(Duration::from_millis(10));
        assert!(!timed.is_cancelled());
        thread::sleep(Duration::from_millis(30));
        assert!(timed.is_cancelled());
        // The parent is untouched by the child's deadline.
        assert!(!token.is_cancelled());
    }

    #[test]
    fn with_deadline_still_observes_parent_cancel() {
        let token = CancelToken::new();
        let timed = token.with_deadline(Duration::from_secs(60));
        token.cancel();
        assert!(timed.is_cancelled());
    }

    #[test]
    fn with_cancel_cascades_from_parent() {
        let parent = CancelToken::new();
        let child = parent.with_cancel();
        assert!(!child.is_cancelled());
        parent.cancel();
        // Give the relay thread a moment to observe the parent's cancel.
        thread::sleep(Duration::from_millis(50));
        assert!(child.is_cancelled());
    }

    #[test]
    fn with_cancel_child_cancel_does_not_affect_parent() {
        let parent = CancelToken::new();
        let child = parent.with_cancel();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn sleep_returns_true_when_cancelled_early() {
        let token = CancelToken::new();
        let handle = {
            let token = token.clone();
            thread::spawn(move || token.sleep(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn sleep_returns_false_when_it_elapses_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.sleep(Duration::from_millis(20)));
    }
}
