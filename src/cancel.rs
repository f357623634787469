//! Cancellation tokens for the long running tasks of the client.
//!
//! Tokens form a tree: cancelling a token cancels every token derived from
//! it through [`Cancellation::child`], but a child can be cancelled on its own
//! without touching its parent.
use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use event_listener::Event;
use parking_lot::Mutex;

struct Inner {
    cancelled: AtomicBool,
    event: Event,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn new(cancelled: bool) -> Self {
        Self {
            cancelled: AtomicBool::new(cancelled),
            event: Event::new(),
            children: Mutex::new(Vec::new()),
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.event.notify(usize::MAX);
        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

/// A token which can be used to stop a task at its next suspension point.
#[derive(Clone)]
pub struct Cancellation {
    inner: Arc<Inner>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new(false)),
        }
    }

    /// Derive a new token, cancelled along with this one.
    pub fn child(&self) -> Self {
        let child = Arc::new(Inner::new(self.is_cancelled()));
        {
            let mut children = self.inner.children.lock();
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        // We might have raced with a cancellation of the parent.
        if self.is_cancelled() {
            child.cancel();
        }
        Self { inner: child }
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until this token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let listener = self.inner.event.listen();
            if self.is_cancelled() {
                return;
            }
            listener.await;
        }
    }

    /// Run a future, giving up on it if this token gets cancelled first.
    ///
    /// Returns `None` if the token was cancelled. Cancellation wins when both
    /// are ready at the same time.
    pub async fn run_until_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        smol::future::or(
            async {
                self.cancelled().await;
                None
            },
            async { Some(fut.await) },
        )
        .await
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellation")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
