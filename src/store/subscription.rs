//! Cancellable realtime subscription handle

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use super::Change;

/// Stream of changes for one query. Dropping it unregisters the listener.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Change>,
    _guard: UnsubscribeGuard,
}

struct UnsubscribeGuard(Option<Box<dyn FnOnce() + Send>>);

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.0.take() {
            unsubscribe();
        }
    }
}

impl Subscription {
    /// Create a subscription fed through the returned sender
    pub fn channel<F>(on_drop: F) -> (mpsc::UnboundedSender<Change>, Self)
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = Self {
            rx,
            _guard: UnsubscribeGuard(Some(Box::new(on_drop))),
        };
        (tx, subscription)
    }

    /// Next change, or `None` once the store closed the feed
    pub async fn next_change(&mut self) -> Option<Change> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = Change;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Change>> {
        self.rx.poll_recv(cx)
    }
}
