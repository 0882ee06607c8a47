//! Mailbox: FIFO cross-thread message queue.
//!
//! A mailbox is the only way tasks and threads in this crate talk to each
//! other. Any number of [`Sender`]s feed one [`Mailbox`]. The consumer can
//! wait on it inside `tokio::select!` alongside sockets (the `recv` future
//! is the readiness handle), poll it without blocking, or block a plain OS
//! thread on it.
use tokio::sync::mpsc;

pub use tokio::sync::mpsc::error::SendError;

/// Create a connected sender/mailbox pair.
pub fn channel<T>() -> (Sender<T>, Mailbox<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Sender { tx }, Mailbox { rx })
}

/// Producer half. Cheap to clone, safe to use from any thread.
#[derive(Debug)]
pub struct Sender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Sender<T> {
    /// Enqueue a payload. Never blocks; fails only if the mailbox is gone.
    pub fn send(&self, payload: T) -> Result<(), SendError<T>> {
        self.tx.send(payload)
    }

    /// True when both senders feed the same mailbox.
    pub fn same_mailbox(&self, other: &Sender<T>) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// True once the consuming [`Mailbox`] has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half. Payloads come out in the order their `send` completed.
#[derive(Debug)]
pub struct Mailbox<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Mailbox<T> {
    /// Wait for the oldest payload.
    ///
    /// Returns `None` once every [`Sender`] is dropped and the queue is
    /// drained. Cancel-safe, so it can sit in a `tokio::select!` branch.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the oldest payload if one is queued, without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Blocking receive for threads outside the async runtime.
    ///
    /// Panics if called from within an async context, same as tokio's
    /// `blocking_recv`.
    pub fn blocking_recv(&mut self) -> Option<T> {
        self.rx.blocking_recv()
    }
}
