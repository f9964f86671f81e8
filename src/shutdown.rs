//! A one-shot, broadcastable shutdown signal.
//!
//! Every long-running loop in this crate (port loops, the router sweeper,
//! connector workers) holds a [`ShutdownWatch`] and checks it between I/O
//! operations, per §5's cancellation discipline. [`Shutdown::trigger`] is
//! idempotent and wakes every waiter.

use tokio::sync::watch;

#[derive(Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ShutdownWatch {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> (Self, ShutdownWatch) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, ShutdownWatch { rx })
    }

    /// Broadcast shutdown to every watcher. Safe to call more than once.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl ShutdownWatch {
    pub fn is_done(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`Shutdown::trigger`] has been called. Resolves
    /// immediately if it already has been.
    pub async fn wait(&mut self) {
        if self.is_done() {
            return;
        }
        let _ = self.rx.wait_for(|done| *done).await;
    }
}
