//! The single context on which every externally visible callback runs.
//!
//! Request consumers, observer notifications and remove-tracking consumers
//! are posted here and invoked one at a time, in posting order.

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::debug;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub struct CallbackContext {
    tx: mpsc::UnboundedSender<Callback>,
}

impl CallbackContext {
    /// Runs callbacks on one dedicated task.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Callback>();
        let task = tokio::spawn(async move {
            while let Some(callback) = rx.recv().await {
                callback();
            }
        });
        (Self { tx }, task)
    }

    /// Leaves execution to the host, which drains the returned pump on its
    /// own controlling thread.
    pub fn manual() -> (Self, CallbackPump) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, CallbackPump { rx })
    }

    pub fn post(&self, callback: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(callback)).is_err() {
            debug!("callbacks: context closed, dropping callback");
        }
    }

    /// Resolves once every callback posted before this call has run.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.post(move || {
            let _ = done_tx.send(());
        });
        let _ = done_rx.await;
    }
}

pub struct CallbackPump {
    rx: mpsc::UnboundedReceiver<Callback>,
}

impl CallbackPump {
    /// Runs everything queued so far without waiting; returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(callback) = self.rx.try_recv() {
            callback();
            ran += 1;
        }
        ran
    }

    /// Waits for and runs the next callback. `false` once every context
    /// handle is dropped.
    pub async fn run_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
#[path = "tests/callbacks_tests.rs"]
mod tests;
