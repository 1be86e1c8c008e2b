//! Ordered task queue with two priority lanes.
//!
//! Tasks run one at a time on a dispatcher task. Head-invalidating tasks
//! always run before any immediate task still waiting in the queue. Each
//! queued head-invalidating task holds the head invalidated until it calls
//! [`TaskQueue::reset_head`]; the head is valid again once every one of them
//! has.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Immediate,
    HeadInvalidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadState {
    Valid,
    Invalidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("task queue is full")]
    Full,
    #[error("task queue is shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub immediate_run: u64,
    pub head_invalidate_run: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct QueueCounters {
    immediate_run: AtomicU64,
    head_invalidate_run: AtomicU64,
    rejected: AtomicU64,
}

struct QueuedTask {
    name: &'static str,
    task: BoxFuture<'static, ()>,
}

pub struct TaskQueue {
    immediate_tx: mpsc::Sender<QueuedTask>,
    head_tx: mpsc::Sender<QueuedTask>,
    /// Head-invalidating tasks queued or running that have not reset head.
    pending_heads: watch::Sender<usize>,
    counters: Arc<QueueCounters>,
}

impl TaskQueue {
    pub fn start(capacity: usize) -> (Arc<Self>, JoinHandle<()>) {
        let capacity = capacity.max(1);
        let (immediate_tx, immediate_rx) = mpsc::channel(capacity);
        let (head_tx, head_rx) = mpsc::channel(capacity);
        let (pending_heads, _) = watch::channel(0);
        let counters = Arc::new(QueueCounters::default());

        let dispatcher = tokio::spawn(dispatch(head_rx, immediate_rx, Arc::clone(&counters)));
        let queue = Arc::new(Self {
            immediate_tx,
            head_tx,
            pending_heads,
            counters,
        });
        (queue, dispatcher)
    }

    pub fn execute<F>(
        &self,
        task_type: TaskType,
        name: &'static str,
        task: F,
    ) -> Result<(), QueueError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let queued = QueuedTask {
            name,
            task: Box::pin(task),
        };
        let sender = match task_type {
            TaskType::Immediate => &self.immediate_tx,
            TaskType::HeadInvalidate => {
                // Counted before the send so the task can never reset first.
                self.pending_heads.send_modify(|pending| *pending += 1);
                &self.head_tx
            }
        };
        sender.try_send(queued).map_err(|err| {
            if task_type == TaskType::HeadInvalidate {
                self.release_head();
            }
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            match err {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("task_queue: rejected task={name}, queue full");
                    QueueError::Full
                }
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            }
        })
    }

    pub fn head_state(&self) -> HeadState {
        if *self.pending_heads.borrow() > 0 {
            HeadState::Invalidated
        } else {
            HeadState::Valid
        }
    }

    pub fn is_head_invalidated(&self) -> bool {
        self.head_state() == HeadState::Invalidated
    }

    /// Called once by every head-invalidating task when its head update is
    /// done.
    pub fn reset_head(&self) {
        if let Some(0) = self.release_head() {
            debug!("task_queue: head reset");
        }
    }

    /// Returns the remaining count, or `None` when nothing was pending.
    fn release_head(&self) -> Option<usize> {
        let mut remaining = None;
        self.pending_heads.send_if_modified(|pending| {
            if *pending == 0 {
                return false;
            }
            *pending -= 1;
            remaining = Some(*pending);
            true
        });
        remaining
    }

    /// Resolves immediately when the head is valid, otherwise once every
    /// pending head-invalidating task has reset it.
    pub async fn wait_for_head_reset(&self) {
        let mut rx = self.pending_heads.subscribe();
        let _ = rx.wait_for(|pending| *pending == 0).await;
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            immediate_run: self.counters.immediate_run.load(Ordering::Relaxed),
            head_invalidate_run: self.counters.head_invalidate_run.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

async fn dispatch(
    mut head_rx: mpsc::Receiver<QueuedTask>,
    mut immediate_rx: mpsc::Receiver<QueuedTask>,
    counters: Arc<QueueCounters>,
) {
    loop {
        let (task_type, queued) = tokio::select! {
            biased;
            Some(queued) = head_rx.recv() => (TaskType::HeadInvalidate, queued),
            Some(queued) = immediate_rx.recv() => (TaskType::Immediate, queued),
            else => break,
        };
        let counter = match task_type {
            TaskType::Immediate => &counters.immediate_run,
            TaskType::HeadInvalidate => &counters.head_invalidate_run,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        debug!(
            "task_queue: running task={} type={task_type:?}",
            queued.name
        );
        queued.task.await;
    }
    debug!("task_queue: dispatcher stopped");
}

#[cfg(test)]
#[path = "tests/task_queue_tests.rs"]
mod tests;
