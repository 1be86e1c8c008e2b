use protocol_adapter::AdapterError;
use thiserror::Error;

use crate::task_queue::QueueError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("length-prefixed response is empty")]
    EmptyBuffer,
    #[error("malformed length prefix: {0}")]
    LengthPrefix(String),
    #[error("length prefix declares {declared} bytes but {available} are available")]
    Truncated { declared: usize, available: usize },
    #[error("response is not a valid feed message: {0}")]
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("server responded with status {status}")]
    Http { status: u16 },
    #[error("failed to decode response: {0}")]
    Decode(#[from] DecodeError),
    #[error("failed to adapt response: {0}")]
    Adapter(#[from] AdapterError),
    #[error("failed to read pending actions: {0}")]
    Store(String),
    #[error("task queue is full")]
    QueueFull,
    #[error("task queue is shut down")]
    QueueClosed,
}

impl From<QueueError> for RequestError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Full => RequestError::QueueFull,
            QueueError::Closed => RequestError::QueueClosed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error("model provider is not ready")]
    NotReady,
    #[error("model provider was invalidated")]
    Invalidated,
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("engine is shutting down")]
    ShutDown,
}
