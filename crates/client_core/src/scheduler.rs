use chrono::{DateTime, Utc};

/// Host collaborator deciding when the feed should refresh.
pub trait SchedulerApi: Send + Sync {
    /// A non-continuation request failed with a non-success status.
    fn on_request_error(&self, status: u16);

    /// Fresh content was committed to head.
    fn on_receive_new_content(&self, received_at: DateTime<Utc>);
}

pub struct NoopScheduler;

impl SchedulerApi for NoopScheduler {
    fn on_request_error(&self, _status: u16) {}

    fn on_receive_new_content(&self, _received_at: DateTime<Utc>) {}
}
