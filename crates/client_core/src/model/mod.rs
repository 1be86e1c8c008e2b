//! Materialized per-session views of the content tree.

use async_trait::async_trait;
use shared::{
    error::ModelError,
    stream::{PayloadWithId, SemanticPropertiesWithId, StreamFeature, StreamStructure, StreamToken},
};

mod provider;
mod tree;

pub use provider::{FeedModelProvider, ModelMutation, ProviderState};
pub use tree::{SessionTree, StructureEffect};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFeature {
    pub content_id: String,
    pub feature: StreamFeature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelChild {
    Feature(ModelFeature),
    Token {
        content_id: String,
        token: StreamToken,
    },
}

impl ModelChild {
    pub fn content_id(&self) -> &str {
        match self {
            ModelChild::Feature(feature) => &feature.content_id,
            ModelChild::Token { content_id, .. } => content_id,
        }
    }
}

/// Net effect of one committed mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelChange {
    pub appended: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl ModelChange {
    pub fn is_empty(&self) -> bool {
        self.appended.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Every notification is delivered on the engine's callback context.
pub trait ModelProviderObserver: Send + Sync {
    fn on_session_start(&self) {}
    fn on_session_finished(&self) {}
    fn on_error(&self, _error: &ModelError) {}
    fn on_change(&self, _change: &ModelChange) {}
}

/// Host hook naming the last node a consumer scrolled to.
pub trait ViewDepthProvider: Send + Sync {
    fn last_visible_content_id(&self) -> Option<String>;
}

/// Receives the features of removed subtrees for one mutation.
pub trait TrackRemovals: Send {
    fn track(&mut self, content_id: &str, feature: &StreamFeature);
    fn deliver(self: Box<Self>);
}

/// Creates the tracker for each mutation; `None` skips tracking for it.
pub type RemoveTrackingFactory =
    std::sync::Arc<dyn Fn() -> Option<Box<dyn TrackRemovals>> + Send + Sync>;

/// Filters removed features and hands the survivors to a consumer once.
pub struct RemoveTracking<T> {
    transform: Box<dyn Fn(&str, &StreamFeature) -> Option<T> + Send>,
    consumer: Box<dyn FnOnce(Vec<T>) + Send>,
    collected: Vec<T>,
}

impl<T> RemoveTracking<T> {
    pub fn new(
        transform: impl Fn(&str, &StreamFeature) -> Option<T> + Send + 'static,
        consumer: impl FnOnce(Vec<T>) + Send + 'static,
    ) -> Self {
        Self {
            transform: Box::new(transform),
            consumer: Box::new(consumer),
            collected: Vec::new(),
        }
    }
}

impl<T: Send + 'static> TrackRemovals for RemoveTracking<T> {
    fn track(&mut self, content_id: &str, feature: &StreamFeature) {
        if let Some(value) = (self.transform)(content_id, feature) {
            self.collected.push(value);
        }
    }

    fn deliver(self: Box<Self>) {
        let this = *self;
        (this.consumer)(this.collected);
    }
}

/// Data one mutation needs written to storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCommit {
    pub payloads: Vec<PayloadWithId>,
    pub semantic_properties: Vec<SemanticPropertiesWithId>,
    pub structures: Vec<StreamStructure>,
}

impl SessionCommit {
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
            && self.semantic_properties.is_empty()
            && self.structures.is_empty()
    }
}

/// Writes provider mutations through to the store, in commit order.
#[async_trait]
pub trait SessionPersistence: Send + Sync {
    async fn persist(&self, session_id: &str, commit: SessionCommit);
}
