use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use shared::{
    error::ModelError,
    stream::{
        PayloadWithId, SemanticPropertiesWithId, StreamDataOperation, StreamFeature,
        StreamPayload, StreamSharedState, StreamStructure, StreamToken,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    ModelChange, ModelChild, ModelFeature, ModelProviderObserver, RemoveTrackingFactory,
    SessionCommit, SessionPersistence, SessionTree, ViewDepthProvider,
};
use crate::{
    callbacks::CallbackContext,
    error::SessionError,
    request_manager::{RequestManager, RequestReason},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Initializing,
    Ready,
    Invalidated,
}

struct ProviderInner {
    state: ProviderState,
    tree: SessionTree,
    features: HashMap<String, StreamFeature>,
    tokens: HashMap<String, StreamToken>,
    shared_states: HashMap<String, StreamSharedState>,
    observers: Vec<Arc<dyn ModelProviderObserver>>,
    remove_tracking: Option<RemoveTrackingFactory>,
    writer: Option<mpsc::UnboundedSender<SessionCommit>>,
    scroll_anchor: Option<String>,
}

/// One session's content tree, held in memory.
///
/// Mutations apply synchronously; their store writes are queued to a
/// per-session writer task and land in commit order.
pub struct FeedModelProvider {
    session_id: String,
    callbacks: CallbackContext,
    request_manager: Arc<dyn RequestManager>,
    view_depth: Option<Arc<dyn ViewDepthProvider>>,
    inner: Mutex<ProviderInner>,
    me: Weak<FeedModelProvider>,
}

impl FeedModelProvider {
    /// Must be called inside a tokio runtime; spawns the session writer.
    pub fn new(
        session_id: impl Into<String>,
        callbacks: CallbackContext,
        request_manager: Arc<dyn RequestManager>,
        persistence: Weak<dyn SessionPersistence>,
        view_depth: Option<Arc<dyn ViewDepthProvider>>,
    ) -> Arc<Self> {
        let session_id = session_id.into();
        let (writer, commits) = mpsc::unbounded_channel();
        tokio::spawn(write_session(session_id.clone(), commits, persistence));

        Arc::new_cyclic(|me| Self {
            session_id,
            callbacks,
            request_manager,
            view_depth,
            inner: Mutex::new(ProviderInner {
                state: ProviderState::Initializing,
                tree: SessionTree::new(),
                features: HashMap::new(),
                tokens: HashMap::new(),
                shared_states: HashMap::new(),
                observers: Vec::new(),
                remove_tracking: None,
                writer: Some(writer),
                scroll_anchor: None,
            }),
            me: me.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ProviderInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ProviderState {
        self.lock().state
    }

    /// Loads the replayed journal and its payloads, then moves to `Ready`.
    pub fn initialize(
        &self,
        structures: &[StreamStructure],
        payloads: Vec<PayloadWithId>,
        shared_states: Vec<StreamSharedState>,
    ) {
        let mut inner = self.lock();
        if inner.state != ProviderState::Initializing {
            warn!(
                "model: ignoring initialize session={} state={:?}",
                self.session_id, inner.state
            );
            return;
        }

        inner.tree = SessionTree::replay(structures);
        for entry in payloads {
            match entry.payload {
                StreamPayload::Feature(feature) => {
                    inner.features.insert(entry.content_id, feature);
                }
                StreamPayload::Token(token) => {
                    inner.tokens.insert(entry.content_id, token);
                }
                StreamPayload::SharedState(shared_state) => {
                    inner
                        .shared_states
                        .insert(shared_state.content_id.clone(), shared_state);
                }
                StreamPayload::SemanticData(_) => {}
            }
        }
        for shared_state in shared_states {
            inner
                .shared_states
                .insert(shared_state.content_id.clone(), shared_state);
        }
        let anchor = self
            .view_depth
            .as_ref()
            .and_then(|provider| provider.last_visible_content_id())
            .filter(|content_id| inner.tree.contains(content_id));
        inner.scroll_anchor = anchor;
        inner.state = ProviderState::Ready;
        info!(
            "model: session ready session={} nodes={}",
            self.session_id,
            inner.tree.len()
        );

        for observer in inner.observers.clone() {
            self.callbacks.post(move || observer.on_session_start());
        }
    }

    pub fn edit(&self) -> ModelMutation<'_> {
        ModelMutation {
            provider: self,
            operations: Vec::new(),
        }
    }

    fn apply(&self, operations: Vec<StreamDataOperation>) -> Result<ModelChange, SessionError> {
        let mut inner = self.lock();
        match inner.state {
            ProviderState::Initializing => return Err(SessionError::NotReady),
            ProviderState::Invalidated => return Err(SessionError::Invalidated),
            ProviderState::Ready => {}
        }

        let mut tracker = inner.remove_tracking.as_ref().and_then(|factory| factory());
        let mut removed_features = 0usize;
        let mut change = ModelChange::default();
        let mut commit = SessionCommit::default();

        for operation in operations {
            let content_id = operation.content_id().map(str::to_string);
            let structural = operation.is_structural();

            match (operation.payload, content_id.as_deref()) {
                (Some(StreamPayload::Feature(feature)), Some(id)) => {
                    if inner.features.insert(id.to_string(), feature.clone()).is_some()
                        && inner.tree.contains(id)
                    {
                        change.updated.push(id.to_string());
                    }
                    commit.payloads.push(PayloadWithId {
                        content_id: id.to_string(),
                        payload: StreamPayload::Feature(feature),
                    });
                }
                (Some(StreamPayload::Token(token)), Some(id)) => {
                    inner.tokens.insert(id.to_string(), token.clone());
                    commit.payloads.push(PayloadWithId {
                        content_id: id.to_string(),
                        payload: StreamPayload::Token(token),
                    });
                }
                (Some(StreamPayload::SharedState(shared_state)), Some(id)) => {
                    inner
                        .shared_states
                        .insert(shared_state.content_id.clone(), shared_state.clone());
                    commit.payloads.push(PayloadWithId {
                        content_id: id.to_string(),
                        payload: StreamPayload::SharedState(shared_state),
                    });
                }
                (Some(StreamPayload::SemanticData(semantic_data)), Some(id)) => {
                    commit.semantic_properties.push(SemanticPropertiesWithId {
                        content_id: id.to_string(),
                        semantic_data,
                    });
                }
                _ => {}
            }

            if !structural {
                continue;
            }
            let effect = inner.tree.apply(&operation.structure);
            change.appended.extend(effect.appended);
            for removed in effect.removed {
                if let Some(feature) = inner.features.remove(&removed) {
                    if let Some(tracker) = tracker.as_mut() {
                        tracker.track(&removed, &feature);
                    }
                    removed_features += 1;
                }
                inner.tokens.remove(&removed);
                change.removed.push(removed);
            }
            commit.structures.push(operation.structure);
        }

        if !commit.is_empty() {
            if let Some(writer) = &inner.writer {
                if writer.send(commit).is_err() {
                    warn!("model: session writer gone session={}", self.session_id);
                }
            }
        }
        let observers = inner.observers.clone();
        drop(inner);

        if removed_features > 0 {
            if let Some(tracker) = tracker {
                self.callbacks.post(move || tracker.deliver());
            }
        }
        if !change.is_empty() {
            for observer in observers {
                let change = change.clone();
                self.callbacks.post(move || observer.on_change(&change));
            }
        }
        debug!(
            "model: committed session={} appended={} updated={} removed={}",
            self.session_id,
            change.appended.len(),
            change.updated.len(),
            change.removed.len()
        );
        Ok(change)
    }

    /// Ends the session for good. Observers get `on_session_finished`.
    pub fn invalidate(&self) {
        let observers = {
            let mut inner = self.lock();
            if inner.state == ProviderState::Invalidated {
                return;
            }
            inner.state = ProviderState::Invalidated;
            inner.writer = None;
            std::mem::take(&mut inner.observers)
        };
        info!("model: session invalidated session={}", self.session_id);
        for observer in observers {
            self.callbacks.post(move || observer.on_session_finished());
        }
    }

    /// Drops the link to the store. The persisted session stays, so no
    /// `on_session_finished` is sent.
    pub fn detach_model_provider(&self) {
        let mut inner = self.lock();
        inner.state = ProviderState::Invalidated;
        inner.writer = None;
        inner.observers.clear();
        debug!("model: detached session={}", self.session_id);
    }

    pub fn raise_error(&self, error: ModelError) {
        let inner = self.lock();
        if inner.state == ProviderState::Invalidated {
            return;
        }
        warn!(
            "model: raising {:?} session={}",
            error.kind, self.session_id
        );
        for observer in inner.observers.clone() {
            let error = error.clone();
            self.callbacks.post(move || observer.on_error(&error));
        }
    }

    pub fn get_root_feature(&self) -> Option<ModelFeature> {
        let inner = self.lock();
        let root = inner.tree.root()?;
        inner.features.get(root).map(|feature| ModelFeature {
            content_id: root.to_string(),
            feature: feature.clone(),
        })
    }

    pub fn get_model_child(&self, content_id: &str) -> Option<ModelChild> {
        let inner = self.lock();
        child_of(&inner, content_id)
    }

    pub fn get_shared_state(&self, content_id: &str) -> Option<StreamSharedState> {
        self.lock().shared_states.get(content_id).cloned()
    }

    pub fn get_all_root_children(&self) -> Vec<ModelChild> {
        let inner = self.lock();
        let Some(root) = inner.tree.root() else {
            return Vec::new();
        };
        inner
            .tree
            .children(root)
            .iter()
            .filter_map(|child| child_of(&inner, child))
            .collect()
    }

    pub fn scroll_anchor(&self) -> Option<String> {
        self.lock().scroll_anchor.clone()
    }

    /// Loads the page behind `token` and appends it in place of the token.
    /// A failed load raises a pagination error carrying `token`.
    pub fn handle_token(&self, token: &StreamToken) -> Result<(), SessionError> {
        let token_id = {
            let inner = self.lock();
            match inner.state {
                ProviderState::Initializing => return Err(SessionError::NotReady),
                ProviderState::Invalidated => return Err(SessionError::Invalidated),
                ProviderState::Ready => {}
            }
            inner
                .tokens
                .iter()
                .find(|(_, known)| *known == token)
                .map(|(id, _)| id.clone())
        };

        let me = self.me.clone();
        let failed_token = token.clone();
        self.request_manager.load_more(
            token.clone(),
            Box::new(move |result| {
                let Some(provider) = me.upgrade() else {
                    return;
                };
                match result {
                    Ok(operations) => {
                        let mut mutation = provider.edit();
                        if let Some(token_id) = token_id {
                            mutation = mutation.add(StreamDataOperation::remove(
                                token_id,
                                failed_token.parent_id.clone(),
                            ));
                        }
                        if let Err(err) = mutation.add_all(operations).commit() {
                            debug!(
                                "model: dropping page for session={}: {err}",
                                provider.session_id
                            );
                        }
                    }
                    Err(err) => {
                        warn!(
                            "model: load more failed session={}: {err}",
                            provider.session_id
                        );
                        provider.raise_error(ModelError::pagination(failed_token));
                    }
                }
            }),
        );
        Ok(())
    }

    /// Replaces this session's tree with a fresh response. The current tree
    /// stays until the request succeeds.
    pub fn trigger_refresh(&self) {
        let me = self.me.clone();
        self.request_manager.trigger_refresh(
            RequestReason::ManualRefresh,
            Some(self.session_id.clone()),
            Some(Box::new(move |result| {
                let Some(provider) = me.upgrade() else {
                    return;
                };
                match result {
                    Ok(operations) => {
                        let outcome = provider
                            .edit()
                            .add(StreamDataOperation::clear_all())
                            .add_all(operations)
                            .commit();
                        if let Err(err) = outcome {
                            debug!(
                                "model: dropping refresh for session={}: {err}",
                                provider.session_id
                            );
                        }
                    }
                    Err(err) => {
                        warn!(
                            "model: refresh failed session={}: {err}",
                            provider.session_id
                        );
                        if provider.lock().tree.is_empty() {
                            provider.raise_error(ModelError::no_content());
                        }
                    }
                }
            })),
        );
    }

    pub fn enable_remove_tracking(&self, factory: RemoveTrackingFactory) {
        self.lock().remove_tracking = Some(factory);
    }

    pub fn register_observer(&self, observer: Arc<dyn ModelProviderObserver>) {
        self.lock().observers.push(observer);
    }

    pub fn unregister_observer(&self, observer: &Arc<dyn ModelProviderObserver>) {
        self.lock()
            .observers
            .retain(|existing| !Arc::ptr_eq(existing, observer));
    }

    /// Ids reachable in this session right now.
    pub fn content_ids(&self) -> Vec<String> {
        self.lock().tree.content_ids()
    }
}

fn child_of(inner: &ProviderInner, content_id: &str) -> Option<ModelChild> {
    if !inner.tree.contains(content_id) {
        return None;
    }
    if let Some(feature) = inner.features.get(content_id) {
        return Some(ModelChild::Feature(ModelFeature {
            content_id: content_id.to_string(),
            feature: feature.clone(),
        }));
    }
    inner.tokens.get(content_id).map(|token| ModelChild::Token {
        content_id: content_id.to_string(),
        token: token.clone(),
    })
}

/// Atomic batch of operations against one provider.
pub struct ModelMutation<'a> {
    provider: &'a FeedModelProvider,
    operations: Vec<StreamDataOperation>,
}

impl ModelMutation<'_> {
    pub fn add(mut self, operation: StreamDataOperation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn add_all(mut self, operations: impl IntoIterator<Item = StreamDataOperation>) -> Self {
        self.operations.extend(operations);
        self
    }

    pub fn commit(self) -> Result<ModelChange, SessionError> {
        self.provider.apply(self.operations)
    }
}

async fn write_session(
    session_id: String,
    mut commits: mpsc::UnboundedReceiver<SessionCommit>,
    persistence: Weak<dyn SessionPersistence>,
) {
    while let Some(commit) = commits.recv().await {
        let Some(persistence) = persistence.upgrade() else {
            debug!("model: persistence gone, stopping writer session={session_id}");
            break;
        };
        persistence.persist(&session_id, commit).await;
    }
}

#[cfg(test)]
#[path = "../tests/provider_tests.rs"]
mod tests;
