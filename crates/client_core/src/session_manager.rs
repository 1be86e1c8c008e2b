//! Owns the live model providers and everything that touches head.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::DismissAction,
    error::ModelError,
    stream::{StreamDataOperation, StreamPayload, StreamStructure},
};
use storage::{
    AccessibleIdsSupplier, CommitResult, ContentStore, EditStore, FeedStore, GcTask,
    StoreListener, HEAD_SESSION_ID,
};
use tracing::{error, info, warn};

use crate::{
    callbacks::CallbackContext,
    error::SessionError,
    model::{
        FeedModelProvider, ModelProviderObserver, SessionCommit, SessionPersistence, SessionTree,
        ViewDepthProvider,
    },
    request_manager::{HeadSink, RequestManager, RequestResult},
    scheduler::SchedulerApi,
    task_queue::TaskQueue,
};

fn storage_error(err: anyhow::Error) -> SessionError {
    SessionError::Storage(format!("{err:#}"))
}

pub struct FeedSessionManager {
    store: Arc<FeedStore>,
    queue: Arc<TaskQueue>,
    callbacks: CallbackContext,
    request_manager: Arc<dyn RequestManager>,
    scheduler: Arc<dyn SchedulerApi>,
    providers: Mutex<HashMap<String, Weak<FeedModelProvider>>>,
    me: Weak<FeedSessionManager>,
}

impl FeedSessionManager {
    pub fn new(
        store: Arc<FeedStore>,
        queue: Arc<TaskQueue>,
        callbacks: CallbackContext,
        request_manager: Arc<dyn RequestManager>,
        scheduler: Arc<dyn SchedulerApi>,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|me| Self {
            store: Arc::clone(&store),
            queue,
            callbacks,
            request_manager,
            scheduler,
            providers: Mutex::new(HashMap::new()),
            me: me.clone(),
        });
        store.register_listener(Arc::new(FailoverListener {
            manager: Arc::downgrade(&manager),
        }));
        manager
    }

    fn providers(&self) -> MutexGuard<'_, HashMap<String, Weak<FeedModelProvider>>> {
        self.providers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_providers(&self) -> Vec<Arc<FeedModelProvider>> {
        let mut providers = self.providers();
        providers.retain(|_, provider| provider.strong_count() > 0);
        providers.values().filter_map(Weak::upgrade).collect()
    }

    pub fn live_sessions(&self) -> Vec<String> {
        self.live_providers()
            .iter()
            .map(|provider| provider.session_id().to_string())
            .collect()
    }

    /// Drops sessions left behind by an earlier process and reports the
    /// size of head.
    pub async fn initialize(&self) -> Result<usize, SessionError> {
        let stale = self.store.get_all_sessions().await.map_err(storage_error)?;
        for session_id in &stale {
            if let Err(err) = self.store.remove_session(session_id).await {
                warn!("session: failed to drop stale session={session_id}: {err:#}");
            }
        }
        let head = self
            .store
            .get_stream_structures(HEAD_SESSION_ID)
            .await
            .map_err(storage_error)?;
        let head_size = SessionTree::replay(&head).len();
        info!(
            "session: initialized head_nodes={head_size} stale_sessions={}",
            stale.len()
        );
        Ok(head_size)
    }

    /// Creates a session holding a copy of head. Waits for any pending
    /// head-invalidating refresh to finish first.
    pub async fn create_model_provider(
        &self,
        view_depth: Option<Arc<dyn ViewDepthProvider>>,
        observer: Option<Arc<dyn ModelProviderObserver>>,
    ) -> Result<Arc<FeedModelProvider>, SessionError> {
        self.queue.wait_for_head_reset().await;

        let head = self
            .store
            .get_stream_structures(HEAD_SESSION_ID)
            .await
            .map_err(storage_error)?;
        let session_id = self.store.create_new_session().await.map_err(storage_error)?;
        let copied = self
            .store
            .edit_session(session_id.clone())
            .add_all(head.iter().cloned())
            .commit()
            .await;
        if !copied.is_success() {
            self.handle_storage_failure();
            return Err(SessionError::Storage(format!(
                "copying head into session {session_id} failed"
            )));
        }

        let tree = SessionTree::replay(&head);
        let payloads = self
            .store
            .get_payloads(&tree.content_ids())
            .await
            .map_err(storage_error)?;
        let shared_states = self.store.get_shared_states().await.map_err(storage_error)?;

        let persistence: Weak<dyn SessionPersistence> = self.me.clone();
        let provider = FeedModelProvider::new(
            session_id.clone(),
            self.callbacks.clone(),
            Arc::clone(&self.request_manager),
            persistence,
            view_depth,
        );
        if let Some(observer) = observer {
            provider.register_observer(observer);
        }
        provider.initialize(&head, payloads, shared_states);
        self.providers()
            .insert(session_id.clone(), Arc::downgrade(&provider));
        info!(
            "session: created session={session_id} nodes={}",
            tree.len()
        );

        if tree.is_empty() {
            provider.raise_error(ModelError::no_content());
        }
        Ok(provider)
    }

    /// Invalidates the provider and deletes its session.
    pub async fn invalidate_session(&self, session_id: &str) -> Result<(), SessionError> {
        let provider = self
            .providers()
            .remove(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
        if let Some(provider) = provider.upgrade() {
            provider.invalidate();
        }
        self.store
            .remove_session(session_id)
            .await
            .map_err(storage_error)
    }

    /// Forgets the provider but keeps its persisted session.
    pub fn detach_session(&self, session_id: &str) -> Result<(), SessionError> {
        let provider = self
            .providers()
            .remove(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
        if let Some(provider) = provider.upgrade() {
            provider.detach_model_provider();
        }
        Ok(())
    }

    pub fn invalidate_all(&self) {
        let providers: Vec<Weak<FeedModelProvider>> = self
            .providers()
            .drain()
            .map(|(_, provider)| provider)
            .collect();
        let mut invalidated = 0usize;
        for provider in providers.iter().filter_map(Weak::upgrade) {
            provider.invalidate();
            invalidated += 1;
        }
        if invalidated > 0 {
            info!("session: invalidated providers count={invalidated}");
        }
    }

    /// Ends every live session except `keep` and deletes the stored ones.
    /// Used when head was cleared under them.
    async fn invalidate_sessions_except(&self, keep: Option<&str>) {
        let stale: Vec<(String, Weak<FeedModelProvider>)> = {
            let mut providers = self.providers();
            let session_ids: Vec<String> = providers
                .keys()
                .filter(|session_id| Some(session_id.as_str()) != keep)
                .cloned()
                .collect();
            session_ids
                .iter()
                .filter_map(|session_id| providers.remove_entry(session_id))
                .collect()
        };
        if stale.is_empty() {
            return;
        }

        for (session_id, provider) in &stale {
            if let Some(provider) = provider.upgrade() {
                provider.invalidate();
            }
            if let Err(err) = self.store.remove_session(session_id).await {
                warn!("session: failed to drop cleared session={session_id}: {err:#}");
            }
        }
        info!(
            "session: head cleared, invalidated sessions count={}",
            stale.len()
        );
    }

    /// Degrades to ephemeral storage. Live providers are invalidated by the
    /// store's switch notification.
    pub fn handle_storage_failure(&self) {
        if self.store.switch_to_ephemeral_mode().is_some() {
            error!("session: storage commit failed, continuing in ephemeral mode");
        }
    }

    async fn commit_head(&self, operations: &[StreamDataOperation]) -> CommitResult {
        let mut content = self.store.edit_content();
        let mut semantic = self.store.edit_semantic_properties();
        let mut structures = Vec::new();
        let mut cleared = false;

        for operation in operations {
            match (&operation.payload, operation.content_id()) {
                (Some(StreamPayload::SemanticData(bytes)), Some(content_id)) => {
                    semantic = semantic.add(content_id, bytes.clone());
                }
                (Some(payload), Some(content_id)) => {
                    content = content.add(content_id, payload.clone());
                }
                _ => {}
            }
            if !operation.is_structural() {
                continue;
            }
            if operation.structure == StreamStructure::ClearAll {
                cleared = true;
                structures.clear();
            } else {
                structures.push(operation.structure.clone());
            }
        }

        if !content.is_empty() && !content.commit().await.is_success() {
            return CommitResult::Failure;
        }
        if !semantic.is_empty() && !semantic.commit().await.is_success() {
            return CommitResult::Failure;
        }
        if cleared {
            if let Err(err) = self.store.clear_head().await {
                error!("session: clearing head failed: {err:#}");
                return CommitResult::Failure;
            }
        }
        if structures.is_empty() {
            return CommitResult::Success;
        }
        self.store
            .edit_session(HEAD_SESSION_ID)
            .add_all(structures)
            .commit()
            .await
    }

    /// Records a dismiss action, with the semantic properties to send
    /// alongside it if any.
    pub async fn record_dismiss(
        &self,
        content_id: &str,
        semantic_properties: Option<Vec<u8>>,
    ) -> Result<(), SessionError> {
        if self.commit_dismiss(content_id, semantic_properties.clone()).await {
            return Ok(());
        }
        self.handle_storage_failure();
        if self.commit_dismiss(content_id, semantic_properties).await {
            return Ok(());
        }
        Err(SessionError::Storage(format!(
            "recording dismiss for {content_id} failed"
        )))
    }

    async fn commit_dismiss(&self, content_id: &str, semantic_properties: Option<Vec<u8>>) -> bool {
        if let Some(bytes) = semantic_properties {
            let stored = self
                .store
                .edit_semantic_properties()
                .add(content_id, bytes)
                .commit()
                .await;
            if !stored.is_success() {
                return false;
            }
        }
        self.store
            .edit_actions()
            .add_action(DismissAction::dismiss(content_id))
            .commit()
            .await
            .is_success()
    }

    fn live_content_ids(&self) -> HashSet<String> {
        self.live_providers()
            .iter()
            .flat_map(|provider| provider.content_ids())
            .collect()
    }

    /// Collection task for content unreachable from head, every stored
    /// session, pending dismiss actions and shared states. Live providers
    /// are consulted when the task runs.
    pub async fn content_gc_task(&self) -> Result<GcTask, SessionError> {
        let mut reserved = HashSet::new();
        let mut sessions = self.store.get_all_sessions().await.map_err(storage_error)?;
        sessions.push(HEAD_SESSION_ID.to_string());
        for session_id in &sessions {
            let structures = self
                .store
                .get_stream_structures(session_id)
                .await
                .map_err(storage_error)?;
            reserved.extend(SessionTree::replay(&structures).content_id_set());
        }
        let actions = self
            .store
            .get_all_dismiss_actions()
            .await
            .map_err(storage_error)?;
        reserved.extend(actions.into_iter().map(|action| action.content_id));
        for shared_state in self.store.get_shared_states().await.map_err(storage_error)? {
            reserved.insert(shared_state.content_id);
        }

        let manager = self.me.clone();
        let accessible: AccessibleIdsSupplier = Box::new(move || {
            manager
                .upgrade()
                .map(|manager| manager.live_content_ids())
                .unwrap_or_default()
        });
        Ok(self.store.trigger_content_gc(reserved, accessible))
    }

    /// Collection task for actions whose content is gone.
    pub async fn action_gc_task(&self) -> Result<GcTask, SessionError> {
        let actions = self
            .store
            .get_all_dismiss_actions()
            .await
            .map_err(storage_error)?;
        let valid_ids = self.store.get_all_content_ids().await.map_err(storage_error)?;
        Ok(self.store.trigger_action_gc(actions, valid_ids))
    }

    /// Drops every session and all non-action content.
    pub async fn reset(&self) -> Result<(), SessionError> {
        self.invalidate_all();
        if self.store.is_ephemeral() {
            self.store
                .clear_non_action_content()
                .await
                .map_err(storage_error)?;
        }
        self.store.reset().await.map_err(storage_error)
    }
}

#[async_trait]
impl HeadSink for FeedSessionManager {
    async fn apply_refresh(&self, result: &RequestResult, origin_session: Option<&str>) {
        let operations = match result {
            Ok(operations) => operations,
            Err(err) => {
                warn!("session: refresh failed: {err}");
                for provider in self.live_providers() {
                    if provider.get_root_feature().is_none() {
                        provider.raise_error(ModelError::no_content());
                    }
                }
                return;
            }
        };

        if !self.commit_head(operations).await.is_success() {
            self.handle_storage_failure();
            if !self.commit_head(operations).await.is_success() {
                error!("session: refresh could not be applied to head");
                return;
            }
        }
        info!("session: head updated operations={}", operations.len());
        if operations
            .iter()
            .any(|operation| operation.structure == StreamStructure::ClearAll)
        {
            self.invalidate_sessions_except(origin_session).await;
        }
        self.scheduler.on_receive_new_content(Utc::now());
    }
}

#[async_trait]
impl SessionPersistence for FeedSessionManager {
    async fn persist(&self, session_id: &str, commit: SessionCommit) {
        let mut ok = true;
        if !commit.payloads.is_empty() {
            ok = self.store.commit_content(commit.payloads).await.is_success();
        }
        if ok && !commit.semantic_properties.is_empty() {
            ok = self
                .store
                .commit_semantic_properties(commit.semantic_properties)
                .await
                .is_success();
        }
        if ok && !commit.structures.is_empty() {
            ok = self
                .store
                .commit_session(session_id, commit.structures)
                .await
                .is_success();
        }
        if !ok {
            error!("session: persisting session={session_id} failed");
            self.handle_storage_failure();
        }
    }
}

struct FailoverListener {
    manager: Weak<FeedSessionManager>,
}

impl StoreListener for FailoverListener {
    fn on_switch_to_ephemeral_mode(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.invalidate_all();
        }
    }
}

#[cfg(test)]
#[path = "tests/session_manager_tests.rs"]
mod tests;
