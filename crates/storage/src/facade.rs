use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
};

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::DismissAction,
    stream::{PayloadWithId, SemanticPropertiesWithId, StreamSharedState, StreamStructure},
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{
    AccessibleIdsSupplier, CommitResult, ContentStore, DurableStore, EphemeralStore, GcTask,
};

/// Notified when the façade abandons durable storage.
pub trait StoreListener: Send + Sync {
    fn on_switch_to_ephemeral_mode(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Durable,
    Ephemeral,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDump {
    pub backend: BackendKind,
    pub sessions: usize,
    pub content: usize,
    pub actions: usize,
}

#[derive(Clone)]
enum ActiveBackend {
    Durable(DurableStore),
    Ephemeral(EphemeralStore),
}

impl ActiveBackend {
    fn store(&self) -> &dyn ContentStore {
        match self {
            ActiveBackend::Durable(store) => store,
            ActiveBackend::Ephemeral(store) => store,
        }
    }
}

/// Single entry point over the durable and ephemeral backends.
///
/// Starts on durable storage. [`FeedStore::switch_to_ephemeral_mode`] moves
/// to a fresh in-memory backend for the rest of the process lifetime.
pub struct FeedStore {
    durable: DurableStore,
    active: RwLock<ActiveBackend>,
    switched: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn StoreListener>>>,
}

impl FeedStore {
    pub fn new(durable: DurableStore) -> Self {
        Self {
            active: RwLock::new(ActiveBackend::Durable(durable.clone())),
            durable,
            switched: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub async fn open(database_url: &str) -> Result<Self> {
        Ok(Self::new(DurableStore::new(database_url).await?))
    }

    fn backend(&self) -> ActiveBackend {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn backend_kind(&self) -> BackendKind {
        match self.backend() {
            ActiveBackend::Durable(_) => BackendKind::Durable,
            ActiveBackend::Ephemeral(_) => BackendKind::Ephemeral,
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.backend_kind() == BackendKind::Ephemeral
    }

    pub fn durable(&self) -> &DurableStore {
        &self.durable
    }

    pub fn ephemeral(&self) -> Option<EphemeralStore> {
        match self.backend() {
            ActiveBackend::Ephemeral(store) => Some(store),
            ActiveBackend::Durable(_) => None,
        }
    }

    pub fn register_listener(&self, listener: Arc<dyn StoreListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn unregister_listener(&self, listener: &Arc<dyn StoreListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    /// Swaps to a fresh ephemeral backend. Only the swap is synchronous; the
    /// returned task wipes durable sessions and content in the background.
    ///
    /// Must run inside a tokio runtime and off the callback context. Calls
    /// after the first are no-ops and return `None`.
    pub fn switch_to_ephemeral_mode(&self) -> Option<JoinHandle<()>> {
        if self.switched.swap(true, Ordering::SeqCst) {
            info!("storage: already in ephemeral mode");
            return None;
        }

        *self.active.write().unwrap_or_else(PoisonError::into_inner) =
            ActiveBackend::Ephemeral(EphemeralStore::new());
        error!("storage: durable storage unsafe, switched to ephemeral mode");

        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.on_switch_to_ephemeral_mode();
        }

        let durable = self.durable.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = durable.clear_non_action_content().await {
                warn!("storage: targeted durable wipe failed, wiping everything: {err:#}");
                if let Err(err) = durable.clear_all().await {
                    error!("storage: full durable wipe failed: {err:#}");
                }
            }
        }))
    }

    /// Best-effort copy of ephemeral actions and their semantic properties
    /// back into durable storage. Failures are logged and dropped.
    pub async fn on_entered_background(&self) {
        let Some(ephemeral) = self.ephemeral() else {
            return;
        };

        let actions = match ephemeral.get_all_dismiss_actions().await {
            Ok(actions) => actions,
            Err(err) => {
                error!("storage: reading ephemeral actions failed: {err:#}");
                return;
            }
        };
        if actions.is_empty() {
            return;
        }
        let content_ids: Vec<String> = actions
            .iter()
            .map(|action| action.content_id.clone())
            .collect();
        let semantic_properties = match ephemeral.get_semantic_properties(&content_ids).await {
            Ok(entries) => entries,
            Err(err) => {
                error!("storage: reading ephemeral semantic properties failed: {err:#}");
                return;
            }
        };

        let action_count = actions.len();
        if !self.durable.commit_actions(actions).await.is_success() {
            error!("storage: flushing ephemeral actions to durable storage failed");
            return;
        }
        if !self
            .durable
            .commit_semantic_properties(semantic_properties)
            .await
            .is_success()
        {
            error!("storage: flushing ephemeral semantic properties to durable storage failed");
            return;
        }
        info!("storage: flushed ephemeral actions count={action_count}");
    }

    /// Clears durable sessions and content without changing modes.
    pub async fn reset(&self) -> Result<()> {
        self.durable.clear_non_action_content().await
    }

    pub async fn dump(&self) -> Result<StoreDump> {
        let backend = self.backend();
        let store = backend.store();
        Ok(StoreDump {
            backend: self.backend_kind(),
            sessions: store.get_all_sessions().await?.len(),
            content: store.get_all_content_ids().await?.len(),
            actions: store.get_all_dismiss_actions().await?.len(),
        })
    }
}

#[async_trait]
impl ContentStore for FeedStore {
    async fn get_payloads(&self, content_ids: &[String]) -> Result<Vec<PayloadWithId>> {
        self.backend().store().get_payloads(content_ids).await
    }

    async fn get_shared_states(&self) -> Result<Vec<StreamSharedState>> {
        self.backend().store().get_shared_states().await
    }

    async fn get_all_content_ids(&self) -> Result<Vec<String>> {
        self.backend().store().get_all_content_ids().await
    }

    async fn get_stream_structures(&self, session_id: &str) -> Result<Vec<StreamStructure>> {
        self.backend().store().get_stream_structures(session_id).await
    }

    async fn get_all_sessions(&self) -> Result<Vec<String>> {
        self.backend().store().get_all_sessions().await
    }

    async fn get_semantic_properties(
        &self,
        content_ids: &[String],
    ) -> Result<Vec<SemanticPropertiesWithId>> {
        self.backend()
            .store()
            .get_semantic_properties(content_ids)
            .await
    }

    async fn get_all_dismiss_actions(&self) -> Result<Vec<DismissAction>> {
        self.backend().store().get_all_dismiss_actions().await
    }

    async fn create_new_session(&self) -> Result<String> {
        self.backend().store().create_new_session().await
    }

    async fn remove_session(&self, session_id: &str) -> Result<()> {
        self.backend().store().remove_session(session_id).await
    }

    async fn clear_head(&self) -> Result<()> {
        self.backend().store().clear_head().await
    }

    async fn commit_content(&self, payloads: Vec<PayloadWithId>) -> CommitResult {
        self.backend().store().commit_content(payloads).await
    }

    async fn commit_session(
        &self,
        session_id: &str,
        structures: Vec<StreamStructure>,
    ) -> CommitResult {
        self.backend()
            .store()
            .commit_session(session_id, structures)
            .await
    }

    async fn commit_semantic_properties(
        &self,
        entries: Vec<SemanticPropertiesWithId>,
    ) -> CommitResult {
        self.backend()
            .store()
            .commit_semantic_properties(entries)
            .await
    }

    async fn commit_actions(&self, actions: Vec<DismissAction>) -> CommitResult {
        self.backend().store().commit_actions(actions).await
    }

    fn trigger_content_gc(
        &self,
        reserved_ids: HashSet<String>,
        accessible_ids: AccessibleIdsSupplier,
    ) -> GcTask {
        self.backend()
            .store()
            .trigger_content_gc(reserved_ids, accessible_ids)
    }

    fn trigger_action_gc(&self, actions: Vec<DismissAction>, valid_ids: Vec<String>) -> GcTask {
        self.backend().store().trigger_action_gc(actions, valid_ids)
    }

    async fn clear_non_action_content(&self) -> Result<()> {
        self.backend().store().clear_non_action_content().await
    }

    async fn clear_all(&self) -> Result<()> {
        self.backend().store().clear_all().await
    }
}

#[cfg(test)]
#[path = "tests/facade_tests.rs"]
mod tests;
