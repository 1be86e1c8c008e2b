use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::DismissAction,
    stream::{
        PayloadWithId, SemanticPropertiesWithId, StreamPayload, StreamSharedState,
        StreamStructure,
    },
};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    gc, new_session_id, AccessibleIdsSupplier, CommitResult, ContentStore, GcOutcome, GcTask,
    HEAD_SESSION_ID,
};

#[derive(Default)]
struct EphemeralState {
    content: HashMap<String, StreamPayload>,
    semantic_properties: HashMap<String, Vec<u8>>,
    journals: HashMap<String, Vec<StreamStructure>>,
    actions: Vec<DismissAction>,
}

/// In-memory backend. Always available; nothing survives the process.
#[derive(Clone, Default)]
pub struct EphemeralStore {
    state: Arc<RwLock<EphemeralState>>,
}

impl EphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn same_instance(&self, other: &EphemeralStore) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

#[async_trait]
impl ContentStore for EphemeralStore {
    async fn get_payloads(&self, content_ids: &[String]) -> Result<Vec<PayloadWithId>> {
        let state = self.state.read().await;
        Ok(content_ids
            .iter()
            .filter_map(|id| {
                state.content.get(id).map(|payload| PayloadWithId {
                    content_id: id.clone(),
                    payload: payload.clone(),
                })
            })
            .collect())
    }

    async fn get_shared_states(&self) -> Result<Vec<StreamSharedState>> {
        let state = self.state.read().await;
        Ok(state
            .content
            .values()
            .filter_map(|payload| match payload {
                StreamPayload::SharedState(shared_state) => Some(shared_state.clone()),
                _ => None,
            })
            .collect())
    }

    async fn get_all_content_ids(&self) -> Result<Vec<String>> {
        Ok(self.state.read().await.content.keys().cloned().collect())
    }

    async fn get_stream_structures(&self, session_id: &str) -> Result<Vec<StreamStructure>> {
        let state = self.state.read().await;
        Ok(state.journals.get(session_id).cloned().unwrap_or_default())
    }

    async fn get_all_sessions(&self) -> Result<Vec<String>> {
        let state = self.state.read().await;
        Ok(state
            .journals
            .keys()
            .filter(|id| id.as_str() != HEAD_SESSION_ID)
            .cloned()
            .collect())
    }

    async fn get_semantic_properties(
        &self,
        content_ids: &[String],
    ) -> Result<Vec<SemanticPropertiesWithId>> {
        let state = self.state.read().await;
        Ok(content_ids
            .iter()
            .filter_map(|id| {
                state
                    .semantic_properties
                    .get(id)
                    .map(|semantic_data| SemanticPropertiesWithId {
                        content_id: id.clone(),
                        semantic_data: semantic_data.clone(),
                    })
            })
            .collect())
    }

    async fn get_all_dismiss_actions(&self) -> Result<Vec<DismissAction>> {
        Ok(self.state.read().await.actions.clone())
    }

    async fn create_new_session(&self) -> Result<String> {
        let session_id = new_session_id();
        self.state
            .write()
            .await
            .journals
            .insert(session_id.clone(), Vec::new());
        Ok(session_id)
    }

    async fn remove_session(&self, session_id: &str) -> Result<()> {
        if session_id == HEAD_SESSION_ID {
            anyhow::bail!("head session cannot be removed");
        }
        self.state.write().await.journals.remove(session_id);
        Ok(())
    }

    async fn clear_head(&self) -> Result<()> {
        self.state.write().await.journals.remove(HEAD_SESSION_ID);
        Ok(())
    }

    async fn commit_content(&self, payloads: Vec<PayloadWithId>) -> CommitResult {
        let mut state = self.state.write().await;
        for entry in payloads {
            state.content.insert(entry.content_id, entry.payload);
        }
        CommitResult::Success
    }

    async fn commit_session(
        &self,
        session_id: &str,
        structures: Vec<StreamStructure>,
    ) -> CommitResult {
        let mut state = self.state.write().await;
        state
            .journals
            .entry(session_id.to_string())
            .or_default()
            .extend(structures);
        CommitResult::Success
    }

    async fn commit_semantic_properties(
        &self,
        entries: Vec<SemanticPropertiesWithId>,
    ) -> CommitResult {
        let mut state = self.state.write().await;
        for entry in entries {
            state
                .semantic_properties
                .insert(entry.content_id, entry.semantic_data);
        }
        CommitResult::Success
    }

    async fn commit_actions(&self, actions: Vec<DismissAction>) -> CommitResult {
        let mut state = self.state.write().await;
        for action in actions {
            let duplicate = state.actions.iter().any(|existing| {
                existing.content_id == action.content_id
                    && existing.action_type == action.action_type
            });
            if !duplicate {
                state.actions.push(action);
            }
        }
        CommitResult::Success
    }

    fn trigger_content_gc(
        &self,
        reserved_ids: HashSet<String>,
        accessible_ids: AccessibleIdsSupplier,
    ) -> GcTask {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let accessible_ids = accessible_ids();
            let mut state = state.write().await;
            let stored: HashSet<&String> = state
                .content
                .keys()
                .chain(state.semantic_properties.keys())
                .collect();
            let doomed = gc::collectable_content_ids(stored, &reserved_ids, &accessible_ids);
            for id in &doomed {
                state.content.remove(id);
                state.semantic_properties.remove(id);
            }
            debug!("ephemeral: content gc removed={}", doomed.len());
            Ok(GcOutcome {
                removed: doomed.len(),
            })
        })
    }

    fn trigger_action_gc(&self, actions: Vec<DismissAction>, valid_ids: Vec<String>) -> GcTask {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let doomed = gc::invalid_actions(&actions, &valid_ids);
            let mut state = state.write().await;
            let before = state.actions.len();
            state.actions.retain(|action| {
                !doomed.iter().any(|gone| {
                    gone.content_id == action.content_id && gone.action_type == action.action_type
                })
            });
            Ok(GcOutcome {
                removed: before - state.actions.len(),
            })
        })
    }

    async fn clear_non_action_content(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.content.clear();
        state.journals.clear();
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        *self.state.write().await = EphemeralState::default();
        Ok(())
    }
}
