//! Storage for feed content, session journals and local actions.
//!
//! Two interchangeable backends implement [`ContentStore`]: [`DurableStore`]
//! (SQLite) and [`EphemeralStore`] (in-memory). [`FeedStore`] fronts both and
//! owns the one-way fail-over between them.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use shared::{
    domain::{ActionType, DismissAction},
    stream::{
        PayloadWithId, SemanticPropertiesWithId, StreamPayload, StreamSharedState,
        StreamStructure,
    },
};

mod durable;
mod ephemeral;
mod facade;
pub mod gc;

pub use durable::{prepare_database_url, DurableStore};
pub use ephemeral::EphemeralStore;
pub use facade::{BackendKind, FeedStore, StoreDump, StoreListener};

/// Journal id of the canonical root session.
pub const HEAD_SESSION_ID: &str = "$HEAD";
const SESSION_ID_PREFIX: &str = "_session:";

pub(crate) fn new_session_id() -> String {
    format!("{SESSION_ID_PREFIX}{}", uuid::Uuid::new_v4())
}

/// Outcome of a mutation commit. Commits never apply partially.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    Success,
    Failure,
}

impl CommitResult {
    pub fn is_success(self) -> bool {
        self == CommitResult::Success
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcOutcome {
    pub removed: usize,
}

/// Deferred collection work. Nothing is deleted until the caller awaits it.
pub type GcTask = BoxFuture<'static, Result<GcOutcome>>;

/// Evaluated when a [`GcTask`] runs, so it reflects the sessions live at
/// that point rather than when the task was created.
pub type AccessibleIdsSupplier = Box<dyn FnOnce() -> HashSet<String> + Send>;

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get_payloads(&self, content_ids: &[String]) -> Result<Vec<PayloadWithId>>;
    async fn get_shared_states(&self) -> Result<Vec<StreamSharedState>>;
    async fn get_all_content_ids(&self) -> Result<Vec<String>>;
    async fn get_stream_structures(&self, session_id: &str) -> Result<Vec<StreamStructure>>;
    /// All sessions other than head.
    async fn get_all_sessions(&self) -> Result<Vec<String>>;
    async fn get_semantic_properties(
        &self,
        content_ids: &[String],
    ) -> Result<Vec<SemanticPropertiesWithId>>;
    async fn get_all_dismiss_actions(&self) -> Result<Vec<DismissAction>>;
    async fn create_new_session(&self) -> Result<String>;

    fn head_session(&self) -> &'static str {
        HEAD_SESSION_ID
    }

    async fn remove_session(&self, session_id: &str) -> Result<()>;
    async fn clear_head(&self) -> Result<()>;

    async fn commit_content(&self, payloads: Vec<PayloadWithId>) -> CommitResult;
    async fn commit_session(
        &self,
        session_id: &str,
        structures: Vec<StreamStructure>,
    ) -> CommitResult;
    async fn commit_semantic_properties(
        &self,
        entries: Vec<SemanticPropertiesWithId>,
    ) -> CommitResult;
    async fn commit_actions(&self, actions: Vec<DismissAction>) -> CommitResult;

    fn trigger_content_gc(
        &self,
        reserved_ids: HashSet<String>,
        accessible_ids: AccessibleIdsSupplier,
    ) -> GcTask;
    fn trigger_action_gc(&self, actions: Vec<DismissAction>, valid_ids: Vec<String>) -> GcTask;

    /// Removes sessions, journals and content, keeping actions and their
    /// semantic properties.
    async fn clear_non_action_content(&self) -> Result<()>;
    async fn clear_all(&self) -> Result<()>;
}

/// Mutation builders available on every store, including the façade.
pub trait EditStore: ContentStore {
    fn edit_content(&self) -> ContentMutation<'_, Self> {
        ContentMutation {
            store: self,
            payloads: Vec::new(),
        }
    }

    fn edit_session(&self, session_id: impl Into<String>) -> SessionMutation<'_, Self> {
        SessionMutation {
            store: self,
            session_id: session_id.into(),
            structures: Vec::new(),
        }
    }

    fn edit_semantic_properties(&self) -> SemanticPropertiesMutation<'_, Self> {
        SemanticPropertiesMutation {
            store: self,
            entries: Vec::new(),
        }
    }

    fn edit_actions(&self) -> LocalActionMutation<'_, Self> {
        LocalActionMutation {
            store: self,
            actions: Vec::new(),
        }
    }
}

impl<T: ContentStore + ?Sized> EditStore for T {}

pub struct ContentMutation<'a, S: ContentStore + ?Sized> {
    store: &'a S,
    payloads: Vec<PayloadWithId>,
}

impl<S: ContentStore + ?Sized> ContentMutation<'_, S> {
    pub fn add(mut self, content_id: impl Into<String>, payload: StreamPayload) -> Self {
        self.payloads.push(PayloadWithId {
            content_id: content_id.into(),
            payload,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub async fn commit(self) -> CommitResult {
        self.store.commit_content(self.payloads).await
    }
}

pub struct SessionMutation<'a, S: ContentStore + ?Sized> {
    store: &'a S,
    session_id: String,
    structures: Vec<StreamStructure>,
}

impl<S: ContentStore + ?Sized> SessionMutation<'_, S> {
    pub fn add(mut self, structure: StreamStructure) -> Self {
        self.structures.push(structure);
        self
    }

    pub fn add_all(mut self, structures: impl IntoIterator<Item = StreamStructure>) -> Self {
        self.structures.extend(structures);
        self
    }

    pub async fn commit(self) -> CommitResult {
        self.store
            .commit_session(&self.session_id, self.structures)
            .await
    }
}

pub struct SemanticPropertiesMutation<'a, S: ContentStore + ?Sized> {
    store: &'a S,
    entries: Vec<SemanticPropertiesWithId>,
}

impl<S: ContentStore + ?Sized> SemanticPropertiesMutation<'_, S> {
    pub fn add(mut self, content_id: impl Into<String>, semantic_data: Vec<u8>) -> Self {
        self.entries.push(SemanticPropertiesWithId {
            content_id: content_id.into(),
            semantic_data,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn commit(self) -> CommitResult {
        self.store.commit_semantic_properties(self.entries).await
    }
}

pub struct LocalActionMutation<'a, S: ContentStore + ?Sized> {
    store: &'a S,
    actions: Vec<DismissAction>,
}

impl<S: ContentStore + ?Sized> LocalActionMutation<'_, S> {
    pub fn add(mut self, action_type: ActionType, content_id: impl Into<String>) -> Self {
        let mut action = DismissAction::dismiss(content_id);
        action.action_type = action_type;
        self.actions.push(action);
        self
    }

    pub fn add_action(mut self, action: DismissAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub async fn commit(self) -> CommitResult {
        self.store.commit_actions(self.actions).await
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
