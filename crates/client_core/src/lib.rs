//! Client side of the content feed: requests, sessions and the engine that
//! wires them to storage.

use std::sync::Arc;

use anyhow::{Context, Result};
use protocol_adapter::{AdapterStats, FeedProtocolAdapter};
use storage::{prepare_database_url, ContentStore, FeedStore, GcTask, StoreDump};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub mod callbacks;
pub mod config;
pub mod error;
pub mod model;
pub mod network;
pub mod request_manager;
pub mod scheduler;
pub mod session_manager;
pub mod task_queue;

pub use callbacks::{CallbackContext, CallbackPump};
pub use config::{load_settings, EngineSettings};
pub use error::{DecodeError, RequestError, SessionError};
pub use model::{
    FeedModelProvider, ModelChange, ModelChild, ModelFeature, ModelProviderObserver,
    ProviderState, RemoveTracking, TrackRemovals, ViewDepthProvider,
};
pub use network::{NetworkClient, ReqwestNetworkClient};
pub use request_manager::{FeedRequestManager, RequestManager, RequestReason};
pub use scheduler::{NoopScheduler, SchedulerApi};
pub use session_manager::FeedSessionManager;
pub use task_queue::{QueueStats, TaskQueue};

use request_manager::{HeadSink, RequestManagerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    EnteredBackground,
    EnteredForeground,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub content_removed: usize,
    pub actions_removed: usize,
}

/// One running feed engine. Hosts construct it explicitly and pass it down;
/// there is no process-wide instance.
pub struct FeedEngine {
    settings: EngineSettings,
    store: Arc<FeedStore>,
    adapter: Arc<FeedProtocolAdapter>,
    queue: Arc<TaskQueue>,
    request_manager: Arc<FeedRequestManager>,
    session_manager: Arc<FeedSessionManager>,
    dispatcher: JoinHandle<()>,
}

impl FeedEngine {
    pub async fn start(
        settings: EngineSettings,
        callbacks: CallbackContext,
        scheduler: Arc<dyn SchedulerApi>,
    ) -> Result<Self> {
        let database_url = prepare_database_url(&settings.database_url)?;
        let store = FeedStore::open(&database_url)
            .await
            .context("failed to open feed store")?;
        let network = ReqwestNetworkClient::new(settings.request_timeout())?;
        Self::start_with_dependencies(
            settings,
            Arc::new(store),
            Arc::new(network),
            callbacks,
            scheduler,
        )
        .await
    }

    pub async fn start_with_dependencies(
        settings: EngineSettings,
        store: Arc<FeedStore>,
        network: Arc<dyn NetworkClient>,
        callbacks: CallbackContext,
        scheduler: Arc<dyn SchedulerApi>,
    ) -> Result<Self> {
        let server_url = settings.validated_server_url()?;
        let (queue, dispatcher) = TaskQueue::start(settings.queue_capacity);
        let adapter = Arc::new(FeedProtocolAdapter::default());
        let content_store: Arc<dyn ContentStore> = store.clone();

        let request_manager = Arc::new(FeedRequestManager::new(
            RequestManagerConfig {
                server_url,
                client_info: settings.client_info(),
                length_prefixed_responses: settings.length_prefixed_responses,
            },
            network,
            Arc::clone(&adapter),
            Arc::clone(&scheduler),
            content_store,
            Arc::clone(&queue),
            callbacks.clone(),
        ));
        let session_manager = FeedSessionManager::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            callbacks,
            request_manager.clone(),
            scheduler,
        );
        let head_sink: Arc<dyn HeadSink> = session_manager.clone();
        request_manager.set_head_sink(&head_sink);

        let head_size = session_manager.initialize().await?;
        if head_size == 0 {
            info!("engine: head is empty, requesting zero state");
            request_manager.trigger_refresh(RequestReason::ZeroState, None, None);
        }
        info!(
            "engine: started backend={:?} head_nodes={head_size}",
            store.backend_kind()
        );

        Ok(Self {
            settings,
            store,
            adapter,
            queue,
            request_manager,
            session_manager,
            dispatcher,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<FeedStore> {
        &self.store
    }

    pub fn request_manager(&self) -> &Arc<FeedRequestManager> {
        &self.request_manager
    }

    pub fn session_manager(&self) -> &Arc<FeedSessionManager> {
        &self.session_manager
    }

    pub async fn create_model_provider(
        &self,
        view_depth: Option<Arc<dyn ViewDepthProvider>>,
        observer: Option<Arc<dyn ModelProviderObserver>>,
    ) -> Result<Arc<FeedModelProvider>, SessionError> {
        self.session_manager
            .create_model_provider(view_depth, observer)
            .await
    }

    pub fn trigger_refresh(&self, reason: RequestReason) {
        self.request_manager.trigger_refresh(reason, None, None);
    }

    pub async fn on_lifecycle_event(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::EnteredBackground => self.store.on_entered_background().await,
            LifecycleEvent::EnteredForeground => debug!("engine: entered foreground"),
        }
    }

    pub async fn dismiss(
        &self,
        content_id: &str,
        semantic_properties: Option<Vec<u8>>,
    ) -> Result<(), SessionError> {
        self.session_manager
            .record_dismiss(content_id, semantic_properties)
            .await
    }

    pub async fn content_gc_task(&self) -> Result<GcTask, SessionError> {
        self.session_manager.content_gc_task().await
    }

    pub async fn action_gc_task(&self) -> Result<GcTask, SessionError> {
        self.session_manager.action_gc_task().await
    }

    /// Builds and immediately runs both collection tasks.
    pub async fn run_gc(&self) -> Result<GcReport> {
        let content = self.content_gc_task().await?.await?;
        let actions = self.action_gc_task().await?.await?;
        info!(
            "engine: gc removed content={} actions={}",
            content.removed, actions.removed
        );
        Ok(GcReport {
            content_removed: content.removed,
            actions_removed: actions.removed,
        })
    }

    pub async fn reset(&self) -> Result<(), SessionError> {
        self.session_manager.reset().await
    }

    pub async fn dump(&self) -> Result<StoreDump> {
        self.store.dump().await
    }

    pub fn adapter_stats(&self) -> AdapterStats {
        self.adapter.stats()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }
}

impl Drop for FeedEngine {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
