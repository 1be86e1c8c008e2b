//! Builds feed requests, sends them through the task queue and turns the
//! responses into canonical operations.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock, Weak},
};

use async_trait::async_trait;
use prost::Message;
use protocol_adapter::FeedProtocolAdapter;
use shared::{
    domain::{ActionWithSemantics, ClientInfo, ContentId},
    protocol::{
        FeedRequest, FeedResponse, WireActionReference, WireClientInfo, WireDismissTables,
        WireRequestReason,
    },
    stream::{StreamDataOperation, StreamToken},
};
use storage::ContentStore;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    callbacks::CallbackContext,
    error::{DecodeError, RequestError},
    network::{HttpRequest, NetworkClient},
    scheduler::SchedulerApi,
    task_queue::{TaskQueue, TaskType},
};

pub type RequestResult = Result<Vec<StreamDataOperation>, RequestError>;

/// Receives the outcome of one request on the callback context.
pub type ResponseConsumer = Box<dyn FnOnce(RequestResult) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestReason {
    ZeroState,
    HostRequested,
    ManualRefresh,
    ScheduledRefresh,
    LoadMore,
}

impl RequestReason {
    fn wire(self) -> WireRequestReason {
        match self {
            RequestReason::ZeroState => WireRequestReason::ZeroState,
            RequestReason::HostRequested => WireRequestReason::HostRequested,
            RequestReason::ManualRefresh => WireRequestReason::ManualRefresh,
            RequestReason::ScheduledRefresh => WireRequestReason::ScheduledRefresh,
            RequestReason::LoadMore => WireRequestReason::LoadMore,
        }
    }
}

pub trait RequestManager: Send + Sync {
    fn load_more(&self, token: StreamToken, consumer: ResponseConsumer);

    /// Invalidates head until the refresh has been applied. The consumer, if
    /// any, receives the result after head has been updated.
    ///
    /// `origin_session` names the session that asked for the refresh and
    /// replaces its own tree from the consumer.
    fn trigger_refresh(
        &self,
        reason: RequestReason,
        origin_session: Option<String>,
        consumer: Option<ResponseConsumer>,
    );
}

/// Applies refresh results to head. Runs inside the head-invalidating task,
/// before head is reported valid again.
#[async_trait]
pub trait HeadSink: Send + Sync {
    async fn apply_refresh(&self, result: &RequestResult, origin_session: Option<&str>);
}

/// Builds an outbound request. Dismiss action fields are interned into
/// parallel tables so repeated values are sent once.
pub fn build_request(
    page_token: Option<&StreamToken>,
    reason: RequestReason,
    client: &ClientInfo,
    pending_actions: &[ActionWithSemantics],
) -> FeedRequest {
    let mut tables = WireDismissTables::default();
    let mut id_index: HashMap<i64, u32> = HashMap::new();
    let mut table_index: HashMap<String, u32> = HashMap::new();
    let mut domain_index: HashMap<String, u32> = HashMap::new();
    let mut semantic_index: HashMap<Vec<u8>, u32> = HashMap::new();

    for pending in pending_actions {
        let content_id = match pending.action.content_id.parse::<ContentId>() {
            Ok(content_id) => content_id,
            Err(err) => {
                error!("request: skipping dismiss action with malformed content id: {err}");
                continue;
            }
        };

        let id_slot = intern(&mut id_index, &mut tables.ids, content_id.id);
        let table_slot = intern(&mut table_index, &mut tables.tables, content_id.table);
        let domain_slot = intern(
            &mut domain_index,
            &mut tables.content_domains,
            content_id.content_domain,
        );
        let semantic_slot = pending.semantic_properties.as_ref().map(|bytes| {
            intern(
                &mut semantic_index,
                &mut tables.semantic_properties,
                bytes.clone(),
            )
        });

        tables.actions.push(WireActionReference {
            action_type: pending.action.action_type.as_str().to_string(),
            id_index: id_slot,
            table_index: table_slot,
            content_domain_index: domain_slot,
            semantic_properties_index: semantic_slot,
        });
    }

    FeedRequest {
        page_token: page_token.map(|token| token.next_page_token.clone()),
        reason: reason.wire() as i32,
        client_info: Some(WireClientInfo {
            locale: client.locale.clone(),
            platform: client.platform.clone(),
            app_version: client.app_version.clone(),
        }),
        dismissed: if tables.actions.is_empty() {
            None
        } else {
            Some(tables)
        },
    }
}

fn intern<K>(index: &mut HashMap<K, u32>, values: &mut Vec<K>, value: K) -> u32
where
    K: std::hash::Hash + Eq + Clone,
{
    if let Some(slot) = index.get(&value) {
        return *slot;
    }
    let slot = values.len() as u32;
    values.push(value.clone());
    index.insert(value, slot);
    slot
}

/// Decodes a response body. With `length_prefixed`, the body starts with a
/// varint byte count of the message that follows.
pub fn decode_response(bytes: &[u8], length_prefixed: bool) -> Result<FeedResponse, DecodeError> {
    if !length_prefixed {
        return FeedResponse::decode(bytes).map_err(|err| DecodeError::Message(err.to_string()));
    }
    if bytes.is_empty() {
        return Err(DecodeError::EmptyBuffer);
    }

    let mut buf = bytes;
    let declared = prost::decode_length_delimiter(&mut buf)
        .map_err(|err| DecodeError::LengthPrefix(err.to_string()))?;
    if declared > buf.len() {
        return Err(DecodeError::Truncated {
            declared,
            available: buf.len(),
        });
    }
    FeedResponse::decode(&buf[..declared]).map_err(|err| DecodeError::Message(err.to_string()))
}

pub struct RequestManagerConfig {
    pub server_url: Url,
    pub client_info: ClientInfo,
    pub length_prefixed_responses: bool,
}

struct RequestPipeline {
    config: RequestManagerConfig,
    network: Arc<dyn NetworkClient>,
    adapter: Arc<FeedProtocolAdapter>,
    scheduler: Arc<dyn SchedulerApi>,
    store: Arc<dyn ContentStore>,
}

impl RequestPipeline {
    async fn pending_actions(&self) -> Result<Vec<ActionWithSemantics>, RequestError> {
        let actions = self
            .store
            .get_all_dismiss_actions()
            .await
            .map_err(|err| RequestError::Store(format!("{err:#}")))?;
        if actions.is_empty() {
            return Ok(Vec::new());
        }
        let content_ids: Vec<String> = actions
            .iter()
            .map(|action| action.content_id.clone())
            .collect();
        let semantic: HashMap<String, Vec<u8>> = self
            .store
            .get_semantic_properties(&content_ids)
            .await
            .map_err(|err| RequestError::Store(format!("{err:#}")))?
            .into_iter()
            .map(|entry| (entry.content_id, entry.semantic_data))
            .collect();

        Ok(actions
            .into_iter()
            .map(|action| ActionWithSemantics {
                semantic_properties: semantic.get(&action.content_id).cloned(),
                action,
            })
            .collect())
    }

    async fn fetch(
        &self,
        page_token: Option<&StreamToken>,
        reason: RequestReason,
    ) -> RequestResult {
        let pending = self.pending_actions().await?;
        let request = build_request(page_token, reason, &self.config.client_info, &pending);
        debug!(
            "request: sending reason={reason:?} continuation={} dismissed={}",
            page_token.is_some(),
            pending.len()
        );

        let response = self
            .network
            .send(HttpRequest {
                url: self.config.server_url.clone(),
                body: request.encode_to_vec(),
            })
            .await
            .map_err(|err| {
                warn!("request: transport failure reason={reason:?}: {err:#}");
                RequestError::Transport(format!("{err:#}"))
            })?;

        if !response.is_success() {
            warn!(
                "request: server status={} reason={reason:?}",
                response.status
            );
            // Only fresh requests are reported to the scheduler.
            if page_token.is_none() {
                self.scheduler.on_request_error(response.status);
            }
            return Err(RequestError::Http {
                status: response.status,
            });
        }

        let decoded = decode_response(&response.body, self.config.length_prefixed_responses)
            .map_err(|err| {
                error!("request: undecodable response reason={reason:?}: {err}");
                RequestError::from(err)
            })?;
        let operations = self.adapter.create_model(&decoded)?;
        info!(
            "request: received operations={} reason={reason:?}",
            operations.len()
        );
        Ok(operations)
    }
}

pub struct FeedRequestManager {
    pipeline: Arc<RequestPipeline>,
    queue: Arc<TaskQueue>,
    callbacks: CallbackContext,
    head_sink: RwLock<Option<Weak<dyn HeadSink>>>,
}

impl FeedRequestManager {
    pub fn new(
        config: RequestManagerConfig,
        network: Arc<dyn NetworkClient>,
        adapter: Arc<FeedProtocolAdapter>,
        scheduler: Arc<dyn SchedulerApi>,
        store: Arc<dyn ContentStore>,
        queue: Arc<TaskQueue>,
        callbacks: CallbackContext,
    ) -> Self {
        Self {
            pipeline: Arc::new(RequestPipeline {
                config,
                network,
                adapter,
                scheduler,
                store,
            }),
            queue,
            callbacks,
            head_sink: RwLock::new(None),
        }
    }

    pub fn set_head_sink(&self, sink: &Arc<dyn HeadSink>) {
        *self
            .head_sink
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(sink));
    }

    fn head_sink(&self) -> Option<Arc<dyn HeadSink>> {
        self.head_sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn reject(&self, consumer: Option<ResponseConsumer>, err: RequestError) {
        if let Some(consumer) = consumer {
            self.callbacks.post(move || consumer(Err(err)));
        }
    }
}

type ConsumerSlot = Arc<Mutex<Option<ResponseConsumer>>>;

fn take_consumer(slot: &ConsumerSlot) -> Option<ResponseConsumer> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

impl RequestManager for FeedRequestManager {
    fn load_more(&self, token: StreamToken, consumer: ResponseConsumer) {
        let pipeline = Arc::clone(&self.pipeline);
        let callbacks = self.callbacks.clone();
        let slot: ConsumerSlot = Arc::new(Mutex::new(Some(consumer)));
        let task_slot = Arc::clone(&slot);

        let enqueued = self.queue.execute(TaskType::Immediate, "load_more", async move {
            let result = pipeline.fetch(Some(&token), RequestReason::LoadMore).await;
            if let Some(consumer) = take_consumer(&task_slot) {
                callbacks.post(move || consumer(result));
            }
        });
        if let Err(err) = enqueued {
            warn!("request: load_more not queued: {err}");
            self.reject(take_consumer(&slot), err.into());
        }
    }

    fn trigger_refresh(
        &self,
        reason: RequestReason,
        origin_session: Option<String>,
        consumer: Option<ResponseConsumer>,
    ) {
        let pipeline = Arc::clone(&self.pipeline);
        let callbacks = self.callbacks.clone();
        let queue = Arc::clone(&self.queue);
        let sink = self.head_sink();
        let slot: ConsumerSlot = Arc::new(Mutex::new(consumer));
        let task_slot = Arc::clone(&slot);

        let enqueued = self
            .queue
            .execute(TaskType::HeadInvalidate, "trigger_refresh", async move {
                let result = pipeline.fetch(None, reason).await;
                match &sink {
                    Some(sink) => sink.apply_refresh(&result, origin_session.as_deref()).await,
                    None => debug!("request: no head sink registered, refresh result not applied"),
                }
                queue.reset_head();
                if let Some(consumer) = take_consumer(&task_slot) {
                    callbacks.post(move || consumer(result));
                }
            });
        if let Err(err) = enqueued {
            warn!("request: refresh not queued reason={reason:?}: {err}");
            self.reject(take_consumer(&slot), err.into());
        }
    }
}

#[cfg(test)]
#[path = "tests/request_manager_tests.rs"]
mod tests;
