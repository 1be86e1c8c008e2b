use super::*;
use crate::{
    callbacks::CallbackPump,
    error::RequestError,
    model::{ModelChange, ProviderState},
    request_manager::{RequestReason, ResponseConsumer},
    scheduler::NoopScheduler,
    task_queue::TaskType,
};
use shared::stream::{StreamFeature, StreamToken};
use std::time::Duration;

struct NoopRequests;

impl RequestManager for NoopRequests {
    fn load_more(&self, _token: StreamToken, _consumer: ResponseConsumer) {}

    fn trigger_refresh(
        &self,
        _reason: RequestReason,
        _origin_session: Option<String>,
        _consumer: Option<ResponseConsumer>,
    ) {
    }
}

struct LogObserver {
    log: Arc<Mutex<Vec<String>>>,
}

impl ModelProviderObserver for LogObserver {
    fn on_session_start(&self) {
        self.log.lock().expect("lock").push("start".into());
    }

    fn on_session_finished(&self) {
        self.log.lock().expect("lock").push("finished".into());
    }

    fn on_error(&self, error: &ModelError) {
        self.log
            .lock()
            .expect("lock")
            .push(format!("error {:?}", error.kind));
    }

    fn on_change(&self, _change: &ModelChange) {
        self.log.lock().expect("lock").push("change".into());
    }
}

struct Fixture {
    manager: Arc<FeedSessionManager>,
    store: Arc<FeedStore>,
    queue: Arc<TaskQueue>,
    pump: CallbackPump,
    log: Arc<Mutex<Vec<String>>>,
}

impl Fixture {
    fn observer(&self) -> Arc<dyn ModelProviderObserver> {
        Arc::new(LogObserver {
            log: Arc::clone(&self.log),
        })
    }

    fn drain_log(&mut self) -> Vec<String> {
        self.pump.run_pending();
        std::mem::take(&mut *self.log.lock().expect("lock"))
    }
}

async fn fixture() -> Fixture {
    let store = Arc::new(FeedStore::open("sqlite::memory:").await.expect("store"));
    let (queue, _dispatcher) = TaskQueue::start(8);
    let (callbacks, pump) = CallbackContext::manual();
    let manager = FeedSessionManager::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        callbacks,
        Arc::new(NoopRequests),
        Arc::new(NoopScheduler),
    );
    Fixture {
        manager,
        store,
        queue,
        pump,
        log: Arc::new(Mutex::new(Vec::new())),
    }
}

fn feature_op(id: &str, parent: Option<&str>) -> StreamDataOperation {
    StreamDataOperation::update_or_append(
        id,
        parent.map(str::to_string),
        StreamPayload::Feature(StreamFeature {
            content: id.as_bytes().to_vec(),
            response_created_ms: None,
        }),
    )
}

fn refresh_operations() -> Vec<StreamDataOperation> {
    vec![
        StreamDataOperation::clear_all(),
        feature_op("t::d::1", None),
        feature_op("t::d::2", Some("t::d::1")),
        StreamDataOperation::update_or_append(
            "t::d::3",
            Some("t::d::1".into()),
            StreamPayload::Token(StreamToken {
                parent_id: Some("t::d::1".into()),
                next_page_token: b"next".to_vec(),
            }),
        ),
        StreamDataOperation::update_or_append(
            "t::d::2",
            None,
            StreamPayload::SemanticData(b"sem".to_vec()),
        ),
    ]
}

#[tokio::test]
async fn refresh_lands_in_head_and_new_sessions_copy_it() {
    let mut fixture = fixture().await;
    fixture
        .manager
        .apply_refresh(&Ok(refresh_operations()), None)
        .await;

    let head = fixture
        .store
        .get_stream_structures(HEAD_SESSION_ID)
        .await
        .expect("head");
    assert_eq!(head.len(), 3);
    let semantic = fixture
        .store
        .get_semantic_properties(&["t::d::2".to_string()])
        .await
        .expect("semantic");
    assert_eq!(semantic.len(), 1);

    let provider = fixture
        .manager
        .create_model_provider(None, Some(fixture.observer()))
        .await
        .expect("provider");
    assert_eq!(fixture.drain_log(), vec!["start".to_string()]);
    assert_eq!(
        provider.get_root_feature().map(|root| root.content_id),
        Some("t::d::1".to_string())
    );
    assert_eq!(provider.get_all_root_children().len(), 2);

    let sessions = fixture.store.get_all_sessions().await.expect("sessions");
    assert_eq!(sessions, vec![provider.session_id().to_string()]);
    let copied = fixture
        .store
        .get_stream_structures(provider.session_id())
        .await
        .expect("copied journal");
    assert_eq!(copied, head);
}

#[tokio::test]
async fn second_refresh_with_clear_all_replaces_head() {
    let fixture = fixture().await;
    fixture
        .manager
        .apply_refresh(&Ok(refresh_operations()), None)
        .await;
    fixture
        .manager
        .apply_refresh(
            &Ok(vec![
                StreamDataOperation::clear_all(),
                feature_op("t::d::10", None),
            ]),
            None,
        )
        .await;

    let head = fixture
        .store
        .get_stream_structures(HEAD_SESSION_ID)
        .await
        .expect("head");
    assert_eq!(
        head,
        vec![StreamStructure::update_or_append("t::d::10", None)]
    );
}

#[tokio::test]
async fn cleared_head_finishes_live_sessions() {
    let mut fixture = fixture().await;
    fixture
        .manager
        .apply_refresh(&Ok(refresh_operations()), None)
        .await;
    let provider = fixture
        .manager
        .create_model_provider(None, Some(fixture.observer()))
        .await
        .expect("provider");
    fixture.drain_log();

    fixture
        .manager
        .apply_refresh(
            &Ok(vec![
                StreamDataOperation::clear_all(),
                feature_op("t::d::9", None),
            ]),
            None,
        )
        .await;

    assert_eq!(fixture.drain_log(), vec!["finished".to_string()]);
    assert_eq!(provider.state(), ProviderState::Invalidated);
    assert!(fixture.manager.live_sessions().is_empty());
    assert!(fixture
        .store
        .get_all_sessions()
        .await
        .expect("sessions")
        .is_empty());
}

#[tokio::test]
async fn cleared_head_spares_the_session_that_asked_for_it() {
    let mut fixture = fixture().await;
    fixture
        .manager
        .apply_refresh(&Ok(refresh_operations()), None)
        .await;
    let asking = fixture
        .manager
        .create_model_provider(None, Some(fixture.observer()))
        .await
        .expect("asking");
    let other = fixture
        .manager
        .create_model_provider(None, Some(fixture.observer()))
        .await
        .expect("other");
    fixture.drain_log();

    fixture
        .manager
        .apply_refresh(
            &Ok(vec![
                StreamDataOperation::clear_all(),
                feature_op("t::d::9", None),
            ]),
            Some(asking.session_id()),
        )
        .await;

    assert_eq!(fixture.drain_log(), vec!["finished".to_string()]);
    assert_eq!(asking.state(), ProviderState::Ready);
    assert_eq!(other.state(), ProviderState::Invalidated);
    assert_eq!(
        fixture.manager.live_sessions(),
        vec![asking.session_id().to_string()]
    );
}

#[tokio::test]
async fn refresh_without_clear_all_keeps_sessions() {
    let mut fixture = fixture().await;
    fixture
        .manager
        .apply_refresh(&Ok(refresh_operations()), None)
        .await;
    let provider = fixture
        .manager
        .create_model_provider(None, Some(fixture.observer()))
        .await
        .expect("provider");
    fixture.drain_log();

    fixture
        .manager
        .apply_refresh(&Ok(vec![feature_op("t::d::20", Some("t::d::1"))]), None)
        .await;

    assert!(fixture.drain_log().is_empty());
    assert_eq!(provider.state(), ProviderState::Ready);
}

#[tokio::test]
async fn session_creation_waits_for_pending_refresh() {
    let fixture = fixture().await;
    fixture
        .queue
        .execute(TaskType::HeadInvalidate, "refresh", async {})
        .expect("queue refresh");

    let manager = Arc::clone(&fixture.manager);
    let creating = tokio::spawn(async move { manager.create_model_provider(None, None).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!creating.is_finished());

    fixture.queue.reset_head();
    let provider = tokio::time::timeout(Duration::from_secs(2), creating)
        .await
        .expect("created after reset")
        .expect("joined")
        .expect("provider");
    assert_eq!(provider.state(), ProviderState::Ready);
}

#[tokio::test]
async fn commit_failure_switches_to_ephemeral_once_and_invalidates_providers() {
    let mut fixture = fixture().await;
    fixture
        .manager
        .apply_refresh(&Ok(refresh_operations()), None)
        .await;
    let provider = fixture
        .manager
        .create_model_provider(None, Some(fixture.observer()))
        .await
        .expect("provider");
    fixture.drain_log();

    fixture.store.durable().close().await;
    fixture
        .manager
        .apply_refresh(&Ok(refresh_operations()), None)
        .await;

    assert!(fixture.store.is_ephemeral());
    assert_eq!(provider.state(), ProviderState::Invalidated);
    assert!(fixture.manager.live_sessions().is_empty());

    fixture.manager.handle_storage_failure();
    assert_eq!(fixture.drain_log(), vec!["finished".to_string()]);

    let head = fixture
        .store
        .get_stream_structures(HEAD_SESSION_ID)
        .await
        .expect("ephemeral head");
    assert_eq!(head.len(), 3);
}

#[tokio::test]
async fn failed_refresh_reports_no_content_to_empty_sessions() {
    let mut fixture = fixture().await;
    let _provider = fixture
        .manager
        .create_model_provider(None, Some(fixture.observer()))
        .await
        .expect("provider");

    fixture
        .manager
        .apply_refresh(&Err(RequestError::Http { status: 503 }), None)
        .await;

    assert_eq!(
        fixture.drain_log(),
        vec![
            "start".to_string(),
            "error NoContent".to_string(),
            "error NoContent".to_string(),
        ]
    );
}

#[tokio::test]
async fn dismiss_is_recorded_with_semantic_properties() {
    let fixture = fixture().await;
    fixture
        .manager
        .record_dismiss("t::d::5", Some(b"why".to_vec()))
        .await
        .expect("dismiss");

    let actions = fixture.store.get_all_dismiss_actions().await.expect("actions");
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].content_id, "t::d::5");
    let semantic = fixture
        .store
        .get_semantic_properties(&["t::d::5".to_string()])
        .await
        .expect("semantic");
    assert_eq!(semantic[0].semantic_data, b"why".to_vec());
}

#[tokio::test]
async fn dismiss_after_storage_failure_lands_in_ephemeral_backend() {
    let fixture = fixture().await;
    fixture.store.durable().close().await;

    fixture
        .manager
        .record_dismiss("t::d::5", None)
        .await
        .expect("dismiss");

    assert!(fixture.store.is_ephemeral());
    let actions = fixture.store.get_all_dismiss_actions().await.expect("actions");
    assert_eq!(actions.len(), 1);
}

#[tokio::test]
async fn content_gc_spares_head_sessions_and_dismissed_content() {
    let fixture = fixture().await;
    fixture
        .manager
        .apply_refresh(&Ok(refresh_operations()), None)
        .await;
    let _provider = fixture
        .manager
        .create_model_provider(None, None)
        .await
        .expect("provider");
    assert!(fixture
        .store
        .edit_content()
        .add("t::d::98", feature_op("t::d::98", None).payload.expect("payload"))
        .add("t::d::99", feature_op("t::d::99", None).payload.expect("payload"))
        .commit()
        .await
        .is_success());
    fixture
        .manager
        .record_dismiss("t::d::98", None)
        .await
        .expect("dismiss");

    let outcome = fixture
        .manager
        .content_gc_task()
        .await
        .expect("gc task")
        .await
        .expect("gc run");

    assert_eq!(outcome.removed, 1);
    let remaining = fixture.store.get_all_content_ids().await.expect("ids");
    assert!(!remaining.contains(&"t::d::99".to_string()));
    for kept in ["t::d::1", "t::d::2", "t::d::3", "t::d::98"] {
        assert!(remaining.contains(&kept.to_string()), "{kept} collected");
    }
}

#[tokio::test]
async fn invalidate_removes_session_but_detach_keeps_it() {
    let mut fixture = fixture().await;
    fixture
        .manager
        .apply_refresh(&Ok(refresh_operations()), None)
        .await;
    let kept = fixture
        .manager
        .create_model_provider(None, Some(fixture.observer()))
        .await
        .expect("kept");
    let dropped = fixture
        .manager
        .create_model_provider(None, Some(fixture.observer()))
        .await
        .expect("dropped");
    fixture.drain_log();

    fixture
        .manager
        .detach_session(kept.session_id())
        .expect("detach");
    fixture
        .manager
        .invalidate_session(dropped.session_id())
        .await
        .expect("invalidate");

    assert_eq!(fixture.drain_log(), vec!["finished".to_string()]);
    let sessions = fixture.store.get_all_sessions().await.expect("sessions");
    assert_eq!(sessions, vec![kept.session_id().to_string()]);
    assert_eq!(
        fixture.manager.invalidate_session("_session:missing").await,
        Err(SessionError::UnknownSession("_session:missing".into()))
    );
}

#[tokio::test]
async fn reset_drops_sessions_and_content_but_keeps_actions() {
    let fixture = fixture().await;
    fixture
        .manager
        .apply_refresh(&Ok(refresh_operations()), None)
        .await;
    let provider = fixture
        .manager
        .create_model_provider(None, None)
        .await
        .expect("provider");
    fixture
        .manager
        .record_dismiss("t::d::2", None)
        .await
        .expect("dismiss");

    fixture.manager.reset().await.expect("reset");

    assert_eq!(provider.state(), ProviderState::Invalidated);
    assert!(fixture
        .store
        .get_stream_structures(HEAD_SESSION_ID)
        .await
        .expect("head")
        .is_empty());
    assert!(fixture
        .store
        .get_all_sessions()
        .await
        .expect("sessions")
        .is_empty());
    assert_eq!(
        fixture.store.get_all_dismiss_actions().await.expect("actions").len(),
        1
    );
}
