use super::*;
use axum::{body::Bytes, extract::State, http::StatusCode, routing::post, Router};
use prost::Message;
use shared::{
    protocol::{
        wire_operation::Payload, FeedRequest, FeedResponse, ResponseMetadata, WireContentId,
        WireFeature, WireOperation, WireOperationKind, WireRequestReason,
    },
    stream::{StreamDataOperation, StreamFeature, StreamPayload, StreamStructure},
};
use std::{
    sync::Mutex,
    time::{Duration, Instant},
};
use storage::{EditStore, HEAD_SESSION_ID};
use tokio::net::TcpListener;

struct ServerState {
    body: Vec<u8>,
    requests: Mutex<Vec<FeedRequest>>,
}

async fn handle_feed(State(state): State<Arc<ServerState>>, body: Bytes) -> (StatusCode, Vec<u8>) {
    if let Ok(request) = FeedRequest::decode(body.as_ref()) {
        state.requests.lock().expect("lock").push(request);
    }
    (StatusCode::OK, state.body.clone())
}

async fn spawn_feed_server(response: FeedResponse) -> (String, Arc<ServerState>) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = Arc::new(ServerState {
        body: response.encode_length_delimited_to_vec(),
        requests: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/feed", post(handle_feed))
        .with_state(Arc::clone(&state));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/feed"), state)
}

fn wire_id(id: i64) -> WireContentId {
    WireContentId {
        table: "t".into(),
        content_domain: "d".into(),
        id,
    }
}

fn zero_state_response() -> FeedResponse {
    let feature = |id: i64, parent: Option<i64>| WireOperation {
        operation: WireOperationKind::UpdateOrAppend as i32,
        content_id: Some(wire_id(id)),
        parent_id: parent.map(wire_id),
        payload: Some(Payload::Feature(WireFeature {
            content: format!("card-{id}").into_bytes(),
        })),
        semantic_data: None,
    };
    FeedResponse {
        operations: vec![
            WireOperation {
                operation: WireOperationKind::ClearAll as i32,
                content_id: None,
                parent_id: None,
                payload: None,
                semantic_data: None,
            },
            feature(1, None),
            feature(2, Some(1)),
            feature(3, Some(1)),
        ],
        metadata: Some(ResponseMetadata {
            creation_time_ms: 1_700_000_000_000,
        }),
    }
}

fn settings(server_url: String) -> EngineSettings {
    EngineSettings {
        server_url,
        database_url: "sqlite::memory:".into(),
        request_timeout_secs: 5,
        ..EngineSettings::default()
    }
}

async fn wait_for_head(engine: &FeedEngine) -> Vec<StreamStructure> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let head = engine
            .store()
            .get_stream_structures(HEAD_SESSION_ID)
            .await
            .expect("head");
        if !head.is_empty() {
            return head;
        }
        assert!(Instant::now() < deadline, "head never populated");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn empty_head_triggers_zero_state_refresh() {
    let (server_url, server) = spawn_feed_server(zero_state_response()).await;
    let (callbacks, _callback_task) = CallbackContext::spawn();

    let engine = FeedEngine::start(settings(server_url), callbacks, Arc::new(NoopScheduler))
        .await
        .expect("engine");
    let head = wait_for_head(&engine).await;
    assert_eq!(head.len(), 3);

    let requests = server.requests.lock().expect("lock").clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].reason, WireRequestReason::ZeroState as i32);

    let provider = engine
        .create_model_provider(None, None)
        .await
        .expect("provider");
    assert_eq!(
        provider.get_root_feature().map(|root| root.content_id),
        Some("t::d::1".to_string())
    );
    assert_eq!(provider.get_all_root_children().len(), 2);

    let stats = engine.adapter_stats();
    assert_eq!((stats.responses, stats.features, stats.clear_alls), (1, 3, 1));
    assert_eq!(engine.queue_stats().head_invalidate_run, 1);
}

#[tokio::test]
async fn populated_head_skips_initial_refresh() {
    let (server_url, server) = spawn_feed_server(zero_state_response()).await;
    let store = Arc::new(FeedStore::open("sqlite::memory:").await.expect("store"));
    let op = StreamDataOperation::update_or_append(
        "t::d::9",
        None,
        StreamPayload::Feature(StreamFeature {
            content: b"cached".to_vec(),
            response_created_ms: None,
        }),
    );
    assert!(store
        .edit_session(HEAD_SESSION_ID)
        .add(op.structure.clone())
        .commit()
        .await
        .is_success());
    let network = ReqwestNetworkClient::new(Duration::from_secs(5)).expect("client");
    let (callbacks, _callback_task) = CallbackContext::spawn();

    let engine = FeedEngine::start_with_dependencies(
        settings(server_url),
        Arc::clone(&store),
        Arc::new(network),
        callbacks,
        Arc::new(NoopScheduler),
    )
    .await
    .expect("engine");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(server.requests.lock().expect("lock").is_empty());
    assert_eq!(engine.queue_stats().head_invalidate_run, 0);
}

#[tokio::test]
async fn run_gc_drops_actions_for_missing_content() {
    let (server_url, _server) = spawn_feed_server(zero_state_response()).await;
    let (callbacks, _callback_task) = CallbackContext::spawn();
    let engine = FeedEngine::start(settings(server_url), callbacks, Arc::new(NoopScheduler))
        .await
        .expect("engine");
    wait_for_head(&engine).await;

    engine.dismiss("t::d::2", None).await.expect("dismiss kept");
    engine
        .dismiss("t::d::404", None)
        .await
        .expect("dismiss orphan");

    let report = engine.run_gc().await.expect("gc");
    assert_eq!(
        report,
        GcReport {
            content_removed: 0,
            actions_removed: 1,
        }
    );
    let dump = engine.dump().await.expect("dump");
    assert_eq!((dump.content, dump.actions), (3, 1));
}

#[tokio::test]
async fn background_flushes_ephemeral_actions_to_durable_storage() {
    let (server_url, _server) = spawn_feed_server(zero_state_response()).await;
    let (callbacks, _callback_task) = CallbackContext::spawn();
    let engine = FeedEngine::start(settings(server_url), callbacks, Arc::new(NoopScheduler))
        .await
        .expect("engine");
    wait_for_head(&engine).await;

    if let Some(wipe) = engine.store().switch_to_ephemeral_mode() {
        wipe.await.expect("durable wipe");
    }
    engine
        .dismiss("t::d::2", Some(b"why".to_vec()))
        .await
        .expect("dismiss");
    assert!(engine
        .store()
        .durable()
        .get_all_dismiss_actions()
        .await
        .expect("durable actions")
        .is_empty());

    engine.on_lifecycle_event(LifecycleEvent::EnteredBackground).await;

    let flushed = engine
        .store()
        .durable()
        .get_all_dismiss_actions()
        .await
        .expect("durable actions");
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].content_id, "t::d::2");
}

#[tokio::test]
async fn invalid_server_url_fails_start() {
    let (callbacks, _callback_task) = CallbackContext::spawn();
    let result = FeedEngine::start(
        settings("not a url".into()),
        callbacks,
        Arc::new(NoopScheduler),
    )
    .await;
    assert!(result.is_err());
}
