use std::collections::HashSet;

use shared::stream::{StreamFeature, StreamPayload, StreamStructure};
use storage::{ContentStore, EditStore, FeedStore, HEAD_SESSION_ID};

#[tokio::test]
async fn head_content_and_actions_survive_reopen_then_gc_respects_references() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("feed").join("store.db");
    let database_url = storage::prepare_database_url(db_path.to_string_lossy().as_ref())
        .expect("prepare url");

    {
        let store = FeedStore::open(&database_url).await.expect("open");
        let committed = store
            .edit_content()
            .add(
                "t::d::1",
                StreamPayload::Feature(StreamFeature {
                    content: b"root".to_vec(),
                    response_created_ms: None,
                }),
            )
            .add(
                "t::d::2",
                StreamPayload::Feature(StreamFeature {
                    content: b"dismissed card".to_vec(),
                    response_created_ms: None,
                }),
            )
            .add(
                "t::d::3",
                StreamPayload::Feature(StreamFeature {
                    content: b"stale card".to_vec(),
                    response_created_ms: None,
                }),
            )
            .commit()
            .await;
        assert!(committed.is_success());
        assert!(store
            .edit_session(HEAD_SESSION_ID)
            .add(StreamStructure::update_or_append("t::d::1", None))
            .commit()
            .await
            .is_success());
        assert!(store
            .edit_actions()
            .add(shared::domain::ActionType::Dismiss, "t::d::2")
            .commit()
            .await
            .is_success());
    }

    let store = FeedStore::open(&database_url).await.expect("reopen");
    let head = store
        .get_stream_structures(HEAD_SESSION_ID)
        .await
        .expect("head journal");
    assert_eq!(
        head,
        vec![StreamStructure::update_or_append("t::d::1", None)]
    );

    let reserved: HashSet<String> = store
        .get_all_dismiss_actions()
        .await
        .expect("actions")
        .into_iter()
        .map(|action| action.content_id)
        .collect();
    let accessible: HashSet<String> = head
        .iter()
        .filter_map(|structure| structure.content_id().map(str::to_string))
        .collect();

    let outcome = store
        .trigger_content_gc(reserved, Box::new(move || accessible))
        .await
        .expect("gc");
    assert_eq!(outcome.removed, 1);
    assert_eq!(
        store.get_all_content_ids().await.expect("ids"),
        vec!["t::d::1".to_string(), "t::d::2".to_string()]
    );
}
