use std::collections::HashSet;

use super::*;
use shared::stream::{StreamFeature, StreamToken};

fn subset(universe: &[String], mask: u32) -> HashSet<String> {
    universe
        .iter()
        .enumerate()
        .filter(|(index, _)| mask & (1 << index) != 0)
        .map(|(_, id)| id.clone())
        .collect()
}

#[test]
fn content_gc_never_selects_reserved_or_accessible_ids() {
    let universe: Vec<String> = (0..5).map(|n| format!("t::d::{n}")).collect();
    for reserved_mask in 0..32u32 {
        for accessible_mask in 0..32u32 {
            let reserved = subset(&universe, reserved_mask);
            let accessible = subset(&universe, accessible_mask);
            let doomed = gc::collectable_content_ids(&universe, &reserved, &accessible);

            for id in &doomed {
                assert!(!reserved.contains(id) && !accessible.contains(id));
            }
            let kept = universe.len() - doomed.len();
            assert_eq!(kept, reserved.union(&accessible).count());
        }
    }
}

#[test]
fn action_gc_selects_actions_with_invalid_targets() {
    let keep = DismissAction::dismiss("t::d::1");
    let drop = DismissAction::dismiss("t::d::2");
    let doomed = gc::invalid_actions(&[keep, drop.clone()], &["t::d::1".to_string()]);
    assert_eq!(doomed, vec![drop]);
}

fn feature(content: &[u8]) -> StreamPayload {
    StreamPayload::Feature(StreamFeature {
        content: content.to_vec(),
        response_created_ms: None,
    })
}

#[tokio::test]
async fn mutation_builders_commit_through_any_store() {
    let store: Box<dyn ContentStore> = Box::new(EphemeralStore::new());

    assert!(store
        .edit_content()
        .add("t::d::1", feature(b"a"))
        .add(
            "t::d::2",
            StreamPayload::Token(StreamToken {
                parent_id: Some("t::d::1".into()),
                next_page_token: b"tok".to_vec(),
            }),
        )
        .commit()
        .await
        .is_success());

    let session = store.create_new_session().await.expect("session");
    assert!(store
        .edit_session(session.clone())
        .add(StreamStructure::update_or_append("t::d::1", None))
        .add_all([StreamStructure::update_or_append(
            "t::d::2",
            Some("t::d::1".into())
        )])
        .commit()
        .await
        .is_success());

    assert!(store
        .edit_actions()
        .add(ActionType::Dismiss, "t::d::1")
        .commit()
        .await
        .is_success());
    assert!(store
        .edit_semantic_properties()
        .add("t::d::1", b"sem".to_vec())
        .commit()
        .await
        .is_success());

    let payloads = store
        .get_payloads(&["t::d::1".to_string(), "missing".to_string()])
        .await
        .expect("payloads");
    assert_eq!(payloads.len(), 1);
    assert_eq!(
        store.get_stream_structures(&session).await.expect("journal").len(),
        2
    );
    assert_eq!(store.get_all_dismiss_actions().await.expect("actions").len(), 1);
    assert_eq!(
        store
            .get_semantic_properties(&["t::d::1".to_string()])
            .await
            .expect("semantic")[0]
            .semantic_data,
        b"sem".to_vec()
    );
}

#[tokio::test]
async fn head_is_not_listed_as_a_session() {
    let store = EphemeralStore::new();
    assert!(store
        .edit_session(HEAD_SESSION_ID)
        .add(StreamStructure::update_or_append("t::d::1", None))
        .commit()
        .await
        .is_success());
    let created = store.create_new_session().await.expect("session");
    assert!(created.starts_with("_session:"));
    assert_eq!(store.get_all_sessions().await.expect("sessions"), vec![created]);
    assert!(store.remove_session(HEAD_SESSION_ID).await.is_err());
}

#[tokio::test]
async fn ephemeral_content_gc_is_deferred_until_awaited() {
    let store = EphemeralStore::new();
    assert!(store
        .edit_content()
        .add("t::d::1", feature(b"keep"))
        .add("t::d::2", feature(b"reserved"))
        .add("t::d::3", feature(b"garbage"))
        .commit()
        .await
        .is_success());

    let task = store.trigger_content_gc(
        HashSet::from(["t::d::2".to_string()]),
        Box::new(|| HashSet::from(["t::d::1".to_string()])),
    );
    assert_eq!(store.get_all_content_ids().await.expect("ids").len(), 3);

    let outcome = task.await.expect("gc");
    assert_eq!(outcome.removed, 1);
    let mut remaining = store.get_all_content_ids().await.expect("ids");
    remaining.sort();
    assert_eq!(remaining, vec!["t::d::1".to_string(), "t::d::2".to_string()]);
}

#[tokio::test]
async fn ephemeral_content_gc_collects_semantic_only_ids_once() {
    let store = EphemeralStore::new();
    assert!(store
        .edit_content()
        .add("t::d::1", feature(b"garbage"))
        .commit()
        .await
        .is_success());
    assert!(store
        .edit_semantic_properties()
        .add("t::d::1", b"with-content".to_vec())
        .add("t::d::2", b"stray".to_vec())
        .add("t::d::3", b"accessible".to_vec())
        .commit()
        .await
        .is_success());

    let outcome = store
        .trigger_content_gc(
            HashSet::new(),
            Box::new(|| HashSet::from(["t::d::3".to_string()])),
        )
        .await
        .expect("gc");

    assert_eq!(outcome.removed, 2);
    assert!(store.get_all_content_ids().await.expect("ids").is_empty());
    let ids = ["t::d::1", "t::d::2", "t::d::3"].map(String::from);
    let remaining = store.get_semantic_properties(&ids).await.expect("semantic");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].content_id, "t::d::3");
}
