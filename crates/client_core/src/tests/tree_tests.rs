use super::*;

fn append(id: &str, parent: Option<&str>) -> StreamStructure {
    StreamStructure::update_or_append(id, parent.map(str::to_string))
}

fn remove(id: &str) -> StreamStructure {
    StreamStructure::remove(id, None)
}

fn replay_twice(journal: &[StreamStructure]) -> SessionTree {
    let mut tree = SessionTree::replay(journal);
    for structure in journal {
        tree.apply(structure);
    }
    tree
}

#[test]
fn builds_root_and_children_in_order() {
    let tree = SessionTree::replay(&[
        append("t::d::1", None),
        append("t::d::2", Some("t::d::1")),
        append("t::d::3", Some("t::d::1")),
        append("t::d::4", Some("t::d::2")),
    ]);

    assert_eq!(tree.root(), Some("t::d::1"));
    assert_eq!(tree.children("t::d::1"), ["t::d::2", "t::d::3"]);
    assert_eq!(tree.parent("t::d::4"), Some("t::d::2"));
    assert_eq!(
        tree.content_ids(),
        vec!["t::d::1", "t::d::2", "t::d::4", "t::d::3"]
    );
}

#[test]
fn remove_drops_whole_subtree_and_reports_it() {
    let mut tree = SessionTree::replay(&[
        append("root", None),
        append("a", Some("root")),
        append("b", Some("a")),
        append("c", Some("root")),
    ]);

    let effect = tree.apply(&remove("a"));

    assert_eq!(effect.removed, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(tree.children("root"), ["c"]);
    assert!(!tree.contains("b"));
}

#[test]
fn removing_unknown_id_is_a_no_op() {
    let mut tree = SessionTree::replay(&[append("root", None)]);
    let effect = tree.apply(&remove("missing"));
    assert!(effect.removed.is_empty());
    assert_eq!(tree.len(), 1);
}

#[test]
fn clear_all_empties_the_tree() {
    let mut tree = SessionTree::replay(&[append("root", None), append("a", Some("root"))]);
    let effect = tree.apply(&StreamStructure::ClearAll);
    assert!(effect.cleared);
    assert_eq!(effect.removed.len(), 2);
    assert!(tree.is_empty());
    assert_eq!(tree.root(), None);
}

#[test]
fn child_waits_for_parent() {
    let mut tree = SessionTree::new();
    let early = tree.apply(&append("child", Some("parent")));
    assert!(early.appended.is_empty());
    assert!(!tree.contains("child"));

    let effect = tree.apply(&append("parent", None));
    assert_eq!(
        effect.appended,
        vec!["parent".to_string(), "child".to_string()]
    );
    assert_eq!(tree.children("parent"), ["child"]);
}

#[test]
fn replaying_twice_matches_replaying_once() {
    let journals = vec![
        vec![
            append("root", None),
            append("a", Some("root")),
            append("b", Some("a")),
            remove("a"),
            append("c", Some("root")),
        ],
        vec![
            append("b", Some("a")),
            append("a", None),
            remove("a"),
            append("b", Some("a")),
        ],
        vec![
            append("root", None),
            StreamStructure::ClearAll,
            append("x", None),
            append("y", Some("x")),
            append("x", None),
        ],
        vec![remove("a"), append("a", None), append("token", Some("a"))],
    ];

    for journal in journals {
        let once = SessionTree::replay(&journal);
        let twice = replay_twice(&journal);
        assert_eq!(
            once.content_id_set(),
            twice.content_id_set(),
            "journal {journal:?}"
        );
        assert_eq!(SessionTree::replay(&journal), once);
    }
}
