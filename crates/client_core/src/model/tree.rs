use std::collections::{HashMap, HashSet};

use shared::stream::StreamStructure;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TreeNode {
    parent: Option<String>,
    children: Vec<String>,
}

/// What one structural entry did to the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructureEffect {
    /// Newly reachable ids, including waiting children adopted on arrival.
    pub appended: Vec<String>,
    /// Removed ids, the removed node first and its descendants depth-first.
    pub removed: Vec<String>,
    pub cleared: bool,
}

/// Tree membership of one session, rebuilt by replaying its journal.
///
/// Parentless nodes form the ordered root list; the first of them is the
/// root feature. Re-appending an id already in the tree leaves its position
/// unchanged, removing an unknown id does nothing, and children whose parent
/// has not arrived yet wait until it does. Replaying a journal on top of its
/// own result therefore yields the same membership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionTree {
    nodes: HashMap<String, TreeNode>,
    roots: Vec<String>,
    waiting: HashMap<String, Vec<String>>,
}

impl SessionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replay<'a>(structures: impl IntoIterator<Item = &'a StreamStructure>) -> Self {
        let mut tree = Self::new();
        for structure in structures {
            tree.apply(structure);
        }
        tree
    }

    pub fn apply(&mut self, structure: &StreamStructure) -> StructureEffect {
        match structure {
            StreamStructure::ClearAll => {
                let removed = self.content_ids();
                self.nodes.clear();
                self.roots.clear();
                self.waiting.clear();
                StructureEffect {
                    removed,
                    cleared: true,
                    ..StructureEffect::default()
                }
            }
            StreamStructure::UpdateOrAppend {
                content_id,
                parent_id,
            } => {
                let mut appended = Vec::new();
                self.append(content_id, parent_id.as_deref(), &mut appended);
                StructureEffect {
                    appended,
                    ..StructureEffect::default()
                }
            }
            StreamStructure::Remove { content_id, .. } => StructureEffect {
                removed: self.remove_subtree(content_id),
                ..StructureEffect::default()
            },
        }
    }

    fn append(&mut self, content_id: &str, parent_id: Option<&str>, appended: &mut Vec<String>) {
        if self.nodes.contains_key(content_id) {
            return;
        }
        match parent_id {
            Some(parent_id) => {
                let Some(parent) = self.nodes.get_mut(parent_id) else {
                    debug!("model: parking content_id={content_id} parent={parent_id}");
                    let waiting = self.waiting.entry(parent_id.to_string()).or_default();
                    if !waiting.iter().any(|id| id == content_id) {
                        waiting.push(content_id.to_string());
                    }
                    return;
                };
                parent.children.push(content_id.to_string());
            }
            None => self.roots.push(content_id.to_string()),
        }
        self.nodes.insert(
            content_id.to_string(),
            TreeNode {
                parent: parent_id.map(str::to_string),
                children: Vec::new(),
            },
        );
        appended.push(content_id.to_string());
        if let Some(children) = self.waiting.remove(content_id) {
            for child in children {
                self.append(&child, Some(content_id), appended);
            }
        }
    }

    fn remove_subtree(&mut self, content_id: &str) -> Vec<String> {
        let Some(node) = self.nodes.get(content_id) else {
            for waiting in self.waiting.values_mut() {
                waiting.retain(|id| id != content_id);
            }
            return Vec::new();
        };
        match node.parent.clone() {
            Some(parent_id) => {
                if let Some(parent) = self.nodes.get_mut(&parent_id) {
                    parent.children.retain(|child| child != content_id);
                }
            }
            None => self.roots.retain(|root| root != content_id),
        }

        let mut removed = Vec::new();
        let mut pending = vec![content_id.to_string()];
        while let Some(id) = pending.pop() {
            if let Some(node) = self.nodes.remove(&id) {
                pending.extend(node.children.into_iter().rev());
                removed.push(id);
            }
        }
        removed
    }

    pub fn contains(&self, content_id: &str) -> bool {
        self.nodes.contains_key(content_id)
    }

    pub fn root(&self) -> Option<&str> {
        self.roots.first().map(String::as_str)
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn children(&self, content_id: &str) -> &[String] {
        self.nodes
            .get(content_id)
            .map(|node| node.children.as_slice())
            .unwrap_or_default()
    }

    pub fn parent(&self, content_id: &str) -> Option<&str> {
        self.nodes
            .get(content_id)
            .and_then(|node| node.parent.as_deref())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every reachable id, roots first, each subtree depth-first.
    pub fn content_ids(&self) -> Vec<String> {
        let mut ordered = Vec::with_capacity(self.nodes.len());
        let mut pending: Vec<&String> = self.roots.iter().rev().collect();
        while let Some(id) = pending.pop() {
            ordered.push(id.clone());
            if let Some(node) = self.nodes.get(id) {
                pending.extend(node.children.iter().rev());
            }
        }
        ordered
    }

    pub fn content_id_set(&self) -> HashSet<String> {
        self.nodes.keys().cloned().collect()
    }
}

#[cfg(test)]
#[path = "../tests/tree_tests.rs"]
mod tests;
