//! # Identity Map
//!
//! Bidirectional association between shared CRDT nodes and their editor
//! counterparts. An element maps to a single editor node; a shared text
//! maps to the ordered run of inline text nodes it materialized into.
//!
//! Entries are only ever added by the materializers and reconcilers, and
//! removed on CRDT deletions, at the start of a historical render, or on a
//! forced re-render. In steady state a present entry is structurally
//! consistent with its key; the reconciler relies on entry *identity* to
//! pin its diff to the true boundary of an edit.

use manuscript_model::Node;
use std::collections::HashMap;
use yrs::branch::{Branch, BranchID};
use yrs::types::xml::XmlOut;
use yrs::DeleteSet;

/// Editor-side counterpart of one shared node.
#[derive(Debug, Clone)]
pub(crate) enum MappedNode {
    /// Shared element/fragment → one editor node
    Element(Node),

    /// Shared text → contiguous run of inline text nodes
    TextRun(Vec<Node>),
}

/// Stable identifier of a shared node.
pub(crate) fn shared_id<S: AsRef<Branch>>(shared: &S) -> BranchID {
    shared.as_ref().id()
}

pub(crate) fn xml_out_id(out: &XmlOut) -> BranchID {
    match out {
        XmlOut::Fragment(fragment) => shared_id(fragment),
        XmlOut::Element(element) => shared_id(element),
        XmlOut::Text(text) => shared_id(text),
    }
}

/// The CRDT-node → editor-node map owned by a binding.
#[derive(Default)]
pub struct SharedMapping {
    entries: HashMap<BranchID, MappedNode>,
}

impl SharedMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn get(&self, id: &BranchID) -> Option<&MappedNode> {
        self.entries.get(id)
    }

    pub(crate) fn set_element(&mut self, id: BranchID, node: Node) {
        self.entries.insert(id, MappedNode::Element(node));
    }

    pub(crate) fn set_text_run(&mut self, id: BranchID, run: Vec<Node>) {
        self.entries.insert(id, MappedNode::TextRun(run));
    }

    pub(crate) fn remove(&mut self, id: &BranchID) {
        self.entries.remove(id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop every entry whose shared node was deleted.
    pub(crate) fn retain_live(&mut self, deleted: &DeleteSet) {
        self.entries.retain(|id, _| match id {
            BranchID::Nested(item_id) => !deleted.is_deleted(item_id),
            BranchID::Root(_) => true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manuscript_model::{Attrs, Schema};
    use yrs::block::ID;

    fn sample_node() -> Node {
        let schema = Schema::basic();
        schema.node("paragraph", Attrs::new(), vec![]).unwrap()
    }

    #[test]
    fn test_set_and_get() {
        let mut map = SharedMapping::new();
        let id = BranchID::Nested(ID::new(1, 0));
        let node = sample_node();

        map.set_element(id.clone(), node.clone());
        match map.get(&id) {
            Some(MappedNode::Element(mapped)) => assert!(Node::same(mapped, &node)),
            other => panic!("unexpected entry: {:?}", other),
        }
    }

    #[test]
    fn test_key_uniqueness() {
        let mut map = SharedMapping::new();
        let id = BranchID::Nested(ID::new(1, 0));

        map.set_element(id.clone(), sample_node());
        map.set_text_run(id.clone(), vec![]);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_retain_live_prunes_deleted() {
        let mut map = SharedMapping::new();
        let live = BranchID::Nested(ID::new(1, 0));
        let dead = BranchID::Nested(ID::new(1, 7));
        let root = BranchID::Root("prosemirror".into());

        map.set_element(live.clone(), sample_node());
        map.set_element(dead.clone(), sample_node());
        map.set_element(root.clone(), sample_node());

        let mut deleted = DeleteSet::default();
        deleted.insert(ID::new(1, 7), 1);
        map.retain_live(&deleted);

        assert!(map.get(&live).is_some());
        assert!(map.get(&dead).is_none());
        assert!(map.get(&root).is_some());
    }
}
