//! # Editing State
//!
//! Selections, replacement transactions, editor state and the view surface.
//!
//! Transactions here are replacement-style: a transaction optionally carries
//! a whole new document, a new selection and a bag of metadata entries keyed
//! by plugin name. Applying a transaction produces a new state; the old one
//! stays valid (and keeps its node identities).

use crate::node::Node;
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// A text selection over absolute document positions.
///
/// `anchor` is the fixed end, `head` the moving end; they may be in either
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

impl Selection {
    pub fn new(anchor: usize, head: usize) -> Self {
        Self { anchor, head }
    }

    pub fn collapsed(pos: usize) -> Self {
        Self { anchor: pos, head: pos }
    }

    pub fn from_pos(&self) -> usize {
        self.anchor.min(self.head)
    }

    pub fn to_pos(&self) -> usize {
        self.anchor.max(self.head)
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }

    /// Clamp both ends into the valid position range of `doc`.
    pub fn clamped_to(&self, doc: &Node) -> Selection {
        let max = doc.content_size();
        Selection {
            anchor: self.anchor.min(max),
            head: self.head.min(max),
        }
    }
}

/// A replacement transaction: new document and/or selection plus metadata.
#[derive(Default)]
pub struct Transaction {
    doc: Option<Node>,
    selection: Option<Selection>,
    metas: HashMap<String, Arc<dyn Any>>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole document.
    pub fn replace_document(&mut self, doc: Node) -> &mut Self {
        self.doc = Some(doc);
        self
    }

    pub fn set_selection(&mut self, selection: Selection) -> &mut Self {
        self.selection = Some(selection);
        self
    }

    /// Attach a metadata entry under a plugin key. Downstream plugins use
    /// these to distinguish e.g. remote-originated transactions.
    pub fn set_meta<T: Any>(&mut self, key: impl Into<String>, value: T) -> &mut Self {
        self.metas.insert(key.into(), Arc::new(value));
        self
    }

    /// Typed metadata lookup.
    pub fn meta<T: Any>(&self, key: &str) -> Option<&T> {
        self.metas.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn doc(&self) -> Option<&Node> {
        self.doc.as_ref()
    }

    pub fn selection(&self) -> Option<Selection> {
        self.selection
    }
}

/// Immutable editor state: schema, document and selection.
#[derive(Clone)]
pub struct EditorState {
    schema: Arc<Schema>,
    doc: Node,
    selection: Selection,
}

impl EditorState {
    pub fn new(schema: Arc<Schema>, doc: Node) -> Self {
        Self {
            schema,
            doc,
            selection: Selection::collapsed(0),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn doc(&self) -> &Node {
        &self.doc
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    /// Apply a transaction, producing the next state. The selection is
    /// clamped to the (possibly new) document.
    pub fn apply(&self, tr: &Transaction) -> EditorState {
        let doc = tr.doc().cloned().unwrap_or_else(|| self.doc.clone());
        let selection = tr.selection().unwrap_or(self.selection).clamped_to(&doc);
        EditorState {
            schema: self.schema.clone(),
            doc,
            selection,
        }
    }
}

/// The view surface: current state plus an editable flag.
///
/// Dispatching a transaction applies it to the state in place. Hosts hold
/// the view behind shared ownership together with the sync binding and pump
/// the binding after local dispatches.
pub struct EditorView {
    state: EditorState,
    editable: bool,
}

impl EditorView {
    pub fn new(state: EditorState) -> Self {
        Self {
            state,
            editable: true,
        }
    }

    pub fn state(&self) -> &EditorState {
        &self.state
    }

    pub fn editable(&self) -> bool {
        self.editable
    }

    pub fn set_editable(&mut self, editable: bool) {
        self.editable = editable;
    }

    /// Apply a transaction to the view's state.
    pub fn dispatch(&mut self, tr: &Transaction) {
        self.state = self.state.apply(tr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Attrs;

    fn simple_state() -> EditorState {
        let schema = Schema::basic();
        let para = schema
            .node(
                "paragraph",
                Attrs::new(),
                vec![schema.text("hello", vec![]).unwrap()],
            )
            .unwrap();
        let doc = schema.node("doc", Attrs::new(), vec![para]).unwrap();
        EditorState::new(schema, doc)
    }

    #[test]
    fn test_apply_replacement() {
        let state = simple_state();
        let schema = state.schema().clone();

        let doc2 = schema.node("doc", Attrs::new(), vec![]).unwrap();
        let mut tr = Transaction::new();
        tr.replace_document(doc2.clone());

        let next = state.apply(&tr);
        assert_eq!(next.doc(), &doc2);
        // Old state is untouched.
        assert_eq!(state.doc().child_count(), 1);
    }

    #[test]
    fn test_selection_clamped() {
        let state = simple_state();
        let schema = state.schema().clone();

        let mut tr = Transaction::new();
        tr.set_selection(Selection::new(3, 5));
        let with_sel = state.apply(&tr);
        assert_eq!(with_sel.selection(), Selection::new(3, 5));

        // Shrinking the document clamps the carried-over selection.
        let empty = schema.node("doc", Attrs::new(), vec![]).unwrap();
        let mut tr = Transaction::new();
        tr.replace_document(empty);
        let next = with_sel.apply(&tr);
        assert_eq!(next.selection(), Selection::new(0, 0));
    }

    #[test]
    fn test_meta_roundtrip() {
        let mut tr = Transaction::new();
        tr.set_meta("y-sync", 42usize);

        assert_eq!(tr.meta::<usize>("y-sync"), Some(&42));
        assert!(tr.meta::<String>("y-sync").is_none());
        assert!(tr.meta::<usize>("other").is_none());
    }

    #[test]
    fn test_dispatch_updates_view() {
        let mut view = EditorView::new(simple_state());
        assert!(view.editable());

        let schema = view.state().schema().clone();
        let empty = schema.node("doc", Attrs::new(), vec![]).unwrap();
        let mut tr = Transaction::new();
        tr.replace_document(empty);
        view.dispatch(&tr);

        assert_eq!(view.state().doc().child_count(), 0);
    }
}
