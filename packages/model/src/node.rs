//! # Document Tree
//!
//! Immutable rich-text nodes.
//!
//! A `Node` is either an element (named container with attributes and child
//! nodes) or an inline text run (a string carrying formatting marks). Nodes
//! are reference-counted values: cloning a `Node` preserves its identity,
//! rebuilding an equal tree does not. Identity (`Node::same`) is what lets
//! the sync layer pin a diff to the true boundary of an edit.
//!
//! Positions follow the usual rich-text convention: a text node occupies one
//! position per character, an element occupies one opening and one closing
//! position around its content.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Attribute map of an element or mark. Ordered so that display and
/// serialization stay stable.
pub type Attrs = BTreeMap<String, Value>;

/// Inline formatting annotation attached to a text node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    /// Mark type name (e.g. `bold`, `link`)
    pub name: String,

    /// Mark attributes (e.g. `{"href": "..."}` for a link)
    pub attrs: Attrs,
}

/// A node in the document tree.
///
/// Cheap to clone; clones share identity. Structural equality (`==`)
/// compares names, attributes, text, marks and children, never identity.
#[derive(Clone)]
pub struct Node(Arc<NodeData>);

#[derive(Debug)]
struct NodeData {
    name: String,
    attrs: Attrs,
    content: Vec<Node>,
    text: Option<String>,
    marks: Vec<Mark>,
}

impl Node {
    /// Name of the special text node type.
    pub const TEXT: &'static str = "text";

    pub(crate) fn new_element(name: String, attrs: Attrs, content: Vec<Node>) -> Self {
        Node(Arc::new(NodeData {
            name,
            attrs,
            content,
            text: None,
            marks: Vec::new(),
        }))
    }

    pub(crate) fn new_text(text: String, marks: Vec<Mark>) -> Self {
        Node(Arc::new(NodeData {
            name: Self::TEXT.to_string(),
            attrs: Attrs::new(),
            content: Vec::new(),
            text: Some(text),
            marks,
        }))
    }

    /// Node type name (`text` for text nodes).
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn attrs(&self) -> &Attrs {
        &self.0.attrs
    }

    pub fn content(&self) -> &[Node] {
        &self.0.content
    }

    pub fn child_count(&self) -> usize {
        self.0.content.len()
    }

    pub fn is_text(&self) -> bool {
        self.0.text.is_some()
    }

    /// Text content of a text node; empty for elements.
    pub fn text(&self) -> &str {
        self.0.text.as_deref().unwrap_or("")
    }

    pub fn marks(&self) -> &[Mark] {
        &self.0.marks
    }

    /// Identity comparison: true when both handles point at the same
    /// underlying node, regardless of structural equality.
    pub fn same(a: &Node, b: &Node) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Size of this node in positions: character count for text, content
    /// size plus the two bounding positions for elements.
    pub fn size(&self) -> usize {
        match &self.0.text {
            Some(text) => text.chars().count(),
            None => 2 + self.content_size(),
        }
    }

    /// Combined size of the child nodes.
    pub fn content_size(&self) -> usize {
        self.0.content.iter().map(Node::size).sum()
    }

    /// Absolute start position of `target` within this node's content,
    /// located by identity. `None` when `target` is not in the tree.
    pub fn position_of(&self, target: &Node) -> Option<usize> {
        let mut pos = 0;
        for child in &self.0.content {
            if Node::same(child, target) {
                return Some(pos);
            }
            if !child.is_text() {
                if let Some(inner) = child.position_of(target) {
                    return Some(pos + 1 + inner);
                }
            }
            pos += child.size();
        }
        None
    }

    /// Compact debug rendering, e.g. `doc(paragraph("ab"), heading)`.
    pub fn debug_string(&self) -> String {
        match &self.0.text {
            Some(text) => format!("{:?}", text),
            None => {
                let children: Vec<String> =
                    self.0.content.iter().map(Node::debug_string).collect();
                if children.is_empty() {
                    self.0.name.clone()
                } else {
                    format!("{}({})", self.0.name, children.join(", "))
                }
            }
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        self.0.name == other.0.name
            && self.0.attrs == other.0.attrs
            && self.0.text == other.0.text
            && self.0.marks == other.0.marks
            && self.0.content == other.0.content
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.debug_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Schema;

    fn doc_with_paragraph(text: &str) -> (std::sync::Arc<Schema>, Node) {
        let schema = Schema::basic();
        let para = schema
            .node(
                "paragraph",
                Attrs::new(),
                vec![schema.text(text, vec![]).unwrap()],
            )
            .unwrap();
        let doc = schema.node("doc", Attrs::new(), vec![para]).unwrap();
        (schema, doc)
    }

    #[test]
    fn test_sizes() {
        let (_, doc) = doc_with_paragraph("ab");

        // <p>ab</p> = 2 bounding positions + 2 characters
        assert_eq!(doc.content_size(), 4);
        assert_eq!(doc.content()[0].size(), 4);
        assert_eq!(doc.content()[0].content()[0].size(), 2);
    }

    #[test]
    fn test_identity_vs_structural_equality() {
        let (_, doc_a) = doc_with_paragraph("ab");
        let (_, doc_b) = doc_with_paragraph("ab");

        assert_eq!(doc_a, doc_b);
        assert!(!Node::same(&doc_a, &doc_b));
        assert!(Node::same(&doc_a, &doc_a.clone()));
    }

    #[test]
    fn test_position_of() {
        let (_, doc) = doc_with_paragraph("ab");
        let para = &doc.content()[0];
        let text = &para.content()[0];

        assert_eq!(doc.position_of(para), Some(0));
        // Text starts right after the paragraph's opening position.
        assert_eq!(doc.position_of(text), Some(1));
    }

    #[test]
    fn test_debug_string() {
        let (_, doc) = doc_with_paragraph("ab");
        assert_eq!(doc.debug_string(), "doc(paragraph(\"ab\"))");
    }
}
