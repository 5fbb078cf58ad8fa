//! # Schema
//!
//! Validated construction of document nodes.
//!
//! A schema enumerates the node and mark types a document may contain and
//! the attributes each accepts. Construction goes through the schema and
//! fails if a name or attribute combination does not validate; the caller
//! decides what to do with the rejected content.
//!
//! The synthetic `ychange` attribute and mark are always accepted: they are
//! the channel through which historical renders annotate added/removed
//! content, and are never part of a document schema proper.

use crate::node::{Attrs, Mark, Node};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// The attribute/mark name reserved for change annotations.
pub const YCHANGE: &str = "ychange";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Unknown mark type: {0}")]
    UnknownMarkType(String),

    #[error("Unknown attribute {attr} on {owner}")]
    UnknownAttribute { owner: String, attr: String },

    #[error("Missing required attribute {attr} on {owner}")]
    MissingAttribute { owner: String, attr: String },
}

/// Specification of one attribute.
#[derive(Debug, Clone, Default)]
pub struct AttrSpec {
    /// Filled in when the attribute is absent at construction.
    pub default: Option<Value>,

    /// Construction fails when a required attribute is absent and has no
    /// default.
    pub required: bool,
}

/// Specification of an element node type.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    pub attrs: BTreeMap<String, AttrSpec>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, spec: AttrSpec) -> Self {
        self.attrs.insert(name.into(), spec);
        self
    }
}

/// Specification of a mark type.
#[derive(Debug, Clone)]
pub struct MarkSpec {
    pub name: String,
    pub attrs: BTreeMap<String, AttrSpec>,
}

impl MarkSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, spec: AttrSpec) -> Self {
        self.attrs.insert(name.into(), spec);
        self
    }
}

/// A document schema: the set of node and mark types and their attributes.
#[derive(Debug)]
pub struct Schema {
    nodes: BTreeMap<String, NodeSpec>,
    marks: BTreeMap<String, MarkSpec>,
}

impl Schema {
    pub fn new(nodes: Vec<NodeSpec>, marks: Vec<MarkSpec>) -> Arc<Self> {
        Arc::new(Self {
            nodes: nodes.into_iter().map(|n| (n.name.clone(), n)).collect(),
            marks: marks.into_iter().map(|m| (m.name.clone(), m)).collect(),
        })
    }

    /// A small general-purpose schema used across the test suites:
    /// `doc`, `paragraph`, `heading{level}`, `blockquote`, with
    /// `bold`/`italic`/`link{href}` marks.
    pub fn basic() -> Arc<Self> {
        Schema::new(
            vec![
                NodeSpec::new("doc"),
                NodeSpec::new("paragraph"),
                NodeSpec::new("heading").with_attr(
                    "level",
                    AttrSpec {
                        default: Some(Value::from(1)),
                        required: true,
                    },
                ),
                NodeSpec::new("blockquote"),
            ],
            vec![
                MarkSpec::new("bold"),
                MarkSpec::new("italic"),
                MarkSpec::new("link").with_attr(
                    "href",
                    AttrSpec {
                        default: None,
                        required: true,
                    },
                ),
            ],
        )
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Construct an element node, validating its name and attributes and
    /// filling attribute defaults.
    pub fn node(
        &self,
        name: &str,
        attrs: Attrs,
        children: Vec<Node>,
    ) -> Result<Node, SchemaError> {
        let spec = self
            .nodes
            .get(name)
            .ok_or_else(|| SchemaError::UnknownNodeType(name.to_string()))?;

        let attrs = Self::validate_attrs(&spec.name, &spec.attrs, attrs)?;
        Ok(Node::new_element(spec.name.clone(), attrs, children))
    }

    /// Construct a text node, validating its marks.
    pub fn text(&self, text: &str, marks: Vec<Mark>) -> Result<Node, SchemaError> {
        for mark in &marks {
            if mark.name != YCHANGE && !self.marks.contains_key(&mark.name) {
                return Err(SchemaError::UnknownMarkType(mark.name.clone()));
            }
        }
        Ok(Node::new_text(text.to_string(), marks))
    }

    /// Construct a mark, validating its name and attributes.
    pub fn mark(&self, name: &str, attrs: Attrs) -> Result<Mark, SchemaError> {
        if name == YCHANGE {
            return Ok(Mark {
                name: name.to_string(),
                attrs,
            });
        }
        let spec = self
            .marks
            .get(name)
            .ok_or_else(|| SchemaError::UnknownMarkType(name.to_string()))?;
        let attrs = Self::validate_attrs(&spec.name, &spec.attrs, attrs)?;
        Ok(Mark {
            name: spec.name.clone(),
            attrs,
        })
    }

    fn validate_attrs(
        owner: &str,
        specs: &BTreeMap<String, AttrSpec>,
        mut attrs: Attrs,
    ) -> Result<Attrs, SchemaError> {
        for key in attrs.keys() {
            if key != YCHANGE && !specs.contains_key(key) {
                return Err(SchemaError::UnknownAttribute {
                    owner: owner.to_string(),
                    attr: key.clone(),
                });
            }
        }
        for (key, spec) in specs {
            if !attrs.contains_key(key) {
                if let Some(default) = &spec.default {
                    attrs.insert(key.clone(), default.clone());
                } else if spec.required {
                    return Err(SchemaError::MissingAttribute {
                        owner: owner.to_string(),
                        attr: key.clone(),
                    });
                }
            }
        }
        Ok(attrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_node_type_rejected() {
        let schema = Schema::basic();
        let result = schema.node("marquee", Attrs::new(), vec![]);
        assert_eq!(
            result.unwrap_err(),
            SchemaError::UnknownNodeType("marquee".to_string())
        );
    }

    #[test]
    fn test_attribute_defaults_filled() {
        let schema = Schema::basic();
        let heading = schema.node("heading", Attrs::new(), vec![]).unwrap();
        assert_eq!(heading.attrs().get("level"), Some(&Value::from(1)));
    }

    #[test]
    fn test_unknown_attribute_rejected() {
        let schema = Schema::basic();
        let mut attrs = Attrs::new();
        attrs.insert("color".to_string(), Value::from("red"));
        assert!(schema.node("paragraph", attrs, vec![]).is_err());
    }

    #[test]
    fn test_required_mark_attribute() {
        let schema = Schema::basic();
        assert!(schema.mark("link", Attrs::new()).is_err());

        let mut attrs = Attrs::new();
        attrs.insert("href".to_string(), Value::from("https://example.com"));
        assert!(schema.mark("link", attrs).is_ok());
    }

    #[test]
    fn test_ychange_always_accepted() {
        let schema = Schema::basic();

        let mut attrs = Attrs::new();
        attrs.insert(YCHANGE.to_string(), serde_json::json!({"type": "added"}));
        assert!(schema.node("paragraph", attrs.clone(), vec![]).is_ok());

        let mark = schema.mark(YCHANGE, attrs).unwrap();
        assert!(schema.text("ab", vec![mark]).is_ok());
    }

    #[test]
    fn test_unknown_mark_rejected() {
        let schema = Schema::basic();
        let mark = Mark {
            name: "blink".to_string(),
            attrs: Attrs::new(),
        };
        assert!(schema.text("ab", vec![mark]).is_err());
    }
}
