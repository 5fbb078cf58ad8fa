//! # Materializers
//!
//! Build editor subtrees from shared CRDT subtrees.
//!
//! Materialization reuses cached editor nodes through the identity map, so
//! unchanged shared subtrees come back with their exact previous identity.
//! Under a snapshot pair the builders additionally annotate added/removed
//! content with a synthetic `ychange` attribute (elements) or mark (text).
//!
//! ## Self-healing
//!
//! A remote concurrent edit can produce a combination this replica's schema
//! forbids. Construction failure is not fatal: the offending shared node is
//! removed from the shared document inside the current transaction and a
//! `None` propagates upward for the parent to filter out. Replicating the
//! deletion converges all replicas onto the locally-valid intersection.

use crate::attrs::{format_attr_map, value_to_attrs};
use crate::errors::SyncError;
use crate::mapping::{shared_id, MappedNode, SharedMapping};
use crate::YCHANGE;
use manuscript_model::{Attrs, Mark, Node, Schema};
use serde_json::{json, Value};
use tracing::warn;
use yrs::Xml;
use yrs::block::ID;
use yrs::branch::BranchID;
use yrs::types::text::{ChangeKind, YChange};
use yrs::types::xml::{XmlElementRef, XmlFragment, XmlOut, XmlTextRef};
use yrs::{Any, Out, ReadTxn, Snapshot, StateVector, Text, TransactionMut};

/// The two snapshots bounding a historical render.
#[derive(Clone, Copy)]
pub(crate) struct HistoricalView<'a> {
    pub snapshot: &'a Snapshot,
    pub prev: &'a Snapshot,
}

/// Resolves a change kind and originating item id into the full `ychange`
/// annotation value (type, user, color).
pub(crate) type ChangeResolver<'a> = dyn Fn(ChangeKind, ID) -> Value + 'a;

fn covered(state: &StateVector, id: &ID) -> bool {
    state.get(&id.client) > id.clock
}

/// Whether the item identified by `id` exists and is not deleted under
/// `snapshot`.
pub(crate) fn is_visible(id: &ID, snapshot: &Snapshot) -> bool {
    covered(&snapshot.state_map, id) && !snapshot.delete_set.is_deleted(id)
}

pub(crate) fn resolve_change(
    resolver: Option<&ChangeResolver>,
    kind: ChangeKind,
    id: ID,
) -> Value {
    match resolver {
        Some(resolve) => resolve(kind, id),
        None => match kind {
            ChangeKind::Added => json!({ "type": "added" }),
            ChangeKind::Removed => json!({ "type": "removed" }),
        },
    }
}

/// Read an element's attribute map into editor attribute values.
pub(crate) fn read_attributes<T: ReadTxn>(txn: &T, element: &XmlElementRef) -> Attrs {
    let mut attrs = Attrs::new();
    for (key, value) in element.attributes(txn) {
        attrs.insert(key.to_string(), crate::attrs::attr_string_to_value(&value));
    }
    attrs
}

/// Materialize the children of a shared container in order, healing
/// schema-rejected children by removing them from the container.
pub(crate) fn materialize_children<C: XmlFragment>(
    txn: &mut TransactionMut,
    container: &C,
    schema: &Schema,
    map: &mut SharedMapping,
    view: Option<HistoricalView>,
    resolver: Option<&ChangeResolver>,
) -> Result<Vec<Node>, SyncError> {
    let mut children = Vec::new();
    let mut index = 0u32;
    loop {
        let child = container.get(&*txn, index);
        match child {
            None => break,
            Some(XmlOut::Element(element)) => {
                match materialize_element(txn, &element, schema, map, view, resolver)? {
                    Some(node) => {
                        children.push(node);
                        index += 1;
                    }
                    None => container.remove_range(txn, index, 1),
                }
            }
            Some(XmlOut::Text(text)) => {
                match materialize_text(txn, &text, schema, map, view, resolver)? {
                    Some(run) => {
                        children.extend(run);
                        index += 1;
                    }
                    None => container.remove_range(txn, index, 1),
                }
            }
            Some(XmlOut::Fragment(_)) => {
                return Err(SyncError::UnsupportedNodeKind("fragment"));
            }
        }
    }
    Ok(children)
}

/// Build an editor element from a shared element.
///
/// Returns `None` when the local schema rejects the element; the caller
/// removes it from the shared tree.
pub(crate) fn materialize_element(
    txn: &mut TransactionMut,
    element: &XmlElementRef,
    schema: &Schema,
    map: &mut SharedMapping,
    view: Option<HistoricalView>,
    resolver: Option<&ChangeResolver>,
) -> Result<Option<Node>, SyncError> {
    let id = shared_id(element);
    if let Some(MappedNode::Element(cached)) = map.get(&id) {
        return Ok(Some(cached.clone()));
    }

    // Decide the annotation before recursing: descendants of an added or
    // removed element are not re-annotated.
    let mut ychange = None;
    let mut child_view = view;
    if let (Some(pair), BranchID::Nested(item_id)) = (view, &id) {
        if !is_visible(item_id, pair.snapshot) {
            ychange = Some(resolve_change(resolver, ChangeKind::Removed, *item_id));
        } else if !is_visible(item_id, pair.prev) {
            ychange = Some(resolve_change(resolver, ChangeKind::Added, *item_id));
        }
        if ychange.is_some() {
            child_view = Some(HistoricalView {
                snapshot: pair.snapshot,
                prev: pair.snapshot,
            });
        }
    }

    let children = materialize_children(txn, element, schema, map, child_view, resolver)?;

    let mut attrs = read_attributes(&*txn, element);
    if let Some(change) = ychange {
        attrs.insert(YCHANGE.to_string(), change);
    }

    let tag = element.tag().to_string();
    match schema.node(&tag, attrs, children) {
        Ok(node) => {
            map.set_element(id, node.clone());
            Ok(Some(node))
        }
        Err(err) => {
            warn!(node = %tag, %err, "schema rejected shared element; removing it");
            Ok(None)
        }
    }
}

/// Build the run of inline editor text nodes for a shared text.
///
/// Returns `None` when any chunk fails to construct; the caller removes the
/// whole text from the shared tree.
pub(crate) fn materialize_text(
    txn: &mut TransactionMut,
    text: &XmlTextRef,
    schema: &Schema,
    map: &mut SharedMapping,
    view: Option<HistoricalView>,
    resolver: Option<&ChangeResolver>,
) -> Result<Option<Vec<Node>>, SyncError> {
    let id = shared_id(text);
    if let Some(MappedNode::TextRun(cached)) = map.get(&id) {
        return Ok(Some(cached.clone()));
    }

    struct Chunk {
        insert: Out,
        attributes: std::collections::BTreeMap<String, Attrs>,
        ychange: Option<Value>,
    }

    let chunks: Vec<Chunk> = match view {
        None => text
            .diff(&*txn, YChange::identity)
            .into_iter()
            .map(|diff| Chunk {
                insert: diff.insert,
                attributes: format_attr_map(diff.attributes.as_deref()),
                ychange: None,
            })
            .collect(),
        Some(pair) => text
            .diff_range(
                txn,
                Some(pair.snapshot),
                Some(pair.prev),
                |change: YChange| resolve_change(resolver, change.kind, change.id),
            )
            .into_iter()
            .map(|diff| Chunk {
                insert: diff.insert,
                attributes: format_attr_map(diff.attributes.as_deref()),
                ychange: diff.ychange,
            })
            .collect(),
    };

    let mut run = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let Out::Any(Any::String(content)) = chunk.insert else {
            warn!("shared text carries non-string content; removing it");
            return Ok(None);
        };

        let mut marks = Vec::new();
        for (name, attrs) in chunk.attributes {
            match schema.mark(&name, attrs) {
                Ok(mark) => marks.push(mark),
                Err(err) => {
                    warn!(mark = %name, %err, "schema rejected text formatting; removing the text");
                    return Ok(None);
                }
            }
        }
        if let Some(change) = chunk.ychange {
            marks.push(Mark {
                name: YCHANGE.to_string(),
                attrs: value_to_attrs(&change),
            });
        }

        match schema.text(content.as_ref(), marks) {
            Ok(node) => run.push(node),
            Err(err) => {
                warn!(%err, "schema rejected text node; removing the text");
                return Ok(None);
            }
        }
    }

    map.set_text_run(id, run.clone());
    Ok(Some(run))
}
