//! # Reconcilers
//!
//! Diff an editor tree against the shared CRDT tree and apply the smallest
//! faithful mutation set to the shared side.
//!
//! The tree diff is a heuristic two-pointer scan, not a tree-edit-distance
//! minimum. Editor transactions keep the exact node identity of unchanged
//! subtrees, so identity hits in the map pin the scan to the true boundary
//! of a local edit and untouched siblings never produce operations that
//! remote peers would have to see.
//!
//! ## Mutation Semantics
//!
//! - Attributes: a null editor value means "not present"
//! - A name-matching element pair is updated in place (recursion)
//! - Anything else in the unmatched middle is replaced: delete on the
//!   shared side, rebuild from the editor side
//! - Text runs go through a character-level prefix/suffix diff followed by
//!   a formatting pass

use crate::attrs::{format_attr_map, marks_to_attrs, value_to_any, FormatAttrs};
use crate::errors::SyncError;
use crate::mapping::{shared_id, xml_out_id, MappedNode, SharedMapping};
use crate::materialize::read_attributes;
use crate::YCHANGE;
use manuscript_model::{Attrs, Node};
use std::sync::Arc;
use yrs::branch::BranchID;
use yrs::types::text::YChange;
use yrs::types::xml::{
    XmlElementPrelim, XmlElementRef, XmlFragment, XmlFragmentRef, XmlOut, XmlTextPrelim,
    XmlTextRef,
};
use yrs::Xml;
use yrs::types::Delta;
use yrs::{Any, In, Out, ReadTxn, Text, TransactionMut};

/// A shared node that can contain ordered children: the root fragment or a
/// named element. Dispatch is explicit so the hot path stays monomorphic.
#[derive(Clone)]
pub(crate) enum SharedContainer {
    Fragment(XmlFragmentRef),
    Element(XmlElementRef),
}

impl SharedContainer {
    pub(crate) fn id(&self) -> BranchID {
        match self {
            SharedContainer::Fragment(fragment) => shared_id(fragment),
            SharedContainer::Element(element) => shared_id(element),
        }
    }

    pub(crate) fn len<T: ReadTxn>(&self, txn: &T) -> u32 {
        match self {
            SharedContainer::Fragment(fragment) => fragment.len(txn),
            SharedContainer::Element(element) => element.len(txn),
        }
    }

    pub(crate) fn get<T: ReadTxn>(&self, txn: &T, index: u32) -> Option<XmlOut> {
        match self {
            SharedContainer::Fragment(fragment) => fragment.get(txn, index),
            SharedContainer::Element(element) => element.get(txn, index),
        }
    }

    fn insert_element(&self, txn: &mut TransactionMut, index: u32, tag: &str) -> XmlElementRef {
        let prelim = XmlElementPrelim::empty(tag.to_string());
        match self {
            SharedContainer::Fragment(fragment) => fragment.insert(txn, index, prelim),
            SharedContainer::Element(element) => element.insert(txn, index, prelim),
        }
    }

    fn insert_text(&self, txn: &mut TransactionMut, index: u32) -> XmlTextRef {
        let prelim = XmlTextPrelim::new("");
        match self {
            SharedContainer::Fragment(fragment) => fragment.insert(txn, index, prelim),
            SharedContainer::Element(element) => element.insert(txn, index, prelim),
        }
    }

    fn remove_range(&self, txn: &mut TransactionMut, index: u32, len: u32) {
        match self {
            SharedContainer::Fragment(fragment) => fragment.remove_range(txn, index, len),
            SharedContainer::Element(element) => element.remove_range(txn, index, len),
        }
    }
}

/// One item of a normalized child list: maximal runs of text nodes collapse
/// into a single text-run item, mirroring the shared tree's shape where
/// contiguous inline text lives in one text type.
#[derive(Debug, Clone)]
pub(crate) enum NormalizedChild {
    Element(Node),
    TextRun(Vec<Node>),
}

impl NormalizedChild {
    pub(crate) fn size(&self) -> usize {
        match self {
            NormalizedChild::Element(node) => node.size(),
            NormalizedChild::TextRun(run) => run.iter().map(Node::size).sum(),
        }
    }
}

pub(crate) fn normalize_children(parent: &Node) -> Vec<NormalizedChild> {
    let mut out = Vec::new();
    let mut run: Vec<Node> = Vec::new();
    for child in parent.content() {
        if child.is_text() {
            run.push(child.clone());
        } else {
            if !run.is_empty() {
                out.push(NormalizedChild::TextRun(std::mem::take(&mut run)));
            }
            out.push(NormalizedChild::Element(child.clone()));
        }
    }
    if !run.is_empty() {
        out.push(NormalizedChild::TextRun(run));
    }
    out
}

/// Attribute equality after dropping null values and the `ychange` key.
pub(crate) fn equal_attrs(a: &Attrs, b: &Attrs) -> bool {
    let significant = |attrs: &Attrs| -> Attrs {
        attrs
            .iter()
            .filter(|(key, value)| key.as_str() != YCHANGE && !value.is_null())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    };
    significant(a) == significant(b)
}

/// Structural equality between a shared text and an editor text run.
pub(crate) fn equal_text<T: ReadTxn>(txn: &T, ytext: &XmlTextRef, run: &[Node]) -> bool {
    let diff = ytext.diff(txn, YChange::identity);
    if diff.len() != run.len() {
        return false;
    }
    diff.iter().zip(run.iter()).all(|(chunk, node)| {
        let Out::Any(Any::String(content)) = &chunk.insert else {
            return false;
        };
        if content.as_ref() != node.text() {
            return false;
        }
        let formats = format_attr_map(chunk.attributes.as_deref());
        if formats.len() != node.marks().len() {
            return false;
        }
        node.marks().iter().all(|mark| {
            let delta_attrs = formats.get(&mark.name).cloned().unwrap_or_default();
            equal_attrs(&delta_attrs, &mark.attrs)
        })
    })
}

/// Structural equality between a shared child and a normalized editor
/// child. Pure: never consults the identity map.
pub(crate) fn equal_type_node<T: ReadTxn>(txn: &T, y: &XmlOut, p: &NormalizedChild) -> bool {
    match (y, p) {
        (XmlOut::Element(element), NormalizedChild::Element(node)) => {
            if element.tag().as_ref() != node.name() {
                return false;
            }
            if !equal_attrs(&read_attributes(txn, element), node.attrs()) {
                return false;
            }
            let p_children = normalize_children(node);
            let y_len = element.len(txn) as usize;
            if y_len != p_children.len() {
                return false;
            }
            (0..y_len).all(|i| match element.get(txn, i as u32) {
                Some(child) => equal_type_node(txn, &child, &p_children[i]),
                None => false,
            })
        }
        (XmlOut::Text(text), NormalizedChild::TextRun(run)) => equal_text(txn, text, run),
        _ => false,
    }
}

/// Identity equality between a map entry and a normalized editor child.
pub(crate) fn mapped_identity(mapped: Option<&MappedNode>, p: &NormalizedChild) -> bool {
    match (mapped, p) {
        (Some(MappedNode::Element(mapped)), NormalizedChild::Element(node)) => {
            Node::same(mapped, node)
        }
        (Some(MappedNode::TextRun(mapped)), NormalizedChild::TextRun(run)) => {
            mapped.len() == run.len()
                && mapped.iter().zip(run.iter()).all(|(a, b)| Node::same(a, b))
        }
        _ => false,
    }
}

fn refresh_mapping(map: &mut SharedMapping, y: &XmlOut, p: &NormalizedChild) {
    match (y, p) {
        (XmlOut::Element(element), NormalizedChild::Element(node)) => {
            map.set_element(shared_id(element), node.clone());
        }
        (XmlOut::Text(text), NormalizedChild::TextRun(run)) => {
            map.set_text_run(shared_id(text), run.clone());
        }
        _ => {}
    }
}

fn name_matches(y: &XmlOut, p: &NormalizedChild) -> bool {
    matches!(
        (y, p),
        (XmlOut::Element(element), NormalizedChild::Element(node))
            if element.tag().as_ref() == node.name()
    )
}

struct EqualityFactor {
    equality_factor: usize,
    found_mapped_child: bool,
}

/// Count agreeing child positions from both ends of a candidate pair,
/// stopping at the first mismatch on each side. A mapped identity hit both
/// counts and records that this candidate anchors known content.
fn compute_child_equality_factor<T: ReadTxn>(
    txn: &T,
    element: &XmlElementRef,
    node: &Node,
    map: &SharedMapping,
) -> EqualityFactor {
    let y_children: Vec<XmlOut> = {
        let len = element.len(txn);
        (0..len).filter_map(|i| element.get(txn, i)).collect()
    };
    let p_children = normalize_children(node);
    let y_cnt = y_children.len();
    let p_cnt = p_children.len();
    let min_cnt = y_cnt.min(p_cnt);

    let mut left = 0;
    let mut right = 0;
    let mut found_mapped_child = false;

    while left < min_cnt {
        let y = &y_children[left];
        let p = &p_children[left];
        if mapped_identity(map.get(&xml_out_id(y)), p) {
            found_mapped_child = true;
        } else if !equal_type_node(txn, y, p) {
            break;
        }
        left += 1;
    }
    while left + right < min_cnt {
        let y = &y_children[y_cnt - right - 1];
        let p = &p_children[p_cnt - right - 1];
        if mapped_identity(map.get(&xml_out_id(y)), p) {
            found_mapped_child = true;
        } else if !equal_type_node(txn, y, p) {
            break;
        }
        right += 1;
    }

    EqualityFactor {
        equality_factor: left + right,
        found_mapped_child,
    }
}

/// Reconcile an editor node's children and attributes into a shared
/// container.
///
/// Precondition: `y` is the root fragment, or its node name equals the
/// editor node's; a mismatch is a programmer error surfaced as fatal.
pub(crate) fn reconcile_element(
    txn: &mut TransactionMut,
    y: &SharedContainer,
    p: &Node,
    map: &mut SharedMapping,
) -> Result<(), SyncError> {
    map.set_element(y.id(), p.clone());

    if let SharedContainer::Element(element) = y {
        if element.tag().as_ref() != p.name() {
            return Err(SyncError::NodeNameMismatch {
                expected: p.name().to_string(),
                found: element.tag().to_string(),
            });
        }
        reconcile_attributes(txn, element, p);
    }

    let y_children: Vec<XmlOut> = {
        let len = y.len(&*txn);
        (0..len).filter_map(|i| y.get(&*txn, i)).collect()
    };
    let p_children = normalize_children(p);
    let y_cnt = y_children.len();
    let p_cnt = p_children.len();
    let min_cnt = y_cnt.min(p_cnt);

    // Trim matching children from the left.
    let mut left = 0;
    while left < min_cnt {
        let yc = &y_children[left];
        let pc = &p_children[left];
        if mapped_identity(map.get(&xml_out_id(yc)), pc) {
            left += 1;
        } else if equal_type_node(&*txn, yc, pc) {
            refresh_mapping(map, yc, pc);
            left += 1;
        } else {
            break;
        }
    }

    // Trim from the right; the ranges must not cross.
    let mut right = 0;
    while left + right + 1 < min_cnt {
        let yc = &y_children[y_cnt - right - 1];
        let pc = &p_children[p_cnt - right - 1];
        if mapped_identity(map.get(&xml_out_id(yc)), pc) {
            right += 1;
        } else if equal_type_node(&*txn, yc, pc) {
            refresh_mapping(map, yc, pc);
            right += 1;
        } else {
            break;
        }
    }

    // Rewrite the unmatched middle.
    while y_cnt - left - right > 0 && p_cnt - left - right > 0 {
        let y_left = &y_children[left];
        let p_left = &p_children[left];

        if let (XmlOut::Text(ytext), NormalizedChild::TextRun(run)) = (y_left, p_left) {
            if !equal_text(&*txn, ytext, run) {
                reconcile_text(txn, ytext, run, map);
            }
            left += 1;
            continue;
        }

        let y_right = &y_children[y_cnt - right - 1];
        let p_right = &p_children[p_cnt - right - 1];
        let mut update_left = name_matches(y_left, p_left);
        let mut update_right = name_matches(y_right, p_right);

        if update_left && update_right {
            // Both candidates are plausible in-place updates; keep the one
            // anchoring more known content.
            let factor_left = match (y_left, p_left) {
                (XmlOut::Element(element), NormalizedChild::Element(node)) => {
                    compute_child_equality_factor(&*txn, element, node, map)
                }
                _ => unreachable!("name_matches only holds for element pairs"),
            };
            let factor_right = match (y_right, p_right) {
                (XmlOut::Element(element), NormalizedChild::Element(node)) => {
                    compute_child_equality_factor(&*txn, element, node, map)
                }
                _ => unreachable!("name_matches only holds for element pairs"),
            };
            if factor_left.found_mapped_child && !factor_right.found_mapped_child {
                update_right = false;
            } else if !factor_left.found_mapped_child && factor_right.found_mapped_child {
                update_left = false;
            } else if factor_left.equality_factor < factor_right.equality_factor {
                update_left = false;
            } else {
                update_right = false;
            }
        }

        if update_left {
            let (XmlOut::Element(element), NormalizedChild::Element(node)) = (y_left, p_left)
            else {
                unreachable!("name_matches only holds for element pairs")
            };
            reconcile_element(txn, &SharedContainer::Element(element.clone()), node, map)?;
            left += 1;
        } else if update_right {
            let (XmlOut::Element(element), NormalizedChild::Element(node)) = (y_right, p_right)
            else {
                unreachable!("name_matches only holds for element pairs")
            };
            reconcile_element(txn, &SharedContainer::Element(element.clone()), node, map)?;
            right += 1;
        } else {
            map.remove(&xml_out_id(y_left));
            y.remove_range(txn, left as u32, 1);
            build_child(txn, y, left as u32, p_left, map);
            left += 1;
        }
    }

    // Delete whatever the shared side still has in the middle, then build
    // whatever the editor side still has.
    let y_del = y_cnt - left - right;
    if y_del > 0 {
        for yc in &y_children[left..left + y_del] {
            map.remove(&xml_out_id(yc));
        }
        y.remove_range(txn, left as u32, y_del as u32);
    }
    if left + right < p_cnt {
        for (offset, pc) in p_children[left..p_cnt - right].iter().enumerate() {
            build_child(txn, y, (left + offset) as u32, pc, map);
        }
    }
    Ok(())
}

fn reconcile_attributes(txn: &mut TransactionMut, element: &XmlElementRef, p: &Node) {
    for (key, value) in p.attrs() {
        if key == YCHANGE {
            continue;
        }
        if value.is_null() {
            // Null means "not present".
            if element.get_attribute(&*txn, key).is_some() {
                element.remove_attribute(txn, &key.as_str());
            }
        } else {
            let current = element
                .get_attribute(&*txn, key)
                .map(|raw| crate::attrs::attr_string_to_value(&raw));
            if current.as_ref() != Some(value) {
                element.insert_attribute(
                    txn,
                    key.clone(),
                    crate::attrs::any_to_attr_string(&value_to_any(value)),
                );
            }
        }
    }
    let stale: Vec<String> = element
        .attributes(&*txn)
        .map(|(key, _)| key.to_string())
        .filter(|key| !p.attrs().contains_key(key))
        .collect();
    for key in stale {
        element.remove_attribute(txn, &key.as_str());
    }
}

/// Reconcile an editor text run into a shared text: one character-level
/// splice followed by a formatting pass over the retained content.
pub(crate) fn reconcile_text(
    txn: &mut TransactionMut,
    ytext: &XmlTextRef,
    run: &[Node],
    map: &mut SharedMapping,
) {
    map.set_text_run(shared_id(ytext), run.to_vec());

    // Current string plus every formatting key active anywhere in it; the
    // keys seed null overrides so formats absent from the target clear on
    // retained ranges.
    let mut current = String::new();
    let mut null_formats = FormatAttrs::new();
    for chunk in ytext.diff(&*txn, YChange::identity) {
        if let Out::Any(Any::String(content)) = &chunk.insert {
            current.push_str(content);
        }
        if let Some(attrs) = &chunk.attributes {
            for key in attrs.keys() {
                null_formats.insert(key.clone(), Any::Null);
            }
        }
    }

    struct TargetChunk {
        insert: String,
        attributes: FormatAttrs,
    }
    let target: Vec<TargetChunk> = run
        .iter()
        .map(|node| {
            let mut attributes = null_formats.clone();
            attributes.extend(marks_to_attrs(node.marks()));
            TargetChunk {
                insert: node.text().to_string(),
                attributes,
            }
        })
        .collect();
    let target_str: String = target.iter().map(|chunk| chunk.insert.as_str()).collect();

    let change = simple_diff(&current, &target_str);
    if change.remove > 0 {
        ytext.remove_range(txn, change.index as u32, change.remove as u32);
    }
    if !change.insert.is_empty() {
        ytext.insert(txn, change.index as u32, &change.insert);
    }

    let deltas: Vec<Delta<In>> = target
        .iter()
        .map(|chunk| {
            let attributes = if chunk.attributes.is_empty() {
                None
            } else {
                Some(Box::new(chunk.attributes.clone()))
            };
            Delta::Retain(chunk.insert.len() as u32, attributes)
        })
        .collect();
    ytext.apply_delta(txn, deltas);
}

pub(crate) fn build_child(
    txn: &mut TransactionMut,
    parent: &SharedContainer,
    index: u32,
    child: &NormalizedChild,
    map: &mut SharedMapping,
) {
    match child {
        NormalizedChild::Element(node) => build_element(txn, parent, index, node, map),
        NormalizedChild::TextRun(run) => build_text_run(txn, parent, index, run, map),
    }
}

/// Build a fresh shared element (and its whole subtree) from an editor
/// node, recording every created type in the identity map.
fn build_element(
    txn: &mut TransactionMut,
    parent: &SharedContainer,
    index: u32,
    node: &Node,
    map: &mut SharedMapping,
) {
    let element = parent.insert_element(txn, index, node.name());
    for (key, value) in node.attrs() {
        if key != YCHANGE && !value.is_null() {
            element.insert_attribute(
                txn,
                key.clone(),
                crate::attrs::any_to_attr_string(&value_to_any(value)),
            );
        }
    }
    map.set_element(shared_id(&element), node.clone());

    let container = SharedContainer::Element(element);
    for (i, child) in normalize_children(node).iter().enumerate() {
        build_child(txn, &container, i as u32, child, map);
    }
}

fn build_text_run(
    txn: &mut TransactionMut,
    parent: &SharedContainer,
    index: u32,
    run: &[Node],
    map: &mut SharedMapping,
) {
    let text = parent.insert_text(txn, index);
    let deltas: Vec<Delta<In>> = run
        .iter()
        .map(|node| {
            let attributes = marks_to_attrs(node.marks());
            let attributes = if attributes.is_empty() {
                None
            } else {
                Some(Box::new(attributes))
            };
            Delta::Inserted(
                In::Any(Any::String(Arc::from(node.text()))),
                attributes,
            )
        })
        .collect();
    text.apply_delta(txn, deltas);
    map.set_text_run(shared_id(&text), run.to_vec());
}

/// Result of a prefix/suffix string diff: replace `remove` bytes at `index`
/// with `insert`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct StringChange {
    pub index: usize,
    pub remove: usize,
    pub insert: String,
}

/// Linear diff between two strings: longest common prefix and suffix, one
/// replacement in between. Indices are byte offsets aligned to character
/// boundaries.
pub(crate) fn simple_diff(a: &str, b: &str) -> StringChange {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();

    let mut left = 0;
    while left < a_bytes.len() && left < b_bytes.len() && a_bytes[left] == b_bytes[left] {
        left += 1;
    }
    while left > 0 && (!a.is_char_boundary(left) || !b.is_char_boundary(left)) {
        left -= 1;
    }

    let mut right = 0;
    while right < a_bytes.len() - left
        && right < b_bytes.len() - left
        && a_bytes[a_bytes.len() - right - 1] == b_bytes[b_bytes.len() - right - 1]
    {
        right += 1;
    }
    while right > 0
        && (!a.is_char_boundary(a.len() - right) || !b.is_char_boundary(b.len() - right))
    {
        right -= 1;
    }

    StringChange {
        index: left,
        remove: a.len() - left - right,
        insert: b[left..b.len() - right].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manuscript_model::{Mark, Schema};
    use serde_json::json;

    #[test]
    fn test_simple_diff_insert() {
        let change = simple_diff("ab", "acb");
        assert_eq!(
            change,
            StringChange {
                index: 1,
                remove: 0,
                insert: "c".to_string()
            }
        );
    }

    #[test]
    fn test_simple_diff_remove() {
        let change = simple_diff("hello world", "held");
        assert_eq!(change.index, 3);
        assert_eq!(change.remove, 8);
        assert_eq!(change.insert, "d");
    }

    #[test]
    fn test_simple_diff_equal() {
        let change = simple_diff("same", "same");
        assert_eq!(
            change,
            StringChange {
                index: 4,
                remove: 0,
                insert: String::new()
            }
        );
    }

    #[test]
    fn test_simple_diff_respects_char_boundaries() {
        // é (2 bytes) vs è (2 bytes) share their first byte; the diff must
        // not split inside the code point.
        let change = simple_diff("é", "è");
        assert_eq!(change.index, 0);
        assert_eq!(change.remove, "é".len());
        assert_eq!(change.insert, "è");
    }

    #[test]
    fn test_equal_attrs_ignores_null_and_ychange() {
        let mut a = Attrs::new();
        a.insert("level".to_string(), json!(2));
        a.insert("indent".to_string(), json!(null));

        let mut b = Attrs::new();
        b.insert("level".to_string(), json!(2));
        b.insert(YCHANGE.to_string(), json!({"type": "added"}));

        assert!(equal_attrs(&a, &b));

        b.insert("level".to_string(), json!(3));
        assert!(!equal_attrs(&a, &b));
    }

    #[test]
    fn test_normalize_collapses_text_runs() {
        let schema = Schema::basic();
        let bold = Mark {
            name: "bold".to_string(),
            attrs: Attrs::new(),
        };
        let para = schema
            .node(
                "paragraph",
                Attrs::new(),
                vec![
                    schema.text("a", vec![]).unwrap(),
                    schema.text("b", vec![bold]).unwrap(),
                ],
            )
            .unwrap();
        let doc = schema
            .node(
                "doc",
                Attrs::new(),
                vec![para.clone(), schema.node("paragraph", Attrs::new(), vec![]).unwrap()],
            )
            .unwrap();

        let normalized = normalize_children(&doc);
        assert_eq!(normalized.len(), 2);

        let inner = normalize_children(&para);
        assert_eq!(inner.len(), 1);
        match &inner[0] {
            NormalizedChild::TextRun(run) => assert_eq!(run.len(), 2),
            other => panic!("expected text run, got {:?}", other),
        }
    }

    #[test]
    fn test_mapped_identity_distinguishes_runs() {
        let schema = Schema::basic();
        let text = schema.text("ab", vec![]).unwrap();
        let run = vec![text.clone()];

        let mapped = MappedNode::TextRun(run.clone());
        assert!(mapped_identity(
            Some(&mapped),
            &NormalizedChild::TextRun(run.clone())
        ));

        // A structurally equal but distinct node is not identity.
        let other = vec![schema.text("ab", vec![]).unwrap()];
        assert!(!mapped_identity(
            Some(&mapped),
            &NormalizedChild::TextRun(other)
        ));
        assert!(!mapped_identity(None, &NormalizedChild::TextRun(run)));
    }
}
