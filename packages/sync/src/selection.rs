//! # Selection Bridge
//!
//! Carry the editor selection across CRDT transactions as sticky
//! (CRDT-relative) positions.
//!
//! An absolute editor position is converted by descending the editor tree
//! and the shared tree in parallel (in steady state their child lists
//! correspond one to one) until the position lands inside a text run or
//! between two children of a container. The reverse conversion resolves the
//! sticky index back to a shared node, finds its editor counterpart through
//! the identity map and rebuilds the absolute offset.
//!
//! Either direction can fail (content may have disappeared meanwhile); a
//! failed restore silently leaves the selection alone.

use crate::mapping::{MappedNode, SharedMapping};
use crate::reconcile::{normalize_children, NormalizedChild, SharedContainer};
use manuscript_model::{Node, Selection};
use yrs::branch::BranchID;
use yrs::types::xml::{XmlFragmentRef, XmlOut};
use yrs::{Assoc, IndexedSequence, ReadTxn, StickyIndex, TransactionMut};

/// The editor selection captured as CRDT-relative positions. Held only
/// between a capture and the completion of the translation that consumes
/// it.
pub struct RelativeSelection {
    pub(crate) anchor: Option<StickyIndex>,
    pub(crate) head: Option<StickyIndex>,
}

/// Capture the given selection relative to the shared fragment.
pub(crate) fn capture_relative(
    txn: &mut TransactionMut,
    fragment: &XmlFragmentRef,
    doc: &Node,
    selection: Selection,
) -> RelativeSelection {
    RelativeSelection {
        anchor: absolute_position_to_relative(txn, fragment, doc, selection.anchor),
        head: absolute_position_to_relative(txn, fragment, doc, selection.head),
    }
}

/// Resolve a captured selection against the current shared state. Returns
/// a selection only when both ends resolve.
pub(crate) fn restore_relative<T: ReadTxn>(
    txn: &T,
    root_id: &BranchID,
    doc: &Node,
    map: &SharedMapping,
    relative: &RelativeSelection,
) -> Option<Selection> {
    let anchor = relative_position_to_absolute(txn, root_id, doc, map, relative.anchor.as_ref()?)?;
    let head = relative_position_to_absolute(txn, root_id, doc, map, relative.head.as_ref()?)?;
    Some(Selection::new(anchor, head))
}

/// Convert an absolute editor position into a CRDT-relative position
/// inside the shared fragment. `None` when the position does not resolve
/// against the current shared state.
pub fn absolute_position_to_relative(
    txn: &mut TransactionMut,
    fragment: &XmlFragmentRef,
    doc: &Node,
    pos: usize,
) -> Option<StickyIndex> {
    let mut container = SharedContainer::Fragment(fragment.clone());
    let mut node = doc.clone();
    let mut rem = pos;

    'descend: loop {
        let mut y_index = 0u32;
        for child in normalize_children(&node) {
            match child {
                NormalizedChild::Element(child_node) => {
                    if rem == 0 {
                        return container_sticky(txn, &container, y_index);
                    }
                    let size = child_node.size();
                    if rem < size {
                        let Some(XmlOut::Element(element)) = container.get(&*txn, y_index)
                        else {
                            return None;
                        };
                        container = SharedContainer::Element(element);
                        node = child_node;
                        rem -= 1;
                        continue 'descend;
                    }
                    rem -= size;
                    y_index += 1;
                }
                NormalizedChild::TextRun(run) => {
                    let chars: usize = run.iter().map(Node::size).sum();
                    if rem <= chars {
                        let Some(XmlOut::Text(text)) = container.get(&*txn, y_index) else {
                            return None;
                        };
                        let joined: String =
                            run.iter().map(Node::text).collect::<Vec<_>>().concat();
                        let byte = char_to_byte(&joined, rem);
                        return text.sticky_index(txn, byte as u32, Assoc::After);
                    }
                    rem -= chars;
                    y_index += 1;
                }
            }
        }
        // Past the last child: anchor at the container's end.
        return if rem == 0 {
            container_sticky(txn, &container, y_index)
        } else {
            None
        };
    }
}

fn container_sticky(
    txn: &mut TransactionMut,
    container: &SharedContainer,
    index: u32,
) -> Option<StickyIndex> {
    match container {
        SharedContainer::Fragment(fragment) => fragment.sticky_index(txn, index, Assoc::After),
        SharedContainer::Element(element) => element.sticky_index(txn, index, Assoc::After),
    }
}

/// Convert a CRDT-relative position back to an absolute editor position.
/// `None` when the referenced shared node is gone or unmapped; the caller
/// leaves the selection alone in that case.
pub fn relative_position_to_absolute<T: ReadTxn>(
    txn: &T,
    root_id: &BranchID,
    doc: &Node,
    map: &SharedMapping,
    sticky: &StickyIndex,
) -> Option<usize> {
    let offset = sticky.get_offset(txn)?;
    let id = offset.branch.id();

    if id == *root_id {
        return child_offset(doc, 0, offset.index as usize);
    }

    match map.get(&id)? {
        MappedNode::TextRun(run) => {
            let first = run.first()?;
            let start = doc.position_of(first)?;
            let joined: String = run.iter().map(Node::text).collect::<Vec<_>>().concat();
            Some(start + byte_to_char(&joined, offset.index as usize))
        }
        MappedNode::Element(node) => {
            let base = doc.position_of(node)? + 1;
            child_offset(node, base, offset.index as usize)
        }
    }
}

/// Absolute position of the child boundary at normalized index `index`
/// inside `parent`, whose content starts at `base`.
fn child_offset(parent: &Node, base: usize, index: usize) -> Option<usize> {
    let children = normalize_children(parent);
    if index > children.len() {
        return None;
    }
    Some(
        base + children[..index]
            .iter()
            .map(NormalizedChild::size)
            .sum::<usize>(),
    )
}

fn char_to_byte(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map(|(i, _)| i).unwrap_or(s.len())
}

fn byte_to_char(s: &str, byte: usize) -> usize {
    let mut boundary = byte.min(s.len());
    while boundary > 0 && !s.is_char_boundary(boundary) {
        boundary -= 1;
    }
    s[..boundary].chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_byte_conversions() {
        let s = "aé b";
        assert_eq!(char_to_byte(s, 0), 0);
        assert_eq!(char_to_byte(s, 2), 3);
        assert_eq!(char_to_byte(s, 4), s.len());
        assert_eq!(byte_to_char(s, 3), 2);
        assert_eq!(byte_to_char(s, s.len()), 4);
        // Mid-code-point offsets floor to the previous boundary.
        assert_eq!(byte_to_char(s, 2), 1);
    }
}
