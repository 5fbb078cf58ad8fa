//! # Sync Binding
//!
//! Owns the identity map, the re-entrancy gate and the two translation
//! directions between an editor view and a shared XML fragment.
//!
//! ## Data flow
//!
//! - **Editor → CRDT**: the host calls [`SyncBinding::editor_updated`]
//!   after a local dispatch. Inside the gate the binding captures the
//!   selection as relative positions, opens one shared-document transaction
//!   and reconciles the editor document into the fragment.
//! - **CRDT → Editor**: the deep observer records each foreign transaction
//!   (changed types + delete set); [`SyncBinding::flush_remote_events`]
//!   prunes the identity map, rebuilds the top-level content and issues a
//!   single replacement transaction tagged as change-origin, restoring the
//!   captured selection.
//! - **Historical renders** are deferred onto an explicit queue the host
//!   drains with [`SyncBinding::flush_deferred`] after the current work
//!   unwinds. While a snapshot is shown the editor is read-only and local
//!   changes are suppressed.
//!
//! Every mutation of either side runs inside the gate, so a change the
//! binding itself makes is never translated back.

use crate::errors::SyncError;
use crate::gate::ObservationGate;
use crate::mapping::{shared_id, xml_out_id, SharedMapping};
use crate::materialize::{materialize_children, HistoricalView};
use crate::reconcile::{reconcile_element, SharedContainer};
use crate::selection::{capture_relative, restore_relative, RelativeSelection};
use crate::snapshot::{
    change_value, default_color, restore_historical, ColorAllocator, ColorPair, UserResolver,
};
use manuscript_model::{Attrs, EditorView, Node, Schema, Transaction};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};
use yrs::block::ID;
use yrs::branch::BranchID;
use yrs::types::text::ChangeKind;
use yrs::types::xml::{XmlFragment, XmlFragmentRef, XmlOut};
use yrs::types::{Event, PathSegment};
use yrs::updates::decoder::Decode;
use yrs::{DeepObservable, DeleteSet, Doc, Snapshot, Subscription, Transact, Update};

/// Meta key under which sync transactions publish their state.
pub const SYNC_META_KEY: &str = "y-sync";

/// Transaction origin marker for shared-document transactions the binding
/// itself opens.
const BINDING_ORIGIN: &str = "manuscript-sync";

/// Metadata attached to every editor transaction the binding emits, so
/// downstream plugins can distinguish remote from local changes and track
/// the active historical view.
#[derive(Clone)]
pub struct SyncMeta {
    pub is_change_origin: bool,
    pub snapshot: Option<Snapshot>,
    pub prev_snapshot: Option<Snapshot>,
}

/// Whether a transaction was produced by the binding (i.e. reflects remote
/// content rather than local typing).
pub fn is_change_origin(tr: &Transaction) -> bool {
    tr.meta::<SyncMeta>(SYNC_META_KEY)
        .map(|meta| meta.is_change_origin)
        .unwrap_or(false)
}

/// Binding configuration.
pub struct SyncOptions {
    /// Palette for author annotations.
    pub colors: Vec<ColorPair>,

    /// Preseeded author → color assignments.
    pub color_mapping: HashMap<String, ColorPair>,

    /// Author identity service; without it annotations carry the change
    /// type only.
    pub user_resolver: Option<Arc<dyn UserResolver>>,

    /// Seed for the color allocator's random source.
    pub color_seed: u64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            colors: vec![default_color()],
            color_mapping: HashMap::new(),
            user_resolver: None,
            color_seed: 0x6d73,
        }
    }
}

/// One foreign shared-document transaction as seen by the deep observer.
struct RemoteBatch {
    changed: Vec<BranchID>,
    deleted: DeleteSet,
}

enum DeferredTask {
    RenderSnapshot { snapshot: Snapshot, prev: Snapshot },
    Unrender,
}

struct BindingCore {
    mapping: SharedMapping,
    relative_selection: Option<RelativeSelection>,
    snapshot: Option<(Snapshot, Snapshot)>,
    ever_nontrivial: bool,
    pending_remote: Vec<RemoteBatch>,
    deferred: VecDeque<DeferredTask>,
    colors: Mutex<ColorAllocator>,
    user_resolver: Option<Arc<dyn UserResolver>>,
    destroyed: bool,
}

/// The binding between one editor view and one shared XML fragment.
pub struct SyncBinding {
    doc: Doc,
    fragment: XmlFragmentRef,
    root_name: String,
    view: Option<Rc<RefCell<EditorView>>>,
    core: Arc<Mutex<BindingCore>>,
    gate: ObservationGate,
    subscription: Option<Subscription>,
}

impl SyncBinding {
    /// Create a binding over the named root fragment of `doc`, subscribing
    /// to its deep events. If the fragment already has content it is
    /// rendered into the view immediately.
    pub fn new(
        doc: &Doc,
        root_name: &str,
        view: Rc<RefCell<EditorView>>,
        options: SyncOptions,
    ) -> Result<Self, SyncError> {
        let fragment = doc.get_or_insert_xml_fragment(root_name);

        let core = Arc::new(Mutex::new(BindingCore {
            mapping: SharedMapping::new(),
            relative_selection: None,
            snapshot: None,
            ever_nontrivial: false,
            pending_remote: Vec::new(),
            deferred: VecDeque::new(),
            colors: Mutex::new(ColorAllocator::new(
                options.colors,
                options.color_mapping,
                options.color_seed,
            )),
            user_resolver: options.user_resolver,
            destroyed: false,
        }));
        let gate = ObservationGate::new();

        let subscription = {
            let core = Arc::clone(&core);
            let gate = gate.clone();
            let root = fragment.clone();
            fragment.observe_deep(move |txn, events| {
                // Our own transactions must not be translated back.
                if gate.is_held() {
                    return;
                }
                let mut changed = Vec::new();
                for event in events.iter() {
                    let path = match event {
                        Event::XmlFragment(event) => {
                            changed.push(xml_out_id(event.target()));
                            event.path()
                        }
                        Event::XmlText(event) => {
                            changed.push(shared_id(event.target()));
                            event.path()
                        }
                        _ => continue,
                    };
                    // A changed node invalidates its whole ancestor chain:
                    // cached ancestors embed the stale subtree.
                    changed.push(shared_id(&root));
                    let mut node = XmlOut::Fragment(root.clone());
                    for segment in path {
                        let PathSegment::Index(index) = segment else {
                            break;
                        };
                        let child = match &node {
                            XmlOut::Fragment(fragment) => fragment.get(txn, index),
                            XmlOut::Element(element) => element.get(txn, index),
                            XmlOut::Text(_) => None,
                        };
                        match child {
                            Some(child) => {
                                changed.push(xml_out_id(&child));
                                node = child;
                            }
                            None => break,
                        }
                    }
                }
                let deleted = txn.delete_set().clone();
                core.lock()
                    .unwrap()
                    .pending_remote
                    .push(RemoteBatch { changed, deleted });
            })
        };

        let binding = Self {
            doc: doc.clone(),
            fragment,
            root_name: root_name.to_string(),
            view: Some(view),
            core,
            gate,
            subscription: Some(subscription),
        };

        let has_content = {
            let txn = binding.doc.transact();
            binding.fragment.len(&txn) > 0
        };
        if has_content {
            binding.core.lock().unwrap().ever_nontrivial = true;
            binding.rebuild_live()?;
        }
        Ok(binding)
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn fragment(&self) -> &XmlFragmentRef {
        &self.fragment
    }

    pub fn snapshot_active(&self) -> bool {
        self.core.lock().unwrap().snapshot.is_some()
    }

    /// Number of shared nodes currently tracked by the identity map.
    pub fn mapping_len(&self) -> usize {
        self.core.lock().unwrap().mapping.len()
    }

    /// Translate the editor document into the shared fragment after a
    /// local dispatch.
    ///
    /// Skipped while a snapshot view is active. Also skipped until the
    /// document has ever been non-trivial: the editor schema always holds
    /// one empty block, and translating it on first load would dirty the
    /// shared document.
    #[instrument(skip(self))]
    pub fn editor_updated(&self) -> Result<(), SyncError> {
        let Some(view) = &self.view else {
            return Ok(());
        };
        {
            let core = self.core.lock().unwrap();
            if core.destroyed || core.snapshot.is_some() {
                return Ok(());
            }
        }

        let (doc_node, selection) = {
            let view = view.borrow();
            (view.state().doc().clone(), view.state().selection())
        };
        let nontrivial = doc_node.content_size() > 2;
        {
            let mut core = self.core.lock().unwrap();
            if !core.ever_nontrivial && !nontrivial {
                return Ok(());
            }
            if nontrivial {
                core.ever_nontrivial = true;
            }
        }

        let Some(_guard) = self.gate.enter() else {
            return Ok(());
        };
        let mut txn = self.doc.transact_mut_with(BINDING_ORIGIN);
        let mut core = self.core.lock().unwrap();
        reconcile_element(
            &mut txn,
            &SharedContainer::Fragment(self.fragment.clone()),
            &doc_node,
            &mut core.mapping,
        )?;
        // Capture once both sides agree again, so the relative positions
        // are taken against the state a later remote transaction starts
        // from.
        core.relative_selection =
            Some(capture_relative(&mut txn, &self.fragment, &doc_node, selection));
        drop(core);
        drop(txn);
        Ok(())
    }

    /// Decode and apply a remote update, then translate its effects into
    /// the editor.
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<(), SyncError> {
        self.capture_selection_if_absent();
        let decoded =
            Update::decode_v1(update).map_err(|err| SyncError::UpdateDecode(err.to_string()))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|err| SyncError::UpdateApply(err.to_string()))?;
        }
        self.flush_remote_events()
    }

    /// Capture the current selection as relative positions unless a
    /// capture is already pending. Runs before a foreign transaction is
    /// applied, against the state that transaction starts from.
    fn capture_selection_if_absent(&self) {
        let Some(view) = &self.view else {
            return;
        };
        {
            let core = self.core.lock().unwrap();
            if core.destroyed || core.snapshot.is_some() || core.relative_selection.is_some() {
                return;
            }
        }
        let (doc_node, selection) = {
            let view = view.borrow();
            (view.state().doc().clone(), view.state().selection())
        };
        // Creating sticky indices emits no events, so this transaction is
        // invisible to the observer.
        let relative = {
            let mut txn = self.doc.transact_mut_with(BINDING_ORIGIN);
            capture_relative(&mut txn, &self.fragment, &doc_node, selection)
        };
        self.core.lock().unwrap().relative_selection = Some(relative);
    }

    /// Translate pending foreign shared-document transactions into a
    /// single editor replacement transaction per batch group.
    #[instrument(skip(self))]
    pub fn flush_remote_events(&self) -> Result<(), SyncError> {
        let Some(view) = &self.view else {
            return Ok(());
        };
        let batches = {
            let mut core = self.core.lock().unwrap();
            if core.destroyed {
                return Ok(());
            }
            std::mem::take(&mut core.pending_remote)
        };
        if batches.is_empty() {
            return Ok(());
        }

        // While a historical view is shown, live content changes do not
        // reach the editor; the view is refreshed instead.
        {
            let mut core = self.core.lock().unwrap();
            if let Some((snapshot, prev)) = core.snapshot.clone() {
                core.deferred
                    .push_back(DeferredTask::RenderSnapshot { snapshot, prev });
                return Ok(());
            }
        }

        let Some(_guard) = self.gate.enter() else {
            return Ok(());
        };
        let (schema, doc_name, doc_attrs) = {
            let view = view.borrow();
            let state = view.state();
            (
                state.schema().clone(),
                state.doc().name().to_string(),
                state.doc().attrs().clone(),
            )
        };

        let mut core = self.core.lock().unwrap();
        let core = &mut *core;
        for batch in &batches {
            core.mapping.retain_live(&batch.deleted);
            for id in &batch.changed {
                core.mapping.remove(id);
            }
        }
        debug!(batches = batches.len(), "translating remote batches");

        let mut txn = self.doc.transact_mut_with(BINDING_ORIGIN);
        let children =
            materialize_children(&mut txn, &self.fragment, &schema, &mut core.mapping, None, None)?;
        let new_doc = schema.node(&doc_name, doc_attrs, children)?;
        let root_id = shared_id(&self.fragment);
        core.mapping.set_element(root_id.clone(), new_doc.clone());

        let selection = core
            .relative_selection
            .take()
            .and_then(|rel| restore_relative(&txn, &root_id, &new_doc, &core.mapping, &rel));
        drop(txn);

        let mut tr = Transaction::new();
        tr.replace_document(new_doc);
        if let Some(selection) = selection {
            tr.set_selection(selection);
        }
        tr.set_meta(
            SYNC_META_KEY,
            SyncMeta {
                is_change_origin: true,
                snapshot: None,
                prev_snapshot: None,
            },
        );
        view.borrow_mut().dispatch(&tr);
        Ok(())
    }

    /// Schedule a historical render between two snapshots. `prev` defaults
    /// to the empty snapshot. Runs when the host drains the deferred queue.
    pub fn render_snapshot(&self, snapshot: Snapshot, prev: Option<Snapshot>) {
        self.core
            .lock()
            .unwrap()
            .deferred
            .push_back(DeferredTask::RenderSnapshot {
                snapshot,
                prev: prev.unwrap_or_default(),
            });
    }

    /// Schedule leaving the historical view.
    pub fn unrender_snapshot(&self) {
        self.core
            .lock()
            .unwrap()
            .deferred
            .push_back(DeferredTask::Unrender);
    }

    /// Drain the deferred queue. A superseded render still runs; renders
    /// reset the identity map first, so this stays idempotent.
    pub fn flush_deferred(&self) -> Result<(), SyncError> {
        loop {
            let task = self.core.lock().unwrap().deferred.pop_front();
            match task {
                None => return Ok(()),
                Some(DeferredTask::RenderSnapshot { snapshot, prev }) => {
                    self.render_snapshot_now(snapshot, prev)?;
                }
                Some(DeferredTask::Unrender) => {
                    self.unrender_now()?;
                }
            }
        }
    }

    /// Throw the identity map away and rebuild the editor document from
    /// the shared state.
    pub fn force_rerender(&self) -> Result<(), SyncError> {
        let active = self.core.lock().unwrap().snapshot.clone();
        match active {
            Some((snapshot, prev)) => self.render_snapshot_now(snapshot, prev),
            None => self.rebuild_live(),
        }
    }

    /// Unsubscribe from the shared document and release the view. The
    /// binding is inert afterwards.
    pub fn destroy(&mut self) {
        self.subscription.take();
        self.view.take();
        let mut core = self.core.lock().unwrap();
        core.destroyed = true;
        core.mapping.clear();
        core.pending_remote.clear();
        core.deferred.clear();
        core.relative_selection = None;
    }

    fn render_snapshot_now(&self, snapshot: Snapshot, prev: Snapshot) -> Result<(), SyncError> {
        let Some(view) = &self.view else {
            return Ok(());
        };
        // Nested acquisition is a no-op: rendering may already be running
        // inside a gated region.
        let _guard = self.gate.enter();

        let (schema, doc_name, doc_attrs) = {
            let view = view.borrow();
            let state = view.state();
            (
                state.schema().clone(),
                state.doc().name().to_string(),
                state.doc().attrs().clone(),
            )
        };

        let mut core = self.core.lock().unwrap();
        if core.destroyed {
            return Ok(());
        }
        let core = &mut *core;
        core.mapping.clear();
        core.snapshot = Some((snapshot.clone(), prev.clone()));

        // Give the identity service a transaction to materialize any lazy
        // state before deleted-id lookups happen.
        if let Some(resolver) = core.user_resolver.clone() {
            let txn = self.doc.transact_mut();
            resolver.prepare(&txn);
        }

        let (historical, fragment) =
            restore_historical(&self.doc, &self.root_name, &snapshot, &prev)?;

        let resolver = core.user_resolver.clone();
        let resolver_ref: Option<&dyn UserResolver> = resolver.as_deref();
        let colors = &core.colors;
        let resolve = |kind: ChangeKind, id: ID| -> Value {
            change_value(kind, id, resolver_ref, &mut colors.lock().unwrap())
        };

        let view_pair = HistoricalView {
            snapshot: &snapshot,
            prev: &prev,
        };
        let mut txn = historical.transact_mut();
        let children = materialize_children(
            &mut txn,
            &fragment,
            &schema,
            &mut core.mapping,
            Some(view_pair),
            Some(&resolve),
        )?;
        drop(txn);
        let new_doc = schema.node(&doc_name, doc_attrs, children)?;

        let mut tr = Transaction::new();
        tr.replace_document(new_doc);
        tr.set_meta(
            SYNC_META_KEY,
            SyncMeta {
                is_change_origin: true,
                snapshot: Some(snapshot),
                prev_snapshot: Some(prev),
            },
        );
        let mut view = view.borrow_mut();
        view.dispatch(&tr);
        view.set_editable(false);
        Ok(())
    }

    fn unrender_now(&self) -> Result<(), SyncError> {
        {
            let mut core = self.core.lock().unwrap();
            if core.destroyed {
                return Ok(());
            }
            core.snapshot = None;
        }
        self.rebuild_live()
    }

    /// Rebuild the editor document from the live shared state with a fresh
    /// identity map.
    fn rebuild_live(&self) -> Result<(), SyncError> {
        let Some(view) = &self.view else {
            return Ok(());
        };
        let _guard = self.gate.enter();

        let (schema, doc_name, doc_attrs) = {
            let view = view.borrow();
            let state = view.state();
            (
                state.schema().clone(),
                state.doc().name().to_string(),
                state.doc().attrs().clone(),
            )
        };

        let mut core = self.core.lock().unwrap();
        if core.destroyed {
            return Ok(());
        }
        let core = &mut *core;
        core.mapping.clear();

        let mut txn = self.doc.transact_mut_with(BINDING_ORIGIN);
        let children =
            materialize_children(&mut txn, &self.fragment, &schema, &mut core.mapping, None, None)?;
        drop(txn);
        let new_doc = schema.node(&doc_name, doc_attrs, children)?;
        core.mapping
            .set_element(shared_id(&self.fragment), new_doc.clone());

        let mut tr = Transaction::new();
        tr.replace_document(new_doc);
        tr.set_meta(
            SYNC_META_KEY,
            SyncMeta {
                is_change_origin: true,
                snapshot: None,
                prev_snapshot: None,
            },
        );
        let mut view = view.borrow_mut();
        view.dispatch(&tr);
        view.set_editable(true);
        Ok(())
    }
}

impl Drop for SyncBinding {
    fn drop(&mut self) {
        if self.subscription.is_some() {
            self.destroy();
        }
    }
}

/// Build an initial editor document for an empty fragment: the schema's
/// document node around one empty block.
pub fn initial_document(schema: &Schema, block: &str) -> Result<Node, SyncError> {
    let block = schema.node(block, Attrs::new(), vec![])?;
    Ok(schema.node("doc", Attrs::new(), vec![block])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_meta_lookup() {
        let mut tr = Transaction::new();
        assert!(!is_change_origin(&tr));

        tr.set_meta(
            SYNC_META_KEY,
            SyncMeta {
                is_change_origin: true,
                snapshot: None,
                prev_snapshot: None,
            },
        );
        assert!(is_change_origin(&tr));
    }
}
