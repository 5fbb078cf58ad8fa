//! # Historical Rendering Support
//!
//! Author attribution, color allocation and the historical document
//! restore that backs snapshot renders.
//!
//! A snapshot render shows the document as it existed between two
//! snapshots, with content added or removed in between decorated per
//! author. Colors come from a palette; assignment is sticky per author and
//! driven by an injectable random source so tests stay deterministic.

use crate::errors::SyncError;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use yrs::block::{ClientID, ID};
use yrs::types::text::ChangeKind;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::{Encoder, EncoderV1};
use yrs::types::xml::XmlFragmentRef;
use yrs::{Doc, Options, ReadTxn, Snapshot, Transact, TransactionMut, Update};

/// A light/dark color pair used to decorate one author's changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorPair {
    pub light: String,
    pub dark: String,
}

impl ColorPair {
    pub fn new(light: impl Into<String>, dark: impl Into<String>) -> Self {
        Self {
            light: light.into(),
            dark: dark.into(),
        }
    }
}

/// Default annotation color: a translucent/solid amber pair.
pub fn default_color() -> ColorPair {
    ColorPair::new("#ecd44433", "#ecd444")
}

/// Resolves author identity from shared-document item ids.
///
/// The shared document records which client created or deleted an item;
/// hosts that track durable author identities implement this seam. Without
/// a resolver, change annotations carry the change type only.
pub trait UserResolver: Send + Sync {
    fn user_by_client_id(&self, client: ClientID) -> Option<String>;

    fn user_by_deleted_id(&self, id: &ID) -> Option<String> {
        self.user_by_client_id(id.client)
    }

    /// Called inside a transaction before a historical render so lazily
    /// materialized identity state exists before deleted-id lookups.
    fn prepare(&self, _txn: &TransactionMut) {}
}

/// Map-backed resolver: client id → user name.
#[derive(Default)]
pub struct StaticUserResolver {
    by_client: HashMap<ClientID, String>,
}

impl StaticUserResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, client: ClientID, user: impl Into<String>) {
        self.by_client.insert(client, user.into());
    }
}

impl UserResolver for StaticUserResolver {
    fn user_by_client_id(&self, client: ClientID) -> Option<String> {
        self.by_client.get(&client).cloned()
    }
}

/// Sticky per-author color assignment over a fixed palette.
pub(crate) struct ColorAllocator {
    palette: Vec<ColorPair>,
    assigned: HashMap<String, ColorPair>,
    rng: SmallRng,
}

impl ColorAllocator {
    pub(crate) fn new(
        palette: Vec<ColorPair>,
        preseeded: HashMap<String, ColorPair>,
        seed: u64,
    ) -> Self {
        let palette = if palette.is_empty() {
            vec![default_color()]
        } else {
            palette
        };
        Self {
            palette,
            assigned: preseeded,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Color for `user`, assigning one on first sight: picked uniformly
    /// from the unused palette subset while one exists, from the full
    /// palette once every color is taken.
    pub(crate) fn color_for(&mut self, user: &str) -> ColorPair {
        if let Some(color) = self.assigned.get(user) {
            return color.clone();
        }
        let unused: Vec<ColorPair> = self
            .palette
            .iter()
            .filter(|color| !self.assigned.values().any(|taken| taken == *color))
            .cloned()
            .collect();
        let pool = if self.assigned.len() >= self.palette.len() || unused.is_empty() {
            &self.palette
        } else {
            &unused
        };
        let choice = pool[self.rng.random_range(0..pool.len())].clone();
        self.assigned.insert(user.to_string(), choice.clone());
        choice
    }
}

/// The full `ychange` annotation value for one change.
pub(crate) fn change_value(
    kind: ChangeKind,
    id: ID,
    resolver: Option<&dyn UserResolver>,
    colors: &mut ColorAllocator,
) -> Value {
    let change_type = match kind {
        ChangeKind::Added => "added",
        ChangeKind::Removed => "removed",
    };
    let mut value = json!({ "type": change_type });
    if let Some(resolver) = resolver {
        let user = match kind {
            ChangeKind::Added => resolver.user_by_client_id(id.client),
            ChangeKind::Removed => resolver.user_by_deleted_id(&id),
        };
        if let Some(user) = user {
            let color = colors.color_for(&user);
            value["user"] = Value::from(user);
            value["color"] = json!({ "light": color.light, "dark": color.dark });
        }
    }
    value
}

/// Restore the historical document bounded by `(prev.delete_set,
/// snapshot.state_map)` into a sibling doc.
///
/// The composite view keeps items deleted between the two snapshots alive,
/// which is exactly the set a removed-content annotation needs to show.
/// Item ids survive the restore, so visibility checks against the two
/// original snapshots stay valid on the restored tree.
pub(crate) fn restore_historical(
    doc: &Doc,
    root_name: &str,
    snapshot: &Snapshot,
    prev: &Snapshot,
) -> Result<(Doc, XmlFragmentRef), SyncError> {
    let composite = Snapshot::new(snapshot.state_map.clone(), prev.delete_set.clone());
    let update = {
        let txn = doc.transact();
        let mut encoder = EncoderV1::new();
        txn.encode_state_from_snapshot(&composite, &mut encoder)
            .map_err(|err| SyncError::SnapshotEncoding(err.to_string()))?;
        encoder.to_vec()
    };

    let historical = Doc::with_options(Options {
        skip_gc: true,
        ..Default::default()
    });
    let fragment = historical.get_or_insert_xml_fragment(root_name);
    {
        let mut txn = historical.transact_mut();
        let update =
            Update::decode_v1(&update).map_err(|err| SyncError::UpdateDecode(err.to_string()))?;
        txn.apply_update(update)
            .map_err(|err| SyncError::UpdateApply(err.to_string()))?;
    }
    Ok((historical, fragment))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn palette(n: usize) -> Vec<ColorPair> {
        (0..n)
            .map(|i| ColorPair::new(format!("#light{i}"), format!("#dark{i}")))
            .collect()
    }

    #[test]
    fn test_assignment_is_sticky() {
        let mut colors = ColorAllocator::new(palette(3), HashMap::new(), 1);
        let first = colors.color_for("alice");
        assert_eq!(colors.color_for("alice"), first);
    }

    #[test]
    fn test_unused_colors_preferred() {
        let mut colors = ColorAllocator::new(palette(2), HashMap::new(), 42);
        let a = colors.color_for("alice");
        let b = colors.color_for("bob");
        assert_ne!(a, b);
    }

    #[test]
    fn test_exhausted_palette_reuses_colors() {
        let mut colors = ColorAllocator::new(palette(2), HashMap::new(), 7);
        colors.color_for("alice");
        colors.color_for("bob");
        // Third author still gets a color from the palette.
        let c = colors.color_for("carol");
        assert!(palette(2).contains(&c));
    }

    #[test]
    fn test_preseeded_mapping_wins() {
        let mut preseeded = HashMap::new();
        preseeded.insert("alice".to_string(), ColorPair::new("#l", "#d"));
        let mut colors = ColorAllocator::new(palette(2), preseeded, 3);
        assert_eq!(colors.color_for("alice"), ColorPair::new("#l", "#d"));
    }

    #[test]
    fn test_change_value_without_resolver() {
        let mut colors = ColorAllocator::new(palette(1), HashMap::new(), 0);
        let value = change_value(ChangeKind::Added, ID::new(1, 0), None, &mut colors);
        assert_eq!(value, serde_json::json!({ "type": "added" }));
    }

    #[test]
    fn test_change_value_with_resolver() {
        let mut resolver = StaticUserResolver::new();
        resolver.insert(1, "alice");
        let mut colors = ColorAllocator::new(palette(1), HashMap::new(), 0);

        let value = change_value(
            ChangeKind::Added,
            ID::new(1, 0),
            Some(&resolver),
            &mut colors,
        );
        assert_eq!(value["type"], "added");
        assert_eq!(value["user"], "alice");
        assert_eq!(value["color"]["light"], "#light0");
    }
}
