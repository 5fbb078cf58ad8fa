//! # Manuscript Sync
//!
//! Bidirectional binding between a Manuscript editor document and a
//! replicated shared document (a `yrs` XML fragment).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ editor view: typed nodes + transactions     │
//! └─────────────────────────────────────────────┘
//!        ↓ reconcile              ↑ materialize
//! ┌─────────────────────────────────────────────┐
//! │ sync binding                                │
//! │  - identity map (shared node ↔ editor node) │
//! │  - re-entrancy gate (no echo translation)   │
//! │  - selection bridge (relative positions)    │
//! │  - historical renders (ychange annotations) │
//! └─────────────────────────────────────────────┘
//!        ↓ transactions           ↑ deep events
//! ┌─────────────────────────────────────────────┐
//! │ yrs: replicated XML fragment                │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Core Principles
//!
//! 1. **Minimal operations**: a local edit becomes the smallest faithful
//!    mutation of the shared tree; untouched siblings keep their identity
//!    so peers see a minimal operation log
//! 2. **One transaction each way**: one editor dispatch emits at most one
//!    shared transaction; one shared transaction yields exactly one editor
//!    replacement transaction
//! 3. **Convergence over rejection**: content the local schema cannot
//!    represent is deleted from the shared document, converging replicas
//!    onto the locally-valid intersection
//! 4. **Cooperative single-threaded scheduling**: no component suspends
//!    inside a gated region; deferral is an explicit queue

mod attrs;
mod binding;
mod errors;
mod gate;
mod mapping;
mod materialize;
mod reconcile;
mod selection;
mod snapshot;

pub use binding::{
    initial_document, is_change_origin, SyncBinding, SyncMeta, SyncOptions, SYNC_META_KEY,
};
pub use errors::SyncError;
pub use mapping::SharedMapping;
pub use selection::{
    absolute_position_to_relative, relative_position_to_absolute, RelativeSelection,
};
pub use snapshot::{default_color, ColorPair, StaticUserResolver, UserResolver};

pub use manuscript_model::YCHANGE;

// Re-export the CRDT backend so hosts can construct documents and
// snapshots without pinning their own copy.
pub use yrs;
