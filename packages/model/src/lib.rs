//! # Manuscript Model
//!
//! Rich-text editor document model for Manuscript.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ model: typed document tree + editing state  │
//! │  - Immutable nodes with identity semantics  │
//! │  - Schema-validated construction            │
//! │  - Replacement transactions + selections    │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ sync: document ↔ CRDT reconciliation        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Core Principles
//!
//! 1. **Nodes are values**: cloning is cheap, mutation always builds new trees
//! 2. **Identity is preserved**: an unchanged subtree keeps its exact node
//!    identity across transactions, which downstream diffing relies on
//! 3. **Schemas validate construction**: invalid attribute or mark
//!    combinations fail at build time, never later
//! 4. **Transactions replace**: a transaction carries a whole replacement
//!    document plus selection and metadata

mod node;
mod schema;
mod state;

pub use node::{Attrs, Mark, Node};
pub use schema::{AttrSpec, MarkSpec, NodeSpec, Schema, SchemaError, YCHANGE};
pub use state::{EditorState, EditorView, Selection, Transaction};
