//! Error types for the sync layer

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Schema error: {0}")]
    Schema(#[from] manuscript_model::SchemaError),

    #[error("Unsupported shared node kind: {0}")]
    UnsupportedNodeKind(&'static str),

    #[error("Node name mismatch: expected {expected}, found {found}")]
    NodeNameMismatch { expected: String, found: String },

    #[error("Failed to decode update: {0}")]
    UpdateDecode(String),

    #[error("Failed to apply update: {0}")]
    UpdateApply(String),

    #[error("Failed to encode snapshot state: {0}")]
    SnapshotEncoding(String),
}
