//! Temporary-upload staging engine.
//!
//! Incoming payloads are assigned a [`FileId`], written into an isolated
//! directory under the staging root, and later either committed to permanent
//! storage or discarded.

pub mod commit;
pub mod id;
pub mod ingest;
pub mod item;
pub mod paths;
pub mod store;

pub use commit::{CommitCoordinator, CommitError, CommitReport, CommitResult};
pub use id::{FileId, IdGenerator};
pub use ingest::{BinaryPart, FieldInput, IngestResolver, StagedRef};
pub use item::{ItemSource, StagedItem, UploadItem};
pub use store::{FileBlob, StagingStore};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error("Staged file not found: {0}")]
    NotFound(FileId),
    #[error("Identifier already staged: {0}")]
    AlreadyStaged(FileId),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
