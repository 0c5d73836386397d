//! Turning the values posted under one form field into staged uploads.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::id::{FileId, IdGenerator};
use super::item::{ItemSource, StagedItem, UploadItem};
use super::store::StagingStore;
use super::StageError;

/// A binary part as received by the transport.
#[derive(Debug)]
pub struct BinaryPart {
    pub source: ItemSource,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

/// One value posted under a field, classified once at the boundary.
#[derive(Debug)]
pub enum FieldInput {
    BinaryPart(BinaryPart),
    /// A text value that is not an id; expected to hold an encoded file.
    InlinePayload(String),
    StagedReference(FileId),
}

impl FieldInput {
    /// Classify a text value: ids become references, anything else is
    /// treated as an inline payload.
    pub fn from_text(value: String) -> Self {
        match FileId::parse(&value) {
            Ok(id) => FieldInput::StagedReference(id),
            Err(_) => FieldInput::InlinePayload(value),
        }
    }
}

/// Wire format of a base64-encoded file posted as a text value.
#[derive(Debug, Deserialize)]
struct EncodedFile {
    name: String,
    #[serde(rename = "type", default)]
    mime_type: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    data: String,
}

/// A resolved field entry: freshly staged, or a reference passed through.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StagedRef {
    Staged(StagedItem),
    Existing { id: FileId },
}

impl StagedRef {
    pub fn id(&self) -> &FileId {
        match self {
            StagedRef::Staged(item) => &item.id,
            StagedRef::Existing { id } => id,
        }
    }
}

impl AsRef<FileId> for StagedRef {
    fn as_ref(&self) -> &FileId {
        self.id()
    }
}

#[derive(Clone)]
pub struct IngestResolver {
    ids: Arc<IdGenerator>,
    store: Arc<StagingStore>,
}

impl IngestResolver {
    pub fn new(ids: Arc<IdGenerator>, store: Arc<StagingStore>) -> Self {
        Self { ids, store }
    }

    pub fn next_id(&self) -> FileId {
        self.ids.next()
    }

    /// Resolve every value posted under one field.
    ///
    /// Results come back as inline payloads, then binary parts, then
    /// references to already staged files. Malformed inline payloads are
    /// dropped; a staging failure is reported in place of that item.
    pub fn resolve_field(&self, inputs: Vec<FieldInput>) -> Vec<Result<StagedRef, StageError>> {
        let mut inline = Vec::new();
        let mut binary = Vec::new();
        let mut references = Vec::new();

        for input in inputs {
            match input {
                FieldInput::InlinePayload(value) => {
                    if let Some(item) = self.decode_inline(&value) {
                        inline.push(item);
                    }
                }
                FieldInput::BinaryPart(part) => binary.push(UploadItem::new(
                    self.next_id(),
                    part.source,
                    part.name,
                    part.size,
                    part.mime_type,
                )),
                FieldInput::StagedReference(id) => references.push(id),
            }
        }

        inline
            .into_iter()
            .chain(binary)
            .map(|item| self.stage(item))
            .chain(
                references
                    .into_iter()
                    .map(|id| Ok(StagedRef::Existing { id })),
            )
            .collect()
    }

    /// Stage a single item, e.g. one built from a remote fetch.
    pub fn stage(&self, item: UploadItem) -> Result<StagedRef, StageError> {
        let name = item.declared_name().to_string();
        self.store.stage(item).map(StagedRef::Staged).map_err(|e| {
            tracing::warn!(name = %name, error = %e, "Failed to stage upload");
            e
        })
    }

    fn decode_inline(&self, value: &str) -> Option<UploadItem> {
        let encoded: EncodedFile = match serde_json::from_str(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping value that is not an encoded file");
                return None;
            }
        };

        let data = match STANDARD.decode(encoded.data.trim()) {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(name = %encoded.name, error = %e, "Skipping encoded file with invalid base64");
                return None;
            }
        };

        if let Some(declared) = encoded.size {
            if declared != data.len() as u64 {
                tracing::debug!(
                    name = %encoded.name,
                    declared,
                    actual = data.len(),
                    "Encoded file size does not match its data"
                );
            }
        }

        let mime_type = encoded
            .mime_type
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        Some(UploadItem::from_bytes(
            self.next_id(),
            encoded.name,
            mime_type,
            Bytes::from(data),
        ))
    }
}
