use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::Serialize;
use tempfile::TempPath;

use super::id::FileId;
use super::paths;
use super::StageError;

/// Where an upload's bytes currently live.
#[derive(Debug)]
pub enum ItemSource {
    /// A temp file we own on the same filesystem; staged by rename.
    TempFile(TempPath),
    /// Bytes already in memory (inline payloads, remote fetches); staged by copy.
    Bytes(Bytes),
    /// Some other readable file that must be left in place; staged by copy.
    File(PathBuf),
}

/// One file in flight, from ingest until it is handed to the staging store.
#[derive(Debug)]
pub struct UploadItem {
    id: FileId,
    source: ItemSource,
    name: String,
    size: u64,
    mime_type: String,
}

impl UploadItem {
    pub fn new(
        id: FileId,
        source: ItemSource,
        name: impl Into<String>,
        size: u64,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            id,
            source,
            name: name.into(),
            size,
            mime_type: mime_type.into(),
        }
    }

    pub fn from_bytes(
        id: FileId,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: Bytes,
    ) -> Self {
        let size = data.len() as u64;
        Self::new(id, ItemSource::Bytes(data), name, size, mime_type)
    }

    pub fn id(&self) -> &FileId {
        &self.id
    }

    /// The declared name as received, before any confinement.
    pub fn declared_name(&self) -> &str {
        &self.name
    }

    /// The basename the file will be staged under.
    pub fn file_name(&self) -> Result<&str, StageError> {
        match paths::secure_name(&self.name) {
            Some(name) if !paths::is_reserved_name(name) => Ok(name),
            _ => Err(StageError::Validation(format!(
                "unusable file name '{}'",
                self.name
            ))),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn source(&self) -> &ItemSource {
        &self.source
    }

    /// Replace the stem of the declared name, keeping the current extension
    /// unless a new one is given.
    pub fn rename(&mut self, stem: &str, extension: Option<&str>) {
        let current = paths::secure_name(&self.name).unwrap_or_default();
        let extension = extension.or_else(|| Path::new(current).extension()?.to_str());
        self.name = match extension {
            Some(ext) if !ext.is_empty() => format!("{stem}.{ext}"),
            _ => stem.to_string(),
        };
    }

    pub(crate) fn into_parts(self) -> (StagedItem, ItemSource) {
        let name = paths::secure_name(&self.name)
            .unwrap_or_default()
            .to_string();
        (
            StagedItem {
                id: self.id,
                name,
                size: self.size,
                mime_type: self.mime_type,
            },
            self.source,
        )
    }
}

/// What remains of an [`UploadItem`] once its bytes are on disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagedItem {
    pub id: FileId,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}
