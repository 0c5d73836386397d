use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::NamedTempFile;

use super::id::FileId;
use super::item::{ItemSource, StagedItem, UploadItem};
use super::paths::{self, PART_PREFIX};
use super::StageError;

/// A file read back from disk.
#[derive(Debug, Clone)]
pub struct FileBlob {
    pub name: String,
    pub content: Bytes,
    pub mime_type: String,
    pub length: u64,
}

/// Owns the staging directory tree: one `<root>/<file id>/` directory per
/// staged upload, holding the payload and a protective marker.
#[derive(Debug, Clone)]
pub struct StagingStore {
    root: PathBuf,
}

impl StagingStore {
    /// Open (or create) a staging root.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, StageError> {
        let root = root.as_ref().to_path_buf();
        paths::ensure_secure_dir(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, id: &FileId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Whether a staging directory exists for `id`.
    pub fn contains(&self, id: &FileId) -> bool {
        self.entry_dir(id).is_dir()
    }

    /// A temp file inside the staging root for spooling an incoming upload.
    /// It is removed on drop unless staged.
    pub fn incoming(&self) -> Result<NamedTempFile, StageError> {
        Ok(tempfile::Builder::new()
            .prefix(PART_PREFIX)
            .tempfile_in(&self.root)?)
    }

    /// Persist an upload under its id.
    pub fn stage(&self, item: UploadItem) -> Result<StagedItem, StageError> {
        let dir = self.entry_dir(item.id());
        let target = dir.join(item.file_name()?);

        let created = paths::ensure_secure_dir(&dir)?;
        if !created && self.staged_file(item.id())?.is_some() {
            return Err(StageError::AlreadyStaged(item.id().clone()));
        }

        let expected = item.size();
        let (staged, source) = item.into_parts();

        if let Err(e) = write_source(source, &dir, &target, expected)
            .and_then(|()| paths::restrict_permissions(&target))
        {
            if created {
                discard_dir(&dir);
            } else {
                let _ = fs::remove_file(&target);
            }
            return Err(e.into());
        }

        tracing::debug!(
            file_id = %staged.id,
            name = %staged.name,
            size = staged.size,
            "Staged file"
        );
        Ok(staged)
    }

    /// Locate the payload file of a staged entry.
    pub fn staged_file(&self, id: &FileId) -> Result<Option<PathBuf>, StageError> {
        let entries = match fs::read_dir(self.entry_dir(id)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut payloads = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if paths::is_reserved_name(&name) {
                continue;
            }
            if entry.file_type()?.is_file() {
                payloads.push(entry.path());
            }
        }

        if payloads.len() > 1 {
            tracing::warn!(file_id = %id, count = payloads.len(), "Staged entry holds more than one file");
        }
        payloads.sort();
        Ok(payloads.into_iter().next())
    }

    /// Read a staged file back. `Ok(None)` when nothing is staged under `id`.
    pub fn retrieve(&self, id: &FileId) -> Result<Option<FileBlob>, StageError> {
        match self.staged_file(id)? {
            Some(path) => Ok(Some(read_blob(&path)?)),
            None => Ok(None),
        }
    }

    /// Remove a staged entry. Never fails from the caller's side: a missing
    /// entry is a no-op and other failures are logged.
    pub fn delete(&self, id: &FileId) {
        let dir = self.entry_dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => tracing::debug!(file_id = %id, "Removed staged file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(file_id = %id, error = %e, "Failed to remove staging directory")
            }
        }
    }
}

fn write_source(source: ItemSource, dir: &Path, target: &Path, expected: u64) -> io::Result<()> {
    match source {
        ItemSource::TempFile(temp) => match temp.persist(target) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::debug!(error = %e.error, "Rename failed, copying upload instead");
                let mut file = File::open(&e.path)?;
                let expected = file.metadata()?.len();
                copy_atomic(&mut file, dir, target, expected)
            }
        },
        ItemSource::Bytes(data) => copy_atomic(&mut data.as_ref(), dir, target, expected),
        ItemSource::File(path) => {
            let mut file = File::open(&path)?;
            let expected = file.metadata()?.len();
            copy_atomic(&mut file, dir, target, expected)
        }
    }
}

/// Copy into a sibling temp file, verify the length, then rename into place.
fn copy_atomic<R: Read>(reader: &mut R, dir: &Path, target: &Path, expected: u64) -> io::Result<()> {
    let mut part = tempfile::Builder::new()
        .prefix(PART_PREFIX)
        .tempfile_in(dir)?;
    let written = io::copy(reader, &mut part)?;
    part.flush()?;
    if written != expected {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("copied {written} of {expected} bytes"),
        ));
    }
    part.as_file().sync_all()?;
    part.persist(target).map_err(|e| e.error)?;
    Ok(())
}

fn discard_dir(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        tracing::warn!(path = %dir.display(), error = %e, "Failed to clean up staging directory");
    }
}

/// Read a whole file into a [`FileBlob`], guessing its MIME type from the name.
pub(crate) fn read_blob(path: &Path) -> io::Result<FileBlob> {
    let content = fs::read(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mime_type = mime_guess::from_path(path)
        .first()
        .map(|m| m.to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string());

    Ok(FileBlob {
        name,
        length: content.len() as u64,
        content: Bytes::from(content),
        mime_type,
    })
}
