//! Promotion of staged files into permanent storage.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use super::id::FileId;
use super::paths;
use super::store::{self, FileBlob, StagingStore};
use super::StageError;

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("Staged file not found: {0}")]
    NotFound(FileId),
    #[error(
        "A file named {} already exists",
        .0.file_name().unwrap_or_default().to_string_lossy()
    )]
    AlreadyExists(PathBuf),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of committing one entry.
#[derive(Debug)]
pub struct CommitResult {
    pub id: FileId,
    pub outcome: Result<PathBuf, CommitError>,
}

impl CommitResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Name of the committed file, when the commit went through.
    pub fn file_name(&self) -> Option<String> {
        let path = self.outcome.as_ref().ok()?;
        Some(path.file_name()?.to_string_lossy().into_owned())
    }
}

/// Per-entry results of one commit call, in input order.
#[derive(Debug, Default)]
pub struct CommitReport {
    pub results: Vec<CommitResult>,
}

impl CommitReport {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(CommitResult::is_success)
    }

    /// Some entries were committed and some were not.
    pub fn is_partial_failure(&self) -> bool {
        let failed = self.results.iter().filter(|r| !r.is_success()).count();
        failed > 0 && failed < self.results.len()
    }
}

#[derive(Clone)]
pub struct CommitCoordinator {
    store: Arc<StagingStore>,
}

impl CommitCoordinator {
    pub fn new(store: Arc<StagingStore>) -> Self {
        Self { store }
    }

    /// Move each staged entry into `target_dir`.
    ///
    /// Entries are independent: a failure is recorded and the next entry is
    /// processed. The staging directory of every attempted entry is removed
    /// whether or not its move succeeded.
    pub fn commit<E: AsRef<FileId>>(&self, entries: &[E], target_dir: &Path) -> CommitReport {
        let results = entries
            .iter()
            .map(|entry| {
                let id = entry.as_ref();
                let outcome = self.commit_one(id, target_dir);
                self.store.delete(id);

                match &outcome {
                    Ok(path) => {
                        tracing::info!(file_id = %id, path = %path.display(), "Committed file")
                    }
                    Err(e) => tracing::warn!(file_id = %id, error = %e, "Failed to commit file"),
                }

                CommitResult {
                    id: id.clone(),
                    outcome,
                }
            })
            .collect();

        CommitReport { results }
    }

    fn commit_one(&self, id: &FileId, target_dir: &Path) -> Result<PathBuf, CommitError> {
        let source = self
            .store
            .staged_file(id)?
            .ok_or_else(|| CommitError::NotFound(id.clone()))?;

        // Permanent storage is managed elsewhere, so no marker here.
        paths::ensure_dir(target_dir)?;

        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StageError::Validation("staged file has no usable name".into()))?;
        let target = paths::resolve(target_dir, name)?;

        move_file(&source, &target)?;
        Ok(target)
    }

    /// Read a committed file back from `target_dir`. `Ok(None)` when absent.
    pub fn load(target_dir: &Path, name: &str) -> Result<Option<FileBlob>, StageError> {
        let path = paths::resolve(target_dir, name)?;
        match store::read_blob(&path) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Move `source` to `target` without replacing anything already at `target`.
fn move_file(source: &Path, target: &Path) -> Result<(), CommitError> {
    let placed = match fs::hard_link(source, target) {
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::CrossesDevices | io::ErrorKind::Unsupported
            ) =>
        {
            copy_new(source, target)
        }
        result => result,
    };

    match placed {
        Ok(()) => Ok(fs::remove_file(source)?),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Err(CommitError::AlreadyExists(target.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

fn copy_new(source: &Path, target: &Path) -> io::Result<()> {
    let mut reader = File::open(source)?;
    let mut out = OpenOptions::new().write(true).create_new(true).open(target)?;
    let copied = io::copy(&mut reader, &mut out)
        .and_then(|_| out.set_permissions(reader.metadata()?.permissions()))
        .and_then(|()| out.sync_all());
    if let Err(e) = copied {
        drop(out);
        let _ = fs::remove_file(target);
        return Err(e);
    }
    Ok(())
}
