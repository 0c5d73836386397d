//! upload-stager - A staging server for asynchronous file uploads
//!
//! Files arrive as multipart parts, base64-encoded JSON values, or ids of files
//! staged by an earlier request. They are held in an access-restricted staging
//! area until the client either reverts them or submits the form, at which
//! point they are moved into permanent storage.

pub mod api;
pub mod config;
pub mod fetch;
pub mod staging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use config::Config;
use fetch::RemoteFetcher;
use staging::{CommitCoordinator, IdGenerator, IngestResolver, StagingStore};

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub staging: Arc<StagingStore>,
    pub ingest: IngestResolver,
    pub commits: CommitCoordinator,
    pub fetcher: RemoteFetcher,
}

impl AppState {
    /// Open the staging area and build the collaborators from configuration.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let staging = Arc::new(StagingStore::open(&config.storage.staging_dir)?);
        let ids = Arc::new(IdGenerator::new());
        let fetcher = RemoteFetcher::new(Duration::from_secs(config.fetch_timeout_seconds))?;

        Ok(Self {
            ingest: IngestResolver::new(ids, Arc::clone(&staging)),
            commits: CommitCoordinator::new(Arc::clone(&staging)),
            staging,
            fetcher,
            config,
        })
    }

    pub fn upload_dir(&self) -> PathBuf {
        PathBuf::from(&self.config.storage.upload_dir)
    }
}
