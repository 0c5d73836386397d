use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    /// Form field carrying uploads, inline payloads and staged ids
    pub field_name: String,
    pub storage: StorageConfig,
    /// Maximum upload size in bytes
    pub max_upload_size: u64,
    /// Timeout for remote fetches (seconds)
    pub fetch_timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root of the staging area
    pub staging_dir: String,
    /// Permanent destination for committed files
    pub upload_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            staging_dir: "./tmp".to_string(),
            upload_dir: "./uploads".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            field_name: "filepond".to_string(),
            storage: StorageConfig::default(),
            max_upload_size: 50 * 1024 * 1024, // 50MB
            fetch_timeout_seconds: 30,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let bind_address = std::env::var("BIND_ADDRESS").unwrap_or(defaults.bind_address);

        let field_name = std::env::var("FIELD_NAME").unwrap_or(defaults.field_name);

        let staging_dir = std::env::var("STAGING_DIR").unwrap_or(defaults.storage.staging_dir);

        let upload_dir = std::env::var("UPLOAD_DIR").unwrap_or(defaults.storage.upload_dir);

        let max_upload_size = std::env::var("MAX_UPLOAD_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_upload_size);

        let fetch_timeout_seconds = std::env::var("FETCH_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.fetch_timeout_seconds);

        let config = Config {
            bind_address,
            field_name,
            storage: StorageConfig {
                staging_dir,
                upload_dir,
            },
            max_upload_size,
            fetch_timeout_seconds,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.field_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "FIELD_NAME cannot be empty".to_string(),
            ));
        }

        if self.max_upload_size == 0 {
            return Err(ConfigError::ValidationError(
                "MAX_UPLOAD_SIZE must be greater than 0".to_string(),
            ));
        }

        if normalized(&self.storage.staging_dir) == normalized(&self.storage.upload_dir) {
            return Err(ConfigError::ValidationError(
                "STAGING_DIR and UPLOAD_DIR must be different directories".to_string(),
            ));
        }

        if self.fetch_timeout_seconds == 0 {
            tracing::warn!("FETCH_TIMEOUT_SECS is 0, remote fetches will time out immediately");
        }

        Ok(())
    }

    /// Whether a multipart field name refers to the configured upload field.
    /// `name[]` is accepted for clients that post arrays.
    pub fn matches_field(&self, name: &str) -> bool {
        name == self.field_name || name.strip_suffix("[]") == Some(self.field_name.as_str())
    }
}

/// Absolute, lexically normalized form of a configured directory.
fn normalized(dir: &str) -> PathBuf {
    let path = Path::new(dir);
    let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_shared_directories() {
        let mut config = Config::default();
        config.storage.upload_dir = config.storage.staging_dir.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_same_directory_spelled_differently() {
        for (staging, upload) in [
            ("./tmp", "tmp"),
            ("tmp/", "tmp"),
            ("data/../uploads", "uploads"),
            ("./files/./tmp", "files/tmp"),
        ] {
            let mut config = Config::default();
            config.storage.staging_dir = staging.to_string();
            config.storage.upload_dir = upload.to_string();
            assert!(config.validate().is_err(), "{staging:?} vs {upload:?}");
        }
    }

    #[test]
    fn test_accepts_distinct_directories() {
        let mut config = Config::default();
        config.storage.staging_dir = "./files/tmp".to_string();
        config.storage.upload_dir = "./files/uploads".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_field_name() {
        let config = Config {
            field_name: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_matches_field() {
        let config = Config::default();
        assert!(config.matches_field("filepond"));
        assert!(config.matches_field("filepond[]"));
        assert!(!config.matches_field("other"));
        assert!(!config.matches_field("filepond[0]"));
    }
}
