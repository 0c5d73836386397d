use std::fmt;
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Serialize, Serializer};

use super::StageError;

/// Number of hex characters in a file id.
pub const FILE_ID_LEN: usize = 32;

/// Opaque identifier naming one staged entry: 32 lowercase hex characters.
///
/// Only values that pass [`FileId::parse`] are ever joined onto the staging
/// root, so a `FileId` is always safe to use as a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(String);

impl FileId {
    pub fn parse(value: &str) -> Result<Self, StageError> {
        let value = value.trim();
        if is_file_id(value) {
            Ok(Self(value.to_ascii_lowercase()))
        } else {
            Err(StageError::Validation(format!(
                "'{value}' is not a valid file id"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Check whether a string has the shape of a file id.
pub fn is_file_id(value: &str) -> bool {
    value.len() == FILE_ID_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FileId {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<FileId> for FileId {
    fn as_ref(&self) -> &FileId {
        self
    }
}

impl Serialize for FileId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Issues file ids from a monotonically increasing counter mixed with a
/// per-instance random seed, the wall clock and fresh randomness, hashed with
/// SHA-256 and truncated to 128 bits.
///
/// The counter lives in the generator rather than in a global, so each
/// application state (and each test) owns its own.
pub struct IdGenerator {
    counter: AtomicU64,
    rng: SystemRandom,
    seed: [u8; 16],
}

impl IdGenerator {
    pub fn new() -> Self {
        let rng = SystemRandom::new();
        let mut seed = [0u8; 16];
        if rng.fill(&mut seed).is_err() {
            tracing::warn!("System randomness unavailable, seeding file ids from the clock only");
        }
        Self {
            counter: AtomicU64::new(0),
            rng,
            seed,
        }
    }

    pub fn next(&self) -> FileId {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();

        let mut nonce = [0u8; 16];
        // The counter alone keeps ids distinct within this generator.
        let _ = self.rng.fill(&mut nonce);

        let mut ctx = digest::Context::new(&digest::SHA256);
        ctx.update(&self.seed);
        ctx.update(&count.to_le_bytes());
        ctx.update(&nanos.to_le_bytes());
        ctx.update(&nonce);
        let hash = ctx.finish();

        let mut id = String::with_capacity(FILE_ID_LEN);
        for byte in &hash.as_ref()[..FILE_ID_LEN / 2] {
            let _ = write!(id, "{byte:02x}");
        }
        FileId(id)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_generated_ids_are_well_formed() {
        let ids = IdGenerator::new();
        for _ in 0..100 {
            let id = ids.next();
            assert_eq!(id.as_str().len(), FILE_ID_LEN);
            assert!(is_file_id(id.as_str()));
            assert_eq!(FileId::parse(id.as_str()).unwrap(), id);
        }
    }

    #[test]
    fn test_concurrent_ids_are_distinct() {
        let ids = Arc::new(IdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..500).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id issued");
            }
        }
        assert_eq!(seen.len(), 8 * 500);
    }

    #[test]
    fn test_separate_generators_do_not_collide() {
        let a = IdGenerator::new();
        let b = IdGenerator::new();
        assert_ne!(a.next(), b.next());
    }

    #[test]
    fn test_parse_rejects_malformed_ids() {
        assert!(FileId::parse("").is_err());
        assert!(FileId::parse("../../etc/passwd").is_err());
        assert!(FileId::parse("0123456789abcdef0123456789abcde").is_err());
        assert!(FileId::parse("0123456789abcdef0123456789abcdefa").is_err());
        assert!(FileId::parse("0123456789abcdef0123456789abcdeg").is_err());
    }

    #[test]
    fn test_parse_normalizes_case_and_whitespace() {
        let id = FileId::parse(" 0123456789ABCDEF0123456789abcdef\n").unwrap();
        assert_eq!(id.as_str(), "0123456789abcdef0123456789abcdef");
    }
}
