//! File reputation lookups.
//!
//! The pipeline asks a [`ReputationLookup`] about the image of every matched
//! event. The bundled implementation checks SHA-256 digests against a local
//! list of known-bad hashes.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{info, warn};

const TARGET_INTEL: &str = "intel";

/// Reputation verdict for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reputation {
    /// Number of sources flagging the file
    Flagged(u32),
    Clean,
    /// Lookup failed or the file could not be read
    Unavailable,
}

impl Reputation {
    pub fn is_malicious(self) -> bool {
        matches!(self, Reputation::Flagged(n) if n > 0)
    }
}

pub trait ReputationLookup: Send + Sync {
    fn lookup(&self, path: &Path) -> Reputation;
}

/// Known-bad SHA-256 list loaded from a text file, one hex digest per line
/// with an optional `; comment`. Blank lines, `#` and `//` lines are ignored.
#[derive(Debug, Default)]
pub struct HashListReputation {
    hashes: HashSet<String>,
}

impl HashListReputation {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read hash list {:?}", path))?;
        let list = Self::from_lines(content.lines());
        info!(target: TARGET_INTEL, entries = list.len(), path = ?path, "Loaded hash list");
        Ok(list)
    }

    pub fn from_lines<'a, I: IntoIterator<Item = &'a str>>(lines: I) -> Self {
        let mut hashes = HashSet::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }
            let hash = line.split(';').next().unwrap_or_default().trim();
            if hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
                hashes.insert(hash.to_ascii_lowercase());
            } else {
                warn!(target: TARGET_INTEL, entry = %line, "Skipping malformed hash entry");
            }
        }
        Self { hashes }
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

impl ReputationLookup for HashListReputation {
    fn lookup(&self, path: &Path) -> Reputation {
        match file_sha256(path) {
            Ok(hash) if self.hashes.contains(&hash) => Reputation::Flagged(1),
            Ok(_) => Reputation::Clean,
            Err(err) => {
                warn!(target: TARGET_INTEL, path = ?path, error = %err, "Reputation lookup failed");
                Reputation::Unavailable
            }
        }
    }
}

/// Lowercase hex SHA-256 of a file
pub fn file_sha256(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // sha256("hello")
    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_file_sha256() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        assert_eq!(file_sha256(file.path()).unwrap(), HELLO_SHA256);
    }

    #[test]
    fn test_lookup_verdicts() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();

        let entry = format!("{} ; greeting dropper", HELLO_SHA256.to_ascii_uppercase());
        let list =
            HashListReputation::from_lines(["# comment", "", entry.as_str(), "not-a-hash"]);
        assert_eq!(list.len(), 1);
        assert_eq!(list.lookup(file.path()), Reputation::Flagged(1));
        assert!(list.lookup(file.path()).is_malicious());

        let empty = HashListReputation::default();
        assert_eq!(empty.lookup(file.path()), Reputation::Clean);

        assert_eq!(
            list.lookup(Path::new("/definitely/missing/file.exe")),
            Reputation::Unavailable
        );
    }

    #[test]
    fn test_non_positive_counts_are_benign() {
        assert!(!Reputation::Flagged(0).is_malicious());
        assert!(!Reputation::Clean.is_malicious());
        assert!(!Reputation::Unavailable.is_malicious());
    }
}
