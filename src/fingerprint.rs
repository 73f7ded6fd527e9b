//! Content-addressed fingerprints and their on-disk store.
//!
//! A fingerprint summarizes the inputs of an action as a sorted name/value
//! element map. Equality means "re-running the action is unnecessary". The
//! walker folds the fingerprints of every predecessor into a vertex's own
//! fingerprint, so an upstream change invalidates the whole affected cone.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

fn sha256_hex(update: impl FnOnce(&mut Sha256)) -> String {
    let mut hasher = Sha256::new();
    update(&mut hasher);
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Equality-comparable digest of an action's inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    elements: BTreeMap<String, String>,
}

impl Fingerprint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a literal input value.
    pub fn add(&mut self, name: &str, value: &str) {
        self.elements.insert(name.to_string(), value.to_string());
    }

    /// Record a file input as the SHA-256 digest of its contents.
    pub fn add_file(&mut self, name: &str, path: &Path) -> Result<()> {
        let mut file = fs::File::open(path)
            .with_context(|| format!("failed to open fingerprint input {}", path.display()))?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];
        loop {
            let read = file
                .read(&mut buffer)
                .with_context(|| format!("failed to read fingerprint input {}", path.display()))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        let digest: String = hasher
            .finalize()
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect();
        self.elements.insert(name.to_string(), digest);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Stable SHA-256 digest over the sorted elements.
    pub fn checksum(&self) -> String {
        sha256_hex(|hasher| {
            for (name, value) in &self.elements {
                hasher.update(name.as_bytes());
                hasher.update([0]);
                hasher.update(value.as_bytes());
                hasher.update([0]);
            }
        })
    }
}

/// Directory-backed fingerprint store, one JSON file per uid.
///
/// `save(uid, None)` deletes the entry; a missing or unreadable entry loads
/// as `None`, which makes the corresponding job run again.
#[derive(Debug, Clone)]
pub struct FingerprintStore {
    root: PathBuf,
}

impl FingerprintStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create fingerprint store {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Uids may contain separators or other hostile characters; the entry
    /// name keeps a readable prefix and disambiguates with a digest.
    fn entry_path(&self, uid: &str) -> PathBuf {
        let sanitized: String = uid
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            })
            .collect();
        let digest = sha256_hex(|hasher| hasher.update(uid.as_bytes()));
        self.root.join(format!("{sanitized}-{}.json", &digest[..12]))
    }

    pub fn load(&self, uid: &str) -> Option<Fingerprint> {
        let path = self.entry_path(uid);
        let contents = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(fingerprint) => Some(fingerprint),
            Err(error) => {
                warn!(uid, path = %path.display(), %error, "discarding unreadable fingerprint");
                None
            }
        }
    }

    pub fn save(&self, uid: &str, fingerprint: Option<&Fingerprint>) -> Result<()> {
        let path = self.entry_path(uid);
        match fingerprint {
            None => {
                if path.exists() {
                    fs::remove_file(&path).with_context(|| {
                        format!("failed to delete fingerprint {}", path.display())
                    })?;
                }
                Ok(())
            }
            Some(fingerprint) => {
                let rendered = serde_json::to_string_pretty(fingerprint)
                    .context("failed to serialize fingerprint")?;
                fs::write(&path, rendered)
                    .with_context(|| format!("failed to write fingerprint {}", path.display()))
            }
        }
    }
}
