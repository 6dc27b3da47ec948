//! File identity for checkpoint and cache keys.
//!
//! A strong fingerprint hashes the logical path together with the content
//! digest. When the content cannot be read a weak `path:` fingerprint keeps the
//! file addressable so its failure can still be recorded.

use crate::error::ItemError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

const FINGERPRINT_DOMAIN: &[u8] = b"folio-fp-v1";
const READ_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_weak(&self) -> bool {
        self.0.starts_with("path:")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintStrength {
    Strong,
    Weak,
}

/// Identity of one discovered file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    pub path: PathBuf,
    pub logical_path: String,
    pub fingerprint: Fingerprint,
    /// blake3 of the content; `None` for weak identities.
    pub content_hash: Option<String>,
    pub strength: FingerprintStrength,
}

/// Path relative to `root`, `/`-separated.
pub fn logical_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.join("/")
}

/// Stream the file through blake3.
pub fn content_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Combine a logical path and content digest into a strong fingerprint.
pub fn strong_fingerprint(logical_path: &str, content_hash: &str) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(FINGERPRINT_DOMAIN);
    hasher.update(&[0]);
    hasher.update(logical_path.as_bytes());
    hasher.update(&[0]);
    hasher.update(content_hash.as_bytes());
    Fingerprint(hasher.finalize().to_hex().to_string())
}

pub fn weak_fingerprint(logical_path: &str) -> Fingerprint {
    let digest = blake3::hash(logical_path.as_bytes());
    Fingerprint(format!("path:{}", digest.to_hex()))
}

/// Fingerprint a file under `root`. Fails with `UnreadableFile` when the
/// content cannot be read.
pub fn fingerprint(root: &Path, path: &Path) -> Result<FileIdentity, ItemError> {
    let logical = logical_path(root, path);
    let digest = content_digest(path).map_err(|e| ItemError::UnreadableFile {
        path: logical.clone(),
        message: e.to_string(),
    })?;
    Ok(FileIdentity {
        path: path.to_path_buf(),
        fingerprint: strong_fingerprint(&logical, &digest),
        logical_path: logical,
        content_hash: Some(digest),
        strength: FingerprintStrength::Strong,
    })
}

/// Fingerprint or, when unreadable, fall back to a weak identity.
pub fn identify(root: &Path, path: &Path) -> FileIdentity {
    match fingerprint(root, path) {
        Ok(identity) => identity,
        Err(err) => {
            let logical = logical_path(root, path);
            tracing::warn!(path = %logical, error = %err, "Falling back to weak fingerprint");
            FileIdentity {
                path: path.to_path_buf(),
                fingerprint: weak_fingerprint(&logical),
                logical_path: logical,
                content_hash: None,
                strength: FingerprintStrength::Weak,
            }
        }
    }
}
