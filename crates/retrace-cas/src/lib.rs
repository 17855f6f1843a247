//! # retrace-cas
//!
//! Content-addressed fingerprint and blob store for retrace.
//!
//! Saved command outputs live here, keyed by BLAKE3 digest with a 2-level
//! fan-out directory layout:
//!
//! ```text
//! .retrace/cas/
//! └── ab/
//!     └── cd/
//!         └── abcd1234...ef
//! ```
//!
//! The build engine consumes three operations: `digest` (fingerprint a live
//! file), `save` (stash a copy of a file's bytes), and `restore` (materialize
//! a saved blob at a path). Restoring is what lets a cached command output be
//! staged onto disk without rerunning its creator.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// BLAKE3 content digest (32 bytes)
pub type Digest = [u8; 32];

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum CasError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Blob not found: {hash}")]
    NotFound { hash: String },

    #[error("Blob corrupted: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}

pub type Result<T> = std::result::Result<T, CasError>;

/// A content fingerprint: digest plus the cheap stat-level summary.
///
/// The digest is optional because a fingerprint can be taken from stat data
/// alone when hashing is skipped; size and mtime then serve as the weakest
/// comparison key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hash: Option<Digest>,
    pub size: u64,
    /// Modification time (nanoseconds since the Unix epoch)
    pub mtime: i64,
}

impl Fingerprint {
    /// Fingerprint for a known-empty file.
    pub fn empty() -> Self {
        Fingerprint {
            hash: Some(*blake3::hash(b"").as_bytes()),
            size: 0,
            mtime: 0,
        }
    }
}

/// Content-addressed blob store.
#[derive(Debug, Clone)]
pub struct CasStore {
    root: PathBuf,
}

impl CasStore {
    /// Open a store rooted at the given directory, creating it if needed.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Compute the BLAKE3 digest of the given bytes.
    #[inline]
    pub fn compute_digest(data: &[u8]) -> Digest {
        *blake3::hash(data).as_bytes()
    }

    /// Convert a digest to its hex string representation.
    #[inline]
    pub fn digest_to_hex(digest: &Digest) -> String {
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Parse a hex string back into a digest.
    pub fn hex_to_digest(hex: &str) -> Option<Digest> {
        if hex.len() != 64 {
            return None;
        }
        let mut digest = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).ok()?;
            digest[i] = u8::from_str_radix(s, 16).ok()?;
        }
        Some(digest)
    }

    /// Path where a blob with the given digest is stored: `ab/cd/abcd...`
    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = Self::digest_to_hex(digest);
        let l1 = &hex[..2];
        let l2 = &hex[2..4];
        self.root.join(l1).join(l2).join(&hex)
    }

    /// Check whether a blob is present in the store.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.blob_path(digest).exists()
    }

    /// Fingerprint a file on disk: digest, size, and mtime.
    pub fn digest(&self, path: &Path) -> Result<Fingerprint> {
        let meta = fs::metadata(path)?;
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);

        let data = fs::read(path)?;
        Ok(Fingerprint {
            hash: Some(Self::compute_digest(&data)),
            size: meta.len(),
            mtime,
        })
    }

    /// Store bytes in the CAS, returning the content digest.
    ///
    /// If the content already exists this is a no-op (deduplication). Writes
    /// go through a unique temp file followed by an atomic rename.
    pub fn store(&self, data: &[u8]) -> Result<Digest> {
        let digest = Self::compute_digest(data);
        let path = self.blob_path(&digest);

        if path.exists() {
            return Ok(digest);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_name = format!(
            "{}.{}.tmp",
            path.file_name().unwrap().to_string_lossy(),
            std::process::id()
        );
        let temp_path = path.with_file_name(&temp_name);
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;

        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            // If the target exists now, another writer beat us with the same content
            if path.exists() {
                return Ok(digest);
            }
            return Err(CasError::Io(e));
        }

        debug!(hash = %Self::digest_to_hex(&digest), size = data.len(), "stored blob");
        Ok(digest)
    }

    /// Save a file's bytes into the store, returning the digest handle.
    pub fn save(&self, path: &Path) -> Result<Digest> {
        let data = fs::read(path)?;
        self.store(&data)
    }

    /// Retrieve blob bytes by digest, verifying integrity on read.
    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        if !path.exists() {
            return Err(CasError::NotFound {
                hash: Self::digest_to_hex(digest),
            });
        }

        let mut file = File::open(&path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let actual = Self::compute_digest(&data);
        if actual != *digest {
            return Err(CasError::HashMismatch {
                expected: Self::digest_to_hex(digest),
                actual: Self::digest_to_hex(&actual),
            });
        }
        Ok(data)
    }

    /// Materialize a saved blob at the given path.
    pub fn restore(&self, digest: &Digest, dest: &Path) -> Result<()> {
        let data = self.get(digest)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, &data)?;
        debug!(hash = %Self::digest_to_hex(digest), dest = %dest.display(), "restored blob");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_get_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = CasStore::open(temp.path()).unwrap();

        let digest = store.store(b"hello world").unwrap();
        let data = store.get(&digest).unwrap();
        assert_eq!(data, b"hello world");
    }

    #[test]
    fn test_store_is_deduplicating() {
        let temp = TempDir::new().unwrap();
        let store = CasStore::open(temp.path()).unwrap();

        let d1 = store.store(b"same bytes").unwrap();
        let d2 = store.store(b"same bytes").unwrap();
        assert_eq!(d1, d2);
        assert!(store.contains(&d1));
    }

    #[test]
    fn test_get_missing_blob() {
        let temp = TempDir::new().unwrap();
        let store = CasStore::open(temp.path()).unwrap();

        let missing = CasStore::compute_digest(b"never stored");
        assert!(matches!(store.get(&missing), Err(CasError::NotFound { .. })));
    }

    #[test]
    fn test_save_and_restore_file() {
        let temp = TempDir::new().unwrap();
        let store = CasStore::open(temp.path().join("cas")).unwrap();

        let src = temp.path().join("src.txt");
        fs::write(&src, b"file contents").unwrap();

        let digest = store.save(&src).unwrap();
        let dest = temp.path().join("out/restored.txt");
        store.restore(&digest, &dest).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"file contents");
    }

    #[test]
    fn test_digest_fingerprints_content() {
        let temp = TempDir::new().unwrap();
        let store = CasStore::open(temp.path().join("cas")).unwrap();

        let src = temp.path().join("a.txt");
        fs::write(&src, b"abc").unwrap();

        let fp = store.digest(&src).unwrap();
        assert_eq!(fp.size, 3);
        assert_eq!(fp.hash, Some(CasStore::compute_digest(b"abc")));
        assert!(fp.mtime > 0);
    }

    #[test]
    fn test_hex_roundtrip() {
        let digest = CasStore::compute_digest(b"x");
        let hex = CasStore::digest_to_hex(&digest);
        assert_eq!(hex.len(), 64);
        assert_eq!(CasStore::hex_to_digest(&hex), Some(digest));
        assert_eq!(CasStore::hex_to_digest("zz"), None);
    }

    #[test]
    fn test_empty_fingerprint() {
        let fp = Fingerprint::empty();
        assert_eq!(fp.size, 0);
        assert_eq!(fp.hash, Some(CasStore::compute_digest(b"")));
    }
}
