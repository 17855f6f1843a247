//! Version state for non-directory artifacts.
//!
//! A version pairs a serializable payload (shared with the trace IR) with the
//! runtime facts that never leave the build: the creating command and the
//! one-way committed flag.

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::debug;

use retrace_cas::CasStore;
use retrace_ir::{CommandId, FileContent, Metadata};

use crate::{Result, VfsError};

/// The current metadata of an artifact: exactly one per artifact.
#[derive(Debug, Clone)]
pub struct MetadataVersion {
    pub meta: Metadata,
    pub creator: Option<CommandId>,
    pub committed: bool,
}

impl MetadataVersion {
    pub fn new(meta: Metadata, creator: Option<CommandId>) -> Self {
        MetadataVersion {
            meta,
            creator,
            committed: false,
        }
    }

    /// Metadata scanned from the live filesystem is committed by definition.
    pub fn scanned(meta: Metadata) -> Self {
        MetadataVersion {
            meta,
            creator: None,
            committed: true,
        }
    }

    pub fn matches(&self, expected: &Metadata) -> bool {
        self.meta.matches(expected)
    }

    /// Would the given access be permitted by this metadata?
    ///
    /// Owner, group, and other permission classes are selected against the
    /// provided effective ids.
    pub fn grants(&self, euid: u32, egid: u32, r: bool, w: bool, x: bool) -> bool {
        let mode = self.meta.mode;
        let shift = if euid == 0 || euid == self.meta.uid {
            6
        } else if egid == self.meta.gid {
            3
        } else {
            0
        };
        // Root bypasses read/write checks entirely
        if euid == 0 {
            return !x || mode & 0o111 != 0;
        }
        let bits = (mode >> shift) & 0o7;
        (!r || bits & 0o4 != 0) && (!w || bits & 0o2 != 0) && (!x || bits & 0o1 != 0)
    }

    /// Metadata can always be reproduced with chmod.
    pub fn can_commit(&self) -> bool {
        true
    }

    /// Write the permission bits at `path`. Ownership is left alone: the
    /// build runs unprivileged and recorded uid/gid already match the user.
    pub fn commit(&mut self, path: &Path) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        let perms = self.meta.mode & 0o7777;
        // Symlink modes are not settable on Linux
        if self.meta.file_type() != libc::S_IFLNK {
            fs::set_permissions(path, fs::Permissions::from_mode(perms))
                .map_err(|e| VfsError::io(path, e))?;
        }
        self.committed = true;
        Ok(())
    }
}

/// The current content of a regular file.
///
/// A file's value is always a single latest version: writes replace, they do
/// not accumulate the way directory mutations do.
#[derive(Debug, Clone)]
pub struct FileVersion {
    pub content: FileContent,
    pub creator: Option<CommandId>,
    pub committed: bool,
}

impl FileVersion {
    pub fn new(content: FileContent, creator: Option<CommandId>) -> Self {
        FileVersion {
            content,
            creator,
            committed: false,
        }
    }

    /// Content observed on the live filesystem: size and mtime now, digest
    /// lazily when a comparison needs it.
    pub fn scanned(size: u64, mtime: i64) -> Self {
        FileVersion {
            content: FileContent {
                fingerprint: Some(retrace_cas::Fingerprint {
                    hash: None,
                    size,
                    mtime,
                }),
                blob: None,
            },
            creator: None,
            committed: true,
        }
    }

    pub fn matches(&self, expected: &FileContent) -> bool {
        self.content.matches(expected)
    }

    /// Whether a digest has been taken for this version.
    pub fn has_digest(&self) -> bool {
        self.content.fingerprint.map_or(false, |fp| fp.hash.is_some())
    }

    /// Populate the fingerprint by reading the live file. Idempotent.
    pub fn fingerprint(&mut self, path: &Path, cas: &CasStore) -> Result<()> {
        if self.has_digest() {
            return Ok(());
        }
        let fp = cas.digest(path)?;
        self.content.fingerprint = Some(fp);
        Ok(())
    }

    /// Save a copy of the live file into the store for later restoration.
    pub fn save(&mut self, path: &Path, cas: &CasStore) -> Result<()> {
        if self.content.blob.is_some() {
            return Ok(());
        }
        self.content.blob = Some(cas.save(path)?);
        debug!(path = %path.display(), "saved file content");
        Ok(())
    }

    /// True when `commit` can reproduce this content without rerunning the
    /// creator: the file is known-empty, a saved copy exists, or the digest
    /// names a blob already in the store.
    pub fn can_commit(&self, cas: &CasStore) -> bool {
        if self.content.is_empty_file() {
            return true;
        }
        if let Some(blob) = self.content.blob {
            if cas.contains(&blob) {
                return true;
            }
        }
        if let Some(fp) = self.content.fingerprint {
            if let Some(hash) = fp.hash {
                return cas.contains(&hash);
            }
        }
        false
    }

    /// Write the represented content at `path`.
    pub fn commit(&mut self, path: &Path, cas: &CasStore) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        if let Some(blob) = self.content.blob.filter(|b| cas.contains(b)) {
            cas.restore(&blob, path)?;
        } else if let Some(hash) = self
            .content
            .fingerprint
            .and_then(|fp| fp.hash)
            .filter(|h| cas.contains(h))
        {
            cas.restore(&hash, path)?;
        } else if self.content.is_empty_file() {
            fs::write(path, b"").map_err(|e| VfsError::io(path, e))?;
        } else {
            return Err(VfsError::UncommittableVersion { path: path.into() });
        }
        self.committed = true;
        Ok(())
    }
}

/// The target of a symlink. Symlinks are immutable once created.
#[derive(Debug, Clone)]
pub struct SymlinkVersion {
    pub target: PathBuf,
    pub creator: Option<CommandId>,
    pub committed: bool,
}

impl SymlinkVersion {
    pub fn new(target: PathBuf, creator: Option<CommandId>) -> Self {
        SymlinkVersion {
            target,
            creator,
            committed: false,
        }
    }

    pub fn scanned(target: PathBuf) -> Self {
        SymlinkVersion {
            target,
            creator: None,
            committed: true,
        }
    }

    pub fn matches(&self, target: &Path) -> bool {
        self.target == target
    }

    pub fn can_commit(&self) -> bool {
        true
    }

    pub fn commit(&mut self, path: &Path) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        match fs::symlink_metadata(path) {
            Ok(_) => {
                fs::remove_file(path).map_err(|e| VfsError::io(path, e))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(VfsError::io(path, e)),
        }
        symlink(&self.target, path).map_err(|e| VfsError::io(path, e))?;
        self.committed = true;
        Ok(())
    }
}

/// Pipe content: alive only for the duration of one build, never committed.
/// Because a pipe version can never be staged to disk, any cross-command pipe
/// read ties the reader to its writer in the rebuild plan.
#[derive(Debug, Clone)]
pub struct PipeVersion {
    pub creator: Option<CommandId>,
}

impl PipeVersion {
    pub fn new(creator: Option<CommandId>) -> Self {
        PipeVersion { creator }
    }

    pub fn can_commit(&self) -> bool {
        false
    }
}

/// Content of a special device node.
#[derive(Debug, Clone)]
pub struct SpecialVersion {
    pub always_changed: bool,
    pub creator: Option<CommandId>,
}

impl SpecialVersion {
    pub fn new(always_changed: bool) -> Self {
        SpecialVersion {
            always_changed,
            creator: None,
        }
    }

    /// Matches only when neither side is a source of fresh bytes.
    pub fn matches(&self, other_always_changed: bool) -> bool {
        !self.always_changed && !other_always_changed
    }

    pub fn can_commit(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_metadata_grants_owner_bits() {
        let mv = MetadataVersion::scanned(Metadata {
            uid: 1000,
            gid: 1000,
            mode: libc::S_IFREG | 0o640,
        });
        assert!(mv.grants(1000, 1000, true, true, false));
        assert!(!mv.grants(1000, 1000, false, false, true));
        // Group class: read only
        assert!(mv.grants(2000, 1000, true, false, false));
        assert!(!mv.grants(2000, 1000, false, true, false));
        // Other class: nothing
        assert!(!mv.grants(2000, 2000, true, false, false));
    }

    #[test]
    fn test_metadata_commit_sets_permissions() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f");
        fs::write(&path, b"x").unwrap();

        let mut mv = MetadataVersion::new(
            Metadata {
                uid: nix::unistd::geteuid().as_raw(),
                gid: nix::unistd::getegid().as_raw(),
                mode: libc::S_IFREG | 0o600,
            },
            Some(CommandId(2)),
        );
        mv.commit(&path).unwrap();
        assert!(mv.committed);

        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_file_version_commit_from_blob() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::open(temp.path().join("cas")).unwrap();

        let blob = cas.store(b"cached output").unwrap();
        let mut fv = FileVersion::new(
            FileContent {
                fingerprint: None,
                blob: Some(blob),
            },
            Some(CommandId(7)),
        );
        assert!(fv.can_commit(&cas));

        let dest = temp.path().join("out");
        fv.commit(&dest, &cas).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"cached output");
        assert!(fv.committed);
    }

    #[test]
    fn test_file_version_commit_from_digest_in_store() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::open(temp.path().join("cas")).unwrap();
        let hash = cas.store(b"fingerprinted").unwrap();

        let mut fv = FileVersion::new(
            FileContent {
                fingerprint: Some(retrace_cas::Fingerprint {
                    hash: Some(hash),
                    size: 13,
                    mtime: 1,
                }),
                blob: None,
            },
            Some(CommandId(7)),
        );
        assert!(fv.can_commit(&cas));
        let dest = temp.path().join("out");
        fv.commit(&dest, &cas).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"fingerprinted");
    }

    #[test]
    fn test_file_version_uncommittable() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::open(temp.path().join("cas")).unwrap();

        // A digest that names nothing in the store, and no blob
        let mut fv = FileVersion::new(
            FileContent {
                fingerprint: Some(retrace_cas::Fingerprint {
                    hash: Some(CasStore::compute_digest(b"lost forever")),
                    size: 12,
                    mtime: 5,
                }),
                blob: None,
            },
            Some(CommandId(3)),
        );
        assert!(!fv.can_commit(&cas));
        let err = fv.commit(&temp.path().join("out"), &cas).unwrap_err();
        assert!(matches!(err, VfsError::UncommittableVersion { .. }));
    }

    #[test]
    fn test_empty_file_version_commits_without_store() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::open(temp.path().join("cas")).unwrap();

        let mut fv = FileVersion::new(FileContent::empty(), Some(CommandId(1)));
        assert!(fv.can_commit(&cas));
        let dest = temp.path().join("empty");
        fv.commit(&dest, &cas).unwrap();
        assert_eq!(fs::metadata(&dest).unwrap().len(), 0);
    }

    #[test]
    fn test_fingerprint_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::open(temp.path().join("cas")).unwrap();
        let path = temp.path().join("f");
        fs::write(&path, b"abc").unwrap();

        let mut fv = FileVersion::scanned(3, 42);
        assert!(!fv.has_digest());
        fv.fingerprint(&path, &cas).unwrap();
        assert!(fv.has_digest());
        let first = fv.content.fingerprint;

        // A second call must not re-read
        fs::write(&path, b"different").unwrap();
        fv.fingerprint(&path, &cas).unwrap();
        assert_eq!(fv.content.fingerprint, first);
    }

    #[test]
    fn test_symlink_version_commit_and_replace() {
        let temp = TempDir::new().unwrap();
        let link = temp.path().join("link");

        let mut sv = SymlinkVersion::new(PathBuf::from("target-one"), Some(CommandId(1)));
        sv.commit(&link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("target-one"));

        let mut sv2 = SymlinkVersion::new(PathBuf::from("target-two"), Some(CommandId(1)));
        sv2.commit(&link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("target-two"));
    }

    #[test]
    fn test_special_version_matching() {
        let fixed = SpecialVersion::new(false);
        let noisy = SpecialVersion::new(true);
        assert!(fixed.matches(false));
        assert!(!fixed.matches(true));
        assert!(!noisy.matches(false));
        assert!(!noisy.can_commit());
        assert!(!PipeVersion::new(None).can_commit());
    }
}
