//! Artifacts: the identity of a filesystem object across its lifetime.
//!
//! An artifact survives unlinking (open descriptors can still reach it) and
//! can exist at several paths at once. The typed body carries the content
//! state appropriate to the object kind; all mutation goes through [`Env`]
//! so that inputs and outputs are observed.
//!
//! [`Env`]: crate::Env

use std::collections::HashMap;
use std::path::PathBuf;

use retrace_ir::{CommandId, RefId};

use crate::dir_version::DirVersion;
use crate::version::{
    FileVersion, MetadataVersion, PipeVersion, SpecialVersion, SymlinkVersion,
};
use crate::ArtifactId;

/// A (directory, name) pair: the unit of link and unlink bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub dir: ArtifactId,
    pub name: String,
}

/// Identifies the reference a write went through: which command, which slot.
pub type RefKey = (CommandId, RefId);

/// Write-tracking state shared by metadata and file-style content: the last
/// writer (for write-combining and self-read suppression) and whether any
/// command has observed the current version since it was written.
#[derive(Debug, Clone, Default)]
pub struct WriteState {
    pub writer: Option<RefKey>,
    pub accessed: bool,
}

impl WriteState {
    /// A consecutive write through the same reference with no intervening
    /// access may collapse into the previous version.
    pub fn can_combine(&self, key: RefKey) -> bool {
        self.writer == Some(key) && !self.accessed
    }

    pub fn wrote(&mut self, key: RefKey) {
        self.writer = Some(key);
        self.accessed = false;
    }

    /// A read by the version's own writer through the same reference is a
    /// self-read and does not count as an access.
    pub fn read_by(&mut self, key: RefKey) -> bool {
        let self_read = self.writer == Some(key);
        if !self_read {
            self.accessed = true;
        }
        self_read
    }
}

#[derive(Debug)]
pub enum ArtifactBody {
    File {
        content: FileVersion,
        write: WriteState,
    },
    Dir {
        /// Newest first; the oldest version can answer for every name.
        versions: Vec<DirVersion>,
        /// Memoized entry resolutions.
        resolved: HashMap<String, ArtifactId>,
        parent: Option<ArtifactId>,
    },
    Symlink {
        content: SymlinkVersion,
    },
    Pipe {
        content: PipeVersion,
        write: WriteState,
    },
    Special {
        content: SpecialVersion,
    },
}

#[derive(Debug)]
pub struct Artifact {
    pub id: ArtifactId,
    /// Display name for logs and diagnostics.
    pub name: String,
    pub metadata: MetadataVersion,
    pub meta_write: WriteState,
    /// Paths at which this artifact currently exists on disk.
    pub paths: Vec<PathBuf>,
    /// Links in the model, committed or not; used to derive an intended path
    /// for artifacts that have not reached the disk yet.
    pub links: Vec<DirEntry>,
    /// Commands that have accessed this artifact, in first-access order.
    pub accessors: Vec<CommandId>,
    pub body: ArtifactBody,
}

impl Artifact {
    pub fn new(id: ArtifactId, name: String, metadata: MetadataVersion, body: ArtifactBody) -> Self {
        Artifact {
            id,
            name,
            metadata,
            meta_write: WriteState::default(),
            paths: Vec::new(),
            links: Vec::new(),
            accessors: Vec::new(),
            body,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.body {
            ArtifactBody::File { .. } => "file",
            ArtifactBody::Dir { .. } => "dir",
            ArtifactBody::Symlink { .. } => "symlink",
            ArtifactBody::Pipe { .. } => "pipe",
            ArtifactBody::Special { .. } => "special",
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.body, ArtifactBody::Dir { .. })
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.body, ArtifactBody::Symlink { .. })
    }

    /// The first on-disk path, if the artifact is committed anywhere.
    pub fn committed_path(&self) -> Option<&PathBuf> {
        self.paths.first()
    }

    /// Record a path at which the artifact now exists on disk.
    pub fn add_path(&mut self, path: PathBuf) {
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    /// Forget a path the artifact no longer occupies on disk. The artifact
    /// itself stays alive: open descriptors may still reach it.
    pub fn remove_path(&mut self, path: &PathBuf) {
        self.paths.retain(|p| p != path);
    }

    pub fn record_accessor(&mut self, cmd: CommandId) {
        if !self.accessors.contains(&cmd) {
            self.accessors.push(cmd);
        }
    }

    /// The symlink target, for symlink artifacts.
    pub fn symlink_target(&self) -> Option<&PathBuf> {
        match &self.body {
            ArtifactBody::Symlink { content } => Some(&content.target),
            _ => None,
        }
    }
}
