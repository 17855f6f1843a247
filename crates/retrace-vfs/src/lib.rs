//! # retrace-vfs
//!
//! The in-memory filesystem model a build is emulated against.
//!
//! An [`Env`] owns every [`Artifact`] discovered on disk or minted by a
//! command during the build. Artifacts are addressed by [`ArtifactId`] —
//! plain arena indices, so a directory entry can point at an artifact that
//! (through some chain of entries) points back without any ownership cycle.
//! Each artifact carries an append-only history of versions; a version
//! remembers which command created it (`None` for state scanned from the
//! initial filesystem) and whether it has been committed to disk.
//!
//! Every read, match, and write routed through the environment is reported to
//! a [`BuildObserver`], which is how the rebuild planner learns the
//! dependency graph without owning any of this state.

mod artifact;
mod dir_version;
mod env;
mod version;

pub use artifact::{Artifact, ArtifactBody, DirEntry, RefKey, WriteState};
pub use dir_version::{DirUpdate, DirVersion, DirVersionKind, Lookup};
pub use env::{Env, EnvOptions};
pub use version::{
    FileVersion, MetadataVersion, PipeVersion, SpecialVersion, SymlinkVersion,
};

use std::path::PathBuf;

use thiserror::Error;

use retrace_ir::CommandId;

/// Identifier of an artifact within one environment's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactId(pub u32);

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "a{}", self.0)
    }
}

/// Outcome of a name resolution: an artifact, or the errno the equivalent
/// syscall would have produced. Errno values are data, not errors.
pub type Resolution = std::result::Result<ArtifactId, i32>;

/// How a command depended on a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    /// The command only requires that the version exist.
    Exists,
    /// The command read the version's state.
    Accessed,
    /// The version decided a path resolution.
    PathResolution,
    /// The version was current when the command inherited the artifact.
    Inherited,
}

/// Dependency and change events reported while a build runs.
///
/// All methods default to no-ops so an observer only implements what it
/// watches for.
pub trait BuildObserver {
    /// Command `cmd` depended on a version of `artifact` created by
    /// `creator`; `can_commit` tells whether that version could be staged to
    /// disk without rerunning the creator.
    fn input(
        &mut self,
        cmd: CommandId,
        artifact: ArtifactId,
        creator: Option<CommandId>,
        can_commit: bool,
        kind: InputType,
    ) {
        let _ = (cmd, artifact, creator, can_commit, kind);
    }

    /// Command `cmd` produced a new version of `artifact`.
    fn output(&mut self, cmd: CommandId, artifact: ArtifactId) {
        let _ = (cmd, artifact);
    }

    /// Command `cmd` did not observe the version it recorded.
    fn mismatch(&mut self, cmd: CommandId, artifact: ArtifactId) {
        let _ = (cmd, artifact);
    }

    /// Command `cmd` observed a change with no artifact to pin it on, e.g. a
    /// predicate evaluated through a reference that no longer resolves.
    fn command_change(&mut self, cmd: CommandId) {
        let _ = cmd;
    }

    /// Command `cmd` has no recorded run.
    fn never_run(&mut self, cmd: CommandId) {
        let _ = cmd;
    }

    /// A reference did not resolve to the recorded result.
    fn resolution_change(&mut self, cmd: CommandId, expected: i32, observed: i32) {
        let _ = (cmd, expected, observed);
    }

    /// A child exited with a different status than its parent recorded.
    fn exit_code_change(&mut self, parent: CommandId, child: CommandId, expected: i32, observed: i32) {
        let _ = (parent, child, expected, observed);
    }

    /// An artifact's final modeled version does not match the disk.
    fn final_mismatch(&mut self, artifact: ArtifactId, creator: Option<CommandId>, can_commit: bool) {
        let _ = (artifact, creator, can_commit);
    }

    /// A parent launched a child command.
    fn launch(&mut self, parent: CommandId, child: CommandId) {
        let _ = (parent, child);
    }
}

/// Observer that ignores everything; used for the execute pass.
pub struct NullObserver;

impl BuildObserver for NullObserver {}

/// Errors surfaced by the filesystem model.
#[derive(Error, Debug)]
pub enum VfsError {
    #[error("no way to materialize {path} without rerunning its creator")]
    UncommittableVersion { path: PathBuf },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Cas(#[from] retrace_cas::CasError),
}

pub type Result<T> = std::result::Result<T, VfsError>;

impl VfsError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        VfsError::Io {
            path: path.into(),
            source,
        }
    }
}
