//! # retrace-ir
//!
//! The trace intermediate representation: the tagged records that describe a
//! command's observable interactions with the filesystem, the access-flag set
//! translated to and from POSIX bit sets, and the binary trace log codec.
//!
//! A build is recorded as an ordered stream of [`IrRecord`]s. Each record
//! carries the issuing command and falls into one of three groups:
//!
//! - *references*: name resolutions and anonymous object creations, producing
//!   a [`RefId`] slot in the issuing command's reference table;
//! - *predicates*: statements that were true on the recorded run
//!   (`ExpectResult`, `MatchMetadata`, `MatchContent`, `Join`);
//! - *actions*: state the command produced (`UpdateMetadata`, `UpdateContent`,
//!   `Launch`, `Exit`).
//!
//! Replaying the stream against an in-memory filesystem model and comparing
//! each predicate's outcome to the recorded one is what drives rebuild
//! planning.

mod flags;
mod payload;
mod record;
mod trace;

pub use flags::AccessFlags;
pub use payload::{ContentPayload, DirPayload, FileContent, Metadata};
pub use record::{dispatch, send_records, CommandSpec, IrRecord, IrSink, SpecialRef};
pub use trace::{
    default_trace, read_trace, read_trace_or_default, TraceError, TraceWriter,
    TRACE_FORMAT_VERSION,
};

use serde::{Deserialize, Serialize};

/// Identifier of a command within a build, dense from zero.
///
/// Id 0 is reserved for the build tool itself, the synthesized parent of the
/// root command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommandId(pub u32);

impl CommandId {
    /// The build tool pseudo-command, parent of the root command.
    pub const BUILD_TOOL: CommandId = CommandId(0);

    /// The root command launched on behalf of the user.
    pub const ROOT: CommandId = CommandId(1);
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cmd{}", self.0)
    }
}

/// A reference slot, local to one command's reference table.
///
/// Slots 0..=5 are conventional: stdin, stdout, stderr, the filesystem root,
/// the working directory, and the command's executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RefId(pub u16);

impl RefId {
    pub const STDIN: RefId = RefId(0);
    pub const STDOUT: RefId = RefId(1);
    pub const STDERR: RefId = RefId(2);
    pub const ROOT: RefId = RefId(3);
    pub const CWD: RefId = RefId(4);
    pub const EXE: RefId = RefId(5);

    /// First slot available for references made during execution.
    pub const FIRST_FREE: u16 = 6;
}

impl std::fmt::Display for RefId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// When a predicate is being evaluated: during trace replay, or while
/// checking the final on-disk state after the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Build,
    PostBuild,
}

/// Render an errno value with its symbolic name where known.
pub fn errno_name(err: i32) -> String {
    match err {
        0 => "OK".to_string(),
        libc::EACCES => "EACCES".to_string(),
        libc::EEXIST => "EEXIST".to_string(),
        libc::EINVAL => "EINVAL".to_string(),
        libc::EISDIR => "EISDIR".to_string(),
        libc::ELOOP => "ELOOP".to_string(),
        libc::ENOENT => "ENOENT".to_string(),
        libc::ENOTDIR => "ENOTDIR".to_string(),
        other => format!("errno {}", other),
    }
}
