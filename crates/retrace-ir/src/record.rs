//! Trace records and the sink interface they are dispatched through.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{AccessFlags, CommandId, ContentPayload, Metadata, RefId};

/// The special entities a command can reference without a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpecialRef {
    Stdin,
    Stdout,
    Stderr,
    Root,
    Cwd,
    LaunchExe,
}

impl SpecialRef {
    /// The conventional reference slot for this entity.
    pub fn slot(&self) -> RefId {
        match self {
            SpecialRef::Stdin => RefId::STDIN,
            SpecialRef::Stdout => RefId::STDOUT,
            SpecialRef::Stderr => RefId::STDERR,
            SpecialRef::Root => RefId::ROOT,
            SpecialRef::Cwd => RefId::CWD,
            SpecialRef::LaunchExe => RefId::EXE,
        }
    }
}

/// The serializable identity of a command: what would be needed to launch it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Argument vector; `args[0]` names the executable.
    pub args: Vec<String>,
    /// Initial file descriptor table: fd number to the command's own ref slot.
    pub initial_fds: Vec<(i32, RefId)>,
}

impl CommandSpec {
    pub fn new(args: Vec<String>) -> Self {
        CommandSpec {
            args,
            initial_fds: vec![
                (0, RefId::STDIN),
                (1, RefId::STDOUT),
                (2, RefId::STDERR),
            ],
        }
    }

    /// The executable's base name, used for one-line displays.
    pub fn short_name(&self) -> &str {
        let exe = self.args.first().map(String::as_str).unwrap_or("<empty>");
        exe.rsplit('/').next().unwrap_or(exe)
    }

    /// The full argv joined with spaces.
    pub fn full_name(&self) -> String {
        self.args.join(" ")
    }
}

/// One record in a build trace. Every record names the issuing command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IrRecord {
    /// Reference one of the special entities.
    SpecialRef {
        cmd: CommandId,
        entity: SpecialRef,
        out: RefId,
    },
    /// Create an anonymous pipe, producing read and write end references.
    PipeRef {
        cmd: CommandId,
        read_out: RefId,
        write_out: RefId,
    },
    /// Create an anonymous file.
    FileRef {
        cmd: CommandId,
        mode: u32,
        out: RefId,
    },
    /// Create an anonymous symlink with the given target.
    SymlinkRef {
        cmd: CommandId,
        target: PathBuf,
        out: RefId,
    },
    /// Create an anonymous directory.
    DirRef {
        cmd: CommandId,
        mode: u32,
        out: RefId,
    },
    /// Resolve a path from a base reference.
    PathRef {
        cmd: CommandId,
        base: RefId,
        path: PathBuf,
        flags: AccessFlags,
        out: RefId,
    },
    /// The reference must resolve to the given result (0 or an errno).
    ExpectResult {
        cmd: CommandId,
        ref_id: RefId,
        expected: i32,
    },
    /// The artifact's metadata must match the recorded version.
    MatchMetadata {
        cmd: CommandId,
        ref_id: RefId,
        expected: Metadata,
    },
    /// The artifact's content must match the recorded version.
    MatchContent {
        cmd: CommandId,
        ref_id: RefId,
        expected: ContentPayload,
    },
    /// The command wrote new metadata through the reference.
    UpdateMetadata {
        cmd: CommandId,
        ref_id: RefId,
        written: Metadata,
    },
    /// The command wrote new content through the reference.
    UpdateContent {
        cmd: CommandId,
        ref_id: RefId,
        written: ContentPayload,
    },
    /// The command launched a child, inheriting the listed references
    /// (parent slot, child slot).
    Launch {
        cmd: CommandId,
        child: CommandId,
        spec: CommandSpec,
        refs: Vec<(RefId, RefId)>,
    },
    /// The command joined a child that exited with the recorded status.
    Join {
        cmd: CommandId,
        child: CommandId,
        exit_status: i32,
    },
    /// The command itself exited.
    Exit {
        cmd: CommandId,
        exit_status: i32,
    },
}

impl IrRecord {
    /// The command that issued this record.
    pub fn cmd(&self) -> CommandId {
        match *self {
            IrRecord::SpecialRef { cmd, .. }
            | IrRecord::PipeRef { cmd, .. }
            | IrRecord::FileRef { cmd, .. }
            | IrRecord::SymlinkRef { cmd, .. }
            | IrRecord::DirRef { cmd, .. }
            | IrRecord::PathRef { cmd, .. }
            | IrRecord::ExpectResult { cmd, .. }
            | IrRecord::MatchMetadata { cmd, .. }
            | IrRecord::MatchContent { cmd, .. }
            | IrRecord::UpdateMetadata { cmd, .. }
            | IrRecord::UpdateContent { cmd, .. }
            | IrRecord::Launch { cmd, .. }
            | IrRecord::Join { cmd, .. }
            | IrRecord::Exit { cmd, .. } => cmd,
        }
    }
}

/// A consumer of trace records, one method per record kind.
///
/// Both the build runner and the output trace writer implement this, so a
/// record source can feed either without knowing which.
pub trait IrSink {
    fn special_ref(&mut self, cmd: CommandId, entity: SpecialRef, out: RefId);
    fn pipe_ref(&mut self, cmd: CommandId, read_out: RefId, write_out: RefId);
    fn file_ref(&mut self, cmd: CommandId, mode: u32, out: RefId);
    fn symlink_ref(&mut self, cmd: CommandId, target: PathBuf, out: RefId);
    fn dir_ref(&mut self, cmd: CommandId, mode: u32, out: RefId);
    fn path_ref(
        &mut self,
        cmd: CommandId,
        base: RefId,
        path: PathBuf,
        flags: AccessFlags,
        out: RefId,
    );
    fn expect_result(&mut self, cmd: CommandId, ref_id: RefId, expected: i32);
    fn match_metadata(&mut self, cmd: CommandId, ref_id: RefId, expected: Metadata);
    fn match_content(&mut self, cmd: CommandId, ref_id: RefId, expected: ContentPayload);
    fn update_metadata(&mut self, cmd: CommandId, ref_id: RefId, written: Metadata);
    fn update_content(&mut self, cmd: CommandId, ref_id: RefId, written: ContentPayload);
    fn launch(
        &mut self,
        cmd: CommandId,
        child: CommandId,
        spec: CommandSpec,
        refs: Vec<(RefId, RefId)>,
    );
    fn join(&mut self, cmd: CommandId, child: CommandId, exit_status: i32);
    fn exit(&mut self, cmd: CommandId, exit_status: i32);

    /// The record stream is complete.
    fn finish(&mut self) {}
}

/// Dispatch one record to a sink.
pub fn dispatch<S: IrSink + ?Sized>(record: IrRecord, sink: &mut S) {
    match record {
        IrRecord::SpecialRef { cmd, entity, out } => sink.special_ref(cmd, entity, out),
        IrRecord::PipeRef {
            cmd,
            read_out,
            write_out,
        } => sink.pipe_ref(cmd, read_out, write_out),
        IrRecord::FileRef { cmd, mode, out } => sink.file_ref(cmd, mode, out),
        IrRecord::SymlinkRef { cmd, target, out } => sink.symlink_ref(cmd, target, out),
        IrRecord::DirRef { cmd, mode, out } => sink.dir_ref(cmd, mode, out),
        IrRecord::PathRef {
            cmd,
            base,
            path,
            flags,
            out,
        } => sink.path_ref(cmd, base, path, flags, out),
        IrRecord::ExpectResult {
            cmd,
            ref_id,
            expected,
        } => sink.expect_result(cmd, ref_id, expected),
        IrRecord::MatchMetadata {
            cmd,
            ref_id,
            expected,
        } => sink.match_metadata(cmd, ref_id, expected),
        IrRecord::MatchContent {
            cmd,
            ref_id,
            expected,
        } => sink.match_content(cmd, ref_id, expected),
        IrRecord::UpdateMetadata {
            cmd,
            ref_id,
            written,
        } => sink.update_metadata(cmd, ref_id, written),
        IrRecord::UpdateContent {
            cmd,
            ref_id,
            written,
        } => sink.update_content(cmd, ref_id, written),
        IrRecord::Launch {
            cmd,
            child,
            spec,
            refs,
        } => sink.launch(cmd, child, spec, refs),
        IrRecord::Join {
            cmd,
            child,
            exit_status,
        } => sink.join(cmd, child, exit_status),
        IrRecord::Exit { cmd, exit_status } => sink.exit(cmd, exit_status),
    }
}

/// Feed an ordered record stream into a sink, finishing it at the end.
pub fn send_records<I, S>(records: I, sink: &mut S)
where
    I: IntoIterator<Item = IrRecord>,
    S: IrSink + ?Sized,
{
    for record in records {
        dispatch(record, sink);
    }
    sink.finish();
}
