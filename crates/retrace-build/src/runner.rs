//! The build runner.
//!
//! One `Build` drives one pass over a trace. In [`BuildMode::Emulate`] every
//! record is applied to the model and deviations flow to the observer — this
//! is the planning pass. In [`BuildMode::Execute`] the same records are
//! replayed into a fresh model, except that commands in the rebuild plan are
//! launched under the interceptor instead of being emulated; their recorded
//! steps are dropped and whatever the interceptor reports through the
//! `trace_*` surface takes their place in the output trace.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use tracing::{debug, warn};

use retrace_ir::{
    AccessFlags, CommandId, CommandSpec, ContentPayload, DirPayload, FileContent, IrSink,
    Metadata, RefId, Scenario, SpecialRef, TraceWriter,
};
use retrace_vfs::{ArtifactBody, BuildObserver, DirUpdate, Env, InputType};

use crate::command::{CommandState, CommandTable, RefResult};
use crate::error::BuildError;
use crate::interceptor::{Interceptor, TracedProcess};
use crate::plan::RebuildPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Apply records to the model only; nothing touches the disk.
    Emulate,
    /// Rerun planned commands, emulate the rest, emit the output trace.
    Execute,
}

/// Step and command counts for the user-facing summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunStats {
    pub emulated_steps: usize,
    pub traced_steps: usize,
    pub emulated_commands: usize,
    pub traced_commands: usize,
}

/// Knobs the execute pass honors.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub print_on_run: bool,
    pub print_full: bool,
}

pub struct Build<'a> {
    mode: BuildMode,
    env: Env,
    cmds: CommandTable,
    plan: RebuildPlan,
    /// Commands that issued at least one record in the loaded trace; anything
    /// else has never run.
    with_steps: HashSet<CommandId>,
    observer: &'a mut dyn BuildObserver,
    writer: Option<&'a mut TraceWriter>,
    interceptor: Option<&'a mut dyn Interceptor>,
    processes: HashMap<CommandId, Box<dyn TracedProcess>>,
    /// Commands the interceptor actually reported steps for this run. A
    /// launched command that never appears here ran untraced; it is left out
    /// of the output trace so the next build treats it as never run.
    traced: HashSet<CommandId>,
    opts: RunOptions,
    stats: RunStats,
    error: Option<BuildError>,
}

impl<'a> Build<'a> {
    /// An emulation-only pass feeding the given observer.
    pub fn emulate(
        env: Env,
        with_steps: HashSet<CommandId>,
        observer: &'a mut dyn BuildObserver,
    ) -> Self {
        Build {
            mode: BuildMode::Emulate,
            env,
            cmds: CommandTable::new(),
            plan: RebuildPlan::new(),
            with_steps,
            observer,
            writer: None,
            interceptor: None,
            processes: HashMap::new(),
            traced: HashSet::new(),
            opts: RunOptions::default(),
            stats: RunStats::default(),
            error: None,
        }
    }

    /// The execute pass: rerun planned commands, emulate the rest, and write
    /// everything that happened into `writer`.
    pub fn execute(
        env: Env,
        plan: RebuildPlan,
        with_steps: HashSet<CommandId>,
        observer: &'a mut dyn BuildObserver,
        writer: &'a mut TraceWriter,
        interceptor: &'a mut dyn Interceptor,
        opts: RunOptions,
    ) -> Self {
        Build {
            mode: BuildMode::Execute,
            env,
            cmds: CommandTable::new(),
            plan,
            with_steps,
            observer,
            writer: Some(writer),
            interceptor: Some(interceptor),
            processes: HashMap::new(),
            traced: HashSet::new(),
            opts,
            stats: RunStats::default(),
            error: None,
        }
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    /// Surface a fatal error raised while the stream was being consumed.
    pub fn take_error(&mut self) -> Option<BuildError> {
        self.error.take()
    }

    /// Hand back the model and command table once the pass is done.
    pub fn into_parts(self) -> (Env, CommandTable, RunStats) {
        (self.env, self.cmds, self.stats)
    }

    pub fn commands(&self) -> &CommandTable {
        &self.cmds
    }

    /// Records from a command scheduled for rerun are dropped: the real
    /// execution replaces them. Records from commands the stream never
    /// launched are dropped too — the trace does not make sense.
    fn skip(&self, cmd: CommandId) -> bool {
        if self.error.is_some() {
            return true;
        }
        if !self.cmds.contains(cmd) {
            warn!(command = %cmd, "record from a command that never launched");
            return true;
        }
        self.mode == BuildMode::Execute && self.plan.must_run(cmd)
    }

    fn count_step(&mut self) {
        self.stats.emulated_steps += 1;
    }

    fn trace_step(&mut self, cmd: CommandId) {
        self.stats.traced_steps += 1;
        self.traced.insert(cmd);
    }

    fn mark_emulating(&mut self, cmd: CommandId) {
        let c = self.cmds.get_mut(cmd);
        if c.state == CommandState::Pending {
            c.state = CommandState::Emulating;
        }
    }

    fn get_ref(&self, cmd: CommandId, id: RefId) -> Option<RefResult> {
        if !self.cmds.contains(cmd) {
            return None;
        }
        self.cmds.get(cmd).get_ref(id)
    }

    /// A record referenced a slot that was never filled. The trace decoded
    /// but does not make sense; treat the command as changed rather than
    /// trusting it.
    fn bad_ref(&mut self, cmd: CommandId, id: RefId) {
        warn!(command = %cmd, slot = %id, "record uses an unfilled reference slot");
        self.observer.command_change(cmd);
    }

    fn print_command(&self, spec: &CommandSpec) {
        if self.opts.print_full {
            println!("{}", spec.full_name());
        } else {
            println!("{}", spec.short_name());
        }
    }

    /************ Record handling shared by both passes ************/

    fn apply_update_content(
        &mut self,
        cmd: CommandId,
        ref_id: RefId,
        written: &ContentPayload,
        committed: bool,
    ) {
        let Some(r) = self.get_ref(cmd, ref_id) else {
            self.bad_ref(cmd, ref_id);
            return;
        };
        let Ok(artifact) = r.resolution else {
            // Writing through a failed resolution: the recorded run saw a
            // world where this resolved
            self.observer.command_change(cmd);
            return;
        };

        match written {
            ContentPayload::Dir(DirPayload::AddEntry { name, target }) => {
                match self.get_ref(cmd, *target).map(|t| t.resolution) {
                    Some(Ok(t)) => self.env.apply_dir_entry(
                        self.observer,
                        cmd,
                        artifact,
                        DirUpdate::Add {
                            name: name.clone(),
                            target: t,
                        },
                        committed,
                    ),
                    _ => self.observer.command_change(cmd),
                }
            }
            ContentPayload::Dir(DirPayload::RemoveEntry { name }) => {
                self.env.apply_dir_entry(
                    self.observer,
                    cmd,
                    artifact,
                    DirUpdate::Remove { name: name.clone() },
                    committed,
                );
            }
            other => {
                self.env
                    .update_content(self.observer, (cmd, ref_id), artifact, other, committed);
            }
        }
    }

    fn wait_for(&mut self, child: CommandId) -> Option<i32> {
        let mut process = self.processes.remove(&child)?;
        match process.wait() {
            Ok(status) => {
                let c = self.cmds.get_mut(child);
                c.exit_status = Some(status);
                c.state = CommandState::Exited;
                Some(status)
            }
            Err(e) => {
                self.error = Some(e);
                None
            }
        }
    }

    /// Wind the pass down: wait for stragglers, complete their join/exit
    /// records, and compare the final model against the disk (emulation
    /// pass only — the execute pass commits instead, via the driver).
    ///
    /// A straggler the interceptor never reported steps for ran untraced;
    /// nothing about it goes into the output trace, so the next build plans
    /// it as never run instead of wrongly trusting an empty history.
    pub fn finish_pass(&mut self) {
        let mut pending: Vec<CommandId> = self.processes.keys().copied().collect();
        pending.sort();
        for child in pending {
            let Some(status) = self.wait_for(child) else {
                continue;
            };
            if !self.traced.contains(&child) {
                continue;
            }
            let parent = self.cmds.get(child).parent.unwrap_or(CommandId::BUILD_TOOL);
            if let Some(w) = self.writer.as_deref_mut() {
                w.exit(child, status);
                w.join(parent, child, status);
            }
        }

        if self.mode == BuildMode::Emulate {
            self.env.check_final_state(self.observer);
        }
    }

    /************ The interceptor-facing call surface ************/
    //
    // One call per observed event, applied to the model exactly as the
    // emulated equivalents are, and emitted into the output trace. These are
    // only meaningful during the execute pass.

    pub fn trace_pipe_ref(&mut self, cmd: CommandId) -> (RefId, RefId) {
        self.trace_step(cmd);
        let pipe = self.env.get_pipe(self.observer, Some(cmd));
        let c = self.cmds.get_mut(cmd);
        let read_out = c.fresh_ref();
        let write_out = c.fresh_ref();
        c.set_ref(read_out, RefResult::new(Ok(pipe), AccessFlags::read()));
        c.set_ref(
            write_out,
            RefResult::new(
                Ok(pipe),
                AccessFlags {
                    w: true,
                    ..Default::default()
                },
            ),
        );
        if let Some(w) = self.writer.as_deref_mut() {
            w.pipe_ref(cmd, read_out, write_out);
        }
        (read_out, write_out)
    }

    pub fn trace_file_ref(&mut self, cmd: CommandId, mode: u32) -> RefId {
        self.trace_step(cmd);
        let file = self.env.create_file(self.observer, Some(cmd), mode, true);
        let c = self.cmds.get_mut(cmd);
        let out = c.fresh_ref();
        c.set_ref(
            out,
            RefResult::new(
                Ok(file),
                AccessFlags {
                    r: true,
                    w: true,
                    ..Default::default()
                },
            ),
        );
        if let Some(w) = self.writer.as_deref_mut() {
            w.file_ref(cmd, mode, out);
        }
        out
    }

    pub fn trace_symlink_ref(&mut self, cmd: CommandId, target: PathBuf) -> RefId {
        self.trace_step(cmd);
        let link = self
            .env
            .get_symlink(self.observer, Some(cmd), target.clone(), true);
        let c = self.cmds.get_mut(cmd);
        let out = c.fresh_ref();
        c.set_ref(out, RefResult::new(Ok(link), AccessFlags::read()));
        if let Some(w) = self.writer.as_deref_mut() {
            w.symlink_ref(cmd, target, out);
        }
        out
    }

    pub fn trace_dir_ref(&mut self, cmd: CommandId, mode: u32) -> RefId {
        self.trace_step(cmd);
        let dir = self.env.get_dir(self.observer, Some(cmd), mode, true);
        let c = self.cmds.get_mut(cmd);
        let out = c.fresh_ref();
        c.set_ref(out, RefResult::new(Ok(dir), AccessFlags::read_exec()));
        if let Some(w) = self.writer.as_deref_mut() {
            w.dir_ref(cmd, mode, out);
        }
        out
    }

    pub fn trace_path_ref(
        &mut self,
        cmd: CommandId,
        base: RefId,
        path: PathBuf,
        flags: AccessFlags,
    ) -> RefId {
        self.trace_step(cmd);
        let resolution = match self.get_ref(cmd, base).map(|r| r.resolution) {
            Some(Ok(b)) => self
                .env
                .resolve(self.observer, cmd, b, &path, flags, true),
            Some(Err(e)) => Err(e),
            None => Err(libc::EINVAL),
        };
        let c = self.cmds.get_mut(cmd);
        let out = c.fresh_ref();
        c.set_ref(out, RefResult::new(resolution, flags));
        if let Some(w) = self.writer.as_deref_mut() {
            w.path_ref(cmd, base, path, flags, out);
        }
        out
    }

    pub fn trace_expect_result(&mut self, cmd: CommandId, ref_id: RefId, expected: i32) {
        self.trace_step(cmd);
        if let Some(r) = self.get_ref(cmd, ref_id) {
            let actual = r.result_code();
            if actual != expected {
                // The model disagrees with what the kernel actually did;
                // record the kernel's answer and flag the divergence
                warn!(
                    command = %cmd,
                    expected = %retrace_ir::errno_name(expected),
                    modeled = %retrace_ir::errno_name(actual),
                    "syscall result diverges from the model"
                );
            }
        }
        if let Some(w) = self.writer.as_deref_mut() {
            w.expect_result(cmd, ref_id, expected);
        }
    }

    pub fn trace_match_metadata(&mut self, cmd: CommandId, ref_id: RefId) {
        self.trace_step(cmd);
        let Some(Ok(artifact)) = self.get_ref(cmd, ref_id).map(|r| r.resolution) else {
            return;
        };
        // A command re-reading its own write adds no dependency and no record
        if self.env.metadata_writer(artifact) == Some((cmd, ref_id)) {
            return;
        }
        let observed =
            self.env
                .get_metadata(self.observer, (cmd, ref_id), artifact, InputType::Accessed);
        if let Some(w) = self.writer.as_deref_mut() {
            w.match_metadata(cmd, ref_id, observed);
        }
    }

    pub fn trace_match_content(&mut self, cmd: CommandId, ref_id: RefId) {
        self.trace_step(cmd);
        let Some(Ok(artifact)) = self.get_ref(cmd, ref_id).map(|r| r.resolution) else {
            return;
        };
        if self.env.content_writer(artifact) == Some((cmd, ref_id)) {
            return;
        }
        let observed =
            self.env
                .get_content(self.observer, (cmd, ref_id), artifact, InputType::Accessed);
        if let Some(w) = self.writer.as_deref_mut() {
            w.match_content(cmd, ref_id, observed);
        }
    }

    pub fn trace_update_metadata(&mut self, cmd: CommandId, ref_id: RefId, meta: Metadata) {
        self.trace_step(cmd);
        let Some(Ok(artifact)) = self.get_ref(cmd, ref_id).map(|r| r.resolution) else {
            warn!(command = %cmd, "metadata write through an unresolved reference");
            return;
        };
        let tagged = self
            .env
            .update_metadata(self.observer, (cmd, ref_id), artifact, meta, true);
        if tagged {
            if let Some(w) = self.writer.as_deref_mut() {
                w.update_metadata(cmd, ref_id, meta);
            }
        }
    }

    /// A traced write. With no payload supplied, the content is
    /// fingerprinted from the file's on-disk state.
    pub fn trace_update_content(
        &mut self,
        cmd: CommandId,
        ref_id: RefId,
        payload: Option<ContentPayload>,
    ) {
        self.trace_step(cmd);
        let Some(Ok(artifact)) = self.get_ref(cmd, ref_id).map(|r| r.resolution) else {
            warn!(command = %cmd, "content write through an unresolved reference");
            return;
        };

        let payload = payload.unwrap_or_else(|| {
            let fingerprint = self
                .env
                .current_path(artifact)
                .and_then(|p| self.env.cas().digest(&p).ok());
            match fingerprint {
                Some(fp) => ContentPayload::File(FileContent {
                    fingerprint: Some(fp),
                    blob: None,
                }),
                None => ContentPayload::File(FileContent::empty()),
            }
        });

        match &payload {
            ContentPayload::Dir(_) => {
                self.apply_update_content(cmd, ref_id, &payload, true);
                if let Some(w) = self.writer.as_deref_mut() {
                    w.update_content(cmd, ref_id, payload);
                }
            }
            other => {
                let tagged =
                    self.env
                        .update_content(self.observer, (cmd, ref_id), artifact, other, true);
                if tagged {
                    if let Some(w) = self.writer.as_deref_mut() {
                        w.update_content(cmd, ref_id, payload);
                    }
                }
            }
        }
    }

    /// A traced process launched a child. Returns the child's id so
    /// subsequent events can be attributed to it.
    pub fn trace_launch(
        &mut self,
        parent: CommandId,
        args: Vec<String>,
        fds: Vec<(i32, RefId)>,
    ) -> CommandId {
        self.trace_step(parent);
        self.stats.traced_commands += 1;

        let mut spec = CommandSpec::new(args);
        spec.initial_fds.clear();

        // Inherit the conventional slots, then map the fd table
        let mut refs: Vec<(RefId, RefId)> = vec![
            (RefId::ROOT, RefId::ROOT),
            (RefId::CWD, RefId::CWD),
            (RefId::EXE, RefId::EXE),
        ];
        let mut next_child_slot = RefId::FIRST_FREE;
        for (fd, parent_slot) in &fds {
            let child_slot = match *fd {
                0 => RefId::STDIN,
                1 => RefId::STDOUT,
                2 => RefId::STDERR,
                _ => {
                    let s = RefId(next_child_slot);
                    next_child_slot += 1;
                    s
                }
            };
            spec.initial_fds.push((*fd, child_slot));
            refs.push((*parent_slot, child_slot));
        }

        let child = self.cmds.intern_new(spec.clone(), Some(parent));
        for (parent_slot, child_slot) in &refs {
            if let Some(r) = self.get_ref(parent, *parent_slot) {
                self.cmds.get_mut(child).set_ref(*child_slot, r);
            }
        }
        self.cmds.get_mut(child).state = CommandState::Running;
        self.cmds.get_mut(parent).children.push(child);
        self.observer.launch(parent, child);

        if let Some(w) = self.writer.as_deref_mut() {
            w.launch(parent, child, spec, refs);
        }
        child
    }

    pub fn trace_join(&mut self, parent: CommandId, child: CommandId, exit_status: i32) {
        self.trace_step(parent);
        let c = self.cmds.get_mut(child);
        c.exit_status = Some(exit_status);
        c.state = CommandState::Exited;
        self.processes.remove(&child);
        if let Some(w) = self.writer.as_deref_mut() {
            w.join(parent, child, exit_status);
        }
    }

    pub fn trace_exit(&mut self, cmd: CommandId, exit_status: i32) {
        self.trace_step(cmd);
        let c = self.cmds.get_mut(cmd);
        c.exit_status = Some(exit_status);
        if let Some(w) = self.writer.as_deref_mut() {
            w.exit(cmd, exit_status);
        }
        // Snapshot this command's outputs while they are fresh
        self.env.cache_all();
    }
}

impl<'a> IrSink for Build<'a> {
    fn special_ref(&mut self, cmd: CommandId, entity: SpecialRef, out: RefId) {
        if self.skip(cmd) {
            return;
        }
        self.count_step();
        self.mark_emulating(cmd);
        if let Some(w) = self.writer.as_deref_mut() {
            w.special_ref(cmd, entity, out);
        }

        let result = match entity {
            SpecialRef::Stdin => {
                RefResult::new(Ok(self.env.get_std_stream(0)), AccessFlags::read())
            }
            SpecialRef::Stdout => RefResult::new(
                Ok(self.env.get_std_stream(1)),
                AccessFlags {
                    w: true,
                    ..Default::default()
                },
            ),
            SpecialRef::Stderr => RefResult::new(
                Ok(self.env.get_std_stream(2)),
                AccessFlags {
                    w: true,
                    ..Default::default()
                },
            ),
            SpecialRef::Root => {
                RefResult::new(Ok(self.env.get_root_dir()), AccessFlags::read_exec())
            }
            SpecialRef::Cwd => {
                let cwd = std::env::current_dir()
                    .unwrap_or_else(|e| panic!("failed to resolve working directory: {}", e));
                let artifact = self
                    .env
                    .get_filesystem_artifact(&cwd)
                    .unwrap_or_else(|e| panic!("failed to model working directory: {}", e));
                RefResult::new(Ok(artifact), AccessFlags::read_exec())
            }
            SpecialRef::LaunchExe => {
                let resolution = std::env::current_exe()
                    .and_then(|exe| self.env.get_filesystem_artifact(&exe))
                    .map_err(|e| e.raw_os_error().unwrap_or(libc::ENOENT));
                RefResult::new(resolution, AccessFlags::read_exec())
            }
        };
        self.cmds.get_mut(cmd).set_ref(out, result);
    }

    fn pipe_ref(&mut self, cmd: CommandId, read_out: RefId, write_out: RefId) {
        if self.skip(cmd) {
            return;
        }
        self.count_step();
        self.mark_emulating(cmd);
        if let Some(w) = self.writer.as_deref_mut() {
            w.pipe_ref(cmd, read_out, write_out);
        }

        let pipe = self.env.get_pipe(self.observer, Some(cmd));
        let c = self.cmds.get_mut(cmd);
        c.set_ref(read_out, RefResult::new(Ok(pipe), AccessFlags::read()));
        c.set_ref(
            write_out,
            RefResult::new(
                Ok(pipe),
                AccessFlags {
                    w: true,
                    ..Default::default()
                },
            ),
        );
    }

    fn file_ref(&mut self, cmd: CommandId, mode: u32, out: RefId) {
        if self.skip(cmd) {
            return;
        }
        self.count_step();
        self.mark_emulating(cmd);
        if let Some(w) = self.writer.as_deref_mut() {
            w.file_ref(cmd, mode, out);
        }

        let file = self.env.create_file(self.observer, Some(cmd), mode, false);
        self.cmds.get_mut(cmd).set_ref(
            out,
            RefResult::new(
                Ok(file),
                AccessFlags {
                    r: true,
                    w: true,
                    ..Default::default()
                },
            ),
        );
    }

    fn symlink_ref(&mut self, cmd: CommandId, target: PathBuf, out: RefId) {
        if self.skip(cmd) {
            return;
        }
        self.count_step();
        self.mark_emulating(cmd);
        if let Some(w) = self.writer.as_deref_mut() {
            w.symlink_ref(cmd, target.clone(), out);
        }

        let link = self.env.get_symlink(self.observer, Some(cmd), target, false);
        self.cmds
            .get_mut(cmd)
            .set_ref(out, RefResult::new(Ok(link), AccessFlags::read()));
    }

    fn dir_ref(&mut self, cmd: CommandId, mode: u32, out: RefId) {
        if self.skip(cmd) {
            return;
        }
        self.count_step();
        self.mark_emulating(cmd);
        if let Some(w) = self.writer.as_deref_mut() {
            w.dir_ref(cmd, mode, out);
        }

        let dir = self.env.get_dir(self.observer, Some(cmd), mode, false);
        self.cmds
            .get_mut(cmd)
            .set_ref(out, RefResult::new(Ok(dir), AccessFlags::read_exec()));
    }

    fn path_ref(&mut self, cmd: CommandId, base: RefId, path: PathBuf, flags: AccessFlags, out: RefId) {
        if self.skip(cmd) {
            return;
        }
        self.count_step();
        self.mark_emulating(cmd);
        if let Some(w) = self.writer.as_deref_mut() {
            w.path_ref(cmd, base, path.clone(), flags, out);
        }

        let resolution = match self.get_ref(cmd, base) {
            Some(r) => match r.resolution {
                Ok(b) => self.env.resolve(self.observer, cmd, b, &path, flags, false),
                Err(e) => Err(e),
            },
            None => {
                self.bad_ref(cmd, base);
                Err(libc::EINVAL)
            }
        };
        self.cmds
            .get_mut(cmd)
            .set_ref(out, RefResult::new(resolution, flags));
    }

    fn expect_result(&mut self, cmd: CommandId, ref_id: RefId, expected: i32) {
        if self.skip(cmd) {
            return;
        }
        self.count_step();
        if let Some(w) = self.writer.as_deref_mut() {
            w.expect_result(cmd, ref_id, expected);
        }

        let Some(r) = self.get_ref(cmd, ref_id) else {
            self.bad_ref(cmd, ref_id);
            return;
        };
        let actual = r.result_code();
        if actual != expected {
            debug!(
                command = %cmd,
                slot = %ref_id,
                expected = %retrace_ir::errno_name(expected),
                observed = %retrace_ir::errno_name(actual),
                "resolution changed"
            );
            self.observer.resolution_change(cmd, expected, actual);
        }
    }

    fn match_metadata(&mut self, cmd: CommandId, ref_id: RefId, expected: Metadata) {
        if self.skip(cmd) {
            return;
        }
        self.count_step();
        if let Some(w) = self.writer.as_deref_mut() {
            w.match_metadata(cmd, ref_id, expected);
        }

        match self.get_ref(cmd, ref_id).map(|r| r.resolution) {
            Some(Ok(artifact)) => {
                self.env.match_metadata(
                    self.observer,
                    (cmd, ref_id),
                    Scenario::Build,
                    artifact,
                    &expected,
                );
            }
            Some(Err(_)) => self.observer.command_change(cmd),
            None => self.bad_ref(cmd, ref_id),
        }
    }

    fn match_content(&mut self, cmd: CommandId, ref_id: RefId, expected: ContentPayload) {
        if self.skip(cmd) {
            return;
        }
        self.count_step();
        if let Some(w) = self.writer.as_deref_mut() {
            w.match_content(cmd, ref_id, expected.clone());
        }

        match self.get_ref(cmd, ref_id).map(|r| r.resolution) {
            Some(Ok(artifact)) => {
                self.env.match_content(
                    self.observer,
                    (cmd, ref_id),
                    Scenario::Build,
                    artifact,
                    &expected,
                );
            }
            Some(Err(_)) => self.observer.command_change(cmd),
            None => self.bad_ref(cmd, ref_id),
        }
    }

    fn update_metadata(&mut self, cmd: CommandId, ref_id: RefId, written: Metadata) {
        if self.skip(cmd) {
            return;
        }
        self.count_step();
        if let Some(w) = self.writer.as_deref_mut() {
            w.update_metadata(cmd, ref_id, written);
        }

        match self.get_ref(cmd, ref_id).map(|r| r.resolution) {
            Some(Ok(artifact)) => {
                self.env
                    .update_metadata(self.observer, (cmd, ref_id), artifact, written, false);
            }
            Some(Err(_)) => self.observer.command_change(cmd),
            None => self.bad_ref(cmd, ref_id),
        }
    }

    fn update_content(&mut self, cmd: CommandId, ref_id: RefId, written: ContentPayload) {
        if self.skip(cmd) {
            return;
        }
        self.count_step();
        if let Some(w) = self.writer.as_deref_mut() {
            w.update_content(cmd, ref_id, written.clone());
        }
        self.apply_update_content(cmd, ref_id, &written, false);
    }

    fn launch(&mut self, cmd: CommandId, child: CommandId, spec: CommandSpec, refs: Vec<(RefId, RefId)>) {
        if self.skip(cmd) {
            return;
        }
        self.count_step();
        self.mark_emulating(cmd);

        let has_trace = self.with_steps.contains(&child);
        self.cmds.intern(child, spec.clone(), Some(cmd), has_trace);

        // The child inherits its parent's references; inherited file content
        // becomes an input of the child
        let mut inherited: Vec<(RefId, RefResult)> = Vec::with_capacity(refs.len());
        for (parent_slot, child_slot) in &refs {
            let Some(r) = self.get_ref(cmd, *parent_slot) else {
                continue;
            };
            self.cmds.get_mut(child).set_ref(*child_slot, r);
            inherited.push((*child_slot, r));
            if let Ok(a) = r.resolution {
                if matches!(
                    self.env.artifact(a).body,
                    ArtifactBody::File { .. } | ArtifactBody::Pipe { .. }
                ) {
                    self.env
                        .get_content(self.observer, (child, *child_slot), a, InputType::Inherited);
                }
            }
        }

        self.cmds.get_mut(cmd).children.push(child);
        self.observer.launch(cmd, child);

        if self.cmds.get(child).never_run() {
            self.observer.never_run(child);
        }

        if let Some(w) = self.writer.as_deref_mut() {
            w.launch(cmd, child, spec.clone(), refs);
        }

        match self.mode {
            BuildMode::Emulate => {
                self.cmds.get_mut(child).state = CommandState::Emulating;
                self.stats.emulated_commands += 1;
            }
            BuildMode::Execute => {
                if self.plan.must_run(child) {
                    // The rerun replaces the recorded run: clear any replayed
                    // state, keeping only the inherited references
                    let c = self.cmds.get_mut(child);
                    c.reset();
                    for (slot, r) in &inherited {
                        c.set_ref(*slot, *r);
                    }
                    c.state = CommandState::MustRun;
                    if self.opts.print_on_run || self.opts.dry_run {
                        self.print_command(&spec);
                    }
                    if !self.opts.dry_run {
                        // Inputs the child will read must be on disk first
                        self.env.stage_committable();
                        match self
                            .interceptor
                            .as_deref_mut()
                            .expect("execute pass without an interceptor")
                            .start(&spec)
                        {
                            Ok(process) => {
                                self.processes.insert(child, process);
                                self.cmds.get_mut(child).state = CommandState::Running;
                                self.stats.traced_commands += 1;
                            }
                            Err(e) => self.error = Some(e),
                        }
                    }
                } else {
                    self.cmds.get_mut(child).state = CommandState::Emulating;
                    self.stats.emulated_commands += 1;
                }
            }
        }
    }

    fn join(&mut self, cmd: CommandId, child: CommandId, exit_status: i32) {
        if self.skip(cmd) {
            return;
        }
        self.count_step();

        if !self.cmds.contains(child) {
            warn!(command = %cmd, child = %child, "join of a command that never launched");
            self.observer.command_change(cmd);
            return;
        }

        // A running child is real: wait for it
        if self.processes.contains_key(&child) {
            self.wait_for(child);
        }

        let actual = self.cmds.get(child).exit_status;
        if let Some(w) = self.writer.as_deref_mut() {
            w.join(cmd, child, actual.unwrap_or(exit_status));
        }

        match actual {
            Some(actual) if actual == exit_status => {}
            Some(actual) => self
                .observer
                .exit_code_change(cmd, child, exit_status, actual),
            None => self
                .observer
                .exit_code_change(cmd, child, exit_status, -1),
        }
    }

    fn exit(&mut self, cmd: CommandId, exit_status: i32) {
        if self.skip(cmd) {
            return;
        }
        self.count_step();
        if let Some(w) = self.writer.as_deref_mut() {
            w.exit(cmd, exit_status);
        }

        let c = self.cmds.get_mut(cmd);
        c.exit_status = Some(exit_status);
        if c.state == CommandState::Emulating {
            c.state = CommandState::Finished;
        }
    }

    fn finish(&mut self) {
        self.finish_pass();
    }
}
