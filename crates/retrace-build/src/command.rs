//! Runtime command state and the build-owned command table.

use retrace_ir::{AccessFlags, CommandId, CommandSpec, RefId};
use retrace_vfs::Resolution;

/// Where a command is in its lifecycle for this build.
///
/// `Pending → Emulating → (Finished | MustRun) → Running → Exited`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Known to the build but no record processed yet.
    Pending,
    /// Its recorded steps are being replayed.
    Emulating,
    /// Emulation finished; nothing more to do this build.
    Finished,
    /// Scheduled for re-execution.
    MustRun,
    /// Launched under the interceptor.
    Running,
    /// Terminal for the build.
    Exited,
}

/// The outcome of one of a command's references.
#[derive(Debug, Clone, Copy)]
pub struct RefResult {
    pub resolution: Resolution,
    pub flags: AccessFlags,
}

impl RefResult {
    pub fn new(resolution: Resolution, flags: AccessFlags) -> Self {
        RefResult { resolution, flags }
    }

    /// 0 on success, otherwise the errno the resolution produced.
    pub fn result_code(&self) -> i32 {
        match self.resolution {
            Ok(_) => 0,
            Err(e) => e,
        }
    }
}

#[derive(Debug)]
pub struct Command {
    pub id: CommandId,
    pub spec: CommandSpec,
    pub parent: Option<CommandId>,
    pub children: Vec<CommandId>,
    refs: Vec<Option<RefResult>>,
    next_ref: u16,
    pub exit_status: Option<i32>,
    pub state: CommandState,
    /// Whether this command appeared in a previously saved trace.
    pub has_trace: bool,
}

impl Command {
    fn new(id: CommandId, spec: CommandSpec, parent: Option<CommandId>, has_trace: bool) -> Self {
        Command {
            id,
            spec,
            parent,
            children: Vec::new(),
            refs: Vec::new(),
            next_ref: RefId::FIRST_FREE,
            exit_status: None,
            state: CommandState::Pending,
            has_trace,
        }
    }

    /// True iff the command has no prior recorded run.
    pub fn never_run(&self) -> bool {
        !self.has_trace
    }

    /// Forget per-run state before a re-execution.
    pub fn reset(&mut self) {
        self.children.clear();
        self.refs.clear();
        self.next_ref = RefId::FIRST_FREE;
        self.exit_status = None;
    }

    pub fn set_ref(&mut self, id: RefId, result: RefResult) {
        let idx = id.0 as usize;
        if self.refs.len() <= idx {
            self.refs.resize(idx + 1, None);
        }
        self.refs[idx] = Some(result);
        if id.0 >= self.next_ref {
            self.next_ref = id.0 + 1;
        }
    }

    pub fn get_ref(&self, id: RefId) -> Option<RefResult> {
        self.refs.get(id.0 as usize).copied().flatten()
    }

    /// Allocate a fresh reference slot for a traced operation.
    pub fn fresh_ref(&mut self) -> RefId {
        let id = RefId(self.next_ref);
        self.next_ref += 1;
        id
    }

    pub fn short_name(&self) -> &str {
        self.spec.short_name()
    }

    pub fn full_name(&self) -> String {
        self.spec.full_name()
    }
}

/// All commands known to a build, indexed densely by [`CommandId`].
///
/// The table always contains the build tool pseudo-command at id 0; the
/// version creator back-references throughout the model are indices into this
/// table.
#[derive(Debug)]
pub struct CommandTable {
    commands: Vec<Command>,
}

impl CommandTable {
    pub fn new() -> Self {
        let tool = Command::new(
            CommandId::BUILD_TOOL,
            CommandSpec::new(vec!["retrace".to_string()]),
            None,
            true,
        );
        CommandTable {
            commands: vec![tool],
        }
    }

    /// Register a command under the id its trace record assigned.
    ///
    /// Ids in a trace are dense and appear in launch order, so out-of-order
    /// registration indicates a corrupt stream and panics.
    pub fn intern(
        &mut self,
        id: CommandId,
        spec: CommandSpec,
        parent: Option<CommandId>,
        has_trace: bool,
    ) -> CommandId {
        assert_eq!(
            id.0 as usize,
            self.commands.len(),
            "command {} registered out of order",
            id
        );
        self.commands.push(Command::new(id, spec, parent, has_trace));
        id
    }

    /// Register a command discovered during tracing, assigning the next id.
    pub fn intern_new(&mut self, spec: CommandSpec, parent: Option<CommandId>) -> CommandId {
        let id = CommandId(self.commands.len() as u32);
        self.commands.push(Command::new(id, spec, parent, false));
        id
    }

    pub fn contains(&self, id: CommandId) -> bool {
        (id.0 as usize) < self.commands.len()
    }

    pub fn get(&self, id: CommandId) -> &Command {
        &self.commands[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: CommandId) -> &mut Command {
        &mut self.commands[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}
