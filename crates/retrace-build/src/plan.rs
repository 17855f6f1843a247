//! The rebuild plan: which commands rerun, and why.

use std::collections::BTreeMap;

use retrace_ir::CommandId;

/// Why a command was scheduled for re-execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// The command directly observed a change.
    Changed,
    /// Its parent is rerunning, so its recorded launch is gone.
    Child,
    /// A command it reads from is rerunning, so its inputs may differ.
    InputMayChange,
    /// Another command needs output only this command can produce.
    OutputNeeded,
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Reason::Changed => "changed",
            Reason::Child => "parent rerunning",
            Reason::InputMayChange => "input may change",
            Reason::OutputNeeded => "output needed",
        };
        f.write_str(s)
    }
}

/// The set of commands to re-execute. Commands not in the plan have their
/// recorded steps replayed unchanged.
#[derive(Debug, Clone, Default)]
pub struct RebuildPlan {
    marked: BTreeMap<CommandId, Reason>,
}

impl RebuildPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a command for rerun. Returns false if it was already marked; the
    /// first reason wins.
    pub fn mark(&mut self, cmd: CommandId, reason: Reason) -> bool {
        use std::collections::btree_map::Entry;
        match self.marked.entry(cmd) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(reason);
                true
            }
        }
    }

    pub fn must_run(&self, cmd: CommandId) -> bool {
        self.marked.contains_key(&cmd)
    }

    pub fn reason(&self, cmd: CommandId) -> Option<Reason> {
        self.marked.get(&cmd).copied()
    }

    pub fn len(&self) -> usize {
        self.marked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marked.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CommandId, Reason)> + '_ {
        self.marked.iter().map(|(c, r)| (*c, *r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let mut plan = RebuildPlan::new();
        assert!(plan.mark(CommandId(1), Reason::Changed));
        assert!(!plan.mark(CommandId(1), Reason::Child));
        assert_eq!(plan.reason(CommandId(1)), Some(Reason::Changed));
    }

    #[test]
    fn test_unmarked_commands_do_not_run() {
        let plan = RebuildPlan::new();
        assert!(!plan.must_run(CommandId(1)));
        assert!(plan.is_empty());
    }
}
