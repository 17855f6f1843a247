//! The rebuild planner: an observer that turns emulation deviations and
//! dependency edges into a rerun plan.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use retrace_ir::CommandId;
use retrace_vfs::{ArtifactId, BuildObserver, InputType};

use crate::plan::{Reason, RebuildPlan};

/// Accumulates everything planning needs while a trace is emulated:
/// commands that saw different results, commands whose on-disk output is
/// stale, and the dependency edges between producers and consumers.
#[derive(Debug, Default)]
pub struct RebuildPlanner {
    /// Honor cached versions: a committable input does not force its
    /// creator to rerun.
    enable_cache: bool,
    /// Parent to children, in observation order.
    children: BTreeMap<CommandId, BTreeSet<CommandId>>,
    /// Commands that directly observed a change.
    changed: BTreeSet<CommandId>,
    /// Commands whose output must be regenerated on disk.
    output_needed: BTreeSet<CommandId>,
    /// Producer to the commands consuming its output.
    output_used_by: BTreeMap<CommandId, BTreeSet<CommandId>>,
    /// Consumer to the producers whose output it needs uncached.
    needs_output_from: BTreeMap<CommandId, BTreeSet<CommandId>>,
}

impl RebuildPlanner {
    pub fn new(enable_cache: bool) -> Self {
        RebuildPlanner {
            enable_cache,
            ..Default::default()
        }
    }

    /// Commands that directly observed a change.
    pub fn changed(&self) -> &BTreeSet<CommandId> {
        &self.changed
    }

    /// Commands whose output must be regenerated.
    pub fn output_needed(&self) -> &BTreeSet<CommandId> {
        &self.output_needed
    }

    /// Close the observations into a plan.
    ///
    /// Marking propagates: a marked command drags in its children (their
    /// recorded launches die with the parent's rerun), the producers of its
    /// uncached inputs, and the consumers of its outputs.
    pub fn plan_build(&self) -> RebuildPlan {
        let mut plan = RebuildPlan::new();
        let mut work: Vec<(CommandId, Reason)> = Vec::new();

        for &c in &self.changed {
            work.push((c, Reason::Changed));
        }
        for &c in &self.output_needed {
            work.push((c, Reason::OutputNeeded));
        }

        let mut tool_expanded = false;
        while let Some((c, reason)) = work.pop() {
            // The build tool pseudo-command cannot rerun; anything that would
            // mark it marks its children instead
            if c == CommandId::BUILD_TOOL {
                if !tool_expanded {
                    tool_expanded = true;
                    if let Some(children) = self.children.get(&c) {
                        for &child in children {
                            work.push((child, Reason::Child));
                        }
                    }
                }
                continue;
            }
            if !plan.mark(c, reason) {
                continue;
            }
            debug!(command = %c, %reason, "marked for rerun");

            if let Some(children) = self.children.get(&c) {
                for &child in children {
                    work.push((child, Reason::Child));
                }
            }
            if let Some(producers) = self.needs_output_from.get(&c) {
                for &p in producers {
                    work.push((p, Reason::OutputNeeded));
                }
            }
            if let Some(consumers) = self.output_used_by.get(&c) {
                for &d in consumers {
                    work.push((d, Reason::InputMayChange));
                }
            }
        }

        plan
    }
}

impl BuildObserver for RebuildPlanner {
    fn input(
        &mut self,
        cmd: CommandId,
        _artifact: ArtifactId,
        creator: Option<CommandId>,
        can_commit: bool,
        kind: InputType,
    ) {
        let Some(creator) = creator else {
            // Versions scanned from the initial filesystem have no producer
            return;
        };
        if creator == cmd {
            return;
        }

        // If the producer reruns, this consumer may see different input.
        // Bare existence checks do not create that sensitivity.
        if kind != InputType::Exists {
            self.output_used_by.entry(creator).or_default().insert(cmd);
        }

        // If the input cannot be staged from the cache, rerunning the
        // consumer requires rerunning the producer too
        if !(self.enable_cache && can_commit) {
            self.needs_output_from.entry(cmd).or_default().insert(creator);
        }
    }

    fn mismatch(&mut self, cmd: CommandId, artifact: ArtifactId) {
        debug!(command = %cmd, artifact = %artifact, "changed: version mismatch");
        self.changed.insert(cmd);
    }

    fn command_change(&mut self, cmd: CommandId) {
        debug!(command = %cmd, "changed: reference no longer usable");
        self.changed.insert(cmd);
    }

    fn never_run(&mut self, cmd: CommandId) {
        debug!(command = %cmd, "changed: never run");
        self.changed.insert(cmd);
    }

    fn resolution_change(&mut self, cmd: CommandId, expected: i32, observed: i32) {
        debug!(
            command = %cmd,
            expected = %retrace_ir::errno_name(expected),
            observed = %retrace_ir::errno_name(observed),
            "changed: resolution differs"
        );
        self.changed.insert(cmd);
    }

    fn exit_code_change(&mut self, parent: CommandId, child: CommandId, expected: i32, observed: i32) {
        debug!(
            parent = %parent,
            child = %child,
            expected,
            observed,
            "changed: child exit status differs"
        );
        // The parent is what saw the changed status. The build tool cannot
        // rerun, so a status change it observed falls to the child.
        if parent == CommandId::BUILD_TOOL {
            self.changed.insert(child);
        } else {
            self.changed.insert(parent);
        }
    }

    fn final_mismatch(&mut self, artifact: ArtifactId, creator: Option<CommandId>, can_commit: bool) {
        // Untracked state is not ours to fix
        let Some(creator) = creator else {
            return;
        };
        // A cached version can simply be staged back in
        if self.enable_cache && can_commit {
            return;
        }
        debug!(artifact = %artifact, command = %creator, "output needed: on-disk state diverged");
        self.output_needed.insert(creator);
    }

    fn launch(&mut self, parent: CommandId, child: CommandId) {
        self.children.entry(parent).or_default().insert(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(n: u32) -> CommandId {
        CommandId(n)
    }

    fn a(n: u32) -> ArtifactId {
        ArtifactId(n)
    }

    #[test]
    fn test_no_observations_empty_plan() {
        let planner = RebuildPlanner::new(true);
        assert!(planner.plan_build().is_empty());
    }

    #[test]
    fn test_changed_marks_children_transitively() {
        let mut planner = RebuildPlanner::new(true);
        planner.launch(c(1), c(2));
        planner.launch(c(2), c(3));
        planner.mismatch(c(1), a(0));

        let plan = planner.plan_build();
        assert_eq!(plan.reason(c(1)), Some(Reason::Changed));
        assert_eq!(plan.reason(c(2)), Some(Reason::Child));
        assert_eq!(plan.reason(c(3)), Some(Reason::Child));
    }

    #[test]
    fn test_consumers_of_changed_output_are_marked() {
        let mut planner = RebuildPlanner::new(true);
        // c2 reads a version created by c1 (cached)
        planner.input(c(2), a(0), Some(c(1)), true, InputType::Accessed);
        planner.mismatch(c(1), a(1));

        let plan = planner.plan_build();
        assert_eq!(plan.reason(c(1)), Some(Reason::Changed));
        assert_eq!(plan.reason(c(2)), Some(Reason::InputMayChange));
    }

    #[test]
    fn test_uncached_input_drags_producer_in() {
        let mut planner = RebuildPlanner::new(true);
        // c2 reads an uncommittable version created by c1
        planner.input(c(2), a(0), Some(c(1)), false, InputType::Accessed);
        // c2 itself changed
        planner.mismatch(c(2), a(1));

        let plan = planner.plan_build();
        assert_eq!(plan.reason(c(2)), Some(Reason::Changed));
        assert_eq!(plan.reason(c(1)), Some(Reason::OutputNeeded));
    }

    #[test]
    fn test_cached_input_does_not_drag_producer_in() {
        let mut planner = RebuildPlanner::new(true);
        // Same shape, but the input version is cached
        planner.input(c(2), a(0), Some(c(1)), true, InputType::Accessed);
        planner.mismatch(c(2), a(1));

        let plan = planner.plan_build();
        assert!(plan.must_run(c(2)));
        assert!(!plan.must_run(c(1)));
    }

    #[test]
    fn test_cache_disabled_always_drags_producer() {
        let mut planner = RebuildPlanner::new(false);
        planner.input(c(2), a(0), Some(c(1)), true, InputType::Accessed);
        planner.mismatch(c(2), a(1));

        let plan = planner.plan_build();
        assert!(plan.must_run(c(1)));
    }

    #[test]
    fn test_exists_input_is_not_a_rerun_edge() {
        let mut planner = RebuildPlanner::new(true);
        planner.input(c(2), a(0), Some(c(1)), true, InputType::Exists);
        planner.mismatch(c(1), a(1));

        let plan = planner.plan_build();
        assert!(plan.must_run(c(1)));
        assert!(!plan.must_run(c(2)));
    }

    #[test]
    fn test_exit_code_change_marks_parent() {
        let mut planner = RebuildPlanner::new(true);
        planner.exit_code_change(c(1), c(2), 0, 1);

        let plan = planner.plan_build();
        assert!(plan.must_run(c(1)));
        assert!(!plan.must_run(c(2)));
    }

    #[test]
    fn test_final_mismatch_cached_is_ignored() {
        let mut planner = RebuildPlanner::new(true);
        planner.final_mismatch(a(0), Some(c(1)), true);
        assert!(planner.plan_build().is_empty());

        // Uncached output must be regenerated
        planner.final_mismatch(a(0), Some(c(1)), false);
        let plan = planner.plan_build();
        assert_eq!(plan.reason(c(1)), Some(Reason::OutputNeeded));
    }

    #[test]
    fn test_final_mismatch_without_creator_is_ignored() {
        let mut planner = RebuildPlanner::new(true);
        planner.final_mismatch(a(0), None, false);
        assert!(planner.plan_build().is_empty());
    }

    #[test]
    fn test_never_run_marks_changed() {
        let mut planner = RebuildPlanner::new(true);
        planner.never_run(c(1));
        assert_eq!(planner.plan_build().reason(c(1)), Some(Reason::Changed));
    }

    #[test]
    fn test_diamond_propagation() {
        // c1 produces for c2 and c3; both feed c4 (all uncached)
        let mut planner = RebuildPlanner::new(true);
        planner.input(c(2), a(0), Some(c(1)), false, InputType::Accessed);
        planner.input(c(3), a(0), Some(c(1)), false, InputType::Accessed);
        planner.input(c(4), a(1), Some(c(2)), false, InputType::Accessed);
        planner.input(c(4), a(2), Some(c(3)), false, InputType::Accessed);
        planner.mismatch(c(1), a(3));

        let plan = planner.plan_build();
        for n in 1..=4 {
            assert!(plan.must_run(c(n)), "cmd{} should be marked", n);
        }
    }

    #[test]
    fn test_build_tool_is_never_planned() {
        let mut planner = RebuildPlanner::new(true);
        planner.launch(CommandId::BUILD_TOOL, c(1));
        // An exit-status change seen by the tool falls to the child
        planner.exit_code_change(CommandId::BUILD_TOOL, c(1), 0, 2);

        let plan = planner.plan_build();
        assert!(!plan.must_run(CommandId::BUILD_TOOL));
        assert!(plan.must_run(c(1)));
    }

    #[test]
    fn test_self_edges_are_ignored() {
        let mut planner = RebuildPlanner::new(true);
        planner.input(c(1), a(0), Some(c(1)), false, InputType::Accessed);
        planner.mismatch(c(1), a(0));

        let plan = planner.plan_build();
        assert_eq!(plan.len(), 1);
    }
}
