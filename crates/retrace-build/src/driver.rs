//! Top-level build orchestration: load the trace, plan, execute, persist.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use tracing::{debug, info};

use retrace_cas::CasStore;
use retrace_ir::{
    default_trace, read_trace_or_default, send_records, CommandId, IrRecord, TraceWriter,
};
use retrace_vfs::{Env, EnvOptions, NullObserver};

use crate::interceptor::HelperInterceptor;
use crate::plan::RebuildPlan;
use crate::planner::RebuildPlanner;
use crate::runner::{Build, RunOptions, RunStats};
use crate::Result;

/// Everything one invocation of the engine needs to know.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// State directory, conventionally `.retrace/`.
    pub state_dir: PathBuf,
    /// Arguments for the root command on a fresh build.
    pub user_args: Vec<String>,
    /// Ignore any saved trace and build from scratch.
    pub fresh: bool,
    /// Plan and print, but launch nothing and persist nothing.
    pub dry_run: bool,
    /// Print each command as it is launched.
    pub print_on_run: bool,
    /// Print full argv rather than the executable name.
    pub print_full: bool,
    /// Honor cached output versions when planning.
    pub enable_cache: bool,
    /// Collapse consecutive same-reference writes.
    pub combine_writes: bool,
    /// Skip input records for self-reads.
    pub ignore_self_reads: bool,
    /// Path to the syscall interceptor helper, if one is installed.
    pub interceptor_helper: Option<PathBuf>,
    /// Trace log location, when somewhere other than the state directory.
    pub trace_log: Option<PathBuf>,
}

impl BuildRequest {
    pub fn new(state_dir: PathBuf, user_args: Vec<String>) -> Self {
        BuildRequest {
            state_dir,
            user_args,
            fresh: false,
            dry_run: false,
            print_on_run: false,
            print_full: false,
            enable_cache: true,
            combine_writes: true,
            ignore_self_reads: true,
            interceptor_helper: None,
            trace_log: None,
        }
    }

    pub fn trace_path(&self) -> PathBuf {
        self.trace_log
            .clone()
            .unwrap_or_else(|| self.state_dir.join("trace.bin"))
    }

    fn cas_dir(&self) -> PathBuf {
        self.state_dir.join("cas")
    }

    fn temp_dir(&self) -> PathBuf {
        std::env::var_os("RETRACE_TMPDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.state_dir.join("tmp"))
    }

    fn make_env(&self) -> Result<Env> {
        let cas = CasStore::open(self.cas_dir())?;
        Ok(Env::new(
            cas,
            EnvOptions {
                combine_writes: self.combine_writes,
                ignore_self_reads: self.ignore_self_reads,
                enable_cache: self.enable_cache,
                temp_dir: self.temp_dir(),
                ..Default::default()
            },
        ))
    }

    fn load_records(&self) -> (Vec<IrRecord>, bool) {
        if self.fresh {
            debug!("full rebuild requested, ignoring any saved trace");
            return (default_trace(&self.user_args), true);
        }
        read_trace_or_default(&self.trace_path(), &self.user_args)
    }
}

/// What the build did, for the one-line summary and the plan printer.
#[derive(Debug)]
pub struct BuildSummary {
    pub plan: RebuildPlan,
    /// Full argv per command, for displaying the plan.
    pub command_names: BTreeMap<CommandId, String>,
    pub stats: RunStats,
    /// Whether this build started from the default trace.
    pub fresh: bool,
}

/// The commands that issued at least one record of their own. Anything the
/// stream merely launches without steps has never been traced.
fn commands_with_steps(records: &[IrRecord]) -> HashSet<CommandId> {
    records.iter().map(|r| r.cmd()).collect()
}

/// Emulate the saved trace and return the rebuild plan without executing it.
pub fn plan_build(req: &BuildRequest) -> Result<BuildSummary> {
    let (records, fresh) = req.load_records();
    let with_steps = commands_with_steps(&records);

    let env = req.make_env()?;
    let mut planner = RebuildPlanner::new(req.enable_cache);
    let mut build = Build::emulate(env, with_steps, &mut planner);
    send_records(records, &mut build);

    let command_names = build
        .commands()
        .iter()
        .map(|c| (c.id, c.full_name()))
        .collect();
    let (_, _, stats) = build.into_parts();
    let plan = planner.plan_build();

    info!(to_run = plan.len(), "rebuild planned");
    Ok(BuildSummary {
        plan,
        command_names,
        stats,
        fresh,
    })
}

/// The whole cycle: plan against the saved trace, rerun what changed while
/// emulating the rest, commit the final state, and write the next trace.
pub fn run_build(req: &BuildRequest) -> Result<BuildSummary> {
    let (records, fresh) = req.load_records();
    let with_steps = commands_with_steps(&records);

    // Planning pass
    let env = req.make_env()?;
    let mut planner = RebuildPlanner::new(req.enable_cache);
    let mut build = Build::emulate(env, with_steps.clone(), &mut planner);
    send_records(records.iter().cloned(), &mut build);
    let command_names: BTreeMap<CommandId, String> = build
        .commands()
        .iter()
        .map(|c| (c.id, c.full_name()))
        .collect();
    drop(build);
    let plan = planner.plan_build();
    debug!(to_run = plan.len(), commands = command_names.len(), "plan ready");

    // Execute pass against a fresh model
    let env = req.make_env()?;
    let mut writer = TraceWriter::create(req.trace_path());
    let mut interceptor = HelperInterceptor::new(req.interceptor_helper.clone());
    let mut observer = NullObserver;
    let mut build = Build::execute(
        env,
        plan.clone(),
        with_steps,
        &mut observer,
        &mut writer,
        &mut interceptor,
        RunOptions {
            dry_run: req.dry_run,
            print_on_run: req.print_on_run,
            print_full: req.print_full,
        },
    );
    send_records(records, &mut build);
    if let Some(e) = build.take_error() {
        return Err(e);
    }
    let (mut env, _cmds, stats) = build.into_parts();

    if !req.dry_run {
        env.apply_final_state()?;
        env.cache_all();
        writer.flush_to_disk()?;
    }

    Ok(BuildSummary {
        plan,
        command_names,
        stats,
        fresh,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn request(temp: &TempDir, args: &[&str]) -> BuildRequest {
        BuildRequest::new(
            temp.path().join(".retrace"),
            args.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_fresh_build_runs_root_command() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out.txt");
        let script = format!("echo made > {}", out.display());
        let req = request(&temp, &["sh", "-c", &script]);

        let summary = run_build(&req).unwrap();
        assert!(summary.fresh);
        assert!(summary.plan.must_run(CommandId::ROOT));
        assert!(out.exists());
        assert!(req.trace_path().exists());
    }

    #[test]
    fn test_untraced_command_is_replanned_conservatively() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out.txt");
        let script = format!("echo made > {}", out.display());
        let req = request(&temp, &["sh", "-c", &script]);

        run_build(&req).unwrap();
        fs::remove_file(&out).unwrap();

        // With no interceptor helper the first run recorded no steps for the
        // root command, so the second build must rerun it rather than trust
        // an empty history
        let summary = run_build(&req).unwrap();
        assert!(!summary.fresh);
        assert!(summary.plan.must_run(CommandId::ROOT));
        assert!(out.exists());
    }

    #[test]
    fn test_dry_run_launches_and_persists_nothing() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out.txt");
        let script = format!("echo made > {}", out.display());
        let mut req = request(&temp, &["sh", "-c", &script]);
        req.dry_run = true;

        let summary = run_build(&req).unwrap();
        assert!(summary.plan.must_run(CommandId::ROOT));
        assert!(!out.exists());
        assert!(!req.trace_path().exists());
    }

    #[test]
    fn test_plan_build_does_not_execute() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out.txt");
        let script = format!("echo made > {}", out.display());
        let req = request(&temp, &["sh", "-c", &script]);

        let summary = plan_build(&req).unwrap();
        assert!(summary.plan.must_run(CommandId::ROOT));
        assert!(!out.exists());
    }

    #[test]
    fn test_failed_launch_is_fatal() {
        let temp = TempDir::new().unwrap();
        let req = request(&temp, &["/nonexistent/retrace-test-binary"]);
        assert!(run_build(&req).is_err());
    }

    #[test]
    fn test_fresh_flag_ignores_saved_trace() {
        let temp = TempDir::new().unwrap();
        let req = request(&temp, &["true"]);
        run_build(&req).unwrap();

        let mut again = req.clone();
        again.fresh = true;
        let summary = run_build(&again).unwrap();
        assert!(summary.fresh);
    }
}
