//! # retrace-build
//!
//! The build engine: replay a recorded trace against the filesystem model,
//! plan which commands must rerun, then execute the plan while producing the
//! next trace.
//!
//! A build makes two passes over the saved trace. The first pass emulates
//! every record with a [`RebuildPlanner`] observing; each deviation — a
//! predicate that no longer holds, a reference resolving differently, a
//! command with no recorded run — feeds the planner, which closes the
//! dependency graph into a [`RebuildPlan`]. The second pass replays the same
//! records into a fresh environment: planned commands are launched under the
//! syscall interceptor while everything else is emulated, and the combined
//! stream becomes the new trace log.

mod command;
mod driver;
mod error;
mod interceptor;
mod plan;
mod planner;
mod runner;

pub use command::{Command, CommandState, CommandTable, RefResult};
pub use driver::{plan_build, run_build, BuildRequest, BuildSummary};
pub use error::BuildError;
pub use interceptor::{HelperInterceptor, Interceptor, TracedProcess};
pub use plan::{Reason, RebuildPlan};
pub use planner::RebuildPlanner;
pub use runner::{Build, BuildMode, RunOptions, RunStats};

pub type Result<T> = std::result::Result<T, BuildError>;
