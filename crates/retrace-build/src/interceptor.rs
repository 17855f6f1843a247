//! The boundary to the syscall interceptor.
//!
//! The interceptor itself — ptrace/seccomp attachment, syscall decoding — is
//! an external collaborator. The engine only needs to start a command under
//! it and wait for the exit status; any IR the interceptor derives arrives
//! through the runner's `trace_*` call surface.

use std::path::PathBuf;
use std::process::{Child, Command as ProcessCommand};

use tracing::{debug, warn};

use retrace_ir::CommandSpec;

use crate::error::BuildError;
use crate::Result;

/// A command running under interception.
pub trait TracedProcess {
    /// Block until the process exits and return its status. A death by
    /// signal is reported as `128 + signo`, shell style.
    fn wait(&mut self) -> Result<i32>;
}

/// Launches commands for the execute pass.
pub trait Interceptor {
    fn start(&mut self, spec: &CommandSpec) -> Result<Box<dyn TracedProcess>>;
}

/// The default launcher: run commands under the helper binary named by
/// `RETRACE_INTERCEPTOR` when one is configured, otherwise exec them
/// directly. Direct execution still produces correct results — launch, exit
/// status, and final filesystem state are observed — it just records no
/// per-syscall steps, so the next build re-plans those commands from their
/// on-disk effects.
pub struct HelperInterceptor {
    helper: Option<PathBuf>,
}

impl HelperInterceptor {
    pub fn new(helper: Option<PathBuf>) -> Self {
        if helper.is_none() {
            debug!("no interceptor helper configured; commands run untraced");
        }
        HelperInterceptor { helper }
    }

    /// Strip the launch shim from a root command's argv.
    fn effective_args(spec: &CommandSpec) -> &[String] {
        match spec.args.first() {
            Some(first) if first == "retrace-launch" => &spec.args[1..],
            _ => &spec.args[..],
        }
    }
}

impl Interceptor for HelperInterceptor {
    fn start(&mut self, spec: &CommandSpec) -> Result<Box<dyn TracedProcess>> {
        let args = Self::effective_args(spec);
        let Some(exe) = args.first() else {
            return Err(BuildError::EmptyCommand);
        };

        let mut cmd = match &self.helper {
            Some(helper) => {
                let mut c = ProcessCommand::new(helper);
                c.args(args);
                c
            }
            None => {
                let mut c = ProcessCommand::new(exe);
                c.args(&args[1..]);
                c
            }
        };

        debug!(command = %spec.full_name(), "launching");
        let child = cmd.spawn().map_err(|source| BuildError::InterceptorFailure {
            command: spec.full_name(),
            source,
        })?;
        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

impl TracedProcess for ChildProcess {
    fn wait(&mut self) -> Result<i32> {
        let status = self.child.wait()?;
        if let Some(code) = status.code() {
            return Ok(code);
        }
        // Killed by a signal
        use std::os::unix::process::ExitStatusExt;
        let signal = status.signal().unwrap_or(0);
        warn!(signal, "command terminated by signal");
        Ok(128 + signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_execution_reports_exit_status() {
        let mut launcher = HelperInterceptor::new(None);
        let spec = CommandSpec::new(vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()]);
        let mut process = launcher.start(&spec).unwrap();
        assert_eq!(process.wait().unwrap(), 3);
    }

    #[test]
    fn test_launch_shim_prefix_is_stripped() {
        let spec = CommandSpec::new(vec![
            "retrace-launch".to_string(),
            "true".to_string(),
        ]);
        assert_eq!(HelperInterceptor::effective_args(&spec), &["true".to_string()]);

        let mut launcher = HelperInterceptor::new(None);
        let mut process = launcher.start(&spec).unwrap();
        assert_eq!(process.wait().unwrap(), 0);
    }

    #[test]
    fn test_missing_executable_is_interceptor_failure() {
        let mut launcher = HelperInterceptor::new(None);
        let spec = CommandSpec::new(vec!["/nonexistent/retrace-test-binary".to_string()]);
        match launcher.start(&spec) {
            Err(BuildError::InterceptorFailure { .. }) => {}
            other => panic!("expected launch failure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let mut launcher = HelperInterceptor::new(None);
        let spec = CommandSpec::new(vec!["retrace-launch".to_string()]);
        assert!(matches!(launcher.start(&spec), Err(BuildError::EmptyCommand)));
    }
}
