//! Error taxonomy for the engine.
//!
//! Syscall results are data and never appear here. What does: the trace log
//! being unusable (recovered by defaulting upstream), a version that cannot
//! be staged to disk, and interceptor launch failures. Invariant violations
//! panic at the point of detection instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("failed to launch {command}: {source}")]
    InterceptorFailure {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command has no executable to launch")]
    EmptyCommand,

    #[error(transparent)]
    Vfs(#[from] retrace_vfs::VfsError),

    #[error(transparent)]
    Trace(#[from] retrace_ir::TraceError),

    #[error(transparent)]
    Cas(#[from] retrace_cas::CasError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
