//! # retrace CLI
//!
//! Command-line interface for the retrace incremental build engine.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use retrace_build::{plan_build, run_build, BuildRequest, BuildSummary};
use retrace_config::Config;

mod dump;

/// retrace - incremental builds from syscall traces
#[derive(Parser)]
#[command(name = "retrace")]
#[command(version, about, long_about = None)]
struct Cli {
    /// State directory (overrides configuration)
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the build, rerunning only what changed
    Build {
        /// Ignore the saved trace and rebuild everything
        #[arg(long)]
        fresh: bool,

        /// Plan and print, but do not run or change anything
        #[arg(long)]
        dry_run: bool,

        /// Print each command as it is launched
        #[arg(long)]
        show: bool,

        /// Print full argv instead of executable names
        #[arg(long)]
        show_full: bool,

        /// Do not stage outputs from the cache
        #[arg(long)]
        no_cache: bool,

        /// Print the rebuild plan before executing it
        #[arg(long)]
        print_plan: bool,

        /// Trace log location (defaults to <state-dir>/trace.bin)
        #[arg(long, value_name = "FILE")]
        trace_log: Option<PathBuf>,

        /// The root command and its arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Show what a build would rerun, without running anything
    Plan {
        /// The root command for a first build
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Dump the saved trace in readable form
    Log,

    /// Write a project configuration template
    Init,
}

/// Process-wide setup: piped output dies quietly instead of panicking, and
/// diagnostics go to stderr, filtered by `RETRACE_LOG` (then `RUST_LOG`,
/// then warnings only).
fn init_process() {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let directives = std::env::var("RETRACE_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(directives))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_process();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;

    let state_dir = cli
        .state_dir
        .unwrap_or_else(|| config.storage.state_dir.clone());
    debug!(state_dir = %state_dir.display(), "using state directory");

    match cli.command {
        Commands::Build {
            fresh,
            dry_run,
            show,
            show_full,
            no_cache,
            print_plan,
            trace_log,
            command,
        } => {
            let mut req = BuildRequest::new(state_dir, command);
            req.trace_log = trace_log;
            req.fresh = fresh;
            req.dry_run = dry_run;
            req.print_on_run = show || show_full || config.build.print_on_run;
            req.print_full = show_full || config.build.print_full;
            req.enable_cache = config.build.enable_cache && !no_cache;
            req.combine_writes = config.build.combine_writes;
            req.ignore_self_reads = config.build.ignore_self_reads;
            req.interceptor_helper = config.interceptor.helper.clone();

            let summary = run_build(&req).context("build failed")?;
            if print_plan {
                print_rebuild_plan(&summary);
            }
            println!(
                "{} commands traced, {} emulated",
                summary.stats.traced_commands, summary.stats.emulated_commands
            );
        }

        Commands::Plan { command } => {
            let mut req = BuildRequest::new(state_dir, command);
            req.enable_cache = config.build.enable_cache;
            let summary = plan_build(&req).context("planning failed")?;
            print_rebuild_plan(&summary);
        }

        Commands::Log => {
            let trace_path = state_dir.join("trace.bin");
            let records = retrace_ir::read_trace(&trace_path)
                .with_context(|| format!("no usable trace at {}", trace_path.display()))?;
            for record in &records {
                println!("{}", dump::render(record));
            }
        }

        Commands::Init => {
            let dir = PathBuf::from(".retrace");
            std::fs::create_dir_all(&dir)?;
            let path = dir.join("config.toml");
            if path.exists() {
                anyhow::bail!("{} already exists", path.display());
            }
            std::fs::write(&path, Config::init_toml())?;
            println!("wrote {}", path.display());
        }
    }

    Ok(())
}

fn print_rebuild_plan(summary: &BuildSummary) {
    if summary.plan.is_empty() {
        println!("nothing to rerun");
        return;
    }
    for (cmd, reason) in summary.plan.iter() {
        let name = summary
            .command_names
            .get(&cmd)
            .map(String::as_str)
            .unwrap_or("<unknown>");
        println!("{}: {} ({})", cmd, name, reason);
    }
}
