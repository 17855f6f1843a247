//! # retrace-config
//!
//! Configuration for retrace, loaded from:
//! 1. `~/.retrace/config.toml` (global)
//! 2. `<project>/.retrace/config.toml` (project-local, overrides global)
//! 3. `RETRACE_*` environment variables (highest priority)

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Current config schema version
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Config schema version (for forward compatibility)
    pub config_version: u32,
    pub build: BuildConfig,
    pub storage: StorageConfig,
    pub interceptor: InterceptorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            build: BuildConfig::default(),
            storage: StorageConfig::default(),
            interceptor: InterceptorConfig::default(),
        }
    }
}

/// Engine behavior knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Save output copies so cached versions can be staged without reruns
    pub enable_cache: bool,
    /// Collapse consecutive same-reference writes into one version
    pub combine_writes: bool,
    /// Skip dependency records when a command reads its own latest write
    pub ignore_self_reads: bool,
    /// Print each command as it is launched
    pub print_on_run: bool,
    /// Print full argv instead of the executable name
    pub print_full: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            enable_cache: true,
            combine_writes: true,
            ignore_self_reads: true,
            print_on_run: false,
            print_full: false,
        }
    }
}

/// Where build state lives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// State directory, relative to the project root
    pub state_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".retrace"),
        }
    }
}

/// Syscall interceptor wiring
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptorConfig {
    /// Path to the interceptor helper binary. Unset means commands run
    /// untraced and are conservatively replanned every build.
    pub helper: Option<PathBuf>,
}

impl Config {
    /// Load config from the standard locations for the current directory.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_for_project(Path::new("."))
    }

    /// Load config for a specific project root.
    /// Resolution order: global, then project, then env vars.
    pub fn load_for_project(project_root: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        let project_config_path = project_root.join(".retrace/config.toml");
        if project_config_path.exists() {
            debug!("loading project config from {:?}", project_config_path);
            let contents = std::fs::read_to_string(&project_config_path)?;
            let project_config: Config = toml::from_str(&contents)?;
            config.merge(project_config);
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Global config path: `~/.retrace/config.toml`
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".retrace/config.toml"))
    }

    /// Merge another config (project overrides global).
    /// Non-default values from `other` replace values in `self`.
    fn merge(&mut self, other: Config) {
        let default_build = BuildConfig::default();
        if other.build != default_build {
            self.build = other.build;
        }

        let default_storage = StorageConfig::default();
        if other.storage.state_dir != default_storage.state_dir {
            self.storage.state_dir = other.storage.state_dir;
        }

        if other.interceptor.helper.is_some() {
            self.interceptor.helper = other.interceptor.helper;
        }
    }

    /// Apply environment variable overrides (highest priority)
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("RETRACE_INTERCEPTOR") {
            self.interceptor.helper = Some(PathBuf::from(path));
        }
        if let Ok(dir) = std::env::var("RETRACE_STATE_DIR") {
            self.storage.state_dir = PathBuf::from(dir);
        }
        if std::env::var("RETRACE_NO_CACHE").is_ok() {
            self.build.enable_cache = false;
        }
        if std::env::var("RETRACE_SHOW").is_ok() {
            self.build.print_on_run = true;
        }
    }

    /// Generate the TOML template for `retrace init`.
    pub fn init_toml() -> String {
        let default = Config::default();
        format!(
            r#"# retrace project configuration
config_version = 1

[build]
# enable_cache = true
# combine_writes = true
# ignore_self_reads = true
# print_on_run = false

[storage]
state_dir = "{state_dir}"

[interceptor]
# helper = "/usr/libexec/retrace-trace"
"#,
            state_dir = default.storage.state_dir.display(),
        )
    }
}
