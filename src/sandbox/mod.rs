//! Contract between the dispatcher and the isolation backend.
//!
//! The dispatcher only ever talks to [`Sandbox`]; what actually confines the
//! child (namespaces, cgroups, plain rlimits) is the implementation's
//! business.

#[cfg(unix)]
mod unix;

use std::{path::{Path, PathBuf}, sync::Arc};

use crate::Result;

#[cfg(unix)]
pub use unix::UnixSandbox;

/// Everything the backend needs to run one program.
#[derive(Clone, Debug, Default)]
pub struct ExecutionOptions {
    /// Directory the program runs in.
    pub root: PathBuf,
    pub executable: String,
    pub args: Vec<String>,
    pub stdin_file: Option<PathBuf>,
    pub stdout_file: Option<PathBuf>,
    pub stderr_file: Option<PathBuf>,
    /// All limits are pre-scaled by the dispatcher; zero disables the cap.
    pub cpu_limit_ms: u64,
    pub wall_limit_ms: u64,
    pub memory_limit_kb: u64,
    pub max_files: u64,
    pub max_procs: u64,
    pub max_file_size_kb: u64,
    pub max_mlock_kb: u64,
    pub max_stack_kb: u64,
}

impl ExecutionOptions {
    pub fn new(root: impl Into<PathBuf>, executable: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            executable: executable.into(),
            ..Default::default()
        }
    }
}

/// What happened to the child, as observed by the backend.
#[derive(Clone, Debug, Default)]
pub struct ExecutionInfo {
    pub cpu_time_ms: u64,
    pub sys_time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_usage_kb: u64,
    pub status_code: i32,
    pub signal: i32,
    pub message: String,
}

/// Isolation backend.
///
/// `execute` returning `Ok` means the program ran and `ExecutionInfo`
/// describes how it ended, even if it ended badly; `Err` means the backend
/// itself could not run it.
#[async_trait::async_trait]
pub trait Sandbox: Send + Sync {
    /// Hand the staged file over to the backend as the run's one executable.
    async fn prepare_for_execution(&self, executable: &Path) -> Result<()>;

    async fn execute(&self, options: &ExecutionOptions) -> Result<ExecutionInfo>;
}

/// Best backend available on this platform.
pub fn create() -> Arc<dyn Sandbox> {
    #[cfg(unix)]
    {
        Arc::new(UnixSandbox::new())
    }
    #[cfg(not(unix))]
    {
        unimplemented!("no sandbox backend for this platform")
    }
}
