//! Request/response model and the local execution dispatcher.

mod admission;
mod local;

use serde::{Deserialize, Serialize};

use crate::store::FileInfo;

pub use admission::{AdmissionGuard, AdmissionPermit};
pub use local::LocalExecutor;

/// Per-request caps. Zero always means "no limit", both when enforcing and
/// when classifying the outcome.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU seconds (user + sys).
    pub cpu_time: f64,
    /// Wall clock seconds.
    pub wall_time: f64,
    /// Address space, KiB.
    pub memory: u64,
    /// Open file descriptors.
    pub nfiles: u64,
    /// Processes/threads.
    pub processes: u64,
    /// Largest file the program may create, KiB.
    pub fsize: u64,
    /// Lockable memory, KiB.
    pub mlock: u64,
    /// Stack size, KiB.
    pub stack: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Request {
    /// Name of the program to run, resolved inside the sandbox directory
    /// when a staged input carries the same name.
    pub executable: String,
    pub args: Vec<String>,
    pub input: Vec<FileInfo>,
    pub output: Vec<FileInfo>,
    pub resource_limit: ResourceLimits,
    /// Reserved; any non-zero value is rejected.
    pub fifo_size: u64,
    pub exclusive: bool,
    /// Leave the sandbox directory behind for debugging.
    pub keep_sandbox: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    #[default]
    Success,
    Nonzero,
    Signal,
    TimeLimit,
    MemoryLimit,
    MissingFiles,
}

/// Observed resource consumption, seconds and KiB.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Usage {
    pub cpu_time: f64,
    pub sys_time: f64,
    pub wall_time: f64,
    pub memory: u64,
}

/// Outcome of a run the sandbox completed.
///
/// Worker-level failures (busy, I/O, sandbox setup) never produce a
/// `Response`; they surface as [`crate::Error`].
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Response {
    pub resource_usage: Usage,
    pub status: ExecutionStatus,
    pub status_code: i32,
    pub signal: i32,
    pub error_message: String,
    pub output: Vec<FileInfo>,
}
