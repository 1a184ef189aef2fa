//! Plain-rlimit backend.
//!
//! Confinement is per-process: setsid + rlimits at exec time, a supervisor
//! thread enforcing the wall clock and sampling resident memory, SIGKILL
//! when a cap is breached. No namespace or cgroup isolation; that belongs
//! to stronger backends behind the same trait.

use std::{
    path::Path,
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use nix::sys::resource::{setrlimit, Resource};

use super::{ExecutionInfo, ExecutionOptions, Sandbox};
use crate::{error::Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Default)]
pub struct UnixSandbox;

impl UnixSandbox {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Sandbox for UnixSandbox {
    async fn prepare_for_execution(&self, executable: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(executable, std::fs::Permissions::from_mode(0o500))
            .await
            .map_err(|err| Error::Sandbox(format!("chmod {executable:?}: {err}")))
    }

    async fn execute(&self, options: &ExecutionOptions) -> Result<ExecutionInfo> {
        let options = options.clone();
        tokio::task::spawn_blocking(move || run(&options))
            .await
            .map_err(|err| Error::Sandbox(format!("supervisor died: {err}")))?
    }
}

/// Caps applied between fork and exec. Plain numbers only: the closure runs
/// in the forked child where allocation is off-limits.
#[derive(Clone, Copy)]
struct Rlimits {
    memory_kb: u64,
    cpu_ms: u64,
    fsize_kb: u64,
    mlock_kb: u64,
    nfiles: u64,
    nprocs: u64,
    stack_kb: u64,
}

impl Rlimits {
    fn from_options(options: &ExecutionOptions) -> Self {
        Self {
            memory_kb: options.memory_limit_kb,
            cpu_ms: options.cpu_limit_ms,
            fsize_kb: options.max_file_size_kb,
            mlock_kb: options.max_mlock_kb,
            nfiles: options.max_files,
            nprocs: options.max_procs,
            stack_kb: options.max_stack_kb,
        }
    }

    fn apply(&self) -> std::io::Result<()> {
        set(Resource::RLIMIT_AS, self.memory_kb.saturating_mul(1024))?;
        set(Resource::RLIMIT_CPU, self.cpu_ms / 1000)?;
        set(Resource::RLIMIT_FSIZE, self.fsize_kb.saturating_mul(1024))?;
        set(Resource::RLIMIT_MEMLOCK, self.mlock_kb.saturating_mul(1024))?;
        set(Resource::RLIMIT_NOFILE, self.nfiles)?;
        set(Resource::RLIMIT_NPROC, self.nprocs)?;
        match self.stack_kb {
            0 => setrlimit(Resource::RLIMIT_STACK, libc::RLIM_INFINITY, libc::RLIM_INFINITY)
                .map_err(nix_to_io)?,
            kb => set(Resource::RLIMIT_STACK, kb.saturating_mul(1024))?,
        }
        Ok(())
    }
}

fn set(resource: Resource, value: u64) -> std::io::Result<()> {
    if value == 0 {
        return Ok(());
    }
    setrlimit(resource, value, value).map_err(nix_to_io)
}

fn nix_to_io(err: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(err as i32)
}

fn run(options: &ExecutionOptions) -> Result<ExecutionInfo> {
    use std::os::unix::{fs::OpenOptionsExt, process::CommandExt};

    // execv semantics: a bare name runs from the sandbox dir, not from PATH
    let exe = if options.executable.contains('/') {
        options.executable.clone()
    } else {
        format!("./{}", options.executable)
    };

    let stdin = match &options.stdin_file {
        Some(path) => Stdio::from(
            std::fs::File::open(path)
                .map_err(|err| Error::Sandbox(format!("open {path:?}: {err}")))?,
        ),
        None => Stdio::null(),
    };
    let open_out = |path: &std::path::PathBuf| {
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(|err| Error::Sandbox(format!("create {path:?}: {err}")))
    };
    let stdout = match &options.stdout_file {
        Some(path) => Stdio::from(open_out(path)?),
        None => Stdio::null(),
    };
    let stderr = match &options.stderr_file {
        Some(path) => Stdio::from(open_out(path)?),
        None => Stdio::null(),
    };

    let mut command = Command::new(&exe);
    command
        .args(&options.args)
        .current_dir(&options.root)
        .stdin(stdin)
        .stdout(stdout)
        .stderr(stderr);

    let limits = Rlimits::from_options(options);
    unsafe {
        command.pre_exec(move || {
            // own process group, so terminal signals never reach the child
            nix::unistd::setsid().map_err(nix_to_io)?;
            limits.apply()
        });
    }

    let start = Instant::now();
    let child = command
        .spawn()
        .map_err(|err| Error::Sandbox(format!("cannot execute {exe:?}: {err}")))?;
    let pid = child.id() as libc::pid_t;

    let mut status: libc::c_int = 0;
    let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
    let mut peak_kb: u64 = 0;
    let mut exited = false;
    loop {
        if let Some(kb) = resident_kb(pid) {
            peak_kb = peak_kb.max(kb);
        }
        match unsafe { libc::wait4(pid, &mut status, libc::WNOHANG, &mut rusage) } {
            -1 => {
                return Err(Error::Sandbox(format!(
                    "wait4: {}",
                    std::io::Error::last_os_error()
                )))
            }
            0 => {}
            _ => {
                exited = true;
                break;
            }
        }
        let elapsed = start.elapsed().as_millis() as u64;
        if options.wall_limit_ms != 0 && elapsed >= options.wall_limit_ms {
            break;
        }
        if options.memory_limit_kb != 0 && peak_kb > options.memory_limit_kb {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    if !exited {
        unsafe { libc::kill(pid, libc::SIGKILL) };
        if unsafe { libc::wait4(pid, &mut status, 0, &mut rusage) } != pid {
            return Err(Error::Sandbox(format!(
                "wait4: {}",
                std::io::Error::last_os_error()
            )));
        }
    }

    let status_code = if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else {
        0
    };
    let signal = if libc::WIFSIGNALED(status) {
        libc::WTERMSIG(status)
    } else {
        0
    };
    let message = if signal != 0 {
        format!("killed by signal {signal}")
    } else if status_code != 0 {
        format!("exited with code {status_code}")
    } else {
        String::new()
    };

    Ok(ExecutionInfo {
        cpu_time_ms: timeval_ms(rusage.ru_utime),
        sys_time_ms: timeval_ms(rusage.ru_stime),
        wall_time_ms: start.elapsed().as_millis() as u64,
        memory_usage_kb: peak_kb.max(maxrss_kb(rusage.ru_maxrss)),
        status_code,
        signal,
        message,
    })
}

fn timeval_ms(tv: libc::timeval) -> u64 {
    (tv.tv_sec as u64).saturating_mul(1000) + (tv.tv_usec as u64) / 1000
}

#[cfg(target_os = "macos")]
fn maxrss_kb(maxrss: libc::c_long) -> u64 {
    maxrss as u64 / 1024
}

#[cfg(not(target_os = "macos"))]
fn maxrss_kb(maxrss: libc::c_long) -> u64 {
    maxrss as u64
}

/// Resident set of `pid` in KiB, sampled from procfs.
#[cfg(target_os = "linux")]
fn resident_kb(pid: libc::pid_t) -> Option<u64> {
    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_kb = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64 / 1024;
    Some(pages * page_kb)
}

#[cfg(not(target_os = "linux"))]
fn resident_kb(_pid: libc::pid_t) -> Option<u64> {
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::filesystem::TempDir;
    use std::os::unix::fs::PermissionsExt;

    async fn stage(body: &str) -> (TempDir, ExecutionOptions) {
        let tmp = TempDir::new(std::env::temp_dir()).await.unwrap();
        let root = tmp.path().join("box");
        tokio::fs::create_dir(&root).await.unwrap();
        let bin = root.join("bin");
        tokio::fs::write(&bin, body).await.unwrap();
        tokio::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o700))
            .await
            .unwrap();
        let mut options = ExecutionOptions::new(&root, "bin");
        options.stdout_file = Some(tmp.path().join("stdout"));
        options.stderr_file = Some(tmp.path().join("stderr"));
        (tmp, options)
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let (tmp, options) = stage("#!/bin/sh\necho out\necho err >&2\nexit 5\n").await;
        let info = UnixSandbox::new().execute(&options).await.unwrap();

        assert_eq!(info.status_code, 5);
        assert_eq!(info.signal, 0);
        assert_eq!(info.message, "exited with code 5");
        let stdout = tokio::fs::read(tmp.path().join("stdout")).await.unwrap();
        let stderr = tokio::fs::read(tmp.path().join("stderr")).await.unwrap();
        assert_eq!(stdout, b"out\n");
        assert_eq!(stderr, b"err\n");
    }

    #[tokio::test]
    async fn reports_fatal_signal() {
        let (_tmp, options) = stage("#!/bin/sh\nkill -SEGV $$\n").await;
        let info = UnixSandbox::new().execute(&options).await.unwrap();
        assert_eq!(info.signal, libc::SIGSEGV);
        assert_eq!(info.status_code, 0);
    }

    #[tokio::test]
    async fn wall_limit_kills_the_child() {
        let (_tmp, mut options) = stage("#!/bin/sh\nsleep 30\n").await;
        options.wall_limit_ms = 500;

        let started = std::time::Instant::now();
        let info = UnixSandbox::new().execute(&options).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(info.wall_time_ms >= 500);
        assert_eq!(info.signal, libc::SIGKILL);
    }

    #[tokio::test]
    async fn missing_executable_is_a_sandbox_failure() {
        let tmp = TempDir::new(std::env::temp_dir()).await.unwrap();
        let root = tmp.path().join("box");
        tokio::fs::create_dir(&root).await.unwrap();
        let options = ExecutionOptions::new(&root, "nope");

        assert!(matches!(
            UnixSandbox::new().execute(&options).await,
            Err(Error::Sandbox(_))
        ));
    }
}
