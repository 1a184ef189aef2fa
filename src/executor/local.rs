use std::{path::{Path, PathBuf}, sync::Arc};

use tracing::instrument;

use crate::{
    error::Error,
    filesystem::{self, ChunkReader, TempDir, CHUNK_SIZE},
    sandbox::{self, ExecutionInfo, ExecutionOptions, Sandbox},
    store::{Digest, Fetcher, FileInfo, FileKind, Store},
    Result,
};

use super::{AdmissionGuard, ExecutionStatus, Request, ResourceLimits, Response, Usage};

/// Name of the per-request directory the program runs in.
const BOX_DIR: &str = "box";

/// Margin applied to the cpu/wall/memory caps handed to the sandbox, so that
/// scheduling noise does not kill runs sitting right at their declared
/// limit. Outcome classification always uses the declared limits.
const LIMIT_MARGIN: f64 = 1.2;

/// Executes requests on this machine.
///
/// Stages hash-addressed inputs into a private sandbox directory, runs the
/// program under the configured [`Sandbox`], and ingests the outputs back
/// into the store.
pub struct LocalExecutor {
    store: Store,
    temp_root: PathBuf,
    admission: AdmissionGuard,
    sandbox: Arc<dyn Sandbox>,
}

impl LocalExecutor {
    pub async fn new(
        store_root: impl Into<PathBuf>,
        temp_root: impl Into<PathBuf>,
        num_cores: usize,
    ) -> Result<Self> {
        let temp_root = temp_root.into();
        filesystem::make_dirs(&temp_root).await?;
        Ok(Self {
            store: Store::open(store_root).await?,
            temp_root,
            admission: AdmissionGuard::new(num_cores),
            sandbox: sandbox::create(),
        })
    }

    /// Build from the loaded [`crate::init::config::CONFIG`].
    pub async fn from_config() -> Result<Self> {
        let config = crate::init::config::CONFIG.get().unwrap();
        Self::new(config.store.clone(), config.temp.clone(), config.num_cores).await
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Stream a blob out of the store, for callers forwarding it elsewhere.
    pub async fn read_file(&self, hash: &Digest) -> Result<ChunkReader> {
        self.store.read(hash).await
    }

    /// Run one request to completion.
    ///
    /// A `Response` always means the sandbox ran; anything that prevented
    /// that (bad request, I/O, busy worker, sandbox setup) is an `Err`.
    #[instrument(skip_all, fields(executable = %request.executable))]
    pub async fn execute(&self, request: &Request, fetcher: &dyn Fetcher) -> Result<Response> {
        if request.fifo_size != 0 {
            return Err(Error::NotImplemented("fifo channels"));
        }
        for info in request.input.iter().chain(request.output.iter()) {
            if !matches!(info.kind, FileKind::Stdin | FileKind::Stdout | FileKind::Stderr) {
                validate_name(&info.name)?;
            }
        }

        for input in &request.input {
            self.store.maybe_fetch(input, fetcher).await?;
        }

        let mut tmp = TempDir::new(&self.temp_root).await?;
        let cmdline = render_command(request);
        if request.keep_sandbox {
            tmp.keep();
            let path = tmp.path().join("command.txt");
            tokio::fs::write(&path, format!("{cmdline}\n"))
                .await
                .map_err(Error::io("write", path))?;
        }
        log::debug!("executing `{}` inside {:?}", cmdline, tmp.path());

        let sandbox_dir = tmp.path().join(BOX_DIR);
        filesystem::make_dirs(&sandbox_dir).await?;

        let mut options = ExecutionOptions::new(&sandbox_dir, &request.executable);
        options.args = request.args.clone();
        scale_limits(&request.resource_limit, &mut options);

        // Stage the inputs. The main executable is left out of the
        // make_immutable pass: prepare_for_execution owns its permissions,
        // and chmod'ing it twice races through the shared hardlink.
        let mut staged = Vec::new();
        let mut loaded_executable = false;
        for input in &request.input {
            let target = self.stage_input(input, tmp.path(), &mut options).await?;
            if input.kind == FileKind::User && input.name == request.executable {
                loaded_executable = true;
            } else {
                staged.push(target);
            }
        }
        for path in &staged {
            filesystem::make_immutable(path).await?;
        }

        options.stdout_file = Some(tmp.path().join("stdout"));
        options.stderr_file = Some(tmp.path().join("stderr"));

        if loaded_executable {
            self.sandbox
                .prepare_for_execution(&sandbox_dir.join(&request.executable))
                .await?;
        }

        let info = {
            let _permit = self.admission.admit(request.exclusive)?;
            self.sandbox.execute(&options).await?
        };

        let usage = Usage {
            cpu_time: info.cpu_time_ms as f64 / 1000.0,
            sys_time: info.sys_time_ms as f64 / 1000.0,
            wall_time: info.wall_time_ms as f64 / 1000.0,
            memory: info.memory_usage_kb,
        };
        let (status, error_message) = classify(&request.resource_limit, &usage, &info);
        let mut response = Response {
            resource_usage: usage,
            status,
            status_code: info.status_code,
            signal: info.signal,
            error_message,
            output: Vec::new(),
        };

        self.retrieve_file(&FileInfo::stdio(FileKind::Stdout), tmp.path(), &mut response)
            .await?;
        self.retrieve_file(&FileInfo::stdio(FileKind::Stderr), tmp.path(), &mut response)
            .await?;
        for output in &request.output {
            match self.retrieve_file(output, tmp.path(), &mut response).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    if response.status == ExecutionStatus::Success {
                        response.status = ExecutionStatus::MissingFiles;
                        response.error_message = "Missing output files".into();
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(response)
    }

    /// Copy one input blob from the store to its place in the workspace.
    async fn stage_input(
        &self,
        info: &FileInfo,
        tmp: &Path,
        options: &mut ExecutionOptions,
    ) -> Result<PathBuf> {
        let target = match info.kind {
            FileKind::Stdin => {
                let path = tmp.join("stdin");
                options.stdin_file = Some(path.clone());
                path
            }
            _ => tmp.join(BOX_DIR).join(&info.name),
        };
        filesystem::copy(self.store.path_for(&info.hash), &target, false, false).await?;
        if info.executable {
            filesystem::make_executable(&target).await?;
        }
        Ok(target)
    }

    /// Ingest one produced file and append its `FileInfo` to the response.
    async fn retrieve_file(
        &self,
        info: &FileInfo,
        tmp: &Path,
        response: &mut Response,
    ) -> Result<()> {
        let source = match info.kind {
            FileKind::Stdout => tmp.join("stdout"),
            FileKind::Stderr => tmp.join("stderr"),
            _ => {
                validate_name(&info.name)?;
                tmp.join(BOX_DIR).join(&info.name)
            }
        };
        let hash = self.store.ingest(&source).await?;
        let mut out = info.clone();
        out.hash = hash;
        out.contents = None;
        if let Some(size) = filesystem::size(self.store.path_for(&hash)).await {
            if size as usize <= CHUNK_SIZE {
                out.contents = Some(self.store.contents(&hash).await?);
            }
        }
        response.output.push(out);
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(Error::InvalidRequest(format!("invalid file name: {name:?}")));
    }
    Ok(())
}

fn render_command(request: &Request) -> String {
    let mut cmdline = request.executable.clone();
    for arg in &request.args {
        cmdline.push_str(" '");
        cmdline.push_str(arg);
        cmdline.push('\'');
    }
    cmdline
}

fn scale_limits(limits: &ResourceLimits, options: &mut ExecutionOptions) {
    options.cpu_limit_ms = (limits.cpu_time * 1000.0 * LIMIT_MARGIN) as u64;
    options.wall_limit_ms = (limits.wall_time * 1000.0 * LIMIT_MARGIN) as u64;
    options.memory_limit_kb = (limits.memory as f64 * LIMIT_MARGIN) as u64;
    options.max_files = limits.nfiles;
    options.max_procs = limits.processes;
    options.max_file_size_kb = limits.fsize;
    options.max_mlock_kb = limits.mlock;
    options.max_stack_kb = limits.stack;
}

/// Map raw sandbox numbers to a response status.
///
/// The order is part of the contract: memory, then cpu, then wall, then
/// signal, then exit code. Every comparison is against the limits the caller
/// declared, not the scaled ones the sandbox enforced.
fn classify(limits: &ResourceLimits, usage: &Usage, info: &ExecutionInfo) -> (ExecutionStatus, String) {
    if limits.memory != 0 && usage.memory >= limits.memory {
        (ExecutionStatus::MemoryLimit, "Memory limit exceeded".into())
    } else if limits.cpu_time != 0.0 && usage.sys_time + usage.cpu_time >= limits.cpu_time {
        (ExecutionStatus::TimeLimit, "CPU limit exceeded".into())
    } else if limits.wall_time != 0.0 && usage.wall_time >= limits.wall_time {
        (ExecutionStatus::TimeLimit, "Wall limit exceeded".into())
    } else if info.signal != 0 {
        (ExecutionStatus::Signal, info.message.clone())
    } else if info.status_code != 0 {
        (ExecutionStatus::Nonzero, info.message.clone())
    } else {
        (ExecutionStatus::Success, String::new())
    }
}
