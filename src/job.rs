//! Fault-tolerant orchestration of external solver invocations.
//!
//! The black box behind a [`Process`](crate::Process) is an external
//! executable: it is configured through a parameter file, launched as a
//! detached job, and observed purely through the files it writes. This
//! module provides the pieces a process implementation composes for one
//! invocation:
//!
//! * [`update_parameters`] rewrites options in the solver's parameter file
//!   (an option that does not exist is a configuration error, never a
//!   silent append),
//! * [`ForkContext`] isolates one concurrent invocation in its own working
//!   directory (immutable inputs hard-linked, mutable inputs copied),
//! * [`JobRunner`] launches the job and polls for its start and finish
//!   markers with bounded timeouts, retrying a failed invocation once,
//! * [`BasicStateCache`] serves repeated unperturbed requests for the same
//!   horizon without relaunching.
//!
//! Since the external job offers no in-process completion signal, file
//! polling is the synchronization primitive; [`poll_until`] implements it
//! as a cancellable, deadline-bounded task rather than an open-coded sleep
//! loop. Every timeout expiry is fatal for the surrounding computation --
//! continuing with partial or stale data is never an option.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use getset::{CopyGetters, Setters};
use log::{debug, info, warn};
use nalgebra::DVector;
use thiserror::Error;

/// Error of a job invocation.
#[derive(Debug, Error)]
pub enum JobError {
    /// The external command could not be spawned.
    #[error("failed to launch `{command}`")]
    Launch {
        /// The command that failed to spawn.
        command: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// The job never signalled that it started.
    #[error("job produced no start marker {path:?} within {timeout:?}")]
    StartTimeout {
        /// Path of the missing start marker.
        path: PathBuf,
        /// The timeout that expired.
        timeout: Duration,
    },
    /// The job never finished.
    #[error("job produced no finished output {path:?} within {timeout:?}; stderr tail: {stderr_tail}")]
    FinishTimeout {
        /// Path of the output that never settled.
        path: PathBuf,
        /// The timeout that expired.
        timeout: Duration,
        /// Tail of the captured stderr, for diagnosis.
        stderr_tail: String,
    },
    /// Polling was cancelled through its [`CancelToken`].
    #[error("polling was cancelled")]
    Cancelled,
    /// A requested parameter option does not exist in the target file.
    #[error("option `{option}` not found in {path:?}")]
    OptionNotFound {
        /// The missing option.
        option: String,
        /// The parameter file.
        path: PathBuf,
    },
    /// An artifact appears in both the immutable and the mutable input set
    /// of a fork.
    #[error("artifact {path:?} is listed as both immutable and mutable")]
    DuplicateArtifact {
        /// The offending artifact.
        path: PathBuf,
    },
    /// Filesystem access failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Cancellation handle for a polling task.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a fresh, non-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; every poll loop holding a clone of this token
    /// stops with [`JobError::Cancelled`] at its next tick.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Polls `ready` at the given interval until it returns `true`, the
/// deadline passes, or the token is cancelled.
///
/// Returns `Ok(true)` on readiness and `Ok(false)` on deadline expiry, so
/// that the caller can attach its own diagnostic context to the timeout.
pub fn poll_until<F>(
    deadline: Instant,
    interval: Duration,
    token: &CancelToken,
    mut ready: F,
) -> Result<bool, JobError>
where
    F: FnMut() -> Result<bool, JobError>,
{
    loop {
        if token.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        if ready()? {
            return Ok(true);
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        thread::sleep(interval.min(deadline - now));
    }
}

/// Rewrites `option = value` lines in a solver parameter file.
///
/// Every requested option must already exist in the file; a missing option
/// is a configuration error ([`JobError::OptionNotFound`]), it is never
/// appended silently. All lines starting with the option name are rewritten.
pub fn update_parameters(path: &Path, options: &[(String, String)]) -> Result<(), JobError> {
    let content = fs::read_to_string(path)?;
    let mut lines: Vec<String> = content.lines().map(str::to_owned).collect();

    for (option, value) in options {
        let mut found = false;

        for line in lines.iter_mut() {
            if option_matches(line, option) {
                *line = format!("{option} = {value}");
                found = true;
            }
        }

        if !found {
            return Err(JobError::OptionNotFound {
                option: option.clone(),
                path: path.to_owned(),
            });
        }
    }

    let mut content = lines.join("\n");
    content.push('\n');
    fs::write(path, content)?;

    Ok(())
}

/// Whether the line assigns the given option (and not merely one sharing
/// the prefix, such as `tmax` vs `tmax2`).
fn option_matches(line: &str, option: &str) -> bool {
    match line.trim_start().strip_prefix(option) {
        Some(rest) => matches!(rest.trim_start().chars().next(), Some('=') | None),
        None => false,
    }
}

/// Isolated execution context for one concurrent black-box invocation.
///
/// A fork owns a fresh directory keyed by its fork identifier. Immutable
/// inputs (the unperturbed basic state, typically large) are hard-linked:
/// shared read-only, never duplicated, never mutated by the fork. Mutable
/// inputs (the parameter file) are copied: exclusively owned, mutated
/// freely, destroyed with the fork.
#[derive(Debug)]
pub struct ForkContext {
    dir: PathBuf,
    removed: bool,
}

impl ForkContext {
    /// Creates the context under `base` for the given fork identifier.
    ///
    /// `immutable` and `mutable` are artifact paths relative to `base`. An
    /// artifact listed in both sets is a configuration error. A leftover
    /// directory from a crashed run with the same identifier is replaced.
    pub fn create(
        base: &Path,
        fork_id: usize,
        immutable: &[PathBuf],
        mutable: &[PathBuf],
    ) -> Result<Self, JobError> {
        for artifact in mutable {
            if immutable.contains(artifact) {
                return Err(JobError::DuplicateArtifact {
                    path: artifact.clone(),
                });
            }
        }

        let dir = base.join(format!("fork_{fork_id:04}"));
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        let context = Self {
            dir,
            removed: false,
        };

        for artifact in immutable {
            let target = context.dir.join(artifact);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::hard_link(base.join(artifact), target)?;
        }

        for artifact in mutable {
            let target = context.dir.join(artifact);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(base.join(artifact), target)?;
        }

        debug!("created fork context {:?}", context.dir);
        Ok(context)
    }

    /// Gets the directory of the context. All paths of the invocation are
    /// resolved relative to it.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolves a path relative to the context.
    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.dir.join(relative)
    }

    /// Deletes the entire context. Called once the invocation's result has
    /// been consumed.
    pub fn remove(mut self) -> Result<(), JobError> {
        fs::remove_dir_all(&self.dir)?;
        self.removed = true;
        Ok(())
    }
}

impl Drop for ForkContext {
    fn drop(&mut self) {
        if !self.removed {
            // Best effort; an explicit `remove` reports errors properly.
            let _ = fs::remove_dir_all(&self.dir);
        }
    }
}

/// How the finish of a job is detected.
#[derive(Debug, Clone)]
pub enum FinishRule {
    /// The artifact at the path exists.
    MarkerExists(PathBuf),
    /// The artifact exists and its size and modification time did not
    /// change across one polling interval. Used for solvers that write
    /// their result incrementally and offer no explicit done marker.
    Quiescent(PathBuf),
}

impl FinishRule {
    fn path(&self) -> &Path {
        match self {
            FinishRule::MarkerExists(path) | FinishRule::Quiescent(path) => path,
        }
    }
}

/// Description of one external solver invocation.
///
/// All paths are relative to `dir` (the base working directory or a
/// [`ForkContext`] directory).
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Executable to launch.
    pub command: String,
    /// Arguments of the executable.
    pub args: Vec<String>,
    /// Working directory of the invocation.
    pub dir: PathBuf,
    /// Parameter file to update before the launch, if any.
    pub parameter_file: Option<PathBuf>,
    /// Options rewritten into the parameter file (restart flag, target
    /// horizon, perturbation injection, output suppression).
    pub parameters: Vec<(String, String)>,
    /// Marker whose existence signals that the job started.
    pub start_marker: PathBuf,
    /// How the finish of the job is detected.
    pub finish: FinishRule,
    /// The result artifact handed back to the caller on success.
    pub result: PathBuf,
    /// File capturing the job's stdout.
    pub stdout: PathBuf,
    /// File capturing the job's stderr.
    pub stderr: PathBuf,
    /// Transient per-run artifacts deleted after success (perturbation
    /// file and the like).
    pub transient: Vec<PathBuf>,
}

/// Options for the [`JobRunner`].
#[derive(Debug, Clone, CopyGetters, Setters)]
#[getset(get_copy = "pub", set = "pub")]
pub struct JobRunnerOptions {
    /// Interval between polls of the job's markers. Default: `1s`.
    poll_interval: Duration,
    /// Timeout for the start marker to appear. Failure here is a hard
    /// error: the job never began. Default: `10min`.
    start_timeout: Duration,
    /// Timeout for the finish condition. Default: `6h`.
    finish_timeout: Duration,
    /// Size above which captured log files are deleted during cleanup.
    /// Default: `16MiB`.
    log_limit: u64,
    /// Whether a failed invocation is retried once before giving up.
    /// Default: `true`.
    retry: bool,
}

impl Default for JobRunnerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            start_timeout: Duration::from_secs(600),
            finish_timeout: Duration::from_secs(6 * 3600),
            log_limit: 16 * 1024 * 1024,
            retry: true,
        }
    }
}

/// Runner for external solver invocations.
#[derive(Debug, Default)]
pub struct JobRunner {
    options: JobRunnerOptions,
    token: CancelToken,
}

impl JobRunner {
    /// Initializes the runner with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Initializes the runner with given options.
    pub fn with_options(options: JobRunnerOptions) -> Self {
        Self {
            options,
            token: CancelToken::new(),
        }
    }

    /// Gets a cancellation handle shared by every poll loop of this runner.
    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Runs one invocation to completion and returns the path of its result
    /// artifact.
    ///
    /// A transiently failed invocation is retried once (diagnostics are
    /// logged on the first failure); the second failure is fatal and must
    /// abort the enclosing computation -- substituting a default result is
    /// not an option. Configuration errors (a missing parameter option, a
    /// duplicate artifact) are fatal immediately, retrying cannot fix them.
    pub fn run_once(&self, spec: &JobSpec) -> Result<PathBuf, JobError> {
        let attempts = if self.options.retry { 2 } else { 1 };
        let mut attempt = 0;

        loop {
            match self.attempt(spec) {
                Ok(result) => {
                    if attempt > 0 {
                        info!("job `{}` recovered on retry", spec.command);
                    }
                    return Ok(result);
                }
                Err(error) if attempt + 1 < attempts && is_transient(&error) => {
                    warn!("job `{}` failed, retrying once: {error}", spec.command);
                    self.reset_markers(spec);
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Removes stale markers so that a retry cannot mistake the previous
    /// attempt's leftovers for progress.
    fn reset_markers(&self, spec: &JobSpec) {
        for path in [&spec.start_marker, &PathBuf::from(spec.finish.path())] {
            match fs::remove_file(spec.dir.join(path)) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => warn!("failed to remove stale marker {path:?}: {error}"),
            }
        }
    }

    fn attempt(&self, spec: &JobSpec) -> Result<PathBuf, JobError> {
        if let Some(parameter_file) = &spec.parameter_file {
            update_parameters(&spec.dir.join(parameter_file), &spec.parameters)?;
        }

        // Launch detached; the job is observed only through its files.
        let stdout = fs::File::create(spec.dir.join(&spec.stdout))?;
        let stderr = fs::File::create(spec.dir.join(&spec.stderr))?;
        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .current_dir(&spec.dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|source| JobError::Launch {
                command: spec.command.clone(),
                source,
            })?;
        debug!("launched `{}` (pid {})", spec.command, child.id());

        let interval = self.options.poll_interval;

        // The job must signal that it began.
        let start_path = spec.dir.join(&spec.start_marker);
        let deadline = Instant::now() + self.options.start_timeout;
        if !poll_until(deadline, interval, &self.token, || Ok(start_path.exists()))? {
            let _ = child.kill();
            return Err(JobError::StartTimeout {
                path: start_path,
                timeout: self.options.start_timeout,
            });
        }
        debug!("job `{}` started", spec.command);

        // Wait for the finish condition.
        let finish_path = spec.dir.join(spec.finish.path());
        let deadline = Instant::now() + self.options.finish_timeout;
        let finished = match &spec.finish {
            FinishRule::MarkerExists(_) => {
                poll_until(deadline, interval, &self.token, || Ok(finish_path.exists()))?
            }
            FinishRule::Quiescent(_) => {
                // Finished once two consecutive observations agree.
                let mut previous: Option<(u64, SystemTime)> = None;
                poll_until(deadline, interval, &self.token, || {
                    let metadata = match fs::metadata(&finish_path) {
                        Ok(metadata) => metadata,
                        Err(error) if error.kind() == io::ErrorKind::NotFound => {
                            previous = None;
                            return Ok(false);
                        }
                        Err(error) => return Err(error.into()),
                    };
                    let current = (metadata.len(), metadata.modified()?);
                    let settled = previous == Some(current);
                    previous = Some(current);
                    Ok(settled)
                })?
            }
        };

        if !finished {
            let _ = child.kill();
            return Err(JobError::FinishTimeout {
                path: finish_path,
                timeout: self.options.finish_timeout,
                stderr_tail: read_tail(&spec.dir.join(&spec.stderr), 2048),
            });
        }

        // Reap the child if it already exited; a detached solver may keep
        // running past its output, which is its own business.
        let _ = child.try_wait();

        self.cleanup(spec);
        Ok(spec.dir.join(&spec.result))
    }

    /// Deletes transient per-run artifacts and oversized captured logs.
    fn cleanup(&self, spec: &JobSpec) {
        for artifact in &spec.transient {
            match fs::remove_file(spec.dir.join(artifact)) {
                Ok(()) => debug!("removed transient artifact {artifact:?}"),
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => warn!("failed to remove transient artifact {artifact:?}: {error}"),
            }
        }

        for log in [&spec.stdout, &spec.stderr] {
            let path = spec.dir.join(log);
            if let Ok(metadata) = fs::metadata(&path) {
                if metadata.len() > self.options.log_limit {
                    debug!("removing oversized log {log:?} ({} bytes)", metadata.len());
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }
}

/// Whether the error is worth one retry: infrastructure failures are,
/// configuration errors and cancellation are not.
fn is_transient(error: &JobError) -> bool {
    matches!(
        error,
        JobError::Launch { .. }
            | JobError::StartTimeout { .. }
            | JobError::FinishTimeout { .. }
            | JobError::Io(_)
    )
}

/// Reads the last `limit` bytes of a file as lossy UTF-8.
fn read_tail(path: &Path, limit: usize) -> String {
    match fs::read(path) {
        Ok(bytes) => {
            let start = bytes.len().saturating_sub(limit);
            String::from_utf8_lossy(&bytes[start..]).into_owned()
        }
        Err(_) => String::new(),
    }
}

/// Cache of the unperturbed, horizon-`t` observable.
///
/// The basic state is requested once per objective or gradient evaluation;
/// caching it avoids relaunching the most expensive computation of the run.
/// A cached entry whose horizon differs from the request by more than ~1%
/// is inconsistent -- likely a leftover of an interrupted run with different
/// parameters -- and is discarded and recomputed rather than trusted.
#[derive(Debug, Default)]
pub struct BasicStateCache {
    entry: Option<(f64, DVector<f64>)>,
}

impl BasicStateCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the observable for horizon `t`. A stale entry is discarded
    /// with a warning and `None` is returned, signalling recomputation.
    pub fn lookup(&mut self, t: f64) -> Option<DVector<f64>> {
        let (cached_t, state) = self.entry.as_ref()?;

        if (cached_t - t).abs() <= 0.01 * t.abs() {
            Some(state.clone_owned())
        } else {
            warn!("discarding stale basic state cached at t = {cached_t}, requested t = {t}");
            self.entry = None;
            None
        }
    }

    /// Stores the observable for horizon `t`, replacing any previous entry.
    pub fn store(&mut self, t: f64, state: DVector<f64>) {
        self.entry = Some((t, state));
    }
}
