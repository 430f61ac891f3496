use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cgroup::CgroupController;
use crate::error::{Error, Result};
use crate::limits::Limits;
use crate::logstream::LogPipeline;

/// Wrapper executable for the self-re-exec; the kernel resolves it to the
/// currently running server binary.
const SELF_EXE: &str = "/proc/self/exe";

/// Upper bound on how long `stop` waits for the wait worker after SIGKILL.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the wait worker lets the log readers drain the pipe tails
/// before closing the pipelines. A stalled subscriber forfeits the tail
/// rather than wedging termination.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of a job. Transitions are monotonic: STARTING → ALIVE →
/// FINISHED, with the single exception of FINISHED → STOPPED applied once
/// by the stop path after an explicit kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Starting,
    Alive,
    Finished,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Stopped)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Starting => "STARTING",
            JobStatus::Alive => "ALIVE",
            JobStatus::Finished => "FINISHED",
            JobStatus::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// Snapshot of a job's mutable state.
#[derive(Debug, Clone, Serialize)]
pub struct JobState {
    pub status: JobStatus,
    /// Only meaningful in a terminal status; -1 when the process was
    /// signaled before an exit code was observable.
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<SystemTime>,
    pub limits: Limits,
}

#[derive(Debug)]
struct Pipes {
    stdout: LogPipeline,
    stderr: LogPipeline,
}

/// A supervised user command.
///
/// The job owns the child process for its whole life: it spawns the
/// command wrapped in the cgroup trampoline, watches it exit from a wait
/// worker, exposes state snapshots, and hands out replayable output
/// streams. All state transitions go through the interior lock; the lock
/// is never held across an await.
#[derive(Debug)]
pub struct Job {
    pub id: Uuid,
    pub command: String,
    pub args: Vec<String>,

    owner: Option<String>,
    exec_path: PathBuf,
    cgroup_root: Option<PathBuf>,
    cgroup: Option<Arc<CgroupController>>,

    state: RwLock<JobState>,
    pipes: RwLock<Option<Arc<Pipes>>>,
    pid: AtomicU32,
    done: CancellationToken,
}

/// Fluent builder for [`Job`]. Limits, owner, and the wrapper overrides
/// are all optional; a bare `Job::builder(cmd, args).build()` runs the
/// command unlimited and unowned.
pub struct JobBuilder {
    command: String,
    args: Vec<String>,
    limits: Limits,
    owner: Option<String>,
    exec_path: PathBuf,
    cgroup_root: Option<PathBuf>,
    cgroup: Option<Arc<CgroupController>>,
}

impl JobBuilder {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            limits: Limits::default(),
            owner: None,
            exec_path: PathBuf::from(SELF_EXE),
            cgroup_root: None,
            cgroup: None,
        }
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Record who created the job; `stop` is then owner-only.
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Controller used to remove the job's cgroup once it terminates.
    pub fn cgroup(mut self, controller: Arc<CgroupController>) -> Self {
        self.cgroup = Some(controller);
        self
    }

    /// Redirect the cgroup hierarchy the trampoline enrols into. Passed
    /// through as a wrapper flag; mainly useful against a scratch root.
    pub fn cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = Some(root.into());
        self
    }

    /// Override the wrapper executable (defaults to `/proc/self/exe`).
    pub fn exec_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.exec_path = path.into();
        self
    }

    pub fn build(self) -> Job {
        Job {
            id: Uuid::new_v4(),
            command: self.command,
            args: self.args,
            owner: self.owner,
            exec_path: self.exec_path,
            cgroup_root: self.cgroup_root,
            cgroup: self.cgroup,
            state: RwLock::new(JobState {
                status: JobStatus::Starting,
                exit_code: 0,
                exit_error: None,
                exited_at: None,
                limits: self.limits,
            }),
            pipes: RwLock::new(None),
            pid: AtomicU32::new(0),
            done: CancellationToken::new(),
        }
    }
}

impl Job {
    pub fn builder(command: impl Into<String>, args: Vec<String>) -> JobBuilder {
        JobBuilder::new(command, args)
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Snapshot the current state.
    pub fn status(&self) -> JobState {
        self.state_read().clone()
    }

    pub fn active(&self) -> bool {
        self.state_read().status == JobStatus::Alive
    }

    pub fn limits(&self) -> Limits {
        self.state_read().limits
    }

    /// Resolves once the job has terminated and its resources are cleaned
    /// up. Resolves immediately for already-terminal jobs.
    pub async fn done(&self) {
        self.done.cancelled().await;
    }

    /// Launch the wrapped process. Only valid once, from `STARTING`; on
    /// spawn failure the job stays `STARTING` and should be discarded.
    ///
    /// Must be called within a tokio runtime: the wait worker and the log
    /// pipelines are spawned here.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state_write();
        if state.status != JobStatus::Starting {
            return Err(Error::BadState {
                from: state.status,
                op: "start",
            });
        }

        let mut cmd = Command::new(&self.exec_path);
        cmd.args(self.wrap_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(Error::StartFailed)?;
        self.pid.store(child.id().unwrap_or_default(), Ordering::SeqCst);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::StartFailed(std::io::Error::other("stdout pipe missing")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::StartFailed(std::io::Error::other("stderr pipe missing")))?;

        *self.pipes_write() = Some(Arc::new(Pipes {
            stdout: LogPipeline::new(stdout),
            stderr: LogPipeline::new(stderr),
        }));

        state.status = JobStatus::Alive;
        tracing::debug!(id = %self.id, command = %self.command, "job started");

        tokio::spawn(Self::wait(Arc::clone(self), child));
        Ok(())
    }

    /// Wait worker: observe process exit, record the terminal state, drain
    /// and close the log pipelines, release the cgroup, signal completion.
    async fn wait(job: Arc<Job>, mut child: tokio::process::Child) {
        let waited = child.wait().await;

        {
            let mut state = job.state_write();
            match waited {
                Ok(status) => {
                    // A signaled process has no exit code to report.
                    state.exit_code = status.code().unwrap_or(-1);
                }
                Err(e) => {
                    state.exit_code = -1;
                    state.exit_error = Some(e.to_string());
                }
            }
            state.status = JobStatus::Finished;
            state.exited_at = Some(SystemTime::now());
            tracing::debug!(id = %job.id, exit_code = state.exit_code, "job finished");
        }

        let pipes = job.pipes_read().clone();
        if let Some(pipes) = pipes {
            // Let the readers capture whatever the process wrote right
            // before exiting, then tear the pipelines down.
            let drain = async {
                pipes.stdout.drained().await;
                pipes.stderr.drained().await;
            };
            if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
                tracing::warn!(id = %job.id, "log pipes not drained in time, closing anyway");
            }
            pipes.stdout.close();
            pipes.stderr.close();
        }

        if job.limits().is_limited() {
            if let Some(cgroup) = &job.cgroup {
                if let Err(e) = cgroup.remove(&job.id.to_string()).await {
                    tracing::warn!(id = %job.id, "failed to remove job cgroup: {e}");
                }
            }
        }

        job.done.cancel();
    }

    /// Kill the process and wait for the wait worker to finish cleanup.
    /// Only valid while `ALIVE`; bounded by a 10-second timeout, after
    /// which the state is left untouched.
    pub async fn stop(&self) -> Result<()> {
        // Take what we need and release the lock; the wait worker needs it
        // to record the exit.
        let pid = {
            let state = self.state_read();
            if state.status != JobStatus::Alive {
                return Err(Error::BadState {
                    from: state.status,
                    op: "stop",
                });
            }
            self.pid.load(Ordering::SeqCst)
        };
        if pid == 0 {
            return Err(Error::StopFailed("process id unavailable".into()));
        }

        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        )
        .map_err(|e| Error::StopFailed(e.to_string()))?;

        if tokio::time::timeout(STOP_TIMEOUT, self.done())
            .await
            .is_err()
        {
            return Err(Error::StopTimeout);
        }

        let mut state = self.state_write();
        state.status = JobStatus::Stopped;
        state.exited_at.get_or_insert_with(SystemTime::now);
        tracing::debug!(id = %self.id, "job stopped");

        if let Some(err) = &state.exit_error {
            return Err(Error::StopFailed(err.clone()));
        }
        Ok(())
    }

    /// Stream the job's stdout. Live while the job runs; replay-only once
    /// it has terminated and its logs are fully captured.
    pub fn stream_stdout(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<Vec<u8>>> {
        self.stream_pipe(cancel, |p| &p.stdout)
    }

    /// Stream the job's stderr.
    pub fn stream_stderr(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<Vec<u8>>> {
        self.stream_pipe(cancel, |p| &p.stderr)
    }

    fn stream_pipe(
        &self,
        cancel: CancellationToken,
        select: impl Fn(&Pipes) -> &LogPipeline,
    ) -> Result<mpsc::Receiver<Vec<u8>>> {
        let pipes = self.pipes_read().clone();
        let Some(pipes) = pipes else {
            return Err(Error::BadState {
                from: JobStatus::Starting,
                op: "stream",
            });
        };
        // Live until cleanup has fully completed: a subscriber arriving
        // while the pipe tail is still draining attaches live and closes
        // with the pipeline, so it never misses the final bytes.
        let ongoing = !self.done.is_cancelled();
        Ok(select(&pipes).stream(ongoing, cancel))
    }

    /// The argument vector for the self-re-exec: limit flags, the private
    /// sentinels, then the user command behind a `--` separator so user
    /// flags are never parsed.
    fn wrap_args(&self) -> Vec<String> {
        let mut args = self.limits().to_flags();
        if let Some(root) = &self.cgroup_root {
            args.push(format!("--cgroup-root={}", root.display()));
        }
        args.push(format!("--jobid={}", self.id));
        args.push(format!("--command={}", self.command));
        args.push("--".to_string());
        args.extend(self.args.iter().cloned());
        args
    }

    /// Test-only shortcut to a terminal state without running a process.
    #[cfg(test)]
    pub(crate) fn force_finished(&self, exited_at: SystemTime) {
        let mut state = self.state_write();
        state.status = JobStatus::Finished;
        state.exit_code = 0;
        state.exited_at = Some(exited_at);
        self.done.cancel();
    }

    fn state_read(&self) -> std::sync::RwLockReadGuard<'_, JobState> {
        self.state.read().expect("job state lock poisoned")
    }

    fn state_write(&self) -> std::sync::RwLockWriteGuard<'_, JobState> {
        self.state.write().expect("job state lock poisoned")
    }

    fn pipes_read(&self) -> std::sync::RwLockReadGuard<'_, Option<Arc<Pipes>>> {
        self.pipes.read().expect("job pipes lock poisoned")
    }

    fn pipes_write(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<Pipes>>> {
        self.pipes.write().expect("job pipes lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_starting_and_unowned() {
        let job = Job::builder("echo", vec!["hi".into()]).build();
        let state = job.status();
        assert_eq!(state.status, JobStatus::Starting);
        assert_eq!(state.exit_code, 0);
        assert!(state.exited_at.is_none());
        assert!(job.owner().is_none());
        assert!(!job.active());
    }

    #[test]
    fn wrap_args_orders_flags_sentinels_separator_then_user_args() {
        let job = Job::builder("sleep", vec!["5".into(), "--weird-flag".into()])
            .limits(Limits {
                memory_mb: 32,
                cpu_weight: 10,
                io_weight: 0,
            })
            .cgroup_root("/tmp/fake-cgroup")
            .build();

        let args = job.wrap_args();
        assert_eq!(
            args,
            vec![
                "--memorymb=32".to_string(),
                "--cpuweight=10".to_string(),
                "--cgroup-root=/tmp/fake-cgroup".to_string(),
                format!("--jobid={}", job.id),
                "--command=sleep".to_string(),
                "--".to_string(),
                "5".to_string(),
                "--weird-flag".to_string(),
            ]
        );
    }

    #[test]
    fn wrap_args_without_limits_has_no_limit_flags() {
        let job = Job::builder("true", Vec::new()).build();
        let args = job.wrap_args();
        assert_eq!(args[0], format!("--jobid={}", job.id));
        assert_eq!(args[1], "--command=true");
        assert_eq!(args[2], "--");
    }

    #[tokio::test]
    async fn stop_before_start_is_a_state_error() {
        let job = Job::builder("echo", Vec::new()).build();
        let err = job.stop().await.unwrap_err();
        assert!(matches!(
            err,
            Error::BadState {
                from: JobStatus::Starting,
                op: "stop"
            }
        ));
    }

    #[test]
    fn stream_before_start_is_a_state_error() {
        let job = Job::builder("echo", Vec::new()).build();
        let err = job.stream_stdout(CancellationToken::new()).unwrap_err();
        assert!(matches!(err, Error::BadState { op: "stream", .. }));
    }

    #[test]
    fn status_display_matches_wire_names() {
        assert_eq!(JobStatus::Starting.to_string(), "STARTING");
        assert_eq!(JobStatus::Alive.to_string(), "ALIVE");
        assert_eq!(JobStatus::Finished.to_string(), "FINISHED");
        assert_eq!(JobStatus::Stopped.to_string(), "STOPPED");
    }

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Starting.is_terminal());
        assert!(!JobStatus::Alive.is_terminal());
        assert!(JobStatus::Finished.is_terminal());
        assert!(JobStatus::Stopped.is_terminal());
    }
}
