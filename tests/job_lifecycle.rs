//! End-to-end engine tests: jobs run through the real self-re-exec against
//! a scratch cgroup hierarchy, so the whole spawn → enrol → exec → wait →
//! stream path is exercised without root privileges.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use jobworker::cgroup::CgroupController;
use jobworker::{CancellationToken, Error, Job, JobStatus, Limits};

const SUBSYSTEMS: [&str; 3] = ["cpu", "memory", "blkio"];

/// The server binary, used as the wrapper executable instead of
/// /proc/self/exe (which would be the test harness here).
fn wrapper_bin() -> &'static str {
    env!("CARGO_BIN_EXE_jobworker")
}

/// A scratch tree shaped like a mounted cgroup v1 root with the parent
/// group already prepared.
fn fake_cgroup_root() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for sys in SUBSYSTEMS {
        let parent = dir.path().join(sys).join("jobworker");
        std::fs::create_dir_all(&parent).unwrap();
        std::fs::write(parent.join("cgroup.procs"), "").unwrap();
    }
    dir
}

/// Pre-create a per-job group with the files the kernel would provide.
fn provision_job_group(root: &Path, id: &str) {
    let params = [
        ("cpu", "cpu.shares"),
        ("memory", "memory.limit_in_bytes"),
        ("blkio", "blkio.weight"),
    ];
    for sys in SUBSYSTEMS {
        let group = root.join(sys).join("jobworker").join(id);
        std::fs::create_dir_all(&group).unwrap();
        std::fs::write(group.join("cgroup.procs"), "").unwrap();
    }
    for (sys, param) in params {
        let group = root.join(sys).join("jobworker").join(id);
        std::fs::write(group.join(param), "").unwrap();
    }
}

fn build_job(root: &Path, command: &str, args: &[&str], limits: Limits) -> Arc<Job> {
    Arc::new(
        Job::builder(command, args.iter().map(|s| s.to_string()).collect())
            .limits(limits)
            .exec_path(wrapper_bin())
            .cgroup_root(root)
            .build(),
    )
}

async fn wait_done(job: &Job) {
    tokio::time::timeout(Duration::from_secs(10), job.done())
        .await
        .expect("job did not terminate in time");
}

async fn collect(mut rx: tokio::sync::mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = rx.recv().await {
        out.extend_from_slice(&chunk);
    }
    out
}

#[tokio::test]
async fn echo_job_finishes_and_replays_its_output() {
    let root = fake_cgroup_root();
    let job = build_job(root.path(), "echo", &["hi"], Limits::default());

    job.start().unwrap();
    wait_done(&job).await;

    let state = job.status();
    assert_eq!(state.status, JobStatus::Finished);
    assert_eq!(state.exit_code, 0);
    assert!(state.exited_at.is_some());

    // Terminal job: the stream is replay-only and closes by itself.
    let rx = job.stream_stdout(CancellationToken::new()).unwrap();
    assert_eq!(collect(rx).await, b"hi\n");
}

#[tokio::test]
async fn unlimited_job_enrols_into_the_parent_group() {
    let root = fake_cgroup_root();
    let job = build_job(root.path(), "true", &[], Limits::default());

    job.start().unwrap();
    wait_done(&job).await;
    assert_eq!(job.status().exit_code, 0);

    for sys in SUBSYSTEMS {
        let procs = root.path().join(sys).join("jobworker").join("cgroup.procs");
        let content = std::fs::read_to_string(procs).unwrap();
        let pid: u32 = content.trim().parse().expect("pid in parent cgroup.procs");
        assert!(pid > 0);
        // Zero limits: no per-job directory may have been created.
        let entries: Vec<_> = std::fs::read_dir(root.path().join(sys).join("jobworker"))
            .unwrap()
            .flatten()
            .filter(|e| e.path().is_dir())
            .collect();
        assert!(entries.is_empty(), "unexpected job group under {sys}");
    }
}

#[tokio::test]
async fn limited_job_writes_its_limits_before_running() {
    let root = fake_cgroup_root();
    let limits = Limits {
        memory_mb: 16,
        cpu_weight: 50,
        io_weight: 20,
    };
    let job = build_job(root.path(), "true", &[], limits);
    let id = job.id.to_string();
    provision_job_group(root.path(), &id);

    job.start().unwrap();
    wait_done(&job).await;
    assert_eq!(job.status().exit_code, 0);

    let group = |sys: &str| root.path().join(sys).join("jobworker").join(&id);
    assert_eq!(
        std::fs::read_to_string(group("memory").join("memory.limit_in_bytes")).unwrap(),
        "16M"
    );
    assert_eq!(
        std::fs::read_to_string(group("cpu").join("cpu.shares")).unwrap(),
        "500"
    );
    assert_eq!(
        std::fs::read_to_string(group("blkio").join("blkio.weight")).unwrap(),
        "200"
    );
    for sys in SUBSYSTEMS {
        let procs = std::fs::read_to_string(group(sys).join("cgroup.procs")).unwrap();
        assert!(!procs.trim().is_empty(), "no pid enrolled under {sys}");
    }
}

#[tokio::test]
async fn limited_job_cgroup_is_removed_on_termination() {
    let root = fake_cgroup_root();
    let controller = Arc::new(CgroupController::with_root(root.path()));
    let limits = Limits {
        memory_mb: 8,
        cpu_weight: 0,
        io_weight: 0,
    };
    let job = Arc::new(
        Job::builder("true", Vec::new())
            .limits(limits)
            .exec_path(wrapper_bin())
            .cgroup_root(root.path())
            .cgroup(controller)
            .build(),
    );
    let id = job.id.to_string();
    provision_job_group(root.path(), &id);

    job.start().unwrap();
    wait_done(&job).await;

    for sys in SUBSYSTEMS {
        assert!(
            !root.path().join(sys).join("jobworker").join(&id).exists(),
            "job group under {sys} survived termination"
        );
    }
}

#[tokio::test]
async fn long_runner_is_stopped_with_sigkill() {
    let root = fake_cgroup_root();
    let job = build_job(root.path(), "sleep", &["30"], Limits::default());

    job.start().unwrap();
    assert!(job.active());

    job.stop().await.unwrap();

    let state = job.status();
    assert_eq!(state.status, JobStatus::Stopped);
    assert_eq!(state.exit_code, -1);
    assert!(state.exited_at.is_some());
}

#[tokio::test]
async fn concurrent_subscribers_see_the_same_byte_sequence() {
    let root = fake_cgroup_root();
    let job = build_job(
        root.path(),
        "sh",
        &["-c", "i=0; while [ $i -lt 50 ]; do echo tick $i; i=$((i+1)); done"],
        Limits::default(),
    );

    job.start().unwrap();
    let a = job.stream_stdout(CancellationToken::new()).unwrap();
    let b = job.stream_stdout(CancellationToken::new()).unwrap();

    let (bytes_a, bytes_b) = tokio::join!(collect(a), collect(b));
    wait_done(&job).await;

    assert_eq!(bytes_a, bytes_b);
    let text = String::from_utf8(bytes_a).unwrap();
    assert_eq!(text.lines().count(), 50);
    assert!(text.starts_with("tick 0\n"));
    assert!(text.ends_with("tick 49\n"));
}

#[tokio::test]
async fn late_subscriber_replays_the_full_capture() {
    let root = fake_cgroup_root();
    let job = build_job(
        root.path(),
        "sh",
        &["-c", "echo one; echo two; echo three"],
        Limits::default(),
    );

    job.start().unwrap();
    wait_done(&job).await;

    let rx = job.stream_stdout(CancellationToken::new()).unwrap();
    assert_eq!(collect(rx).await, b"one\ntwo\nthree\n");
}

#[tokio::test]
async fn stderr_is_captured_separately() {
    let root = fake_cgroup_root();
    let job = build_job(
        root.path(),
        "sh",
        &["-c", "echo to-stdout; echo to-stderr >&2"],
        Limits::default(),
    );

    job.start().unwrap();
    wait_done(&job).await;

    let out = collect(job.stream_stdout(CancellationToken::new()).unwrap()).await;
    let err = collect(job.stream_stderr(CancellationToken::new()).unwrap()).await;
    assert_eq!(out, b"to-stdout\n");
    assert_eq!(err, b"to-stderr\n");
}

#[tokio::test]
async fn cancelling_a_live_stream_closes_it_promptly() {
    let root = fake_cgroup_root();
    let job = build_job(root.path(), "sleep", &["30"], Limits::default());
    job.start().unwrap();

    let cancel = CancellationToken::new();
    let mut rx = job.stream_stdout(cancel.clone()).unwrap();
    cancel.cancel();

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        while rx.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "stream did not close after cancellation");

    job.stop().await.unwrap();
}

#[tokio::test]
async fn double_start_is_a_state_error() {
    let root = fake_cgroup_root();
    let job = build_job(root.path(), "sleep", &["30"], Limits::default());

    job.start().unwrap();
    assert!(matches!(
        job.start().unwrap_err(),
        Error::BadState {
            from: JobStatus::Alive,
            op: "start"
        }
    ));

    job.stop().await.unwrap();
}

#[tokio::test]
async fn stop_after_natural_finish_is_a_state_error() {
    let root = fake_cgroup_root();
    let job = build_job(root.path(), "true", &[], Limits::default());

    job.start().unwrap();
    wait_done(&job).await;

    assert!(matches!(
        job.stop().await.unwrap_err(),
        Error::BadState {
            from: JobStatus::Finished,
            op: "stop"
        }
    ));
}

#[tokio::test]
async fn failing_spawn_leaves_the_job_starting() {
    let job = Arc::new(
        Job::builder("true", Vec::new())
            .exec_path("/nonexistent/jobworker-binary")
            .build(),
    );

    assert!(matches!(job.start().unwrap_err(), Error::StartFailed(_)));
    assert_eq!(job.status().status, JobStatus::Starting);
}

#[tokio::test]
async fn nonzero_exit_code_is_reported() {
    let root = fake_cgroup_root();
    let job = build_job(root.path(), "sh", &["-c", "exit 3"], Limits::default());

    job.start().unwrap();
    wait_done(&job).await;

    let state = job.status();
    assert_eq!(state.status, JobStatus::Finished);
    assert_eq!(state.exit_code, 3);
}
