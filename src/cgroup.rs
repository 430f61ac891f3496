use std::fs::{DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::limits::CgroupLimits;

/// Mount point of the cgroup v1 hierarchy.
pub const DEFAULT_ROOT: &str = "/sys/fs/cgroup";

/// Parent group every job group lives under, per subsystem.
pub const PARENT_GROUP: &str = "jobworker";

/// File that enrols a pid into a group.
pub const PROCS_FILE: &str = "cgroup.procs";

pub const MEM_LIMIT: &str = "memory.limit_in_bytes";
pub const CPU_SHARES: &str = "cpu.shares";
pub const BLKIO_WEIGHT: &str = "blkio.weight";

const DIR_MODE: u32 = 0o555;

/// How often and how long to retry removing a group directory. The kernel
/// refuses the rmdir until it has reaped every enrolled task.
const REMOVE_ATTEMPTS: u32 = 5;
const REMOVE_BACKOFF: Duration = Duration::from_secs(1);

struct Subsystem {
    name: &'static str,
    params: &'static [&'static str],
}

/// The subsystems we manage and the parameters we recognise per subsystem.
/// A params slice leaves room for recognising more than one parameter per
/// subsystem later.
const SUBSYSTEMS: &[Subsystem] = &[
    Subsystem { name: "cpu", params: &[CPU_SHARES] },
    Subsystem { name: "memory", params: &[MEM_LIMIT] },
    Subsystem { name: "blkio", params: &[BLKIO_WEIGHT] },
];

/// Filesystem-backed allocator of per-job cgroup v1 groups.
///
/// The controller keeps no record of what it allocated: every operation is
/// keyed by the job id and idempotent, so crash recovery is a matter of
/// calling [`CgroupController::remove`] again or letting the startup sweep
/// collect leftovers. All filesystem mutations are serialised through one
/// lock.
#[derive(Debug)]
pub struct CgroupController {
    root: PathBuf,
    lock: Mutex<()>,
}

impl CgroupController {
    /// A controller over the standard root, without any filesystem checks.
    /// This is what the trampoline uses: by the time a job process runs,
    /// the serving process has already verified kernel support.
    pub fn new() -> Self {
        Self::with_root(DEFAULT_ROOT)
    }

    /// A controller over an alternate root. Used by the trampoline when the
    /// spawner redirected the hierarchy, and by tests running against a
    /// scratch directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    /// Construct the serving-side controller: verify that the kernel
    /// exposes every parameter we manage, then create the parent group
    /// under each subsystem.
    pub fn init() -> Result<Self> {
        Self::init_at(DEFAULT_ROOT)
    }

    fn init_at(root: impl Into<PathBuf>) -> Result<Self> {
        let ctrl = Self::with_root(root);

        for sys in SUBSYSTEMS {
            for param in sys.params {
                let p = ctrl.root.join(sys.name).join(param);
                if !p.exists() {
                    return Err(Error::NotSupported((*param).to_string()));
                }
            }
        }

        ctrl.create_group_dirs(Path::new(PARENT_GROUP))
            .map_err(|e| match e {
                Error::CgroupCreate { source, .. } => Error::CgroupInit(source),
                other => other,
            })?;

        Ok(ctrl)
    }

    /// Place `pid` into the group for `group_id`, creating the group and
    /// writing all limit parameters first. With empty limits the pid goes
    /// straight into the parent group and no per-job directory is made.
    pub async fn put(&self, group_id: &str, pid: u32, limits: &CgroupLimits) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mut rel = PathBuf::from(PARENT_GROUP);
        if !limits.is_empty() {
            rel.push(group_id);
            self.create_group_dirs(&rel)?;
        }

        for sys in SUBSYSTEMS {
            for (param, value) in limits {
                // Route each parameter to the subsystem named before the
                // first dot.
                let param_subsystem = param.split('.').next().unwrap_or_default();
                if sys.name != param_subsystem {
                    continue;
                }
                let file = self.root.join(sys.name).join(&rel).join(param);
                append_to_file(&file, value)?;
            }

            // The pid write comes after the parameters so a process is only
            // enrolled once its limits are in place.
            let procs = self.root.join(sys.name).join(&rel).join(PROCS_FILE);
            append_to_file(&procs, &pid.to_string())?;
        }

        Ok(())
    }

    /// Remove the per-job group under every subsystem, retrying while the
    /// kernel still holds tasks in it. Removing an absent group is a no-op.
    pub async fn remove(&self, group_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;

        for sys in SUBSYSTEMS {
            let p = self.root.join(sys.name).join(PARENT_GROUP).join(group_id);

            let mut attempt = 0;
            loop {
                match remove_group_dir(&p) {
                    Ok(()) => break,
                    Err(err) => {
                        attempt += 1;
                        if attempt >= REMOVE_ATTEMPTS {
                            return Err(Error::CgroupRemove {
                                group: group_id.to_string(),
                                subsystem: sys.name,
                                source: err,
                            });
                        }
                        tokio::time::sleep(REMOVE_BACKOFF).await;
                    }
                }
            }
        }

        Ok(())
    }

    /// Best-effort removal of per-job directories left over from a previous
    /// run. Everything in memory is lost on a crash, so anything still
    /// sitting under the parent group is an orphan.
    pub async fn sweep_orphans(&self) -> usize {
        let _guard = self.lock.lock().await;

        let mut removed = 0;
        for sys in SUBSYSTEMS {
            let parent = self.root.join(sys.name).join(PARENT_GROUP);
            let entries = match std::fs::read_dir(&parent) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                match remove_group_dir(&path) {
                    Ok(()) => {
                        tracing::debug!(path = %path.display(), "removed orphan cgroup");
                        removed += 1;
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), "failed to remove orphan cgroup: {e}");
                    }
                }
            }
        }
        removed
    }

    fn create_group_dirs(&self, rel: &Path) -> Result<()> {
        for sys in SUBSYSTEMS {
            let p = self.root.join(sys.name).join(rel);
            DirBuilder::new()
                .recursive(true)
                .mode(DIR_MODE)
                .create(&p)
                .map_err(|source| Error::CgroupCreate {
                    group: rel.display().to_string(),
                    subsystem: sys.name,
                    source,
                })?;
        }
        Ok(())
    }
}

impl Default for CgroupController {
    fn default() -> Self {
        Self::new()
    }
}

fn append_to_file(path: &Path, value: &str) -> Result<()> {
    let write = |path: &Path| -> std::io::Result<()> {
        let mut f = OpenOptions::new().append(true).open(path)?;
        f.write_all(value.as_bytes())?;
        Ok(())
    };
    write(path).map_err(|source| Error::CgroupWrite {
        path: path.to_path_buf(),
        source,
    })
}

fn remove_group_dir(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
