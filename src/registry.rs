use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use crate::error::{Error, Result};
use crate::job::Job;

/// How often the sweeper wakes up when a TTL is configured. With a TTL the
/// worst-case retention is `ttl + interval + sweep duration`, which is
/// acceptable slack for freeing memory.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

type JobMap = Arc<RwLock<HashMap<String, Arc<Job>>>>;

/// Concurrent id → job map.
///
/// With a TTL, a background sweeper evicts terminated entries once they
/// have been dead longer than the TTL — unless someone outside the
/// registry still holds the job (a streaming handler, for instance), in
/// which case eviction is deferred to a later sweep.
pub struct Registry {
    jobs: JobMap,
    ttl: Option<Duration>,
}

impl Registry {
    /// A registry that retains terminated jobs forever.
    pub fn new() -> Self {
        Self {
            jobs: Arc::default(),
            ttl: None,
        }
    }

    /// A registry that reaps terminated jobs after `ttl`. Spawns the
    /// sweeper, so this must be called within a tokio runtime.
    pub fn with_ttl(ttl: Duration) -> Self {
        let registry = Self {
            jobs: Arc::default(),
            ttl: Some(ttl),
        };

        let jobs = Arc::clone(&registry.jobs);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                Self::sweep(&jobs, ttl);
            }
        });

        registry
    }

    /// Register a job under its id. Ids are unique; a collision is an
    /// error.
    pub fn put(&self, job: Arc<Job>) -> Result<()> {
        let id = job.id.to_string();
        let mut jobs = self.write();
        if jobs.contains_key(&id) {
            return Err(Error::AlreadyExists(id));
        }
        jobs.insert(id, job);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<Job>> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn sweep(jobs: &JobMap, ttl: Duration) {
        let now = SystemTime::now();
        let mut jobs = jobs.write().expect("registry lock poisoned");
        jobs.retain(|id, job| {
            if !Self::expired(job, ttl, now) {
                return true;
            }
            // The map's own reference is the only one left; nobody is
            // streaming from this job.
            if Arc::strong_count(job) > 1 {
                tracing::debug!(id, "expired job still referenced, deferring eviction");
                return true;
            }
            tracing::debug!(id, "evicting expired job");
            false
        });
    }

    fn expired(job: &Arc<Job>, ttl: Duration, now: SystemTime) -> bool {
        let state = job.status();
        if !state.status.is_terminal() {
            return false;
        }
        match state.exited_at {
            Some(exited_at) => match now.duration_since(exited_at) {
                Ok(age) => age > ttl,
                Err(_) => false,
            },
            None => false,
        }
    }

    #[cfg(test)]
    fn sweep_once(&self) {
        if let Some(ttl) = self.ttl {
            Self::sweep(&self.jobs, ttl);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Job>>> {
        self.jobs.read().expect("registry lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Job>>> {
        self.jobs.write().expect("registry lock poisoned")
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
