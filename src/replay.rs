use std::sync::{Arc, RwLock};

/// Shared append-only byte log behind every log pipeline.
///
/// The hub's broadcast worker is the only writer; any number of handles may
/// snapshot. A snapshot is an independent copy, so late subscribers replay
/// it at their own pace while the log keeps growing. Handles stay readable
/// after the hub stops, which is how terminated jobs serve their logs.
#[derive(Clone, Default, Debug)]
pub(crate) struct ReplayBuffer {
    inner: Arc<RwLock<Vec<u8>>>,
}

impl ReplayBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&self, chunk: &[u8]) {
        self.inner
            .write()
            .expect("replay buffer lock poisoned")
            .extend_from_slice(chunk);
    }

    /// An independent copy of everything written so far.
    pub(crate) fn snapshot(&self) -> Vec<u8> {
        self.inner
            .read()
            .expect("replay buffer lock poisoned")
            .clone()
    }
}
