use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::hub::{Hub, Subscription};
use crate::replay::ReplayBuffer;

/// Size of the chunks the reader publishes and snapshots replay in.
const CHUNK_SIZE: usize = 1024;

/// Fan-out pipeline for one output stream of a job.
///
/// A reader task drains the child's pipe into a [`Hub`], whose broadcast
/// worker appends every chunk to a [`ReplayBuffer`] and forwards it to the
/// current subscribers. Consumers attach through [`LogPipeline::stream`]
/// and receive either the snapshot alone or the snapshot seamlessly
/// followed by live data.
#[derive(Debug)]
pub(crate) struct LogPipeline {
    hub: Hub,
    buffer: ReplayBuffer,
    shutdown: CancellationToken,
    drained: CancellationToken,
}

impl LogPipeline {
    /// Wire a pipe end into a fresh hub and replay buffer. Spawns the
    /// broadcast worker and the reader task.
    pub(crate) fn new<R>(reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = ReplayBuffer::new();
        let (hub, worker) = Hub::channel(buffer.clone());
        tokio::spawn(worker.run());

        let shutdown = CancellationToken::new();
        let drained = CancellationToken::new();
        tokio::spawn(read_pipe(
            reader,
            hub.clone(),
            shutdown.clone(),
            drained.clone(),
        ));

        Self {
            hub,
            buffer,
            shutdown,
            drained,
        }
    }

    /// Resolves once the reader has consumed the pipe to EOF. The owning
    /// job awaits this before closing, so the tail written right before
    /// process exit still reaches the replay buffer.
    pub(crate) async fn drained(&self) {
        self.drained.cancelled().await;
    }

    /// Attach a consumer and return its receive channel.
    ///
    /// With `ongoing` the consumer gets everything captured so far followed
    /// by live chunks, and the channel closes when the pipeline does.
    /// Without it only the replay snapshot is delivered, then the channel
    /// closes. Cancelling `cancel` detaches the consumer promptly either
    /// way.
    pub(crate) fn stream(
        &self,
        ongoing: bool,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(1);
        if ongoing {
            tokio::spawn(forward_live(self.hub.clone(), self.buffer.clone(), tx, cancel));
        } else {
            tokio::spawn(forward_snapshot(self.buffer.snapshot(), tx, cancel));
        }
        rx
    }

    /// Stop the reader and the hub, closing every live consumer channel.
    /// Idempotent; the replay buffer stays readable for later snapshots.
    pub(crate) fn close(&self) {
        self.shutdown.cancel();
        self.hub.stop();
    }
}

/// Reader loop: publish the pipe's output in chunks until the pipe closes.
async fn read_pipe<R>(mut reader: R, hub: Hub, shutdown: CancellationToken, drained: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            res = reader.read(&mut buf) => res,
            () = shutdown.cancelled() => break,
        };
        match read {
            // The write side is gone; the stream is complete.
            Ok(0) => break,
            Ok(n) => hub.publish(buf[..n].to_vec()).await,
            Err(e) => {
                // Surface the failure to subscribers as a log line rather
                // than failing any RPC.
                tracing::warn!("log pipe read failed: {e}");
                hub.publish(format!("log read failed: {e}\n").into_bytes())
                    .await;
                break;
            }
        }
    }
    drained.cancel();
}

/// Consumer task for an ongoing stream: snapshot first, then live chunks.
async fn forward_live(
    hub: Hub,
    buffer: ReplayBuffer,
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) {
    let mut sub = match hub.subscribe().await {
        Ok(sub) => sub,
        // The pipeline closed between the caller's liveness check and now;
        // fall back to replaying what was captured.
        Err(_) => {
            forward_snapshot(buffer.snapshot(), tx, cancel).await;
            return;
        }
    };

    let snapshot = std::mem::take(&mut sub.snapshot);
    for chunk in snapshot.chunks(CHUNK_SIZE) {
        let delivered = tokio::select! {
            res = tx.send(chunk.to_vec()) => res.is_ok(),
            () = cancel.cancelled() => false,
        };
        if !delivered {
            detach(&hub, sub).await;
            return;
        }
    }

    loop {
        let chunk = tokio::select! {
            chunk = sub.rx.recv() => match chunk {
                Some(chunk) => chunk,
                // Hub stopped; dropping tx closes the consumer channel.
                None => return,
            },
            () = cancel.cancelled() => {
                detach(&hub, sub).await;
                return;
            }
        };
        let delivered = tokio::select! {
            res = tx.send(chunk) => res.is_ok(),
            () = cancel.cancelled() => false,
        };
        if !delivered {
            detach(&hub, sub).await;
            return;
        }
    }
}

/// Release a subscription. The receiver is dropped before the hub is told:
/// a broadcast mid-delivery into this subscriber's slot unblocks on the
/// drop, so the unsubscribe can never wedge behind it.
async fn detach(hub: &Hub, sub: Subscription) {
    let Subscription { id, rx, .. } = sub;
    drop(rx);
    hub.unsubscribe(id).await;
}

/// Consumer task for a snapshot-only stream: replay, then close.
async fn forward_snapshot(snapshot: Vec<u8>, tx: mpsc::Sender<Vec<u8>>, cancel: CancellationToken) {
    for chunk in snapshot.chunks(CHUNK_SIZE) {
        let delivered = tokio::select! {
            res = tx.send(chunk.to_vec()) => res.is_ok(),
            () = cancel.cancelled() => false,
        };
        if !delivered {
            return;
        }
    }
}
