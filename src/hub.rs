use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::replay::ReplayBuffer;

/// A live subscription handed out by [`Hub::subscribe`].
///
/// `snapshot` holds every byte published before the subscription attached;
/// `rx` yields every chunk published after it. Together they form one
/// seamless sequence with no gap and no duplicate, because the broadcast
/// worker answers the subscribe in the same loop that appends and delivers.
pub(crate) struct Subscription {
    pub(crate) id: u64,
    pub(crate) snapshot: Vec<u8>,
    pub(crate) rx: mpsc::Receiver<Vec<u8>>,
}

enum Command {
    Publish(Vec<u8>),
    Subscribe { reply: oneshot::Sender<Subscription> },
    Unsubscribe { id: u64 },
}

/// Handle to a one-producer / many-consumer byte broadcaster.
///
/// All mutations are serialised through an inbox consumed by a single
/// [`HubWorker`]. Every handle operation races the stop token, so calls
/// made after [`Hub::stop`] return promptly instead of deadlocking on a
/// worker that is no longer draining the inbox.
#[derive(Clone, Debug)]
pub(crate) struct Hub {
    tx: mpsc::Sender<Command>,
    stop: CancellationToken,
}

impl Hub {
    /// Build a hub whose worker appends every published chunk to `buffer`.
    /// The caller must spawn [`HubWorker::run`] exactly once.
    pub(crate) fn channel(buffer: ReplayBuffer) -> (Hub, HubWorker) {
        let (tx, inbox) = mpsc::channel(1);
        let stop = CancellationToken::new();
        let hub = Hub { tx, stop: stop.clone() };
        let worker = HubWorker {
            inbox,
            stop,
            buffer,
            subs: HashMap::new(),
            next_id: 0,
        };
        (hub, worker)
    }

    /// Publish a chunk to every current subscriber. Blocks while any
    /// subscriber is slow; this is the source of backpressure. After stop
    /// the chunk is silently dropped.
    pub(crate) async fn publish(&self, chunk: Vec<u8>) {
        tokio::select! {
            biased;
            () = self.stop.cancelled() => {}
            res = self.tx.send(Command::Publish(chunk)) => {
                let _ = res;
            }
        }
    }

    /// Atomically snapshot the replay log and attach a live receiver.
    pub(crate) async fn subscribe(&self) -> Result<Subscription> {
        let (reply, response) = oneshot::channel();
        tokio::select! {
            biased;
            () = self.stop.cancelled() => return Err(Error::HubStopped),
            res = self.tx.send(Command::Subscribe { reply }) => {
                if res.is_err() {
                    return Err(Error::HubStopped);
                }
            }
        }
        response.await.map_err(|_| Error::HubStopped)
    }

    /// Detach a subscriber and close its receiver. Unknown or already
    /// removed ids are a no-op, as is calling this after stop.
    pub(crate) async fn unsubscribe(&self, id: u64) {
        tokio::select! {
            biased;
            () = self.stop.cancelled() => {}
            res = self.tx.send(Command::Unsubscribe { id }) => {
                let _ = res;
            }
        }
    }

    /// Terminate the broadcast worker and close every subscriber channel.
    /// Idempotent.
    pub(crate) fn stop(&self) {
        self.stop.cancel();
    }
}

/// The single broadcast loop behind a [`Hub`].
pub(crate) struct HubWorker {
    inbox: mpsc::Receiver<Command>,
    stop: CancellationToken,
    buffer: ReplayBuffer,
    subs: HashMap<u64, mpsc::Sender<Vec<u8>>>,
    next_id: u64,
}

impl HubWorker {
    pub(crate) async fn run(mut self) {
        loop {
            let cmd = tokio::select! {
                biased;
                () = self.stop.cancelled() => break,
                cmd = self.inbox.recv() => match cmd {
                    Some(cmd) => cmd,
                    // Every handle is gone; nothing can arrive anymore.
                    None => break,
                },
            };

            match cmd {
                Command::Publish(chunk) => {
                    self.buffer.append(&chunk);
                    if !self.deliver(chunk).await {
                        break;
                    }
                }
                Command::Subscribe { reply } => {
                    self.next_id += 1;
                    let id = self.next_id;
                    // A single slot per subscriber: the worker parks on a
                    // full one rather than buffering further.
                    let (tx, rx) = mpsc::channel(1);
                    let sub = Subscription {
                        id,
                        snapshot: self.buffer.snapshot(),
                        rx,
                    };
                    if reply.send(sub).is_ok() {
                        self.subs.insert(id, tx);
                    }
                }
                Command::Unsubscribe { id } => {
                    self.subs.remove(&id);
                }
            }
        }
        // Dropping the senders closes every subscriber's receive channel,
        // which is how subscribers observe end of stream.
        self.subs.clear();
    }

    /// Send a chunk to every subscriber, waiting out slow ones. Returns
    /// false when stop interrupted the delivery.
    async fn deliver(&mut self, chunk: Vec<u8>) -> bool {
        let mut dead = Vec::new();
        for (&id, tx) in &self.subs {
            let sent = tokio::select! {
                biased;
                () = self.stop.cancelled() => return false,
                res = tx.send(chunk.clone()) => res.is_ok(),
            };
            if !sent {
                // Receiver dropped without unsubscribing.
                dead.push(id);
            }
        }
        for id in dead {
            self.subs.remove(&id);
        }
        true
    }
}
