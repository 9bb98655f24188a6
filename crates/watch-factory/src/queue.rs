//! Ordered event queues: per-object hashed shards, one consumer per shard.

use std::hash::Hasher;
use std::sync::Arc;
use std::sync::Mutex;

use rustc_hash::FxHasher;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::handler::HandlerRegistry;
use crate::resource::KindedObject;
use crate::resource::ResourceKind;

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventKind {
    Add,
    Update,
    Delete,
}

/// One notification flowing from the transport toward the handlers.
#[derive(Debug, Clone)]
pub(crate) struct Event {
    pub kind: EventKind,
    pub obj: KindedObject,
    pub old: Option<KindedObject>,
}

/// Stable shard index for an object identity. Hashes `namespace/name` (name
/// alone for cluster-scoped objects) so every event for one object lands on
/// the same shard across the object's whole lifetime.
pub(crate) fn shard_index(namespace: &str, name: &str, shards: usize) -> usize {
    let mut hasher = FxHasher::default();
    if !namespace.is_empty() {
        hasher.write(namespace.as_bytes());
        hasher.write(b"/");
    }
    hasher.write(name.as_bytes());
    (hasher.finish() % shards as u64) as usize
}

/// The shard set for one ordered kind.
pub(crate) struct EventQueues {
    senders: Mutex<Vec<mpsc::Sender<Event>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EventQueues {
    /// Spawn `shards` bounded queues, each drained by its own worker task.
    pub(crate) fn spawn(
        kind: ResourceKind,
        shards: usize,
        registry: Arc<HandlerRegistry>,
        token: CancellationToken,
    ) -> Self {
        let mut senders = Vec::with_capacity(shards);
        let mut workers = Vec::with_capacity(shards);
        for shard in 0..shards {
            // Capacity 1: a busy worker blocks the producer, pushing
            // backpressure into the watch pump instead of dropping events.
            let (tx, rx) = mpsc::channel(1);
            senders.push(tx);
            workers.push(tokio::spawn(run_worker(
                kind,
                shard,
                rx,
                Arc::clone(&registry),
                token.clone(),
            )));
        }
        Self {
            senders: Mutex::new(senders),
            workers: Mutex::new(workers),
        }
    }

    /// Route an event to its object's shard, waiting while the shard is full.
    pub(crate) async fn dispatch(&self, namespace: &str, name: &str, event: Event) {
        let sender = {
            let senders = self.senders.lock().expect("event queue lock poisoned");
            if senders.is_empty() {
                return;
            }
            senders[shard_index(namespace, name, senders.len())].clone()
        };
        // A send failure means the queues were closed underneath us.
        let _ = sender.send(event).await;
    }

    /// Close every queue and wait for the workers to finish draining.
    pub(crate) async fn close(&self) {
        self.senders
            .lock()
            .expect("event queue lock poisoned")
            .clear();
        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .expect("event queue lock poisoned")
            .drain(..)
            .collect();
        for worker in workers {
            let _ = worker.await;
        }
    }
}

async fn run_worker(
    kind: ResourceKind,
    shard: usize,
    mut rx: mpsc::Receiver<Event>,
    registry: Arc<HandlerRegistry>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                for handler in registry.snapshot() {
                    match event.kind {
                        EventKind::Add => handler.deliver_add(&event.obj),
                        EventKind::Update => handler.deliver_update(event.old.as_ref(), &event.obj),
                        EventKind::Delete => handler.deliver_delete(&event.obj),
                    }
                }
            }
        }
    }
    debug!(%kind, shard, "event queue worker stopped");
}
