//! Per-kind watcher: mirror access, handler registry and the event pump.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use error_stack::Report;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::FactoryError;
use crate::error::FactoryResult;
use crate::handler::EventCallbacks;
use crate::handler::Handler;
use crate::handler::HandlerId;
use crate::handler::HandlerRegistry;
use crate::queue::Event;
use crate::queue::EventKind;
use crate::queue::EventQueues;
use crate::resource::checked_meta;
use crate::resource::recover_deleted;
use crate::resource::CompiledFilter;
use crate::resource::KindedObject;
use crate::resource::ResourceKind;
use crate::transport::FeedEvent;
use crate::transport::Mirror;

/// Callback receiving the filtered set of already-mirrored objects at
/// registration time, before those objects are replayed as synthetic adds.
pub type ExistingSnapshotFn = Box<dyn FnOnce(Vec<KindedObject>) + Send>;

/// Lifecycle of a per-kind watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatcherState {
    Uninitialized,
    Syncing,
    Ready,
    ShuttingDown,
    Stopped,
}

/// Owns one kind's mirror handle, handler registry and, for ordered kinds,
/// the event queue shards.
pub(crate) struct KindWatcher {
    kind: ResourceKind,
    registry: Arc<HandlerRegistry>,
    mirror: Arc<dyn Mirror>,
    queues: Option<EventQueues>,
    state: watch::Sender<WatcherState>,
    pump: Mutex<Option<JoinHandle<()>>>,
    token: CancellationToken,
}

impl KindWatcher {
    pub(crate) fn new(
        kind: ResourceKind,
        mirror: Arc<dyn Mirror>,
        queue_shards: usize,
        token: CancellationToken,
    ) -> Arc<Self> {
        let registry = Arc::new(HandlerRegistry::new(kind));
        let queues = kind.is_queued().then(|| {
            EventQueues::spawn(kind, queue_shards, Arc::clone(&registry), token.clone())
        });
        let (state, _) = watch::channel(WatcherState::Uninitialized);
        Arc::new(Self {
            kind,
            registry,
            mirror,
            queues,
            state,
            pump: Mutex::new(None),
            token,
        })
    }

    /// Begin consuming the transport feed.
    pub(crate) fn start(self: &Arc<Self>, events: mpsc::Receiver<FeedEvent>) {
        self.state.send_replace(WatcherState::Syncing);
        let watcher = Arc::clone(self);
        let handle = tokio::spawn(async move { watcher.pump(events).await });
        *self.pump.lock().expect("watcher pump lock poisoned") = Some(handle);
    }

    /// Block until the mirror's initial listing has fully populated.
    pub(crate) async fn await_initial_sync(&self) -> FactoryResult<()> {
        let mut state = self.state.subscribe();
        loop {
            match *state.borrow_and_update() {
                WatcherState::Ready => return Ok(()),
                WatcherState::ShuttingDown | WatcherState::Stopped => {
                    return Err(Report::new(FactoryError::SyncFailed { kind: self.kind }));
                }
                WatcherState::Uninitialized | WatcherState::Syncing => {}
            }
            if state.changed().await.is_err() {
                return Err(Report::new(FactoryError::SyncFailed { kind: self.kind }));
            }
        }
    }

    async fn pump(self: Arc<Self>, mut events: mpsc::Receiver<FeedEvent>) {
        info!(kind = %self.kind, "watcher started");
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        FeedEvent::SyncComplete => {
                            self.state.send_if_modified(|state| {
                                if *state == WatcherState::Syncing {
                                    *state = WatcherState::Ready;
                                    true
                                } else {
                                    false
                                }
                            });
                            debug!(kind = %self.kind, "cache synced");
                        }
                        FeedEvent::Desync { message } => {
                            if *self.state.borrow() == WatcherState::Syncing {
                                error!(kind = %self.kind, %message, "transport desynced before initial sync");
                                break;
                            }
                            warn!(kind = %self.kind, %message, "transport desynced; watch will re-list");
                        }
                        FeedEvent::Added(obj) => {
                            self.route(Event { kind: EventKind::Add, obj, old: None }).await;
                        }
                        FeedEvent::Updated { old, new } => {
                            self.route(Event { kind: EventKind::Update, obj: new, old }).await;
                        }
                        FeedEvent::Deleted(deleted) => match recover_deleted(self.kind, deleted) {
                            Ok(obj) => {
                                self.route(Event { kind: EventKind::Delete, obj, old: None }).await;
                            }
                            Err(report) => {
                                error!(kind = %self.kind, "dropping delete event: {report:?}");
                            }
                        },
                    }
                }
            }
        }
        // A pump that dies before readiness fails the initial sync.
        self.state.send_if_modified(|state| {
            if matches!(*state, WatcherState::Uninitialized | WatcherState::Syncing) {
                *state = WatcherState::Stopped;
                true
            } else {
                false
            }
        });
        info!(kind = %self.kind, "watcher stopped");
    }

    async fn route(&self, event: Event) {
        let (namespace, name) = match checked_meta(self.kind, &event.obj) {
            Ok(meta) => (
                meta.namespace.clone().unwrap_or_default(),
                meta.name.clone().unwrap_or_default(),
            ),
            Err(report) => {
                error!(kind = %self.kind, "dropping event: {report:?}");
                return;
            }
        };
        match &self.queues {
            Some(queues) => queues.dispatch(&namespace, &name, event).await,
            None => {
                // Direct kinds fan out under the delivery lock: registration
                // and removal wait for in-flight delivery to finish.
                let handlers = self.registry.delivery_lock();
                for handler in handlers.values() {
                    match event.kind {
                        EventKind::Add => handler.deliver_add(&event.obj),
                        EventKind::Update => {
                            handler.deliver_update(event.old.as_ref(), &event.obj)
                        }
                        EventKind::Delete => handler.deliver_delete(&event.obj),
                    }
                }
            }
        }
    }

    /// Register a handler and replay the currently mirrored objects to it.
    ///
    /// The filtered snapshot goes to `on_existing` first, then the same
    /// snapshot is delivered as synthetic adds once the handler is in the
    /// registry, emulating what a fresh, non-shared watch would have seen.
    pub(crate) fn register(
        &self,
        counter: &AtomicU64,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
        callbacks: Box<dyn EventCallbacks>,
        on_existing: Option<ExistingSnapshotFn>,
    ) -> FactoryResult<HandlerId> {
        let filter = CompiledFilter::compile(namespace, selector)?;

        let existing = self.mirror.list();
        if let Some(process_existing) = on_existing {
            let matching: Vec<KindedObject> = existing
                .iter()
                .filter(|obj| filter.matches(obj))
                .cloned()
                .collect();
            process_existing(matching);
        }

        let id = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let handler = Arc::new(Handler::new(id, filter, callbacks));
        self.registry.add(handler, &existing);
        Ok(id)
    }

    /// Tombstone a handler. Delivery stops immediately; the registry slot is
    /// reclaimed asynchronously, so this is safe to call from a callback.
    pub(crate) fn unregister(&self, id: HandlerId) -> FactoryResult<()> {
        let handler = self
            .registry
            .lookup(id)
            .ok_or_else(|| Report::new(FactoryError::UnknownHandler { id }))?;
        handler.kill()?;
        debug!(kind = %self.kind, id, "sending event handler for removal");
        self.registry.remove_deferred(id);
        Ok(())
    }

    /// Tombstone every handler, drain the queues and stop the pump.
    pub(crate) async fn shutdown(&self) {
        let initiated = self.state.send_if_modified(|state| {
            if matches!(*state, WatcherState::ShuttingDown | WatcherState::Stopped) {
                false
            } else {
                *state = WatcherState::ShuttingDown;
                true
            }
        });
        if !initiated {
            return;
        }

        info!(kind = %self.kind, "shutting down watcher");
        self.registry.clear();
        if let Some(queues) = &self.queues {
            queues.close().await;
        }
        self.token.cancel();
        let pump = self.pump.lock().expect("watcher pump lock poisoned").take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        self.state.send_replace(WatcherState::Stopped);
    }
}
