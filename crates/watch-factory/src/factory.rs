//! The watch factory: initializes and manages the shared per-kind watches.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use error_stack::Report;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::FactoryConfig;
use crate::error::FactoryError;
use crate::error::FactoryResult;
use crate::handler::EventCallbacks;
use crate::handler::HandlerId;
use crate::resource::ResourceKind;
use crate::transport::Transport;
use crate::watcher::ExistingSnapshotFn;
use crate::watcher::KindWatcher;

/// Initializes and manages the shared watches and their handler registries.
///
/// One watcher per configured kind. Handler ids are allocated from a counter
/// owned by this instance and are unique for the factory's lifetime.
pub struct WatchFactory {
    handler_counter: AtomicU64,
    watchers: HashMap<ResourceKind, Arc<KindWatcher>>,
}

impl std::fmt::Debug for WatchFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchFactory")
            .field("handler_counter", &self.handler_counter)
            .field("kinds", &self.watchers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl WatchFactory {
    /// Open a feed for every configured kind, start the watchers and block
    /// until each kind's mirror finishes its initial listing. Once `stop`
    /// fires, every watcher is shut down in the background.
    ///
    /// # Errors
    ///
    /// - [`FactoryError::InitialSyncFailed`] if any kind cannot reach a
    ///   consistent initial state; no watcher is left usable.
    pub async fn new(
        config: &FactoryConfig,
        transport: &dyn Transport,
        stop: CancellationToken,
    ) -> FactoryResult<Self> {
        let mut watchers: HashMap<ResourceKind, Arc<KindWatcher>> = HashMap::new();
        for &kind in &config.kinds {
            let feed = match transport.open(kind) {
                Ok(feed) => feed,
                Err(report) => {
                    Self::shutdown_all(&watchers).await;
                    return Err(report.change_context(FactoryError::InitialSyncFailed { kind }));
                }
            };
            let watcher = KindWatcher::new(
                kind,
                feed.mirror,
                config.event_queue_shards,
                stop.child_token(),
            );
            watcher.start(feed.events);
            watchers.insert(kind, watcher);
        }

        for (&kind, watcher) in &watchers {
            if let Err(report) = watcher.await_initial_sync().await {
                Self::shutdown_all(&watchers).await;
                return Err(report.change_context(FactoryError::InitialSyncFailed { kind }));
            }
        }
        info!(kinds = watchers.len(), "all caches synced");

        let on_stop: Vec<Arc<KindWatcher>> = watchers.values().cloned().collect();
        tokio::spawn(async move {
            stop.cancelled().await;
            for watcher in on_stop {
                watcher.shutdown().await;
            }
        });

        Ok(Self {
            handler_counter: AtomicU64::new(0),
            watchers,
        })
    }

    async fn shutdown_all(watchers: &HashMap<ResourceKind, Arc<KindWatcher>>) {
        for watcher in watchers.values() {
            watcher.shutdown().await;
        }
    }

    fn watcher(&self, kind: ResourceKind) -> FactoryResult<&Arc<KindWatcher>> {
        self.watchers
            .get(&kind)
            .ok_or_else(|| Report::new(FactoryError::UnknownKind { kind }))
    }

    /// Register an unfiltered handler for `kind`.
    pub fn add_handler(
        &self,
        kind: ResourceKind,
        callbacks: Box<dyn EventCallbacks>,
        on_existing: Option<ExistingSnapshotFn>,
    ) -> FactoryResult<HandlerId> {
        self.watcher(kind)?
            .register(&self.handler_counter, None, None, callbacks, on_existing)
    }

    /// Register a handler limited to a namespace and/or label selector. An
    /// empty namespace and an absent selector both mean "match all".
    pub fn add_filtered_handler(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
        callbacks: Box<dyn EventCallbacks>,
        on_existing: Option<ExistingSnapshotFn>,
    ) -> FactoryResult<HandlerId> {
        self.watcher(kind)?.register(
            &self.handler_counter,
            namespace,
            selector,
            callbacks,
            on_existing,
        )
    }

    /// Request removal of a handler. Delivery stops before this returns; the
    /// registry slot is reclaimed asynchronously.
    pub fn remove_handler(&self, kind: ResourceKind, id: HandlerId) -> FactoryResult<()> {
        self.watcher(kind)?.unregister(id)
    }

    /// Shut down every watcher and tombstone every handler.
    pub async fn shutdown(&self) {
        Self::shutdown_all(&self.watchers).await;
    }

    // Typed per-kind surface. Thin wrappers over the generic operations.

    /// Adds a handler run on every pod change.
    pub fn add_pod_handler(
        &self,
        callbacks: Box<dyn EventCallbacks>,
        on_existing: Option<ExistingSnapshotFn>,
    ) -> FactoryResult<HandlerId> {
        self.add_handler(ResourceKind::Pod, callbacks, on_existing)
    }

    /// Adds a handler run on pod changes matching the given filters.
    pub fn add_filtered_pod_handler(
        &self,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
        callbacks: Box<dyn EventCallbacks>,
        on_existing: Option<ExistingSnapshotFn>,
    ) -> FactoryResult<HandlerId> {
        self.add_filtered_handler(ResourceKind::Pod, namespace, selector, callbacks, on_existing)
    }

    /// Removes a pod handler.
    pub fn remove_pod_handler(&self, id: HandlerId) -> FactoryResult<()> {
        self.remove_handler(ResourceKind::Pod, id)
    }

    /// Adds a handler run on every service change.
    pub fn add_service_handler(
        &self,
        callbacks: Box<dyn EventCallbacks>,
        on_existing: Option<ExistingSnapshotFn>,
    ) -> FactoryResult<HandlerId> {
        self.add_handler(ResourceKind::Service, callbacks, on_existing)
    }

    /// Adds a handler run on service changes matching the given filters.
    pub fn add_filtered_service_handler(
        &self,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
        callbacks: Box<dyn EventCallbacks>,
        on_existing: Option<ExistingSnapshotFn>,
    ) -> FactoryResult<HandlerId> {
        self.add_filtered_handler(
            ResourceKind::Service,
            namespace,
            selector,
            callbacks,
            on_existing,
        )
    }

    /// Removes a service handler.
    pub fn remove_service_handler(&self, id: HandlerId) -> FactoryResult<()> {
        self.remove_handler(ResourceKind::Service, id)
    }

    /// Adds a handler run on every endpoints change.
    pub fn add_endpoints_handler(
        &self,
        callbacks: Box<dyn EventCallbacks>,
        on_existing: Option<ExistingSnapshotFn>,
    ) -> FactoryResult<HandlerId> {
        self.add_handler(ResourceKind::Endpoints, callbacks, on_existing)
    }

    /// Adds a handler run on endpoints changes matching the given filters.
    pub fn add_filtered_endpoints_handler(
        &self,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
        callbacks: Box<dyn EventCallbacks>,
        on_existing: Option<ExistingSnapshotFn>,
    ) -> FactoryResult<HandlerId> {
        self.add_filtered_handler(
            ResourceKind::Endpoints,
            namespace,
            selector,
            callbacks,
            on_existing,
        )
    }

    /// Removes an endpoints handler.
    pub fn remove_endpoints_handler(&self, id: HandlerId) -> FactoryResult<()> {
        self.remove_handler(ResourceKind::Endpoints, id)
    }

    /// Adds a handler run on every network policy change.
    pub fn add_policy_handler(
        &self,
        callbacks: Box<dyn EventCallbacks>,
        on_existing: Option<ExistingSnapshotFn>,
    ) -> FactoryResult<HandlerId> {
        self.add_handler(ResourceKind::NetworkPolicy, callbacks, on_existing)
    }

    /// Adds a handler run on network policy changes matching the given filters.
    pub fn add_filtered_policy_handler(
        &self,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
        callbacks: Box<dyn EventCallbacks>,
        on_existing: Option<ExistingSnapshotFn>,
    ) -> FactoryResult<HandlerId> {
        self.add_filtered_handler(
            ResourceKind::NetworkPolicy,
            namespace,
            selector,
            callbacks,
            on_existing,
        )
    }

    /// Removes a network policy handler.
    pub fn remove_policy_handler(&self, id: HandlerId) -> FactoryResult<()> {
        self.remove_handler(ResourceKind::NetworkPolicy, id)
    }

    /// Adds a handler run on every namespace change.
    pub fn add_namespace_handler(
        &self,
        callbacks: Box<dyn EventCallbacks>,
        on_existing: Option<ExistingSnapshotFn>,
    ) -> FactoryResult<HandlerId> {
        self.add_handler(ResourceKind::Namespace, callbacks, on_existing)
    }

    /// Adds a handler run on namespace changes matching the given filters.
    pub fn add_filtered_namespace_handler(
        &self,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
        callbacks: Box<dyn EventCallbacks>,
        on_existing: Option<ExistingSnapshotFn>,
    ) -> FactoryResult<HandlerId> {
        self.add_filtered_handler(
            ResourceKind::Namespace,
            namespace,
            selector,
            callbacks,
            on_existing,
        )
    }

    /// Removes a namespace handler.
    pub fn remove_namespace_handler(&self, id: HandlerId) -> FactoryResult<()> {
        self.remove_handler(ResourceKind::Namespace, id)
    }

    /// Adds a handler run on every node change.
    pub fn add_node_handler(
        &self,
        callbacks: Box<dyn EventCallbacks>,
        on_existing: Option<ExistingSnapshotFn>,
    ) -> FactoryResult<HandlerId> {
        self.add_handler(ResourceKind::Node, callbacks, on_existing)
    }

    /// Adds a handler run on node changes matching the given filters.
    pub fn add_filtered_node_handler(
        &self,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
        callbacks: Box<dyn EventCallbacks>,
        on_existing: Option<ExistingSnapshotFn>,
    ) -> FactoryResult<HandlerId> {
        self.add_filtered_handler(ResourceKind::Node, namespace, selector, callbacks, on_existing)
    }

    /// Removes a node handler.
    pub fn remove_node_handler(&self, id: HandlerId) -> FactoryResult<()> {
        self.remove_handler(ResourceKind::Node, id)
    }
}
