//! Kubernetes list/watch transport backed by kube-rs.
//!
//! One feed task per kind: the task consumes a `kube::runtime::watcher`
//! stream, maintains the kind's mirror, and forwards [`FeedEvent`]s to the
//! owning watcher. Watch retry and re-listing stay inside the kube watcher.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use error_stack::ResultExt;
use futures::StreamExt;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::Api;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::runtime::watcher::watcher;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::watcher::Event as WatcherEvent;
use kube::Client;
use kube::Config;
use kube::Resource;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::time::interval_at;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::config::FactoryConfig;
use crate::error::FactoryError;
use crate::error::FactoryResult;
use crate::resource::DeletedObject;
use crate::resource::KindedObject;
use crate::resource::ResourceKind;
use crate::transport::FeedEvent;
use crate::transport::Mirror;
use crate::transport::MirrorBuffer;
use crate::transport::Transport;
use crate::transport::WatchFeed;
use crate::transport::FEED_BUFFER;

/// List/watch transport talking to a real API server.
pub struct KubeTransport {
    client: Client,
    namespace: Option<String>,
    resync_interval: Duration,
    token: CancellationToken,
}

impl KubeTransport {
    /// Connect using the configured kubeconfig, or the in-cluster/default
    /// config when none is set.
    pub async fn connect(
        config: &FactoryConfig,
        token: CancellationToken,
    ) -> FactoryResult<Self> {
        let client = match &config.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).change_context(
                    FactoryError::ConnectionFailed {
                        message: format!("failed to read kubeconfig file: {}", path.display()),
                    },
                )?;
                let client_config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .change_context(FactoryError::ConnectionFailed {
                            message: format!(
                                "failed to build config from kubeconfig: {}",
                                path.display()
                            ),
                        })?;
                Client::try_from(client_config).change_context(
                    FactoryError::ConnectionFailed {
                        message: "failed to create client from kubeconfig".to_string(),
                    },
                )?
            }
            None => {
                Client::try_default()
                    .await
                    .change_context(FactoryError::ConnectionFailed {
                        message: "failed to create Kubernetes client".to_string(),
                    })?
            }
        };
        Ok(Self {
            client,
            namespace: config.watch_namespace.clone(),
            resync_interval: config.resync_interval,
            token,
        })
    }

    fn namespaced_api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn spawn_feed<K>(&self, kind: ResourceKind, api: Api<K>) -> WatchFeed
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
        KindedObject: From<K>,
    {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let mirror = Arc::new(MirrorBuffer::default());
        tokio::spawn(run_feed(
            kind,
            api,
            tx,
            Arc::clone(&mirror),
            self.resync_interval,
            self.token.clone(),
        ));
        WatchFeed {
            kind,
            events: rx,
            mirror,
        }
    }
}

impl Transport for KubeTransport {
    fn open(&self, kind: ResourceKind) -> FactoryResult<WatchFeed> {
        Ok(match kind {
            ResourceKind::Pod => self.spawn_feed(kind, self.namespaced_api::<Pod>()),
            ResourceKind::Service => self.spawn_feed(kind, self.namespaced_api::<Service>()),
            ResourceKind::Endpoints => self.spawn_feed(kind, self.namespaced_api::<Endpoints>()),
            ResourceKind::NetworkPolicy => {
                self.spawn_feed(kind, self.namespaced_api::<NetworkPolicy>())
            }
            ResourceKind::Namespace => {
                self.spawn_feed(kind, Api::<Namespace>::all(self.client.clone()))
            }
            ResourceKind::Node => self.spawn_feed(kind, Api::<Node>::all(self.client.clone())),
        })
    }
}

async fn run_feed<K>(
    kind: ResourceKind,
    api: Api<K>,
    events: mpsc::Sender<FeedEvent>,
    mirror: Arc<MirrorBuffer>,
    resync_interval: Duration,
    token: CancellationToken,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    KindedObject: From<K>,
{
    let mut stream = watcher(api, WatcherConfig::default()).boxed();
    let mut resync = interval_at(Instant::now() + resync_interval, resync_interval);
    let mut synced = false;
    info!(%kind, "watch feed started");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = resync.tick() => {
                // Periodic re-delivery of adds for unchanged objects, so
                // subscribers recover from notifications they missed.
                for obj in mirror.list() {
                    if events.send(FeedEvent::Added(obj)).await.is_err() {
                        return;
                    }
                }
            }
            item = stream.try_next() => match item {
                Ok(Some(WatcherEvent::Applied(object))) => {
                    let new = KindedObject::from(object);
                    let old = mirror.upsert(new.clone());
                    let event = match old {
                        Some(old) => FeedEvent::Updated { old: Some(old), new },
                        None => FeedEvent::Added(new),
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                Ok(Some(WatcherEvent::Deleted(object))) => {
                    let obj = KindedObject::from(object);
                    mirror.remove(&obj.store_key());
                    if events
                        .send(FeedEvent::Deleted(DeletedObject::Full(obj)))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(Some(WatcherEvent::Restarted(list))) => {
                    if relist(&events, &mirror, list).await.is_err() {
                        return;
                    }
                    if !synced {
                        synced = true;
                        if events.send(FeedEvent::SyncComplete).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(None) => {
                    warn!(%kind, "watch stream ended");
                    let _ = events
                        .send(FeedEvent::Desync {
                            message: "watch stream ended".to_string(),
                        })
                        .await;
                    break;
                }
                Err(error) => {
                    // The watcher re-lists and resumes on its own; before the
                    // first successful listing this fails the initial sync.
                    warn!(%kind, "watch stream error: {error}");
                    if !synced {
                        let _ = events
                            .send(FeedEvent::Desync {
                                message: error.to_string(),
                            })
                            .await;
                    }
                }
            }
        }
    }
    info!(%kind, "watch feed stopped");
}

/// Reconcile a full re-list against the mirror: adds for new objects,
/// updates for survivors, deletes for objects that vanished while the watch
/// was down.
async fn relist<K>(
    events: &mpsc::Sender<FeedEvent>,
    mirror: &MirrorBuffer,
    list: Vec<K>,
) -> Result<(), mpsc::error::SendError<FeedEvent>>
where
    KindedObject: From<K>,
{
    let mut seen = HashSet::new();
    for object in list {
        let new = KindedObject::from(object);
        seen.insert(new.store_key());
        let old = mirror.upsert(new.clone());
        let event = match old {
            Some(old) => FeedEvent::Updated {
                old: Some(old),
                new,
            },
            None => FeedEvent::Added(new),
        };
        events.send(event).await?;
    }
    for key in mirror.keys() {
        if !seen.contains(&key) {
            if let Some(gone) = mirror.remove(&key) {
                events
                    .send(FeedEvent::Deleted(DeletedObject::Full(gone)))
                    .await?;
            }
        }
    }
    Ok(())
}
