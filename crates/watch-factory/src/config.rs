//! Factory configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::resource::ResourceKind;

/// Tunables for the watch layer.
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Resource kinds to watch.
    pub kinds: Vec<ResourceKind>,
    /// How often mirrored objects are re-delivered as adds. None of the
    /// consuming logic has update-loss races that need a tight interval, and
    /// a tighter one just spins on every resource.
    pub resync_interval: Duration,
    /// Number of per-object hashed queues for ordered kinds.
    pub event_queue_shards: usize,
    /// Restrict namespaced kinds to one namespace; all namespaces if unset.
    pub watch_namespace: Option<String>,
    /// Explicit kubeconfig path; in-cluster or `~/.kube/config` if unset.
    pub kubeconfig: Option<PathBuf>,
}

impl FactoryConfig {
    /// Create a config with default parameters.
    pub fn new() -> Self {
        Self {
            kinds: ResourceKind::ALL.to_vec(),
            resync_interval: Duration::from_secs(12 * 60 * 60),
            event_queue_shards: 10,
            watch_namespace: None,
            kubeconfig: None,
        }
    }

    /// Set the kinds to watch.
    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = ResourceKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    /// Set the resync interval.
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Set the shard count for ordered kinds.
    pub fn with_event_queue_shards(mut self, shards: usize) -> Self {
        self.event_queue_shards = shards;
        self
    }

    /// Watch a single namespace instead of the whole cluster.
    pub fn with_watch_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.watch_namespace = Some(namespace.into());
        self
    }

    /// Use an explicit kubeconfig file.
    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self::new()
    }
}
