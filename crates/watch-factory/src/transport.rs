//! The seam between the factory and the cluster list/watch machinery.
//!
//! A [`Transport`] hands out one [`WatchFeed`] per resource kind: an event
//! stream plus read access to the kind's local mirror. The mirror is written
//! only by the transport machinery that owns it; the factory reads it to
//! build registration snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use tokio::sync::mpsc;

use crate::error::FactoryResult;
use crate::resource::DeletedObject;
use crate::resource::KindedObject;
use crate::resource::ResourceKind;

/// Buffered events between a feed task and its watcher pump. A full buffer
/// blocks the feed, extending shard backpressure into the transport.
pub(crate) const FEED_BUFFER: usize = 32;

/// Notifications produced by one kind's list/watch feed.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// A new or re-listed object; also used for periodic resync re-delivery.
    Added(KindedObject),
    /// An object changed. `old` is the previously mirrored state if known.
    Updated {
        old: Option<KindedObject>,
        new: KindedObject,
    },
    /// An object is gone, possibly known only through a stale placeholder.
    Deleted(DeletedObject),
    /// The initial listing is fully mirrored.
    SyncComplete,
    /// The feed lost its watch. Fatal before `SyncComplete`; informational
    /// afterwards, since the underlying client re-lists on its own.
    Desync { message: String },
}

/// Read access to a kind's local mirror.
pub trait Mirror: Send + Sync {
    /// Every currently mirrored object.
    fn list(&self) -> Vec<KindedObject>;
}

/// One kind's feed: the event stream plus the mirror behind it.
pub struct WatchFeed {
    pub kind: ResourceKind,
    pub events: mpsc::Receiver<FeedEvent>,
    pub mirror: Arc<dyn Mirror>,
}

/// A source of per-kind feeds: the cluster client, or a test double.
pub trait Transport: Send + Sync {
    /// Open the feed for `kind`, spawning whatever machinery keeps it live.
    fn open(&self, kind: ResourceKind) -> FactoryResult<WatchFeed>;
}

/// Shared-map mirror used by the kube transport and by test transports.
#[derive(Default)]
pub struct MirrorBuffer {
    objects: RwLock<HashMap<String, KindedObject>>,
}

impl MirrorBuffer {
    /// Insert or replace; returns the previously mirrored object.
    pub fn upsert(&self, obj: KindedObject) -> Option<KindedObject> {
        let key = obj.store_key();
        self.objects
            .write()
            .expect("mirror lock poisoned")
            .insert(key, obj)
    }

    pub fn remove(&self, key: &str) -> Option<KindedObject> {
        self.objects
            .write()
            .expect("mirror lock poisoned")
            .remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .read()
            .expect("mirror lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

impl Mirror for MirrorBuffer {
    fn list(&self) -> Vec<KindedObject> {
        self.objects
            .read()
            .expect("mirror lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}
