//! Subscriber callbacks and the tombstoned handler registry.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::RwLockWriteGuard;

use error_stack::Report;
use tracing::debug;
use tracing::warn;

use crate::error::FactoryError;
use crate::resource::CompiledFilter;
use crate::resource::KindedObject;
use crate::resource::ResourceKind;

/// Process-unique handler identifier. Allocated by the factory, never reused.
pub type HandlerId = u64;

/// Subscriber callbacks for one resource kind.
///
/// Callbacks run synchronously on the delivery path. For direct kinds that
/// path holds the kind's registry lock, so a slow callback delays every other
/// handler of the kind; hand long work off to a task or channel.
pub trait EventCallbacks: Send + Sync {
    fn on_add(&self, _obj: &KindedObject) {}
    fn on_update(&self, _old: Option<&KindedObject>, _new: &KindedObject) {}
    fn on_delete(&self, _obj: &KindedObject) {}
}

/// Closure-based [`EventCallbacks`] adapter for subscribers that do not want
/// a dedicated type.
#[derive(Default)]
pub struct HandlerFns {
    pub add: Option<Box<dyn Fn(&KindedObject) + Send + Sync>>,
    pub update: Option<Box<dyn Fn(Option<&KindedObject>, &KindedObject) + Send + Sync>>,
    pub delete: Option<Box<dyn Fn(&KindedObject) + Send + Sync>>,
}

impl EventCallbacks for HandlerFns {
    fn on_add(&self, obj: &KindedObject) {
        if let Some(add) = &self.add {
            add(obj);
        }
    }

    fn on_update(&self, old: Option<&KindedObject>, new: &KindedObject) {
        if let Some(update) = &self.update {
            update(old, new);
        }
    }

    fn on_delete(&self, obj: &KindedObject) {
        if let Some(delete) = &self.delete {
            delete(obj);
        }
    }
}

/// One registered subscription: callbacks, filter and the tombstone gating
/// every delivery.
pub(crate) struct Handler {
    id: HandlerId,
    filter: CompiledFilter,
    callbacks: Box<dyn EventCallbacks>,
    // Tombstone: once set, no callback ever fires again, including for
    // events already in flight toward this handler.
    dead: AtomicBool,
}

impl Handler {
    pub(crate) fn new(
        id: HandlerId,
        filter: CompiledFilter,
        callbacks: Box<dyn EventCallbacks>,
    ) -> Self {
        Self {
            id,
            filter,
            callbacks,
            dead: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> HandlerId {
        self.id
    }

    fn alive(&self) -> bool {
        !self.dead.load(Ordering::Acquire)
    }

    /// Transition alive -> dead, exactly once.
    pub(crate) fn kill(&self) -> Result<(), Report<FactoryError>> {
        if self
            .dead
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Report::new(FactoryError::AlreadyDead { id: self.id }));
        }
        Ok(())
    }

    pub(crate) fn deliver_add(&self, obj: &KindedObject) {
        if self.alive() && self.filter.matches(obj) {
            self.callbacks.on_add(obj);
        }
    }

    /// Filtered update delivery. An object crossing the filter boundary is
    /// surfaced as an add or delete so the subscriber's membership view stays
    /// consistent.
    pub(crate) fn deliver_update(&self, old: Option<&KindedObject>, new: &KindedObject) {
        if !self.alive() {
            return;
        }
        let newer = self.filter.matches(new);
        let older = old.filter(|o| self.filter.matches(o));
        match (older, newer) {
            (Some(old), true) => self.callbacks.on_update(Some(old), new),
            (None, true) => self.callbacks.on_add(new),
            (Some(old), false) => self.callbacks.on_delete(old),
            (None, false) => {}
        }
    }

    pub(crate) fn deliver_delete(&self, obj: &KindedObject) {
        if self.alive() && self.filter.matches(obj) {
            self.callbacks.on_delete(obj);
        }
    }
}

/// Handler registry for one resource kind.
///
/// Two views of the same membership. `delivery` is the map the event paths
/// iterate; it stays write-locked for the whole of a direct fan-out, so
/// registration and removal wait for in-flight delivery. `index` serves
/// register/unregister lookups and is never held while subscriber code runs,
/// which lets a callback request its own removal without re-entering the
/// delivery lock. Membership only shrinks through the deferred removal task;
/// the tombstone decides whether a still-present handler may be invoked.
pub(crate) struct HandlerRegistry {
    kind: ResourceKind,
    delivery: RwLock<HashMap<HandlerId, Arc<Handler>>>,
    index: Mutex<HashMap<HandlerId, Arc<Handler>>>,
}

impl HandlerRegistry {
    pub(crate) fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            delivery: RwLock::new(HashMap::new()),
            index: Mutex::new(HashMap::new()),
        }
    }

    /// Write-locked view for direct fan-out.
    pub(crate) fn delivery_lock(
        &self,
    ) -> RwLockWriteGuard<'_, HashMap<HandlerId, Arc<Handler>>> {
        self.delivery.write().expect("handler registry lock poisoned")
    }

    /// Membership snapshot for queue workers: copy the handler list under a
    /// brief read lock, deliver outside it.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Handler>> {
        self.delivery
            .read()
            .expect("handler registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Insert a handler and replay `existing` to it as synthetic adds while
    /// the delivery lock is held, so no live direct event can interleave
    /// between insertion and the replay.
    pub(crate) fn add(&self, handler: Arc<Handler>, existing: &[KindedObject]) {
        self.index
            .lock()
            .expect("handler registry lock poisoned")
            .insert(handler.id(), Arc::clone(&handler));
        let mut delivery = self.delivery_lock();
        delivery.insert(handler.id(), Arc::clone(&handler));
        for obj in existing {
            handler.deliver_add(obj);
        }
        debug!(kind = %self.kind, id = handler.id(), "added event handler");
    }

    pub(crate) fn lookup(&self, id: HandlerId) -> Option<Arc<Handler>> {
        self.index
            .lock()
            .expect("handler registry lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Schedule physical removal of a tombstoned handler. Runs after any
    /// in-flight delivery releases the lock, never inline with the caller.
    pub(crate) fn remove_deferred(self: &Arc<Self>, id: HandlerId) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let removed = registry
                .delivery
                .write()
                .expect("handler registry lock poisoned")
                .remove(&id)
                .is_some();
            registry
                .index
                .lock()
                .expect("handler registry lock poisoned")
                .remove(&id);
            if removed {
                debug!(kind = %registry.kind, id, "removed event handler");
            } else {
                warn!(kind = %registry.kind, id, "tried to remove unknown event handler");
            }
        });
    }

    /// Tombstone every handler and drop the membership. Shutdown only.
    pub(crate) fn clear(&self) {
        let handlers: Vec<Arc<Handler>> = self
            .index
            .lock()
            .expect("handler registry lock poisoned")
            .values()
            .cloned()
            .collect();
        for handler in &handlers {
            let _ = handler.kill();
        }
        self.delivery
            .write()
            .expect("handler registry lock poisoned")
            .clear();
        self.index
            .lock()
            .expect("handler registry lock poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::resource::CompiledFilter;

    struct Recording {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl EventCallbacks for Recording {
        fn on_add(&self, obj: &KindedObject) {
            self.log.lock().unwrap().push(format!("add {}", obj.name()));
        }

        fn on_update(&self, _old: Option<&KindedObject>, new: &KindedObject) {
            self.log.lock().unwrap().push(format!("update {}", new.name()));
        }

        fn on_delete(&self, obj: &KindedObject) {
            self.log.lock().unwrap().push(format!("delete {}", obj.name()));
        }
    }

    fn recording_handler(
        id: HandlerId,
        filter: CompiledFilter,
    ) -> (Handler, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = Handler::new(id, filter, Box::new(Recording { log: Arc::clone(&log) }));
        (handler, log)
    }

    fn pod(namespace: &str, name: &str) -> KindedObject {
        use k8s_openapi::api::core::v1::Pod;
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
        KindedObject::from(Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn dead_handler_never_fires() {
        let (handler, log) = recording_handler(1, CompiledFilter::default());
        handler.deliver_add(&pod("ns", "a"));
        handler.kill().unwrap();
        handler.deliver_add(&pod("ns", "b"));
        handler.deliver_update(None, &pod("ns", "b"));
        handler.deliver_delete(&pod("ns", "a"));
        assert_eq!(*log.lock().unwrap(), vec!["add a".to_string()]);
    }

    #[test]
    fn second_kill_reports_already_dead() {
        let (handler, _log) = recording_handler(7, CompiledFilter::default());
        handler.kill().unwrap();
        let err = handler.kill().unwrap_err();
        assert!(matches!(
            err.current_context(),
            FactoryError::AlreadyDead { id: 7 }
        ));
    }

    #[test]
    fn update_translates_across_filter_boundary() {
        let filter = CompiledFilter::compile(Some("ns-a"), None).unwrap();
        let (handler, log) = recording_handler(1, filter);

        // Both sides match: plain update.
        handler.deliver_update(Some(&pod("ns-a", "web")), &pod("ns-a", "web"));
        // Object moved into the namespace: surfaces as an add.
        handler.deliver_update(Some(&pod("ns-b", "web")), &pod("ns-a", "web"));
        // No old state and the new side matches: also an add.
        handler.deliver_update(None, &pod("ns-a", "web"));
        // Object moved out of the namespace: surfaces as a delete.
        handler.deliver_update(Some(&pod("ns-a", "web")), &pod("ns-b", "web"));
        // Neither side matches: nothing.
        handler.deliver_update(Some(&pod("ns-b", "web")), &pod("ns-b", "web"));

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "update web".to_string(),
                "add web".to_string(),
                "add web".to_string(),
                "delete web".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn registry_add_replays_existing_objects() {
        let registry = Arc::new(HandlerRegistry::new(ResourceKind::Pod));
        let (handler, log) = recording_handler(1, CompiledFilter::default());
        registry.add(
            Arc::new(handler),
            &[pod("ns", "a"), pod("ns", "b")],
        );
        assert_eq!(
            *log.lock().unwrap(),
            vec!["add a".to_string(), "add b".to_string()]
        );
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn deferred_removal_shrinks_membership() {
        let registry = Arc::new(HandlerRegistry::new(ResourceKind::Pod));
        let (handler, _log) = recording_handler(3, CompiledFilter::default());
        registry.add(Arc::new(handler), &[]);

        let handler = registry.lookup(3).expect("registered");
        handler.kill().unwrap();
        registry.remove_deferred(3);

        // Current-thread runtime: the removal task runs at the next yield.
        tokio::task::yield_now().await;
        assert!(registry.lookup(3).is_none());
        assert!(registry.snapshot().is_empty());
    }
}
