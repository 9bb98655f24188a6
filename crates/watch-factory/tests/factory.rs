//! End-to-end delivery tests driving the factory through a scripted transport.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use similar_asserts::assert_eq;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use watch_factory::EventCallbacks;
use watch_factory::FactoryConfig;
use watch_factory::FactoryError;
use watch_factory::FactoryResult;
use watch_factory::FeedEvent;
use watch_factory::KindedObject;
use watch_factory::MirrorBuffer;
use watch_factory::ResourceKind;
use watch_factory::Transport;
use watch_factory::WatchFactory;
use watch_factory::WatchFeed;

/// The test side of one kind's feed.
struct TestFeed {
    tx: mpsc::Sender<FeedEvent>,
    mirror: Arc<MirrorBuffer>,
}

/// Scripted transport: the test keeps each kind's sender and mirror.
struct TestTransport {
    feeds: Mutex<HashMap<ResourceKind, WatchFeed>>,
}

impl TestTransport {
    fn new(kinds: &[ResourceKind]) -> (Self, HashMap<ResourceKind, TestFeed>) {
        let mut feeds = HashMap::new();
        let mut test_feeds = HashMap::new();
        for &kind in kinds {
            let (tx, rx) = mpsc::channel(32);
            let mirror = Arc::new(MirrorBuffer::default());
            feeds.insert(
                kind,
                WatchFeed {
                    kind,
                    events: rx,
                    mirror: Arc::clone(&mirror) as Arc<dyn watch_factory::Mirror>,
                },
            );
            test_feeds.insert(kind, TestFeed { tx, mirror });
        }
        (
            Self {
                feeds: Mutex::new(feeds),
            },
            test_feeds,
        )
    }
}

impl Transport for TestTransport {
    fn open(&self, kind: ResourceKind) -> FactoryResult<WatchFeed> {
        Ok(self
            .feeds
            .lock()
            .expect("test transport lock")
            .remove(&kind)
            .expect("kind not scripted or opened twice"))
    }
}

/// Records every delivery as a string, in order.
struct Recorder {
    tx: mpsc::UnboundedSender<String>,
}

impl Recorder {
    fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventCallbacks for Recorder {
    fn on_add(&self, obj: &KindedObject) {
        let _ = self.tx.send(format!("add {}", obj.store_key()));
    }

    fn on_update(&self, _old: Option<&KindedObject>, new: &KindedObject) {
        let _ = self.tx.send(format!("update {}", new.store_key()));
    }

    fn on_delete(&self, obj: &KindedObject) {
        let _ = self.tx.send(format!("delete {}", obj.store_key()));
    }
}

fn pod(namespace: &str, name: &str, labels: &[(&str, &str)]) -> KindedObject {
    let labels: BTreeMap<String, String> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    KindedObject::from(Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: (!labels.is_empty()).then_some(labels),
            ..Default::default()
        },
        ..Default::default()
    })
}

async fn recv_n(rx: &mut mpsc::UnboundedReceiver<String>, n: usize) -> Vec<String> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("recorder channel closed");
        out.push(event);
    }
    out
}

async fn start_factory(
    kinds: &[ResourceKind],
) -> (WatchFactory, HashMap<ResourceKind, TestFeed>, CancellationToken) {
    let (transport, feeds) = TestTransport::new(kinds);
    for feed in feeds.values() {
        feed.tx
            .send(FeedEvent::SyncComplete)
            .await
            .expect("feed closed");
    }
    let stop = CancellationToken::new();
    let config = FactoryConfig::new().with_kinds(kinds.iter().copied());
    let factory = WatchFactory::new(&config, &transport, stop.clone())
        .await
        .expect("factory init");
    (factory, feeds, stop)
}

#[test_log::test(tokio::test)]
async fn direct_events_fan_out_in_transport_order() {
    let (factory, feeds, _stop) = start_factory(&[ResourceKind::Pod]).await;
    let feed = &feeds[&ResourceKind::Pod];

    let (recorder, mut rx) = Recorder::new();
    factory
        .add_pod_handler(Box::new(recorder), None)
        .expect("register");

    feed.tx
        .send(FeedEvent::Added(pod("ns-a", "p1", &[])))
        .await
        .unwrap();
    feed.tx
        .send(FeedEvent::Updated {
            old: Some(pod("ns-a", "p1", &[])),
            new: pod("ns-a", "p1", &[("phase", "running")]),
        })
        .await
        .unwrap();
    feed.tx
        .send(FeedEvent::Added(pod("ns-a", "p2", &[])))
        .await
        .unwrap();
    feed.tx
        .send(FeedEvent::Deleted(watch_factory::DeletedObject::Full(pod(
            "ns-a", "p1", &[],
        ))))
        .await
        .unwrap();

    assert_eq!(
        recv_n(&mut rx, 4).await,
        vec![
            "add ns-a/p1".to_string(),
            "update ns-a/p1".to_string(),
            "add ns-a/p2".to_string(),
            "delete ns-a/p1".to_string(),
        ]
    );
}

#[test_log::test(tokio::test)]
async fn filtered_handler_only_sees_its_namespace() {
    let (factory, feeds, _stop) = start_factory(&[ResourceKind::Pod]).await;
    let feed = &feeds[&ResourceKind::Pod];

    let (filtered, mut filtered_rx) = Recorder::new();
    factory
        .add_filtered_pod_handler(Some("ns-a"), None, Box::new(filtered), None)
        .expect("register filtered");
    let (unfiltered, mut unfiltered_rx) = Recorder::new();
    factory
        .add_pod_handler(Box::new(unfiltered), None)
        .expect("register unfiltered");

    for (ns, name) in [("ns-a", "p1"), ("ns-b", "p2"), ("ns-a", "p3"), ("ns-b", "p4")] {
        feed.tx
            .send(FeedEvent::Added(pod(ns, name, &[])))
            .await
            .unwrap();
    }

    // The unfiltered recorder doubles as a barrier for all four events.
    assert_eq!(recv_n(&mut unfiltered_rx, 4).await.len(), 4);
    assert_eq!(
        recv_n(&mut filtered_rx, 2).await,
        vec!["add ns-a/p1".to_string(), "add ns-a/p3".to_string()]
    );
    assert!(filtered_rx.try_recv().is_err());
}

#[test_log::test(tokio::test)]
async fn registration_snapshot_precedes_synthetic_adds_and_live_events() {
    let (factory, feeds, _stop) = start_factory(&[ResourceKind::Pod]).await;
    let feed = &feeds[&ResourceKind::Pod];

    feed.mirror.upsert(pod("ns-a", "p1", &[]));
    feed.mirror.upsert(pod("ns-b", "p2", &[]));

    let snapshot: Arc<Mutex<Option<Vec<String>>>> = Arc::new(Mutex::new(None));
    let snapshot_sink = Arc::clone(&snapshot);
    let (recorder, mut rx) = Recorder::new();
    factory
        .add_filtered_pod_handler(
            Some("ns-a"),
            None,
            Box::new(recorder),
            Some(Box::new(move |objs| {
                let keys = objs.iter().map(KindedObject::store_key).collect();
                *snapshot_sink.lock().unwrap() = Some(keys);
            })),
        )
        .expect("register");

    // The snapshot callback ran before registration returned, with only the
    // matching namespace.
    assert_eq!(
        snapshot.lock().unwrap().as_deref(),
        Some(&["ns-a/p1".to_string()][..])
    );

    feed.tx
        .send(FeedEvent::Added(pod("ns-a", "p3", &[])))
        .await
        .unwrap();

    // Synthetic add for the snapshot first, live event after.
    assert_eq!(
        recv_n(&mut rx, 2).await,
        vec!["add ns-a/p1".to_string(), "add ns-a/p3".to_string()]
    );
}

#[test_log::test(tokio::test)]
async fn removed_handler_sees_nothing_from_a_following_burst() {
    let (factory, feeds, _stop) = start_factory(&[ResourceKind::Pod]).await;
    let feed = &feeds[&ResourceKind::Pod];

    let (doomed, mut doomed_rx) = Recorder::new();
    let doomed_id = factory.add_pod_handler(Box::new(doomed), None).expect("register");
    let (witness, mut witness_rx) = Recorder::new();
    factory.add_pod_handler(Box::new(witness), None).expect("register");

    factory
        .remove_pod_handler(doomed_id)
        .expect("removal succeeds");

    for i in 0..8 {
        feed.tx
            .send(FeedEvent::Added(pod("ns-a", &format!("p{i}"), &[])))
            .await
            .unwrap();
    }

    assert_eq!(recv_n(&mut witness_rx, 8).await.len(), 8);
    assert!(doomed_rx.try_recv().is_err());
}

#[test_log::test(tokio::test)]
async fn second_removal_fails_with_already_dead() {
    let (factory, _feeds, _stop) = start_factory(&[ResourceKind::Pod]).await;

    let (recorder, _rx) = Recorder::new();
    let id = factory.add_pod_handler(Box::new(recorder), None).expect("register");

    factory.remove_pod_handler(id).expect("first removal");
    // No await between the calls: the deferred deletion has not run yet, so
    // the second attempt hits the tombstone.
    let err = factory.remove_pod_handler(id).unwrap_err();
    assert!(matches!(
        err.current_context(),
        FactoryError::AlreadyDead { .. }
    ));
}

#[test_log::test(tokio::test)]
async fn stale_handler_id_is_unknown() {
    let (factory, _feeds, _stop) = start_factory(&[ResourceKind::Pod]).await;
    let err = factory.remove_pod_handler(12345).unwrap_err();
    assert!(matches!(
        err.current_context(),
        FactoryError::UnknownHandler { id: 12345 }
    ));
}

#[test_log::test(tokio::test)]
async fn unconfigured_kind_is_rejected() {
    let (factory, _feeds, _stop) = start_factory(&[ResourceKind::Pod]).await;

    let (recorder, _rx) = Recorder::new();
    let err = factory
        .add_handler(ResourceKind::Service, Box::new(recorder), None)
        .unwrap_err();
    assert!(matches!(
        err.current_context(),
        FactoryError::UnknownKind {
            kind: ResourceKind::Service
        }
    ));

    let err = factory.remove_service_handler(1).unwrap_err();
    assert!(matches!(
        err.current_context(),
        FactoryError::UnknownKind {
            kind: ResourceKind::Service
        }
    ));
}

#[test_log::test(tokio::test)]
async fn desync_before_sync_fails_factory_startup() {
    let (transport, feeds) = TestTransport::new(&[ResourceKind::Pod]);
    feeds[&ResourceKind::Pod]
        .tx
        .send(FeedEvent::Desync {
            message: "listing failed".to_string(),
        })
        .await
        .unwrap();

    let config = FactoryConfig::new().with_kinds([ResourceKind::Pod]);
    let err = WatchFactory::new(&config, &transport, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err.current_context(),
        FactoryError::InitialSyncFailed {
            kind: ResourceKind::Pod
        }
    ));
}

#[test_log::test(tokio::test)]
async fn shutdown_stops_delivery() {
    let (factory, feeds, _stop) = start_factory(&[ResourceKind::Pod]).await;
    let feed = &feeds[&ResourceKind::Pod];

    let (recorder, mut rx) = Recorder::new();
    factory.add_pod_handler(Box::new(recorder), None).expect("register");

    factory.shutdown().await;

    // The pump is gone; whether the send is accepted or refused, nothing may
    // reach the handler.
    let _ = feed.tx.send(FeedEvent::Added(pod("ns-a", "p1", &[]))).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
}

#[test_log::test(tokio::test)]
async fn handler_can_unregister_itself_from_its_own_callback() {
    let (factory, feeds, _stop) = start_factory(&[ResourceKind::Pod]).await;
    let feed = &feeds[&ResourceKind::Pod];

    let factory = Arc::new(factory);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    struct SelfRemover {
        factory: Arc<WatchFactory>,
        id: Mutex<Option<watch_factory::HandlerId>>,
        tx: mpsc::UnboundedSender<String>,
    }

    impl EventCallbacks for SelfRemover {
        fn on_add(&self, obj: &KindedObject) {
            let _ = self.tx.send(format!("add {}", obj.store_key()));
            if let Some(id) = self.id.lock().unwrap().take() {
                // Removal from inside the delivery path must not deadlock.
                self.factory.remove_pod_handler(id).expect("self removal");
            }
        }
    }

    let remover = Arc::new(SelfRemover {
        factory: Arc::clone(&factory),
        id: Mutex::new(None),
        tx,
    });

    struct Shared(Arc<SelfRemover>);
    impl EventCallbacks for Shared {
        fn on_add(&self, obj: &KindedObject) {
            self.0.on_add(obj);
        }
    }

    let id = factory
        .add_pod_handler(Box::new(Shared(Arc::clone(&remover))), None)
        .expect("register");
    *remover.id.lock().unwrap() = Some(id);

    feed.tx
        .send(FeedEvent::Added(pod("ns-a", "first", &[])))
        .await
        .unwrap();
    feed.tx
        .send(FeedEvent::Added(pod("ns-a", "second", &[])))
        .await
        .unwrap();

    // First event delivered, removal happened inside the callback, second
    // event suppressed by the tombstone. Use a witness as a barrier.
    let (witness, mut witness_rx) = Recorder::new();
    factory.add_pod_handler(Box::new(witness), None).expect("register witness");
    feed.tx
        .send(FeedEvent::Added(pod("ns-a", "third", &[])))
        .await
        .unwrap();
    recv_n(&mut witness_rx, 1).await;

    assert_eq!(rx.try_recv().unwrap(), "add ns-a/first");
    assert!(rx.try_recv().is_err());
}
