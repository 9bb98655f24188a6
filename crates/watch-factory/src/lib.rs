//! Shared cluster watches with tombstoned handler fan-out.
//!
//! This crate maintains one periodically-resynced local mirror per watched
//! resource kind (pods, services, endpoints, network policies, namespaces,
//! nodes) and fans every add/update/delete notification out to any number of
//! in-process subscribers. Subscribers register and unregister concurrently,
//! even from inside a running callback, without races or deadlocks.
//!
//! Delivery comes in two modes, fixed per kind:
//!
//! - *direct* kinds fan out synchronously on the watch path, under the
//!   kind's registry lock, in transport order;
//! - *ordered* kinds (nodes) hash each object's `namespace/name` identity
//!   onto a fixed set of capacity-1 queues, each drained by its own worker,
//!   guaranteeing per-object ordering while events for different objects
//!   proceed concurrently. A slow worker blocks the producer rather than
//!   dropping events.
//!
//! Handlers are tombstoned on removal: delivery stops immediately, the
//! registry slot is reclaimed asynchronously.
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> watch_factory::FactoryResult<()> {
//! use tokio_util::sync::CancellationToken;
//! use watch_factory::{FactoryConfig, HandlerFns, KubeTransport, WatchFactory};
//!
//! let config = FactoryConfig::new();
//! let stop = CancellationToken::new();
//! let transport = KubeTransport::connect(&config, stop.clone()).await?;
//! let factory = WatchFactory::new(&config, &transport, stop.clone()).await?;
//!
//! factory.add_pod_handler(
//!     Box::new(HandlerFns {
//!         add: Some(Box::new(|pod| println!("pod added: {}", pod.store_key()))),
//!         ..Default::default()
//!     }),
//!     None,
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod factory;
pub mod handler;
pub mod kube;
pub mod logging;
pub mod resource;
pub mod transport;

mod queue;
mod watcher;

pub use config::FactoryConfig;
pub use error::FactoryError;
pub use error::FactoryResult;
pub use factory::WatchFactory;
pub use handler::EventCallbacks;
pub use handler::HandlerFns;
pub use handler::HandlerId;
pub use kube::KubeTransport;
pub use resource::DeletedObject;
pub use resource::KindedObject;
pub use resource::ResourceKind;
pub use transport::FeedEvent;
pub use transport::Mirror;
pub use transport::MirrorBuffer;
pub use transport::Transport;
pub use transport::WatchFeed;
pub use watcher::ExistingSnapshotFn;
