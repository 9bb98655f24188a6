//! Error types for the watch factory.

use core::error::Error;

use derive_more::Display;
use error_stack::Report;

use crate::resource::ResourceKind;

/// Result type for factory operations.
pub type FactoryResult<T> = Result<T, Report<FactoryError>>;

/// Errors surfaced by the watch factory and its per-kind watchers.
///
/// Per-event failures (`TypeMismatch`, `UnrecoverableTombstone`) are handled
/// where the event is processed: logged, the event dropped, delivery to other
/// objects unaffected. Registration and removal errors are returned to the
/// caller. `InitialSyncFailed` is fatal to the whole factory.
#[derive(Debug, Display)]
pub enum FactoryError {
    /// An event carried an object of a different kind than the watcher expected
    #[display("object kind {actual} did not match expected {expected}")]
    TypeMismatch {
        expected: ResourceKind,
        actual: ResourceKind,
    },

    /// A deletion placeholder wrapped an object of the wrong kind
    #[display("expected tombstone object of kind {expected} but got {actual}")]
    UnrecoverableTombstone {
        expected: ResourceKind,
        actual: ResourceKind,
    },

    /// Removal was requested for a handler that is already dead
    #[display("event handler {id} already dead")]
    AlreadyDead { id: u64 },

    /// The handler id is not present in the registry
    #[display("unknown event handler {id}")]
    UnknownHandler { id: u64 },

    /// No watcher was configured for this resource kind
    #[display("no watcher configured for {kind} objects")]
    UnknownKind { kind: ResourceKind },

    /// A label selector expression could not be compiled
    #[display("invalid label selector: {message}")]
    InvalidSelector { message: String },

    /// The local mirror never reached a consistent initial state
    #[display("error syncing cache for {kind} watcher")]
    SyncFailed { kind: ResourceKind },

    /// Factory startup aborted because one kind failed its initial sync
    #[display("initial sync failed for {kind} watcher")]
    InitialSyncFailed { kind: ResourceKind },

    /// Failed to connect to the Kubernetes API
    #[display("failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
}

impl Error for FactoryError {}
