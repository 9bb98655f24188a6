//! Watched resource kinds and the objects flowing through the factory.
//!
//! The factory watches a fixed set of object types, tagged at compile time by
//! [`ResourceKind`]. Objects travel as [`KindedObject`] values: shared,
//! read-only references whose metadata (namespace, name, labels) is the only
//! part this crate ever looks at.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use derive_more::Display;
use error_stack::Report;
use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use serde::Serialize;

use crate::error::FactoryError;

/// The resource kinds the factory can watch.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    #[display("pod")]
    Pod,
    #[display("service")]
    Service,
    #[display("endpoints")]
    Endpoints,
    #[display("networkpolicy")]
    NetworkPolicy,
    #[display("namespace")]
    Namespace,
    #[display("node")]
    Node,
}

impl ResourceKind {
    /// Every watchable kind.
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Pod,
        ResourceKind::Service,
        ResourceKind::Endpoints,
        ResourceKind::NetworkPolicy,
        ResourceKind::Namespace,
        ResourceKind::Node,
    ];

    /// Kinds whose events are routed through per-object hashed queues.
    /// Node event volume would otherwise stall delivery for every other kind.
    pub(crate) fn is_queued(self) -> bool {
        matches!(self, ResourceKind::Node)
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pod" | "pods" => Ok(ResourceKind::Pod),
            "service" | "services" => Ok(ResourceKind::Service),
            "endpoints" => Ok(ResourceKind::Endpoints),
            "networkpolicy" | "networkpolicies" => Ok(ResourceKind::NetworkPolicy),
            "namespace" | "namespaces" => Ok(ResourceKind::Namespace),
            "node" | "nodes" => Ok(ResourceKind::Node),
            other => Err(format!("unknown resource kind: {other}")),
        }
    }
}

/// A watched object, tagged with its kind.
///
/// Variants hold shared references; cloning is cheap and the payload is never
/// mutated here. Identity is the (namespace, name) pair, unique per kind on
/// the control-plane side.
#[derive(Debug, Clone)]
pub enum KindedObject {
    Pod(Arc<Pod>),
    Service(Arc<Service>),
    Endpoints(Arc<Endpoints>),
    NetworkPolicy(Arc<NetworkPolicy>),
    Namespace(Arc<Namespace>),
    Node(Arc<Node>),
}

impl KindedObject {
    pub fn kind(&self) -> ResourceKind {
        match self {
            KindedObject::Pod(_) => ResourceKind::Pod,
            KindedObject::Service(_) => ResourceKind::Service,
            KindedObject::Endpoints(_) => ResourceKind::Endpoints,
            KindedObject::NetworkPolicy(_) => ResourceKind::NetworkPolicy,
            KindedObject::Namespace(_) => ResourceKind::Namespace,
            KindedObject::Node(_) => ResourceKind::Node,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            KindedObject::Pod(o) => &o.metadata,
            KindedObject::Service(o) => &o.metadata,
            KindedObject::Endpoints(o) => &o.metadata,
            KindedObject::NetworkPolicy(o) => &o.metadata,
            KindedObject::Namespace(o) => &o.metadata,
            KindedObject::Node(o) => &o.metadata,
        }
    }

    /// Object namespace, empty for cluster-scoped objects.
    pub fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or("")
    }

    pub fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata().labels.as_ref()
    }

    /// Mirror key: `namespace/name` for namespaced objects, `name` otherwise.
    pub fn store_key(&self) -> String {
        let ns = self.namespace();
        if ns.is_empty() {
            self.name().to_string()
        } else {
            format!("{}/{}", ns, self.name())
        }
    }
}

impl From<Pod> for KindedObject {
    fn from(o: Pod) -> Self {
        KindedObject::Pod(Arc::new(o))
    }
}

impl From<Service> for KindedObject {
    fn from(o: Service) -> Self {
        KindedObject::Service(Arc::new(o))
    }
}

impl From<Endpoints> for KindedObject {
    fn from(o: Endpoints) -> Self {
        KindedObject::Endpoints(Arc::new(o))
    }
}

impl From<NetworkPolicy> for KindedObject {
    fn from(o: NetworkPolicy) -> Self {
        KindedObject::NetworkPolicy(Arc::new(o))
    }
}

impl From<Namespace> for KindedObject {
    fn from(o: Namespace) -> Self {
        KindedObject::Namespace(Arc::new(o))
    }
}

impl From<Node> for KindedObject {
    fn from(o: Node) -> Self {
        KindedObject::Node(Arc::new(o))
    }
}

/// The payload of a delete notification.
///
/// A transport that missed the final watch event only knows the object's last
/// observed state and delivers it wrapped in a placeholder.
#[derive(Debug, Clone)]
pub enum DeletedObject {
    /// The deleted object in its final state.
    Full(KindedObject),
    /// Last-known-state placeholder for an object whose deletion was missed.
    FinalStateUnknown {
        key: String,
        object: KindedObject,
    },
}

/// Borrow the object's metadata after verifying its kind tag.
pub(crate) fn checked_meta(
    expected: ResourceKind,
    obj: &KindedObject,
) -> Result<&ObjectMeta, Report<FactoryError>> {
    if obj.kind() != expected {
        return Err(Report::new(FactoryError::TypeMismatch {
            expected,
            actual: obj.kind(),
        }));
    }
    Ok(obj.metadata())
}

/// Unwrap a delete notification down to the deleted object, recovering the
/// last known state from a placeholder when necessary.
pub(crate) fn recover_deleted(
    expected: ResourceKind,
    deleted: DeletedObject,
) -> Result<KindedObject, Report<FactoryError>> {
    match deleted {
        DeletedObject::Full(obj) => {
            if obj.kind() != expected {
                return Err(Report::new(FactoryError::TypeMismatch {
                    expected,
                    actual: obj.kind(),
                }));
            }
            Ok(obj)
        }
        DeletedObject::FinalStateUnknown { key, object } => {
            if object.kind() != expected {
                return Err(Report::new(FactoryError::UnrecoverableTombstone {
                    expected,
                    actual: object.kind(),
                })
                .attach_printable(format!("tombstone key: {key}")));
            }
            Ok(object)
        }
    }
}

/// One compiled label-selector requirement.
#[derive(Debug, Clone)]
enum SelectorRule {
    Eq { key: String, value: String },
    In { key: String, values: Vec<String> },
    NotIn { key: String, values: Vec<String> },
    Exists { key: String },
    DoesNotExist { key: String },
}

/// A handler's registration filter, compiled once at registration time.
///
/// An empty filter matches every object of the kind. Namespace filtering is
/// exact equality; label rules follow the control plane's selector semantics.
#[derive(Debug, Clone, Default)]
pub(crate) struct CompiledFilter {
    namespace: Option<String>,
    rules: Vec<SelectorRule>,
}

impl CompiledFilter {
    pub(crate) fn compile(
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> Result<Self, Report<FactoryError>> {
        let mut rules = Vec::new();
        if let Some(selector) = selector {
            if let Some(labels) = &selector.match_labels {
                for (key, value) in labels {
                    rules.push(SelectorRule::Eq {
                        key: key.clone(),
                        value: value.clone(),
                    });
                }
            }
            if let Some(expressions) = &selector.match_expressions {
                for expr in expressions {
                    let values = expr.values.clone().unwrap_or_default();
                    let rule = match expr.operator.as_str() {
                        "In" => {
                            if values.is_empty() {
                                return Err(invalid_selector(&expr.key, "In requires values"));
                            }
                            SelectorRule::In {
                                key: expr.key.clone(),
                                values,
                            }
                        }
                        "NotIn" => {
                            if values.is_empty() {
                                return Err(invalid_selector(&expr.key, "NotIn requires values"));
                            }
                            SelectorRule::NotIn {
                                key: expr.key.clone(),
                                values,
                            }
                        }
                        "Exists" => {
                            if !values.is_empty() {
                                return Err(invalid_selector(&expr.key, "Exists takes no values"));
                            }
                            SelectorRule::Exists {
                                key: expr.key.clone(),
                            }
                        }
                        "DoesNotExist" => {
                            if !values.is_empty() {
                                return Err(invalid_selector(
                                    &expr.key,
                                    "DoesNotExist takes no values",
                                ));
                            }
                            SelectorRule::DoesNotExist {
                                key: expr.key.clone(),
                            }
                        }
                        other => {
                            return Err(Report::new(FactoryError::InvalidSelector {
                                message: format!("unsupported operator {other:?} on key {}", expr.key),
                            }))
                        }
                    };
                    rules.push(rule);
                }
            }
        }
        Ok(Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            rules,
        })
    }

    pub(crate) fn matches(&self, obj: &KindedObject) -> bool {
        if let Some(ns) = &self.namespace {
            if obj.namespace() != ns {
                return false;
            }
        }
        if self.rules.is_empty() {
            return true;
        }
        let empty = BTreeMap::new();
        let labels = obj.labels().unwrap_or(&empty);
        self.rules.iter().all(|rule| match rule {
            SelectorRule::Eq { key, value } => labels.get(key) == Some(value),
            SelectorRule::In { key, values } => {
                labels.get(key).map(|v| values.contains(v)).unwrap_or(false)
            }
            SelectorRule::NotIn { key, values } => {
                labels.get(key).map(|v| !values.contains(v)).unwrap_or(true)
            }
            SelectorRule::Exists { key } => labels.contains_key(key),
            SelectorRule::DoesNotExist { key } => !labels.contains_key(key),
        })
    }
}

fn invalid_selector(key: &str, problem: &str) -> Report<FactoryError> {
    Report::new(FactoryError::InvalidSelector {
        message: format!("{problem} (key {key})"),
    })
}
