//! Controller Events
//!
//! User-visible events the reconcilers emit against the objects they manage.
//! They end up as Kubernetes `Event` objects in production and in an
//! in-memory collector in tests.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};

/// Why an event was emitted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventReason {
    /// Claim is waiting on the provisioner
    Provisioning,
    /// Pool instance creation attempted
    PoolCreate,
    /// Pool instance removed because its pool spec is gone
    PoolDownscale,
    /// Pool-management workload creation attempted
    PoolDeploymentCreate,
    /// Day-2 pool operation (expand or replace)
    PoolExpand,
    Resizing,
    ResizeFailed,
    ResizeSucceeded,
    /// Replicas added or removed through the claim's pool list
    ScalingVolumeReplicas,
    /// Pool list renamed without changing its size
    Migration,
    SyncFailed,
    Synced,
}

impl std::fmt::Display for EventReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventReason::Provisioning => "Provisioning",
            EventReason::PoolCreate => "PoolCreate",
            EventReason::PoolDownscale => "PoolDownscale",
            EventReason::PoolDeploymentCreate => "PoolDeploymentCreate",
            EventReason::PoolExpand => "PoolExpand",
            EventReason::Resizing => "Resizing",
            EventReason::ResizeFailed => "ResizeFailed",
            EventReason::ResizeSucceeded => "ResizeSucceeded",
            EventReason::ScalingVolumeReplicas => "ScalingVolumeReplicas",
            EventReason::Migration => "Migration",
            EventReason::SyncFailed => "SyncFailed",
            EventReason::Synced => "Synced",
        };
        write!(f, "{}", s)
    }
}

/// Kubernetes event type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// An event about one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerEvent {
    pub reason: EventReason,
    pub kind: EventKind,
    pub message: String,
    /// Short verb describing the controller action
    pub action: String,
    pub regarding: ObjectReference,
    pub timestamp: DateTime<Utc>,
}

impl ControllerEvent {
    fn new<K>(obj: &K, kind: EventKind, reason: EventReason, message: impl Into<String>) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            reason,
            kind,
            message: message.into(),
            action: "Reconcile".to_string(),
            regarding: obj.object_ref(&()),
            timestamp: Utc::now(),
        }
    }

    pub fn normal<K>(obj: &K, reason: EventReason, message: impl Into<String>) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self::new(obj, EventKind::Normal, reason, message)
    }

    pub fn warning<K>(obj: &K, reason: EventReason, message: impl Into<String>) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self::new(obj, EventKind::Warning, reason, message)
    }

    /// Name of the object the event is about.
    pub fn object_name(&self) -> &str {
        self.regarding.name.as_deref().unwrap_or_default()
    }

    pub fn is_warning(&self) -> bool {
        self.kind == EventKind::Warning
    }
}

/// `namespace/name` key for an object.
pub fn object_key<K: ResourceExt>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}
