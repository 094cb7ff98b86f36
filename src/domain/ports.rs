//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! The reconcilers never talk to the API server directly. They go through the
//! narrow traits defined here, one store per object kind, so the same
//! convergence code runs against Kubernetes or against in-memory fakes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Reconcilers                             │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  ResourceStore<K> │ NodeInventory │ EventRecorder   │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  KubeStore │ InMemoryStore │ KubeEventRecorder      │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;

use super::events::ControllerEvent;
use crate::error::Result;

// =============================================================================
// Label Selector
// =============================================================================

/// Equality and set-membership label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    equals: BTreeMap<String, String>,
    within: BTreeMap<String, BTreeSet<String>>,
}

impl Selector {
    /// Selector matching every object.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Selector requiring `key=value`.
    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::default().and_eq(key, value)
    }

    /// Selector requiring every entry of `labels`.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        Self {
            equals: labels.clone(),
            within: BTreeMap::new(),
        }
    }

    pub fn and_eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.equals.insert(key.into(), value.into());
        self
    }

    /// Require the label `key` to take one of `values`.
    pub fn and_in<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.within
            .insert(key.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.equals.is_empty() && self.within.is_empty()
    }

    /// Whether an object with `labels` is selected.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.equals
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self
                .within
                .iter()
                .all(|(k, set)| labels.get(k).map(|v| set.contains(v)).unwrap_or(false))
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts: Vec<String> = self
            .equals
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        for (k, set) in &self.within {
            let values: Vec<&str> = set.iter().map(String::as_str).collect();
            parts.push(format!("{} in ({})", k, values.join(",")));
        }
        write!(f, "{}", parts.join(","))
    }
}

// =============================================================================
// Resource Store Port
// =============================================================================

/// Typed client for one namespaced object kind.
///
/// `replace` and `replace_status` carry the object's `resourceVersion` and
/// fail with `Error::Conflict` when it is stale. `replace` never changes
/// status and `replace_status` never changes anything else.
#[async_trait]
pub trait ResourceStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Fetch one object; `None` when it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List objects whose labels match `selector`.
    async fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<K>>;

    /// Create an object. Honours `metadata.generateName` when `name` is unset.
    async fn create(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Replace an object's metadata and spec.
    async fn replace(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Replace an object's status.
    async fn replace_status(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Apply a JSON merge patch to an object.
    async fn patch_merge(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    /// Delete every object matching `selector`.
    async fn delete_collection(&self, namespace: &str, selector: &Selector) -> Result<()>;
}

// =============================================================================
// Node Inventory Port
// =============================================================================

/// Read access to cluster nodes.
#[async_trait]
pub trait NodeInventory: Send + Sync {
    /// Nodes whose labels match `selector`.
    async fn list_nodes(&self, selector: &Selector) -> Result<Vec<Node>>;
}

// =============================================================================
// Event Recorder Port
// =============================================================================

/// Sink for user-visible controller events.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, event: ControllerEvent) -> Result<()>;
}
