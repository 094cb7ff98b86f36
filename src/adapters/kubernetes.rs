//! Kubernetes Adapters
//!
//! Implements the store, node inventory and event ports on top of `kube::Api`.
//! Stores for primary kinds read from a reflector cache; every write goes to
//! the API server.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::domain::events::{ControllerEvent, EventKind};
use crate::domain::ports::{EventRecorder, NodeInventory, ResourceStore, Selector};
use crate::error::{Error, Result};

/// Field manager name for writes.
pub const FIELD_MANAGER: &str = "cstor-operator";

// =============================================================================
// Resource Store
// =============================================================================

/// Kubernetes-backed store for one namespaced kind.
#[derive(Clone)]
pub struct KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    client: Client,
    cache: Option<Store<K>>,
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Create a store that reads and writes through the API server.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: None,
        }
    }

    /// Serve `get` and `list` from a reflector cache.
    pub fn with_cache(mut self, cache: Store<K>) -> Self {
        self.cache = Some(cache);
        self
    }

    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }

    fn name_of(obj: &K) -> String {
        obj.meta()
            .name
            .clone()
            .or_else(|| obj.meta().generate_name.clone())
            .unwrap_or_default()
    }
}

impl<K> Debug for KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("kind", &K::kind(&()))
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    #[instrument(skip(self), fields(kind = %Self::kind()))]
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        if let Some(cache) = &self.cache {
            let key = ObjectRef::new(name).within(namespace);
            return Ok(cache.get(&key).map(|obj| (*obj).clone()));
        }
        self.api(namespace)
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(e, &Self::kind(), name))
    }

    #[instrument(skip(self), fields(kind = %Self::kind(), selector = %selector))]
    async fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<K>> {
        if let Some(cache) = &self.cache {
            return Ok(cache
                .state()
                .iter()
                .filter(|obj| obj.namespace().as_deref() == Some(namespace))
                .filter(|obj| selector.matches(obj.labels()))
                .map(|obj| (**obj).clone())
                .collect());
        }
        let params = ListParams::default().labels(&selector.to_string());
        let list = self
            .api(namespace)
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(e, &Self::kind(), &selector.to_string()))?;
        Ok(list.items)
    }

    #[instrument(skip(self, obj), fields(kind = %Self::kind()))]
    async fn create(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = Self::name_of(obj);
        let created = self
            .api(namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, &Self::kind(), &name))?;
        debug!(name = %created.name_any(), "Created object");
        Ok(created)
    }

    #[instrument(skip(self, obj), fields(kind = %Self::kind(), name = %obj.name_any()))]
    async fn replace(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api(namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, &Self::kind(), &name))
    }

    #[instrument(skip(self, obj), fields(kind = %Self::kind(), name = %obj.name_any()))]
    async fn replace_status(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let body = serde_json::to_vec(obj)?;
        self.api(namespace)
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| Error::from_kube(e, &Self::kind(), &name))
    }

    #[instrument(skip(self, patch), fields(kind = %Self::kind()))]
    async fn patch_merge(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K> {
        self.api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| Error::from_kube(e, &Self::kind(), name))
    }

    #[instrument(skip(self), fields(kind = %Self::kind()))]
    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::from_kube(e, &Self::kind(), name)),
        }
    }

    #[instrument(skip(self), fields(kind = %Self::kind(), selector = %selector))]
    async fn delete_collection(&self, namespace: &str, selector: &Selector) -> Result<()> {
        let params = ListParams::default().labels(&selector.to_string());
        self.api(namespace)
            .delete_collection(&DeleteParams::background(), &params)
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, &Self::kind(), &selector.to_string()))
    }
}

// =============================================================================
// Node Inventory
// =============================================================================

/// Lists nodes straight from the API server.
#[derive(Clone)]
pub struct KubeNodeInventory {
    client: Client,
}

impl KubeNodeInventory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeInventory for KubeNodeInventory {
    #[instrument(skip(self), fields(selector = %selector))]
    async fn list_nodes(&self, selector: &Selector) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&selector.to_string());
        let list = api
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(e, "Node", &selector.to_string()))?;
        Ok(list.items)
    }
}

// =============================================================================
// Event Recorder
// =============================================================================

/// Publishes controller events as Kubernetes events.
#[derive(Clone)]
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    pub fn new(client: Client, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.into(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, event: ControllerEvent) -> Result<()> {
        let type_ = match event.kind {
            EventKind::Normal => EventType::Normal,
            EventKind::Warning => EventType::Warning,
        };
        self.recorder
            .publish(
                &Event {
                    type_,
                    reason: event.reason.to_string(),
                    note: Some(event.message),
                    action: event.action,
                    secondary: None,
                },
                &event.regarding,
            )
            .await
            .map_err(Error::Kube)
    }
}
