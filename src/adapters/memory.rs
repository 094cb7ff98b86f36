//! In-Memory Adapters
//!
//! Fakes for every port, faithful to the API-server behaviours the
//! reconcilers depend on:
//!
//! - `resourceVersion` bumps on every effective write and is checked on
//!   replace (optimistic concurrency)
//! - `generateName` produces a random suffix
//! - deleting an object with finalizers only stamps `deletionTimestamp`; the
//!   object disappears when its last finalizer is removed
//! - `replace` never touches `status`; `replace_status` touches nothing else
//! - writes that change nothing do not bump the version and are not counted

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use parking_lot::RwLock;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::crd::keys::HOSTNAME_LABEL;
use crate::domain::ports::{NodeInventory, ResourceStore, Selector};
use crate::error::{Error, Result};

const NAME_SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const NAME_SUFFIX_LEN: usize = 5;

type Key = (String, String);

// =============================================================================
// In-Memory Resource Store
// =============================================================================

/// In-memory store for one object kind.
#[derive(Debug)]
pub struct InMemoryStore<K> {
    objects: RwLock<BTreeMap<Key, K>>,
    version: AtomicU64,
    mutations: AtomicUsize,
}

impl<K> Default for InMemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(1),
            mutations: AtomicUsize::new(0),
        }
    }
}

impl<K> InMemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of effective writes since creation.
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Snapshot of every stored object.
    pub fn all(&self) -> Vec<K> {
        self.objects.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Look up an object without going through the async port.
    pub fn find(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Mutate an object in place as an external actor would, spec and status
    /// alike. Returns `false` when the object does not exist.
    pub fn update_with<F>(&self, namespace: &str, name: &str, f: F) -> bool
    where
        F: FnOnce(&mut K),
    {
        let key = (namespace.to_string(), name.to_string());
        let mut objects = self.objects.write();
        let Some(current) = objects.get(&key).cloned() else {
            return false;
        };
        let mut next = current.clone();
        f(&mut next);
        self.commit(&mut objects, key, &current, next);
        true
    }

    /// Apply `f` to every object matching `selector`.
    pub fn update_matching<F>(&self, selector: &Selector, mut f: F) -> usize
    where
        F: FnMut(&mut K),
    {
        let keys: Vec<Key> = self
            .objects
            .read()
            .iter()
            .filter(|(_, obj)| selector.matches(obj.labels()))
            .map(|(k, _)| k.clone())
            .collect();
        for (ns, name) in &keys {
            self.update_with(ns, name, &mut f);
        }
        keys.len()
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }

    fn next_version(&self) -> String {
        self.version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn not_found(name: &str) -> Error {
        Error::NotFound {
            kind: Self::kind(),
            name: name.to_string(),
        }
    }

    fn conflict(name: &str) -> Error {
        Error::Conflict {
            kind: Self::kind(),
            name: name.to_string(),
        }
    }

    /// Store `next` in place of `current` when it differs, finalizing
    /// deletion once no finalizers remain. Returns the stored view.
    fn commit(&self, objects: &mut BTreeMap<Key, K>, key: Key, current: &K, mut next: K) -> K {
        {
            let meta = next.meta_mut();
            let cur = current.meta();
            meta.name = cur.name.clone();
            meta.namespace = cur.namespace.clone();
            meta.uid = cur.uid.clone();
            meta.creation_timestamp = cur.creation_timestamp.clone();
            meta.deletion_timestamp = cur.deletion_timestamp.clone();
            meta.resource_version = cur.resource_version.clone();
        }

        if same_content(current, &next) {
            return current.clone();
        }

        next.meta_mut().resource_version = Some(self.next_version());
        self.mutations.fetch_add(1, Ordering::SeqCst);

        let releasable =
            next.meta().deletion_timestamp.is_some() && next.finalizers().is_empty();
        if releasable {
            objects.remove(&key);
        } else {
            objects.insert(key, next.clone());
        }
        next
    }

    fn check_version(current: &K, incoming: Option<&String>, name: &str) -> Result<()> {
        match incoming {
            Some(rv) if current.meta().resource_version.as_ref() != Some(rv) => {
                Err(Self::conflict(name))
            }
            _ => Ok(()),
        }
    }
}

fn same_content<K: Serialize>(a: &K, b: &K) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn generated_name(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .map(|_| NAME_SUFFIX_ALPHABET[rng.gen_range(0..NAME_SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!("{}{}", prefix, suffix)
}

/// Apply an RFC 7386 merge patch to `target`.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(fields) = target {
                for (key, value) in entries {
                    if value.is_null() {
                        fields.remove(key);
                    } else {
                        merge_patch(fields.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn with_status_of<K>(base: &K, status_source: &K) -> Result<K>
where
    K: Serialize + DeserializeOwned,
{
    let mut value = serde_json::to_value(base)?;
    let status = serde_json::to_value(status_source)?
        .get("status")
        .cloned()
        .unwrap_or(Value::Null);
    if let Value::Object(fields) = &mut value {
        if status.is_null() {
            fields.remove("status");
        } else {
            fields.insert("status".to_string(), status);
        }
    }
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl<K> ResourceStore<K> for InMemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.find(namespace, name))
    }

    async fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<K>> {
        Ok(self
            .objects
            .read()
            .iter()
            .filter(|((ns, _), obj)| ns == namespace && selector.matches(obj.labels()))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K> {
        let mut obj = obj.clone();
        let name = match (&obj.meta().name, &obj.meta().generate_name) {
            (Some(name), _) if !name.is_empty() => name.clone(),
            (_, Some(prefix)) => generated_name(prefix),
            _ => {
                return Err(Error::Validation(format!(
                    "{} needs a name or generateName",
                    Self::kind()
                )))
            }
        };

        let key = (namespace.to_string(), name.clone());
        let mut objects = self.objects.write();
        if objects.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: Self::kind(),
                name,
            });
        }

        {
            let meta = obj.meta_mut();
            meta.name = Some(name);
            meta.namespace = Some(namespace.to_string());
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
            meta.creation_timestamp = Some(Time(Utc::now()));
            meta.deletion_timestamp = None;
            meta.resource_version = Some(self.next_version());
        }
        self.mutations.fetch_add(1, Ordering::SeqCst);
        objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn replace(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let key = (namespace.to_string(), name.clone());
        let mut objects = self.objects.write();
        let current = objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::not_found(&name))?;
        Self::check_version(&current, obj.meta().resource_version.as_ref(), &name)?;

        let next = with_status_of(obj, &current)?;
        Ok(self.commit(&mut objects, key, &current, next))
    }

    async fn replace_status(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let key = (namespace.to_string(), name.clone());
        let mut objects = self.objects.write();
        let current = objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::not_found(&name))?;
        Self::check_version(&current, obj.meta().resource_version.as_ref(), &name)?;

        let next = with_status_of(&current, obj)?;
        Ok(self.commit(&mut objects, key, &current, next))
    }

    async fn patch_merge(&self, namespace: &str, name: &str, patch: &Value) -> Result<K> {
        let key = (namespace.to_string(), name.to_string());
        let mut objects = self.objects.write();
        let current = objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::not_found(name))?;

        let incoming_version = patch
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self::check_version(&current, incoming_version.as_ref(), name)?;

        let mut value = serde_json::to_value(&current)?;
        let mut patch = patch.clone();
        if let Value::Object(fields) = &mut patch {
            fields.remove("status");
        }
        merge_patch(&mut value, &patch);
        let next: K = serde_json::from_value(value)?;
        Ok(self.commit(&mut objects, key, &current, next))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        let mut objects = self.objects.write();
        let Some(current) = objects.get(&key).cloned() else {
            return Ok(());
        };

        if current.finalizers().is_empty() {
            objects.remove(&key);
            self.mutations.fetch_add(1, Ordering::SeqCst);
        } else if current.meta().deletion_timestamp.is_none() {
            let mut next = current;
            next.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
            next.meta_mut().resource_version = Some(self.next_version());
            self.mutations.fetch_add(1, Ordering::SeqCst);
            objects.insert(key, next);
        }
        Ok(())
    }

    async fn delete_collection(&self, namespace: &str, selector: &Selector) -> Result<()> {
        let names: Vec<String> = self
            .objects
            .read()
            .iter()
            .filter(|((ns, _), obj)| ns == namespace && selector.matches(obj.labels()))
            .map(|((_, name), _)| name.clone())
            .collect();
        for name in names {
            self.delete(namespace, &name).await?;
        }
        Ok(())
    }
}

// =============================================================================
// In-Memory Node Inventory
// =============================================================================

/// Fixed set of nodes.
#[derive(Debug, Default)]
pub struct InMemoryNodeInventory {
    nodes: RwLock<Vec<Node>>,
}

impl InMemoryNodeInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node carrying its hostname label plus `labels`.
    pub fn add_node(&self, name: &str, labels: &[(&str, &str)]) {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        let mut all: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        all.insert(HOSTNAME_LABEL.to_string(), name.to_string());
        node.metadata.labels = Some(all);
        self.nodes.write().push(node);
    }

    pub fn remove_node(&self, name: &str) {
        self.nodes
            .write()
            .retain(|n| n.metadata.name.as_deref() != Some(name));
    }
}

#[async_trait]
impl NodeInventory for InMemoryNodeInventory {
    async fn list_nodes(&self, selector: &Selector) -> Result<Vec<Node>> {
        Ok(self
            .nodes
            .read()
            .iter()
            .filter(|n| selector.matches(n.labels()))
            .cloned()
            .collect())
    }
}
