//! Finalizer & Owner-Reference Manager
//!
//! Finalizer edits go through `replace` so a concurrent writer surfaces as a
//! version conflict; each helper re-reads and retries a bounded number of
//! times before giving up with the conflict.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use crate::crd::{keys::CLUSTER_LABEL, BlockDeviceClaim, CStorPoolCluster};
use crate::domain::ports::{ResourceStore, Selector};
use crate::error::{Error, Result, ResultExt};

/// Attempts per finalizer edit before the conflict is returned.
pub const CONFLICT_RETRIES: usize = 5;

pub fn has_finalizer<K: ResourceExt>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Append `finalizer`. Returns whether the object changed.
pub fn add_finalizer<K: ResourceExt>(obj: &mut K, finalizer: &str) -> bool {
    if has_finalizer(obj, finalizer) {
        return false;
    }
    obj.finalizers_mut().push(finalizer.to_string());
    true
}

/// Drop `finalizer`. Returns whether the object changed.
pub fn remove_finalizer<K: ResourceExt>(obj: &mut K, finalizer: &str) -> bool {
    let before = obj.finalizers().len();
    obj.finalizers_mut().retain(|f| f != finalizer);
    obj.finalizers().len() != before
}

/// Make sure the stored object carries `finalizer`.
///
/// Returns the stored object, or `None` when it no longer exists.
pub async fn ensure_finalizer<K>(
    store: &dyn ResourceStore<K>,
    namespace: &str,
    name: &str,
    finalizer: &str,
) -> Result<Option<K>>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    edit_with_retry(store, namespace, name, |obj| add_finalizer(obj, finalizer))
        .await
        .context(format!("add finalizer {} to {}", finalizer, name))
}

/// Make sure the stored object no longer carries `finalizer`.
pub async fn release_finalizer<K>(
    store: &dyn ResourceStore<K>,
    namespace: &str,
    name: &str,
    finalizer: &str,
) -> Result<()>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    edit_with_retry(store, namespace, name, |obj| remove_finalizer(obj, finalizer))
        .await
        .context(format!("remove finalizer {} from {}", finalizer, name))
        .map(|_| ())
}

/// Drop every finalizer with a merge patch. A missing object is fine.
pub async fn clear_finalizers<K>(store: &dyn ResourceStore<K>, namespace: &str, name: &str) -> Result<()>
where
    K: Send + Sync + 'static,
{
    match store
        .patch_merge(namespace, name, &json!({"metadata": {"finalizers": null}}))
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.context(format!("clear finalizers of {}", name))),
    }
}

async fn edit_with_retry<K, F>(
    store: &dyn ResourceStore<K>,
    namespace: &str,
    name: &str,
    mut edit: F,
) -> Result<Option<K>>
where
    K: Resource + Clone + Send + Sync + 'static,
    F: FnMut(&mut K) -> bool,
{
    let mut last = None;
    for attempt in 0..CONFLICT_RETRIES {
        let Some(mut obj) = store.get(namespace, name).await? else {
            return Ok(None);
        };
        if !edit(&mut obj) {
            return Ok(Some(obj));
        }
        match store.replace(namespace, &obj).await {
            Ok(updated) => return Ok(Some(updated)),
            Err(e) if e.is_conflict() => {
                debug!(%name, attempt, "Finalizer edit hit a version conflict, retrying");
                last = Some(e);
            }
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| Error::Internal(format!("finalizer edit on {} gave up", name))))
}

// =============================================================================
// Owner references
// =============================================================================

/// Controller owner reference to `owner` with blocking deletion.
pub fn controller_owner_ref<K>(owner: &K) -> Result<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::Invariant(format!(
            "{} has no name or uid to own children with",
            K::kind(&())
        ))
    })
}

/// Whether `obj` is owned by exactly this `owner` (kind and uid).
pub fn is_owned_by<O, K>(obj: &K, owner: &O) -> bool
where
    O: Resource<DynamicType = ()>,
    K: ResourceExt,
{
    let kind = O::kind(&());
    obj.owner_references()
        .iter()
        .any(|r| r.kind == kind && Some(&r.uid) == owner.meta().uid.as_ref())
}

/// Point every claim of `cluster` at the cluster's current kind and uid.
///
/// Claims written by an older controller may reference the cluster under a
/// previous API version or uid. Returns how many claims were rewritten.
pub async fn migrate_claim_owners(
    store: &dyn ResourceStore<BlockDeviceClaim>,
    cluster: &CStorPoolCluster,
) -> Result<usize> {
    let namespace = cluster.namespace_or_default();
    let cluster_name = cluster.name_any();
    let owner = controller_owner_ref(cluster)?;
    let claims = store
        .list(&namespace, &Selector::eq(CLUSTER_LABEL, &cluster_name))
        .await?;

    let mut migrated = 0;
    for claim in claims.iter().filter(|c| !is_owned_by(*c, cluster)) {
        let name = claim.name_any();
        let rewritten = edit_with_retry(store, &namespace, &name, |c| {
            let refs = c.owner_references_mut();
            let before = refs.clone();
            refs.retain(|r| r.name != cluster_name);
            refs.push(owner.clone());
            *refs != before
        })
        .await
        .context(format!("migrate owner of block device claim {}", name))?;
        if rewritten.is_some() {
            info!(claim = %name, cluster = %cluster_name, "Migrated claim owner reference");
            migrated += 1;
        }
    }
    Ok(migrated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryStore;
    use crate::crd::{BlockDeviceClaimSpec, CStorPoolClusterSpec};
    use assert_matches::assert_matches;

    const NS: &str = "openebs";

    #[test]
    fn test_add_remove_are_idempotent() {
        let mut c = CStorPoolCluster::new("c1", CStorPoolClusterSpec::default());
        assert!(!has_finalizer(&c, "x"));
        assert!(add_finalizer(&mut c, "x"));
        assert!(!add_finalizer(&mut c, "x"));
        assert_eq!(c.finalizers(), &["x".to_string()]);
        assert!(remove_finalizer(&mut c, "x"));
        assert!(!remove_finalizer(&mut c, "x"));
        assert!(c.finalizers().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_and_release_through_store() {
        let store = InMemoryStore::<CStorPoolCluster>::new();
        store
            .create(NS, &CStorPoolCluster::new("c1", CStorPoolClusterSpec::default()))
            .await
            .unwrap();

        let updated = ensure_finalizer(&store, NS, "c1", "f").await.unwrap().unwrap();
        assert!(has_finalizer(&updated, "f"));
        let writes = store.mutation_count();
        ensure_finalizer(&store, NS, "c1", "f").await.unwrap();
        assert_eq!(store.mutation_count(), writes);

        release_finalizer(&store, NS, "c1", "f").await.unwrap();
        assert!(store.find(NS, "c1").unwrap().finalizers().is_empty());

        assert_matches!(ensure_finalizer(&store, NS, "gone", "f").await, Ok(None));
    }

    #[tokio::test]
    async fn test_clear_finalizers_lets_deletion_finish() {
        let store = InMemoryStore::<CStorPoolCluster>::new();
        let mut c = CStorPoolCluster::new("c1", CStorPoolClusterSpec::default());
        c.metadata.finalizers = Some(vec!["a".into(), "b".into()]);
        store.create(NS, &c).await.unwrap();
        store.delete(NS, "c1").await.unwrap();

        clear_finalizers(&store, NS, "c1").await.unwrap();
        assert!(store.find(NS, "c1").is_none());
        clear_finalizers(&store, NS, "c1").await.unwrap();
    }

    #[tokio::test]
    async fn test_migrate_claim_owners() {
        let clusters = InMemoryStore::<CStorPoolCluster>::new();
        let claims = InMemoryStore::<BlockDeviceClaim>::new();
        let cluster = clusters
            .create(NS, &CStorPoolCluster::new("c1", CStorPoolClusterSpec::default()))
            .await
            .unwrap();

        let mut stale = BlockDeviceClaim::new("bdc-cstor-1", BlockDeviceClaimSpec::default());
        stale.labels_mut().insert(CLUSTER_LABEL.into(), "c1".into());
        stale.owner_references_mut().push(OwnerReference {
            api_version: "openebs.io/v1alpha1".into(),
            kind: "CStorPoolCluster".into(),
            name: "c1".into(),
            uid: "old-uid".into(),
            ..Default::default()
        });
        claims.create(NS, &stale).await.unwrap();

        let mut current = BlockDeviceClaim::new("bdc-cstor-2", BlockDeviceClaimSpec::default());
        current.labels_mut().insert(CLUSTER_LABEL.into(), "c1".into());
        current
            .owner_references_mut()
            .push(controller_owner_ref(&cluster).unwrap());
        claims.create(NS, &current).await.unwrap();

        assert_eq!(migrate_claim_owners(&claims, &cluster).await.unwrap(), 1);
        let migrated = claims.find(NS, "bdc-cstor-1").unwrap();
        assert_eq!(migrated.owner_references().len(), 1);
        assert!(is_owned_by(&migrated, &cluster));

        // Nothing left to do
        let writes = claims.mutation_count();
        assert_eq!(migrate_claim_owners(&claims, &cluster).await.unwrap(), 0);
        assert_eq!(claims.mutation_count(), writes);
    }
}
