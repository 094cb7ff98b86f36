//! Provisioning lease.
//!
//! Scale-up of a pool cluster is serialized across controller replicas by an
//! annotation on the cluster itself:
//!
//! ```json
//! {"holder":"openebs/cstor-operator-7d9c","leaderTransition":2,"expires":"2026-01-01T00:00:00Z"}
//! ```
//!
//! Taking or giving up the lease is a `replace` carrying the cluster's
//! `resourceVersion`, so two controllers racing for it cannot both win.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crd::{keys::LEASE_ANNOTATION, CStorPoolCluster};
use crate::domain::ports::ResourceStore;
use crate::error::{Error, Result};

/// Contents of the lease annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    #[serde(default)]
    pub holder: String,

    /// Times the lease changed hands
    #[serde(default)]
    pub leader_transition: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

impl LeaseRecord {
    /// Read the lease from `cluster`. A malformed annotation reads as free.
    pub fn read(cluster: &CStorPoolCluster) -> Self {
        let Some(raw) = cluster.annotations().get(LEASE_ANNOTATION) else {
            return Self::default();
        };
        serde_json::from_str(raw).unwrap_or_else(|e| {
            warn!(cluster = %cluster.name_any(), error = %e, "Ignoring malformed lease annotation");
            Self::default()
        })
    }

    /// Whether `holder` may take the lease at `now`.
    pub fn available_to(&self, holder: &str, now: DateTime<Utc>) -> bool {
        self.holder.is_empty()
            || self.holder == holder
            || self.expires.map(|e| e <= now).unwrap_or(true)
    }
}

/// Lease operations for one controller identity.
pub struct ClusterLease<'a> {
    store: &'a dyn ResourceStore<CStorPoolCluster>,
    holder: &'a str,
    duration: Duration,
}

impl<'a> ClusterLease<'a> {
    pub fn new(
        store: &'a dyn ResourceStore<CStorPoolCluster>,
        holder: &'a str,
        duration: Duration,
    ) -> Self {
        Self {
            store,
            holder,
            duration,
        }
    }

    /// Take or renew the lease on `cluster`.
    ///
    /// Fails with `Contention` while another holder's lease is live and with
    /// `Conflict` when the cluster changed underneath. Returns the updated
    /// cluster.
    pub async fn acquire(&self, cluster: &CStorPoolCluster) -> Result<CStorPoolCluster> {
        let now = Utc::now();
        let current = LeaseRecord::read(cluster);
        if !current.available_to(self.holder, now) {
            return Err(Error::Contention(format!(
                "provisioning lease on {} is held by {} until {}",
                cluster.name_any(),
                current.holder,
                current
                    .expires
                    .map(|e| e.to_rfc3339())
                    .unwrap_or_default()
            )));
        }

        let leader_transition = if current.holder == self.holder {
            current.leader_transition
        } else {
            current.leader_transition.saturating_add(1)
        };
        let expires = chrono::Duration::from_std(self.duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d));
        let next = LeaseRecord {
            holder: self.holder.to_string(),
            leader_transition,
            expires,
        };

        let mut updated = cluster.clone();
        updated
            .annotations_mut()
            .insert(LEASE_ANNOTATION.to_string(), serde_json::to_string(&next)?);
        let namespace = cluster.namespace_or_default();
        let stored = self.store.replace(&namespace, &updated).await?;
        debug!(cluster = %cluster.name_any(), holder = %self.holder, "Acquired provisioning lease");
        Ok(stored)
    }

    /// Give up the lease on the named cluster if this controller holds it.
    pub async fn release(&self, namespace: &str, name: &str) -> Result<()> {
        for _ in 0..super::finalizer::CONFLICT_RETRIES {
            let Some(cluster) = self.store.get(namespace, name).await? else {
                return Ok(());
            };
            let current = LeaseRecord::read(&cluster);
            if current.holder != self.holder {
                return Ok(());
            }

            let released = LeaseRecord {
                holder: String::new(),
                leader_transition: current.leader_transition,
                expires: None,
            };
            let mut updated = cluster;
            updated
                .annotations_mut()
                .insert(LEASE_ANNOTATION.to_string(), serde_json::to_string(&released)?);
            match self.store.replace(namespace, &updated).await {
                Ok(_) => {
                    info!(cluster = %name, "Released provisioning lease");
                    return Ok(());
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict {
            kind: "CStorPoolCluster".to_string(),
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryStore;
    use crate::crd::CStorPoolClusterSpec;
    use crate::error::ErrorCategory;
    use assert_matches::assert_matches;

    const NS: &str = "openebs";

    async fn seeded() -> (InMemoryStore<CStorPoolCluster>, CStorPoolCluster) {
        let store = InMemoryStore::new();
        let c = store
            .create(NS, &CStorPoolCluster::new("c1", CStorPoolClusterSpec::default()))
            .await
            .unwrap();
        (store, c)
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let (store, c) = seeded().await;
        let lease = ClusterLease::new(&store, "openebs/a", Duration::from_secs(60));

        let held = lease.acquire(&c).await.unwrap();
        let record = LeaseRecord::read(&held);
        assert_eq!(record.holder, "openebs/a");
        assert_eq!(record.leader_transition, 1);
        assert!(record.expires.unwrap() > Utc::now());

        // Renewal by the same holder keeps the transition count
        let renewed = lease.acquire(&held).await.unwrap();
        assert_eq!(LeaseRecord::read(&renewed).leader_transition, 1);

        lease.release(NS, "c1").await.unwrap();
        let after = LeaseRecord::read(&store.find(NS, "c1").unwrap());
        assert!(after.holder.is_empty());
        assert_eq!(after.leader_transition, 1);
    }

    #[tokio::test]
    async fn test_live_lease_blocks_other_holder() {
        let (store, c) = seeded().await;
        let a = ClusterLease::new(&store, "openebs/a", Duration::from_secs(60));
        let b = ClusterLease::new(&store, "openebs/b", Duration::from_secs(60));

        let held = a.acquire(&c).await.unwrap();
        let err = b.acquire(&held).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Contention);

        // Releasing someone else's lease is a no-op
        b.release(NS, "c1").await.unwrap();
        assert_eq!(
            LeaseRecord::read(&store.find(NS, "c1").unwrap()).holder,
            "openebs/a"
        );
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let (store, c) = seeded().await;
        let a = ClusterLease::new(&store, "openebs/a", Duration::from_secs(0));
        let b = ClusterLease::new(&store, "openebs/b", Duration::from_secs(60));

        let held = a.acquire(&c).await.unwrap();
        let taken = b.acquire(&held).await.unwrap();
        let record = LeaseRecord::read(&taken);
        assert_eq!(record.holder, "openebs/b");
        assert_eq!(record.leader_transition, 2);
    }

    #[tokio::test]
    async fn test_stale_cluster_conflicts() {
        let (store, c) = seeded().await;
        let a = ClusterLease::new(&store, "openebs/a", Duration::from_secs(60));
        a.acquire(&c).await.unwrap();

        // Second attempt from the pre-lease snapshot loses the race
        let b = ClusterLease::new(&store, "openebs/b", Duration::from_secs(60));
        assert_matches!(b.acquire(&c).await, Err(Error::Conflict { .. }));
    }

    #[test]
    fn test_malformed_annotation_reads_as_free() {
        let mut c = CStorPoolCluster::new("c1", CStorPoolClusterSpec::default());
        c.annotations_mut()
            .insert(LEASE_ANNOTATION.into(), "not json".into());
        let record = LeaseRecord::read(&c);
        assert!(record.available_to("anyone", Utc::now()));
    }
}
