//! Volume Claim Reconciler
//!
//! Turns a published `CStorVolumeClaim` into its target service, volume,
//! target workload and replicas, then keeps replica count, capacity and the
//! volume's disruption budget converged while the claim is bound.
//!
//! Once bound, the claim's policy carries the pools its replicas should live
//! on and its status the pools they are known to live on. Growing the first
//! list scales replicas up, shrinking it scales them down one at a time.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::context::Context;
use super::disruption::{delete_volume_budgets, reconcile_volume_budget};
use super::pool_cluster::defer;
use super::finalizer::{clear_finalizers, controller_owner_ref, ensure_finalizer, has_finalizer};
use super::workload::{target_deployment, target_service};
use super::workqueue::{ObjectKey, Reconciler};
use crate::crd::keys::{
    CLAIM_FINALIZER, CLONE_LABEL, CLUSTER_LABEL, IQN_PREFIX, ISCSI_PORT,
    PERSISTENT_VOLUME_LABEL, POOL_HOSTNAME_ANNOTATION, POOL_INSTANCE_NAME_LABEL,
    POOL_INSTANCE_UID_LABEL, REPLICA_FINALIZER, SNAPSHOT_KEY, SOURCE_VOLUME_KEY,
    VERSION_LABEL, VOLUME_NAME_LABEL,
};
use crate::crd::quantity;
use crate::crd::{
    consistency_factor, CStorVolume, CStorVolumeClaim, CStorVolumeClaimStatus,
    CStorVolumePolicySpec, CStorVolumeReplica, CStorVolumeReplicaSpec, CStorVolumeSpec,
    ClaimCondition, ClaimConditionType, ClaimPhase, CloneSource, ReplicaPoolPolicy,
    VolumeReference,
};
use crate::domain::events::{ControllerEvent, EventReason};
use crate::domain::ports::{ResourceStore, Selector};
use crate::error::{Error, Result, ResultExt};
use crate::metrics;
use crate::placement::{distribute, DistributionRequest, PoolCandidate};

const RESIZE_CONDITIONS: [ClaimConditionType; 3] = [
    ClaimConditionType::Resizing,
    ClaimConditionType::ResizePending,
    ClaimConditionType::ResizeFailed,
];

/// Outcome of one replica placement round.
struct Placement {
    /// Pools holding a replica after the round
    pools: BTreeSet<String>,
    /// Set when fewer replicas could be placed than were pending
    shortfall: Option<Error>,
}

pub struct VolumeClaimReconciler {
    ctx: Arc<Context>,
}

impl VolumeClaimReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn reconcile_claim(&self, namespace: &str, name: &str) -> Result<()> {
        let Some(claim) = self.ctx.stores.volume_claims.get(namespace, name).await? else {
            debug!("Volume claim is gone");
            return Ok(());
        };

        if claim.is_being_deleted() {
            if has_finalizer(&claim, CLAIM_FINALIZER) {
                delete_volume_budgets(self.ctx.stores.disruption_budgets.as_ref(), namespace, name)
                    .await?;
                clear_finalizers(self.ctx.stores.volume_claims.as_ref(), namespace, name).await?;
                info!("Removed volume claim finalizer");
            }
            return Ok(());
        }

        if claim.publish_node().is_none() {
            self.ctx
                .publish(ControllerEvent::normal(
                    &claim,
                    EventReason::Provisioning,
                    "waiting for the volume to be published to a node",
                ))
                .await;
            return Ok(());
        }

        let source = match claim.clone_source() {
            Ok(source) => source,
            Err(e) => return Err(self.reject(&claim, e).await),
        };
        let Some(cluster) = claim.cluster_name().map(str::to_string) else {
            let e = Error::Validation(format!("volume claim {} has no {} label", name, CLUSTER_LABEL));
            return Err(self.reject(&claim, e).await);
        };

        match claim.phase() {
            ClaimPhase::Pending => self.provision(claim, &cluster, source.as_ref()).await,
            ClaimPhase::Bound => self.maintain(claim, &cluster, source.as_ref()).await,
            ClaimPhase::Failed => Ok(()),
        }
    }

    async fn reject(&self, claim: &CStorVolumeClaim, e: Error) -> Error {
        self.ctx
            .publish(ControllerEvent::warning(claim, EventReason::SyncFailed, e.to_string()))
            .await;
        e
    }

    // =========================================================================
    // Pending
    // =========================================================================

    async fn provision(
        &self,
        claim: CStorVolumeClaim,
        cluster: &str,
        source: Option<&CloneSource>,
    ) -> Result<()> {
        let namespace = claim.namespace().unwrap_or_default();
        let name = claim.name_any();
        let stores = &self.ctx.stores;

        let Some(claim) = ensure_finalizer(
            stores.volume_claims.as_ref(),
            &namespace,
            &name,
            CLAIM_FINALIZER,
        )
        .await?
        else {
            return Ok(());
        };

        let policy = match self.volume_policy(&claim).await {
            Ok(policy) => policy,
            Err(e) => return Err(self.reject(&claim, e).await),
        };
        let stored_spec = claim.spec.clone();
        let mut claim = claim;
        claim.spec.policy = policy;

        let service = get_or_create(stores.services.as_ref(), &namespace, target_service(&claim)?).await?;
        let target_ip = service
            .spec
            .as_ref()
            .and_then(|s| s.cluster_ip.clone())
            .unwrap_or_default();

        let volume = get_or_create(
            stores.volumes.as_ref(),
            &namespace,
            self.build_volume(&claim, cluster, &target_ip, source)?,
        )
        .await?;
        get_or_create(
            stores.deployments.as_ref(),
            &namespace,
            target_deployment(&volume, &self.ctx.config.images, &claim.spec.policy.target)?,
        )
        .await?;

        let placement = self.place_replicas(&claim, &volume, cluster, source).await?;
        if placement.pools.is_empty() {
            // Nothing placed yet; stay pending and retry.
            return Err(placement.shortfall.unwrap_or_else(|| {
                Error::Contention(format!("no replica of {} could be placed", name))
            }));
        }

        claim.spec.cstor_volume_ref = Some(VolumeReference {
            name: volume.name_any(),
            namespace: namespace.clone(),
            uid: volume.uid(),
        });
        claim.spec.policy.replica_pool = ReplicaPoolPolicy::from_names(&placement.pools);
        if claim.spec != stored_spec {
            claim = stores
                .volume_claims
                .replace(&namespace, &claim)
                .await
                .context("set volume reference")?;
        }

        let status = claim.status.get_or_insert_with(CStorVolumeClaimStatus::default);
        status.phase = ClaimPhase::Bound;
        status.capacity = Some(claim.spec.capacity.clone());
        status.pool_info = placement.pools.iter().cloned().collect();
        stores
            .volume_claims
            .replace_status(&namespace, &claim)
            .await
            .context("mark volume claim bound")?;
        info!(volume = %volume.name_any(), replicas = placement.pools.len(), "Volume claim bound");

        match placement.shortfall {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Policy the claim is provisioned with: the `CStorVolumePolicy` it
    /// names, else the policy already on the claim.
    async fn volume_policy(&self, claim: &CStorVolumeClaim) -> Result<CStorVolumePolicySpec> {
        let Some(name) = claim.policy_name() else {
            return Ok(claim.spec.policy.clone());
        };
        let namespace = claim.namespace().unwrap_or_default();
        match self.ctx.stores.volume_policies.get(&namespace, name).await? {
            Some(policy) => {
                debug!(policy = %name, "Using volume policy");
                Ok(policy.spec)
            }
            None => Err(Error::NotFound {
                kind: "CStorVolumePolicy".to_string(),
                name: name.to_string(),
            }),
        }
    }

    fn build_volume(
        &self,
        claim: &CStorVolumeClaim,
        cluster: &str,
        target_ip: &str,
        source: Option<&CloneSource>,
    ) -> Result<CStorVolume> {
        let name = claim.name_any();
        let mut labels = std::collections::BTreeMap::from([
            (CLUSTER_LABEL.to_string(), cluster.to_string()),
            (PERSISTENT_VOLUME_LABEL.to_string(), name.clone()),
            (VERSION_LABEL.to_string(), self.ctx.config.version.clone()),
        ]);
        if let Some(source) = source {
            labels.insert(SOURCE_VOLUME_KEY.to_string(), source.volume.clone());
        }
        let replicas = claim.spec.replica_count;

        Ok(CStorVolume {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: claim.namespace(),
                labels: Some(labels),
                owner_references: Some(vec![controller_owner_ref(claim)?]),
                ..Default::default()
            },
            spec: CStorVolumeSpec {
                capacity: claim.spec.capacity.clone(),
                target_ip: target_ip.to_string(),
                target_port: ISCSI_PORT.to_string(),
                iqn: format!("{}:{}", IQN_PREFIX, name),
                target_portal: format!("{}:{}", target_ip, ISCSI_PORT),
                replication_factor: replicas,
                desired_replication_factor: replicas,
                consistency_factor: consistency_factor(replicas),
                replica_details: Default::default(),
            },
            status: None,
        })
    }

    // =========================================================================
    // Replicas
    // =========================================================================

    /// Place the replicas the volume is missing, as many as healthy pools
    /// allow.
    async fn place_replicas(
        &self,
        claim: &CStorVolumeClaim,
        volume: &CStorVolume,
        cluster: &str,
        source: Option<&CloneSource>,
    ) -> Result<Placement> {
        let namespace = volume.namespace().unwrap_or_default();
        let volume_name = volume.name_any();
        let stores = &self.ctx.stores;

        let existing = self.replicas_of(&namespace, &volume_name).await?;
        let used: BTreeSet<String> = existing
            .iter()
            .filter_map(|r| r.pool_name().map(str::to_string))
            .collect();
        let pending = (claim.spec.replica_count as usize).saturating_sub(existing.len());
        if pending == 0 {
            return Ok(Placement {
                pools: used,
                shortfall: None,
            });
        }

        let healthy: Vec<PoolCandidate> = stores
            .pool_instances
            .list(&namespace, &Selector::eq(CLUSTER_LABEL, cluster))
            .await?
            .iter()
            .filter(|i| i.is_online() && !i.is_being_deleted())
            .map(|i| PoolCandidate {
                name: i.name_any(),
                uid: i.uid().unwrap_or_default(),
                host: i.host().to_string(),
            })
            .collect();

        let source_pools = match source {
            Some(src) => Some(
                self.replicas_of(&namespace, &src.volume)
                    .await?
                    .iter()
                    .filter_map(|r| r.pool_name().map(str::to_string))
                    .collect::<BTreeSet<_>>(),
            ),
            None => None,
        };

        let request = DistributionRequest {
            pending,
            healthy_pools: &healthy,
            used_pools: &used,
            clone_source_pools: source_pools.as_ref(),
            preferred_host: claim
                .wants_replica_affinity()
                .then(|| claim.publish_node())
                .flatten(),
        };
        let seed = self.ctx.placement_seed();
        let (chosen, shortfall) = match distribute(&request, seed) {
            Ok(chosen) => (chosen, None),
            Err(Error::InsufficientPools {
                required,
                available,
            }) => {
                let partial = DistributionRequest {
                    pending: available,
                    ..request.clone()
                };
                (
                    distribute(&partial, seed)?,
                    Some(Error::InsufficientPools {
                        required,
                        available,
                    }),
                )
            }
            Err(e) => return Err(e),
        };

        let mut pools = used;
        for pool in &chosen {
            self.create_replica(volume, pool, source).await?;
            pools.insert(pool.name.clone());
        }

        if let Some(e) = &shortfall {
            warn!(volume = %volume_name, error = %e, "Not enough healthy pools for every replica");
            self.ctx
                .publish(ControllerEvent::warning(
                    claim,
                    EventReason::Provisioning,
                    format!("placed {} of {} pending replicas: {}", chosen.len(), pending, e),
                ))
                .await;
        }
        Ok(Placement { pools, shortfall })
    }

    async fn create_replica(
        &self,
        volume: &CStorVolume,
        pool: &PoolCandidate,
        source: Option<&CloneSource>,
    ) -> Result<()> {
        let volume_name = volume.name_any();
        let name = CStorVolumeReplica::name_for(&volume_name, &pool.name);

        let mut labels = std::collections::BTreeMap::from([
            (POOL_INSTANCE_NAME_LABEL.to_string(), pool.name.clone()),
            (POOL_INSTANCE_UID_LABEL.to_string(), pool.uid.clone()),
            (PERSISTENT_VOLUME_LABEL.to_string(), volume_name.clone()),
            (VOLUME_NAME_LABEL.to_string(), volume_name.clone()),
            (VERSION_LABEL.to_string(), self.ctx.config.version.clone()),
        ]);
        let mut annotations = std::collections::BTreeMap::from([(
            POOL_HOSTNAME_ANNOTATION.to_string(),
            pool.host.clone(),
        )]);
        if let Some(source) = source {
            labels.insert(CLONE_LABEL.to_string(), "true".to_string());
            annotations.insert(SOURCE_VOLUME_KEY.to_string(), source.volume.clone());
            annotations.insert(SNAPSHOT_KEY.to_string(), source.snapshot.clone());
        }

        let replica = CStorVolumeReplica {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: volume.namespace(),
                labels: Some(labels),
                annotations: Some(annotations),
                finalizers: Some(vec![REPLICA_FINALIZER.to_string()]),
                owner_references: Some(vec![controller_owner_ref(volume)?]),
                ..Default::default()
            },
            spec: CStorVolumeReplicaSpec {
                target_ip: volume.spec.target_ip.clone(),
                replica_id: CStorVolumeReplica::id_for(&volume_name, &pool.name),
                capacity: volume.spec.capacity.clone(),
            },
            status: None,
        };

        let namespace = volume.namespace().unwrap_or_default();
        match self.ctx.stores.volume_replicas.create(&namespace, &replica).await {
            Ok(_) => {
                metrics::record_write("CStorVolumeReplica", "create");
                info!(replica = %name, pool = %pool.name, "Created volume replica");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e.context(format!("create volume replica {}", name))),
        }
    }

    /// Live replicas of `volume`; terminating ones are left out.
    async fn replicas_of(&self, namespace: &str, volume: &str) -> Result<Vec<CStorVolumeReplica>> {
        self.ctx
            .stores
            .volume_replicas
            .list(namespace, &Selector::eq(PERSISTENT_VOLUME_LABEL, volume))
            .await
            .map(|replicas| {
                replicas
                    .into_iter()
                    .filter(|r| r.metadata.deletion_timestamp.is_none())
                    .collect()
            })
    }

    /// Live replicas of `volume` keyed by pool instance.
    async fn replicas_by_pool(
        &self,
        namespace: &str,
        volume: &str,
    ) -> Result<BTreeMap<String, CStorVolumeReplica>> {
        Ok(self
            .replicas_of(namespace, volume)
            .await?
            .into_iter()
            .filter_map(|r| {
                let pool = r.pool_name()?.to_string();
                Some((pool, r))
            })
            .collect())
    }

    /// Delete replicas whose pool instance no longer exists.
    async fn remove_stranded_replicas(
        &self,
        claim: &CStorVolumeClaim,
        volume: &CStorVolume,
        cluster: &str,
    ) -> Result<()> {
        let namespace = volume.namespace().unwrap_or_default();
        let pools: BTreeSet<String> = self
            .ctx
            .stores
            .pool_instances
            .list(&namespace, &Selector::eq(CLUSTER_LABEL, cluster))
            .await?
            .iter()
            .map(|i| i.name_any())
            .collect();

        let store = self.ctx.stores.volume_replicas.as_ref();
        for replica in self.replicas_of(&namespace, &volume.name_any()).await? {
            let pool = replica.pool_name().unwrap_or_default();
            if pools.contains(pool) {
                continue;
            }
            let name = replica.name_any();
            error!(replica = %name, %pool, "Volume replica points at a missing pool instance; deleting it");
            clear_finalizers(store, &namespace, &name).await?;
            store
                .delete(&namespace, &name)
                .await
                .context(format!("delete stranded replica {}", name))?;
            metrics::record_write("CStorVolumeReplica", "delete");
            self.ctx
                .publish(ControllerEvent::warning(
                    claim,
                    EventReason::SyncFailed,
                    format!("deleted replica {} of missing pool {}", name, pool),
                ))
                .await;
        }
        Ok(())
    }

    // =========================================================================
    // Bound
    // =========================================================================

    async fn maintain(
        &self,
        claim: CStorVolumeClaim,
        cluster: &str,
        source: Option<&CloneSource>,
    ) -> Result<()> {
        let namespace = claim.namespace().unwrap_or_default();
        let name = claim.name_any();
        let stores = &self.ctx.stores;
        let Some(volume) = stores.volumes.get(&namespace, &name).await? else {
            error!("Bound volume claim has no volume");
            return Err(Error::Invariant(format!("volume {} of bound claim is missing", name)));
        };

        let mut failure = None;
        defer(
            &mut failure,
            self.remove_stranded_replicas(&claim, &volume, cluster).await,
        );
        defer(
            &mut failure,
            self.reconcile_replica_pools(&claim, &volume, cluster, source)
                .await,
        );

        // Replica bookkeeping may have rewritten the claim
        let claim = match stores.volume_claims.get(&namespace, &name).await? {
            Some(claim) => claim,
            None => return failure.map_or(Ok(()), Err),
        };
        defer(&mut failure, self.resize(claim.clone(), &volume).await);

        let mut pools = claim.current_pools();
        if pools.is_empty() {
            pools = self
                .replicas_by_pool(&namespace, &name)
                .await?
                .into_keys()
                .collect();
        }
        defer(
            &mut failure,
            reconcile_volume_budget(
                stores.disruption_budgets.as_ref(),
                &volume,
                &pools,
                pools.len() as u32,
                claim.spec.disruption_budget,
            )
            .await,
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Converge the replicas on the claim's pool lists.
    ///
    /// While the desired and current lists agree, missing replicas are topped
    /// up to the replica count and both lists follow the live replicas.
    async fn reconcile_replica_pools(
        &self,
        claim: &CStorVolumeClaim,
        volume: &CStorVolume,
        cluster: &str,
        source: Option<&CloneSource>,
    ) -> Result<()> {
        let desired = claim.desired_pools();
        let current = claim.current_pools();
        if desired == current {
            let placement = self.place_replicas(claim, volume, cluster, source).await?;
            self.record_pools(claim, &placement.pools).await?;
            return placement.shortfall.map_or(Ok(()), Err);
        }

        let scaled = match desired.len().cmp(&current.len()) {
            Ordering::Greater => self.scale_up(claim, volume, cluster, &desired, &current).await,
            Ordering::Less => self.scale_down(claim, volume, &desired, &current).await,
            Ordering::Equal => {
                warn!(?desired, ?current, "Replica pools renamed without a size change");
                self.ctx
                    .publish(ControllerEvent::warning(
                        claim,
                        EventReason::Migration,
                        "migration of volume replicas is not supported",
                    ))
                    .await;
                return Ok(());
            }
        };
        if let Err(e) = &scaled {
            self.ctx
                .publish(ControllerEvent::warning(
                    claim,
                    EventReason::ScalingVolumeReplicas,
                    e.to_string(),
                ))
                .await;
        }
        scaled
    }

    /// Point both pool lists at `pools` when either names anything else.
    async fn record_pools(&self, claim: &CStorVolumeClaim, pools: &BTreeSet<String>) -> Result<()> {
        if claim.desired_pools() == *pools && claim.current_pools() == *pools {
            return Ok(());
        }
        let namespace = claim.namespace().unwrap_or_default();
        let store = self.ctx.stores.volume_claims.as_ref();

        let mut claim = claim.clone();
        if claim.desired_pools() != *pools {
            claim.spec.policy.replica_pool = ReplicaPoolPolicy::from_names(pools);
            claim = store
                .replace(&namespace, &claim)
                .await
                .context("record replica pools")?;
        }
        let status = claim.status.get_or_insert_with(CStorVolumeClaimStatus::default);
        status.pool_info = pools.iter().cloned().collect();
        store
            .replace_status(&namespace, &claim)
            .await
            .context("record replica pools")?;
        debug!(?pools, "Recorded replica pools");
        Ok(())
    }

    /// Add replicas on the pools the desired list gained.
    ///
    /// A new pool counts once its replica is online and known to the target.
    /// Until then the pass fails with contention so the key is retried.
    async fn scale_up(
        &self,
        claim: &CStorVolumeClaim,
        volume: &CStorVolume,
        cluster: &str,
        desired: &BTreeSet<String>,
        current: &BTreeSet<String>,
    ) -> Result<()> {
        let namespace = volume.namespace().unwrap_or_default();
        let volume_name = volume.name_any();
        let store = self.ctx.stores.volumes.as_ref();
        let target = desired.len() as u32;

        let mut volume = volume.clone();
        if volume.spec.desired_replication_factor < target {
            volume.spec.desired_replication_factor = target;
            volume = store
                .replace(&namespace, &volume)
                .await
                .context("raise desired replication factor")?;
        }

        let added: Vec<&String> = desired.difference(current).collect();
        let existing = self.replicas_by_pool(&namespace, &volume_name).await?;
        let mut failure = None;
        for pool in &added {
            if !existing.contains_key(pool.as_str()) {
                defer(&mut failure, self.add_replica(&volume, cluster, pool).await);
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let replicas = self.replicas_by_pool(&namespace, &volume_name).await?;
        let known = &volume.spec.replica_details.known_replicas;
        let joined: Vec<String> = added
            .iter()
            .filter(|pool| {
                replicas.get(pool.as_str()).is_some_and(|r| {
                    r.is_online() && known.contains_key(&r.spec.replica_id)
                })
            })
            .map(|pool| pool.to_string())
            .collect();
        let in_progress = || {
            Error::Contention(format!(
                "scaling replicas from {} to {} in progress",
                current.len(),
                desired.len()
            ))
        };
        if joined.is_empty() {
            return Err(in_progress());
        }

        let members: BTreeSet<String> = current.iter().cloned().chain(joined).collect();
        let count = members.len() as u32;
        volume.spec.replication_factor = count;
        volume.spec.consistency_factor = consistency_factor(count);
        store
            .replace(&namespace, &volume)
            .await
            .context("record scaled up replicas")?;
        self.finish_scaling(claim, &members).await?;

        info!(replicas = count, "Scaled up volume replicas");
        self.ctx
            .publish(ControllerEvent::normal(
                claim,
                EventReason::ScalingVolumeReplicas,
                format!("volume has {} of {} desired replicas", count, target),
            ))
            .await;
        if members != *desired {
            return Err(in_progress());
        }
        Ok(())
    }

    /// Create a replica on a pool named by a scale-up.
    async fn add_replica(&self, volume: &CStorVolume, cluster: &str, pool: &str) -> Result<()> {
        let namespace = volume.namespace().unwrap_or_default();
        let Some(instance) = self.ctx.stores.pool_instances.get(&namespace, pool).await? else {
            return Err(Error::NotFound {
                kind: "CStorPoolInstance".to_string(),
                name: pool.to_string(),
            });
        };
        if instance.cluster_name() != Some(cluster) {
            return Err(Error::Validation(format!(
                "pool {} does not belong to pool cluster {}",
                pool, cluster
            )));
        }
        if !instance.is_online() || instance.is_being_deleted() {
            return Err(Error::Contention(format!("pool {} is not online", pool)));
        }
        let candidate = PoolCandidate {
            name: instance.name_any(),
            uid: instance.uid().unwrap_or_default(),
            host: instance.host().to_string(),
        };
        self.create_replica(volume, &candidate, None).await
    }

    /// Remove the replica on the one pool the desired list dropped.
    async fn scale_down(
        &self,
        claim: &CStorVolumeClaim,
        volume: &CStorVolume,
        desired: &BTreeSet<String>,
        current: &BTreeSet<String>,
    ) -> Result<()> {
        if desired.is_empty() {
            return Err(Error::Validation("a volume needs at least one replica".into()));
        }
        if desired.difference(current).next().is_some() {
            return Err(Error::Validation(
                "replica pools can not be added and removed in one change".into(),
            ));
        }
        let removed: Vec<&String> = current.difference(desired).collect();
        let [pool] = removed.as_slice() else {
            return Err(Error::Validation(format!(
                "only one replica can be removed at a time, {} requested",
                removed.len()
            )));
        };

        let namespace = volume.namespace().unwrap_or_default();
        let volume_name = volume.name_any();
        let stores = &self.ctx.stores;
        let target = desired.len() as u32;
        let replica_name = CStorVolumeReplica::name_for(&volume_name, pool);
        let replica = stores.volume_replicas.get(&namespace, &replica_name).await?;

        let mut updated = volume.clone();
        updated.spec.desired_replication_factor = target;
        updated.spec.replication_factor = target;
        updated.spec.consistency_factor = consistency_factor(target);
        if let Some(replica) = &replica {
            updated
                .spec
                .replica_details
                .known_replicas
                .remove(&replica.spec.replica_id);
        }
        if updated.spec != volume.spec {
            stores
                .volumes
                .replace(&namespace, &updated)
                .await
                .context("lower replication factor")?;
        }

        if replica.is_some() {
            let store = stores.volume_replicas.as_ref();
            clear_finalizers(store, &namespace, &replica_name).await?;
            match store.delete(&namespace, &replica_name).await {
                Ok(()) => metrics::record_write("CStorVolumeReplica", "delete"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.context(format!("delete replica {}", replica_name))),
            }
        }
        self.finish_scaling(claim, desired).await?;

        info!(replica = %replica_name, %pool, replicas = target, "Scaled down volume replicas");
        self.ctx
            .publish(ControllerEvent::normal(
                claim,
                EventReason::ScalingVolumeReplicas,
                format!("removed replica on pool {}, {} remain", pool, target),
            ))
            .await;
        Ok(())
    }

    /// Record the pools a scale step settled on. The replica count follows
    /// once every desired pool is in.
    async fn finish_scaling(&self, claim: &CStorVolumeClaim, pools: &BTreeSet<String>) -> Result<()> {
        let namespace = claim.namespace().unwrap_or_default();
        let store = self.ctx.stores.volume_claims.as_ref();
        let count = pools.len() as u32;

        let mut claim = claim.clone();
        if claim.desired_pools() == *pools && claim.spec.replica_count != count {
            claim.spec.replica_count = count;
            claim = store
                .replace(&namespace, &claim)
                .await
                .context("record replica count")?;
        }
        let status = claim.status.get_or_insert_with(CStorVolumeClaimStatus::default);
        status.pool_info = pools.iter().cloned().collect();
        store
            .replace_status(&namespace, &claim)
            .await
            .context("record replica pools")?;
        Ok(())
    }

    /// Drive the volume toward the claim's requested capacity.
    async fn resize(&self, mut claim: CStorVolumeClaim, volume: &CStorVolume) -> Result<()> {
        let Some(bound) = claim.status_capacity().map(str::to_string) else {
            return Ok(());
        };
        let requested = claim.spec.capacity.clone();
        if quantity::compare(&requested, &bound)? != std::cmp::Ordering::Greater {
            return Ok(());
        }
        let namespace = claim.namespace().unwrap_or_default();
        let stores = &self.ctx.stores;

        if let Some(served) = volume.status_capacity() {
            if quantity::compare(served, &requested)? != std::cmp::Ordering::Less {
                let status = claim.status.get_or_insert_with(CStorVolumeClaimStatus::default);
                status.capacity = Some(requested.clone());
                status.conditions.retain(|c| !RESIZE_CONDITIONS.contains(&c.type_));
                stores
                    .volume_claims
                    .replace_status(&namespace, &claim)
                    .await
                    .context("finish volume resize")?;
                info!(from = %bound, to = %requested, "Volume resize finished");
                self.ctx
                    .publish(ControllerEvent::normal(
                        &claim,
                        EventReason::ResizeSucceeded,
                        format!("resized from {} to {}", bound, requested),
                    ))
                    .await;
                return Ok(());
            }
        }

        if quantity::compare(&volume.spec.capacity, &requested)? != std::cmp::Ordering::Less {
            debug!(to = %requested, "Volume resize in progress");
            self.ctx
                .publish(ControllerEvent::normal(
                    &claim,
                    EventReason::Resizing,
                    format!("resize to {} in progress", requested),
                ))
                .await;
            return Ok(());
        }

        let patched = stores
            .volumes
            .patch_merge(
                &namespace,
                &volume.name_any(),
                &json!({"spec": {"capacity": requested}}),
            )
            .await;
        if let Err(e) = patched {
            self.ctx
                .publish(ControllerEvent::warning(
                    &claim,
                    EventReason::ResizeFailed,
                    format!("failed to resize volume to {}: {}", requested, e),
                ))
                .await;
            return Err(e.context("patch volume capacity"));
        }

        if !claim.has_condition(ClaimConditionType::Resizing) {
            let status = claim.status.get_or_insert_with(CStorVolumeClaimStatus::default);
            status.conditions.push(ClaimCondition::new(
                ClaimConditionType::Resizing,
                "Resizing",
                &format!("{} -> {}", bound, requested),
            ));
            stores
                .volume_claims
                .replace_status(&namespace, &claim)
                .await
                .context("mark volume claim resizing")?;
        }
        info!(from = %bound, to = %requested, "Started volume resize");
        self.ctx
            .publish(ControllerEvent::normal(
                &claim,
                EventReason::Resizing,
                format!("resizing from {} to {}", bound, requested),
            ))
            .await;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for VolumeClaimReconciler {
    fn name(&self) -> &'static str {
        "volume-claim"
    }

    #[instrument(skip(self), fields(claim = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        self.reconcile_claim(&key.namespace, &key.name).await
    }
}

/// Return the stored object named like `obj`, creating it when missing.
async fn get_or_create<K>(store: &dyn ResourceStore<K>, namespace: &str, obj: K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    let name = obj.name_any();
    let kind = K::kind(&()).to_string();
    if let Some(existing) = store.get(namespace, &name).await? {
        return Ok(existing);
    }
    match store.create(namespace, &obj).await {
        Ok(created) => {
            metrics::record_write(&kind, "create");
            info!(%kind, %name, "Created object");
            Ok(created)
        }
        Err(e) if e.is_already_exists() => {
            store
                .get(namespace, &name)
                .await?
                .ok_or_else(|| Error::NotFound { kind, name })
        }
        Err(e) => Err(e.context(format!("create {} {}", kind, name))),
    }
}
