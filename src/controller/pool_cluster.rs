//! Pool Cluster Reconciler
//!
//! Converges a `CStorPoolCluster` onto one `CStorPoolInstance` per pool spec,
//! each backed by claimed block devices and a pool-management workload.
//!
//! A pass runs every step even when an earlier one failed; the first failure
//! is returned at the end so the key is retried. Version stamping, adding the
//! finalizer and teardown end the pass early.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Node;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::context::Context;
use super::disruption::{delete_cluster_budgets, reconcile_cluster_budget};
use super::finalizer::{
    clear_finalizers, controller_owner_ref, ensure_finalizer, has_finalizer,
    migrate_claim_owners, release_finalizer,
};
use super::lease::ClusterLease;
use super::pool_operations::reconcile_pool_operations;
use super::workload::pool_deployment;
use super::workqueue::{ObjectKey, Reconciler};
use crate::crd::keys::{
    APP_LABEL, CLUSTER_FINALIZER, CLUSTER_LABEL, HOSTNAME_LABEL, POOL_APP,
    POOL_INSTANCE_NAME_LABEL, POOL_PROTECTION_FINALIZER, RECONCILE_DISABLE_ANNOTATION,
    VERSION_LABEL,
};
use crate::crd::{
    BlockDevice, BlockDeviceClaim, BlockDeviceClaimSpec, CStorPoolCluster,
    CStorPoolClusterStatus, CStorPoolInstance, CStorPoolInstanceSpec, ClaimNodeAttributes,
    VersionDetails,
};
use crate::domain::events::{ControllerEvent, EventReason};
use crate::domain::ports::Selector;
use crate::error::{Error, ErrorCategory, Result, ResultExt};
use crate::fault::{FaultPoint, FaultSnapshot};
use crate::metrics;
use crate::placement::{select, validate_cluster, Inventory, PoolPlan, SelectionPlan};

/// Per-pass state: the key being reconciled and the fault configuration the
/// pass runs under.
pub(super) struct ClusterPass {
    pub faults: FaultSnapshot,
    pub namespace: String,
    pub name: String,
}

impl ClusterPass {
    fn cluster_selector(&self) -> Selector {
        Selector::eq(CLUSTER_LABEL, &self.name)
    }
}

/// Keep the first error of a pass and carry on. A later retryable error
/// replaces a kept Validation error so the key still gets requeued.
pub(super) fn defer(slot: &mut Option<Error>, result: Result<()>) {
    let Err(e) = result else {
        return;
    };
    match slot {
        None => *slot = Some(e),
        Some(kept)
            if kept.category() == ErrorCategory::Validation
                && e.category() != ErrorCategory::Validation =>
        {
            warn!(error = %kept, "Additional failure in reconcile pass");
            *kept = e;
        }
        Some(_) => warn!(error = %e, "Additional failure in reconcile pass"),
    }
}

pub struct PoolClusterReconciler {
    ctx: Arc<Context>,
}

impl PoolClusterReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn reconcile_cluster(&self, pass: &ClusterPass) -> Result<()> {
        pass.faults.check(FaultPoint::ClusterGet)?;
        let Some(cluster) = self
            .ctx
            .stores
            .pool_clusters
            .get(&pass.namespace, &pass.name)
            .await?
        else {
            debug!("Pool cluster is gone");
            return Ok(());
        };

        if cluster.current_version().is_none() {
            return self.stamp_version(pass, cluster).await;
        }

        if cluster.is_being_deleted() {
            return self.teardown(pass, &cluster).await;
        }

        if !has_finalizer(&cluster, CLUSTER_FINALIZER) {
            pass.faults.check(FaultPoint::ClusterUpdate)?;
            ensure_finalizer(
                self.ctx.stores.pool_clusters.as_ref(),
                &pass.namespace,
                &pass.name,
                CLUSTER_FINALIZER,
            )
            .await?;
            info!("Added cluster finalizer");
            return Ok(());
        }

        if let Err(e) = validate_cluster(&cluster.spec) {
            self.ctx
                .publish(ControllerEvent::warning(
                    &cluster,
                    EventReason::SyncFailed,
                    e.to_string(),
                ))
                .await;
            return Err(e);
        }

        let mut failure = None;

        let migrated = migrate_claim_owners(self.ctx.stores.block_device_claims.as_ref(), &cluster).await;
        defer(&mut failure, migrated.map(|_| ()));

        defer(
            &mut failure,
            reconcile_cluster_budget(self.ctx.stores.disruption_budgets.as_ref(), &cluster).await,
        );

        let instances = self.cluster_instances(pass).await?;
        let mut live: Vec<CStorPoolInstance> = instances
            .iter()
            .filter(|i| !i.is_being_deleted())
            .cloned()
            .collect();

        defer(&mut failure, self.remove_duplicates(pass, &cluster, &mut live).await);
        defer(&mut failure, self.scale_down(pass, &cluster, &mut live).await);

        let pending = cluster.spec.pools.len() as i64 - live.len() as i64;
        debug!(pending, existing = live.len(), "Computed pending pool instances");
        if pending > 0 {
            defer(&mut failure, self.scale_up(pass, &cluster).await);
        }

        // Re-read: scale-up may have created instances.
        let instances = self.cluster_instances(pass).await?;
        defer(&mut failure, self.adopt_orphans(pass, &cluster, &instances).await);
        defer(&mut failure, self.remove_orphan_workloads(pass, &instances).await);
        defer(&mut failure, self.open_reconcile_gates(pass, &instances).await);

        let live: Vec<CStorPoolInstance> = instances
            .iter()
            .filter(|i| !i.is_being_deleted())
            .cloned()
            .collect();
        if live.len() == cluster.spec.pools.len() {
            defer(
                &mut failure,
                reconcile_pool_operations(&self.ctx, pass, &cluster, &live).await,
            );
        }

        defer(&mut failure, self.release_unused_claims(pass, &cluster).await);
        defer(&mut failure, self.update_status(pass).await);

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn cluster_instances(&self, pass: &ClusterPass) -> Result<Vec<CStorPoolInstance>> {
        pass.faults.check(FaultPoint::InstanceList)?;
        self.ctx
            .stores
            .pool_instances
            .list(&pass.namespace, &pass.cluster_selector())
            .await
    }

    // =========================================================================
    // Version stamp
    // =========================================================================

    /// Record the version the cluster is reconciled at. An existing instance's
    /// version wins over the controller's own.
    async fn stamp_version(&self, pass: &ClusterPass, mut cluster: CStorPoolCluster) -> Result<()> {
        let instances = self.cluster_instances(pass).await?;
        let version = instances
            .iter()
            .find_map(|i| i.version().map(str::to_string))
            .unwrap_or_else(|| self.ctx.config.version.clone());

        pass.faults.check(FaultPoint::ClusterPatch)?;
        let status = cluster.status.get_or_insert_with(CStorPoolClusterStatus::default);
        status.version_details = VersionDetails::at(&version);
        self.ctx
            .stores
            .pool_clusters
            .replace_status(&pass.namespace, &cluster)
            .await
            .context("stamp pool cluster version")?;
        info!(%version, "Stamped pool cluster version");
        Ok(())
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    async fn teardown(&self, pass: &ClusterPass, cluster: &CStorPoolCluster) -> Result<()> {
        pass.faults.check(FaultPoint::InstanceDeleteCollection)?;
        self.ctx
            .stores
            .pool_instances
            .delete_collection(&pass.namespace, &pass.cluster_selector())
            .await
            .context("delete pool instances")?;

        let remaining = self.cluster_instances(pass).await?;
        if !remaining.is_empty() {
            info!(
                remaining = remaining.len(),
                "Waiting for pool instances to be removed"
            );
            return Ok(());
        }

        let stores = &self.ctx.stores;
        for deployment in stores
            .deployments
            .list(&pass.namespace, &pool_workload_selector(&pass.name))
            .await?
        {
            stores
                .deployments
                .delete(&pass.namespace, &deployment.name_any())
                .await?;
            metrics::record_write("Deployment", "delete");
        }

        for claim in stores
            .block_device_claims
            .list(&pass.namespace, &pass.cluster_selector())
            .await?
        {
            self.release_claim(pass, &claim).await?;
        }

        delete_cluster_budgets(stores.disruption_budgets.as_ref(), cluster).await?;

        pass.faults.check(FaultPoint::ClusterUpdate)?;
        release_finalizer(
            stores.pool_clusters.as_ref(),
            &pass.namespace,
            &pass.name,
            CLUSTER_FINALIZER,
        )
        .await?;
        info!("Pool cluster torn down");
        Ok(())
    }

    // =========================================================================
    // Self-heal
    // =========================================================================

    /// Keep the oldest instance per host and delete the others.
    async fn remove_duplicates(
        &self,
        pass: &ClusterPass,
        cluster: &CStorPoolCluster,
        live: &mut Vec<CStorPoolInstance>,
    ) -> Result<()> {
        let mut by_host: BTreeMap<String, Vec<&CStorPoolInstance>> = BTreeMap::new();
        for instance in live.iter() {
            by_host
                .entry(instance.host().to_string())
                .or_default()
                .push(instance);
        }

        let mut duplicates = BTreeSet::new();
        for (host, mut group) in by_host.into_iter().filter(|(_, g)| g.len() > 1) {
            group.sort_by_key(|i| (i.metadata.creation_timestamp.as_ref().map(|t| t.0), i.name_any()));
            let keep = group[0].name_any();
            for extra in &group[1..] {
                error!(
                    %host,
                    kept = %keep,
                    duplicate = %extra.name_any(),
                    "Two pool instances on one host; deleting the newer"
                );
                duplicates.insert(extra.name_any());
            }
        }

        for name in &duplicates {
            pass.faults.check(FaultPoint::InstanceDelete)?;
            self.ctx
                .stores
                .pool_instances
                .delete(&pass.namespace, name)
                .await
                .context(format!("delete duplicate pool instance {}", name))?;
            metrics::record_write("CStorPoolInstance", "delete");
            self.ctx
                .publish(ControllerEvent::warning(
                    cluster,
                    EventReason::PoolDownscale,
                    format!("deleted duplicate pool instance {}", name),
                ))
                .await;
        }
        live.retain(|i| !duplicates.contains(&i.name_any()));
        Ok(())
    }

    // =========================================================================
    // Scale-down
    // =========================================================================

    /// Delete instances whose pool spec was removed from the cluster.
    async fn scale_down(
        &self,
        pass: &ClusterPass,
        cluster: &CStorPoolCluster,
        live: &mut Vec<CStorPoolInstance>,
    ) -> Result<()> {
        let selectors: Vec<_> = cluster.spec.pools.iter().map(|p| &p.node_selector).collect();
        let removed: Vec<String> = live
            .iter()
            .filter(|i| !selectors.contains(&&i.spec.node_selector))
            .map(|i| i.name_any())
            .collect();

        for name in &removed {
            pass.faults.check(FaultPoint::InstanceDelete)?;
            self.ctx
                .stores
                .pool_instances
                .delete(&pass.namespace, name)
                .await
                .context(format!("delete pool instance {}", name))?;
            metrics::record_write("CStorPoolInstance", "delete");
            info!(instance = %name, "Pool spec removed; deleting pool instance");
            self.ctx
                .publish(ControllerEvent::normal(
                    cluster,
                    EventReason::PoolDownscale,
                    format!("deleted pool instance {}", name),
                ))
                .await;
        }
        live.retain(|i| !removed.contains(&i.name_any()));
        Ok(())
    }

    // =========================================================================
    // Scale-up
    // =========================================================================

    /// Provision missing pools under the cluster lease. The lease is given up
    /// whether or not provisioning succeeded. A pass that would only wait on
    /// unbound claims or report unplaceable pools leaves the lease alone.
    async fn scale_up(&self, pass: &ClusterPass, cluster: &CStorPoolCluster) -> Result<()> {
        let snapshot = Snapshot::read(&self.ctx, pass).await?;
        let plan = select(cluster, &snapshot.inventory());
        if !plan.ready().any(|pool| needs_lease(pass, pool, &snapshot.claims)) {
            debug!("No pool is provisionable this pass; skipping the lease");
            return self.provision(pass, cluster, &snapshot, &plan).await;
        }

        let lease = ClusterLease::new(
            self.ctx.stores.pool_clusters.as_ref(),
            &self.ctx.config.pod_id,
            self.ctx.config.lease_duration,
        );
        pass.faults.check(FaultPoint::ClusterUpdate)?;
        let leased = lease.acquire(cluster).await?;

        // Another holder may have provisioned while we waited for the lease.
        let provisioned = match Snapshot::read(&self.ctx, pass).await {
            Ok(snapshot) => {
                let plan = select(&leased, &snapshot.inventory());
                self.provision(pass, &leased, &snapshot, &plan).await
            }
            Err(e) => Err(e),
        };
        let released = lease.release(&pass.namespace, &pass.name).await;
        if let Err(e) = &released {
            warn!(error = %e, "Failed to release provisioning lease");
        }
        provisioned.and(released)
    }

    async fn provision(
        &self,
        pass: &ClusterPass,
        cluster: &CStorPoolCluster,
        snapshot: &Snapshot,
        plan: &SelectionPlan,
    ) -> Result<()> {
        let devices = &snapshot.devices;
        let claims = &snapshot.claims;

        let mut failure = None;
        for (index, e) in plan.failures() {
            warn!(pool = index, error = %e, "Cannot place pool spec");
            self.ctx
                .publish(ControllerEvent::warning(
                    cluster,
                    EventReason::PoolCreate,
                    format!("pool {}: {}", index, e),
                ))
                .await;
            defer(&mut failure, Err(Error::Selection(e.clone())));
        }

        let mut unbound = Vec::new();
        for pool in plan.ready() {
            match self.claim_devices(pass, cluster, pool, devices, claims).await {
                Ok(waiting) if !waiting.is_empty() => {
                    debug!(node = %pool.node, ?waiting, "Waiting for block device claims to bind");
                    unbound.extend(waiting);
                }
                Ok(_) => defer(&mut failure, self.create_pool(pass, cluster, pool).await),
                Err(e) => {
                    warn!(node = %pool.node, error = %e, "Claiming block devices failed");
                    defer(&mut failure, Err(e));
                }
            }
        }

        if !unbound.is_empty() {
            defer(
                &mut failure,
                Err(Error::Contention(format!(
                    "block device claims not bound yet: {}",
                    unbound.join(",")
                ))),
            );
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Claim every device of a planned pool. Returns the claims that are not
    /// bound yet.
    async fn claim_devices(
        &self,
        pass: &ClusterPass,
        cluster: &CStorPoolCluster,
        pool: &PoolPlan,
        devices: &[BlockDevice],
        claims: &[BlockDeviceClaim],
    ) -> Result<Vec<String>> {
        let mut unbound = Vec::new();
        for name in &pool.devices {
            let device = devices
                .iter()
                .find(|d| d.name_any() == *name)
                .ok_or_else(|| Error::NotFound {
                    kind: "BlockDevice".to_string(),
                    name: name.clone(),
                })?;
            let claim = ensure_claim(&self.ctx, pass, cluster, device, &pool.node, claims).await?;
            if !claim.is_bound() {
                unbound.push(claim.name_any());
            }
        }
        Ok(unbound)
    }

    async fn create_pool(
        &self,
        pass: &ClusterPass,
        cluster: &CStorPoolCluster,
        pool: &PoolPlan,
    ) -> Result<()> {
        let instance = self.build_instance(cluster, pool)?;
        pass.faults.check(FaultPoint::InstanceCreate)?;
        let created = match self
            .ctx
            .stores
            .pool_instances
            .create(&pass.namespace, &instance)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                self.ctx
                    .publish(ControllerEvent::warning(
                        cluster,
                        EventReason::PoolCreate,
                        format!("failed to create pool instance on {}: {}", pool.node, e),
                    ))
                    .await;
                return Err(e.context(format!("create pool instance on {}", pool.node)));
            }
        };
        metrics::record_write("CStorPoolInstance", "create");
        info!(instance = %created.name_any(), node = %pool.node, "Created pool instance");
        self.ctx
            .publish(ControllerEvent::normal(
                cluster,
                EventReason::PoolCreate,
                format!("created pool instance {} on {}", created.name_any(), pool.node),
            ))
            .await;

        self.create_workload(pass, cluster, &created).await
    }

    fn build_instance(&self, cluster: &CStorPoolCluster, pool: &PoolPlan) -> Result<CStorPoolInstance> {
        let spec = cluster.spec.pools.get(pool.pool_index).ok_or_else(|| {
            Error::Internal(format!("pool index {} out of range", pool.pool_index))
        })?;
        let mut config = spec.pool_config.clone();
        if config.resources.is_none() {
            config.resources = cluster.spec.default_resources.clone();
        }
        if config.aux_resources.is_none() {
            config.aux_resources = cluster.spec.default_aux_resources.clone();
        }
        if config.priority_class_name.is_none() {
            config.priority_class_name = cluster.spec.default_priority_class_name.clone();
        }

        let cluster_name = cluster.name_any();
        Ok(CStorPoolInstance {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", cluster_name)),
                namespace: cluster.namespace(),
                labels: Some(
                    [
                        (CLUSTER_LABEL.to_string(), cluster_name),
                        (HOSTNAME_LABEL.to_string(), pool.node.clone()),
                        (VERSION_LABEL.to_string(), self.ctx.config.version.clone()),
                    ]
                    .into(),
                ),
                annotations: Some(
                    [(RECONCILE_DISABLE_ANNOTATION.to_string(), "true".to_string())].into(),
                ),
                finalizers: Some(vec![POOL_PROTECTION_FINALIZER.to_string()]),
                owner_references: Some(vec![controller_owner_ref(cluster)?]),
                ..Default::default()
            },
            spec: CStorPoolInstanceSpec {
                host_name: pool.node.clone(),
                node_selector: spec.node_selector.clone(),
                pool_config: config,
                data_raid_groups: pool.raid_groups.clone(),
            },
            status: None,
        })
    }

    async fn create_workload(
        &self,
        pass: &ClusterPass,
        cluster: &CStorPoolCluster,
        instance: &CStorPoolInstance,
    ) -> Result<()> {
        let name = instance.name_any();
        let deployment = pool_deployment(
            cluster,
            instance,
            &self.ctx.config.images,
            instance.version().unwrap_or(&self.ctx.config.version),
        )?;

        let created = match pass.faults.check(FaultPoint::WorkloadCreate) {
            Ok(()) => self
                .ctx
                .stores
                .deployments
                .create(&pass.namespace, &deployment)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        match created {
            Ok(()) => {
                metrics::record_write("Deployment", "create");
                info!(instance = %name, "Created pool workload");
                self.ctx
                    .publish(ControllerEvent::normal(
                        cluster,
                        EventReason::PoolDeploymentCreate,
                        format!("created pool workload for {}", name),
                    ))
                    .await;
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => {
                self.ctx
                    .publish(ControllerEvent::warning(
                        cluster,
                        EventReason::PoolDeploymentCreate,
                        format!("failed to create pool workload for {}: {}", name, e),
                    ))
                    .await;
                Err(e.context(format!("create pool workload for {}", name)))
            }
        }
    }

    // =========================================================================
    // Workloads
    // =========================================================================

    /// Create workloads for instances that have none.
    async fn adopt_orphans(
        &self,
        pass: &ClusterPass,
        cluster: &CStorPoolCluster,
        instances: &[CStorPoolInstance],
    ) -> Result<()> {
        let workloads = self.pool_workloads(pass).await?;
        let mut failure = None;
        for instance in instances.iter().filter(|i| !i.is_being_deleted()) {
            if workloads.contains_key(&instance.name_any()) {
                continue;
            }
            info!(instance = %instance.name_any(), "Pool instance has no workload; creating one");
            defer(&mut failure, self.create_workload(pass, cluster, instance).await);
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Delete pool workloads whose instance no longer exists.
    async fn remove_orphan_workloads(
        &self,
        pass: &ClusterPass,
        instances: &[CStorPoolInstance],
    ) -> Result<()> {
        let known: BTreeSet<String> = instances.iter().map(|i| i.name_any()).collect();
        for (instance, deployment) in self.pool_workloads(pass).await? {
            if known.contains(&instance) {
                continue;
            }
            error!(
                workload = %deployment.name_any(),
                %instance,
                "Pool workload has no pool instance; deleting it"
            );
            self.ctx
                .stores
                .deployments
                .delete(&pass.namespace, &deployment.name_any())
                .await
                .context(format!("delete orphan workload {}", deployment.name_any()))?;
            metrics::record_write("Deployment", "delete");
        }
        Ok(())
    }

    /// Lift the reconcile-disable gate on instances whose workload is ready.
    async fn open_reconcile_gates(
        &self,
        pass: &ClusterPass,
        instances: &[CStorPoolInstance],
    ) -> Result<()> {
        let workloads = self.pool_workloads(pass).await?;
        for instance in instances
            .iter()
            .filter(|i| i.reconcile_disabled() && !i.is_being_deleted())
        {
            let name = instance.name_any();
            let ready = workloads
                .get(&name)
                .and_then(|d| d.status.as_ref())
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0);
            if ready != 1 {
                debug!(instance = %name, ready, "Pool workload not ready yet");
                continue;
            }
            pass.faults.check(FaultPoint::InstancePatch)?;
            self.ctx
                .stores
                .pool_instances
                .patch_merge(
                    &pass.namespace,
                    &name,
                    &json!({"metadata": {"annotations": {RECONCILE_DISABLE_ANNOTATION: null}}}),
                )
                .await
                .context(format!("enable reconcile on {}", name))?;
            info!(instance = %name, "Pool workload ready; enabled pool reconcile");
        }
        Ok(())
    }

    /// Pool workloads of the cluster keyed by instance name.
    async fn pool_workloads(&self, pass: &ClusterPass) -> Result<BTreeMap<String, Deployment>> {
        let deployments = self
            .ctx
            .stores
            .deployments
            .list(&pass.namespace, &pool_workload_selector(&pass.name))
            .await?;
        Ok(deployments
            .into_iter()
            .map(|d| {
                let instance = d
                    .labels()
                    .get(POOL_INSTANCE_NAME_LABEL)
                    .cloned()
                    .unwrap_or_else(|| d.name_any());
                (instance, d)
            })
            .collect())
    }

    // =========================================================================
    // Claims
    // =========================================================================

    /// Release claims whose device neither the cluster spec nor an instance uses.
    async fn release_unused_claims(&self, pass: &ClusterPass, cluster: &CStorPoolCluster) -> Result<()> {
        let mut referenced = cluster.device_names();
        for instance in self.cluster_instances(pass).await? {
            referenced.extend(instance.device_names());
        }
        let claims = self
            .ctx
            .stores
            .block_device_claims
            .list(&pass.namespace, &pass.cluster_selector())
            .await?;
        for claim in claims
            .iter()
            .filter(|c| !referenced.contains(&c.spec.block_device_name))
        {
            self.release_claim(pass, claim).await?;
        }
        Ok(())
    }

    async fn release_claim(&self, pass: &ClusterPass, claim: &BlockDeviceClaim) -> Result<()> {
        let name = claim.name_any();
        let store = self.ctx.stores.block_device_claims.as_ref();
        clear_finalizers(store, &pass.namespace, &name).await?;
        store
            .delete(&pass.namespace, &name)
            .await
            .context(format!("delete block device claim {}", name))?;
        metrics::record_write("BlockDeviceClaim", "delete");
        info!(claim = %name, device = %claim.spec.block_device_name, "Released block device claim");
        Ok(())
    }

    // =========================================================================
    // Status
    // =========================================================================

    async fn update_status(&self, pass: &ClusterPass) -> Result<()> {
        let Some(mut cluster) = self
            .ctx
            .stores
            .pool_clusters
            .get(&pass.namespace, &pass.name)
            .await?
        else {
            return Ok(());
        };
        let instances = self.cluster_instances(pass).await?;
        let live: Vec<_> = instances.iter().filter(|i| !i.is_being_deleted()).collect();

        let desired = cluster.spec.pools.len() as i32;
        let status = cluster.status.get_or_insert_with(CStorPoolClusterStatus::default);
        let next = CStorPoolClusterStatus {
            provisioned_instances: live.len() as i32,
            healthy_instances: live.iter().filter(|i| i.is_online()).count() as i32,
            desired_instances: desired,
            version_details: status.version_details.clone(),
        };
        if *status == next {
            return Ok(());
        }
        *status = next.clone();

        pass.faults.check(FaultPoint::ClusterPatch)?;
        self.ctx
            .stores
            .pool_clusters
            .replace_status(&pass.namespace, &cluster)
            .await
            .context("update pool cluster status")?;
        info!(
            provisioned = next.provisioned_instances,
            healthy = next.healthy_instances,
            desired = next.desired_instances,
            "Updated pool cluster status"
        );
        self.ctx
            .publish(ControllerEvent::normal(
                &cluster,
                EventReason::Synced,
                format!(
                    "{}/{} pool instances healthy",
                    next.healthy_instances, next.desired_instances
                ),
            ))
            .await;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for PoolClusterReconciler {
    fn name(&self) -> &'static str {
        "pool-cluster"
    }

    #[instrument(skip(self), fields(cluster = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let pass = ClusterPass {
            faults: self.ctx.faults.snapshot(),
            namespace: key.namespace.clone(),
            name: key.name.clone(),
        };
        self.reconcile_cluster(&pass).await
    }
}

/// Selector for the pool workloads of a cluster.
fn pool_workload_selector(cluster: &str) -> Selector {
    Selector::eq(CLUSTER_LABEL, cluster).and_eq(APP_LABEL, POOL_APP)
}

/// Get or create the claim on `device` for `cluster`.
///
/// An existing claim of this cluster is reused; creating a claim that already
/// exists counts as success.
/// Cluster-wide inventory a scale-up decision is made on.
struct Snapshot {
    nodes: Vec<Node>,
    devices: Vec<BlockDevice>,
    claims: Vec<BlockDeviceClaim>,
    instances: Vec<CStorPoolInstance>,
}

impl Snapshot {
    async fn read(ctx: &Context, pass: &ClusterPass) -> Result<Self> {
        let stores = &ctx.stores;
        let everything = Selector::everything();
        let nodes = ctx.nodes.list_nodes(&everything).await?;
        let devices = stores.block_devices.list(&pass.namespace, &everything).await?;
        let claims = stores
            .block_device_claims
            .list(&pass.namespace, &everything)
            .await?;
        pass.faults.check(FaultPoint::InstanceList)?;
        let instances = stores.pool_instances.list(&pass.namespace, &everything).await?;
        Ok(Self {
            nodes,
            devices,
            claims,
            instances,
        })
    }

    fn inventory(&self) -> Inventory<'_> {
        Inventory {
            nodes: &self.nodes,
            devices: &self.devices,
            claims: &self.claims,
            instances: &self.instances,
        }
    }
}

/// A planned pool needs the lease when one of its devices is unclaimed or
/// when all of its claims are bound and the instance can be created.
fn needs_lease(pass: &ClusterPass, pool: &PoolPlan, claims: &[BlockDeviceClaim]) -> bool {
    let mut all_bound = true;
    for device in &pool.devices {
        let claim = claims.iter().find(|c| {
            c.spec.block_device_name == *device && c.cluster_name() == Some(pass.name.as_str())
        });
        match claim {
            Some(claim) => all_bound &= claim.is_bound(),
            None => return true,
        }
    }
    all_bound
}

pub(super) async fn ensure_claim(
    ctx: &Context,
    pass: &ClusterPass,
    cluster: &CStorPoolCluster,
    device: &BlockDevice,
    host: &str,
    known: &[BlockDeviceClaim],
) -> Result<BlockDeviceClaim> {
    let device_name = device.name_any();
    if let Some(existing) = known
        .iter()
        .find(|c| c.spec.block_device_name == device_name && c.cluster_name() == Some(pass.name.as_str()))
    {
        return Ok(existing.clone());
    }

    let name = BlockDeviceClaim::name_for(device);
    let claim = BlockDeviceClaim {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(pass.namespace.clone()),
            labels: Some([(CLUSTER_LABEL.to_string(), pass.name.clone())].into()),
            finalizers: Some(vec![CLUSTER_FINALIZER.to_string()]),
            owner_references: Some(vec![controller_owner_ref(cluster)?]),
            ..Default::default()
        },
        spec: BlockDeviceClaimSpec {
            block_device_name: device_name.clone(),
            block_device_node_attributes: ClaimNodeAttributes {
                host_name: host.to_string(),
            },
            capacity: Some(device.capacity().to_string()),
        },
        status: None,
    };

    let store = ctx.stores.block_device_claims.as_ref();
    match store.create(&pass.namespace, &claim).await {
        Ok(created) => {
            metrics::record_write("BlockDeviceClaim", "create");
            info!(claim = %name, device = %device_name, "Created block device claim");
            Ok(created)
        }
        Err(e) if e.is_already_exists() => {
            let existing = store.get(&pass.namespace, &name).await?.ok_or_else(|| Error::NotFound {
                kind: "BlockDeviceClaim".to_string(),
                name: name.clone(),
            })?;
            match existing.cluster_name() {
                Some(owner) if owner == pass.name => Ok(existing),
                other => Err(Error::Contention(format!(
                    "block device {} is claimed by {}",
                    device_name,
                    other.unwrap_or("another owner")
                ))),
            }
        }
        Err(e) => Err(e.context(format!("claim block device {}", device_name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventRecorder, InMemoryNodeInventory, InMemoryStore};
    use crate::controller::context::{ControllerConfig, Stores};
    use crate::crd::{
        BlockDeviceRef, BlockDeviceSpec, BlockDeviceStatus, CStorPoolClusterSpec, ClaimState,
        DeviceCapacity, DeviceState, NodeAttributes, PoolSpec, RaidGroup, RaidType,
    };
    use crate::fault::{FaultGate, FaultSwitch};
    use crate::crd::{CStorVolume, CStorVolumeClaim, CStorVolumePolicy, CStorVolumeReplica};
    use crate::domain::ports::ResourceStore;
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::api::policy::v1::PodDisruptionBudget;

    const NS: &str = "openebs";

    struct Fixture {
        clusters: Arc<InMemoryStore<CStorPoolCluster>>,
        instances: Arc<InMemoryStore<CStorPoolInstance>>,
        devices: Arc<InMemoryStore<BlockDevice>>,
        claims: Arc<InMemoryStore<BlockDeviceClaim>>,
        deployments: Arc<InMemoryStore<Deployment>>,
        events: Arc<InMemoryEventRecorder>,
        faults: FaultGate,
        reconciler: PoolClusterReconciler,
    }

    impl Fixture {
        fn new() -> Self {
            let clusters = Arc::new(InMemoryStore::<CStorPoolCluster>::new());
            let instances = Arc::new(InMemoryStore::<CStorPoolInstance>::new());
            let devices = Arc::new(InMemoryStore::<BlockDevice>::new());
            let claims = Arc::new(InMemoryStore::<BlockDeviceClaim>::new());
            let deployments = Arc::new(InMemoryStore::<Deployment>::new());
            let stores = Stores {
                pool_clusters: clusters.clone(),
                pool_instances: instances.clone(),
                block_devices: devices.clone(),
                block_device_claims: claims.clone(),
                deployments: deployments.clone(),
                services: Arc::new(InMemoryStore::<Service>::new()),
                disruption_budgets: Arc::new(InMemoryStore::<PodDisruptionBudget>::new()),
                volume_claims: Arc::new(InMemoryStore::<CStorVolumeClaim>::new()),
                volume_policies: Arc::new(InMemoryStore::<CStorVolumePolicy>::new()),
                volumes: Arc::new(InMemoryStore::<CStorVolume>::new()),
                volume_replicas: Arc::new(InMemoryStore::<CStorVolumeReplica>::new()),
            };
            let nodes = Arc::new(InMemoryNodeInventory::new());
            nodes.add_node("n1", &[]);
            let events = Arc::new(InMemoryEventRecorder::new());
            let faults = FaultGate::disabled();
            let ctx = Context::new(
                ControllerConfig {
                    namespace: NS.into(),
                    version: "3.5.0".into(),
                    ..Default::default()
                },
                stores,
                nodes,
                events.clone(),
                faults.clone(),
            );
            Self {
                clusters,
                instances,
                devices,
                claims,
                deployments,
                events,
                faults,
                reconciler: PoolClusterReconciler::new(ctx),
            }
        }

        async fn device(&self, name: &str) {
            let mut bd = BlockDevice::new(
                name,
                BlockDeviceSpec {
                    capacity: DeviceCapacity { storage: 10 << 30 },
                    node_attributes: NodeAttributes { node_name: "n1".into() },
                    path: format!("/dev/{}", name),
                    ..Default::default()
                },
            );
            bd.status = Some(BlockDeviceStatus {
                state: DeviceState::Active,
                claim_state: ClaimState::Unclaimed,
            });
            self.devices.create(NS, &bd).await.unwrap();
        }

        async fn cluster(&self, devices: &[&str]) {
            let spec = CStorPoolClusterSpec {
                pools: vec![PoolSpec {
                    node_selector: [(HOSTNAME_LABEL.to_string(), "n1".to_string())].into(),
                    data_raid_groups: vec![RaidGroup {
                        raid_type: Some(RaidType::Stripe),
                        block_devices: devices.iter().map(|d| BlockDeviceRef::new(*d)).collect(),
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            };
            self.clusters
                .create(NS, &CStorPoolCluster::new("c1", spec))
                .await
                .unwrap();
        }

        fn bind_claims(&self) {
            self.claims.update_matching(&Selector::everything(), |c| {
                c.status = Some(crate::crd::BlockDeviceClaimStatus {
                    phase: ClaimState::Claimed,
                });
            });
        }

        async fn pass(&self) -> Result<()> {
            self.reconciler.reconcile(&ObjectKey::new(NS, "c1")).await
        }
    }

    #[test]
    fn test_defer_prefers_retryable_over_validation() {
        let mut slot = None;
        defer(&mut slot, Ok(()));
        assert!(slot.is_none());

        defer(&mut slot, Err(Error::Validation("duplicate device".into())));
        defer(&mut slot, Err(Error::Contention("claims not bound".into())));
        assert_matches::assert_matches!(slot, Some(Error::Contention(_)));

        // The first retryable error is kept
        defer(&mut slot, Err(Error::Validation("bad raid".into())));
        defer(&mut slot, Err(Error::Internal("later".into())));
        assert_matches::assert_matches!(slot, Some(Error::Contention(_)));
    }

    #[tokio::test]
    async fn test_first_passes_stamp_version_then_finalizer() {
        let f = Fixture::new();
        f.cluster(&["d1"]).await;

        f.pass().await.unwrap();
        let c = f.clusters.find(NS, "c1").unwrap();
        assert_eq!(c.current_version(), Some("3.5.0"));
        assert!(!has_finalizer(&c, CLUSTER_FINALIZER));

        f.pass().await.unwrap();
        assert!(has_finalizer(&f.clusters.find(NS, "c1").unwrap(), CLUSTER_FINALIZER));
        assert!(f.instances.is_empty());
    }

    #[tokio::test]
    async fn test_provisioning_waits_for_claim_binding() {
        let f = Fixture::new();
        f.device("d1").await;
        f.cluster(&["d1"]).await;
        f.pass().await.unwrap();
        f.pass().await.unwrap();

        let err = f.pass().await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Contention);
        assert_eq!(f.claims.len(), 1);
        assert!(f.instances.is_empty());

        // Lease is released even though provisioning did not finish
        let lease = crate::controller::lease::LeaseRecord::read(&f.clusters.find(NS, "c1").unwrap());
        assert!(lease.holder.is_empty());

        f.bind_claims();
        f.pass().await.unwrap();
        let instances = f.instances.all();
        assert_eq!(instances.len(), 1);
        assert!(instances[0].reconcile_disabled());
        assert_eq!(instances[0].host(), "n1");
        assert_eq!(f.deployments.len(), 1);
        assert_eq!(f.events.with_reason(EventReason::PoolCreate).len(), 1);
        assert_eq!(f.events.with_reason(EventReason::PoolDeploymentCreate).len(), 1);
    }

    #[tokio::test]
    async fn test_waiting_on_unbound_claims_leaves_cluster_untouched() {
        let f = Fixture::new();
        f.device("d1").await;
        f.cluster(&["d1"]).await;
        f.pass().await.unwrap();
        f.pass().await.unwrap();
        let _ = f.pass().await;
        assert_eq!(f.claims.len(), 1);

        let writes = f.clusters.mutation_count();
        for _ in 0..3 {
            let err = f.pass().await.unwrap_err();
            assert_eq!(err.category(), ErrorCategory::Contention);
        }
        assert_eq!(f.clusters.mutation_count(), writes);

        // Bound claims bring the lease back into play
        f.bind_claims();
        f.pass().await.unwrap();
        assert_eq!(f.instances.len(), 1);
        assert!(f.clusters.mutation_count() > writes);
    }

    #[tokio::test]
    async fn test_gate_opens_when_workload_ready() {
        let f = Fixture::new();
        f.device("d1").await;
        f.cluster(&["d1"]).await;
        f.pass().await.unwrap();
        f.pass().await.unwrap();
        let _ = f.pass().await;
        f.bind_claims();
        f.pass().await.unwrap();

        let instance = f.instances.all().remove(0).name_any();
        f.deployments.update_with(NS, &instance, |d| {
            d.status = Some(DeploymentStatus {
                ready_replicas: Some(1),
                ..Default::default()
            });
        });
        f.pass().await.unwrap();
        assert!(!f.instances.find(NS, &instance).unwrap().reconcile_disabled());

        let writes = f.instances.mutation_count() + f.clusters.mutation_count();
        f.pass().await.unwrap();
        assert_eq!(f.instances.mutation_count() + f.clusters.mutation_count(), writes);
    }

    #[tokio::test]
    async fn test_workload_fault_leaves_instance_for_adoption() {
        let f = Fixture::new();
        f.device("d1").await;
        f.cluster(&["d1"]).await;
        f.pass().await.unwrap();
        f.pass().await.unwrap();
        let _ = f.pass().await;
        f.bind_claims();

        f.faults.set(FaultPoint::WorkloadCreate, FaultSwitch::always());
        let err = f.pass().await.unwrap_err();
        assert!(matches!(err.root(), Error::InjectedFault { .. }));
        assert_eq!(f.instances.len(), 1);
        assert!(f.deployments.is_empty());
        assert!(!f.events.warnings().is_empty());

        f.faults.reset();
        f.pass().await.unwrap();
        assert_eq!(f.deployments.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_spec_is_not_retried() {
        let f = Fixture::new();
        f.cluster(&[]).await;
        f.pass().await.unwrap();
        f.pass().await.unwrap();

        let err = f.pass().await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert_eq!(f.events.with_reason(EventReason::SyncFailed).len(), 1);
    }

    #[tokio::test]
    async fn test_missing_cluster_is_a_noop() {
        let f = Fixture::new();
        f.pass().await.unwrap();
        assert!(f.events.is_empty());
    }
}
