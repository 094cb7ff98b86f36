//! Shared harness for the end-to-end tests.
//!
//! Both reconcilers run against in-memory stores. Between passes the harness
//! plays the parts the controllers rely on but do not own: the block device
//! daemon binding claims, pool workloads becoming ready, the pool engine
//! bringing instances online and releasing their protection finalizer,
//! replicas joining their volume's target, and the target acknowledging a
//! resize.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::ResourceExt;

use cstor_operator::adapters::{InMemoryEventRecorder, InMemoryNodeInventory, InMemoryStore};
use cstor_operator::controller::{
    Context, ControllerConfig, ObjectKey, PoolClusterReconciler, Reconciler, Stores,
    VolumeClaimReconciler,
};
use cstor_operator::crd::keys::{
    CLUSTER_LABEL, HOSTNAME_LABEL, PERSISTENT_VOLUME_LABEL, POOL_PROTECTION_FINALIZER,
};
use cstor_operator::crd::{
    BlockDevice, BlockDeviceClaim, BlockDeviceClaimStatus, BlockDeviceRef, BlockDeviceSpec,
    BlockDeviceStatus, CStorPoolCluster, CStorPoolClusterSpec, CStorPoolInstance,
    CStorPoolInstanceStatus, CStorVolume, CStorVolumeClaim, CStorVolumeClaimSpec,
    CStorVolumePolicy, CStorVolumeReplica, CStorVolumeReplicaStatus, CStorVolumeStatus,
    ClaimState, DeviceCapacity, DeviceState, NodeAttributes, PoolPhase, PoolSpec,
    PublishContext, RaidGroup, RaidType, ReplicaPhase, ReplicaPoolPolicy,
};
use cstor_operator::domain::ports::{ResourceStore, Selector};
use cstor_operator::error::Result;
use cstor_operator::fault::FaultGate;

pub const NS: &str = "openebs";
pub const GIB: u64 = 1 << 30;

const MAX_ROUNDS: usize = 25;

pub struct Harness {
    pub clusters: Arc<InMemoryStore<CStorPoolCluster>>,
    pub instances: Arc<InMemoryStore<CStorPoolInstance>>,
    pub devices: Arc<InMemoryStore<BlockDevice>>,
    pub claims: Arc<InMemoryStore<BlockDeviceClaim>>,
    pub deployments: Arc<InMemoryStore<Deployment>>,
    pub services: Arc<InMemoryStore<Service>>,
    pub budgets: Arc<InMemoryStore<PodDisruptionBudget>>,
    pub volume_claims: Arc<InMemoryStore<CStorVolumeClaim>>,
    pub volume_policies: Arc<InMemoryStore<CStorVolumePolicy>>,
    pub volumes: Arc<InMemoryStore<CStorVolume>>,
    pub replicas: Arc<InMemoryStore<CStorVolumeReplica>>,
    pub nodes: Arc<InMemoryNodeInventory>,
    pub events: Arc<InMemoryEventRecorder>,
    pub faults: FaultGate,
    pub pool_reconciler: PoolClusterReconciler,
    pub volume_reconciler: VolumeClaimReconciler,
}

impl Harness {
    pub fn new() -> Self {
        let clusters = Arc::new(InMemoryStore::<CStorPoolCluster>::new());
        let instances = Arc::new(InMemoryStore::<CStorPoolInstance>::new());
        let devices = Arc::new(InMemoryStore::<BlockDevice>::new());
        let claims = Arc::new(InMemoryStore::<BlockDeviceClaim>::new());
        let deployments = Arc::new(InMemoryStore::<Deployment>::new());
        let services = Arc::new(InMemoryStore::<Service>::new());
        let budgets = Arc::new(InMemoryStore::<PodDisruptionBudget>::new());
        let volume_claims = Arc::new(InMemoryStore::<CStorVolumeClaim>::new());
        let volume_policies = Arc::new(InMemoryStore::<CStorVolumePolicy>::new());
        let volumes = Arc::new(InMemoryStore::<CStorVolume>::new());
        let replicas = Arc::new(InMemoryStore::<CStorVolumeReplica>::new());

        let stores = Stores {
            pool_clusters: clusters.clone(),
            pool_instances: instances.clone(),
            block_devices: devices.clone(),
            block_device_claims: claims.clone(),
            deployments: deployments.clone(),
            services: services.clone(),
            disruption_budgets: budgets.clone(),
            volume_claims: volume_claims.clone(),
            volume_policies: volume_policies.clone(),
            volumes: volumes.clone(),
            volume_replicas: replicas.clone(),
        };
        let nodes = Arc::new(InMemoryNodeInventory::new());
        let events = Arc::new(InMemoryEventRecorder::new());
        let faults = FaultGate::disabled();
        let ctx = Context::new(
            ControllerConfig {
                namespace: NS.into(),
                version: "3.5.0".into(),
                pod_id: format!("{}/cstor-operator-0", NS),
                placement_seed: Some(7),
                ..Default::default()
            },
            stores,
            nodes.clone(),
            events.clone(),
            faults.clone(),
        );

        Self {
            clusters,
            instances,
            devices,
            claims,
            deployments,
            services,
            budgets,
            volume_claims,
            volume_policies,
            volumes,
            replicas,
            nodes,
            events,
            faults,
            pool_reconciler: PoolClusterReconciler::new(Arc::clone(&ctx)),
            volume_reconciler: VolumeClaimReconciler::new(ctx),
        }
    }

    // =========================================================================
    // Fixtures
    // =========================================================================

    /// Add a node carrying one active, unclaimed device per name.
    pub async fn node_with_devices(&self, node: &str, devices: &[&str]) {
        self.nodes.add_node(node, &[]);
        for name in devices {
            self.device(name, node, 10 * GIB).await;
        }
    }

    pub async fn device(&self, name: &str, node: &str, size: u64) {
        let mut bd = BlockDevice::new(
            name,
            BlockDeviceSpec {
                capacity: DeviceCapacity { storage: size },
                node_attributes: NodeAttributes {
                    node_name: node.into(),
                },
                path: format!("/dev/disk/by-id/{}", name),
                ..Default::default()
            },
        );
        bd.labels_mut().insert(HOSTNAME_LABEL.into(), node.into());
        bd.status = Some(BlockDeviceStatus {
            state: DeviceState::Active,
            claim_state: ClaimState::Unclaimed,
        });
        self.devices.create(NS, &bd).await.unwrap();
    }

    pub async fn create_cluster(&self, name: &str, pools: Vec<PoolSpec>) {
        let spec = CStorPoolClusterSpec {
            pools,
            ..Default::default()
        };
        self.clusters
            .create(NS, &CStorPoolCluster::new(name, spec))
            .await
            .unwrap();
    }

    /// Replace the device list of the pool spec on `node`.
    pub fn edit_pool(&self, cluster: &str, node: &str, raid: RaidType, devices: &[&str]) {
        let edited = self.clusters.update_with(NS, cluster, |c| {
            for pool in c.spec.pools.iter_mut() {
                if pool.node_selector.get(HOSTNAME_LABEL).map(String::as_str) == Some(node) {
                    *pool = pool_spec(node, raid, devices);
                }
            }
        });
        assert!(edited, "cluster {} not found", cluster);
    }

    pub async fn create_claim(&self, name: &str, cluster: &str, replicas: u32, node: &str) {
        let mut claim = CStorVolumeClaim::new(
            name,
            CStorVolumeClaimSpec {
                capacity: "5Gi".into(),
                replica_count: replicas,
                publish: PublishContext {
                    node_id: node.into(),
                },
                ..Default::default()
            },
        );
        claim.labels_mut().insert(CLUSTER_LABEL.into(), cluster.into());
        self.volume_claims.create(NS, &claim).await.unwrap();
    }

    /// Ask for the replicas of `claim` to live on exactly `pools`.
    pub fn set_desired_pools(&self, claim: &str, pools: &[String]) {
        self.volume_claims.update_with(NS, claim, |c| {
            c.spec.policy.replica_pool = ReplicaPoolPolicy::from_names(pools);
        });
    }

    // =========================================================================
    // External parties
    // =========================================================================

    /// One round of everything outside the controllers.
    pub fn simulate_externals(&self) {
        self.bind_claims();
        self.ready_workloads();
        self.bring_pools_online();
        self.release_terminating_instances();
        self.bring_replicas_online();
        self.register_replicas();
    }

    /// The device daemon binds every pending claim.
    pub fn bind_claims(&self) {
        self.claims.update_matching(&Selector::everything(), |c| {
            if c.metadata.deletion_timestamp.is_none() && !c.is_bound() {
                c.status = Some(BlockDeviceClaimStatus {
                    phase: ClaimState::Claimed,
                });
            }
        });
    }

    pub fn ready_workloads(&self) {
        self.deployments.update_matching(&Selector::everything(), |d| {
            d.status = Some(DeploymentStatus {
                ready_replicas: Some(1),
                ..Default::default()
            });
        });
    }

    /// Instances that never reported come online; explicit phases stay.
    pub fn bring_pools_online(&self) {
        self.instances.update_matching(&Selector::everything(), |i| {
            if i.status.is_none() {
                i.status = Some(CStorPoolInstanceStatus {
                    phase: PoolPhase::Online,
                    ..Default::default()
                });
            }
        });
    }

    /// The pool manager lets go of instances marked for deletion.
    pub fn release_terminating_instances(&self) {
        self.instances.update_matching(&Selector::everything(), |i| {
            if i.metadata.deletion_timestamp.is_some() {
                if let Some(finalizers) = i.metadata.finalizers.as_mut() {
                    finalizers.retain(|f| f != POOL_PROTECTION_FINALIZER);
                }
            }
        });
    }

    /// Replicas that never reported come online; explicit phases stay.
    pub fn bring_replicas_online(&self) {
        self.replicas.update_matching(&Selector::everything(), |r| {
            if r.status.is_none() {
                r.status = Some(CStorVolumeReplicaStatus {
                    phase: Some(ReplicaPhase::Online),
                });
            }
        });
    }

    /// Each target learns about the online replicas of its volume.
    pub fn register_replicas(&self) {
        let online: Vec<CStorVolumeReplica> =
            self.replicas.all().into_iter().filter(|r| r.is_online()).collect();
        self.volumes.update_matching(&Selector::everything(), |v| {
            let volume = v.name_any();
            for r in &online {
                if r.labels().get(PERSISTENT_VOLUME_LABEL) == Some(&volume) {
                    v.spec
                        .replica_details
                        .known_replicas
                        .entry(r.spec.replica_id.clone())
                        .or_insert_with(|| format!("guid-{}", r.name_any()));
                }
            }
        });
    }

    pub fn set_replica_phase(&self, replica: &str, phase: ReplicaPhase) {
        self.replicas.update_with(NS, replica, |r| {
            r.status = Some(CStorVolumeReplicaStatus { phase: Some(phase) });
        });
    }

    /// The target reports the capacity it was asked for.
    pub fn acknowledge_resize(&self) {
        self.volumes.update_matching(&Selector::everything(), |v| {
            let status = v.status.get_or_insert_with(CStorVolumeStatus::default);
            status.capacity = Some(v.spec.capacity.clone());
        });
    }

    pub fn set_pool_phase(&self, instance: &str, phase: PoolPhase) {
        self.instances.update_with(NS, instance, |i| {
            i.status = Some(CStorPoolInstanceStatus {
                phase,
                ..Default::default()
            });
        });
    }

    // =========================================================================
    // Driving
    // =========================================================================

    pub async fn cluster_pass(&self, name: &str) -> Result<()> {
        self.pool_reconciler.reconcile(&ObjectKey::new(NS, name)).await
    }

    pub async fn claim_pass(&self, name: &str) -> Result<()> {
        self.volume_reconciler.reconcile(&ObjectKey::new(NS, name)).await
    }

    /// Run cluster passes with external rounds in between until a pass
    /// succeeds without changing anything.
    pub async fn converge_cluster(&self, name: &str) -> Result<()> {
        let mut last = Ok(());
        for _ in 0..MAX_ROUNDS {
            let before = self.mutations();
            self.simulate_externals();
            last = self.cluster_pass(name).await;
            if last.is_ok() && self.mutations() == before {
                return Ok(());
            }
        }
        last
    }

    /// Same as [`Harness::converge_cluster`] for a volume claim.
    pub async fn converge_claim(&self, name: &str) -> Result<()> {
        let mut last = Ok(());
        for _ in 0..MAX_ROUNDS {
            let before = self.mutations();
            self.simulate_externals();
            last = self.claim_pass(name).await;
            if last.is_ok() && self.mutations() == before {
                return Ok(());
            }
        }
        last
    }

    pub fn mutations(&self) -> usize {
        self.clusters.mutation_count()
            + self.instances.mutation_count()
            + self.devices.mutation_count()
            + self.claims.mutation_count()
            + self.deployments.mutation_count()
            + self.services.mutation_count()
            + self.budgets.mutation_count()
            + self.volume_claims.mutation_count()
            + self.volume_policies.mutation_count()
            + self.volumes.mutation_count()
            + self.replicas.mutation_count()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn instance_on(&self, node: &str) -> Option<CStorPoolInstance> {
        self.instances.all().into_iter().find(|i| i.host() == node)
    }

    /// Device names of each RAID group of the instance on `node`.
    pub fn groups_on(&self, node: &str) -> Vec<Vec<String>> {
        self.instance_on(node)
            .map(|i| {
                i.spec
                    .data_raid_groups
                    .iter()
                    .map(|g| {
                        g.block_devices
                            .iter()
                            .map(|d| d.block_device_name.clone())
                            .collect()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Devices that currently have a claim.
    pub fn claimed_devices(&self) -> BTreeSet<String> {
        self.claims
            .all()
            .iter()
            .map(|c| c.spec.block_device_name.clone())
            .collect()
    }

    /// Pool instance names holding replicas of `volume`.
    pub fn replica_pools(&self, volume: &str) -> BTreeSet<String> {
        self.replicas
            .all()
            .iter()
            .filter(|r| r.labels().get(PERSISTENT_VOLUME_LABEL).map(String::as_str) == Some(volume))
            .filter_map(|r| r.pool_name().map(str::to_string))
            .collect()
    }
}

/// A pool spec on `node` with a single RAID group.
pub fn pool_spec(node: &str, raid: RaidType, devices: &[&str]) -> PoolSpec {
    PoolSpec {
        node_selector: [(HOSTNAME_LABEL.to_string(), node.to_string())].into(),
        data_raid_groups: vec![RaidGroup {
            raid_type: Some(raid),
            block_devices: devices.iter().map(|d| BlockDeviceRef::new(*d)).collect(),
        }],
        ..Default::default()
    }
}
