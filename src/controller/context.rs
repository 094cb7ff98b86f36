//! Shared controller context.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::Client;
use tracing::warn;

use crate::adapters::{KubeNodeInventory, KubeStore};
use crate::crd::{
    BlockDevice, BlockDeviceClaim, CStorPoolCluster, CStorPoolInstance, CStorVolume,
    CStorVolumeClaim, CStorVolumePolicy, CStorVolumeReplica,
};
use crate::domain::events::ControllerEvent;
use crate::domain::ports::{EventRecorder, NodeInventory, ResourceStore};
use crate::fault::FaultGate;

/// Images used for the workloads the controllers create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    /// Pool engine container
    pub pool: String,
    /// Pool management sidecar
    pub pool_mgmt: String,
    /// iSCSI target container
    pub target: String,
    /// Volume management sidecar
    pub volume_mgmt: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            pool: "openebs/cstor-pool:latest".to_string(),
            pool_mgmt: "openebs/cstor-pool-manager:latest".to_string(),
            target: "openebs/cstor-istgt:latest".to_string(),
            volume_mgmt: "openebs/cstor-volume-manager:latest".to_string(),
        }
    }
}

/// Runtime behaviour of both reconcilers.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace the controller watches
    pub namespace: String,

    /// Version stamped on new objects
    pub version: String,

    /// Lease holder identity, `<namespace>/<pod>`
    pub pod_id: String,

    /// How long a provisioning lease stays valid
    pub lease_duration: Duration,

    /// Workers per reconciler
    pub workers: usize,

    /// First retry delay
    pub backoff_base: Duration,

    /// Retry delay cap
    pub backoff_max: Duration,

    /// Fixed replica placement seed; wall-clock seconds when unset
    pub placement_seed: Option<u64>,

    pub images: ImageConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: "openebs".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            pod_id: "openebs/cstor-operator".to_string(),
            lease_duration: Duration::from_secs(60),
            workers: 2,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(300),
            placement_seed: None,
            images: ImageConfig::default(),
        }
    }
}

/// One typed store per kind the reconcilers touch.
#[derive(Clone)]
pub struct Stores {
    pub pool_clusters: Arc<dyn ResourceStore<CStorPoolCluster>>,
    pub pool_instances: Arc<dyn ResourceStore<CStorPoolInstance>>,
    pub block_devices: Arc<dyn ResourceStore<BlockDevice>>,
    pub block_device_claims: Arc<dyn ResourceStore<BlockDeviceClaim>>,
    pub deployments: Arc<dyn ResourceStore<Deployment>>,
    pub services: Arc<dyn ResourceStore<Service>>,
    pub disruption_budgets: Arc<dyn ResourceStore<PodDisruptionBudget>>,
    pub volume_claims: Arc<dyn ResourceStore<CStorVolumeClaim>>,
    pub volume_policies: Arc<dyn ResourceStore<CStorVolumePolicy>>,
    pub volumes: Arc<dyn ResourceStore<CStorVolume>>,
    pub volume_replicas: Arc<dyn ResourceStore<CStorVolumeReplica>>,
}

impl Stores {
    /// Stores that read and write through the API server.
    pub fn kubernetes(client: &Client) -> Self {
        Self {
            pool_clusters: Arc::new(KubeStore::<CStorPoolCluster>::new(client.clone())),
            pool_instances: Arc::new(KubeStore::<CStorPoolInstance>::new(client.clone())),
            block_devices: Arc::new(KubeStore::<BlockDevice>::new(client.clone())),
            block_device_claims: Arc::new(KubeStore::<BlockDeviceClaim>::new(client.clone())),
            deployments: Arc::new(KubeStore::<Deployment>::new(client.clone())),
            services: Arc::new(KubeStore::<Service>::new(client.clone())),
            disruption_budgets: Arc::new(KubeStore::<PodDisruptionBudget>::new(client.clone())),
            volume_claims: Arc::new(KubeStore::<CStorVolumeClaim>::new(client.clone())),
            volume_policies: Arc::new(KubeStore::<CStorVolumePolicy>::new(client.clone())),
            volumes: Arc::new(KubeStore::<CStorVolume>::new(client.clone())),
            volume_replicas: Arc::new(KubeStore::<CStorVolumeReplica>::new(client.clone())),
        }
    }
}

/// Everything a reconcile pass needs.
pub struct Context {
    pub config: ControllerConfig,
    pub stores: Stores,
    pub nodes: Arc<dyn NodeInventory>,
    pub recorder: Arc<dyn EventRecorder>,
    pub faults: FaultGate,
}

impl Context {
    pub fn new(
        config: ControllerConfig,
        stores: Stores,
        nodes: Arc<dyn NodeInventory>,
        recorder: Arc<dyn EventRecorder>,
        faults: FaultGate,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            stores,
            nodes,
            recorder,
            faults,
        })
    }

    /// Context backed by the API server.
    pub fn kubernetes(
        client: &Client,
        config: ControllerConfig,
        stores: Stores,
        recorder: Arc<dyn EventRecorder>,
        faults: FaultGate,
    ) -> Arc<Self> {
        Self::new(
            config,
            stores,
            Arc::new(KubeNodeInventory::new(client.clone())),
            recorder,
            faults,
        )
    }

    /// Record an event. Failing to record never fails the pass.
    pub async fn publish(&self, event: ControllerEvent) {
        let reason = event.reason;
        if let Err(e) = self.recorder.record(event).await {
            warn!(%reason, error = %e, "Failed to record event");
        }
    }

    /// Seed for one replica placement.
    pub fn placement_seed(&self) -> u64 {
        self.config
            .placement_seed
            .unwrap_or_else(crate::placement::wall_clock_seed)
    }
}
