//! Controller module
//!
//! Wires watch streams into work queues and runs the two reconcilers:
//!
//! - [`PoolClusterReconciler`] keyed by `CStorPoolCluster`, also woken by its
//!   pool instances, block device claims and pool workloads
//! - [`VolumeClaimReconciler`] keyed by `CStorVolumeClaim`, also woken by its
//!   volume and replicas

pub mod context;
pub mod disruption;
pub mod finalizer;
pub mod lease;
mod pool_cluster;
mod pool_operations;
pub mod volume_claim;
pub mod workload;
pub mod workqueue;

pub use context::{Context, ControllerConfig, ImageConfig, Stores};
pub use pool_cluster::PoolClusterReconciler;
pub use volume_claim::VolumeClaimReconciler;
pub use workqueue::{spawn_workers, Backoff, ObjectKey, Reconciler, WorkQueue};

use std::collections::hash_map::DefaultHasher;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams};
use kube::runtime::reflector::{self, reflector};
use kube::runtime::{predicates, watcher, Predicate, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::{CompositeEventRecorder, KubeEventRecorder, KubeStore, LoggingEventRecorder};
use crate::crd::keys::{CLUSTER_LABEL, PERSISTENT_VOLUME_LABEL};
use crate::crd::{
    BlockDevice, BlockDeviceClaim, CStorPoolCluster, CStorPoolInstance, CStorVolume,
    CStorVolumeClaim, CStorVolumeReplica,
};
use crate::error::{Error, Result};
use crate::fault::FaultGate;

// =============================================================================
// Key Mapping
// =============================================================================

/// Key of the object itself.
pub fn own_key<K: ResourceExt>(obj: &K) -> Option<ObjectKey> {
    Some(ObjectKey::new(obj.namespace()?, obj.name_any()))
}

/// Key named by `label` on the object, in the object's namespace.
pub fn label_key<K: ResourceExt>(obj: &K, label: &str) -> Option<ObjectKey> {
    let owner = obj.labels().get(label).filter(|v| !v.is_empty())?;
    Some(ObjectKey::new(obj.namespace()?, owner.clone()))
}

/// Hash of the pool cluster fields a pass reacts to: spec generation,
/// deletion, finalizers and the stamped version. Lease annotation and status
/// counter writes hash the same, so they do not wake the key again.
pub fn cluster_changes(cluster: &CStorPoolCluster) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    cluster.meta().generation.hash(&mut hasher);
    cluster.meta().deletion_timestamp.is_some().hash(&mut hasher);
    cluster.finalizers().hash(&mut hasher);
    cluster.current_version().hash(&mut hasher);
    Some(hasher.finish())
}

// =============================================================================
// Run
// =============================================================================

/// Run both reconcilers against the API server until `shutdown` fires.
pub async fn run(
    client: Client,
    config: ControllerConfig,
    faults: FaultGate,
    shutdown: CancellationToken,
) -> Result<()> {
    let ns = config.namespace.clone();

    // Check if the CRDs exist
    for (kind, listed) in [
        ("CStorPoolCluster", crd_installed::<CStorPoolCluster>(&client, &ns).await),
        ("CStorVolumeClaim", crd_installed::<CStorVolumeClaim>(&client, &ns).await),
        ("BlockDevice", crd_installed::<BlockDevice>(&client, &ns).await),
    ] {
        if let Err(e) = listed {
            error!("{} CRD not found: {}. Please install the CRDs first.", kind, e);
            return Err(e);
        }
    }

    // Block devices are only read here, so a reflector cache is safe for them
    let (devices, writer) = reflector::store::<BlockDevice>();
    let device_feed = reflector(
        writer,
        watcher(Api::namespaced(client.clone(), &ns), watcher::Config::default()),
    )
    .default_backoff()
    .touched_objects();
    let mut tasks: Vec<JoinHandle<()>> = vec![tokio::spawn(drain(device_feed, shutdown.clone()))];
    devices
        .wait_until_ready()
        .await
        .map_err(|e| Error::Internal(format!("block device cache: {}", e)))?;
    debug!("Block device cache ready");

    let mut stores = Stores::kubernetes(&client);
    stores.block_devices = Arc::new(KubeStore::<BlockDevice>::new(client.clone()).with_cache(devices));

    let recorder = CompositeEventRecorder::new()
        .with(Arc::new(LoggingEventRecorder::new()))
        .with(Arc::new(KubeEventRecorder::new(
            client.clone(),
            Some(config.pod_id.clone()),
        )));
    let backoff = Backoff {
        base: config.backoff_base,
        max: config.backoff_max,
    };
    let workers = config.workers;
    let ctx = Context::kubernetes(&client, config, stores, Arc::new(recorder), faults);

    let pools = WorkQueue::new("pool-cluster", backoff, shutdown.clone());
    let volumes = WorkQueue::new("volume-claim", backoff, shutdown.clone());

    let scoped = watcher::Config::default();
    let clustered = watcher::Config::default().labels(CLUSTER_LABEL);
    let per_volume = watcher::Config::default().labels(PERSISTENT_VOLUME_LABEL);

    tasks.push(feed::<CStorPoolCluster, _, _>(
        &client, &ns, scoped.clone(), cluster_changes, &pools, &shutdown, own_key,
    ));
    tasks.push(feed::<CStorPoolInstance, _, _>(
        &client, &ns, clustered.clone(), predicates::resource_version, &pools, &shutdown,
        |o| label_key(o, CLUSTER_LABEL),
    ));
    tasks.push(feed::<BlockDeviceClaim, _, _>(
        &client, &ns, clustered.clone(), predicates::resource_version, &pools, &shutdown,
        |o| label_key(o, CLUSTER_LABEL),
    ));
    tasks.push(feed::<Deployment, _, _>(
        &client, &ns, clustered, predicates::resource_version, &pools, &shutdown,
        |o| label_key(o, CLUSTER_LABEL),
    ));
    tasks.push(feed::<CStorVolumeClaim, _, _>(
        &client, &ns, scoped.clone(), predicates::resource_version, &volumes, &shutdown, own_key,
    ));
    tasks.push(feed::<CStorVolume, _, _>(
        &client, &ns, scoped, predicates::resource_version, &volumes, &shutdown, own_key,
    ));
    tasks.push(feed::<CStorVolumeReplica, _, _>(
        &client, &ns, per_volume, predicates::resource_version, &volumes, &shutdown,
        |o| label_key(o, PERSISTENT_VOLUME_LABEL),
    ));

    tasks.extend(spawn_workers(
        Arc::clone(&pools),
        Arc::new(PoolClusterReconciler::new(Arc::clone(&ctx))),
        workers,
    ));
    tasks.extend(spawn_workers(
        Arc::clone(&volumes),
        Arc::new(VolumeClaimReconciler::new(ctx)),
        workers,
    ));
    info!(namespace = %ns, workers, "Controllers started");

    shutdown.cancelled().await;
    info!("Shutting down controllers");
    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            warn!(error = %e, "Controller task ended abnormally");
        }
    }
    Ok(())
}

async fn crd_installed<K>(client: &Client, namespace: &str) -> Result<()>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned,
{
    Api::<K>::namespaced(client.clone(), namespace)
        .list(&ListParams::default().limit(1))
        .await
        .map(|_| ())
        .map_err(Error::Kube)
}

/// Watch `K` and queue the key each changed object maps to. Changes that
/// leave `predicate` unchanged are dropped.
fn feed<K, P, F>(
    client: &Client,
    namespace: &str,
    config: watcher::Config,
    predicate: P,
    queue: &Arc<WorkQueue>,
    shutdown: &CancellationToken,
    key_of: F,
) -> JoinHandle<()>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    P: Predicate<K> + Send + 'static,
    F: Fn(&K) -> Option<ObjectKey> + Send + 'static,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let queue = Arc::clone(queue);
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        let stream = watcher(api, config)
            .default_backoff()
            .touched_objects()
            .predicate_filter(predicate);
        futures::pin_mut!(stream);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(obj)) => {
                        if let Some(key) = key_of(&obj) {
                            queue.add(key);
                        }
                    }
                    Some(Err(e)) => warn!(kind = %K::kind(&()), error = %e, "Watch error"),
                    None => break,
                },
            }
        }
        debug!(kind = %K::kind(&()), "Watch stopped");
    })
}

/// Poll a reflector stream so its store stays current.
async fn drain<S, T, E>(stream: S, shutdown: CancellationToken)
where
    S: futures::Stream<Item = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    futures::pin_mut!(stream);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(_)) => {}
                Some(Err(e)) => warn!(error = %e, "Cache watch error"),
                None => break,
            },
        }
    }
}
