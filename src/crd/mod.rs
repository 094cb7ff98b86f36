//! Custom Resource Definitions
//!
//! This module contains all CRD definitions used by the operator, plus the
//! label/annotation contract shared with the pool and target workloads.

pub mod keys;
pub mod quantity;

mod block_device;
mod pool_cluster;
mod pool_instance;
mod volume;

// Re-export all types for public API
pub use block_device::{
    BlockDevice, BlockDeviceClaim, BlockDeviceClaimSpec, BlockDeviceClaimStatus, BlockDeviceSpec,
    BlockDeviceStatus, ClaimNodeAttributes, ClaimReference, ClaimState, DeviceCapacity,
    DeviceState, FileSystemInfo, NodeAttributes,
};

pub use pool_cluster::{
    BlockDeviceRef, CStorPoolCluster, CStorPoolClusterSpec, CStorPoolClusterStatus,
    DisruptionBudgetSettings, PoolConfig, PoolSpec, RaidGroup, RaidType, ResourceSettings,
    VersionDetails,
};

pub use pool_instance::{
    CStorPoolInstance, CStorPoolInstanceSpec, CStorPoolInstanceStatus, PoolCapacity, PoolPhase,
};

pub use volume::{
    consistency_factor, CStorVolume, CStorVolumeClaim, CStorVolumeClaimSpec,
    CStorVolumeClaimStatus, CStorVolumePolicy, CStorVolumePolicySpec, CStorVolumeReplica,
    CStorVolumeReplicaSpec, CStorVolumeReplicaStatus, CStorVolumeSpec, CStorVolumeStatus,
    ClaimCondition, ClaimConditionType, ClaimPhase, CloneSource, ProvisionPolicy,
    PublishContext, ReplicaDetails, ReplicaPhase, ReplicaPoolInfo, ReplicaPoolPolicy,
    TargetPolicy, TolerationSettings, VolumeReference,
};

use kube::CustomResourceExt;

/// Every CRD this controller reads or writes, in install order.
pub fn all_crds() -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>
{
    vec![
        BlockDevice::crd(),
        BlockDeviceClaim::crd(),
        CStorPoolCluster::crd(),
        CStorPoolInstance::crd(),
        CStorVolumePolicy::crd(),
        CStorVolumeClaim::crd(),
        CStorVolume::crd(),
        CStorVolumeReplica::crd(),
    ]
}
