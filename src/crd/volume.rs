//! Volume-side Custom Resource Definitions
//!
//! `CStorVolumeClaim` is written by the CSI provisioner and reconciled into a
//! `CStorVolume`, its iSCSI target, and one `CStorVolumeReplica` per pool.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::keys::{CLUSTER_LABEL, POOL_INSTANCE_NAME_LABEL, VOLUME_POLICY_ANNOTATION};
use super::pool_cluster::{ResourceSettings, VersionDetails};
use crate::error::{Error, Result};

// =============================================================================
// CStorVolumeClaim CRD
// =============================================================================

/// Request for a replicated cStor volume.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "cstor.openebs.io",
    version = "v1",
    kind = "CStorVolumeClaim",
    plural = "cstorvolumeclaims",
    shortname = "cvc",
    status = "CStorVolumeClaimStatus",
    namespaced,
    printcolumn = r#"{"name":"Capacity", "type":"string", "jsonPath":".status.capacity"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CStorVolumeClaimSpec {
    /// Requested capacity as a quantity string
    pub capacity: String,

    /// Desired number of replicas
    #[serde(default = "default_replica_count")]
    pub replica_count: u32,

    /// Clone source as `<source-volume>@<snapshot>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cstor_volume_source: Option<String>,

    /// Set once the volume has been created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cstor_volume_ref: Option<VolumeReference>,

    /// Maintain a disruption budget over the pools holding replicas
    #[serde(default)]
    pub disruption_budget: bool,

    /// Prefer a pool on the publish node for the first replica
    #[serde(default)]
    pub replica_affinity: bool,

    /// Publish context set by the CSI driver
    #[serde(default)]
    pub publish: PublishContext,

    /// Volume policy in effect; its replica pool list is the desired
    /// placement once the claim is bound
    #[serde(default)]
    pub policy: CStorVolumePolicySpec,
}

fn default_replica_count() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReference {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublishContext {
    /// Node the volume is published to
    #[serde(default)]
    pub node_id: String,
}

/// Claim binding phase.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ClaimPhase {
    #[default]
    Pending,
    Bound,
    Failed,
}

impl std::fmt::Display for ClaimPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimPhase::Pending => write!(f, "Pending"),
            ClaimPhase::Bound => write!(f, "Bound"),
            ClaimPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Resize-related claim condition types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ClaimConditionType {
    Resizing,
    ResizePending,
    ResizeFailed,
    ResizeSucceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimCondition {
    #[serde(rename = "type")]
    pub type_: ClaimConditionType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,
}

impl ClaimCondition {
    pub fn new(type_: ClaimConditionType, reason: &str, message: &str) -> Self {
        let now = Utc::now();
        Self {
            type_,
            last_probe_time: Some(now),
            last_transition_time: Some(now),
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CStorVolumeClaimStatus {
    #[serde(default)]
    pub phase: ClaimPhase,

    /// Bound capacity as a quantity string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<String>,

    #[serde(default)]
    pub conditions: Vec<ClaimCondition>,

    /// Pools whose replicas are fully part of the volume
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pool_info: Vec<String>,
}

/// Parsed clone source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneSource {
    pub volume: String,
    pub snapshot: String,
}

impl CloneSource {
    /// Parse `<source-volume>@<snapshot>`. Exactly one `@` is allowed.
    pub fn parse(source: &str) -> Result<Self> {
        let parts: Vec<&str> = source.split('@').collect();
        match parts.as_slice() {
            [volume, snapshot] if !volume.is_empty() && !snapshot.is_empty() => Ok(Self {
                volume: volume.to_string(),
                snapshot: snapshot.to_string(),
            }),
            _ => Err(Error::Validation(format!(
                "clone source {:?} is not of the form <volume>@<snapshot>",
                source
            ))),
        }
    }
}

impl CStorVolumeClaim {
    pub fn phase(&self) -> ClaimPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn cluster_name(&self) -> Option<&str> {
        self.labels().get(CLUSTER_LABEL).map(String::as_str)
    }

    pub fn publish_node(&self) -> Option<&str> {
        Some(self.spec.publish.node_id.as_str()).filter(|n| !n.is_empty())
    }

    pub fn status_capacity(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.capacity.as_deref())
    }

    pub fn clone_source(&self) -> Result<Option<CloneSource>> {
        self.spec
            .cstor_volume_source
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(CloneSource::parse)
            .transpose()
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_condition(&self, type_: ClaimConditionType) -> bool {
        self.status
            .as_ref()
            .map(|s| s.conditions.iter().any(|c| c.type_ == type_))
            .unwrap_or(false)
    }

    /// Name of the `CStorVolumePolicy` the claim asks for.
    pub fn policy_name(&self) -> Option<&str> {
        self.annotations()
            .get(VOLUME_POLICY_ANNOTATION)
            .map(String::as_str)
            .filter(|n| !n.is_empty())
    }

    /// Pools the replicas should live on.
    pub fn desired_pools(&self) -> BTreeSet<String> {
        self.spec.policy.replica_pool.pool_names().collect()
    }

    /// Pools the replicas are known to live on.
    pub fn current_pools(&self) -> BTreeSet<String> {
        self.status
            .as_ref()
            .map(|s| s.pool_info.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn wants_replica_affinity(&self) -> bool {
        self.spec.replica_affinity || self.spec.policy.provision.replica_affinity
    }
}

/// Consistency factor for a replication factor: a strict majority.
pub fn consistency_factor(replication_factor: u32) -> u32 {
    replication_factor / 2 + 1
}

// =============================================================================
// CStorVolumePolicy CRD
// =============================================================================

/// Provisioning and target settings shared by the claims that name it.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "cstor.openebs.io",
    version = "v1",
    kind = "CStorVolumePolicy",
    plural = "cstorvolumepolicies",
    shortname = "cvp",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CStorVolumePolicySpec {
    #[serde(default)]
    pub provision: ProvisionPolicy,

    #[serde(default)]
    pub target: TargetPolicy,

    #[serde(default)]
    pub replica_pool: ReplicaPoolPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionPolicy {
    /// Prefer a pool on the publish node for the first replica
    #[serde(default)]
    pub replica_affinity: bool,
}

/// Scheduling and sizing of the target workload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TargetPolicy {
    /// Target container resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSettings>,

    /// Volume management sidecar resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux_resources: Option<ResourceSettings>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<TolerationSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

/// A pod toleration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TolerationSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaPoolPolicy {
    #[serde(default)]
    pub pool_info: Vec<ReplicaPoolInfo>,
}

impl ReplicaPoolPolicy {
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a String>) -> Self {
        Self {
            pool_info: names
                .into_iter()
                .map(|n| ReplicaPoolInfo {
                    pool_name: n.clone(),
                })
                .collect(),
        }
    }

    pub fn pool_names(&self) -> impl Iterator<Item = String> + '_ {
        self.pool_info.iter().map(|p| p.pool_name.clone())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaPoolInfo {
    /// Pool instance name
    pub pool_name: String,
}

// =============================================================================
// CStorVolume CRD
// =============================================================================

/// The iSCSI target side of a volume.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "cstor.openebs.io",
    version = "v1",
    kind = "CStorVolume",
    plural = "cstorvolumes",
    shortname = "cv",
    status = "CStorVolumeStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CStorVolumeSpec {
    /// Requested capacity as a quantity string
    pub capacity: String,

    /// Cluster IP of the target service
    #[serde(default)]
    pub target_ip: String,

    #[serde(default)]
    pub target_port: String,

    #[serde(default)]
    pub iqn: String,

    #[serde(default)]
    pub target_portal: String,

    /// Replicas currently part of the volume
    #[serde(default)]
    pub replication_factor: u32,

    /// Replicas the volume should have
    #[serde(default)]
    pub desired_replication_factor: u32,

    /// Replicas that must acknowledge a write
    #[serde(default)]
    pub consistency_factor: u32,

    #[serde(default)]
    pub replica_details: ReplicaDetails,
}

/// Replicas the target accepts writes from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaDetails {
    /// Replica id to zvol GUID; entries are added by the target as
    /// replicas join
    #[serde(default)]
    pub known_replicas: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CStorVolumeStatus {
    /// Target phase as reported by the volume manager
    #[serde(default)]
    pub phase: String,

    /// Capacity the target currently serves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<String>,

    #[serde(default)]
    pub version_details: VersionDetails,
}

impl CStorVolume {
    pub fn status_capacity(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.capacity.as_deref())
    }
}

// =============================================================================
// CStorVolumeReplica CRD
// =============================================================================

/// One copy of a volume on one pool.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "cstor.openebs.io",
    version = "v1",
    kind = "CStorVolumeReplica",
    plural = "cstorvolumereplicas",
    shortname = "cvr",
    status = "CStorVolumeReplicaStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CStorVolumeReplicaSpec {
    #[serde(default)]
    pub target_ip: String,

    /// Stable identity the target tracks the replica by
    #[serde(default)]
    pub replica_id: String,

    /// Capacity as a quantity string
    pub capacity: String,
}

/// Replica health as reported by the pool engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ReplicaPhase {
    Online,
    Offline,
    Degraded,
    Recreate,
    NewReplicaDegraded,
    Error,
}

impl std::fmt::Display for ReplicaPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaPhase::Online => write!(f, "Online"),
            ReplicaPhase::Offline => write!(f, "Offline"),
            ReplicaPhase::Degraded => write!(f, "Degraded"),
            ReplicaPhase::Recreate => write!(f, "Recreate"),
            ReplicaPhase::NewReplicaDegraded => write!(f, "NewReplicaDegraded"),
            ReplicaPhase::Error => write!(f, "Error"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CStorVolumeReplicaStatus {
    /// Unset until the pool engine first reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ReplicaPhase>,
}

impl CStorVolumeReplica {
    /// Replica name for a (volume, pool instance) pair.
    pub fn name_for(volume: &str, pool_instance: &str) -> String {
        format!("{}-{}", volume, pool_instance)
    }

    /// Replica id for a (volume, pool instance) pair; the same pair always
    /// yields the same id.
    pub fn id_for(volume: &str, pool_instance: &str) -> String {
        let name = Self::name_for(volume, pool_instance);
        uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes())
            .simple()
            .to_string()
            .to_uppercase()
    }

    pub fn is_online(&self) -> bool {
        self.status.as_ref().and_then(|s| s.phase) == Some(ReplicaPhase::Online)
    }

    /// Name of the pool instance holding this replica.
    pub fn pool_name(&self) -> Option<&str> {
        self.labels()
            .get(POOL_INSTANCE_NAME_LABEL)
            .map(String::as_str)
    }
}
