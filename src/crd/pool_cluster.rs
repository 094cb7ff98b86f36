//! CStorPoolCluster Custom Resource Definition
//!
//! A pool cluster declares one pool per node. Each pool is built from RAID
//! groups of block devices; the controller turns every entry into a
//! `CStorPoolInstance` plus its pool-management workload.

use std::collections::{BTreeMap, BTreeSet};

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// CStorPoolCluster CRD
// =============================================================================

/// Desired pool topology across nodes.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "cstor.openebs.io",
    version = "v1",
    kind = "CStorPoolCluster",
    plural = "cstorpoolclusters",
    shortname = "cspc",
    status = "CStorPoolClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Healthy", "type":"integer", "jsonPath":".status.healthyInstances"}"#,
    printcolumn = r#"{"name":"Provisioned", "type":"integer", "jsonPath":".status.provisionedInstances"}"#,
    printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".status.desiredInstances"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CStorPoolClusterSpec {
    /// One entry per node that should carry a pool
    #[serde(default)]
    pub pools: Vec<PoolSpec>,

    /// Resources applied to pool containers when a pool does not set its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_resources: Option<ResourceSettings>,

    /// Resources applied to sidecar containers when a pool does not set its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_aux_resources: Option<ResourceSettings>,

    /// Priority class used for pool workloads by default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_priority_class_name: Option<String>,

    /// Cluster-wide disruption budget for the pool workloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_disruption_budget: Option<DisruptionBudgetSettings>,
}

/// Disruption budget settings for a pool cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionBudgetSettings {
    /// Minimum number of pool workloads that must stay available
    #[serde(default)]
    pub min_available: i32,
}

/// One pool on one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    /// Node labels; must match exactly one node
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Data RAID groups in pool order
    #[serde(default)]
    pub data_raid_groups: Vec<RaidGroup>,

    /// Pool-level configuration
    #[serde(default)]
    pub pool_config: PoolConfig,
}

/// A set of block devices striped, mirrored or parity-protected together.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RaidGroup {
    /// RAID type; falls back to the pool's default when unset
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub raid_type: Option<RaidType>,

    /// Member devices in order
    #[serde(default)]
    pub block_devices: Vec<BlockDeviceRef>,
}

/// Reference to a block device by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceRef {
    pub block_device_name: String,

    /// Device capacity in bytes, filled in on the pool instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u64>,

    /// Stable device link, filled in on the pool instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_link: Option<String>,
}

impl BlockDeviceRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            block_device_name: name.into(),
            capacity: None,
            dev_link: None,
        }
    }
}

/// Pool-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// RAID type for groups that do not set one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_raid_group_type: Option<RaidType>,

    /// Pool cache file path on the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_file: Option<String>,

    /// Reserve space for volumes up front instead of over-provisioning
    #[serde(default)]
    pub thick_provision: bool,

    /// Compression mode passed to the pool engine ("off", "lz4", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,

    /// Pool container resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSettings>,

    /// Sidecar container resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux_resources: Option<ResourceSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    /// Pool goes read-only once used capacity crosses this percentage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ro_threshold_limit: Option<u8>,
}

/// Container resource requests and limits as quantity strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSettings {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

// =============================================================================
// RAID type
// =============================================================================

/// RAID topology of a group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RaidType {
    Stripe,
    Mirror,
    Raidz,
    Raidz2,
}

impl RaidType {
    /// Fewest devices a group of this type may hold.
    pub fn min_devices(&self) -> usize {
        match self {
            RaidType::Stripe => 1,
            RaidType::Mirror => 2,
            RaidType::Raidz => 3,
            RaidType::Raidz2 => 6,
        }
    }

    /// Whether `count` devices form a valid group of this type.
    pub fn accepts(&self, count: usize) -> bool {
        match self {
            RaidType::Mirror => count == 2,
            other => count >= other.min_devices(),
        }
    }

    pub fn is_striped(&self) -> bool {
        matches!(self, RaidType::Stripe)
    }
}

impl std::fmt::Display for RaidType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaidType::Stripe => write!(f, "stripe"),
            RaidType::Mirror => write!(f, "mirror"),
            RaidType::Raidz => write!(f, "raidz"),
            RaidType::Raidz2 => write!(f, "raidz2"),
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of a pool cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CStorPoolClusterStatus {
    /// Pool instances that exist
    #[serde(default)]
    pub provisioned_instances: i32,

    /// Pool instances whose pool is online
    #[serde(default)]
    pub healthy_instances: i32,

    /// Pool specs in the cluster spec
    #[serde(default)]
    pub desired_instances: i32,

    #[serde(default)]
    pub version_details: VersionDetails,
}

/// Controller version bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VersionDetails {
    /// Version the object was last reconciled at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,

    /// Version the object should be upgraded to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<String>,
}

impl VersionDetails {
    pub fn at(version: &str) -> Self {
        Self {
            current: Some(version.to_string()),
            desired: Some(version.to_string()),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

impl PoolSpec {
    /// All device names referenced by this pool spec.
    pub fn device_names(&self) -> impl Iterator<Item = &str> {
        self.data_raid_groups
            .iter()
            .flat_map(|g| g.block_devices.iter())
            .map(|d| d.block_device_name.as_str())
    }

    /// Node selector rendered as `k=v,k=v`.
    pub fn selector_string(&self) -> String {
        self.node_selector
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl RaidGroup {
    pub fn device_names(&self) -> BTreeSet<String> {
        self.block_devices
            .iter()
            .map(|d| d.block_device_name.clone())
            .collect()
    }

    /// RAID type with the pool default applied.
    pub fn resolved_type(&self, config: &PoolConfig) -> Option<RaidType> {
        self.raid_type.or(config.data_raid_group_type)
    }
}

impl CStorPoolCluster {
    /// Every device name referenced anywhere in the cluster spec.
    pub fn device_names(&self) -> BTreeSet<String> {
        self.spec
            .pools
            .iter()
            .flat_map(|p| p.device_names())
            .map(str::to_string)
            .collect()
    }

    pub fn current_version(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.version_details.current.as_deref())
            .filter(|v| !v.is_empty())
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn min_available(&self) -> i32 {
        self.spec
            .pod_disruption_budget
            .as_ref()
            .map(|p| p.min_available)
            .unwrap_or(0)
    }

    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }
}
