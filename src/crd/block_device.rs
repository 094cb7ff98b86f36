//! Block device inventory resources owned by the node disk manager.
//!
//! The controller only reads `BlockDevice` objects. It creates and deletes
//! `BlockDeviceClaim` objects; binding a claim to its device is done by the
//! device daemon.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::keys::{CLUSTER_LABEL, HOSTNAME_LABEL};

// =============================================================================
// BlockDevice CRD
// =============================================================================

/// A physical or virtual disk discovered on a node.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "BlockDevice",
    plural = "blockdevices",
    shortname = "bd",
    status = "BlockDeviceStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceSpec {
    #[serde(default)]
    pub capacity: DeviceCapacity,

    #[serde(default)]
    pub node_attributes: NodeAttributes,

    /// Device path on the host
    #[serde(default)]
    pub path: String,

    /// Filesystem found on the device, if any
    #[serde(default)]
    pub filesystem: FileSystemInfo,

    /// Whether the device carries a partition table
    #[serde(default)]
    pub partitioned: bool,

    /// Claim bound to this device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_ref: Option<ClaimReference>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapacity {
    /// Size in bytes
    #[serde(default)]
    pub storage: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeAttributes {
    #[serde(default)]
    pub node_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimReference {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

/// Device presence as seen by the device daemon.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum DeviceState {
    Active,
    Inactive,
    #[default]
    Unknown,
}

/// Claim state of a device or a claim.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ClaimState {
    #[default]
    Unclaimed,
    Claimed,
    Released,
}

impl std::fmt::Display for ClaimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimState::Unclaimed => write!(f, "Unclaimed"),
            ClaimState::Claimed => write!(f, "Claimed"),
            ClaimState::Released => write!(f, "Released"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceStatus {
    #[serde(default)]
    pub state: DeviceState,
    #[serde(default)]
    pub claim_state: ClaimState,
}

impl BlockDevice {
    /// Node the device is attached to.
    pub fn node(&self) -> &str {
        if !self.spec.node_attributes.node_name.is_empty() {
            return &self.spec.node_attributes.node_name;
        }
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(HOSTNAME_LABEL))
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn is_active(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.state == DeviceState::Active)
            .unwrap_or(false)
    }

    pub fn claim_state(&self) -> ClaimState {
        self.status
            .as_ref()
            .map(|s| s.claim_state)
            .unwrap_or_default()
    }

    /// Whether the device holds a filesystem or partition table.
    pub fn has_prior_data(&self) -> bool {
        self.spec.partitioned
            || self
                .spec
                .filesystem
                .fs_type
                .as_deref()
                .map(|t| !t.is_empty())
                .unwrap_or(false)
    }

    pub fn capacity(&self) -> u64 {
        self.spec.capacity.storage
    }
}

// =============================================================================
// BlockDeviceClaim CRD
// =============================================================================

/// Exclusive reservation of one block device.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "BlockDeviceClaim",
    plural = "blockdeviceclaims",
    shortname = "bdc",
    status = "BlockDeviceClaimStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceClaimSpec {
    /// Device being claimed
    pub block_device_name: String,

    #[serde(default)]
    pub block_device_node_attributes: ClaimNodeAttributes,

    /// Requested capacity as a quantity string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimNodeAttributes {
    #[serde(default)]
    pub host_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceClaimStatus {
    #[serde(default)]
    pub phase: ClaimState,
}

impl BlockDeviceClaim {
    /// Claim name for a device, derived from the device UID.
    pub fn name_for(device: &BlockDevice) -> String {
        format!("bdc-cstor-{}", device.uid().unwrap_or_else(|| device.name_any()))
    }

    pub fn cluster_name(&self) -> Option<&str> {
        self.labels().get(CLUSTER_LABEL).map(String::as_str)
    }

    pub fn phase(&self) -> ClaimState {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Bound by the device daemon.
    pub fn is_bound(&self) -> bool {
        self.phase() == ClaimState::Claimed
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
