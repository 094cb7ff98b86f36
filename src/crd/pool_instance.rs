//! CStorPoolInstance Custom Resource Definition
//!
//! The per-node realisation of one pool spec. Created by the pool cluster
//! controller; its status is owned by the pool-management workload.

use std::collections::{BTreeMap, BTreeSet};

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::keys::{CLUSTER_LABEL, HOSTNAME_LABEL, RECONCILE_DISABLE_ANNOTATION, VERSION_LABEL};
use super::pool_cluster::{PoolConfig, RaidGroup, VersionDetails};

/// A pool on one node.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "cstor.openebs.io",
    version = "v1",
    kind = "CStorPoolInstance",
    plural = "cstorpoolinstances",
    shortname = "cspi",
    status = "CStorPoolInstanceStatus",
    namespaced,
    printcolumn = r#"{"name":"Host", "type":"string", "jsonPath":".spec.hostName"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CStorPoolInstanceSpec {
    /// Node the pool lives on
    pub host_name: String,

    /// Node selector copied from the pool spec
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Pool configuration copied from the pool spec
    #[serde(default)]
    pub pool_config: PoolConfig,

    /// Data RAID groups with resolved types
    #[serde(default)]
    pub data_raid_groups: Vec<RaidGroup>,
}

/// Pool lifecycle phase reported by the pool-management workload.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum PoolPhase {
    #[default]
    Pending,
    Init,
    Online,
    Offline,
    DeletionFailed,
}

impl std::fmt::Display for PoolPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolPhase::Pending => write!(f, "Pending"),
            PoolPhase::Init => write!(f, "Init"),
            PoolPhase::Online => write!(f, "Online"),
            PoolPhase::Offline => write!(f, "Offline"),
            PoolPhase::DeletionFailed => write!(f, "DeletionFailed"),
        }
    }
}

/// Observed pool state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CStorPoolInstanceStatus {
    #[serde(default)]
    pub phase: PoolPhase,

    #[serde(default)]
    pub capacity: PoolCapacity,

    #[serde(default)]
    pub version_details: VersionDetails,
}

/// Pool capacity as quantity strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolCapacity {
    #[serde(default)]
    pub total: String,
    #[serde(default)]
    pub free: String,
    #[serde(default)]
    pub used: String,
}

impl CStorPoolInstance {
    /// Owning cluster name from the cluster label.
    pub fn cluster_name(&self) -> Option<&str> {
        self.labels().get(CLUSTER_LABEL).map(String::as_str)
    }

    /// Host name from the hostname label, falling back to `spec.hostName`.
    pub fn host(&self) -> &str {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(HOSTNAME_LABEL))
            .map(String::as_str)
            .unwrap_or(&self.spec.host_name)
    }

    pub fn version(&self) -> Option<&str> {
        self.labels().get(VERSION_LABEL).map(String::as_str)
    }

    pub fn phase(&self) -> PoolPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn is_online(&self) -> bool {
        self.phase() == PoolPhase::Online
    }

    /// Whether pool import is still gated on the workload becoming ready.
    pub fn reconcile_disabled(&self) -> bool {
        self.annotations()
            .get(RECONCILE_DISABLE_ANNOTATION)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    /// Every device name the instance references.
    pub fn device_names(&self) -> BTreeSet<String> {
        self.spec
            .data_raid_groups
            .iter()
            .flat_map(|g| g.block_devices.iter())
            .map(|d| d.block_device_name.clone())
            .collect()
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::pool_cluster::{BlockDeviceRef, RaidType};

    #[test]
    fn test_phase_default_and_display() {
        assert_eq!(PoolPhase::default(), PoolPhase::Pending);
        assert_eq!(PoolPhase::DeletionFailed.to_string(), "DeletionFailed");
    }

    #[test]
    fn test_host_prefers_label() {
        let mut cspi = CStorPoolInstance::new(
            "cspc-a-x1",
            CStorPoolInstanceSpec {
                host_name: "spec-host".into(),
                ..Default::default()
            },
        );
        assert_eq!(cspi.host(), "spec-host");

        cspi.labels_mut()
            .insert(HOSTNAME_LABEL.to_string(), "label-host".to_string());
        assert_eq!(cspi.host(), "label-host");
    }

    #[test]
    fn test_reconcile_disabled_annotation() {
        let mut cspi = CStorPoolInstance::new("p", CStorPoolInstanceSpec::default());
        assert!(!cspi.reconcile_disabled());
        cspi.annotations_mut()
            .insert(RECONCILE_DISABLE_ANNOTATION.to_string(), "true".to_string());
        assert!(cspi.reconcile_disabled());
    }

    #[test]
    fn test_device_names_across_groups() {
        let cspi = CStorPoolInstance::new(
            "p",
            CStorPoolInstanceSpec {
                host_name: "n1".into(),
                data_raid_groups: vec![
                    RaidGroup {
                        raid_type: Some(RaidType::Mirror),
                        block_devices: vec![BlockDeviceRef::new("d2"), BlockDeviceRef::new("d1")],
                    },
                    RaidGroup {
                        raid_type: Some(RaidType::Stripe),
                        block_devices: vec![BlockDeviceRef::new("d3")],
                    },
                ],
                ..Default::default()
            },
        );
        let names: Vec<_> = cspi.device_names().into_iter().collect();
        assert_eq!(names, vec!["d1", "d2", "d3"]);
    }

    #[test]
    fn test_status_roundtrip_camel_case() {
        let status = CStorPoolInstanceStatus {
            phase: PoolPhase::Online,
            capacity: PoolCapacity {
                total: "10Gi".into(),
                free: "9Gi".into(),
                used: "1Gi".into(),
            },
            version_details: VersionDetails::at("3.5.0"),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "Online");
        assert_eq!(json["versionDetails"]["current"], "3.5.0");
    }
}
