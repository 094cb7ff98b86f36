//! Labels, annotations and finalizers shared with the rest of the cStor stack.
//!
//! These strings are a wire contract: the pool-management workload, the
//! block-device daemon and the CSI driver all match on them.

// =============================================================================
// Labels
// =============================================================================

/// Name of the owning pool cluster.
pub const CLUSTER_LABEL: &str = "openebs.io/cstor-pool-cluster";

/// Name of the pool instance a replica or workload belongs to.
pub const POOL_INSTANCE_NAME_LABEL: &str = "cstorpoolinstance.openebs.io/name";

/// UID of the pool instance a replica belongs to.
pub const POOL_INSTANCE_UID_LABEL: &str = "cstorpoolinstance.openebs.io/uid";

/// Persistent volume (claim) name.
pub const PERSISTENT_VOLUME_LABEL: &str = "openebs.io/persistent-volume";

/// Volume name on replicas.
pub const VOLUME_NAME_LABEL: &str = "cstorvolume.openebs.io/name";

/// Node host name.
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Controller version that last wrote the object.
pub const VERSION_LABEL: &str = "openebs.io/version";

/// Marks replicas created from a snapshot of another volume.
pub const CLONE_LABEL: &str = "openebs.io/cloned";

/// Target service marker.
pub const TARGET_SERVICE_LABEL: &str = "openebs.io/target-service";

/// Target workload marker.
pub const TARGET_LABEL: &str = "openebs.io/target";

/// Label tying a volume claim to its disruption budget.
pub const DISRUPTION_BUDGET_LABEL: &str = "openebs.io/pod-disruption-budget";

pub const APP_LABEL: &str = "app";
pub const POOL_APP: &str = "cstor-pool";
pub const TARGET_APP: &str = "cstor-volume-manager";
pub const TARGET_VALUE: &str = "cstor-target";

// =============================================================================
// Annotations
// =============================================================================

/// Host the replica's pool lives on.
pub const POOL_HOSTNAME_ANNOTATION: &str = "cstorpoolinstance.openebs.io/hostname";

/// Gates pool import until the pool workload is ready.
pub const RECONCILE_DISABLE_ANNOTATION: &str = "reconcile.openebs.io/disable";

/// Provisioning lease on a pool cluster.
pub const LEASE_ANNOTATION: &str = "openebs.io/cspc-lease";

/// Source volume of a clone. A label on the volume, an annotation on its
/// replicas.
pub const SOURCE_VOLUME_KEY: &str = "openebs.io/source-volume";

/// Snapshot a clone was taken from.
pub const SNAPSHOT_KEY: &str = "openebs.io/snapshot";

/// `CStorVolumePolicy` a volume claim is provisioned with.
pub const VOLUME_POLICY_ANNOTATION: &str = "openebs.io/volume-policy";

// =============================================================================
// Finalizers
// =============================================================================

/// Held on a pool cluster and on its block device claims.
pub const CLUSTER_FINALIZER: &str = "cstorpoolcluster.openebs.io/finalizer";

/// Held on a volume claim until the volume is torn down.
pub const CLAIM_FINALIZER: &str = "cvc.openebs.io/finalizer";

/// Held on a pool instance by its pool-management workload.
pub const POOL_PROTECTION_FINALIZER: &str = "openebs.io/pool-protection";

/// Held on a volume replica by the pool engine.
pub const REPLICA_FINALIZER: &str = "cstorvolumereplica.openebs.io/finalizer";

// =============================================================================
// Target ports
// =============================================================================

pub const ISCSI_PORT: i32 = 3260;
pub const GRPC_PORT: i32 = 7777;
pub const MGMT_PORT: i32 = 6060;
pub const EXPORTER_PORT: i32 = 9500;

/// IQN prefix for target volumes.
pub const IQN_PREFIX: &str = "iqn.2016-09.com.openebs.cstor";
