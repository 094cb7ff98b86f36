//! cStor Operator - Pool and Volume Controller Core
//!
//! A Kubernetes operator that turns declarative storage intent into running
//! cStor pools and replicated volumes.
//!
//! # Architecture
//!
//! Two reconcilers share one set of typed stores:
//!
//! ```text
//! CStorPoolCluster ──▶ Pool Cluster Reconciler ──▶ CStorPoolInstance + BlockDeviceClaim
//!                                                  + pool Deployment + PodDisruptionBudget
//!
//! CStorVolumeClaim ──▶ Volume Claim Reconciler ──▶ Service + CStorVolume + target Deployment
//!                                                  + CStorVolumeReplica + PodDisruptionBudget
//! ```
//!
//! Placement decisions (node/device selection, RAID planning, replica
//! distribution) are pure functions in [`placement`]; everything that talks
//! to the API server goes through the ports in [`domain::ports`].
//!
//! # Modules
//!
//! - [`adapters`] - Kubernetes and in-memory implementations of the ports
//! - [`controller`] - Work queues, reconcilers and their helpers
//! - [`crd`] - Custom Resource Definitions and the label contract
//! - [`domain`] - Ports and controller events
//! - [`error`] - Error types
//! - [`fault`] - Fault injection for the pool cluster reconciler
//! - [`metrics`] - Prometheus metrics
//! - [`placement`] - Selection and distribution algorithms

pub mod adapters;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod fault;
pub mod metrics;
pub mod placement;

// Re-export commonly used types
pub use controller::{
    Context, ControllerConfig, ImageConfig, PoolClusterReconciler, VolumeClaimReconciler,
};
pub use crd::{CStorPoolCluster, CStorVolumeClaim};
pub use error::{Error, Result};
pub use fault::{FaultGate, FaultPoint};
