//! Placement
//!
//! Pure decision functions used by the reconcilers. Nothing in here talks to
//! the API server; inputs are snapshots of cluster state and outputs are
//! plans the reconcilers carry out.
//!
//! - [`raid`] - RAID topology rules and pool cluster validation
//! - [`device`] - node and block device selection for new pools
//! - [`operations`] - day-2 pool changes (expand, replace)
//! - [`replica`] - volume replica placement across pools

pub mod device;
pub mod operations;
pub mod raid;
pub mod replica;

use thiserror::Error;

use crate::error::ErrorCategory;

pub use device::{select, Inventory, PoolPlan, SelectionPlan};
pub use operations::{plan_operations, PoolOperation};
pub use raid::{resolve_groups, validate_cluster};
pub use replica::{distribute, wall_clock_seed, DistributionRequest, PoolCandidate};

/// Why a pool spec could not be placed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("no node matches selector {selector:?}")]
    NodeNotFound { selector: String },

    #[error("{count} nodes match selector {selector:?}, expected exactly one")]
    NodeAmbiguous { selector: String, count: usize },

    #[error("block device {device} is unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    #[error("raid constraint violated: {0}")]
    RaidConstraintViolation(String),
}

impl SelectionError {
    /// Missing nodes may still join; devices may be released; a bad
    /// topology needs a spec change.
    pub fn category(&self) -> ErrorCategory {
        match self {
            SelectionError::NodeNotFound { .. } => ErrorCategory::Transient,
            SelectionError::DeviceUnavailable { .. } => ErrorCategory::Contention,
            SelectionError::NodeAmbiguous { .. } | SelectionError::RaidConstraintViolation(_) => {
                ErrorCategory::Validation
            }
        }
    }
}
