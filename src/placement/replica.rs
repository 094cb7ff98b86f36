//! Replica Distributor
//!
//! Picks the pool instances new volume replicas go to. Placement is a seeded
//! shuffle of the eligible pools, so identical inputs and seed always give
//! the same answer.

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{Error, Result};

/// A healthy pool instance that can take a replica.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PoolCandidate {
    pub name: String,
    pub uid: String,
    pub host: String,
}

/// Inputs for one placement decision.
#[derive(Debug, Clone)]
pub struct DistributionRequest<'a> {
    /// Replicas still to place
    pub pending: usize,
    pub healthy_pools: &'a [PoolCandidate],
    /// Pools that already hold a replica of the volume
    pub used_pools: &'a BTreeSet<String>,
    /// For clones: pools that hold the source volume
    pub clone_source_pools: Option<&'a BTreeSet<String>>,
    /// Put a pool on this host first when one is eligible
    pub preferred_host: Option<&'a str>,
}

impl DistributionRequest<'_> {
    /// Eligible pools in name order, before shuffling.
    pub fn candidates(&self) -> Vec<PoolCandidate> {
        let mut candidates: Vec<PoolCandidate> = self
            .healthy_pools
            .iter()
            .filter(|p| !self.used_pools.contains(&p.name))
            .filter(|p| {
                self.clone_source_pools
                    .map(|src| src.contains(&p.name))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        candidates.sort();
        candidates.dedup_by(|a, b| a.name == b.name);
        candidates
    }
}

/// Choose `pending` pools for new replicas.
///
/// Fails with `InsufficientPools` when fewer eligible pools exist than
/// replicas are pending.
pub fn distribute(request: &DistributionRequest<'_>, seed: u64) -> Result<Vec<PoolCandidate>> {
    let mut candidates = request.candidates();
    if candidates.len() < request.pending {
        return Err(Error::InsufficientPools {
            required: request.pending,
            available: candidates.len(),
        });
    }

    let mut rng = StdRng::seed_from_u64(seed);
    candidates.shuffle(&mut rng);

    if let Some(host) = request.preferred_host {
        if let Some(pos) = candidates.iter().position(|p| p.host == host) {
            let preferred = candidates.remove(pos);
            candidates.insert(0, preferred);
        }
    }

    candidates.truncate(request.pending);
    Ok(candidates)
}

/// Seed from wall-clock seconds.
pub fn wall_clock_seed() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
