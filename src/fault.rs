//! Fault Injection Gate
//!
//! Test-only switches that make named client operations fail. The gate is
//! configured out of band (a JSON file or direct calls from tests) and each
//! reconcile pass takes an immutable snapshot, so a change mid-pass never
//! splits one pass across two configurations.
//!
//! ```json
//! { "cluster-update": { "inject": true }, "instance-create": { "percentage": 25 } }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

// =============================================================================
// Fault points
// =============================================================================

/// Named client operations that can be failed on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultPoint {
    ClusterGet,
    ClusterList,
    ClusterCreate,
    ClusterUpdate,
    ClusterDelete,
    ClusterPatch,
    ClusterDeleteCollection,
    InstanceGet,
    InstanceList,
    InstanceCreate,
    InstanceUpdate,
    InstanceDelete,
    InstancePatch,
    InstanceDeleteCollection,
    WorkloadCreate,
}

impl FaultPoint {
    pub const ALL: [FaultPoint; 15] = [
        FaultPoint::ClusterGet,
        FaultPoint::ClusterList,
        FaultPoint::ClusterCreate,
        FaultPoint::ClusterUpdate,
        FaultPoint::ClusterDelete,
        FaultPoint::ClusterPatch,
        FaultPoint::ClusterDeleteCollection,
        FaultPoint::InstanceGet,
        FaultPoint::InstanceList,
        FaultPoint::InstanceCreate,
        FaultPoint::InstanceUpdate,
        FaultPoint::InstanceDelete,
        FaultPoint::InstancePatch,
        FaultPoint::InstanceDeleteCollection,
        FaultPoint::WorkloadCreate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultPoint::ClusterGet => "cluster-get",
            FaultPoint::ClusterList => "cluster-list",
            FaultPoint::ClusterCreate => "cluster-create",
            FaultPoint::ClusterUpdate => "cluster-update",
            FaultPoint::ClusterDelete => "cluster-delete",
            FaultPoint::ClusterPatch => "cluster-patch",
            FaultPoint::ClusterDeleteCollection => "cluster-delete-collection",
            FaultPoint::InstanceGet => "instance-get",
            FaultPoint::InstanceList => "instance-list",
            FaultPoint::InstanceCreate => "instance-create",
            FaultPoint::InstanceUpdate => "instance-update",
            FaultPoint::InstanceDelete => "instance-delete",
            FaultPoint::InstancePatch => "instance-patch",
            FaultPoint::InstanceDeleteCollection => "instance-delete-collection",
            FaultPoint::WorkloadCreate => "workload-create",
        }
    }
}

impl std::fmt::Display for FaultPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Switches
// =============================================================================

/// How one fault point behaves.
///
/// `eject` wins over everything, then `inject`, then `percentage`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultSwitch {
    /// Always fail
    #[serde(default)]
    pub inject: bool,
    /// Never fail, regardless of the other fields
    #[serde(default)]
    pub eject: bool,
    /// Chance of failing, 0-100
    #[serde(default)]
    pub percentage: u8,
}

impl FaultSwitch {
    pub fn always() -> Self {
        Self {
            inject: true,
            ..Default::default()
        }
    }

    pub fn never() -> Self {
        Self {
            eject: true,
            ..Default::default()
        }
    }

    pub fn percent(percentage: u8) -> Self {
        Self {
            percentage: percentage.min(100),
            ..Default::default()
        }
    }

    fn fires(&self, roll: u8) -> bool {
        if self.eject {
            return false;
        }
        self.inject || roll < self.percentage
    }
}

/// Full gate configuration.
pub type FaultConfig = BTreeMap<FaultPoint, FaultSwitch>;

// =============================================================================
// Gate
// =============================================================================

/// Shared, reconfigurable gate.
#[derive(Debug, Clone, Default)]
pub struct FaultGate {
    config: Arc<RwLock<FaultConfig>>,
}

impl FaultGate {
    /// A gate with no faults configured.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Immutable view for one reconcile pass.
    pub fn snapshot(&self) -> FaultSnapshot {
        FaultSnapshot {
            config: self.config.read().clone(),
        }
    }

    pub fn set(&self, point: FaultPoint, switch: FaultSwitch) {
        self.config.write().insert(point, switch);
    }

    pub fn clear(&self, point: FaultPoint) {
        self.config.write().remove(&point);
    }

    pub fn reset(&self) {
        self.config.write().clear();
    }

    /// Replace the configuration with the JSON file at `path`.
    pub fn load_file(&self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Internal(format!("read fault config {}: {}", path.display(), e))
        })?;
        let config: FaultConfig = serde_json::from_str(&raw)?;
        *self.config.write() = config;
        Ok(())
    }

    /// Reload the configuration file every `interval` until cancelled.
    pub fn spawn_reloader(
        &self,
        path: PathBuf,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let gate = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match gate.load_file(&path) {
                            Ok(()) => debug!(path = %path.display(), "Reloaded fault config"),
                            Err(e) => warn!(path = %path.display(), error = %e, "Fault config reload failed"),
                        }
                    }
                }
            }
        })
    }
}

/// Point-in-time copy of the gate.
#[derive(Debug, Clone, Default)]
pub struct FaultSnapshot {
    config: FaultConfig,
}

impl FaultSnapshot {
    /// Fail with `Error::InjectedFault` when `point` is switched on.
    pub fn check(&self, point: FaultPoint) -> Result<()> {
        let Some(switch) = self.config.get(&point) else {
            return Ok(());
        };
        let roll = rand::thread_rng().gen_range(0..100u8);
        if switch.fires(roll) {
            warn!(%point, "Injecting fault");
            return Err(Error::InjectedFault { point });
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.config.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_names_are_kebab_case() {
        for point in FaultPoint::ALL {
            let json = serde_json::to_string(&point).unwrap();
            assert_eq!(json, format!("\"{}\"", point));
        }
        assert_eq!(FaultPoint::InstanceDeleteCollection.to_string(), "instance-delete-collection");
    }

    #[test]
    fn test_switch_precedence() {
        assert!(FaultSwitch::always().fires(99));
        assert!(!FaultSwitch::never().fires(0));
        let both = FaultSwitch {
            inject: true,
            eject: true,
            percentage: 100,
        };
        assert!(!both.fires(0));
        assert!(FaultSwitch::percent(30).fires(29));
        assert!(!FaultSwitch::percent(30).fires(30));
        assert!(!FaultSwitch::percent(0).fires(0));
        assert_eq!(FaultSwitch::percent(250).percentage, 100);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_changes() {
        let gate = FaultGate::disabled();
        let before = gate.snapshot();
        gate.set(FaultPoint::ClusterUpdate, FaultSwitch::always());
        let after = gate.snapshot();

        assert!(before.check(FaultPoint::ClusterUpdate).is_ok());
        assert_matches!(
            after.check(FaultPoint::ClusterUpdate),
            Err(Error::InjectedFault {
                point: FaultPoint::ClusterUpdate
            })
        );
        assert!(after.check(FaultPoint::InstanceCreate).is_ok());

        gate.clear(FaultPoint::ClusterUpdate);
        assert!(gate.snapshot().is_empty());
    }

    #[test]
    fn test_config_from_json() {
        let raw = r#"{"cluster-update": {"inject": true}, "instance-create": {"percentage": 25}}"#;
        let config: FaultConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.len(), 2);
        assert_eq!(config[&FaultPoint::ClusterUpdate], FaultSwitch::always());
        assert_eq!(config[&FaultPoint::InstanceCreate].percentage, 25);
    }

    #[test]
    fn test_load_file() {
        let dir = std::env::temp_dir().join(format!("fault-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("faults.json");
        std::fs::write(&path, r#"{"workload-create": {"inject": true}}"#).unwrap();

        let gate = FaultGate::disabled();
        gate.load_file(&path).unwrap();
        assert!(gate.snapshot().check(FaultPoint::WorkloadCreate).is_err());

        std::fs::write(&path, "not json").unwrap();
        assert!(gate.load_file(&path).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
