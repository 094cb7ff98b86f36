//! Disruption-Budget Manager
//!
//! Keeps one `PodDisruptionBudget` per volume and one per pool cluster.
//! Budgets are never updated in place: when the selector or the minimum
//! drifts, the old budget is deleted and a fresh one created.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use super::finalizer::controller_owner_ref;
use crate::crd::keys::{
    APP_LABEL, CLUSTER_LABEL, PERSISTENT_VOLUME_LABEL, POOL_APP, POOL_INSTANCE_NAME_LABEL,
};
use crate::crd::{consistency_factor, CStorPoolCluster, CStorVolume};
use crate::domain::ports::{ResourceStore, Selector};
use crate::error::{Result, ResultExt};
use crate::metrics;

/// What a budget should look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetShape {
    pub min_available: i32,
    /// Pool instance names for a volume budget; empty for a cluster budget
    pub pools: BTreeSet<String>,
}

impl BudgetShape {
    /// Read the shape back from a stored budget.
    pub fn of(pdb: &PodDisruptionBudget) -> Self {
        let spec = pdb.spec.as_ref();
        let min_available = match spec.and_then(|s| s.min_available.as_ref()) {
            Some(IntOrString::Int(n)) => *n,
            Some(IntOrString::String(s)) => s.parse().unwrap_or(-1),
            None => -1,
        };
        let pools = spec
            .and_then(|s| s.selector.as_ref())
            .and_then(|s| s.match_expressions.as_ref())
            .into_iter()
            .flatten()
            .filter(|e| e.key == POOL_INSTANCE_NAME_LABEL && e.operator == "In")
            .flat_map(|e| e.values.iter().flatten().cloned())
            .collect();
        Self {
            min_available,
            pools,
        }
    }
}

// =============================================================================
// Volume budget
// =============================================================================

/// Converge the budget of `volume` onto `pools`, the pool instances that
/// currently hold its replicas.
///
/// With `enabled` false every budget of the volume is removed. No budget is
/// created while `pools` is empty.
pub async fn reconcile_volume_budget(
    store: &dyn ResourceStore<PodDisruptionBudget>,
    volume: &CStorVolume,
    pools: &BTreeSet<String>,
    replication_factor: u32,
    enabled: bool,
) -> Result<()> {
    let namespace = volume.namespace().unwrap_or_default();
    let volume_name = volume.name_any();
    let selector = Selector::eq(PERSISTENT_VOLUME_LABEL, &volume_name);

    if !enabled || pools.is_empty() {
        return delete_budgets(store, &namespace, &selector).await;
    }

    let desired = BudgetShape {
        min_available: consistency_factor(replication_factor) as i32,
        pools: pools.clone(),
    };
    let existing = store.list(&namespace, &selector).await?;
    if keep_matching(store, &namespace, existing, &desired).await? {
        return Ok(());
    }

    let owner = controller_owner_ref(volume)?;
    let pdb = PodDisruptionBudget {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", volume_name)),
            namespace: Some(namespace.clone()),
            labels: Some(
                [(PERSISTENT_VOLUME_LABEL.to_string(), volume_name.clone())]
                    .into_iter()
                    .chain(
                        volume
                            .labels()
                            .get(CLUSTER_LABEL)
                            .map(|c| (CLUSTER_LABEL.to_string(), c.clone())),
                    )
                    .collect(),
            ),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(desired.min_available)),
            selector: Some(LabelSelector {
                match_labels: Some([(APP_LABEL.to_string(), POOL_APP.to_string())].into()),
                match_expressions: Some(vec![LabelSelectorRequirement {
                    key: POOL_INSTANCE_NAME_LABEL.to_string(),
                    operator: "In".to_string(),
                    values: Some(desired.pools.iter().cloned().collect()),
                }]),
            }),
            ..Default::default()
        }),
        status: None,
    };
    let created = store
        .create(&namespace, &pdb)
        .await
        .context(format!("create disruption budget for volume {}", volume_name))?;
    metrics::record_write("PodDisruptionBudget", "create");
    info!(
        volume = %volume_name,
        budget = %created.name_any(),
        pools = ?desired.pools,
        min_available = desired.min_available,
        "Created volume disruption budget"
    );
    Ok(())
}

/// Remove every budget of the named volume.
pub async fn delete_volume_budgets(
    store: &dyn ResourceStore<PodDisruptionBudget>,
    namespace: &str,
    volume_name: &str,
) -> Result<()> {
    delete_budgets(store, namespace, &Selector::eq(PERSISTENT_VOLUME_LABEL, volume_name)).await
}

// =============================================================================
// Cluster budget
// =============================================================================

/// Converge the budget guarding the pool workloads of `cluster`.
pub async fn reconcile_cluster_budget(
    store: &dyn ResourceStore<PodDisruptionBudget>,
    cluster: &CStorPoolCluster,
) -> Result<()> {
    let namespace = cluster.namespace_or_default();
    let cluster_name = cluster.name_any();
    // Volume budgets carry the cluster label too; only the cluster's own
    // budget lacks the volume label.
    let existing: Vec<PodDisruptionBudget> = store
        .list(&namespace, &Selector::eq(CLUSTER_LABEL, &cluster_name))
        .await?
        .into_iter()
        .filter(|p| !p.labels().contains_key(PERSISTENT_VOLUME_LABEL))
        .collect();

    let min_available = cluster.min_available();
    if min_available <= 0 {
        for pdb in existing {
            delete_one(store, &namespace, &pdb).await?;
        }
        return Ok(());
    }

    let desired = BudgetShape {
        min_available,
        pools: BTreeSet::new(),
    };
    if keep_matching(store, &namespace, existing, &desired).await? {
        return Ok(());
    }

    let owner = controller_owner_ref(cluster)?;
    let match_labels: BTreeMap<String, String> = [
        (CLUSTER_LABEL.to_string(), cluster_name.clone()),
        (APP_LABEL.to_string(), POOL_APP.to_string()),
    ]
    .into();
    let pdb = PodDisruptionBudget {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", cluster_name)),
            namespace: Some(namespace.clone()),
            labels: Some([(CLUSTER_LABEL.to_string(), cluster_name.clone())].into()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(min_available)),
            selector: Some(LabelSelector {
                match_labels: Some(match_labels),
                match_expressions: None,
            }),
            ..Default::default()
        }),
        status: None,
    };
    store
        .create(&namespace, &pdb)
        .await
        .context(format!("create disruption budget for cluster {}", cluster_name))?;
    metrics::record_write("PodDisruptionBudget", "create");
    info!(cluster = %cluster_name, min_available, "Created cluster disruption budget");
    Ok(())
}

/// Delete every budget of the cluster, volume budgets excluded.
pub async fn delete_cluster_budgets(
    store: &dyn ResourceStore<PodDisruptionBudget>,
    cluster: &CStorPoolCluster,
) -> Result<()> {
    let namespace = cluster.namespace_or_default();
    let budgets = store
        .list(&namespace, &Selector::eq(CLUSTER_LABEL, cluster.name_any()))
        .await?;
    for pdb in budgets
        .iter()
        .filter(|p| !p.labels().contains_key(PERSISTENT_VOLUME_LABEL))
    {
        delete_one(store, &namespace, pdb).await?;
    }
    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

/// Keep the first budget matching `desired` and delete the rest. Returns
/// whether a match was kept.
async fn keep_matching(
    store: &dyn ResourceStore<PodDisruptionBudget>,
    namespace: &str,
    existing: Vec<PodDisruptionBudget>,
    desired: &BudgetShape,
) -> Result<bool> {
    let mut kept = false;
    for pdb in existing {
        if !kept && BudgetShape::of(&pdb) == *desired {
            debug!(budget = %pdb.name_any(), "Disruption budget up to date");
            kept = true;
            continue;
        }
        delete_one(store, namespace, &pdb).await?;
    }
    Ok(kept)
}

async fn delete_budgets(
    store: &dyn ResourceStore<PodDisruptionBudget>,
    namespace: &str,
    selector: &Selector,
) -> Result<()> {
    for pdb in store.list(namespace, selector).await? {
        delete_one(store, namespace, &pdb).await?;
    }
    Ok(())
}

async fn delete_one(
    store: &dyn ResourceStore<PodDisruptionBudget>,
    namespace: &str,
    pdb: &PodDisruptionBudget,
) -> Result<()> {
    let name = pdb.name_any();
    store
        .delete(namespace, &name)
        .await
        .context(format!("delete disruption budget {}", name))?;
    metrics::record_write("PodDisruptionBudget", "delete");
    info!(budget = %name, "Deleted disruption budget");
    Ok(())
}
