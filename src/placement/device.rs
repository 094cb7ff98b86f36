//! Node/Device Selector
//!
//! Decides, for every pool spec without a pool instance, which node it lands
//! on and which block devices must be claimed.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

use super::raid::resolve_groups;
use super::SelectionError;
use crate::crd::{
    keys::CLUSTER_LABEL, BlockDevice, BlockDeviceClaim, CStorPoolCluster, CStorPoolInstance,
    ClaimState, PoolSpec, RaidGroup,
};
use crate::domain::ports::Selector;

/// Snapshot of the cluster state selection runs against.
#[derive(Debug, Clone, Copy)]
pub struct Inventory<'a> {
    pub nodes: &'a [Node],
    pub devices: &'a [BlockDevice],
    pub claims: &'a [BlockDeviceClaim],
    /// Pool instances of every cluster in the namespace
    pub instances: &'a [CStorPoolInstance],
}

/// Where and how one pool spec gets provisioned.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolPlan {
    /// Index of the pool spec in the cluster spec
    pub pool_index: usize,
    pub node: String,
    /// Groups with resolved types and device capacities filled in
    pub raid_groups: Vec<RaidGroup>,
    /// Devices to claim, in lexicographic order
    pub devices: Vec<String>,
}

/// Outcome per pool spec that still needs an instance.
#[derive(Debug, Clone, Default)]
pub struct SelectionPlan {
    pub pools: Vec<(usize, std::result::Result<PoolPlan, SelectionError>)>,
}

impl SelectionPlan {
    pub fn ready(&self) -> impl Iterator<Item = &PoolPlan> {
        self.pools.iter().filter_map(|(_, r)| r.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (usize, &SelectionError)> {
        self.pools
            .iter()
            .filter_map(|(i, r)| r.as_ref().err().map(|e| (*i, e)))
    }
}

/// Resolve the single node a pool spec's selector matches.
pub fn resolve_node(pool: &PoolSpec, nodes: &[Node]) -> std::result::Result<String, SelectionError> {
    let selector = Selector::from_labels(&pool.node_selector);
    let matching: Vec<&Node> = nodes
        .iter()
        .filter(|n| !pool.node_selector.is_empty() && selector.matches(n.labels()))
        .collect();
    match matching.as_slice() {
        [node] => Ok(node.name_any()),
        [] => Err(SelectionError::NodeNotFound {
            selector: pool.selector_string(),
        }),
        many => Err(SelectionError::NodeAmbiguous {
            selector: pool.selector_string(),
            count: many.len(),
        }),
    }
}

/// Plan provisioning for every pool spec whose node has no instance of this
/// cluster yet.
pub fn select(cluster: &CStorPoolCluster, inventory: &Inventory<'_>) -> SelectionPlan {
    let cluster_name = cluster.name_any();
    let provisioned_hosts: Vec<&str> = inventory
        .instances
        .iter()
        .filter(|i| i.cluster_name() == Some(cluster_name.as_str()))
        .map(|i| i.host())
        .collect();

    let mut plan = SelectionPlan::default();
    for (index, pool) in cluster.spec.pools.iter().enumerate() {
        let node = match resolve_node(pool, inventory.nodes) {
            Ok(node) => node,
            Err(e) => {
                plan.pools.push((index, Err(e)));
                continue;
            }
        };
        if provisioned_hosts.contains(&node.as_str()) {
            continue;
        }
        plan.pools
            .push((index, plan_pool(&cluster_name, index, pool, node, inventory)));
    }
    plan
}

fn plan_pool(
    cluster: &str,
    index: usize,
    pool: &PoolSpec,
    node: String,
    inventory: &Inventory<'_>,
) -> std::result::Result<PoolPlan, SelectionError> {
    let mut groups = resolve_groups(pool)?;
    let devices: BTreeMap<&str, &BlockDevice> = inventory
        .devices
        .iter()
        .map(|d| (d.metadata.name.as_deref().unwrap_or_default(), d))
        .collect();

    let mut to_claim: Vec<String> = Vec::new();
    for group in &groups {
        let striped = group.raid_type.map(|t| t.is_striped()).unwrap_or(false);
        let mut names: Vec<&str> = group
            .block_devices
            .iter()
            .map(|d| d.block_device_name.as_str())
            .collect();
        names.sort_unstable();

        for name in &names {
            let device = devices.get(name).copied().ok_or_else(|| unavailable(name, "not found"))?;
            check_usable(cluster, &node, device, inventory)?;
            if !striped {
                check_capacity(device, &names, &devices)?;
            }
            to_claim.push(name.to_string());
        }
    }

    for group in &mut groups {
        for bd in &mut group.block_devices {
            if let Some(device) = devices.get(bd.block_device_name.as_str()) {
                bd.capacity = Some(device.capacity());
                if !device.spec.path.is_empty() {
                    bd.dev_link = Some(device.spec.path.clone());
                }
            }
        }
    }

    to_claim.sort();
    Ok(PoolPlan {
        pool_index: index,
        node,
        raid_groups: groups,
        devices: to_claim,
    })
}

/// Check that `device` may be claimed by `cluster` for a pool on `node`.
pub fn check_usable(
    cluster: &str,
    node: &str,
    device: &BlockDevice,
    inventory: &Inventory<'_>,
) -> std::result::Result<(), SelectionError> {
    let name = device.name_any();
    if device.node() != node {
        return Err(unavailable(
            &name,
            &format!("attached to node {:?}, not {:?}", device.node(), node),
        ));
    }
    if !device.is_active() {
        return Err(unavailable(&name, "device is not active"));
    }

    let claim = inventory
        .claims
        .iter()
        .find(|c| c.spec.block_device_name == name);
    match claim {
        Some(c) if c.labels().get(CLUSTER_LABEL).map(String::as_str) != Some(cluster) => {
            return Err(unavailable(
                &name,
                &format!("claimed by {}", c.name_any()),
            ));
        }
        None if device.claim_state() != ClaimState::Unclaimed => {
            return Err(unavailable(
                &name,
                &format!("device claim state is {}", device.claim_state()),
            ));
        }
        _ => {}
    }

    if let Some(owner) = inventory
        .instances
        .iter()
        .find(|i| i.device_names().contains(&name))
    {
        return Err(unavailable(
            &name,
            &format!("in use by pool instance {}", owner.name_any()),
        ));
    }
    Ok(())
}

fn check_capacity(
    device: &BlockDevice,
    group: &[&str],
    devices: &BTreeMap<&str, &BlockDevice>,
) -> std::result::Result<(), SelectionError> {
    let name = device.name_any();
    let largest_sibling = group
        .iter()
        .filter(|n| **n != name)
        .filter_map(|n| devices.get(n))
        .map(|d| d.capacity())
        .max()
        .unwrap_or(0);
    if device.capacity() < largest_sibling {
        return Err(unavailable(
            &name,
            &format!(
                "capacity {} is smaller than sibling capacity {}",
                device.capacity(),
                largest_sibling
            ),
        ));
    }
    Ok(())
}

fn unavailable(device: &str, reason: &str) -> SelectionError {
    SelectionError::DeviceUnavailable {
        device: device.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        keys::HOSTNAME_LABEL, BlockDeviceClaimSpec, BlockDeviceRef, BlockDeviceSpec,
        BlockDeviceStatus, CStorPoolClusterSpec, CStorPoolInstanceSpec, DeviceCapacity,
        DeviceState, NodeAttributes, PoolConfig, RaidType,
    };
    use assert_matches::assert_matches;

    const GI: u64 = 1024 * 1024 * 1024;

    fn node(name: &str) -> Node {
        let mut n = Node::default();
        n.metadata.name = Some(name.into());
        n.metadata.labels = Some([(HOSTNAME_LABEL.to_string(), name.to_string())].into());
        n
    }

    fn device(name: &str, node: &str, gib: u64) -> BlockDevice {
        let mut bd = BlockDevice::new(
            name,
            BlockDeviceSpec {
                capacity: DeviceCapacity { storage: gib * GI },
                node_attributes: NodeAttributes {
                    node_name: node.into(),
                },
                path: format!("/dev/{}", name),
                ..Default::default()
            },
        );
        bd.status = Some(BlockDeviceStatus {
            state: DeviceState::Active,
            claim_state: ClaimState::Unclaimed,
        });
        bd
    }

    fn pool(node: &str, t: RaidType, devices: &[&str]) -> PoolSpec {
        PoolSpec {
            node_selector: [(HOSTNAME_LABEL.to_string(), node.to_string())].into(),
            data_raid_groups: vec![RaidGroup {
                raid_type: Some(t),
                block_devices: devices.iter().map(|d| BlockDeviceRef::new(*d)).collect(),
            }],
            pool_config: PoolConfig::default(),
        }
    }

    fn cluster(pools: Vec<PoolSpec>) -> CStorPoolCluster {
        CStorPoolCluster::new(
            "cspc-a",
            CStorPoolClusterSpec {
                pools,
                ..Default::default()
            },
        )
    }

    fn instance(name: &str, cluster: &str, host: &str, devices: &[&str]) -> CStorPoolInstance {
        let mut i = CStorPoolInstance::new(
            name,
            CStorPoolInstanceSpec {
                host_name: host.into(),
                data_raid_groups: vec![RaidGroup {
                    raid_type: Some(RaidType::Stripe),
                    block_devices: devices.iter().map(|d| BlockDeviceRef::new(*d)).collect(),
                }],
                ..Default::default()
            },
        );
        i.labels_mut().insert(CLUSTER_LABEL.into(), cluster.into());
        i.labels_mut().insert(HOSTNAME_LABEL.into(), host.into());
        i
    }

    #[test]
    fn test_stripe_plan_per_node() {
        let nodes = vec![node("n1"), node("n2")];
        let devices = vec![device("d1", "n1", 10), device("d2", "n2", 10)];
        let c = cluster(vec![
            pool("n1", RaidType::Stripe, &["d1"]),
            pool("n2", RaidType::Stripe, &["d2"]),
        ]);
        let inv = Inventory {
            nodes: &nodes,
            devices: &devices,
            claims: &[],
            instances: &[],
        };

        let plan = select(&c, &inv);
        let ready: Vec<_> = plan.ready().collect();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].node, "n1");
        assert_eq!(ready[0].devices, vec!["d1"]);
        assert_eq!(ready[0].raid_groups[0].block_devices[0].capacity, Some(10 * GI));
        assert_eq!(
            ready[0].raid_groups[0].block_devices[0].dev_link.as_deref(),
            Some("/dev/d1")
        );
        assert_eq!(plan.failures().count(), 0);
    }

    #[test]
    fn test_provisioned_nodes_are_skipped() {
        let nodes = vec![node("n1"), node("n2")];
        let devices = vec![device("d1", "n1", 10), device("d2", "n2", 10)];
        let instances = vec![instance("cspc-a-abcde", "cspc-a", "n1", &["d1"])];
        let c = cluster(vec![
            pool("n1", RaidType::Stripe, &["d1"]),
            pool("n2", RaidType::Stripe, &["d2"]),
        ]);
        let inv = Inventory {
            nodes: &nodes,
            devices: &devices,
            claims: &[],
            instances: &instances,
        };
        let plan = select(&c, &inv);
        assert_eq!(plan.pools.len(), 1);
        assert_eq!(plan.pools[0].0, 1);
    }

    #[test]
    fn test_node_failures() {
        let mut twin = node("n1-twin");
        twin.labels_mut().insert("zone".into(), "a".into());
        let mut first = node("n1");
        first.labels_mut().insert("zone".into(), "a".into());
        let nodes = vec![first, twin];

        let mut ambiguous = pool("n1", RaidType::Stripe, &["d1"]);
        ambiguous.node_selector = [("zone".to_string(), "a".to_string())].into();
        assert_matches!(
            resolve_node(&ambiguous, &nodes),
            Err(SelectionError::NodeAmbiguous { count: 2, .. })
        );

        let missing = pool("n9", RaidType::Stripe, &["d1"]);
        assert_matches!(
            resolve_node(&missing, &nodes),
            Err(SelectionError::NodeNotFound { .. })
        );
    }

    #[test]
    fn test_device_on_other_node_or_inactive() {
        let nodes = vec![node("n1")];
        let mut inactive = device("d2", "n1", 10);
        inactive.status.as_mut().unwrap().state = DeviceState::Inactive;
        let devices = vec![device("d1", "n2", 10), inactive];

        let inv = Inventory {
            nodes: &nodes,
            devices: &devices,
            claims: &[],
            instances: &[],
        };
        let c = cluster(vec![pool("n1", RaidType::Stripe, &["d1"])]);
        let plan = select(&c, &inv);
        assert_matches!(
            &plan.pools[0].1,
            Err(SelectionError::DeviceUnavailable { device, reason }) if device == "d1" && reason.contains("attached to node")
        );

        let c = cluster(vec![pool("n1", RaidType::Stripe, &["d2"])]);
        let plan = select(&c, &inv);
        assert_matches!(
            &plan.pools[0].1,
            Err(SelectionError::DeviceUnavailable { reason, .. }) if reason.contains("not active")
        );
    }

    #[test]
    fn test_claims_from_other_cluster_block_selection() {
        let nodes = vec![node("n1")];
        let devices = vec![device("d1", "n1", 10)];
        let mut foreign = BlockDeviceClaim::new(
            "bdc-cstor-x",
            BlockDeviceClaimSpec {
                block_device_name: "d1".into(),
                ..Default::default()
            },
        );
        foreign.labels_mut().insert(CLUSTER_LABEL.into(), "cspc-b".into());
        let claims = vec![foreign.clone()];
        let c = cluster(vec![pool("n1", RaidType::Stripe, &["d1"])]);

        let inv = Inventory {
            nodes: &nodes,
            devices: &devices,
            claims: &claims,
            instances: &[],
        };
        assert_matches!(
            &select(&c, &inv).pools[0].1,
            Err(SelectionError::DeviceUnavailable { reason, .. }) if reason.contains("claimed by")
        );

        // Our own claim is fine
        foreign.labels_mut().insert(CLUSTER_LABEL.into(), "cspc-a".into());
        let claims = vec![foreign];
        let inv = Inventory {
            claims: &claims,
            ..inv
        };
        assert!(select(&c, &inv).pools[0].1.is_ok());
    }

    #[test]
    fn test_device_in_other_instance_is_unavailable() {
        let nodes = vec![node("n1")];
        let devices = vec![device("d1", "n1", 10)];
        let instances = vec![instance("cspc-b-zzzzz", "cspc-b", "n1", &["d1"])];
        let c = cluster(vec![pool("n1", RaidType::Stripe, &["d1"])]);
        let inv = Inventory {
            nodes: &nodes,
            devices: &devices,
            claims: &[],
            instances: &instances,
        };
        assert_matches!(
            &select(&c, &inv).pools[0].1,
            Err(SelectionError::DeviceUnavailable { reason, .. }) if reason.contains("cspc-b-zzzzz")
        );
    }

    #[test]
    fn test_mirror_capacity_rule_reports_lexicographically_first() {
        let nodes = vec![node("n1")];
        let devices = vec![device("d1", "n1", 10), device("d2", "n1", 5)];
        let c = cluster(vec![pool("n1", RaidType::Mirror, &["d2", "d1"])]);
        let inv = Inventory {
            nodes: &nodes,
            devices: &devices,
            claims: &[],
            instances: &[],
        };
        assert_matches!(
            &select(&c, &inv).pools[0].1,
            Err(SelectionError::DeviceUnavailable { device, reason }) if device == "d2" && reason.contains("smaller")
        );

        // Stripes may mix sizes
        let c = cluster(vec![pool("n1", RaidType::Stripe, &["d2", "d1"])]);
        let plan = select(&c, &inv);
        let ready: Vec<_> = plan.ready().collect();
        assert_eq!(ready[0].devices, vec!["d1", "d2"]);
        // Group order follows the pool spec
        assert_eq!(ready[0].raid_groups[0].block_devices[0].block_device_name, "d2");
    }

    #[test]
    fn test_raid_violation_surfaces() {
        let nodes = vec![node("n1")];
        let devices = vec![device("d1", "n1", 10)];
        let c = cluster(vec![pool("n1", RaidType::Mirror, &["d1"])]);
        let inv = Inventory {
            nodes: &nodes,
            devices: &devices,
            claims: &[],
            instances: &[],
        };
        assert_matches!(
            &select(&c, &inv).pools[0].1,
            Err(SelectionError::RaidConstraintViolation(_))
        );
    }
}
