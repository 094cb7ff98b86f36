//! Day-2 pool operations
//!
//! Brings live pool instances in line with edits to their pool spec: new RAID
//! groups, wider striped groups and single-device replacements. Planning is
//! done by [`crate::placement::operations`]; this module claims the devices
//! involved and rewrites the instance.

use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::context::Context;
use super::pool_cluster::{defer, ensure_claim, ClusterPass};
use crate::crd::{BlockDevice, CStorPoolCluster, CStorPoolInstance, PoolSpec, RaidGroup};
use crate::domain::events::{ControllerEvent, EventReason};
use crate::domain::ports::Selector;
use crate::error::{Error, Result, ResultExt};
use crate::fault::FaultPoint;
use crate::placement::device::check_usable;
use crate::placement::operations::apply_operations;
use crate::placement::{plan_operations, resolve_groups, Inventory, PoolOperation};

/// Run pending day-2 operations on every live instance of `cluster`.
pub(super) async fn reconcile_pool_operations(
    ctx: &Context,
    pass: &ClusterPass,
    cluster: &CStorPoolCluster,
    live: &[CStorPoolInstance],
) -> Result<()> {
    let mut failure = None;
    for pool in &cluster.spec.pools {
        let Some(instance) = live.iter().find(|i| i.spec.node_selector == pool.node_selector) else {
            continue;
        };
        defer(
            &mut failure,
            reconcile_instance(ctx, pass, cluster, pool, instance, live).await,
        );
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn reconcile_instance(
    ctx: &Context,
    pass: &ClusterPass,
    cluster: &CStorPoolCluster,
    pool: &PoolSpec,
    instance: &CStorPoolInstance,
    live: &[CStorPoolInstance],
) -> Result<()> {
    let spec_groups = resolve_groups(pool)?;
    let ops = plan_operations(&spec_groups, &instance.spec.data_raid_groups);
    if ops.is_empty() {
        return Ok(());
    }
    let instance_name = instance.name_any();

    let (rejected, runnable): (Vec<PoolOperation>, Vec<PoolOperation>) = ops
        .into_iter()
        .partition(|op| matches!(op, PoolOperation::Reject { .. }));
    for op in &rejected {
        warn!(instance = %instance_name, %op, "Refusing pool change");
        ctx.publish(ControllerEvent::warning(
            cluster,
            EventReason::PoolExpand,
            format!("{}: {}", instance_name, op),
        ))
        .await;
    }
    if runnable.is_empty() {
        return Ok(());
    }

    let devices = ctx
        .stores
        .block_devices
        .list(&pass.namespace, &Selector::everything())
        .await?;
    let claims = ctx
        .stores
        .block_device_claims
        .list(&pass.namespace, &Selector::everything())
        .await?;
    let by_name: BTreeMap<String, &BlockDevice> =
        devices.iter().map(|d| (d.name_any(), d)).collect();
    let inventory = Inventory {
        nodes: &[],
        devices: &devices,
        claims: &claims,
        instances: live,
    };

    let mut waiting = Vec::new();
    for name in runnable.iter().flat_map(PoolOperation::devices_to_claim) {
        let device = by_name.get(&name).copied().ok_or_else(|| Error::NotFound {
            kind: "BlockDevice".to_string(),
            name: name.clone(),
        })?;
        if let Err(e) = check_usable(&pass.name, instance.host(), device, &inventory) {
            ctx.publish(ControllerEvent::warning(
                cluster,
                EventReason::PoolExpand,
                format!("{}: {}", instance_name, e),
            ))
            .await;
            return Err(e.into());
        }

        let claim = ensure_claim(ctx, pass, cluster, device, instance.host(), &claims).await?;
        if !claim.is_bound() {
            waiting.push(claim.name_any());
            continue;
        }
        if device.has_prior_data() {
            ctx.publish(ControllerEvent::warning(
                cluster,
                EventReason::PoolExpand,
                format!("{}: block device {} holds existing data", instance_name, name),
            ))
            .await;
            return Err(Error::Contention(format!(
                "block device {} holds a filesystem or partition table",
                name
            )));
        }
    }
    if !waiting.is_empty() {
        debug!(instance = %instance_name, ?waiting, "Waiting for block device claims to bind");
        return Err(Error::Contention(format!(
            "block device claims not bound yet: {}",
            waiting.join(",")
        )));
    }

    let mut groups = instance.spec.data_raid_groups.clone();
    if !apply_operations(&mut groups, &runnable) {
        return Ok(());
    }
    fill_device_details(&mut groups, &by_name);

    let mut updated = instance.clone();
    updated.spec.data_raid_groups = groups;
    pass.faults.check(FaultPoint::InstanceUpdate)?;
    ctx.stores
        .pool_instances
        .replace(&pass.namespace, &updated)
        .await
        .context(format!("update raid groups of {}", instance_name))?;

    let summary: Vec<String> = runnable.iter().map(ToString::to_string).collect();
    info!(instance = %instance_name, operations = ?summary, "Applied pool operations");
    ctx.publish(ControllerEvent::normal(
        cluster,
        EventReason::PoolExpand,
        format!("{}: {}", instance_name, summary.join("; ")),
    ))
    .await;
    Ok(())
}

/// Fill in capacity and device link for devices that lack them.
fn fill_device_details(groups: &mut [RaidGroup], devices: &BTreeMap<String, &BlockDevice>) {
    for bd in groups.iter_mut().flat_map(|g| g.block_devices.iter_mut()) {
        let Some(device) = devices.get(&bd.block_device_name) else {
            continue;
        };
        if bd.capacity.is_none() {
            bd.capacity = Some(device.capacity());
        }
        if bd.dev_link.is_none() && !device.spec.path.is_empty() {
            bd.dev_link = Some(device.spec.path.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{BlockDeviceRef, BlockDeviceSpec, DeviceCapacity, RaidType};

    #[test]
    fn test_fill_device_details_keeps_existing_values() {
        let mut bd = BlockDevice::new(
            "d2",
            BlockDeviceSpec {
                capacity: DeviceCapacity { storage: 42 },
                path: "/dev/d2".into(),
                ..Default::default()
            },
        );
        bd.metadata.namespace = Some("openebs".into());
        let devices: BTreeMap<String, &BlockDevice> = [("d2".to_string(), &bd)].into();

        let mut kept = BlockDeviceRef::new("d1");
        kept.capacity = Some(7);
        let mut groups = vec![RaidGroup {
            raid_type: Some(RaidType::Stripe),
            block_devices: vec![kept, BlockDeviceRef::new("d2")],
        }];
        fill_device_details(&mut groups, &devices);

        assert_eq!(groups[0].block_devices[0].capacity, Some(7));
        assert_eq!(groups[0].block_devices[0].dev_link, None);
        assert_eq!(groups[0].block_devices[1].capacity, Some(42));
        assert_eq!(groups[0].block_devices[1].dev_link.as_deref(), Some("/dev/d2"));
    }
}
