//! Day-2 pool operations.
//!
//! Compares the RAID groups a pool spec declares against those a live pool
//! instance carries and works out what has to change. Spec groups are paired
//! with instance groups by shared devices; a group with no shared device is
//! paired by position when the instance has an unpaired group there.

use std::collections::BTreeSet;

use crate::crd::RaidGroup;

/// One change to apply to a pool instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolOperation {
    /// Append a new RAID group
    AddGroup { group: RaidGroup },
    /// Append devices to an existing striped group
    ExpandStripe {
        group_index: usize,
        added: Vec<String>,
    },
    /// Swap one device of a group for another
    Replace {
        group_index: usize,
        old: String,
        new: String,
    },
    /// Change the controller will not perform
    Reject { reason: String },
}

impl PoolOperation {
    /// Devices this operation needs claimed before it can run.
    pub fn devices_to_claim(&self) -> Vec<String> {
        match self {
            PoolOperation::AddGroup { group } => group
                .block_devices
                .iter()
                .map(|d| d.block_device_name.clone())
                .collect(),
            PoolOperation::ExpandStripe { added, .. } => added.clone(),
            PoolOperation::Replace { new, .. } => vec![new.clone()],
            PoolOperation::Reject { .. } => Vec::new(),
        }
    }
}

impl std::fmt::Display for PoolOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolOperation::AddGroup { group } => {
                let names: Vec<&str> = group
                    .block_devices
                    .iter()
                    .map(|d| d.block_device_name.as_str())
                    .collect();
                write!(f, "add raid group [{}]", names.join(","))
            }
            PoolOperation::ExpandStripe { group_index, added } => {
                write!(f, "expand group {} with [{}]", group_index, added.join(","))
            }
            PoolOperation::Replace {
                group_index,
                old,
                new,
            } => write!(f, "replace {} with {} in group {}", old, new, group_index),
            PoolOperation::Reject { reason } => write!(f, "rejected: {}", reason),
        }
    }
}

/// Work out the operations turning `instance` groups into `spec` groups.
///
/// `spec` groups must carry resolved RAID types.
pub fn plan_operations(spec: &[RaidGroup], instance: &[RaidGroup]) -> Vec<PoolOperation> {
    let mut paired: Vec<Option<usize>> = vec![None; spec.len()];
    let mut taken: BTreeSet<usize> = BTreeSet::new();

    for (si, group) in spec.iter().enumerate() {
        let wanted = group.device_names();
        let hit = instance
            .iter()
            .enumerate()
            .find(|(ii, g)| !taken.contains(ii) && !g.device_names().is_disjoint(&wanted));
        if let Some((ii, _)) = hit {
            paired[si] = Some(ii);
            taken.insert(ii);
        }
    }
    for (si, slot) in paired.iter_mut().enumerate() {
        if slot.is_none() && si < instance.len() && !taken.contains(&si) {
            *slot = Some(si);
            taken.insert(si);
        }
    }

    let mut ops = Vec::new();
    for (si, group) in spec.iter().enumerate() {
        match paired[si] {
            None => ops.push(PoolOperation::AddGroup {
                group: group.clone(),
            }),
            Some(ii) => {
                if let Some(op) = diff_group(ii, group, &instance[ii]) {
                    ops.push(op);
                }
            }
        }
    }

    for ii in (0..instance.len()).filter(|ii| !taken.contains(ii)) {
        ops.push(PoolOperation::Reject {
            reason: format!("removing raid group {} from a pool is not supported", ii),
        });
    }
    ops
}

fn diff_group(index: usize, spec: &RaidGroup, live: &RaidGroup) -> Option<PoolOperation> {
    let wanted = spec.device_names();
    let present = live.device_names();
    let added: Vec<String> = spec
        .block_devices
        .iter()
        .map(|d| d.block_device_name.clone())
        .filter(|d| !present.contains(d))
        .collect();
    let removed: Vec<String> = present.difference(&wanted).cloned().collect();
    let striped = live.raid_type.map(|t| t.is_striped()).unwrap_or(false);

    match (removed.len(), added.len()) {
        (0, 0) => None,
        (0, _) if striped => Some(PoolOperation::ExpandStripe {
            group_index: index,
            added,
        }),
        (0, n) => Some(PoolOperation::Reject {
            reason: format!(
                "cannot add {} block devices to {} group {}",
                n,
                live.raid_type.map(|t| t.to_string()).unwrap_or_default(),
                index
            ),
        }),
        (1, 1) => Some(PoolOperation::Replace {
            group_index: index,
            old: removed[0].clone(),
            new: added[0].clone(),
        }),
        (r, a) => Some(PoolOperation::Reject {
            reason: format!(
                "raid group {} differs by {} removed and {} added block devices; manual intervention required",
                index, r, a
            ),
        }),
    }
}

/// Apply non-rejected operations to `groups`. Returns whether anything changed.
pub fn apply_operations(groups: &mut Vec<RaidGroup>, ops: &[PoolOperation]) -> bool {
    let mut changed = false;
    for op in ops {
        match op {
            PoolOperation::AddGroup { group } => {
                groups.push(group.clone());
                changed = true;
            }
            PoolOperation::ExpandStripe { group_index, added } => {
                if let Some(group) = groups.get_mut(*group_index) {
                    for name in added {
                        group
                            .block_devices
                            .push(crate::crd::BlockDeviceRef::new(name.clone()));
                    }
                    changed = true;
                }
            }
            PoolOperation::Replace {
                group_index,
                old,
                new,
            } => {
                if let Some(slot) = groups
                    .get_mut(*group_index)
                    .and_then(|g| g.block_devices.iter_mut().find(|d| &d.block_device_name == old))
                {
                    *slot = crate::crd::BlockDeviceRef::new(new.clone());
                    changed = true;
                }
            }
            PoolOperation::Reject { .. } => {}
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{BlockDeviceRef, RaidType};
    use proptest::prelude::*;

    fn group(t: RaidType, devices: &[&str]) -> RaidGroup {
        RaidGroup {
            raid_type: Some(t),
            block_devices: devices.iter().map(|d| BlockDeviceRef::new(*d)).collect(),
        }
    }

    #[test]
    fn test_unchanged_is_empty() {
        let g = vec![group(RaidType::Mirror, &["d1", "d2"])];
        assert!(plan_operations(&g, &g).is_empty());
    }

    #[test]
    fn test_expand_stripe_appends_only_added() {
        let spec = vec![group(RaidType::Stripe, &["d1", "d4"])];
        let live = vec![group(RaidType::Stripe, &["d1"])];
        let ops = plan_operations(&spec, &live);
        assert_eq!(
            ops,
            vec![PoolOperation::ExpandStripe {
                group_index: 0,
                added: vec!["d4".into()]
            }]
        );

        let mut groups = live.clone();
        assert!(apply_operations(&mut groups, &ops));
        assert_eq!(groups, spec);
    }

    #[test]
    fn test_replace_single_device_in_mirror() {
        let spec = vec![group(RaidType::Mirror, &["d1", "d3"])];
        let live = vec![group(RaidType::Mirror, &["d1", "d2"])];
        let ops = plan_operations(&spec, &live);
        assert_eq!(
            ops,
            vec![PoolOperation::Replace {
                group_index: 0,
                old: "d2".into(),
                new: "d3".into()
            }]
        );
        assert_eq!(ops[0].devices_to_claim(), vec!["d3".to_string()]);

        let mut groups = live.clone();
        apply_operations(&mut groups, &ops);
        assert_eq!(groups[0].device_names(), spec[0].device_names());
        // The replacement keeps the old device's slot
        assert_eq!(groups[0].block_devices[1].block_device_name, "d3");
    }

    #[test]
    fn test_single_device_stripe_swap_pairs_by_position() {
        let spec = vec![group(RaidType::Stripe, &["d9"])];
        let live = vec![group(RaidType::Stripe, &["d1"])];
        assert_eq!(
            plan_operations(&spec, &live),
            vec![PoolOperation::Replace {
                group_index: 0,
                old: "d1".into(),
                new: "d9".into()
            }]
        );
    }

    #[test]
    fn test_add_group() {
        let spec = vec![
            group(RaidType::Mirror, &["d1", "d2"]),
            group(RaidType::Mirror, &["d3", "d4"]),
        ];
        let live = vec![group(RaidType::Mirror, &["d1", "d2"])];
        let ops = plan_operations(&spec, &live);
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], PoolOperation::AddGroup { group } if group == &spec[1]));
        assert_eq!(ops[0].devices_to_claim(), vec!["d3".to_string(), "d4".to_string()]);
    }

    #[test]
    fn test_rejections() {
        // Two devices swapped at once
        let spec = vec![group(RaidType::Raidz, &["d1", "d5", "d6"])];
        let live = vec![group(RaidType::Raidz, &["d1", "d2", "d3"])];
        let ops = plan_operations(&spec, &live);
        assert!(matches!(&ops[0], PoolOperation::Reject { reason } if reason.contains("manual intervention")));

        // Growing a mirror
        let spec = vec![group(RaidType::Mirror, &["d1", "d2", "d3"])];
        let live = vec![group(RaidType::Mirror, &["d1", "d2"])];
        let ops = plan_operations(&spec, &live);
        assert!(matches!(&ops[0], PoolOperation::Reject { reason } if reason.contains("mirror")));

        // Dropping a group
        let spec = vec![group(RaidType::Stripe, &["d1"])];
        let live = vec![group(RaidType::Stripe, &["d1"]), group(RaidType::Stripe, &["d2"])];
        let ops = plan_operations(&spec, &live);
        assert!(matches!(&ops[0], PoolOperation::Reject { reason } if reason.contains("removing")));

        let mut groups = live.clone();
        assert!(!apply_operations(&mut groups, &ops));
        assert_eq!(groups, live);
    }

    proptest! {
        #[test]
        fn prop_striped_growth_is_expansion(base in 1usize..5, extra in 1usize..5) {
            let live_names: Vec<String> = (0..base).map(|i| format!("d{}", i)).collect();
            let spec_names: Vec<String> = (0..base + extra).map(|i| format!("d{}", i)).collect();
            let live = vec![RaidGroup {
                raid_type: Some(RaidType::Stripe),
                block_devices: live_names.iter().map(BlockDeviceRef::new).collect(),
            }];
            let spec = vec![RaidGroup {
                raid_type: Some(RaidType::Stripe),
                block_devices: spec_names.iter().map(BlockDeviceRef::new).collect(),
            }];

            let ops = plan_operations(&spec, &live);
            prop_assert_eq!(ops.len(), 1);
            let mut groups = live.clone();
            apply_operations(&mut groups, &ops);
            prop_assert_eq!(groups, spec);
        }

        #[test]
        fn prop_plan_is_idempotent_after_apply(swap in 0usize..3) {
            let live = vec![group(RaidType::Raidz, &["a", "b", "c"])];
            let mut names = vec!["a", "b", "c"];
            names[swap] = "z";
            let spec = vec![group(RaidType::Raidz, &names)];

            let ops = plan_operations(&spec, &live);
            let mut groups = live.clone();
            apply_operations(&mut groups, &ops);
            prop_assert!(plan_operations(&spec, &groups).is_empty());
        }
    }
}
