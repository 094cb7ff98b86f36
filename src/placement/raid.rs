//! RAID topology rules and pool cluster validation.

use std::collections::{BTreeMap, BTreeSet};

use super::SelectionError;
use crate::crd::{CStorPoolClusterSpec, PoolSpec, RaidGroup};
use crate::error::{Error, Result};

/// Resolve every group's RAID type against the pool default and check its
/// cardinality.
pub fn resolve_groups(pool: &PoolSpec) -> std::result::Result<Vec<RaidGroup>, SelectionError> {
    if pool.data_raid_groups.is_empty() {
        return Err(SelectionError::RaidConstraintViolation(
            "pool has no raid groups".to_string(),
        ));
    }

    pool.data_raid_groups
        .iter()
        .enumerate()
        .map(|(index, group)| {
            let raid_type = group.resolved_type(&pool.pool_config).ok_or_else(|| {
                SelectionError::RaidConstraintViolation(format!(
                    "raid group {} has no type and the pool sets no default",
                    index
                ))
            })?;
            let count = group.block_devices.len();
            if !raid_type.accepts(count) {
                return Err(SelectionError::RaidConstraintViolation(format!(
                    "raid group {} of type {} cannot hold {} block devices",
                    index, raid_type, count
                )));
            }
            Ok(RaidGroup {
                raid_type: Some(raid_type),
                block_devices: group.block_devices.clone(),
            })
        })
        .collect()
}

/// Validate a pool cluster spec the way the admission layer would.
///
/// All problems are collected into one validation error.
pub fn validate_cluster(spec: &CStorPoolClusterSpec) -> Result<()> {
    let mut problems = Vec::new();
    let mut seen_devices: BTreeMap<&str, usize> = BTreeMap::new();
    let mut seen_selectors: BTreeSet<String> = BTreeSet::new();

    for (index, pool) in spec.pools.iter().enumerate() {
        if pool.node_selector.is_empty() {
            problems.push(format!("pool {}: node selector is empty", index));
        } else if !seen_selectors.insert(pool.selector_string()) {
            problems.push(format!(
                "pool {}: node selector {} is used by another pool",
                index,
                pool.selector_string()
            ));
        }

        if let Err(e) = resolve_groups(pool) {
            problems.push(format!("pool {}: {}", index, e));
        }

        for device in pool.device_names() {
            if device.is_empty() {
                problems.push(format!("pool {}: block device name is empty", index));
                continue;
            }
            if let Some(other) = seen_devices.insert(device, index) {
                problems.push(format!(
                    "block device {} is referenced by pools {} and {}",
                    device, other, index
                ));
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(problems.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{BlockDeviceRef, PoolConfig, RaidType};
    use assert_matches::assert_matches;

    fn pool(node: &str, groups: Vec<RaidGroup>, default: Option<RaidType>) -> PoolSpec {
        PoolSpec {
            node_selector: [("kubernetes.io/hostname".to_string(), node.to_string())].into(),
            data_raid_groups: groups,
            pool_config: PoolConfig {
                data_raid_group_type: default,
                ..Default::default()
            },
        }
    }

    fn group(t: Option<RaidType>, devices: &[&str]) -> RaidGroup {
        RaidGroup {
            raid_type: t,
            block_devices: devices.iter().map(|d| BlockDeviceRef::new(*d)).collect(),
        }
    }

    #[test]
    fn test_resolve_applies_default_type() {
        let p = pool(
            "n1",
            vec![group(None, &["d1", "d2"]), group(Some(RaidType::Stripe), &["d3"])],
            Some(RaidType::Mirror),
        );
        let groups = resolve_groups(&p).unwrap();
        assert_eq!(groups[0].raid_type, Some(RaidType::Mirror));
        assert_eq!(groups[1].raid_type, Some(RaidType::Stripe));
    }

    #[test]
    fn test_resolve_rejects_missing_type_and_bad_cardinality() {
        let p = pool("n1", vec![group(None, &["d1"])], None);
        assert_matches!(
            resolve_groups(&p),
            Err(SelectionError::RaidConstraintViolation(_))
        );

        let p = pool("n1", vec![group(Some(RaidType::Mirror), &["d1", "d2", "d3"])], None);
        assert_matches!(
            resolve_groups(&p),
            Err(SelectionError::RaidConstraintViolation(_))
        );

        let p = pool("n1", vec![group(Some(RaidType::Raidz2), &["a", "b", "c", "d", "e"])], None);
        assert!(resolve_groups(&p).is_err());

        let p = pool("n1", vec![], Some(RaidType::Stripe));
        assert!(resolve_groups(&p).is_err());
    }

    #[test]
    fn test_validate_accepts_good_cluster() {
        let spec = CStorPoolClusterSpec {
            pools: vec![
                pool("n1", vec![group(None, &["d1"])], Some(RaidType::Stripe)),
                pool("n2", vec![group(Some(RaidType::Raidz), &["d2", "d3", "d4"])], None),
            ],
            ..Default::default()
        };
        assert!(validate_cluster(&spec).is_ok());
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut empty_selector = pool("n3", vec![group(None, &[""])], Some(RaidType::Stripe));
        empty_selector.node_selector.clear();

        let spec = CStorPoolClusterSpec {
            pools: vec![
                pool("n1", vec![group(None, &["d1"])], Some(RaidType::Stripe)),
                pool("n1", vec![group(None, &["d1"])], Some(RaidType::Stripe)),
                empty_selector,
            ],
            ..Default::default()
        };
        let err = validate_cluster(&spec).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("used by another pool"), "{}", msg);
        assert!(msg.contains("block device d1 is referenced by pools 0 and 1"), "{}", msg);
        assert!(msg.contains("node selector is empty"), "{}", msg);
        assert!(msg.contains("block device name is empty"), "{}", msg);
    }
}
