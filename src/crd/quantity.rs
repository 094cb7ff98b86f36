//! Byte quantities in Kubernetes notation ("10Gi", "500M", "1073741824").

use crate::error::{Error, Result};

const BINARY: &[(&str, u32)] = &[
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];
const DECIMAL: &[(&str, u32)] = &[
    ("k", 1),
    ("K", 1),
    ("M", 2),
    ("G", 3),
    ("T", 4),
    ("P", 5),
    ("E", 6),
];

/// Parse a quantity string into bytes.
///
/// Only integral values are accepted; capacities in cStor are never fractional.
pub fn parse_bytes(quantity: &str) -> Result<u64> {
    let q = quantity.trim();
    if q.is_empty() {
        return Err(Error::Quantity(quantity.to_string()));
    }

    let (digits, multiplier) = split_suffix(q).ok_or_else(|| Error::Quantity(quantity.to_string()))?;
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::Quantity(quantity.to_string()))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::Quantity(quantity.to_string()))
}

fn split_suffix(q: &str) -> Option<(&str, u64)> {
    for (suffix, power) in BINARY {
        if let Some(digits) = q.strip_suffix(suffix) {
            return Some((digits, 1024u64.checked_pow(*power)?));
        }
    }
    for (suffix, power) in DECIMAL {
        if let Some(digits) = q.strip_suffix(suffix) {
            return Some((digits, 1000u64.checked_pow(*power)?));
        }
    }
    Some((q, 1))
}

/// Compare two quantities by their byte value.
pub fn compare(a: &str, b: &str) -> Result<std::cmp::Ordering> {
    Ok(parse_bytes(a)?.cmp(&parse_bytes(b)?))
}
