//! Deterministic hashing of units into `[0, 1)` and partitioning of the hash space.
//!
//! The algorithms must agree bit-for-bit with every other SDK evaluating the same configuration,
//! so the constants here are fixed.
use serde_json::Value;

use crate::{
    condition::get_path,
    models::{BucketRange, Filter, HashVersion, Namespace},
};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a.
pub fn fnv1a_32(data: impl AsRef<[u8]>) -> u32 {
    data.as_ref().iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Hash `value` under `seed` into `[0, 1)`.
///
/// ```
/// # use growthbook::{hash, HashVersion};
/// assert_eq!(hash("", "a", HashVersion::V1), 0.22);
/// assert_eq!(hash("", "a", HashVersion::V2), 0.0216);
/// ```
pub fn hash(seed: &str, value: &str, version: HashVersion) -> f64 {
    match version {
        HashVersion::V1 => {
            let n = fnv1a_32(format!("{value}{seed}"));
            f64::from(n % 1000) / 1000.0
        }
        HashVersion::V2 => {
            let first = fnv1a_32(format!("{seed}{value}"));
            let n = fnv1a_32(first.to_string());
            f64::from(n % 10000) / 10000.0
        }
    }
}

/// `n` equal weights summing to 1.
pub fn get_equal_weights(num_variations: usize) -> Vec<f64> {
    if num_variations == 0 {
        return Vec::new();
    }
    vec![1.0 / num_variations as f64; num_variations]
}

/// Lay out one range per variation, contiguously from 0, each `weight × coverage` wide.
///
/// `coverage` is clamped to `[0, 1]`. Weights are replaced by equal weights if they are missing,
/// do not match `num_variations`, or do not sum to 1 (±0.01).
///
/// ```
/// # use growthbook::{get_bucket_ranges, BucketRange};
/// let ranges = get_bucket_ranges(2, 0.5, Some(&[0.4, 0.6]));
/// assert_eq!(ranges, vec![
///     BucketRange { min: 0.0, max: 0.2 },
///     BucketRange { min: 0.2, max: 0.5 },
/// ]);
/// ```
pub fn get_bucket_ranges(
    num_variations: usize,
    coverage: f64,
    weights: Option<&[f64]>,
) -> Vec<BucketRange> {
    let coverage = coverage.clamp(0.0, 1.0);

    let weights = match weights {
        Some(weights) if weights.len() == num_variations => {
            let total: f64 = weights.iter().sum();
            if (0.99..=1.01).contains(&total) {
                weights.to_vec()
            } else {
                log::debug!(target: "growthbook", total; "weights do not sum to 1, using equal weights");
                get_equal_weights(num_variations)
            }
        }
        Some(_) => {
            log::debug!(target: "growthbook", num_variations; "weights do not match variations, using equal weights");
            get_equal_weights(num_variations)
        }
        None => get_equal_weights(num_variations),
    };

    let mut cumulative = 0.0;
    weights
        .into_iter()
        .map(|weight| {
            let min = cumulative;
            cumulative += weight * coverage;
            BucketRange {
                min,
                max: cumulative,
            }
        })
        .collect()
}

/// Index of the first range containing `n`.
pub fn choose_variation(n: f64, ranges: &[BucketRange]) -> Option<usize> {
    ranges.iter().position(|range| range.contains(n))
}

/// Returns `true` if the unit identified by `hash_value` falls inside the namespace slice.
pub fn in_namespace(hash_value: &str, namespace: &Namespace) -> bool {
    let n = hash(
        &format!("__{}", namespace.id),
        hash_value,
        HashVersion::V1,
    );
    namespace.start <= n && n < namespace.end
}

/// Stringified attribute used for hashing. Missing, `null` and structured values hash as empty,
/// which callers treat as "cannot be bucketed".
pub(crate) fn hash_attribute_value(attributes: &Value, attribute: &str) -> String {
    match get_path(attributes, attribute) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => match n.as_f64() {
            // Integral floats print without a fraction, so `1.0` hashes like `1`.
            Some(f) if n.is_f64() && f.fract() == 0.0 => format!("{f}"),
            _ => n.to_string(),
        },
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Attribute and stringified value identifying an experiment unit. `fallback` is hashed instead
/// when the primary attribute is empty.
pub(crate) fn resolve_hash_attribute<'a>(
    attributes: &Value,
    hash_attribute: &'a str,
    fallback: Option<&'a str>,
) -> (&'a str, String) {
    let hash_value = hash_attribute_value(attributes, hash_attribute);
    if hash_value.is_empty() {
        if let Some(fallback) = fallback {
            let fallback_value = hash_attribute_value(attributes, fallback);
            if !fallback_value.is_empty() {
                return (fallback, fallback_value);
            }
        }
    }
    (hash_attribute, hash_value)
}

/// Returns `true` if any filter excludes the unit.
pub fn is_filtered_out(filters: &[Filter], attributes: &Value) -> bool {
    filters.iter().any(|filter| {
        let attribute = filter.attribute.as_deref().unwrap_or("id");
        let hash_value = hash_attribute_value(attributes, attribute);
        if hash_value.is_empty() {
            return true;
        }

        let n = hash(
            &filter.seed,
            &hash_value,
            filter.hash_version.unwrap_or(HashVersion::V2),
        );
        !filter.ranges.iter().any(|range| range.contains(n))
    })
}

/// Rollout check for force rules.
///
/// Without `range` and `coverage` every unit is included. Otherwise the unit needs a non-empty
/// hash attribute and must fall inside `range`, or at or below `coverage`.
pub fn is_included_in_rollout(
    attributes: &Value,
    seed: &str,
    hash_attribute: Option<&str>,
    range: Option<&BucketRange>,
    coverage: Option<f64>,
    hash_version: Option<HashVersion>,
) -> bool {
    if range.is_none() && coverage.is_none() {
        return true;
    }
    if range.is_none() && coverage == Some(0.0) {
        return false;
    }

    let hash_value = hash_attribute_value(attributes, hash_attribute.unwrap_or("id"));
    if hash_value.is_empty() {
        return false;
    }

    let n = hash(seed, &hash_value, hash_version.unwrap_or(HashVersion::V1));
    match (range, coverage) {
        (Some(range), _) => range.contains(n),
        (None, Some(coverage)) => n <= coverage,
        (None, None) => true,
    }
}
