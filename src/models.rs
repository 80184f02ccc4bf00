//! Wire model of features, experiments and evaluation results.
use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::condition::evaluate_condition_with_saved_groups;

/// All features known to a context, keyed by feature key.
pub type Features = HashMap<String, TryParse<Feature>>;

/// Saved groups keyed by group id. Each group is expected to be an array of values.
pub type SavedGroups = HashMap<String, Value>;

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed value.
    Parsed(T),
    /// Raw JSON that could not be parsed into `T`.
    ParseFailed(Value),
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &TryParse<T>) -> Option<&T> {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// Hashing algorithm used for bucketing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum HashVersion {
    /// `fnv1a32(value + seed) % 1000 / 1000`.
    V1,
    /// `fnv1a32(fnv1a32(seed + value)) % 10000 / 10000`.
    V2,
}

impl TryFrom<u8> for HashVersion {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(HashVersion::V1),
            2 => Ok(HashVersion::V2),
            other => Err(format!("unsupported hash version: {other}")),
        }
    }
}

impl From<HashVersion> for u8 {
    fn from(value: HashVersion) -> u8 {
        match value {
            HashVersion::V1 => 1,
            HashVersion::V2 => 2,
        }
    }
}

/// A JSON targeting condition. See [`evaluate_condition`](crate::evaluate_condition) for the
/// supported syntax.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From)]
#[serde(transparent)]
pub struct Condition(pub Value);

impl Condition {
    /// Returns `true` if `attributes` satisfy the condition. `saved_groups` resolve `$inGroup`
    /// and `$notInGroup`.
    pub fn matches(&self, attributes: &Value, saved_groups: &SavedGroups) -> bool {
        evaluate_condition_with_saved_groups(attributes, &self.0, saved_groups)
    }
}

/// A half-open interval `[min, max)` of the normalized hash space.
///
/// Serialized as a two-element array `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct BucketRange {
    #[allow(missing_docs)]
    pub min: f64,
    #[allow(missing_docs)]
    pub max: f64,
}

impl BucketRange {
    /// Returns `true` if `n` lies in `[min, max)`.
    pub fn contains(&self, n: f64) -> bool {
        self.min <= n && n < self.max
    }
}

impl From<(f64, f64)> for BucketRange {
    fn from((min, max): (f64, f64)) -> Self {
        BucketRange { min, max }
    }
}

impl From<BucketRange> for (f64, f64) {
    fn from(range: BucketRange) -> Self {
        (range.min, range.max)
    }
}

/// A named sub-region `[start, end)` of a namespace-scoped hash space.
///
/// Serialized as `[id, start, end]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(String, f64, f64)", into = "(String, f64, f64)")]
pub struct Namespace {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub start: f64,
    #[allow(missing_docs)]
    pub end: f64,
}

impl From<(String, f64, f64)> for Namespace {
    fn from((id, start, end): (String, f64, f64)) -> Self {
        Namespace { id, start, end }
    }
}

impl From<Namespace> for (String, f64, f64) {
    fn from(namespace: Namespace) -> Self {
        (namespace.id, namespace.start, namespace.end)
    }
}

/// Carves a slice of an attribute's hash space, used to keep unrelated experiments disjoint.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    /// Seed for the filter-specific hash.
    #[serde(default)]
    pub seed: String,
    /// Hash ranges that admit the unit.
    pub ranges: Vec<BucketRange>,
    /// Attribute to hash. Defaults to `"id"`.
    #[serde(alias = "hashAttribute")]
    pub attribute: Option<String>,
    /// Defaults to [`HashVersion::V2`].
    pub hash_version: Option<HashVersion>,
}

/// Display metadata for one variation.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariationMeta {
    /// Stable variation key reported in [`ExperimentResult::key`].
    pub key: Option<String>,
    #[allow(missing_docs)]
    pub name: Option<String>,
    /// A passthrough variation is tracked but does not override the feature value.
    pub passthrough: Option<bool>,
}

/// A prerequisite on another feature's value.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentCondition {
    /// Key of the parent feature.
    pub id: String,
    /// Condition evaluated against `{"value": <parent value>}`.
    pub condition: Condition,
    /// A gated prerequisite blocks the whole feature instead of skipping the rule.
    pub gate: Option<bool>,
}

/// A named flag with a default value and ordered targeting rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    /// Value served when no rule applies.
    #[serde(default)]
    pub default_value: Value,
    /// Rules in evaluation order. A rule that fails to parse never matches.
    #[serde(default)]
    pub rules: Vec<TryParse<FeatureRule>>,
}

/// One targeting rule of a [`Feature`].
///
/// A rule without `variations` is a force rule; otherwise it is an experiment rule.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRule {
    #[allow(missing_docs)]
    pub id: Option<String>,
    #[allow(missing_docs)]
    pub condition: Option<Condition>,
    #[allow(missing_docs)]
    pub parent_conditions: Option<Vec<ParentCondition>>,
    /// Value served by a force rule. `Some(Value::Null)` forces `null`.
    #[serde(default, deserialize_with = "deserialize_present")]
    pub force: Option<Value>,
    #[allow(missing_docs)]
    pub variations: Option<Vec<Value>>,
    #[allow(missing_docs)]
    pub weights: Option<Vec<f64>>,
    #[allow(missing_docs)]
    pub coverage: Option<f64>,
    /// Experiment key. Defaults to the feature key.
    pub key: Option<String>,
    #[allow(missing_docs)]
    pub hash_attribute: Option<String>,
    #[allow(missing_docs)]
    pub hash_version: Option<HashVersion>,
    #[allow(missing_docs)]
    pub seed: Option<String>,
    #[allow(missing_docs)]
    pub namespace: Option<Namespace>,
    #[allow(missing_docs)]
    pub filters: Option<Vec<Filter>>,
    #[allow(missing_docs)]
    pub meta: Option<Vec<VariationMeta>>,
    /// Explicit rollout range for force rules.
    pub range: Option<BucketRange>,
    /// Explicit bucket ranges for experiment rules.
    pub ranges: Option<Vec<BucketRange>>,
    #[allow(missing_docs)]
    pub name: Option<String>,
    #[allow(missing_docs)]
    pub phase: Option<String>,
    /// Attribute hashed when `hash_attribute` is empty, if sticky bucketing is enabled.
    pub fallback_attribute: Option<String>,
    #[allow(missing_docs)]
    pub disable_sticky_bucketing: Option<bool>,
    /// Version of the sticky assignment. Bumping it re-buckets every unit.
    pub bucket_version: Option<u32>,
    /// Units with a sticky assignment older than this version are excluded.
    pub min_bucket_version: Option<u32>,
}

/// Distinguishes an explicit `null` from an absent field.
fn deserialize_present<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// A randomized assignment with multiple variations.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    #[allow(missing_docs)]
    pub key: String,
    #[allow(missing_docs)]
    pub variations: Vec<Value>,
    #[allow(missing_docs)]
    pub weights: Option<Vec<f64>>,
    #[allow(missing_docs)]
    pub coverage: Option<f64>,
    #[allow(missing_docs)]
    pub condition: Option<Condition>,
    #[allow(missing_docs)]
    pub namespace: Option<Namespace>,
    #[allow(missing_docs)]
    pub hash_attribute: Option<String>,
    #[allow(missing_docs)]
    pub hash_version: Option<HashVersion>,
    #[allow(missing_docs)]
    pub seed: Option<String>,
    #[allow(missing_docs)]
    pub meta: Option<Vec<VariationMeta>>,
    #[allow(missing_docs)]
    pub filters: Option<Vec<Filter>>,
    /// Inactive experiments always serve the first variation without tracking.
    pub active: Option<bool>,
    /// Explicit bucket ranges overriding `weights` and `coverage`.
    pub ranges: Option<Vec<BucketRange>>,
    /// Variation index forced by the configuration.
    pub force: Option<usize>,
    #[allow(missing_docs)]
    pub name: Option<String>,
    #[allow(missing_docs)]
    pub phase: Option<String>,
    /// Attribute hashed when `hash_attribute` is empty, if sticky bucketing is enabled.
    pub fallback_attribute: Option<String>,
    #[allow(missing_docs)]
    pub disable_sticky_bucketing: Option<bool>,
    /// Version of the sticky assignment. Bumping it re-buckets every unit.
    pub bucket_version: Option<u32>,
    /// Units with a sticky assignment older than this version are excluded.
    pub min_bucket_version: Option<u32>,
}

impl Experiment {
    /// Create an experiment with the given key and variations and default bucketing policy.
    pub fn new(key: impl Into<String>, variations: Vec<Value>) -> Experiment {
        Experiment {
            key: key.into(),
            variations,
            ..Experiment::default()
        }
    }
}

/// Outcome of running an [`Experiment`] for the current attributes.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentResult {
    /// Value of the assigned variation.
    pub value: Value,
    /// Index of the assigned variation.
    pub variation_id: usize,
    /// Whether the unit was bucketed into the experiment.
    pub in_experiment: bool,
    /// Whether a hash was computed for this result.
    #[serde(default)]
    pub hash_used: bool,
    /// Attribute used for hashing.
    pub hash_attribute: String,
    /// Value of the hash attribute.
    pub hash_value: String,
    /// Feature the experiment was evaluated for, if any.
    pub feature_id: Option<String>,
    /// Variation meta key, or the stringified variation index.
    pub key: String,
    /// Variation display name.
    pub name: Option<String>,
    /// Hash bucket in `[0, 1)`.
    pub bucket: Option<f64>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub passthrough: bool,
    /// Whether the assignment came from, or was blocked by, a stored sticky bucket.
    #[serde(default)]
    pub sticky_bucket_used: bool,
}

/// Where a [`FeatureResult`] value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeatureResultSource {
    /// The feature key is not defined.
    UnknownFeature,
    /// No rule applied (or the SDK is disabled).
    DefaultValue,
    /// A force rule or a forced feature value applied.
    Force,
    /// An experiment rule assigned the unit.
    Experiment,
    /// A `gb~<key>` URL query parameter applied.
    UrlOverride,
    /// A gated prerequisite failed.
    Prerequisite,
    /// Prerequisites form a cycle.
    CyclicPrerequisite,
}

/// Outcome of evaluating a feature.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureResult {
    /// Assigned value.
    pub value: Value,
    #[allow(missing_docs)]
    pub source: FeatureResultSource,
    /// Truthiness of `value`.
    pub on: bool,
    /// Negation of `on`.
    pub off: bool,
    /// Experiment that produced the value, for [`FeatureResultSource::Experiment`].
    pub experiment: Option<Experiment>,
    #[allow(missing_docs)]
    pub experiment_result: Option<ExperimentResult>,
    /// Id of the rule that produced the value.
    pub rule_id: Option<String>,
}

impl FeatureResult {
    pub(crate) fn new(value: Value, source: FeatureResultSource) -> FeatureResult {
        let on = is_truthy(&value);
        FeatureResult {
            value,
            source,
            on,
            off: !on,
            experiment: None,
            experiment_result: None,
            rule_id: None,
        }
    }

    pub(crate) fn with_rule_id(mut self, rule_id: Option<&String>) -> FeatureResult {
        self.rule_id = rule_id.cloned();
        self
    }
}

/// `null`, `false`, `0` and `""` are falsy. Everything else, including empty arrays and objects,
/// is truthy.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        BucketRange, Experiment, Feature, FeatureResult, FeatureResultSource, FeatureRule, Filter,
        HashVersion, Namespace, TryParse,
    };

    #[test]
    fn bucket_range_is_a_tuple_on_the_wire() {
        let range: BucketRange = serde_json::from_value(json!([0.25, 0.5])).unwrap();
        assert_eq!(range, BucketRange { min: 0.25, max: 0.5 });
        assert_eq!(serde_json::to_value(range).unwrap(), json!([0.25, 0.5]));
    }

    #[test]
    fn namespace_round_trips() {
        let ns = Namespace {
            id: "pricing".into(),
            start: 0.0,
            end: 0.4,
        };
        let json = serde_json::to_string(&ns).unwrap();
        assert_eq!(json, r#"["pricing",0.0,0.4]"#);
        assert_eq!(serde_json::from_str::<Namespace>(&json).unwrap(), ns);
    }

    #[test]
    fn filter_accepts_both_attribute_spellings() {
        let a: Filter = serde_json::from_value(json!({
            "seed": "s", "ranges": [[0, 0.5]], "attribute": "deviceId", "hashVersion": 2
        }))
        .unwrap();
        let b: Filter = serde_json::from_value(json!({
            "seed": "s", "ranges": [[0, 0.5]], "hashAttribute": "deviceId", "hashVersion": 2
        }))
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hash_version, Some(HashVersion::V2));

        let round_trip: Filter =
            serde_json::from_str(&serde_json::to_string(&a).unwrap()).unwrap();
        assert_eq!(round_trip, a);
    }

    #[test]
    fn feature_round_trips_including_unparsable_rules() {
        let feature: Feature = serde_json::from_value(json!({
            "defaultValue": {"color": "blue"},
            "rules": [
                {"id": "r1", "condition": {"country": "US"}, "force": null},
                {"hashVersion": 7, "variations": [1, 2]},
                {"key": "exp", "variations": ["a", "b"], "weights": [0.5, 0.5],
                 "namespace": ["ns", 0, 0.5], "meta": [{"key": "control"}, {"key": "treatment"}]}
            ]
        }))
        .unwrap();

        assert!(matches!(
            &feature.rules[0],
            TryParse::Parsed(FeatureRule { force: Some(serde_json::Value::Null), .. })
        ));
        assert!(matches!(&feature.rules[1], TryParse::ParseFailed(_)));

        let json = serde_json::to_string(&feature).unwrap();
        assert_eq!(serde_json::from_str::<Feature>(&json).unwrap(), feature);
    }

    #[test]
    fn absent_force_is_not_null_force() {
        let rule: FeatureRule = serde_json::from_value(json!({"id": "r"})).unwrap();
        assert_eq!(rule.force, None);
        assert_eq!(serde_json::to_value(&rule).unwrap(), json!({"id": "r"}));
    }

    #[test]
    fn experiment_round_trips() {
        let experiment = Experiment {
            weights: Some(vec![0.1, 0.9]),
            coverage: Some(0.5),
            hash_version: Some(HashVersion::V2),
            active: Some(false),
            ..Experiment::new("checkout", vec![json!(false), json!(true)])
        };
        let json = serde_json::to_string(&experiment).unwrap();
        assert_eq!(serde_json::from_str::<Experiment>(&json).unwrap(), experiment);
    }

    #[test]
    fn reads_sticky_bucketing_fields() {
        let rule: FeatureRule = serde_json::from_value(json!({
            "key": "exp",
            "variations": [0, 1],
            "hashAttribute": "id",
            "fallbackAttribute": "deviceId",
            "bucketVersion": 2,
            "minBucketVersion": 1,
            "disableStickyBucketing": false
        }))
        .unwrap();
        assert_eq!(rule.fallback_attribute.as_deref(), Some("deviceId"));
        assert_eq!(rule.bucket_version, Some(2));
        assert_eq!(rule.min_bucket_version, Some(1));
        assert_eq!(rule.disable_sticky_bucketing, Some(false));
    }

    #[test]
    fn unsupported_hash_version_fails_to_parse() {
        assert!(serde_json::from_value::<HashVersion>(json!(3)).is_err());
        assert_eq!(
            serde_json::from_value::<HashVersion>(json!(1)).unwrap(),
            HashVersion::V1
        );
    }

    #[test]
    fn feature_result_truthiness() {
        for (value, on) in [
            (json!(null), false),
            (json!(false), false),
            (json!(0), false),
            (json!(0.0), false),
            (json!(""), false),
            (json!(true), true),
            (json!(-1), true),
            (json!("off"), true),
            (json!([]), true),
            (json!({}), true),
        ] {
            let result = FeatureResult::new(value.clone(), FeatureResultSource::Force);
            assert_eq!(result.on, on, "{value}");
            assert_eq!(result.off, !on, "{value}");
        }
    }

    #[test]
    fn feature_result_source_is_camel_case() {
        assert_eq!(
            serde_json::to_value(FeatureResultSource::UnknownFeature).unwrap(),
            json!("unknownFeature")
        );
        assert_eq!(
            serde_json::to_value(FeatureResultSource::UrlOverride).unwrap(),
            json!("urlOverride")
        );
    }
}
