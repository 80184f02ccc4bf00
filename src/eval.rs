use serde_json::{json, Value};

use crate::{
    configuration_store::Snapshot,
    context::Context,
    hashing::{
        choose_variation, get_bucket_ranges, hash, hash_attribute_value, in_namespace,
        is_filtered_out, is_included_in_rollout, resolve_hash_attribute,
    },
    models::{
        Experiment, ExperimentResult, Feature, FeatureResult, FeatureResultSource, FeatureRule,
        HashVersion, ParentCondition, TryParse,
    },
    sticky_bucket::{
        assignment_key, load_assignments, save_assignment, sticky_variation, StickyBucketService,
        StickyUnit, StickyVariation,
    },
    url_overrides::{feature_override, variation_override},
};

/// A single evaluation against one snapshot.
///
/// The snapshot is captured once, so a concurrent update never affects an evaluation that has
/// already started.
pub(crate) struct Evaluation<'a> {
    context: &'a Context,
    snapshot: &'a Snapshot,
    /// Features currently being resolved, for prerequisite cycle detection.
    stack: Vec<String>,
}

enum Prerequisites {
    Met,
    Unmet,
    Blocked,
    Cyclic,
}

impl<'a> Evaluation<'a> {
    pub fn new(context: &'a Context, snapshot: &'a Snapshot) -> Evaluation<'a> {
        Evaluation {
            context,
            snapshot,
            stack: Vec::new(),
        }
    }

    pub fn eval_feature(&mut self, feature_key: &str) -> FeatureResult {
        if !self.context.enabled {
            return FeatureResult::new(Value::Null, FeatureResultSource::DefaultValue);
        }

        let result = self.resolve_feature(feature_key);

        log::trace!(target: "growthbook",
                    feature_key,
                    source:serde = result.source,
                    value:serde = result.value;
                    "evaluated a feature");

        if self.context.callbacks_enabled() {
            self.context
                .feature_usage_callback
                .on_feature_usage(feature_key, &result);
        }

        result
    }

    fn resolve_feature(&mut self, feature_key: &str) -> FeatureResult {
        let snapshot = self.snapshot;
        let Some(feature) = snapshot.features.get(feature_key) else {
            log::debug!(target: "growthbook", feature_key; "unknown feature");
            return FeatureResult::new(Value::Null, FeatureResultSource::UnknownFeature);
        };

        if self.stack.iter().any(|key| key == feature_key) {
            log::warn!(target: "growthbook", feature_key; "cyclic prerequisite");
            return FeatureResult::new(Value::Null, FeatureResultSource::CyclicPrerequisite);
        }

        if let Some(value) = self.context.forced_feature_values.get(feature_key) {
            return FeatureResult::new(value.clone(), FeatureResultSource::Force);
        }

        if self.context.allow_url_overrides {
            if let Some(value) = self
                .context
                .url
                .as_ref()
                .and_then(|url| feature_override(url, feature_key))
            {
                return FeatureResult::new(value, FeatureResultSource::UrlOverride);
            }
        }

        let TryParse::Parsed(feature) = feature else {
            log::warn!(target: "growthbook", feature_key; "feature definition failed to parse");
            return FeatureResult::new(Value::Null, FeatureResultSource::DefaultValue);
        };

        self.stack.push(feature_key.to_owned());
        let result = self.resolve_rules(feature_key, feature);
        self.stack.pop();
        result
    }

    fn resolve_rules(&mut self, feature_key: &str, feature: &Feature) -> FeatureResult {
        let snapshot = self.snapshot;
        let attributes = &*snapshot.attributes;

        for rule in feature
            .rules
            .iter()
            .filter_map(|rule| Option::<&FeatureRule>::from(rule))
        {
            if let Some(parents) = &rule.parent_conditions {
                match self.check_prerequisites(parents) {
                    Prerequisites::Met => {}
                    Prerequisites::Unmet => continue,
                    Prerequisites::Blocked => {
                        return FeatureResult::new(Value::Null, FeatureResultSource::Prerequisite)
                            .with_rule_id(rule.id.as_ref());
                    }
                    Prerequisites::Cyclic => {
                        return FeatureResult::new(
                            Value::Null,
                            FeatureResultSource::CyclicPrerequisite,
                        );
                    }
                }
            }

            if rule
                .filters
                .as_ref()
                .is_some_and(|filters| is_filtered_out(filters, attributes))
            {
                continue;
            }

            if rule
                .condition
                .as_ref()
                .is_some_and(|condition| !condition.matches(attributes, &snapshot.saved_groups))
            {
                continue;
            }

            match &rule.variations {
                None => {
                    let Some(force) = &rule.force else {
                        continue;
                    };

                    if let Some(namespace) = &rule.namespace {
                        let hash_value = hash_attribute_value(
                            attributes,
                            rule.hash_attribute.as_deref().unwrap_or("id"),
                        );
                        if hash_value.is_empty() || !in_namespace(&hash_value, namespace) {
                            continue;
                        }
                    }

                    let seed = rule.seed.as_deref().unwrap_or(feature_key);
                    if !is_included_in_rollout(
                        attributes,
                        seed,
                        rule.hash_attribute.as_deref(),
                        rule.range.as_ref(),
                        rule.coverage,
                        rule.hash_version,
                    ) {
                        continue;
                    }

                    return FeatureResult::new(force.clone(), FeatureResultSource::Force)
                        .with_rule_id(rule.id.as_ref());
                }
                Some(variations) => {
                    let experiment = rule.to_experiment(feature_key, variations);
                    let result = self.run_experiment(&experiment, Some(feature_key));
                    if result.in_experiment && !result.passthrough {
                        return FeatureResult {
                            experiment: Some(experiment),
                            experiment_result: Some(result.clone()),
                            ..FeatureResult::new(result.value, FeatureResultSource::Experiment)
                        }
                        .with_rule_id(rule.id.as_ref());
                    }
                }
            }
        }

        FeatureResult::new(
            feature.default_value.clone(),
            FeatureResultSource::DefaultValue,
        )
    }

    fn check_prerequisites(&mut self, parents: &[ParentCondition]) -> Prerequisites {
        for parent in parents {
            let parent_result = self.resolve_feature(&parent.id);
            if parent_result.source == FeatureResultSource::CyclicPrerequisite {
                return Prerequisites::Cyclic;
            }

            let evaluated = json!({ "value": parent_result.value });
            if !parent
                .condition
                .matches(&evaluated, &self.snapshot.saved_groups)
            {
                log::debug!(target: "growthbook", parent_key = parent.id.as_str(); "prerequisite not met");
                return if parent.gate == Some(true) {
                    Prerequisites::Blocked
                } else {
                    Prerequisites::Unmet
                };
            }
        }
        Prerequisites::Met
    }

    /// Run the bucketing pipeline for one experiment.
    pub fn run_experiment(
        &self,
        experiment: &Experiment,
        feature_id: Option<&str>,
    ) -> ExperimentResult {
        let context = self.context;
        let attributes = &*self.snapshot.attributes;
        let num_variations = experiment.variations.len();
        let sticky_service = context
            .sticky_bucket_service
            .as_deref()
            .filter(|_| experiment.disable_sticky_bucketing != Some(true));
        let (hash_attribute, hash_value) = resolve_hash_attribute(
            attributes,
            experiment.hash_attribute.as_deref().unwrap_or("id"),
            experiment
                .fallback_attribute
                .as_deref()
                .filter(|_| sticky_service.is_some()),
        );

        let result = |variation: Option<usize>, bucket: Option<f64>| {
            experiment_result(
                experiment,
                variation,
                hash_attribute,
                &hash_value,
                feature_id,
                bucket,
            )
        };

        if !context.enabled || num_variations < 2 {
            return result(None, None);
        }

        if let Some(index) = context
            .url
            .as_ref()
            .and_then(|url| variation_override(url, &experiment.key, num_variations))
        {
            return result(Some(index), None);
        }

        if let Some(index) = context.forced_variations.get(&experiment.key) {
            return result(Some(*index), None);
        }

        if experiment.active == Some(false) || hash_value.is_empty() {
            return result(None, None);
        }

        let bucket_version = experiment.bucket_version.unwrap_or(0);
        let sticky = match sticky_service {
            Some(service) => self.sticky_variation(service, experiment, bucket_version),
            None => StickyVariation::None,
        };
        let sticky_assigned = match sticky {
            StickyVariation::Found(index) => Some(index),
            StickyVariation::None | StickyVariation::Blocked => None,
        };

        // A stored assignment survives targeting changes.
        if sticky_assigned.is_none() {
            match &experiment.filters {
                Some(filters) if is_filtered_out(filters, attributes) => {
                    return result(None, None)
                }
                Some(_) => {}
                None => {
                    if let Some(namespace) = &experiment.namespace {
                        if !in_namespace(&hash_value, namespace) {
                            return result(None, None);
                        }
                    }
                }
            }

            if let Some(condition) = &experiment.condition {
                if !condition.matches(attributes, &self.snapshot.saved_groups) {
                    return result(None, None);
                }
            }
        }

        let seed = experiment.seed.as_deref().unwrap_or(&experiment.key);
        let bucket = hash(
            seed,
            &hash_value,
            experiment.hash_version.unwrap_or(HashVersion::V1),
        );
        let assigned = match (sticky_assigned, &experiment.ranges) {
            (Some(index), _) => Some(index),
            (None, Some(ranges)) => choose_variation(bucket, ranges),
            (None, None) => choose_variation(
                bucket,
                &get_bucket_ranges(
                    num_variations,
                    experiment.coverage.unwrap_or(1.0),
                    experiment.weights.as_deref(),
                ),
            ),
        };

        if sticky == StickyVariation::Blocked {
            log::debug!(target: "growthbook", experiment_key = experiment.key.as_str(); "sticky bucket version is blocked");
            return ExperimentResult {
                sticky_bucket_used: true,
                ..result(None, None)
            };
        }

        let Some(assigned) = assigned else {
            return result(None, None);
        };

        if let Some(index) = experiment.force {
            return result(Some(index), None);
        }

        if context.qa_mode {
            return result(None, None);
        }

        let mut assignment = result(Some(assigned), Some(bucket));
        assignment.hash_used = true;
        assignment.sticky_bucket_used = sticky_assigned.is_some();

        log::trace!(target: "growthbook",
                    experiment_key = experiment.key.as_str(),
                    variation_id = assignment.variation_id,
                    bucket;
                    "assigned experiment variation");

        if let Some(service) = sticky_service {
            save_assignment(
                service,
                hash_attribute,
                &hash_value,
                assignment_key(&experiment.key, bucket_version),
                &assignment.key,
            );
        }

        if context.callbacks_enabled()
            && context
                .tracker
                .track(&experiment.key, hash_attribute, &hash_value)
        {
            context.tracking_callback.on_track(experiment, &assignment);
        }

        assignment
    }

    /// Look up the unit's stored assignment for `experiment`, by its hash attribute and by its
    /// fallback attribute.
    fn sticky_variation(
        &self,
        service: &dyn StickyBucketService,
        experiment: &Experiment,
        bucket_version: u32,
    ) -> StickyVariation {
        let attributes = &*self.snapshot.attributes;
        let hash_attribute = experiment.hash_attribute.as_deref().unwrap_or("id");
        let hash_value = hash_attribute_value(attributes, hash_attribute);
        let fallback = experiment
            .fallback_attribute
            .as_deref()
            .map(|attribute| (attribute, hash_attribute_value(attributes, attribute)))
            .filter(|(_, value)| !value.is_empty());

        let assignments = load_assignments(
            service,
            &StickyUnit {
                hash_attribute,
                hash_value: &hash_value,
                fallback: fallback
                    .as_ref()
                    .map(|(attribute, value)| (*attribute, value.as_str())),
            },
        );
        let variation_keys: Vec<String> = (0..experiment.variations.len())
            .map(|index| variation_key(experiment, index))
            .collect();

        sticky_variation(
            &assignments,
            &experiment.key,
            bucket_version,
            experiment.min_bucket_version.unwrap_or(0),
            &variation_keys,
        )
    }
}

/// Meta key of a variation, or its stringified index.
fn variation_key(experiment: &Experiment, index: usize) -> String {
    experiment
        .meta
        .as_ref()
        .and_then(|meta| meta.get(index))
        .and_then(|meta| meta.key.clone())
        .unwrap_or_else(|| index.to_string())
}

/// An index outside the variations puts the unit out of the experiment with the first
/// variation's value.
fn experiment_result(
    experiment: &Experiment,
    variation: Option<usize>,
    hash_attribute: &str,
    hash_value: &str,
    feature_id: Option<&str>,
    bucket: Option<f64>,
) -> ExperimentResult {
    let (variation_id, in_experiment) = match variation {
        Some(index) if index < experiment.variations.len() => (index, true),
        _ => (0, false),
    };
    let meta = experiment
        .meta
        .as_ref()
        .and_then(|meta| meta.get(variation_id));

    ExperimentResult {
        value: experiment
            .variations
            .get(variation_id)
            .cloned()
            .unwrap_or(Value::Null),
        variation_id,
        in_experiment,
        hash_used: false,
        hash_attribute: hash_attribute.to_owned(),
        hash_value: hash_value.to_owned(),
        feature_id: feature_id.map(str::to_owned),
        key: variation_key(experiment, variation_id),
        name: meta.and_then(|meta| meta.name.clone()),
        bucket,
        passthrough: meta.and_then(|meta| meta.passthrough).unwrap_or(false),
        sticky_bucket_used: false,
    }
}

impl FeatureRule {
    fn to_experiment(&self, feature_key: &str, variations: &[Value]) -> Experiment {
        Experiment {
            key: self.key.clone().unwrap_or_else(|| feature_key.to_owned()),
            variations: variations.to_vec(),
            weights: self.weights.clone(),
            coverage: self.coverage,
            condition: self.condition.clone(),
            namespace: self.namespace.clone(),
            hash_attribute: self.hash_attribute.clone(),
            hash_version: self.hash_version,
            seed: self.seed.clone(),
            meta: self.meta.clone(),
            filters: self.filters.clone(),
            active: None,
            ranges: self.ranges.clone(),
            force: None,
            name: self.name.clone(),
            phase: self.phase.clone(),
            fallback_attribute: self.fallback_attribute.clone(),
            disable_sticky_bucketing: self.disable_sticky_bucketing,
            bucket_version: self.bucket_version,
            min_bucket_version: self.min_bucket_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, sync::Arc};

    use serde::Deserialize;
    use serde_json::{json, Value};

    use crate::{
        models::{FeatureResultSource, VariationMeta},
        Condition, ContextConfig, Experiment, GrowthBook, InMemoryStickyBucketService,
        StickyBucketService,
    };

    fn sticky_client(service: &Arc<InMemoryStickyBucketService>, attributes: &str) -> GrowthBook {
        ContextConfig::new()
            .attributes_json(attributes)
            .sticky_bucket_service(service.clone())
            .to_client()
            .unwrap()
    }

    /// Everyone lands in the first variation.
    fn experiment() -> Experiment {
        Experiment {
            weights: Some(vec![1.0, 0.0]),
            meta: Some(vec![
                VariationMeta {
                    key: Some("control".to_owned()),
                    ..VariationMeta::default()
                },
                VariationMeta {
                    key: Some("treatment".to_owned()),
                    ..VariationMeta::default()
                },
            ]),
            ..Experiment::new("checkout", vec![json!("old"), json!("new")])
        }
    }

    fn flipped(experiment: Experiment) -> Experiment {
        Experiment {
            weights: Some(vec![0.0, 1.0]),
            ..experiment
        }
    }

    #[test]
    fn sticky_assignment_survives_weight_changes() {
        let service = Arc::new(InMemoryStickyBucketService::new());
        let client = sticky_client(&service, r#"{"id": "u1"}"#);

        let first = client.run(&experiment());
        assert_eq!(first.key, "control");
        assert!(!first.sticky_bucket_used);
        assert_eq!(
            service.get_assignments("id", "u1").unwrap().assignments["checkout__0"],
            "control"
        );

        let second = client.run(&flipped(experiment()));
        assert!(second.in_experiment);
        assert_eq!(second.key, "control");
        assert!(second.sticky_bucket_used);

        // Without a service the new weights apply.
        let plain = ContextConfig::new()
            .attributes_json(r#"{"id": "u1"}"#)
            .to_client()
            .unwrap();
        assert_eq!(plain.run(&flipped(experiment())).key, "treatment");
    }

    #[test]
    fn sticky_assignment_survives_targeting_changes() {
        let service = Arc::new(InMemoryStickyBucketService::new());
        let client = sticky_client(&service, r#"{"id": "u1", "country": "US"}"#);
        let targeted = Experiment {
            condition: Some(Condition(json!({"country": "US"}))),
            ..experiment()
        };

        assert!(client.run(&targeted).in_experiment);
        client.set_attributes(r#"{"id": "u1", "country": "FR"}"#).unwrap();
        let result = client.run(&targeted);
        assert!(result.in_experiment);
        assert!(result.sticky_bucket_used);

        client.set_attributes(r#"{"id": "u2", "country": "FR"}"#).unwrap();
        assert!(!client.run(&targeted).in_experiment);
    }

    #[test]
    fn bucket_version_bump_rebuckets() {
        let service = Arc::new(InMemoryStickyBucketService::new());
        let client = sticky_client(&service, r#"{"id": "u1"}"#);
        assert_eq!(client.run(&experiment()).key, "control");

        let bumped = Experiment {
            bucket_version: Some(1),
            ..flipped(experiment())
        };
        let result = client.run(&bumped);
        assert_eq!(result.key, "treatment");
        assert!(!result.sticky_bucket_used);

        let assignments = service.get_assignments("id", "u1").unwrap().assignments;
        assert_eq!(assignments["checkout__0"], "control");
        assert_eq!(assignments["checkout__1"], "treatment");
    }

    #[test]
    fn min_bucket_version_excludes_earlier_assignments() {
        let service = Arc::new(InMemoryStickyBucketService::new());
        let client = sticky_client(&service, r#"{"id": "u1"}"#);
        client.run(&experiment());

        let result = client.run(&Experiment {
            bucket_version: Some(2),
            min_bucket_version: Some(1),
            ..experiment()
        });
        assert!(!result.in_experiment);
        assert!(result.sticky_bucket_used);

        // Units without an earlier assignment are bucketed normally.
        client.set_attributes(r#"{"id": "u2"}"#).unwrap();
        let fresh = client.run(&Experiment {
            bucket_version: Some(2),
            min_bucket_version: Some(1),
            ..experiment()
        });
        assert!(fresh.in_experiment);
        assert!(!fresh.sticky_bucket_used);
    }

    #[test]
    fn fallback_attribute_requires_sticky_bucketing() {
        let with_fallback = Experiment {
            fallback_attribute: Some("deviceId".to_owned()),
            ..experiment()
        };

        let service = Arc::new(InMemoryStickyBucketService::new());
        let client = sticky_client(&service, r#"{"deviceId": "d1"}"#);
        let result = client.run(&with_fallback);
        assert!(result.in_experiment);
        assert_eq!(result.hash_attribute, "deviceId");
        assert_eq!(result.hash_value, "d1");
        assert!(service.get_assignments("deviceId", "d1").is_some());

        // Once the unit logs in, the fallback document still applies.
        client.set_attributes(r#"{"id": "u1", "deviceId": "d1"}"#).unwrap();
        let result = client.run(&flipped(with_fallback.clone()));
        assert_eq!(result.key, "control");
        assert!(result.sticky_bucket_used);
        assert_eq!(result.hash_attribute, "id");

        let plain = ContextConfig::new()
            .attributes_json(r#"{"deviceId": "d1"}"#)
            .to_client()
            .unwrap();
        assert!(!plain.run(&with_fallback).in_experiment);
    }

    #[test]
    fn disabled_sticky_bucketing_stores_nothing() {
        let service = Arc::new(InMemoryStickyBucketService::new());
        let client = sticky_client(&service, r#"{"id": "u1"}"#);
        let result = client.run(&Experiment {
            disable_sticky_bucketing: Some(true),
            ..experiment()
        });
        assert!(result.in_experiment);
        assert!(service.get_assignments("id", "u1").is_none());
    }

    #[test]
    fn feature_rules_use_sticky_buckets() {
        let service = Arc::new(InMemoryStickyBucketService::new());
        let features = |weights: &str| {
            format!(
                r#"{{"checkout": {{"defaultValue": "none", "rules": [
                    {{"key": "checkout", "variations": ["old", "new"], "weights": {weights},
                      "meta": [{{"key": "control"}}, {{"key": "treatment"}}]}}
                ]}}}}"#
            )
        };
        let client = ContextConfig::new()
            .features_json(features("[1, 0]"))
            .attributes_json(r#"{"id": "u1"}"#)
            .sticky_bucket_service(service.clone())
            .to_client()
            .unwrap();
        assert_eq!(client.get_string_value("checkout", "?"), "old");

        client.set_features(&features("[0, 1]")).unwrap();
        let result = client.eval_feature("checkout");
        assert_eq!(result.value, json!("old"));
        assert!(result.experiment_result.unwrap().sticky_bucket_used);
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct TestCase {
        name: String,
        feature: String,
        attributes: Value,
        value: Value,
        source: FeatureResultSource,
        variation_id: Option<usize>,
        rule_id: Option<String>,
    }

    #[test]
    fn evaluation_test_data() {
        let features = std::fs::read_to_string("tests/data/features.json").unwrap();
        let cases: Vec<TestCase> =
            serde_json::from_reader(File::open("tests/data/feature-cases.json").unwrap()).unwrap();

        let client = ContextConfig::new()
            .features_json(features)
            .to_client()
            .unwrap();

        for case in cases {
            print!("test case {:?} ... ", case.name);
            client.set_attributes_value(case.attributes);

            let result = client.eval_feature(&case.feature);

            assert_eq!(result.value, case.value, "{}", case.name);
            assert_eq!(result.source, case.source, "{}", case.name);
            if let Some(variation_id) = case.variation_id {
                let experiment_result = result.experiment_result.as_ref().unwrap();
                assert_eq!(experiment_result.variation_id, variation_id, "{}", case.name);
                assert!(experiment_result.in_experiment);
                assert!(experiment_result.hash_used);
            }
            if case.rule_id.is_some() {
                assert_eq!(result.rule_id, case.rule_id, "{}", case.name);
            }
            println!("ok");
        }
    }
}
