use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    callbacks::ExperimentRunCallback,
    condition::evaluate_condition_with_saved_groups,
    configuration_store::Snapshot,
    context::{parse_attributes, parse_features, parse_saved_groups, Context},
    decryption::decrypt,
    eval::Evaluation,
    models::{
        Experiment, ExperimentResult, FeatureResult, FeatureResultSource, Features, SavedGroups,
    },
    ContextConfig, Result,
};

/// A client evaluating features and experiments.
///
/// In order to create a client instance, first create [`ContextConfig`].
///
/// `GrowthBook` is `Send + Sync`; share it between threads with an `Arc`. Every evaluation reads
/// the latest features and attributes published with [`GrowthBook::set_features`] and
/// [`GrowthBook::set_attributes`].
///
/// # Examples
/// ```
/// # use growthbook::{ContextConfig, GrowthBook};
/// let client = GrowthBook::new(ContextConfig::new()).unwrap();
/// assert!(client.is_off("unknown-feature"));
/// ```
pub struct GrowthBook {
    context: Context,
}

impl GrowthBook {
    /// Create a new `GrowthBook` client using the specified configuration.
    ///
    /// # Errors
    ///
    /// See [`ContextConfig::to_client`].
    pub fn new(config: ContextConfig) -> Result<Self> {
        Ok(GrowthBook {
            context: Context::new(config)?,
        })
    }

    /// Evaluate a feature for the current attributes.
    ///
    /// Never fails: unknown features resolve to [`FeatureResultSource::UnknownFeature`] and
    /// malformed rules are skipped.
    pub fn eval_feature(&self, feature_key: &str) -> FeatureResult {
        let snapshot = self.context.store.get_snapshot();
        Evaluation::new(&self.context, &snapshot).eval_feature(feature_key)
    }

    /// Returns `true` if the feature value is truthy.
    pub fn is_on(&self, feature_key: &str) -> bool {
        self.eval_feature(feature_key).on
    }

    /// Returns `true` if the feature value is falsy.
    pub fn is_off(&self, feature_key: &str) -> bool {
        self.eval_feature(feature_key).off
    }

    /// Get the feature value decoded as `T`, or `default_value` if the feature is unknown,
    /// `null`, or of another type.
    ///
    /// ```
    /// # use growthbook::ContextConfig;
    /// let client = ContextConfig::new()
    ///     .features_json(r#"{"limits": {"defaultValue": {"max": 3}}}"#)
    ///     .to_client()
    ///     .unwrap();
    ///
    /// #[derive(serde::Deserialize, Debug, PartialEq)]
    /// struct Limits { max: u32 }
    ///
    /// assert_eq!(client.get_feature_value("limits", Limits { max: 1 }), Limits { max: 3 });
    /// assert_eq!(client.get_feature_value("limits", 7), 7);
    /// ```
    pub fn get_feature_value<T: DeserializeOwned>(
        &self,
        feature_key: &str,
        default_value: T,
    ) -> T {
        let result = self.eval_feature(feature_key);
        if result.source == FeatureResultSource::UnknownFeature || result.value.is_null() {
            return default_value;
        }

        match serde_json::from_value(result.value) {
            Ok(value) => value,
            Err(err) => {
                log::warn!(target: "growthbook",
                           feature_key,
                           error:display = err;
                           "feature value has unexpected type, using default");
                default_value
            }
        }
    }

    #[allow(missing_docs)]
    pub fn get_boolean_value(&self, feature_key: &str, default_value: bool) -> bool {
        self.get_feature_value(feature_key, default_value)
    }

    #[allow(missing_docs)]
    pub fn get_string_value(&self, feature_key: &str, default_value: impl Into<String>) -> String {
        self.get_feature_value(feature_key, default_value.into())
    }

    #[allow(missing_docs)]
    pub fn get_numeric_value(&self, feature_key: &str, default_value: f64) -> f64 {
        self.get_feature_value(feature_key, default_value)
    }

    /// Integer variant of [`GrowthBook::get_feature_value`]. Fractional numbers fall back to
    /// `default_value`.
    pub fn get_integer_value(&self, feature_key: &str, default_value: i64) -> i64 {
        self.get_feature_value(feature_key, default_value)
    }

    #[allow(missing_docs)]
    pub fn get_json_value(&self, feature_key: &str, default_value: Value) -> Value {
        self.get_feature_value(feature_key, default_value)
    }

    /// Run a standalone experiment for the current attributes and notify
    /// [subscribers](GrowthBook::subscribe).
    pub fn run(&self, experiment: &Experiment) -> ExperimentResult {
        let snapshot = self.context.store.get_snapshot();
        let result = Evaluation::new(&self.context, &snapshot).run_experiment(experiment, None);

        if self.context.callbacks_enabled() {
            for subscriber in self.context.run_subscribers.snapshot() {
                subscriber.on_run(experiment, &result);
            }
        }

        result
    }

    /// Register a callback notified of every [`GrowthBook::run`].
    pub fn subscribe(&self, callback: impl ExperimentRunCallback + Send + Sync + 'static) {
        self.context.run_subscribers.add(Arc::new(callback));
    }

    /// Replace all features.
    ///
    /// `features_json` is an object mapping feature keys to definitions, as delivered by
    /// [`FeaturesRepository`](crate::FeaturesRepository).
    ///
    /// # Errors
    ///
    /// [`Error::Parse`](crate::Error::Parse) if the JSON is malformed. Current features are kept.
    pub fn set_features(&self, features_json: &str) -> Result<()> {
        let features = parse_features(features_json)?;
        self.set_features_value(features);
        Ok(())
    }

    /// Replace all features with already parsed definitions.
    pub fn set_features_value(&self, features: Features) {
        log::debug!(target: "growthbook", count = features.len(); "replacing features");
        self.context.store.set_features(features);
    }

    /// Decrypt an `encryptedFeatures` payload with a base64-encoded AES key and replace all
    /// features with the result.
    ///
    /// # Errors
    ///
    /// - [`Error::Decryption`](crate::Error::Decryption) if the key does not decrypt the payload.
    /// - [`Error::Parse`](crate::Error::Parse) if the decrypted JSON is malformed.
    ///
    /// Current features are kept on error.
    pub fn set_encrypted_features(
        &self,
        encrypted_features: &str,
        decryption_key: &str,
    ) -> Result<()> {
        let features_json = decrypt(encrypted_features, decryption_key)?;
        self.set_features(&features_json)
    }

    /// Replace saved groups, an object mapping group ids to arrays of values.
    ///
    /// # Errors
    ///
    /// [`Error::Parse`](crate::Error::Parse) if the JSON is malformed. Current saved groups are
    /// kept.
    pub fn set_saved_groups(&self, saved_groups_json: &str) -> Result<()> {
        let saved_groups = parse_saved_groups(saved_groups_json)?;
        self.set_saved_groups_value(saved_groups);
        Ok(())
    }

    /// Replace saved groups with already parsed groups.
    pub fn set_saved_groups_value(&self, saved_groups: SavedGroups) {
        log::debug!(target: "growthbook", count = saved_groups.len(); "replacing saved groups");
        self.context.store.set_saved_groups(saved_groups);
    }

    /// Replace attributes.
    ///
    /// # Errors
    ///
    /// [`Error::Parse`](crate::Error::Parse) if the JSON is malformed. Current attributes are
    /// kept.
    pub fn set_attributes(&self, attributes_json: &str) -> Result<()> {
        let attributes = parse_attributes(attributes_json)?;
        self.set_attributes_value(attributes);
        Ok(())
    }

    /// Replace attributes with an already parsed document.
    pub fn set_attributes_value(&self, attributes: Value) {
        self.context.store.set_attributes(attributes);
    }

    /// Features, saved groups and attributes currently in use.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.context.store.get_snapshot()
    }

    /// Evaluate a condition against attributes, both given as JSON. Group operators resolve
    /// against the current saved groups.
    ///
    /// Malformed JSON does not match.
    ///
    /// ```
    /// # use growthbook::ContextConfig;
    /// let client = ContextConfig::new().to_client().unwrap();
    /// assert!(client.evaluate_condition(r#"{"age": 21}"#, r#"{"age": {"$gte": 18}}"#));
    /// assert!(!client.evaluate_condition("{", r#"{"age": {"$gte": 18}}"#));
    /// ```
    pub fn evaluate_condition(&self, attributes_json: &str, condition_json: &str) -> bool {
        let parsed = serde_json::from_str::<Value>(attributes_json).and_then(|attributes| {
            Ok((attributes, serde_json::from_str::<Value>(condition_json)?))
        });
        match parsed {
            Ok((attributes, condition)) => {
                let snapshot = self.context.store.get_snapshot();
                evaluate_condition_with_saved_groups(
                    &attributes,
                    &condition,
                    &snapshot.saved_groups,
                )
            }
            Err(err) => {
                log::warn!(target: "growthbook", error:display = err; "cannot evaluate malformed condition");
                false
            }
        }
    }

    /// Host configured in [`ContextConfig::api_host`].
    pub fn api_host(&self) -> &str {
        &self.context.api_host
    }

    /// Client key configured in [`ContextConfig::client_key`].
    pub fn client_key(&self) -> Option<&str> {
        self.context.client_key.as_deref()
    }

    /// Silence all callbacks and drop experiment-run subscribers.
    ///
    /// Safe to call concurrently with evaluations. Evaluation keeps working afterwards.
    pub fn destroy(&self) {
        log::debug!(target: "growthbook", "destroying client");
        self.context.destroy();
    }
}
