//! Evaluation context: immutable evaluation policy plus the swappable features/attributes
//! snapshot.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use serde_json::Value;
use url::Url;

use crate::{
    callbacks::{
        ExperimentRunCallback, ExperimentTracker, FeatureUsageCallback, Subscribers,
        TrackingCallback,
    },
    configuration_store::{ConfigurationStore, Snapshot},
    models::{Features, SavedGroups},
    sticky_bucket::StickyBucketService,
    ContextConfig, Error, Result,
};

pub(crate) struct Context {
    pub api_host: String,
    pub client_key: Option<String>,
    pub enabled: bool,
    pub qa_mode: bool,
    pub forced_variations: HashMap<String, usize>,
    pub forced_feature_values: HashMap<String, Value>,
    pub url: Option<Url>,
    pub allow_url_overrides: bool,
    pub tracking_callback: Box<dyn TrackingCallback + Send + Sync>,
    pub feature_usage_callback: Box<dyn FeatureUsageCallback + Send + Sync>,
    pub sticky_bucket_service: Option<Arc<dyn StickyBucketService>>,
    pub run_subscribers: Subscribers<dyn ExperimentRunCallback + Send + Sync>,
    pub tracker: ExperimentTracker,
    pub store: ConfigurationStore,
    destroyed: AtomicBool,
}

impl Context {
    pub fn new(config: ContextConfig) -> Result<Context> {
        let features = match &config.features_json {
            Some(json) => parse_features(json)?,
            None => Features::new(),
        };
        let saved_groups = match &config.saved_groups_json {
            Some(json) => parse_saved_groups(json)?,
            None => SavedGroups::new(),
        };
        let attributes = match &config.attributes_json {
            Some(json) => parse_attributes(json)?,
            None => Value::Object(Default::default()),
        };
        let url = config
            .url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|err| Error::Configuration(format!("invalid url: {err}")))?;

        Ok(Context {
            api_host: config.api_host,
            client_key: config.client_key,
            enabled: config.enabled,
            qa_mode: config.qa_mode,
            forced_variations: config.forced_variations,
            forced_feature_values: config.forced_feature_values,
            url,
            allow_url_overrides: config.allow_url_overrides,
            tracking_callback: config.tracking_callback,
            feature_usage_callback: config.feature_usage_callback,
            sticky_bucket_service: config.sticky_bucket_service,
            run_subscribers: Subscribers::new(),
            tracker: ExperimentTracker::default(),
            store: ConfigurationStore::new(Snapshot {
                features: features.into(),
                saved_groups: saved_groups.into(),
                attributes: attributes.into(),
            }),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Callbacks stay silent once the context is destroyed.
    pub fn callbacks_enabled(&self) -> bool {
        !self.destroyed.load(Ordering::Acquire)
    }

    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.run_subscribers.clear();
    }
}

/// Parse a features JSON object. Individual features and rules that fail to parse are kept as
/// raw JSON and never match.
pub(crate) fn parse_features(json: &str) -> Result<Features> {
    let features: Features = serde_json::from_str(json).inspect_err(|err| {
        log::warn!(target: "growthbook", error:display = err; "failed to parse features JSON");
    })?;
    Ok(features)
}

/// Parse a saved groups JSON object.
pub(crate) fn parse_saved_groups(json: &str) -> Result<SavedGroups> {
    let saved_groups: SavedGroups = serde_json::from_str(json).inspect_err(|err| {
        log::warn!(target: "growthbook", error:display = err; "failed to parse saved groups JSON");
    })?;
    Ok(saved_groups)
}

pub(crate) fn parse_attributes(json: &str) -> Result<Value> {
    let attributes: Value = serde_json::from_str(json).inspect_err(|err| {
        log::warn!(target: "growthbook", error:display = err; "failed to parse attributes JSON");
    })?;
    Ok(attributes)
}
