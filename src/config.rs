use std::{collections::HashMap, sync::Arc, time::Duration};

use serde_json::Value;

use crate::{
    callbacks::{
        FeatureUsageCallback, NoopFeatureUsageCallback, NoopTrackingCallback, TrackingCallback,
    },
    refresh_thread::Backoff,
    sticky_bucket::StickyBucketService,
    FeaturesRepository, GrowthBook, Result,
};

/// Default host for API calls.
pub const DEFAULT_API_HOST: &str = "https://cdn.growthbook.io";

/// Configuration for [`GrowthBook`].
///
/// The configuration is consumed when the client is created. Only features, saved groups and
/// attributes can change afterwards, through [`GrowthBook::set_features`],
/// [`GrowthBook::set_saved_groups`] and [`GrowthBook::set_attributes`].
pub struct ContextConfig {
    pub(crate) api_host: String,
    pub(crate) client_key: Option<String>,
    pub(crate) features_json: Option<String>,
    pub(crate) saved_groups_json: Option<String>,
    pub(crate) attributes_json: Option<String>,
    pub(crate) enabled: bool,
    pub(crate) qa_mode: bool,
    pub(crate) forced_variations: HashMap<String, usize>,
    pub(crate) forced_feature_values: HashMap<String, Value>,
    pub(crate) url: Option<String>,
    pub(crate) allow_url_overrides: bool,
    pub(crate) tracking_callback: Box<dyn TrackingCallback + Send + Sync>,
    pub(crate) feature_usage_callback: Box<dyn FeatureUsageCallback + Send + Sync>,
    pub(crate) sticky_bucket_service: Option<Arc<dyn StickyBucketService>>,
}

impl ContextConfig {
    /// Create a default configuration: enabled, no features, empty attributes.
    ///
    /// ```
    /// # use growthbook::ContextConfig;
    /// ContextConfig::new();
    /// ```
    pub fn new() -> Self {
        ContextConfig {
            api_host: DEFAULT_API_HOST.to_owned(),
            client_key: None,
            features_json: None,
            saved_groups_json: None,
            attributes_json: None,
            enabled: true,
            qa_mode: false,
            forced_variations: HashMap::new(),
            forced_feature_values: HashMap::new(),
            url: None,
            allow_url_overrides: false,
            tracking_callback: Box::new(NoopTrackingCallback),
            feature_usage_callback: Box::new(NoopFeatureUsageCallback),
            sticky_bucket_service: None,
        }
    }

    /// Host the features were fetched from. Informational; fetching is done by
    /// [`FeaturesRepository`].
    pub fn api_host(mut self, api_host: impl Into<String>) -> Self {
        self.api_host = api_host.into();
        self
    }

    /// Client key the features were fetched with. Informational.
    pub fn client_key(mut self, client_key: impl Into<String>) -> Self {
        self.client_key = Some(client_key.into());
        self
    }

    /// Initial features JSON, an object mapping feature keys to definitions.
    pub fn features_json(mut self, features_json: impl Into<String>) -> Self {
        self.features_json = Some(features_json.into());
        self
    }

    /// Initial saved groups JSON, an object mapping group ids to arrays of values. Referenced by
    /// the `$inGroup` and `$notInGroup` condition operators.
    pub fn saved_groups_json(mut self, saved_groups_json: impl Into<String>) -> Self {
        self.saved_groups_json = Some(saved_groups_json.into());
        self
    }

    /// Initial attributes JSON.
    pub fn attributes_json(mut self, attributes_json: impl Into<String>) -> Self {
        self.attributes_json = Some(attributes_json.into());
        self
    }

    /// Kill-switch. A disabled client serves `null` defaults and never assigns experiments.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// In QA mode no unit is bucketed into an experiment.
    pub fn qa_mode(mut self, qa_mode: bool) -> Self {
        self.qa_mode = qa_mode;
        self
    }

    /// Force experiments (by key) to a variation index.
    pub fn forced_variations(mut self, forced_variations: HashMap<String, usize>) -> Self {
        self.forced_variations = forced_variations;
        self
    }

    /// Force features (by key) to a value.
    pub fn forced_feature_values(mut self, forced_feature_values: HashMap<String, Value>) -> Self {
        self.forced_feature_values = forced_feature_values;
        self
    }

    /// URL of the current request, used for query-string overrides.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Honor `gb~<feature key>=<value>` query parameters in [`ContextConfig::url`].
    pub fn allow_url_overrides(mut self, allow_url_overrides: bool) -> Self {
        self.allow_url_overrides = allow_url_overrides;
        self
    }

    /// Set tracking callback to pass experiment assignments to your data warehouse.
    ///
    /// ```
    /// # use growthbook::{ContextConfig, Experiment, ExperimentResult};
    /// let config = ContextConfig::new().tracking_callback(
    ///     |experiment: &Experiment, result: &ExperimentResult| {
    ///         println!("{} -> {}", experiment.key, result.key);
    ///     },
    /// );
    /// ```
    pub fn tracking_callback(
        mut self,
        tracking_callback: impl TrackingCallback + Send + Sync + 'static,
    ) -> Self {
        self.tracking_callback = Box::new(tracking_callback);
        self
    }

    /// Set callback invoked on every feature evaluation.
    pub fn feature_usage_callback(
        mut self,
        feature_usage_callback: impl FeatureUsageCallback + Send + Sync + 'static,
    ) -> Self {
        self.feature_usage_callback = Box::new(feature_usage_callback);
        self
    }

    /// Persist experiment assignments so that a unit keeps its variation when targeting or
    /// traffic allocation changes.
    ///
    /// See [`InMemoryStickyBucketService`](crate::InMemoryStickyBucketService).
    pub fn sticky_bucket_service(
        mut self,
        sticky_bucket_service: Arc<dyn StickyBucketService>,
    ) -> Self {
        self.sticky_bucket_service = Some(sticky_bucket_service);
        self
    }

    /// Create a new [`GrowthBook`] client using the specified configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::Parse`](crate::Error::Parse) if features, saved groups or attributes JSON is
    ///   malformed.
    /// - [`Error::Configuration`](crate::Error::Configuration) if the URL is malformed.
    ///
    /// ```
    /// # use growthbook::{ContextConfig, GrowthBook};
    /// let client: GrowthBook = ContextConfig::new()
    ///     .features_json(r#"{"dark-mode": {"defaultValue": true}}"#)
    ///     .attributes_json(r#"{"id": "user-1"}"#)
    ///     .to_client()
    ///     .unwrap();
    /// assert!(client.is_on("dark-mode"));
    /// ```
    pub fn to_client(self) -> Result<GrowthBook> {
        GrowthBook::new(self)
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig::new()
    }
}

/// How [`FeaturesRepository`] keeps features fresh after the first fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshStrategy {
    /// Serve the cache and re-fetch in the background once it is older than the TTL.
    #[default]
    StaleWhileRevalidate,
    /// Keep a server-sent events connection open and apply pushed updates. Falls back to
    /// [`RefreshStrategy::StaleWhileRevalidate`] if the server does not support streaming.
    ServerSentEvents,
}

/// Configuration for [`FeaturesRepository`].
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    pub(crate) api_host: String,
    pub(crate) client_key: String,
    pub(crate) refresh_strategy: RefreshStrategy,
    pub(crate) swr_ttl: Duration,
    pub(crate) retry_on_failure: bool,
    pub(crate) max_reconnect_attempts: u32,
    pub(crate) backoff: Backoff,
    pub(crate) request_timeout: Duration,
    pub(crate) decryption_key: Option<String>,
}

impl RepositoryConfig {
    /// Default value for [`RepositoryConfig::swr_ttl`].
    pub const DEFAULT_SWR_TTL: Duration = Duration::from_secs(60);
    /// Default value for [`RepositoryConfig::max_reconnect_attempts`].
    pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
    /// Default value for [`RepositoryConfig::request_timeout`].
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a default configuration for the given client key.
    ///
    /// ```
    /// # use growthbook::RepositoryConfig;
    /// RepositoryConfig::from_client_key("sdk-abc123");
    /// ```
    pub fn from_client_key(client_key: impl Into<String>) -> Self {
        RepositoryConfig {
            api_host: DEFAULT_API_HOST.to_owned(),
            client_key: client_key.into(),
            refresh_strategy: RefreshStrategy::default(),
            swr_ttl: RepositoryConfig::DEFAULT_SWR_TTL,
            retry_on_failure: true,
            max_reconnect_attempts: RepositoryConfig::DEFAULT_MAX_RECONNECT_ATTEMPTS,
            backoff: Backoff::default(),
            request_timeout: RepositoryConfig::DEFAULT_REQUEST_TIMEOUT,
            decryption_key: None,
        }
    }

    /// Override host for API calls. Clients should use the default setting unless self-hosting.
    pub fn api_host(mut self, api_host: impl Into<String>) -> Self {
        self.api_host = api_host.into();
        self
    }

    #[allow(missing_docs)]
    pub fn refresh_strategy(mut self, refresh_strategy: RefreshStrategy) -> Self {
        self.refresh_strategy = refresh_strategy;
        self
    }

    /// Age after which cached features are re-fetched on next access.
    pub fn swr_ttl(mut self, swr_ttl: Duration) -> Self {
        self.swr_ttl = swr_ttl;
        self
    }

    /// Reconnect a dropped streaming connection. When disabled, the first fault is reported
    /// through [`FeatureRefreshCallback::on_error`](crate::FeatureRefreshCallback::on_error).
    pub fn retry_on_failure(mut self, retry_on_failure: bool) -> Self {
        self.retry_on_failure = retry_on_failure;
        self
    }

    /// Consecutive failed reconnects tolerated before giving up on streaming.
    pub fn max_reconnect_attempts(mut self, max_reconnect_attempts: u32) -> Self {
        self.max_reconnect_attempts = max_reconnect_attempts;
        self
    }

    /// Delay policy between reconnects.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Timeout for one-shot features requests. Does not apply to the streaming connection.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Base64-encoded AES key for endpoints serving `encryptedFeatures`. With a key set, an
    /// unencrypted payload is rejected.
    pub fn decryption_key(mut self, decryption_key: impl Into<String>) -> Self {
        self.decryption_key = Some(decryption_key.into());
        self
    }

    /// Create a new [`FeaturesRepository`]. No request is made until
    /// [`FeaturesRepository::initialize`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidApiHost`](crate::Error::InvalidApiHost)
    /// - [`Error::InvalidClientKey`](crate::Error::InvalidClientKey)
    pub fn to_repository(self) -> Result<FeaturesRepository> {
        FeaturesRepository::new(self)
    }
}
