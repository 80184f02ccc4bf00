//! The Rust SDK for GrowthBook, a feature flagging and experimentation platform.
//!
//! # Overview
//!
//! The SDK revolves around a [`GrowthBook`] client that evaluates features for the current
//! user, described by a JSON object of attributes. Feature evaluation results in a
//! [`FeatureResult`] carrying the assigned value and the reason it was assigned: a default value,
//! a forced rule, an experiment, etc.
//!
//! Evaluation is purely local. Features can be supplied by the host as JSON, or fetched and kept
//! fresh by a [`FeaturesRepository`], either by re-fetching stale features in the background or
//! by listening to server-sent events. Encrypted payloads are decrypted with the key set through
//! [`RepositoryConfig::decryption_key`].
//!
//! A [`StickyBucketService`] keeps users in their assigned variation when an experiment's
//! targeting or traffic split changes.
//!
//! A [`TrackingCallback`] should be provided to save experiment exposures to your storage,
//! facilitating analysis of which user saw which variation.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Evaluation never fails: malformed rules, unknown operators and type mismatches resolve to "no
//! match" and the feature falls back to its default value. Errors are only returned when loading
//! configuration, and [`Error::code`] tells whether retrying may help.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages under the `growthbook` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into SDK operations.
//!
//! # Examples
//!
//! ```
//! # use growthbook::ContextConfig;
//! let client = ContextConfig::new()
//!     .features_json(r#"{
//!         "banner-text": {
//!             "defaultValue": "Welcome",
//!             "rules": [{"condition": {"country": "US"}, "force": "Howdy"}]
//!         }
//!     }"#)
//!     .attributes_json(r#"{"id": "user-1", "country": "US"}"#)
//!     .to_client()?;
//!
//! assert_eq!(client.get_string_value("banner-text", "Hello"), "Howdy");
//! # Ok::<(), growthbook::Error>(())
//! ```
//!
//! A complete program can be found in the `demos` directory of the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod callbacks;
mod client;
mod condition;
mod config;
mod configuration_store;
mod context;
mod decryption;
mod error;
mod eval;
mod fetcher;
mod hashing;
mod models;
mod refresh_thread;
mod repository;
mod sse;
mod sticky_bucket;
mod url_overrides;

pub use callbacks::{
    ExperimentRunCallback, FeatureRefreshCallback, FeatureUsageCallback, TrackingCallback,
};
pub use client::GrowthBook;
pub use condition::{
    evaluate_condition, evaluate_condition_with_saved_groups, DataType, Operator, UnknownOperator,
};
pub use config::{ContextConfig, RefreshStrategy, RepositoryConfig, DEFAULT_API_HOST};
pub use configuration_store::Snapshot;
pub use error::{Error, FetchErrorCode, Result};
pub use hashing::{
    choose_variation, fnv1a_32, get_bucket_ranges, get_equal_weights, hash, in_namespace,
    is_filtered_out, is_included_in_rollout,
};
pub use models::{
    BucketRange, Condition, Experiment, ExperimentResult, Feature, FeatureResult,
    FeatureResultSource, FeatureRule, Features, Filter, HashVersion, Namespace, ParentCondition,
    SavedGroups, TryParse, VariationMeta,
};
pub use refresh_thread::Backoff;
pub use repository::FeaturesRepository;
pub use sticky_bucket::{
    InMemoryStickyBucketService, StickyAssignmentsDocument, StickyBucketService,
};
